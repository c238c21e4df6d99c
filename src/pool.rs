//! The `Pool` owns every page and is the source and sink of
//! individual chunks.  Pages are reachable two ways: a circular
//! doubly-linked allocation list whose head is the current allocation
//! target, and an address-ordered red/black tree that resolves a
//! payload pointer back to its owning page in O(log N).
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_issue_map;

use std::ptr::NonNull;

use crate::page::Page;

/// Index sentinel for "no page" in list and tree links.
pub(crate) const NIL: u32 = u32::MAX;

/// An issued chunk: the payload pointer, held by value so a lease
/// cannot be duplicated.  Leases originate in `get` and are consumed
/// by `ret`; one that is merely dropped strands its slot until the
/// pool itself goes away.  Contract builds track every lease in
/// `debug_issue_map`, so a double issue or double return trips there.
#[derive(Debug)]
pub struct ChunkLease(NonNull<i64>);

impl ChunkLease {
    /// Re-wraps a payload that a holder hands back for `ret`.  Only
    /// meaningful for addresses previously issued by `get`.
    pub(crate) fn reclaim(data: NonNull<i64>) -> ChunkLease {
        ChunkLease(data)
    }

    /// Payload base of the leased chunk; addresses `CHUNK_LEN`
    /// elements.
    #[inline]
    pub fn data(&self) -> NonNull<i64> {
        self.0
    }

    /// Consumes the lease to bind the payload elsewhere (e.g. into a
    /// matrix chunk descriptor).  The binder becomes responsible for
    /// eventually reclaiming the address.
    #[inline]
    pub fn into_data(self) -> NonNull<i64> {
        self.0
    }
}

/// Red/black node colour, shared by the pool's page tree and the
/// matrix chunk index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Color {
    Black,
    Red,
}

/// Ancestor stack depth for iterative tree rebalancing.  The
/// red/black depth bound keeps balanced paths well under this for any
/// realistic page population; blowing it is a programming error.
const STACK_DEPTH: usize = 32;

pub struct Pool {
    /// Page arena; pages are created here and never leave until the
    /// pool is dropped.
    pages: Vec<Page>,

    /// Allocation list head, or `NIL` iff the pool is empty.
    head: u32,
    /// Address-ordered tree root, or `NIL`.
    root: u32,

    /// Ancestor scratch for iterative tree insertion.
    stack: [u32; STACK_DEPTH],
    sides: [u8; STACK_DEPTH],
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            pages: Vec::new(),
            head: NIL,
            root: NIL,
            stack: [NIL; STACK_DEPTH],
            sides: [0; STACK_DEPTH],
        }
    }

    /// Number of pages owned by the pool.
    pub fn size(&self) -> usize {
        self.pages.len()
    }

    /// Issues one chunk, creating and indexing a fresh page when the
    /// current allocation target is missing or full.  Returns `None`
    /// when a page mapping cannot be acquired; no partial state is
    /// published in that case.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[ensures(ret.is_some() ->
              debug_issue_map::is_issued(ret.as_ref().unwrap().data().as_ptr() as usize).is_ok(),
              "Successful issues are tracked as live.")]
    pub fn get(&mut self) -> Option<ChunkLease> {
        if self.head == NIL || self.pages[self.head as usize].full() {
            let page = match Page::new() {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(error = %err, "page mapping failed");
                    return None;
                }
            };

            let idx = self.pages.len() as u32;
            assert!(idx < NIL, "page arena exhausted its index space");

            self.pages.push(page);
            self.tree_insert(idx);
            self.list_insert_head(idx);

            tracing::debug!(pages = self.pages.len(), "pool grew");
        }

        let head = self.head;
        let pos = self.pages[head as usize]
            .get_new()
            .expect("allocation target has capacity");
        let data = self.pages[head as usize].data_at(pos);

        // A drained target stops being consulted until something
        // comes back to it.
        if self.pages[head as usize].full() {
            self.list_rotate();
        }

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        debug_issue_map::mark_issued(data.as_ptr() as usize)
            .expect("pool issued a chunk that is already live");

        Some(ChunkLease(data))
    }

    /// Returns a chunk: resolves the owning page through the address
    /// tree, reinserts the position into that page's ring, and moves
    /// the page to the list tail so rotation reaches its freed
    /// capacity after the current target drains.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[requires(debug_issue_map::is_issued(lease.data().as_ptr() as usize).is_ok(),
               "Returned chunks must have been issued and still be live.")]
    pub fn ret(&mut self, lease: ChunkLease) {
        let addr = lease.into_data().as_ptr() as usize;

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        debug_issue_map::mark_returned(addr).expect("returned chunk was not live");

        let idx = self
            .tree_find(addr)
            .expect("returned chunk does not belong to this pool");
        let pos = self.pages[idx as usize].pos_of(addr);

        self.pages[idx as usize].ret(pos);

        self.list_remove(idx);
        self.list_insert_tail(idx);
    }

    // ------------------------------------------------------------------
    // Allocation list
    // ------------------------------------------------------------------

    /// Links `idx` in front of the head (circularly).  The head
    /// pointer itself is left to the caller.
    fn list_link_before_head(&mut self, idx: u32) {
        if self.head == NIL {
            self.pages[idx as usize].list_next = idx;
            self.pages[idx as usize].list_prev = idx;
            self.head = idx;
            return;
        }

        let head = self.head;
        let tail = self.pages[head as usize].list_prev;

        self.pages[idx as usize].list_next = head;
        self.pages[idx as usize].list_prev = tail;

        self.pages[tail as usize].list_next = idx;
        self.pages[head as usize].list_prev = idx;
    }

    fn list_insert_head(&mut self, idx: u32) {
        self.list_link_before_head(idx);
        self.head = idx;
    }

    fn list_insert_tail(&mut self, idx: u32) {
        self.list_link_before_head(idx);
    }

    /// Unlinks `idx`.  The head always points at a valid member
    /// afterwards, or at nothing iff the list emptied.
    fn list_remove(&mut self, idx: u32) {
        let next = self.pages[idx as usize].list_next;

        if next == idx {
            self.head = NIL;
        } else {
            let prev = self.pages[idx as usize].list_prev;

            self.pages[prev as usize].list_next = next;
            self.pages[next as usize].list_prev = prev;

            if self.head == idx {
                self.head = next;
            }
        }

        self.pages[idx as usize].list_next = NIL;
        self.pages[idx as usize].list_prev = NIL;
    }

    /// Advances the head to its list successor (FIFO rotation).
    fn list_rotate(&mut self) {
        if self.head != NIL {
            self.head = self.pages[self.head as usize].list_next;
        }
    }

    // ------------------------------------------------------------------
    // Address-ordered tree
    // ------------------------------------------------------------------

    /// Inserts a fresh page into the tree, rebalancing iteratively
    /// with the pool's path stack.  Pages are never removed: the pool
    /// keeps its mappings for its whole lifetime.
    fn tree_insert(&mut self, idx: u32) {
        let key = self.pages[idx as usize].base_addr();

        let mut top: i32 = -1;
        let mut node = self.root;

        while node != NIL {
            top += 1;
            assert!((top as usize) < STACK_DEPTH, "path stack overflow");

            self.stack[top as usize] = node;
            let side = (self.pages[node as usize].base_addr() < key) as usize;
            self.sides[top as usize] = side as u8;

            node = self.pages[node as usize].sides[side];
        }

        {
            let page = &mut self.pages[idx as usize];
            page.color = Color::Red;
            page.sides = [NIL, NIL];
        }

        if top == -1 {
            self.root = idx;
        } else {
            let parent = self.stack[top as usize] as usize;
            self.pages[parent].sides[self.sides[top as usize] as usize] = idx;
        }

        loop {
            top -= 1;
            if top < 0 {
                break;
            }

            let side = self.sides[top as usize] as usize;
            let grand = self.stack[top as usize];
            let uncle = self.pages[grand as usize].sides[1 - side];
            let mut parent = self.stack[(top + 1) as usize];

            if self.pages[parent as usize].color == Color::Black {
                break;
            }

            if uncle != NIL && self.pages[uncle as usize].color == Color::Red {
                self.pages[parent as usize].color = Color::Black;
                self.pages[uncle as usize].color = Color::Black;
                self.pages[grand as usize].color = Color::Red;
                top -= 1;
                continue;
            }

            // Zig-zag: rotate the parent first so the straight case
            // below finishes the job.
            if side == 1 - self.sides[(top + 1) as usize] as usize {
                let child = self.pages[parent as usize].sides[1 - side];

                self.pages[parent as usize].sides[1 - side] =
                    self.pages[child as usize].sides[side];
                self.pages[child as usize].sides[side] = parent;
                self.pages[grand as usize].sides[side] = child;
                parent = child;
            }

            self.pages[grand as usize].color = Color::Red;
            self.pages[parent as usize].color = Color::Black;
            self.pages[grand as usize].sides[side] = self.pages[parent as usize].sides[1 - side];
            self.pages[parent as usize].sides[1 - side] = grand;

            if top == 0 {
                self.root = parent;
            } else {
                let above = self.stack[(top - 1) as usize] as usize;
                self.pages[above].sides[self.sides[(top - 1) as usize] as usize] = parent;
            }
            break;
        }

        self.pages[self.root as usize].color = Color::Black;
    }

    /// Resolves the page whose payload range contains `addr`.
    pub(crate) fn tree_find(&self, addr: usize) -> Option<u32> {
        let mut node = self.root;

        while node != NIL {
            let page = &self.pages[node as usize];

            if page.contains(addr) {
                return Some(node);
            }

            node = page.sides[(page.base_addr() < addr) as usize];
        }

        None
    }

    #[cfg(test)]
    pub(crate) fn page(&self, idx: u32) -> &Page {
        &self.pages[idx as usize]
    }

    /// Returns `Err` when some of the pool's invariants are violated.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn check_rep_or_err(&self) -> Result<(), &'static str> {
        if (self.head == NIL) != self.pages.is_empty() {
            return Err("Head must name a member iff the pool is non-empty.");
        }

        for page in &self.pages {
            page.check_rep_or_err()?;
        }

        if self.pages.is_empty() {
            return Ok(());
        }

        // The list must cycle through every page exactly once.
        let mut cursor = self.head;
        let mut seen = 0usize;
        loop {
            if cursor == NIL || cursor as usize >= self.pages.len() {
                return Err("List link escaped the arena.");
            }

            seen += 1;
            if seen > self.pages.len() {
                return Err("List does not cycle back to its head.");
            }

            let next = self.pages[cursor as usize].list_next;
            if self.pages[next as usize].list_prev != cursor {
                return Err("List links are inconsistent.");
            }

            cursor = next;
            if cursor == self.head {
                break;
            }
        }
        if seen != self.pages.len() {
            return Err("List membership does not match the arena.");
        }

        // The tree must be a valid red/black BST over base addresses
        // containing every page.
        if self.root == NIL {
            return Err("Tree is empty but pages exist.");
        }
        if self.pages[self.root as usize].color != Color::Black {
            return Err("Tree root must be black.");
        }

        fn validate(
            pages: &[Page],
            idx: u32,
            lo: usize,
            hi: usize,
        ) -> Result<(usize, usize), &'static str> {
            if idx == NIL {
                return Ok((1, 0));
            }

            let page = &pages[idx as usize];
            let key = page.base_addr();
            if key < lo || key >= hi {
                return Err("Tree violates address order.");
            }

            if page.color == Color::Red {
                for side in &page.sides {
                    if *side != NIL && pages[*side as usize].color == Color::Red {
                        return Err("Red page has a red child.");
                    }
                }
            }

            let (left_black, left_count) = validate(pages, page.sides[0], lo, key)?;
            let (right_black, right_count) = validate(pages, page.sides[1], key + 1, hi)?;

            if left_black != right_black {
                return Err("Black heights diverge.");
            }

            let black = left_black + (page.color == Color::Black) as usize;
            Ok((black, left_count + right_count + 1))
        }

        let (_, count) = validate(&self.pages, self.root, 0, usize::MAX)?;
        if count != self.pages.len() {
            return Err("Tree membership does not match the arena.");
        }

        Ok(())
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool::new()
    }
}
