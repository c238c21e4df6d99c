//! A `Page` owns one anonymous mapping carved into `PAGE_LEN` uniform
//! chunk payloads, and issues/returns positions in O(1): never-issued
//! positions are served off a linear high-water mark, returned ones
//! off an intrusive circular free-ring kept in two parallel `u16`
//! arrays.
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

use std::io;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::chunk::{CHUNK_BYTES, CHUNK_LEN};
use crate::map;
use crate::pool::{Color, NIL};

/// Number of chunks per page.
#[cfg(not(feature = "test_only_small_constants"))]
pub const PAGE_LEN: usize = 1024;

#[cfg(feature = "test_only_small_constants")]
pub const PAGE_LEN: usize = 8;

// Ring positions are u16, with the maximum reserved as the empty
// sentinel.
const_assert!(PAGE_LEN <= u16::MAX as usize);

/// Ring head value for "no free position".
pub(crate) const RING_NONE: u16 = u16::MAX;

lazy_static::lazy_static! {
    // Real mapping size, rounded up to the OS page boundary
    // (memoised process-wide).
    static ref MAP_BYTES: usize = map::round_to_page_size(PAGE_LEN * CHUNK_BYTES);
}

pub struct Page {
    /// Mapping base; payload `i` lives at `data + i * CHUNK_LEN`.
    data: NonNull<i64>,

    /// Free-ring linkage; `next[pos]`/`prev[pos]` are only meaningful
    /// while `pos` is in the ring.
    next: Box<[u16]>,
    prev: Box<[u16]>,

    /// Ring head, or `RING_NONE`.
    free: u16,
    /// High-water mark: number of positions ever issued.
    fill: u16,

    // Pool linkage: circular allocation list and address-ordered
    // tree, both by page index.
    pub(crate) list_next: u32,
    pub(crate) list_prev: u32,
    pub(crate) sides: [u32; 2],
    pub(crate) color: Color,
}

impl Page {
    /// Maps the backing slab.  The only failing operation on a page.
    pub fn new() -> io::Result<Page> {
        let base = map::map_region(*MAP_BYTES)?;

        tracing::debug!(bytes = *MAP_BYTES, "mapped page slab");

        Ok(Page {
            data: base.cast(),
            next: vec![0u16; PAGE_LEN].into_boxed_slice(),
            prev: vec![0u16; PAGE_LEN].into_boxed_slice(),
            free: RING_NONE,
            fill: 0,
            list_next: NIL,
            list_prev: NIL,
            sides: [NIL, NIL],
            color: Color::Red,
        })
    }

    /// A page is full when every position has been issued at least
    /// once and none has come back.
    #[inline]
    pub fn full(&self) -> bool {
        self.fill as usize == PAGE_LEN && self.free == RING_NONE
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// True iff `addr` falls inside this page's payload range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.base_addr() + PAGE_LEN * CHUNK_BYTES
    }

    /// Payload pointer for a position.
    pub fn data_at(&self, pos: u16) -> NonNull<i64> {
        assert!((pos as usize) < PAGE_LEN, "position {} out of range", pos);

        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(pos as usize * CHUNK_LEN)) }
    }

    /// Position owning a payload address.
    pub fn pos_of(&self, addr: usize) -> u16 {
        assert!(self.contains(addr), "address not in this page");

        ((addr - self.base_addr()) / CHUNK_BYTES) as u16
    }

    /// Issues one position: extends the high-water mark first, then
    /// pops the ring head.  `None` iff the page is full.
    #[ensures(ret.is_some() -> !self.in_ring(ret.unwrap()),
              "Issued positions are not in the ring.")]
    #[ensures(ret.is_none() -> self.full())]
    pub fn get_new(&mut self) -> Option<u16> {
        if (self.fill as usize) < PAGE_LEN {
            let pos = self.fill;

            self.fill += 1;
            return Some(pos);
        }

        let pos = self.free;
        if pos == RING_NONE {
            return None;
        }

        self.unlink(pos);
        Some(pos)
    }

    /// Claims an explicitly chosen position out of the ring.
    #[requires(self.in_ring(pos), "Claimed positions must be free.")]
    #[ensures(!self.in_ring(pos))]
    pub fn get_at(&mut self, pos: u16) {
        self.unlink(pos);
    }

    /// Returns an issued position to the ring, inserting before the
    /// ring head.
    #[requires((pos as usize) < self.fill as usize,
               "Only issued positions can return.")]
    #[requires(!self.in_ring(pos), "Double return.")]
    #[ensures(self.in_ring(pos))]
    pub fn ret(&mut self, pos: u16) {
        let free = self.free;

        if free == RING_NONE {
            self.free = pos;
            self.next[pos as usize] = pos;
            self.prev[pos as usize] = pos;
            return;
        }

        let tail = self.prev[free as usize];

        self.next[pos as usize] = free;
        self.prev[pos as usize] = tail;

        self.next[tail as usize] = pos;
        self.prev[free as usize] = pos;
    }

    fn unlink(&mut self, pos: u16) {
        // Last ring member: back to the empty sentinel.
        if self.next[pos as usize] == pos {
            self.free = RING_NONE;
            return;
        }

        let next = self.next[pos as usize];
        let prev = self.prev[pos as usize];

        self.prev[next as usize] = prev;
        self.next[prev as usize] = next;

        if self.free == pos {
            self.free = next;
        }
    }

    /// Walks the ring looking for `pos`.  Slow; contract checking and
    /// tests only.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn in_ring(&self, pos: u16) -> bool {
        let head = self.free;
        if head == RING_NONE {
            return false;
        }

        let mut cursor = head;
        loop {
            if cursor == pos {
                return true;
            }

            cursor = self.next[cursor as usize];
            if cursor == head {
                return false;
            }
        }
    }

    /// Returns `Err` when some of the page's invariants are violated.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn check_rep_or_err(&self) -> Result<(), &'static str> {
        if self.fill as usize > PAGE_LEN {
            return Err("High-water mark ran past the page.");
        }

        if self.free == RING_NONE {
            return Ok(());
        }

        let head = self.free;
        let mut cursor = head;
        let mut seen = 0usize;

        loop {
            if cursor as usize >= self.fill as usize {
                return Err("Ring member was never issued.");
            }

            if self.next[self.prev[cursor as usize] as usize] != cursor
                || self.prev[self.next[cursor as usize] as usize] != cursor
            {
                return Err("Ring links are inconsistent.");
            }

            seen += 1;
            if seen > PAGE_LEN {
                return Err("Ring does not cycle back to its head.");
            }

            cursor = self.next[cursor as usize];
            if cursor == head {
                return Ok(());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ring_len(&self) -> usize {
        if self.free == RING_NONE {
            return 0;
        }

        let head = self.free;
        let mut cursor = head;
        let mut len = 0;

        loop {
            len += 1;
            cursor = self.next[cursor as usize];
            if cursor == head {
                return len;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fill(&self) -> usize {
        self.fill as usize
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        map::unmap_region(self.data.cast(), *MAP_BYTES);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn issues_high_water_before_ring() {
        let mut page = Page::new().expect("page should map");

        assert_eq!(page.get_new(), Some(0));
        assert_eq!(page.get_new(), Some(1));

        page.ret(0);
        // Position 2 was never issued; it wins over the ring.
        assert_eq!(page.get_new(), Some(2));

        page.check_rep_or_err().expect("invariants should hold");
    }

    #[test]
    fn drains_ring_in_head_order() {
        let mut page = Page::new().expect("page should map");

        for _ in 0..PAGE_LEN {
            page.get_new().expect("page has capacity");
        }
        assert!(page.full());
        assert_eq!(page.get_new(), None);

        // Return in reverse issue order; the ring head stays at the
        // first returned position and later returns queue behind it.
        for pos in (0..PAGE_LEN as u16).rev() {
            page.ret(pos);
            page.check_rep_or_err().expect("invariants should hold");
        }
        assert_eq!(page.ring_len(), PAGE_LEN);
        assert!(!page.full());

        for pos in (0..PAGE_LEN as u16).rev() {
            assert_eq!(page.get_new(), Some(pos));
        }
        assert!(page.full());
    }

    #[test]
    fn single_element_ring_edge_cases() {
        let mut page = Page::new().expect("page should map");

        page.get_new().expect("page has capacity");
        page.ret(0);
        assert!(page.in_ring(0));
        assert_eq!(page.ring_len(), 1);

        // Removing the only member empties the ring.
        page.get_at(0);
        assert!(!page.in_ring(0));
        assert_eq!(page.ring_len(), 0);

        page.check_rep_or_err().expect("invariants should hold");
    }

    #[test]
    fn removing_head_advances_it() {
        let mut page = Page::new().expect("page should map");

        for _ in 0..3 {
            page.get_new().expect("page has capacity");
        }

        page.ret(0);
        page.ret(1);
        page.ret(2);

        // Head is 0; explicitly claiming it must advance the head.
        page.get_at(0);
        assert!(!page.in_ring(0));
        assert!(page.in_ring(1));
        assert!(page.in_ring(2));
        page.check_rep_or_err().expect("invariants should hold");
    }

    #[test]
    fn payload_addresses_are_disjoint_and_resolvable() {
        let page = Page::new().expect("page should map");

        for pos in 0..PAGE_LEN as u16 {
            let addr = page.data_at(pos).as_ptr() as usize;

            assert!(page.contains(addr));
            assert_eq!(page.pos_of(addr), pos);
            // Any address inside the payload resolves to the same
            // position.
            assert_eq!(page.pos_of(addr + CHUNK_BYTES - 1), pos);
        }

        let end = page.base_addr() + PAGE_LEN * CHUNK_BYTES;
        assert!(!page.contains(end));
    }

    #[test]
    fn payload_is_writable_across_the_slab() {
        let page = Page::new().expect("page should map");

        let first = page.data_at(0);
        let last = page.data_at((PAGE_LEN - 1) as u16);

        unsafe {
            first.as_ptr().write(-7);
            last.as_ptr().add(CHUNK_LEN - 1).write(7);

            assert_eq!(first.as_ptr().read(), -7);
            assert_eq!(last.as_ptr().add(CHUNK_LEN - 1).read(), 7);
        }
    }
}
