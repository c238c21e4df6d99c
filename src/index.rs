//! Spatial index of a matrix: a red/black tree over chunk
//! descriptors, keyed by the packed global offset.  Mutation is
//! iterative; the ancestors of the node under repair live on a
//! fixed-depth path stack, and a one-entry cache short-circuits
//! repeated lookups of the same coordinate.
//!
//! Nodes live in an arena and point at each other by index, so the
//! tree carries no interior pointers at all.
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

use crate::chunk::{COffs, Chunk};
use crate::pool::Color;

const NIL: u32 = u32::MAX;

/// Ancestor stack depth; enough for the red/black height of any
/// population the offset space can name.  Exceeding it is a
/// programming error.
const STACK_DEPTH: usize = 32;

struct Node {
    chunk: Chunk,
    sides: [u32; 2],
    color: Color,
}

pub struct ChunkIndex {
    nodes: Vec<Node>,
    /// Recycled arena slots.
    spare: Vec<u32>,

    root: u32,

    /// Last successful lookup; the stack below always describes the
    /// path to this node while the cache is warm.
    cache: Option<(COffs, u32)>,

    /// Ancestors of the node being found/repaired, and the side taken
    /// out of each.
    stack: [u32; STACK_DEPTH],
    sides: [u8; STACK_DEPTH],
    top: i32,
}

impl ChunkIndex {
    pub fn new() -> ChunkIndex {
        ChunkIndex {
            nodes: Vec::new(),
            spare: Vec::new(),
            root: NIL,
            cache: None,
            stack: [NIL; STACK_DEPTH],
            sides: [0; STACK_DEPTH],
            top: -1,
        }
    }

    /// Number of chunks in the index.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.spare.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks from the root to the chunk at `offset`, recording the
    /// path, or answers straight from the cache.  Reads never
    /// invalidate the cache.
    fn find_node(&mut self, offset: COffs) -> u32 {
        if let Some((cached_off, cached)) = self.cache {
            if cached_off == offset {
                return cached;
            }
        }

        let mut node = self.root;
        self.top = -1;

        while node != NIL {
            let node_off = self.nodes[node as usize].chunk.offset();

            if node_off.sgn(offset) == 0 {
                self.cache = Some((offset, node));
                return node;
            }

            self.top += 1;
            assert!((self.top as usize) < STACK_DEPTH, "path stack overflow");

            self.stack[self.top as usize] = node;
            let side = (node_off.packed() < offset.packed()) as u8;
            self.sides[self.top as usize] = side;

            node = self.nodes[node as usize].sides[side as usize];
        }

        // A missed walk leaves the stack describing this offset's
        // attach point; the cache must not keep naming another node.
        self.cache = None;
        NIL
    }

    pub fn find(&mut self, offset: COffs) -> Option<&Chunk> {
        let node = self.find_node(offset);

        if node == NIL {
            None
        } else {
            Some(&self.nodes[node as usize].chunk)
        }
    }

    pub fn find_mut(&mut self, offset: COffs) -> Option<&mut Chunk> {
        let node = self.find_node(offset);

        if node == NIL {
            None
        } else {
            Some(&mut self.nodes[node as usize].chunk)
        }
    }

    /// Inserts a chunk keyed by its offset.  If an entry with the
    /// same offset already exists the tree is left untouched and the
    /// chunk is handed back.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[ensures(ret.is_none() -> self.len() == old(self.len()) + 1)]
    pub fn insert(&mut self, chunk: Chunk) -> Option<Chunk> {
        if self.find_node(chunk.offset()) != NIL {
            return Some(chunk);
        }

        self.cache = None;

        let idx = self.alloc_node(chunk);

        if self.top == -1 {
            self.root = idx;
        } else {
            let parent = self.stack[self.top as usize] as usize;
            self.nodes[parent].sides[self.sides[self.top as usize] as usize] = idx;
        }

        self.insert_fixup();
        None
    }

    fn insert_fixup(&mut self) {
        loop {
            self.top -= 1;
            if self.top < 0 {
                break;
            }

            let side = self.sides[self.top as usize] as usize;
            let grand = self.stack[self.top as usize];
            let uncle = self.nodes[grand as usize].sides[1 - side];
            let mut parent = self.stack[(self.top + 1) as usize];

            if self.nodes[parent as usize].color == Color::Black {
                break;
            }

            if uncle != NIL && self.nodes[uncle as usize].color == Color::Red {
                self.nodes[parent as usize].color = Color::Black;
                self.nodes[uncle as usize].color = Color::Black;
                self.nodes[grand as usize].color = Color::Red;
                self.top -= 1;
                continue;
            }

            // Zig-zag: rotate the parent first so the straight case
            // below finishes the job.
            if side == 1 - self.sides[(self.top + 1) as usize] as usize {
                let child = self.nodes[parent as usize].sides[1 - side];

                self.nodes[parent as usize].sides[1 - side] =
                    self.nodes[child as usize].sides[side];
                self.nodes[child as usize].sides[side] = parent;
                self.nodes[grand as usize].sides[side] = child;
                parent = child;
            }

            self.nodes[grand as usize].color = Color::Red;
            self.nodes[parent as usize].color = Color::Black;
            self.nodes[grand as usize].sides[side] = self.nodes[parent as usize].sides[1 - side];
            self.nodes[parent as usize].sides[1 - side] = grand;

            if self.top == 0 {
                self.root = parent;
            } else {
                let above = self.stack[(self.top - 1) as usize] as usize;
                self.nodes[above].sides[self.sides[(self.top - 1) as usize] as usize] = parent;
            }
            break;
        }

        if self.root != NIL {
            self.nodes[self.root as usize].color = Color::Black;
        }
    }

    /// Removes and returns the chunk at `offset`, if present.
    #[invariant(self.check_rep_or_err().is_ok(), "Internal invariants hold.")]
    #[ensures(ret.is_some() -> self.len() == old(self.len()) - 1)]
    pub fn remove(&mut self, offset: COffs) -> Option<Chunk> {
        let node = self.find_node(offset);
        if node == NIL {
            return None;
        }

        self.cache = None;

        // A node with two children first swaps places (and colours)
        // with its in-order predecessor, so the node to unlink has at
        // most one child.
        if self.nodes[node as usize].sides[0] != NIL
            && self.nodes[node as usize].sides[1] != NIL
        {
            let saved = self.top;

            self.push(node, 0);
            let mut target = self.nodes[node as usize].sides[0];
            while self.nodes[target as usize].sides[1] != NIL {
                self.push(target, 1);
                target = self.nodes[target as usize].sides[1];
            }

            if saved == -1 {
                self.root = target;
            } else {
                let parent = self.stack[saved as usize] as usize;
                self.nodes[parent].sides[self.sides[saved as usize] as usize] = target;
            }

            // The predecessor takes the removed node's stack entry.
            self.stack[(saved + 1) as usize] = target;

            let node_color = self.nodes[node as usize].color;
            self.nodes[node as usize].color = self.nodes[target as usize].color;
            self.nodes[target as usize].color = node_color;

            self.nodes[target as usize].sides[1] = self.nodes[node as usize].sides[1];
            self.nodes[node as usize].sides[1] = NIL;

            // Swap the left links; when the predecessor is the direct
            // left child this briefly self-links, and the unlink
            // below overwrites it.
            let target_left = self.nodes[target as usize].sides[0];
            let node_left = self.nodes[node as usize].sides[0];
            self.nodes[node as usize].sides[0] = target_left;
            self.nodes[target as usize].sides[0] = node_left;
        }

        let child = if self.nodes[node as usize].sides[0] != NIL {
            self.nodes[node as usize].sides[0]
        } else {
            self.nodes[node as usize].sides[1]
        };

        if self.top == -1 {
            self.root = child;
        } else {
            let parent = self.stack[self.top as usize] as usize;
            self.nodes[parent].sides[self.sides[self.top as usize] as usize] = child;
        }

        if self.nodes[node as usize].color == Color::Black {
            self.remove_fixup();
        }

        if self.root != NIL {
            self.nodes[self.root as usize].color = Color::Black;
        }

        Some(self.free_node(node))
    }

    fn remove_fixup(&mut self) {
        while self.top >= 0 {
            let side = self.sides[self.top as usize] as usize;
            let parent = self.stack[self.top as usize];

            // A red node filled the removed position: recolour and
            // done.
            let filler = self.nodes[parent as usize].sides[side];
            if filler != NIL && self.nodes[filler as usize].color == Color::Red {
                self.nodes[filler as usize].color = Color::Black;
                break;
            }

            let mut sibling = self.nodes[parent as usize].sides[1 - side];

            // Red sibling: rotate it above the parent, then continue
            // against the new (black) sibling.
            if sibling != NIL && self.nodes[sibling as usize].color == Color::Red {
                self.nodes[sibling as usize].color = Color::Black;
                self.nodes[parent as usize].color = Color::Red;

                if self.top == 0 {
                    self.root = sibling;
                } else {
                    let above = self.stack[(self.top - 1) as usize] as usize;
                    self.nodes[above].sides[self.sides[(self.top - 1) as usize] as usize] =
                        sibling;
                }

                self.nodes[parent as usize].sides[1 - side] =
                    self.nodes[sibling as usize].sides[side];
                self.nodes[sibling as usize].sides[side] = parent;

                self.stack[self.top as usize] = sibling;
                self.top += 1;
                assert!((self.top as usize) < STACK_DEPTH, "path stack overflow");
                self.sides[self.top as usize] = side as u8;
                self.stack[self.top as usize] = parent;

                sibling = self.nodes[parent as usize].sides[1 - side];
            }

            if sibling == NIL {
                break;
            }

            let near = self.nodes[sibling as usize].sides[side];
            let far = self.nodes[sibling as usize].sides[1 - side];

            // Both nephews black: push the deficit up.
            if (near == NIL || self.nodes[near as usize].color == Color::Black)
                && (far == NIL || self.nodes[far as usize].color == Color::Black)
            {
                self.nodes[sibling as usize].color = Color::Red;
                self.top -= 1;
                continue;
            }

            // Far nephew black: rotate the near one into its place.
            if far == NIL || self.nodes[far as usize].color == Color::Black {
                let near = self.nodes[sibling as usize].sides[side];

                self.nodes[near as usize].color = Color::Black;
                self.nodes[sibling as usize].color = Color::Red;

                self.nodes[sibling as usize].sides[side] =
                    self.nodes[near as usize].sides[1 - side];
                self.nodes[near as usize].sides[1 - side] = sibling;

                sibling = near;
                self.nodes[parent as usize].sides[1 - side] = near;
            }

            self.nodes[sibling as usize].color = self.nodes[parent as usize].color;
            self.nodes[parent as usize].color = Color::Black;

            let far = self.nodes[sibling as usize].sides[1 - side];
            if far != NIL {
                self.nodes[far as usize].color = Color::Black;
            }

            if self.top == 0 {
                self.root = sibling;
            } else {
                let above = self.stack[(self.top - 1) as usize] as usize;
                self.nodes[above].sides[self.sides[(self.top - 1) as usize] as usize] = sibling;
            }

            self.nodes[parent as usize].sides[1 - side] = self.nodes[sibling as usize].sides[side];
            self.nodes[sibling as usize].sides[side] = parent;
            break;
        }
    }

    /// Hands every chunk to `f` in in-order sequence and empties the
    /// index.  Pages are untouched; the caller decides where the
    /// chunks go.
    pub fn drain(&mut self, mut f: impl FnMut(Chunk)) {
        let mut node = self.root;
        let mut top: i32 = -1;

        loop {
            while node != NIL {
                top += 1;
                assert!((top as usize) < STACK_DEPTH, "path stack overflow");
                self.stack[top as usize] = node;
                node = self.nodes[node as usize].sides[0];
            }

            if top == -1 {
                break;
            }

            node = self.stack[top as usize];
            top -= 1;

            let next = self.nodes[node as usize].sides[1];
            f(self.nodes[node as usize].chunk.clone());

            node = next;
        }

        self.nodes.clear();
        self.spare.clear();
        self.root = NIL;
        self.cache = None;
        self.top = -1;
    }

    fn push(&mut self, node: u32, side: u8) {
        self.top += 1;
        assert!((self.top as usize) < STACK_DEPTH, "path stack overflow");
        self.stack[self.top as usize] = node;
        self.sides[self.top as usize] = side;
    }

    fn alloc_node(&mut self, chunk: Chunk) -> u32 {
        let node = Node {
            chunk,
            sides: [NIL, NIL],
            color: Color::Red,
        };

        match self.spare.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                let idx = self.nodes.len() as u32;
                assert!(idx < NIL, "node arena exhausted its index space");
                self.nodes.push(node);
                idx
            }
        }
    }

    fn free_node(&mut self, idx: u32) -> Chunk {
        self.spare.push(idx);
        self.nodes[idx as usize].chunk.clone()
    }

    /// Returns `Err` when some of the index's invariants are
    /// violated.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn check_rep_or_err(&self) -> Result<(), &'static str> {
        if self.root == NIL {
            if self.len() != 0 {
                return Err("Tree is empty but nodes are live.");
            }
            return Ok(());
        }

        if self.nodes[self.root as usize].color != Color::Black {
            return Err("Tree root must be black.");
        }

        fn validate(
            nodes: &[Node],
            idx: u32,
            lo: Option<u64>,
            hi: Option<u64>,
        ) -> Result<(usize, usize), &'static str> {
            if idx == NIL {
                return Ok((1, 0));
            }

            let node = &nodes[idx as usize];
            let key = node.chunk.offset().packed();
            if lo.map_or(false, |lo| key <= lo) || hi.map_or(false, |hi| key >= hi) {
                return Err("Tree violates offset order.");
            }

            if node.color == Color::Red {
                for side in &node.sides {
                    if *side != NIL && nodes[*side as usize].color == Color::Red {
                        return Err("Red node has a red child.");
                    }
                }
            }

            let left = validate(nodes, node.sides[0], lo, Some(key))?;
            let right = validate(nodes, node.sides[1], Some(key), hi)?;

            if left.0 != right.0 {
                return Err("Black heights diverge.");
            }

            let black = left.0 + (node.color == Color::Black) as usize;
            Ok((black, left.1 + right.1 + 1))
        }

        let (_, count) = validate(&self.nodes, self.root, None, None)?;
        if count != self.len() {
            return Err("Tree membership does not match the arena.");
        }

        Ok(())
    }
}

impl Default for ChunkIndex {
    fn default() -> ChunkIndex {
        ChunkIndex::new()
    }
}
