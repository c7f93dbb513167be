//! Stateful traversal: descent, leaf positioning and range scans.
//!
//! A cursor keeps the nodes it has visited in an arena and a stack of
//! `(arena index, slot)` frames from the root to the current leaf. Moving
//! past the end of a leaf either follows the leaf's right-sibling link
//! (formats with sibling chains) or climbs the frame stack to the nearest
//! ancestor with an unvisited child (formats without). A scan never
//! re-descends from the root.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pfs_block::BlockSource;
use pfs_error::Result;
use pfs_types::NodeRef;
use tracing::trace;

use crate::error::{corruption, structural};
use crate::format::{KeyCodec, TreeFormat};
use crate::layout::DuplicateKeys;
use crate::node::{IndexEntry, LeafEntry, Node};
use crate::tree::Tree;
use crate::validate::{Expectation, check_context, child_expectation, ordered};

/// Where a cursor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing loaded yet.
    Start,
    /// Positioned inside a leaf.
    AtLeaf,
    /// The last lookup matched.
    Found,
    /// The last lookup did not match; the tree is intact.
    NotFound,
    /// Iteration ran off the end (or start) of the tree.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: usize,
    slot: usize,
}

type SharedNode<F> = Arc<Node<<F as KeyCodec>::Key, <F as TreeFormat>::Record>>;

/// Child slot for `target` among `entries`: the greatest index whose key is
/// `<= target`, or 0 when `target` sorts before every key. Under
/// `Leftmost` the greatest key strictly below `target` is taken instead,
/// since a run of equal keys may begin in the child left of an equal
/// separator; the caller settles forward from there.
pub(crate) fn child_slot<F: TreeFormat>(
    format: &F,
    entries: &[IndexEntry<F::Key>],
    target: &F::Key,
) -> usize {
    match format.layout().duplicates {
        DuplicateKeys::Leftmost => entries
            .partition_point(|entry| format.compare(&entry.key, target) == Ordering::Less)
            .saturating_sub(1),
        DuplicateKeys::Forbidden | DuplicateKeys::Rightmost => entries
            .partition_point(|entry| format.compare(&entry.key, target) != Ordering::Greater)
            .saturating_sub(1),
    }
}

/// Index of the first leaf entry whose key is `>= target`.
pub(crate) fn leaf_lower_bound<F: TreeFormat>(
    format: &F,
    entries: &[LeafEntry<F::Key, F::Record>],
    target: &F::Key,
) -> usize {
    entries.partition_point(|entry| format.compare(&entry.key, target) == Ordering::Less)
}

pub struct TreeCursor<'a, F: TreeFormat> {
    tree: &'a Tree<F>,
    src: &'a dyn BlockSource,
    arena: Vec<(NodeRef, SharedNode<F>)>,
    arena_index: HashMap<NodeRef, usize>,
    path: Vec<Frame>,
    state: CursorState,
    /// Leaves visited by consecutive forward (or backward) moves.
    forward_trail: HashSet<NodeRef>,
    backward_trail: HashSet<NodeRef>,
}

impl<'a, F: TreeFormat> TreeCursor<'a, F> {
    pub(crate) fn new(tree: &'a Tree<F>, src: &'a dyn BlockSource) -> Self {
        Self {
            tree,
            src,
            arena: Vec::new(),
            arena_index: HashMap::new(),
            path: Vec::new(),
            state: CursorState::Start,
            forward_trail: HashSet::new(),
            backward_trail: HashSet::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Distinct nodes this cursor has loaded.
    #[must_use]
    pub fn nodes_visited(&self) -> usize {
        self.arena.len()
    }

    /// Addresses from the root to the current leaf.
    #[must_use]
    pub fn path(&self) -> Vec<NodeRef> {
        self.path
            .iter()
            .map(|frame| self.arena[frame.node].0)
            .collect()
    }

    /// Forget position and visited nodes.
    pub fn reset(&mut self) {
        self.arena.clear();
        self.arena_index.clear();
        self.path.clear();
        self.forward_trail.clear();
        self.backward_trail.clear();
        self.state = CursorState::Start;
    }

    fn format(&self) -> &'a F {
        self.tree.format()
    }

    /// Load `addr`, check it against `expect`, and record it in the arena.
    fn materialize(&mut self, addr: NodeRef, expect: &Expectation<F::Key>) -> Result<usize> {
        let node = match self.arena_index.get(&addr) {
            Some(&idx) => Arc::clone(&self.arena[idx].1),
            None => self.tree.load_node(self.src, addr)?,
        };
        check_context(self.format(), self.tree.options(), addr, &node, expect)?;
        if let Some(&idx) = self.arena_index.get(&addr) {
            return Ok(idx);
        }
        self.arena.push((addr, node));
        let idx = self.arena.len() - 1;
        self.arena_index.insert(addr, idx);
        Ok(idx)
    }

    fn node(&self, idx: usize) -> SharedNode<F> {
        Arc::clone(&self.arena[idx].1)
    }

    fn addr(&self, idx: usize) -> NodeRef {
        self.arena[idx].0
    }

    /// Descend from the root to the leaf that would contain `target` and
    /// position at the first entry `>= target` (possibly one past the end
    /// of that leaf).
    pub fn seek(&mut self, target: &F::Key) -> Result<()> {
        self.path.clear();
        self.forward_trail.clear();
        self.backward_trail.clear();
        let Some(root) = self.tree.root() else {
            self.state = CursorState::Exhausted;
            return Ok(());
        };

        let format = self.format();
        let policy = format.layout().level_policy;
        let mut addr = root;
        let mut expect = Expectation::root(self.tree.root_level());
        loop {
            if self.path.iter().any(|frame| self.addr(frame.node) == addr) {
                return Err(corruption(addr, "node revisited during descent"));
            }
            let idx = self.materialize(addr, &expect)?;
            let node = self.node(idx);
            match &*node {
                Node::Header(_) => {
                    return Err(structural(addr, "header node reached during descent"));
                }
                Node::Internal(internal) => {
                    let slot = child_slot(format, &internal.entries, target);
                    trace!(node = addr.0, level = internal.header.level, slot, "btree_descend");
                    self.path.push(Frame { node: idx, slot });
                    expect = child_expectation(policy, internal, slot);
                    addr = internal.entries[slot].child;
                }
                Node::Leaf(leaf) => {
                    let slot = leaf_lower_bound(format, &leaf.entries, target);
                    self.path.push(Frame { node: idx, slot });
                    self.state = CursorState::AtLeaf;
                    return Ok(());
                }
            }
        }
    }

    /// Entry under the cursor, if positioned on one.
    #[must_use]
    pub fn current(&self) -> Option<LeafEntry<F::Key, F::Record>> {
        let frame = self.path.last()?;
        let node = &self.arena[frame.node].1;
        node.as_leaf()?.entries.get(frame.slot).cloned()
    }

    fn leaf_len(&self, frame: Frame) -> usize {
        self.arena[frame.node].1.len()
    }

    /// Exact-match lookup.
    pub fn find_first(&mut self, target: &F::Key) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        self.seek(target)?;
        if self.state == CursorState::Exhausted {
            self.state = CursorState::NotFound;
            return Ok(None);
        }
        if self.format().layout().duplicates != DuplicateKeys::Forbidden {
            // A run of equal keys may start in the next leaf.
            self.settle_forward()?;
        }
        let found = self
            .current()
            .filter(|entry| self.format().compare(&entry.key, target) == Ordering::Equal);
        self.state = if found.is_some() {
            CursorState::Found
        } else {
            CursorState::NotFound
        };
        Ok(found)
    }

    /// Greatest entry `<= target`.
    pub fn find_floor(&mut self, target: &F::Key) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        self.seek(target)?;
        if self.state == CursorState::Exhausted {
            self.state = CursorState::NotFound;
            return Ok(None);
        }
        if self.format().layout().duplicates != DuplicateKeys::Forbidden {
            self.settle_forward()?;
        }
        if let Some(entry) = self.current() {
            if self.format().compare(&entry.key, target) == Ordering::Equal {
                self.state = CursorState::Found;
                return Ok(Some(entry));
            }
        }
        if self.retreat()? {
            self.state = CursorState::Found;
            Ok(self.current())
        } else {
            self.state = CursorState::NotFound;
            Ok(None)
        }
    }

    /// Move past empty slots so `current()` yields the next entry. Returns
    /// `false` at the end of the tree.
    pub fn settle_forward(&mut self) -> Result<bool> {
        loop {
            let Some(&frame) = self.path.last() else {
                self.state = CursorState::Exhausted;
                return Ok(false);
            };
            if frame.slot < self.leaf_len(frame) {
                self.state = CursorState::AtLeaf;
                return Ok(true);
            }
            if !self.next_leaf()? {
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
        }
    }

    /// Step to the next entry in key order.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(frame) = self.path.last_mut() else {
            return Ok(false);
        };
        frame.slot += 1;
        self.backward_trail.clear();
        self.settle_forward()
    }

    /// Step to the previous entry in key order.
    pub fn retreat(&mut self) -> Result<bool> {
        self.forward_trail.clear();
        loop {
            let Some(frame) = self.path.last_mut() else {
                self.state = CursorState::Exhausted;
                return Ok(false);
            };
            if frame.slot > 0 {
                frame.slot -= 1;
                self.state = CursorState::AtLeaf;
                return Ok(true);
            }
            if !self.prev_leaf()? {
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
        }
    }

    fn current_leaf(&self) -> Option<(usize, SharedNode<F>)> {
        let frame = self.path.last()?;
        Some((frame.node, self.node(frame.node)))
    }

    /// Position at slot 0 of the leaf after the current one.
    fn next_leaf(&mut self) -> Result<bool> {
        let Some((leaf_idx, leaf)) = self.current_leaf() else {
            return Ok(false);
        };
        let leaf_addr = self.addr(leaf_idx);
        self.forward_trail.insert(leaf_addr);

        if self.format().layout().sibling_links {
            let Some(right) = leaf.header().right_sibling else {
                return Ok(false);
            };
            if self.forward_trail.contains(&right) {
                return Err(corruption(right, "sibling chain loops back on itself"));
            }
            let idx = self.materialize(right, &Expectation::sibling_leaf())?;
            let next = self.node(idx);
            if next.header().left_sibling != Some(leaf_addr) {
                return Err(corruption(
                    right,
                    format!("left sibling does not point back to node {}", leaf_addr.0),
                ));
            }
            self.check_leaf_boundary(right, &leaf, &next)?;
            self.path.clear();
            self.path.push(Frame { node: idx, slot: 0 });
            return Ok(true);
        }

        // Climb to the nearest ancestor with a child to the right.
        let mut depth = self.path.len() - 1;
        while depth > 0 {
            depth -= 1;
            let Frame { node, slot } = self.path[depth];
            if slot + 1 < self.arena[node].1.len() {
                self.path.truncate(depth + 1);
                self.path[depth].slot = slot + 1;
                self.descend_edge(true)?;
                let (idx, next) = self
                    .current_leaf()
                    .ok_or_else(|| structural(leaf_addr, "descent produced no leaf"))?;
                let next_addr = self.addr(idx);
                if self.forward_trail.contains(&next_addr) {
                    return Err(corruption(next_addr, "leaf reached twice in one scan"));
                }
                self.check_leaf_boundary(next_addr, &leaf, &next)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Position after the last entry of the leaf before the current one.
    fn prev_leaf(&mut self) -> Result<bool> {
        let Some((leaf_idx, leaf)) = self.current_leaf() else {
            return Ok(false);
        };
        let leaf_addr = self.addr(leaf_idx);
        self.backward_trail.insert(leaf_addr);

        if self.format().layout().sibling_links {
            let Some(left) = leaf.header().left_sibling else {
                return Ok(false);
            };
            if self.backward_trail.contains(&left) {
                return Err(corruption(left, "sibling chain loops back on itself"));
            }
            let idx = self.materialize(left, &Expectation::sibling_leaf())?;
            let prev = self.node(idx);
            if prev.header().right_sibling != Some(leaf_addr) {
                return Err(corruption(
                    left,
                    format!("right sibling does not point back to node {}", leaf_addr.0),
                ));
            }
            self.check_leaf_boundary(leaf_addr, &prev, &leaf)?;
            self.path.clear();
            self.path.push(Frame {
                node: idx,
                slot: prev.len(),
            });
            return Ok(true);
        }

        let mut depth = self.path.len() - 1;
        while depth > 0 {
            depth -= 1;
            let Frame { slot, .. } = self.path[depth];
            if slot > 0 {
                self.path.truncate(depth + 1);
                self.path[depth].slot = slot - 1;
                self.descend_edge(false)?;
                let (idx, prev) = self
                    .current_leaf()
                    .ok_or_else(|| structural(leaf_addr, "descent produced no leaf"))?;
                let prev_addr = self.addr(idx);
                if self.backward_trail.contains(&prev_addr) {
                    return Err(corruption(prev_addr, "leaf reached twice in one scan"));
                }
                self.check_leaf_boundary(leaf_addr, &prev, &leaf)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// From the internal frame on top of the path, descend along the
    /// leftmost (`leftmost == true`) or rightmost edge to a leaf.
    fn descend_edge(&mut self, leftmost: bool) -> Result<()> {
        let policy = self.format().layout().level_policy;
        loop {
            let Some(&Frame { node, slot }) = self.path.last() else {
                return Ok(());
            };
            let parent = self.node(node);
            let Some(internal) = parent.as_internal() else {
                return Ok(());
            };
            let expect = child_expectation(policy, internal, slot);
            let child_addr = internal.entries[slot].child;
            let idx = self.materialize(child_addr, &expect)?;
            let child = self.node(idx);
            let child_slot = match (&*child, leftmost) {
                (Node::Header(_), _) => {
                    return Err(structural(child_addr, "header node reached during descent"));
                }
                (_, true) => 0,
                (Node::Internal(n), false) => n.entries.len().saturating_sub(1),
                (Node::Leaf(n), false) => n.entries.len(),
            };
            self.path.push(Frame {
                node: idx,
                slot: child_slot,
            });
            if child.as_leaf().is_some() {
                self.state = CursorState::AtLeaf;
                return Ok(());
            }
        }
    }

    /// Keys must keep ascending across the boundary from `left` to `right`.
    fn check_leaf_boundary(
        &self,
        at: NodeRef,
        left: &Node<F::Key, F::Record>,
        right: &Node<F::Key, F::Record>,
    ) -> Result<()> {
        if !self.tree.options().check_key_order {
            return Ok(());
        }
        if let (Some(last), Some(first)) = (left.last_key(), right.first_key()) {
            if !ordered(self.format(), last, first) {
                return Err(corruption(at, "keys do not ascend across leaf boundary"));
            }
        }
        Ok(())
    }
}

/// How far a range scan runs.
#[derive(Debug, Clone)]
pub enum ScanBound<K> {
    /// Stop at the first key not sharing this prefix.
    Prefix(K),
    /// Run to the end of the tree.
    Unbounded,
}

/// Lazy, restartable iterator over a key range.
///
/// The first call to `next` descends; later calls step through leaves.
/// An error ends the scan after it is yielded.
pub struct RangeScan<'a, F: TreeFormat> {
    cursor: TreeCursor<'a, F>,
    start: F::Key,
    bound: ScanBound<F::Key>,
    started: bool,
    done: bool,
}

impl<'a, F: TreeFormat> RangeScan<'a, F> {
    pub(crate) fn new(cursor: TreeCursor<'a, F>, start: F::Key, bound: ScanBound<F::Key>) -> Self {
        Self {
            cursor,
            start,
            bound,
            started: false,
            done: false,
        }
    }

    /// Rewind to the beginning of the range.
    pub fn restart(&mut self) {
        self.cursor.reset();
        self.started = false;
        self.done = false;
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        self.cursor.state()
    }

    #[must_use]
    pub fn nodes_visited(&self) -> usize {
        self.cursor.nodes_visited()
    }

    fn step(&mut self) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        let positioned = if self.started {
            self.cursor.advance()?
        } else {
            self.started = true;
            self.cursor.seek(&self.start)?;
            self.cursor.settle_forward()?
        };
        if !positioned {
            return Ok(None);
        }
        let Some(entry) = self.cursor.current() else {
            return Ok(None);
        };
        if let ScanBound::Prefix(prefix) = &self.bound {
            if !self.cursor.format().matches_prefix(&entry.key, prefix) {
                self.cursor.state = CursorState::Exhausted;
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }
}

impl<F: TreeFormat> Iterator for RangeScan<'_, F> {
    type Item = Result<LeafEntry<F::Key, F::Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
