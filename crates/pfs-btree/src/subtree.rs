//! Eager loading of a whole subtree.

use std::collections::HashSet;
use std::sync::Arc;

use pfs_block::BlockSource;
use pfs_error::Result;
use pfs_types::NodeRef;
use tracing::debug;

use crate::error::corruption;
use crate::format::TreeFormat;
use crate::node::{LeafEntry, Node};
use crate::tree::Tree;
use crate::validate::{Expectation, check_context, child_expectation};

#[derive(Debug)]
pub struct SubtreeNode<K, R> {
    pub addr: NodeRef,
    pub node: Arc<Node<K, R>>,
    /// Arena indices of the children, in key order.
    pub children: Vec<usize>,
}

/// Every node reachable from one root, stored in an arena. Index 0 is the
/// root; children are referenced by index, never by pointer.
#[derive(Debug)]
pub struct Subtree<K, R> {
    nodes: Vec<SubtreeNode<K, R>>,
}

impl<K, R> Subtree<K, R> {
    #[must_use]
    pub fn root(&self) -> &SubtreeNode<K, R> {
        &self.nodes[0]
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&SubtreeNode<K, R>> {
        self.nodes.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in depth-first pre-order.
    pub fn nodes(&self) -> impl Iterator<Item = &SubtreeNode<K, R>> {
        self.nodes.iter()
    }

    /// Levels from the root down to the leaves.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.root().node.level() + 1
    }

    /// Leaf entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = &LeafEntry<K, R>> {
        self.nodes
            .iter()
            .filter_map(|n| n.node.as_leaf())
            .flat_map(|leaf| leaf.entries.iter())
    }
}

/// Depth-first load of everything under `root`.
///
/// A node reached twice is corruption: on the active path it is a cycle,
/// elsewhere two parents share one child.
pub(crate) fn load_subtree<F: TreeFormat>(
    tree: &Tree<F>,
    src: &dyn BlockSource,
    root: NodeRef,
) -> Result<Subtree<F::Key, F::Record>> {
    let format = tree.format();
    let policy = format.layout().level_policy;
    let root_expect = if tree.root() == Some(root) {
        Expectation::root(tree.root_level())
    } else {
        Expectation::root(None)
    };

    let mut nodes: Vec<SubtreeNode<F::Key, F::Record>> = Vec::new();
    let mut active_path: Vec<NodeRef> = Vec::new();
    let mut visited: HashSet<NodeRef> = HashSet::new();
    // (address, expectation, parent index, depth on active path)
    let mut stack = vec![(root, root_expect, None::<usize>, 0_usize)];

    while let Some((addr, expect, parent, depth)) = stack.pop() {
        active_path.truncate(depth);
        if active_path.contains(&addr) {
            return Err(corruption(addr, "cycle in tree pointers"));
        }
        if !visited.insert(addr) {
            return Err(corruption(addr, "node referenced by more than one parent"));
        }

        let node = tree.load_node(src, addr)?;
        check_context(format, tree.options(), addr, &node, &expect)?;
        let idx = nodes.len();
        if let Some(parent) = parent {
            nodes[parent].children.push(idx);
        }
        active_path.push(addr);

        if let Node::Internal(internal) = &*node {
            // Push in reverse so children pop in key order.
            for slot in (0..internal.entries.len()).rev() {
                stack.push((
                    internal.entries[slot].child,
                    child_expectation(policy, internal, slot),
                    Some(idx),
                    depth + 1,
                ));
            }
        }
        nodes.push(SubtreeNode {
            addr,
            node,
            children: Vec::new(),
        });
    }

    debug!(
        format = format.name(),
        root = root.0,
        nodes = nodes.len(),
        "btree_subtree_loaded"
    );
    Ok(Subtree { nodes })
}
