//! Shared cache of decoded, validated nodes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use pfs_types::NodeRef;

use crate::node::Node;

/// Maps a node address to its decoded form.
///
/// Only nodes that passed intrinsic validation are inserted. Concurrent
/// readers that miss on the same node may both decode it; the first
/// insert wins and the loser adopts the cached copy.
#[derive(Debug)]
pub struct NodeCache<K, R> {
    nodes: RwLock<HashMap<NodeRef, Arc<Node<K, R>>>>,
    capacity: usize,
}

impl<K, R> NodeCache<K, R> {
    /// A cache holding at most `capacity` nodes. Once full, further nodes
    /// are served uncached.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    #[must_use]
    pub fn get(&self, node: NodeRef) -> Option<Arc<Node<K, R>>> {
        self.nodes.read().get(&node).cloned()
    }

    /// Insert `decoded` unless another reader got there first; returns the
    /// node callers should use.
    pub fn insert(&self, node: NodeRef, decoded: Arc<Node<K, R>>) -> Arc<Node<K, R>> {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&node) {
            return Arc::clone(existing);
        }
        if nodes.len() >= self.capacity {
            return decoded;
        }
        Arc::clone(nodes.entry(node).or_insert(decoded))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}
