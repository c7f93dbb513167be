//! Decoded node model shared by every format.

use pfs_types::{FsUuid, NodeRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Header,
    Internal,
    Leaf,
}

/// Self-describing header fields present on checksummed ("extended")
/// node versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHeader {
    /// Address the node claims to live at, in the format's own unit.
    pub block_number: u64,
    pub lsn: u64,
    pub uuid: FsUuid,
    pub owner: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub magic: u32,
    /// 0 for leaves, increasing toward the root.
    pub level: u16,
    pub record_count: u32,
    pub left_sibling: Option<NodeRef>,
    pub right_sibling: Option<NodeRef>,
    pub extended: Option<ExtendedHeader>,
}

/// Tree-wide metadata carried by a header node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    /// `None` for an empty tree.
    pub root: Option<NodeRef>,
    pub depth: u16,
    pub leaf_records: u64,
    pub first_leaf: Option<NodeRef>,
    pub last_leaf: Option<NodeRef>,
    pub node_size: u32,
    pub max_key_length: u16,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub key_compare: u8,
    pub attributes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNode {
    pub header: NodeHeader,
    pub meta: TreeMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<K> {
    pub key: K,
    pub child: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode<K> {
    pub header: NodeHeader,
    pub entries: Vec<IndexEntry<K>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry<K, R> {
    pub key: K,
    pub record: R,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode<K, R> {
    pub header: NodeHeader,
    pub entries: Vec<LeafEntry<K, R>>,
}

/// A decoded, validated node. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<K, R> {
    Header(HeaderNode),
    Internal(InternalNode<K>),
    Leaf(LeafNode<K, R>),
}

impl<K, R> Node<K, R> {
    #[must_use]
    pub fn header(&self) -> &NodeHeader {
        match self {
            Self::Header(node) => &node.header,
            Self::Internal(node) => &node.header,
            Self::Leaf(node) => &node.header,
        }
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Header(_) => NodeKind::Header,
            Self::Internal(_) => NodeKind::Internal,
            Self::Leaf(_) => NodeKind::Leaf,
        }
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.header().level
    }

    /// Number of decoded entries (0 for header nodes).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Header(_) => 0,
            Self::Internal(node) => node.entries.len(),
            Self::Leaf(node) => node.entries.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key at `idx` for internal and leaf nodes.
    #[must_use]
    pub fn key_at(&self, idx: usize) -> Option<&K> {
        match self {
            Self::Header(_) => None,
            Self::Internal(node) => node.entries.get(idx).map(|entry| &entry.key),
            Self::Leaf(node) => node.entries.get(idx).map(|entry| &entry.key),
        }
    }

    #[must_use]
    pub fn first_key(&self) -> Option<&K> {
        self.key_at(0)
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&K> {
        self.len().checked_sub(1).and_then(|idx| self.key_at(idx))
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&LeafNode<K, R>> {
        match self {
            Self::Leaf(node) => Some(node),
            Self::Header(_) | Self::Internal(_) => None,
        }
    }

    #[must_use]
    pub fn as_internal(&self) -> Option<&InternalNode<K>> {
        match self {
            Self::Internal(node) => Some(node),
            Self::Header(_) | Self::Leaf(_) => None,
        }
    }

    #[must_use]
    pub fn as_header(&self) -> Option<&HeaderNode> {
        match self {
            Self::Header(node) => Some(node),
            Self::Internal(_) | Self::Leaf(_) => None,
        }
    }
}
