//! Per-format node geometry and traversal policy.

use pfs_types::ParseError;
use serde::{Deserialize, Serialize};

use crate::node::NodeKind;

/// Whether nodes carry the self-describing checksummed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderVersion {
    Legacy,
    Extended,
}

/// How equal keys may appear within one tree, and which child a descent
/// picks when several index keys tie with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateKeys {
    /// Keys are strictly increasing; a tie is corruption.
    Forbidden,
    /// Ties allowed; descend into the leftmost tied child.
    Leftmost,
    /// Ties allowed; descend into the rightmost tied child.
    Rightmost,
}

/// Level sequence a descent must observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelPolicy {
    /// Each child sits exactly one level below its parent.
    StrictByOne,
    /// Children sit at any lower level (variable fan-out formats).
    Decreasing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLayout {
    pub version: HeaderVersion,
    pub node_size: u32,
    pub header_len: usize,
    /// Bytes per leaf record slot (for variable-length formats, the
    /// smallest possible record including its offset-table entry).
    pub leaf_record_width: usize,
    /// Bytes per internal entry (key plus child pointer).
    pub internal_record_width: usize,
    pub max_level: u16,
    pub sibling_links: bool,
    pub duplicates: DuplicateKeys,
    pub level_policy: LevelPolicy,
}

impl NodeLayout {
    #[must_use]
    pub fn node_len(&self) -> usize {
        usize::try_from(self.node_size).unwrap_or(usize::MAX)
    }

    /// Maximum record count a node of `kind` can hold.
    #[must_use]
    pub fn capacity(&self, kind: NodeKind) -> usize {
        let width = match kind {
            NodeKind::Leaf => self.leaf_record_width,
            NodeKind::Internal => self.internal_record_width,
            NodeKind::Header => return 1,
        };
        if width == 0 {
            return 0;
        }
        self.node_len().saturating_sub(self.header_len) / width
    }

    /// Reject a declared record count before any entry is read.
    pub fn check_record_count(&self, kind: NodeKind, count: usize) -> Result<(), ParseError> {
        if count > self.capacity(kind) {
            return Err(ParseError::InvalidField {
                field: "record_count",
                reason: "declared record count exceeds node capacity",
            });
        }
        Ok(())
    }
}
