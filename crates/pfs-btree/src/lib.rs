#![forbid(unsafe_code)]
//! Format-agnostic, read-only B-tree/B+tree engine.
//!
//! One traversal engine serves every on-disk tree PolyFS reads (btrfs
//! trees, XFS inode and block-map btrees, the HFS+ catalog and extents
//! overflow trees). A format plugs in by implementing [`TreeFormat`]:
//! node geometry ([`NodeLayout`]), key codec, checksum and node decoding.
//!
//! Every node goes through the same pipeline before the engine uses it:
//!
//! 1. read `node_size` bytes at `format.locate(addr)`
//! 2. verify the checksum (extended layouts only)
//! 3. decode header and entries
//! 4. intrinsic validation (kind/level, record count, owner, identity, key order)
//! 5. contextual validation on every use (level sequence, separator bounds)
//!
//! Missing keys are `Ok(None)`; any failed check is an error and never
//! degrades into "not found".

mod cache;
mod cursor;
pub mod error;
mod format;
mod layout;
mod node;
mod subtree;
mod tree;
pub mod validate;

pub use cache::NodeCache;
pub use cursor::{CursorState, RangeScan, ScanBound, TreeCursor};
pub use error::{node_error, parse_error};
pub use format::{KeyCodec, TreeFormat};
pub use layout::{DuplicateKeys, HeaderVersion, LevelPolicy, NodeLayout};
pub use node::{
    ExtendedHeader, HeaderNode, IndexEntry, InternalNode, LeafEntry, LeafNode, Node, NodeHeader,
    NodeKind, TreeMeta,
};
pub use subtree::{Subtree, SubtreeNode};
pub use tree::{Tree, TreeOptions, decode_node};
