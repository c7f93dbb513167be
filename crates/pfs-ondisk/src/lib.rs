#![forbid(unsafe_code)]
//! On-disk format parsing for btrfs, XFS and HFS+ structures.
//!
//! Pure parsing crate with no I/O. Parses byte slices into typed Rust
//! structures: superblocks and volume headers, tree node headers, record
//! tables and the item payloads the read path needs. Traversal lives in
//! `pfs-btree`; this crate never follows a pointer.

pub mod btrfs;
pub mod hfsplus;
pub mod xfs;

pub use btrfs::{
    BtrfsChunkEntry, BtrfsHeader, BtrfsItem, BtrfsKey, BtrfsKeyPtr, BtrfsSuperblock,
    parse_internal_items, parse_leaf_items,
};
pub use hfsplus::{
    HfsCatalogKey, HfsCatalogRecord, HfsExtentKey, HfsForkData, HfsHeaderRecord,
    HfsNodeDescriptor, HfsPlusVolumeHeader,
};
pub use xfs::{
    XfsAgi, XfsBmbtRec, XfsBmdrBlock, XfsBtreeHeader, XfsDinode, XfsForkFormat, XfsInobtRec,
    XfsSuperblock, XfsTimestamp,
};
