#![forbid(unsafe_code)]
//! btrfs on top of the generic tree engine.
//!
//! [`BtrfsTreeFormat`] teaches `pfs-btree` the btrfs node layout;
//! [`BtrfsVolume`] bootstraps the chunk map and the root tree from the
//! superblock. Payload parsers come from `pfs_ondisk::btrfs` and are
//! re-exported here.

mod format;
mod volume;

pub use format::{BtrfsRecord, BtrfsTreeFormat, btrfs_layout, item_prefix};
pub use pfs_ondisk::btrfs::*;
pub use volume::{BtrfsTree, BtrfsVolume};
