#![forbid(unsafe_code)]
//! XFS on top of the generic tree engine.
//!
//! Covers the per-AG inode btrees (inobt, finobt) and the per-file block
//! map btree (bmbt), in both the v4 layout and the v5 self-describing
//! layout with CRC-32C, owner, `blkno` and UUID checks.

mod ag;
mod format;
mod volume;

pub use ag::{AllocationGroup, XfsTree};
pub use format::{XfsRecord, XfsTreeFormat, XfsTreeKind, xfs_layout};
pub use pfs_ondisk::xfs::*;
pub use volume::{BlockMap, DataFork, XfsVolume};
