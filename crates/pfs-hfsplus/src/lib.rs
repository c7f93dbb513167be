#![forbid(unsafe_code)]
//! HFS+ and HFSX on top of the generic tree engine.
//!
//! [`HfsTreeFormat`] decodes the node format shared by the catalog and the
//! extents-overflow file; [`CatalogKind`] and [`ExtentsKind`] supply each
//! file's keys and records. [`HfsVolume`] reads the volume header, opens
//! both trees through their forks and answers catalog queries: lookups,
//! thread records, directory listings, path resolution and file reads.

mod catalog;
mod extents;
mod format;
mod volume;

pub use catalog::{CatalogKind, NameOrder};
pub use extents::{ExtentRecord, ExtentsKind, fork_segments};
pub use format::{HfsTree, HfsTreeFormat, HfsTreeKind, hfs_layout, open_btree};
pub use pfs_ondisk::hfsplus::*;
pub use volume::{CatalogTree, ExtentsTree, ForkSource, HfsDirEntry, HfsVolume};
