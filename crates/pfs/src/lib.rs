#![forbid(unsafe_code)]
//! PolyFS public API facade.
//!
//! Re-exports `pfs-core`: format detection, [`OpenFs`] and the read-only
//! VFS operations. Downstream consumers such as the CLI depend on this
//! crate rather than on the format crates.

pub use pfs_core::*;
