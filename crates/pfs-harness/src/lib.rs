#![forbid(unsafe_code)]
//! Synthetic images for tests and benchmarks.
//!
//! Each module builds a small but well-formed volume in memory with the
//! same checksums and self-describing headers a real `mkfs` would write,
//! so tests can start from a valid image and corrupt one field at a time.

pub mod btrfs;
pub mod hfsplus;
pub mod xfs;
