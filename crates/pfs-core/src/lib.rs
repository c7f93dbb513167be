#![forbid(unsafe_code)]
//! Format detection, the open flow and read-only VFS semantics.
//!
//! [`detect_filesystem`] checks a source for btrfs, XFS and HFS+ and
//! returns the parsed superblock; [`OpenFs`] opens the matching context
//! and exposes it through [`ReadOnlyFs`] where the format supports one.

mod btrfs;
mod dircache;
mod hfsplus;
pub mod lvm;
mod vfs;
mod xfs;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use pfs_block::{
    BlockSource, FileBlockSource, read_btrfs_superblock_region, read_hfsplus_header_region,
    read_xfs_superblock_region,
};
use pfs_btree::TreeOptions;
use pfs_error::PfsError;
use pfs_ondisk::{BtrfsSuperblock, HfsPlusVolumeHeader, XfsSuperblock};
use pfs_types::{
    BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, HFSPLUS_VOLUME_HEADER_OFFSET,
    HFSPLUS_VOLUME_HEADER_SIZE, XFS_SUPERBLOCK_OFFSET, XFS_SUPERBLOCK_SIZE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use btrfs::{BtrfsFs, BtrfsInode};
pub use hfsplus::HfsFs;
pub use pfs_error::Result;
pub use pfs_types::InodeNumber;
pub use vfs::{DirEntry, FileType, InodeAttr, ReadOnlyFs};
pub use xfs::XfsFs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsFlavor {
    Btrfs(BtrfsSuperblock),
    Xfs(XfsSuperblock),
    HfsPlus(HfsPlusVolumeHeader),
}

impl FsFlavor {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Btrfs(_) => "btrfs",
            Self::Xfs(_) => "xfs",
            Self::HfsPlus(header) if header.is_hfsx() => "hfsx",
            Self::HfsPlus(_) => "hfsplus",
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("image does not decode as a supported btrfs/xfs/hfs+ superblock")]
    UnsupportedImage,
    #[error("I/O error while detecting image: {0}")]
    Io(#[from] PfsError),
}

fn region_end(offset: usize, size: usize) -> u64 {
    u64::try_from(offset + size).unwrap_or(u64::MAX)
}

/// Check `src` for a known superblock: XFS at 0, HFS+ at 1 KiB, btrfs at
/// 64 KiB. Regions the source is too short to hold are skipped.
pub fn detect_filesystem(src: &dyn BlockSource) -> std::result::Result<FsFlavor, DetectionError> {
    let len = src.len_bytes();

    if len >= region_end(XFS_SUPERBLOCK_OFFSET, XFS_SUPERBLOCK_SIZE) {
        let region = read_xfs_superblock_region(src)?;
        if let Ok(sb) = XfsSuperblock::parse_superblock_region(&region) {
            return Ok(FsFlavor::Xfs(sb));
        }
    }

    if len >= region_end(HFSPLUS_VOLUME_HEADER_OFFSET, HFSPLUS_VOLUME_HEADER_SIZE) {
        let region = read_hfsplus_header_region(src)?;
        if let Ok(header) = HfsPlusVolumeHeader::parse(&region) {
            return Ok(FsFlavor::HfsPlus(header));
        }
    }

    if len >= region_end(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE) {
        let region = read_btrfs_superblock_region(src)?;
        if let Ok(sb) = BtrfsSuperblock::parse_superblock_region(&region) {
            return Ok(FsFlavor::Btrfs(sb));
        }
    }

    Err(DetectionError::UnsupportedImage)
}

pub fn detect_filesystem_at_path(
    path: impl AsRef<Path>,
) -> std::result::Result<FsFlavor, DetectionError> {
    let src = FileBlockSource::open(path)?;
    detect_filesystem(&src)
}

/// Validation and caching switches applied when opening an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Skip integrity checks (checksums, owners, key order) for damaged
    /// images. Structural decoding still applies.
    pub skip_validation: bool,
    pub verify_checksums: bool,
    pub cache_nodes: bool,
    /// Keep full directory listings once read.
    pub cache_directories: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            verify_checksums: true,
            cache_nodes: true,
            cache_directories: true,
        }
    }
}

impl OpenOptions {
    /// Tree engine options for every tree the context opens.
    #[must_use]
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            verify_checksums: self.verify_checksums && !self.skip_validation,
            check_owner: !self.skip_validation,
            check_key_order: !self.skip_validation,
            cache_nodes: self.cache_nodes,
            ..TreeOptions::default()
        }
    }
}

/// The per-format state behind an [`OpenFs`].
#[derive(Debug)]
pub enum FsContext {
    Btrfs(BtrfsFs),
    Xfs(XfsFs),
    HfsPlus(HfsFs),
}

/// An opened image: detected flavor plus its filesystem context.
pub struct OpenFs {
    pub flavor: FsFlavor,
    pub context: FsContext,
    src: Arc<dyn BlockSource>,
}

impl std::fmt::Debug for OpenFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFs")
            .field("flavor", &self.flavor.name())
            .field("context", &self.context)
            .field("source_len", &self.src.len_bytes())
            .finish()
    }
}

impl OpenFs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let src: Arc<dyn BlockSource> = Arc::new(FileBlockSource::open(path)?);
        debug!(path = %path.display(), len = src.len_bytes(), "image_open");
        Self::from_source(src, options)
    }

    /// Detect the format on `src` and open its context.
    pub fn from_source(src: Arc<dyn BlockSource>, options: &OpenOptions) -> Result<Self> {
        let flavor = detect_filesystem(&*src).map_err(|err| match err {
            DetectionError::UnsupportedImage => PfsError::UnsupportedFormat(err.to_string()),
            DetectionError::Io(inner) => inner,
        })?;
        let context = match &flavor {
            FsFlavor::Btrfs(_) => FsContext::Btrfs(BtrfsFs::open(Arc::clone(&src), options)?),
            FsFlavor::Xfs(_) => FsContext::Xfs(XfsFs::open(Arc::clone(&src), options)?),
            FsFlavor::HfsPlus(_) => FsContext::HfsPlus(HfsFs::open(Arc::clone(&src), options)?),
        };
        info!(flavor = flavor.name(), ?options, "filesystem_open");
        Ok(Self {
            flavor,
            context,
            src,
        })
    }

    #[must_use]
    pub fn source(&self) -> &dyn BlockSource {
        &*self.src
    }

    /// The context as a [`ReadOnlyFs`].
    #[must_use]
    pub fn vfs(&self) -> &dyn ReadOnlyFs {
        match &self.context {
            FsContext::Btrfs(fs) => fs,
            FsContext::HfsPlus(fs) => fs,
            FsContext::Xfs(fs) => fs,
        }
    }

    #[must_use]
    pub fn btrfs(&self) -> Option<&BtrfsFs> {
        match &self.context {
            FsContext::Btrfs(fs) => Some(fs),
            _ => None,
        }
    }

    #[must_use]
    pub fn xfs(&self) -> Option<&XfsFs> {
        match &self.context {
            FsContext::Xfs(fs) => Some(fs),
            _ => None,
        }
    }

    #[must_use]
    pub fn hfsplus(&self) -> Option<&HfsFs> {
        match &self.context {
            FsContext::HfsPlus(fs) => Some(fs),
            _ => None,
        }
    }
}

impl ReadOnlyFs for OpenFs {
    fn root_ino(&self) -> InodeNumber {
        self.vfs().root_ino()
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.vfs().getattr(ino)
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        self.vfs().lookup(parent, name)
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        self.vfs().readdir(ino, offset)
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.vfs().read(ino, offset, size)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        self.vfs().readlink(ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemBlockSource;

    #[test]
    fn default_options_are_strict() {
        let tree = OpenOptions::default().tree_options();
        assert!(tree.verify_checksums);
        assert!(tree.check_owner);
        assert!(tree.check_key_order);
        assert!(tree.cache_nodes);
    }

    #[test]
    fn skip_validation_turns_off_integrity_checks() {
        let options = OpenOptions {
            skip_validation: true,
            ..OpenOptions::default()
        };
        let tree = options.tree_options();
        assert!(!tree.verify_checksums);
        assert!(!tree.check_owner);
        assert!(!tree.check_key_order);
    }

    #[test]
    fn zeroed_image_is_unsupported() {
        let src = MemBlockSource::new(vec![0_u8; 128 * 1024]);
        assert!(matches!(
            detect_filesystem(&src),
            Err(DetectionError::UnsupportedImage)
        ));
    }

    #[test]
    fn short_image_is_unsupported_not_an_io_error() {
        let src = MemBlockSource::new(vec![0_u8; 100]);
        assert!(matches!(
            detect_filesystem(&src),
            Err(DetectionError::UnsupportedImage)
        ));
    }

    #[test]
    fn open_of_unknown_image_maps_to_unsupported_format() {
        let src: Arc<dyn BlockSource> = Arc::new(MemBlockSource::new(vec![0_u8; 4096]));
        let err = OpenFs::from_source(src, &OpenOptions::default()).unwrap_err();
        assert!(matches!(err, PfsError::UnsupportedFormat(_)));
    }
}
