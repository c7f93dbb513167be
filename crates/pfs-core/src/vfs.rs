//! Read-only VFS semantics shared by every filesystem context.
//!
//! Each context maps its own identifiers onto [`InodeNumber`] and answers
//! the [`ReadOnlyFs`] operations; callers such as the CLI never see the
//! on-disk structures behind them.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pfs_error::{PfsError, Result};
use pfs_types::{
    InodeNumber, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// File type held in the `S_IFMT` bits of `mode`.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::RegularFile),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::RegularFile => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::BlockDevice => S_IFBLK,
            Self::CharDevice => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }
}

/// Inode attributes in the shape FUSE and `stat(2)` expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    /// Allocated size in 512-byte units.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileType,
    /// Permission bits, without the file type.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// One directory entry. `offset` is the cookie to pass back to
/// [`ReadOnlyFs::readdir`] to continue after this entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Read-only filesystem operations over inode numbers.
pub trait ReadOnlyFs: Send + Sync {
    /// Inode number of the root directory.
    fn root_ino(&self) -> InodeNumber;

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Child `name` of directory `parent`.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// Entries of directory `ino` after cookie `offset`; `0` starts from
    /// the beginning. `.` and `..` are not reported.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes of file content at `offset`; short at end of
    /// file.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    /// Walk a `/`-separated path from the root. Empty components and `.`
    /// are skipped.
    fn resolve_path(&self, path: &str) -> Result<InodeAttr> {
        let mut current = self.getattr(self.root_ino())?;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if current.kind != FileType::Directory {
                return Err(PfsError::NotDirectory);
            }
            current = self.lookup(current.ino, OsStr::new(component))?;
        }
        Ok(current)
    }
}

/// `SystemTime` for a Unix timestamp, clamped to the epoch on overflow.
pub(crate) fn unix_time(secs: u64, nanos: u32) -> SystemTime {
    Duration::from_secs(secs)
        .checked_add(Duration::from_nanos(u64::from(nanos)))
        .and_then(|since| UNIX_EPOCH.checked_add(since))
        .unwrap_or(UNIX_EPOCH)
}

/// Entries after cookie `offset` in a full listing.
pub(crate) fn page(entries: &[DirEntry], offset: u64) -> Vec<DirEntry> {
    let skip = usize::try_from(offset).unwrap_or(usize::MAX);
    entries.iter().skip(skip).cloned().collect()
}

/// Cookie of the entry at `index` in a listing.
pub(crate) fn cookie(index: usize) -> u64 {
    u64::try_from(index).map_or(u64::MAX, |i| i.saturating_add(1))
}

/// Error for `readlink` on anything but a symlink.
pub(crate) fn not_a_symlink(ino: InodeNumber) -> PfsError {
    PfsError::Parse(format!("inode {} is not a symbolic link", ino.0))
}
