//! HFS+ and HFSX as a read-only filesystem. Inode numbers are catalog
//! node ids; the root folder is id 2.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use pfs_block::BlockSource;
use pfs_error::{PfsError, Result};
use pfs_hfsplus::{
    HFS_ROOT_FOLDER_ID, HfsBsdInfo, HfsCatalogFile, HfsCatalogRecord, HfsDirEntry, HfsVolume,
    hfs_time_to_unix,
};
use pfs_types::InodeNumber;
use tracing::info;

use crate::OpenOptions;
use crate::dircache::{DIR_CACHE_CAPACITY, DirCache};
use crate::vfs::{
    DirEntry, FileType, InodeAttr, ReadOnlyFs, cookie, not_a_symlink, page, unix_time,
};

fn hfs_time(seconds: u32) -> SystemTime {
    unix_time(hfs_time_to_unix(seconds), 0)
}

/// Type and permission bits of a record. Volumes written without BSD
/// info carry a zero mode.
fn mode_of(permissions: &HfsBsdInfo, folder: bool) -> (FileType, u16) {
    let mode = u32::from(permissions.file_mode);
    let fallback = if folder {
        (FileType::Directory, 0o755)
    } else {
        (FileType::RegularFile, 0o644)
    };
    if mode == 0 {
        return fallback;
    }
    let kind = if folder {
        FileType::Directory
    } else {
        FileType::from_mode(mode).unwrap_or(FileType::RegularFile)
    };
    (kind, permissions.file_mode & 0o7777)
}

fn entry_kind(entry: &HfsDirEntry) -> FileType {
    match &entry.record {
        HfsCatalogRecord::File(file) => mode_of(&file.permissions, false).0,
        _ => FileType::Directory,
    }
}

/// An opened HFS+ or HFSX volume.
pub struct HfsFs {
    src: Arc<dyn BlockSource>,
    volume: HfsVolume,
    dirs: Option<DirCache<u32>>,
}

impl std::fmt::Debug for HfsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfsFs")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl HfsFs {
    pub fn open(src: Arc<dyn BlockSource>, options: &OpenOptions) -> Result<Self> {
        let volume = HfsVolume::open(&*src, options.tree_options())?;
        let header = volume.header();
        info!(
            hfsx = header.is_hfsx(),
            block_size = header.block_size,
            files = header.file_count,
            folders = header.folder_count,
            "hfsplus_open"
        );
        Ok(Self {
            src,
            volume,
            dirs: options
                .cache_directories
                .then(|| DirCache::new(DIR_CACHE_CAPACITY)),
        })
    }

    #[must_use]
    pub fn volume(&self) -> &HfsVolume {
        &self.volume
    }

    fn cnid(ino: InodeNumber) -> Result<u32> {
        u32::try_from(ino.0).map_err(|_| PfsError::NotFound(format!("catalog node {}", ino.0)))
    }

    /// Catalog record of `ino`, found through its thread.
    pub fn entry(&self, ino: InodeNumber) -> Result<HfsDirEntry> {
        let cnid = Self::cnid(ino)?;
        self.volume
            .record(&*self.src, cnid)?
            .ok_or_else(|| PfsError::NotFound(format!("catalog node {cnid}")))
    }

    fn attr(&self, entry: &HfsDirEntry) -> Result<InodeAttr> {
        let block_size = self.volume.header().block_size;
        match &entry.record {
            HfsCatalogRecord::Folder(folder) => {
                let (kind, perm) = mode_of(&folder.permissions, true);
                Ok(InodeAttr {
                    ino: InodeNumber(u64::from(folder.folder_id)),
                    size: u64::from(folder.valence) + 2,
                    blocks: 0,
                    atime: hfs_time(folder.access_date),
                    mtime: hfs_time(folder.content_mod_date),
                    ctime: hfs_time(folder.attribute_mod_date),
                    crtime: hfs_time(folder.create_date),
                    kind,
                    perm,
                    nlink: 2,
                    uid: folder.permissions.owner_id,
                    gid: folder.permissions.group_id,
                    rdev: 0,
                    blksize: block_size,
                })
            }
            HfsCatalogRecord::File(file) => {
                let (kind, perm) = mode_of(&file.permissions, false);
                let rdev = match kind {
                    FileType::BlockDevice | FileType::CharDevice => file.permissions.special,
                    _ => 0,
                };
                Ok(InodeAttr {
                    ino: InodeNumber(u64::from(file.file_id)),
                    size: file.data_fork.logical_size,
                    blocks: u64::from(file.data_fork.total_blocks) * u64::from(block_size) / 512,
                    atime: hfs_time(file.access_date),
                    mtime: hfs_time(file.content_mod_date),
                    ctime: hfs_time(file.attribute_mod_date),
                    crtime: hfs_time(file.create_date),
                    kind,
                    perm,
                    nlink: 1,
                    uid: file.permissions.owner_id,
                    gid: file.permissions.group_id,
                    rdev,
                    blksize: block_size,
                })
            }
            HfsCatalogRecord::FolderThread(_) | HfsCatalogRecord::FileThread(_) => {
                Err(PfsError::Corruption {
                    block: 0,
                    detail: format!("catalog entry {:?} is a thread record", entry.name),
                })
            }
        }
    }

    fn load_dir(&self, cnid: u32) -> Result<Vec<DirEntry>> {
        let children = self.volume.list_dir(&*self.src, cnid)?;
        Ok(children
            .into_iter()
            .enumerate()
            .map(|(idx, child)| DirEntry {
                ino: InodeNumber(u64::from(child.cnid())),
                offset: cookie(idx),
                kind: entry_kind(&child),
                name: child.name.into_bytes(),
            })
            .collect())
    }

    /// Children of folder `ino` in catalog order.
    pub fn list_dir(&self, ino: InodeNumber) -> Result<Arc<[DirEntry]>> {
        let cnid = Self::cnid(ino)?;
        match &self.dirs {
            Some(cache) => cache.get_or_load(cnid, || self.load_dir(cnid)),
            None => self.load_dir(cnid).map(Into::into),
        }
    }

    fn read_fork(&self, file: &HfsCatalogFile, offset: u64, size: u32) -> Result<Vec<u8>> {
        let left = file.data_fork.logical_size.saturating_sub(offset);
        let want = u64::from(size).min(left);
        let mut buf = vec![0_u8; usize::try_from(want).unwrap_or(usize::MAX)];
        let got = self.volume.read_file(&*self.src, file, offset, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }
}

impl ReadOnlyFs for HfsFs {
    fn root_ino(&self) -> InodeNumber {
        InodeNumber(u64::from(HFS_ROOT_FOLDER_ID))
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.attr(&self.entry(ino)?)
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let parent_cnid = Self::cnid(parent)?;
        let not_found = || PfsError::NotFound(name.to_string_lossy().into_owned());
        let Some(name) = name.to_str() else {
            return Err(not_found());
        };
        if let Some(child) = self.volume.lookup(&*self.src, parent_cnid, name)? {
            return self.attr(&child);
        }
        if self.entry(parent)?.is_folder() {
            Err(not_found())
        } else {
            Err(PfsError::NotDirectory)
        }
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        Ok(page(&self.list_dir(ino)?, offset))
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let entry = self.entry(ino)?;
        let file = entry.as_file().ok_or(PfsError::IsDirectory)?;
        self.read_fork(file, offset, size)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let entry = self.entry(ino)?;
        let file = entry
            .as_file()
            .filter(|file| mode_of(&file.permissions, false).0 == FileType::Symlink)
            .ok_or_else(|| not_a_symlink(ino))?;
        self.read_fork(file, 0, u32::try_from(file.data_fork.logical_size).unwrap_or(u32::MAX))
    }
}
