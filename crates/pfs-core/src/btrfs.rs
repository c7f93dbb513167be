//! btrfs as a read-only filesystem: subvolume trees, directory indexes and
//! file extents.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;

use parking_lot::RwLock;
use pfs_block::BlockSource;
use pfs_btree::parse_error;
use pfs_btrfs::{
    BTRFS_DIR_INDEX_KEY, BTRFS_EXTENT_DATA_KEY, BTRFS_FS_TREE_OBJECTID, BTRFS_FT_BLKDEV,
    BTRFS_FT_CHRDEV, BTRFS_FT_DIR, BTRFS_FT_FIFO, BTRFS_FT_SOCK, BTRFS_FT_SYMLINK,
    BTRFS_INODE_ITEM_KEY, BTRFS_ROOT_ITEM_KEY, BtrfsDirItem, BtrfsFileExtentBody,
    BtrfsFileExtentItem, BtrfsInodeItem, BtrfsKey, BtrfsTimespec, BtrfsTree, BtrfsVolume,
    item_prefix,
};
use pfs_error::{PfsError, Result};
use pfs_types::InodeNumber;
use tracing::{debug, info};

use crate::OpenOptions;
use crate::dircache::{DIR_CACHE_CAPACITY, DirCache};
use crate::vfs::{
    DirEntry, FileType, InodeAttr, ReadOnlyFs, cookie, not_a_symlink, page, unix_time,
};

/// Low bits of a VFS inode number holding the btrfs object id. The tree id
/// sits above them, with the default subvolume stored as 0 so its inode
/// numbers equal its object ids.
const OBJECTID_BITS: u32 = 40;
const OBJECTID_MASK: u64 = (1 << OBJECTID_BITS) - 1;

/// An inode inside one subvolume tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtrfsInode {
    pub tree: u64,
    pub objectid: u64,
}

impl BtrfsInode {
    #[must_use]
    pub fn from_ino(ino: InodeNumber) -> Self {
        let tree = ino.0 >> OBJECTID_BITS;
        Self {
            tree: if tree == 0 { BTRFS_FS_TREE_OBJECTID } else { tree },
            objectid: ino.0 & OBJECTID_MASK,
        }
    }

    pub fn to_ino(self) -> Result<InodeNumber> {
        let tree = if self.tree == BTRFS_FS_TREE_OBJECTID {
            0
        } else {
            self.tree
        };
        if self.objectid > OBJECTID_MASK || tree >> (64 - OBJECTID_BITS) != 0 {
            return Err(PfsError::UnsupportedFeature(format!(
                "btrfs inode {} in tree {} does not fit a VFS inode number",
                self.objectid, self.tree
            )));
        }
        Ok(InodeNumber((tree << OBJECTID_BITS) | self.objectid))
    }
}

fn file_type(btrfs_type: u8) -> FileType {
    match btrfs_type {
        BTRFS_FT_DIR => FileType::Directory,
        BTRFS_FT_SYMLINK => FileType::Symlink,
        BTRFS_FT_CHRDEV => FileType::CharDevice,
        BTRFS_FT_BLKDEV => FileType::BlockDevice,
        BTRFS_FT_FIFO => FileType::Fifo,
        BTRFS_FT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timespec(ts: BtrfsTimespec) -> std::time::SystemTime {
    unix_time(ts.sec, ts.nsec)
}

/// `[lo, hi)` of file bytes covered by both `[start, start + len)` and
/// `[offset, end)`.
fn overlap(start: u64, len: u64, offset: u64, end: u64) -> Option<(u64, u64)> {
    let lo = start.max(offset);
    let hi = start.saturating_add(len).min(end);
    (lo < hi).then_some((lo, hi))
}

fn buf_range(offset: u64, lo: u64, hi: u64) -> Result<std::ops::Range<usize>> {
    let at = usize::try_from(lo - offset)
        .map_err(|_| PfsError::InvalidGeometry("read offset does not fit usize".to_owned()))?;
    let len = usize::try_from(hi - lo)
        .map_err(|_| PfsError::InvalidGeometry("read length does not fit usize".to_owned()))?;
    Ok(at..at + len)
}

/// An opened btrfs filesystem.
pub struct BtrfsFs {
    src: Arc<dyn BlockSource>,
    volume: BtrfsVolume,
    trees: RwLock<HashMap<u64, Arc<BtrfsTree>>>,
    dirs: Option<DirCache<BtrfsInode>>,
    root: BtrfsInode,
    root_ino: InodeNumber,
}

impl std::fmt::Debug for BtrfsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtrfsFs")
            .field("volume", &self.volume)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl BtrfsFs {
    pub fn open(src: Arc<dyn BlockSource>, options: &OpenOptions) -> Result<Self> {
        let volume = BtrfsVolume::open(&*src, options.tree_options())?;
        let fs_root = volume
            .root_item(&*src, BTRFS_FS_TREE_OBJECTID)?
            .ok_or_else(|| PfsError::NotFound("btrfs FS_TREE root item".to_owned()))?;
        info!(
            label = %volume.superblock().label,
            generation = volume.superblock().generation,
            root_dirid = fs_root.root_dirid,
            "btrfs_open"
        );
        let root = BtrfsInode {
            tree: BTRFS_FS_TREE_OBJECTID,
            objectid: fs_root.root_dirid,
        };
        Ok(Self {
            src,
            volume,
            trees: RwLock::new(HashMap::new()),
            dirs: options
                .cache_directories
                .then(|| DirCache::new(DIR_CACHE_CAPACITY)),
            root,
            root_ino: root.to_ino()?,
        })
    }

    #[must_use]
    pub fn volume(&self) -> &BtrfsVolume {
        &self.volume
    }

    /// Root directory of the default subvolume.
    #[must_use]
    pub fn root(&self) -> BtrfsInode {
        self.root
    }

    /// Subvolume tree `tree_id`, opened once and kept.
    pub fn tree(&self, tree_id: u64) -> Result<Arc<BtrfsTree>> {
        if let Some(tree) = self.trees.read().get(&tree_id) {
            return Ok(Arc::clone(tree));
        }
        let tree = self
            .volume
            .open_tree(&*self.src, tree_id)?
            .ok_or_else(|| PfsError::NotFound(format!("btrfs tree {tree_id}")))?;
        let mut trees = self.trees.write();
        Ok(Arc::clone(
            trees.entry(tree_id).or_insert_with(|| Arc::new(tree)),
        ))
    }

    pub fn inode_item(&self, inode: BtrfsInode) -> Result<BtrfsInodeItem> {
        let tree = self.tree(inode.tree)?;
        let key = BtrfsKey::new(inode.objectid, BTRFS_INODE_ITEM_KEY, 0);
        let entry = tree.find_first(&*self.src, &key)?.ok_or_else(|| {
            PfsError::NotFound(format!(
                "btrfs inode {} in tree {}",
                inode.objectid, inode.tree
            ))
        })?;
        entry
            .record
            .inode_item()
            .map_err(|err| parse_error("inode item", err))
    }

    fn attr(&self, inode: BtrfsInode, item: &BtrfsInodeItem) -> Result<InodeAttr> {
        Ok(InodeAttr {
            ino: inode.to_ino()?,
            size: item.size,
            blocks: item.nbytes / 512,
            atime: timespec(item.atime),
            mtime: timespec(item.mtime),
            ctime: timespec(item.ctime),
            crtime: timespec(item.otime),
            kind: FileType::from_mode(item.mode).unwrap_or(FileType::RegularFile),
            perm: u16::try_from(item.mode & 0o7777).unwrap_or_default(),
            nlink: item.nlink,
            uid: item.uid,
            gid: item.gid,
            rdev: u32::try_from(item.rdev).unwrap_or_default(),
            blksize: self.volume.superblock().sectorsize,
        })
    }

    /// Where a directory entry leads. Entries naming a subvolume point at
    /// its ROOT_ITEM; they resolve to the subvolume's root directory.
    fn dir_target(&self, dir: BtrfsInode, item: &BtrfsDirItem) -> Result<BtrfsInode> {
        match item.location.item_type {
            BTRFS_INODE_ITEM_KEY => Ok(BtrfsInode {
                tree: dir.tree,
                objectid: item.location.objectid,
            }),
            BTRFS_ROOT_ITEM_KEY => {
                let subvol = item.location.objectid;
                let root = self
                    .volume
                    .root_item(&*self.src, subvol)?
                    .ok_or_else(|| PfsError::NotFound(format!("btrfs subvolume {subvol}")))?;
                Ok(BtrfsInode {
                    tree: subvol,
                    objectid: root.root_dirid,
                })
            }
            other => Err(PfsError::Corruption {
                block: 0,
                detail: format!(
                    "directory {} entry points at key type {other}",
                    dir.objectid
                ),
            }),
        }
    }

    fn load_dir(&self, dir: BtrfsInode) -> Result<Vec<DirEntry>> {
        let item = self.inode_item(dir)?;
        if FileType::from_mode(item.mode) != Some(FileType::Directory) {
            return Err(PfsError::NotDirectory);
        }
        let tree = self.tree(dir.tree)?;
        let mut entries = Vec::new();
        for leaf in tree.find(&*self.src, &item_prefix(dir.objectid, BTRFS_DIR_INDEX_KEY)) {
            let leaf = leaf?;
            let items = leaf
                .record
                .dir_items()
                .map_err(|err| parse_error("dir index", err))?;
            for dir_item in items {
                let target = self.dir_target(dir, &dir_item)?;
                entries.push(DirEntry {
                    ino: target.to_ino()?,
                    offset: cookie(entries.len()),
                    kind: file_type(dir_item.file_type),
                    name: dir_item.name,
                });
            }
        }
        debug!(
            tree = dir.tree,
            objectid = dir.objectid,
            entries = entries.len(),
            "btrfs_list_dir"
        );
        Ok(entries)
    }

    /// Entries of directory `dir` in index order.
    pub fn list_dir(&self, dir: BtrfsInode) -> Result<Arc<[DirEntry]>> {
        match &self.dirs {
            Some(cache) => cache.get_or_load(dir, || self.load_dir(dir)),
            None => self.load_dir(dir).map(Into::into),
        }
    }

    /// Content of `inode` in `[offset, offset + size)`, cut at the file
    /// size. Holes and preallocated extents read as zeros.
    pub fn read_file(&self, inode: BtrfsInode, offset: u64, size: u32) -> Result<Vec<u8>> {
        let item = self.inode_item(inode)?;
        if FileType::from_mode(item.mode) == Some(FileType::Directory) {
            return Err(PfsError::IsDirectory);
        }
        self.read_content(inode, &item, offset, size)
    }

    fn read_content(
        &self,
        inode: BtrfsInode,
        item: &BtrfsInodeItem,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        if offset >= item.size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(u64::from(size)).min(item.size);
        let mut buf = vec![0_u8; buf_range(offset, offset, end)?.len()];
        let tree = self.tree(inode.tree)?;
        // Start at the extent covering `offset`, or the first one after it.
        let floor = BtrfsKey::new(inode.objectid, BTRFS_EXTENT_DATA_KEY, offset);
        let start = tree
            .find_floor(&*self.src, &floor)?
            .map(|leaf| leaf.key)
            .filter(|key| key.objectid == inode.objectid && key.item_type == BTRFS_EXTENT_DATA_KEY)
            .unwrap_or(floor);
        for leaf in tree.iter_from(&*self.src, &start) {
            let leaf = leaf?;
            if leaf.key.objectid != inode.objectid || leaf.key.item_type != BTRFS_EXTENT_DATA_KEY {
                break;
            }
            let file_pos = leaf.key.offset;
            if file_pos >= end {
                break;
            }
            let extent = leaf
                .record
                .file_extent()
                .map_err(|err| parse_error("file extent", err))?;
            self.copy_extent(&extent, file_pos, offset, &mut buf)?;
        }
        Ok(buf)
    }

    /// Copy the part of `extent` (at file position `file_pos`) that falls
    /// inside `buf`, which holds file bytes from `offset`.
    fn copy_extent(
        &self,
        extent: &BtrfsFileExtentItem,
        file_pos: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let end = offset + buf.len() as u64;
        let covered = match &extent.body {
            BtrfsFileExtentBody::Inline(_) if extent.compression != 0 => extent.ram_bytes,
            BtrfsFileExtentBody::Inline(data) => data.len() as u64,
            BtrfsFileExtentBody::Regular { num_bytes, .. } => *num_bytes,
        };
        let Some((lo, hi)) = overlap(file_pos, covered, offset, end) else {
            return Ok(());
        };
        if extent.compression != 0 {
            return Err(PfsError::UnsupportedFeature(format!(
                "btrfs compression type {}",
                extent.compression
            )));
        }
        if extent.encryption != 0 {
            return Err(PfsError::UnsupportedFeature(format!(
                "btrfs encryption type {}",
                extent.encryption
            )));
        }
        let dest = buf_range(offset, lo, hi)?;
        match &extent.body {
            BtrfsFileExtentBody::Inline(data) => {
                let from = buf_range(file_pos, lo, hi)?;
                buf[dest].copy_from_slice(&data[from]);
            }
            BtrfsFileExtentBody::Regular {
                disk_bytenr,
                offset: extent_offset,
                ..
            } => {
                if *disk_bytenr == 0 || extent.is_prealloc() {
                    return Ok(());
                }
                let logical = disk_bytenr
                    .checked_add(*extent_offset)
                    .and_then(|at| at.checked_add(lo - file_pos))
                    .ok_or_else(|| {
                        PfsError::InvalidGeometry("extent address overflows".to_owned())
                    })?;
                self.volume.read_logical(&*self.src, logical, &mut buf[dest])?;
            }
        }
        Ok(())
    }
}

impl ReadOnlyFs for BtrfsFs {
    fn root_ino(&self) -> InodeNumber {
        self.root_ino
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = BtrfsInode::from_ino(ino);
        let item = self.inode_item(inode)?;
        self.attr(inode, &item)
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let listing = self.list_dir(BtrfsInode::from_ino(parent))?;
        let wanted = name.as_encoded_bytes();
        let entry = listing
            .iter()
            .find(|entry| entry.name == wanted)
            .ok_or_else(|| PfsError::NotFound(name.to_string_lossy().into_owned()))?;
        self.getattr(entry.ino)
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let listing = self.list_dir(BtrfsInode::from_ino(ino))?;
        Ok(page(&listing, offset))
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.read_file(BtrfsInode::from_ino(ino), offset, size)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = BtrfsInode::from_ino(ino);
        let item = self.inode_item(inode)?;
        if FileType::from_mode(item.mode) != Some(FileType::Symlink) {
            return Err(not_a_symlink(ino));
        }
        let size = u32::try_from(item.size).unwrap_or(u32::MAX);
        self.read_content(inode, &item, 0, size)
    }
}
