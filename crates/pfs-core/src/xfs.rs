//! XFS inode indexes, block maps and file content over a shared source.
//!
//! Inodes are found through the per-AG inode btrees and decoded from
//! their on-disk core; file bytes come from the data fork (inline, extent
//! list or bmbt). Directory blocks are not decoded, so `lookup` and
//! `readdir` report [`PfsError::UnsupportedFeature`].

use std::ffi::OsStr;
use std::sync::Arc;

use pfs_block::BlockSource;
use pfs_error::{PfsError, Result};
use pfs_types::InodeNumber;
use pfs_xfs::{
    BlockMap, DataFork, XfsBmbtRec, XfsDinode, XfsSuperblock, XfsTimestamp, XfsVolume,
};
use tracing::debug;

use crate::OpenOptions;
use crate::vfs::{DirEntry, FileType, InodeAttr, ReadOnlyFs, not_a_symlink, unix_time};

pub struct XfsFs {
    src: Arc<dyn BlockSource>,
    volume: XfsVolume,
}

impl std::fmt::Debug for XfsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XfsFs")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

fn timestamp(ts: XfsTimestamp) -> std::time::SystemTime {
    u64::try_from(ts.sec).map_or(std::time::UNIX_EPOCH, |secs| unix_time(secs, ts.nsec))
}

fn no_directories() -> PfsError {
    PfsError::UnsupportedFeature("xfs directory blocks".to_owned())
}

impl XfsFs {
    pub fn open(src: Arc<dyn BlockSource>, options: &OpenOptions) -> Result<Self> {
        let volume = XfsVolume::open(&*src, options.tree_options())?;
        Ok(Self { src, volume })
    }

    #[must_use]
    pub fn volume(&self) -> &XfsVolume {
        &self.volume
    }

    #[must_use]
    pub fn superblock(&self) -> &XfsSuperblock {
        self.volume.superblock()
    }

    #[must_use]
    pub fn root_ino(&self) -> InodeNumber {
        InodeNumber(self.superblock().rootino)
    }

    pub fn is_allocated(&self, ino: InodeNumber) -> Result<bool> {
        self.volume.is_allocated(&*self.src, ino.0)
    }

    /// Device byte offset of inode `ino`, `None` when it is free.
    pub fn inode_offset(&self, ino: InodeNumber) -> Result<Option<u64>> {
        self.volume.inode_offset(&*self.src, ino.0)
    }

    /// Every free inode of allocation group `agno`.
    pub fn free_inodes(&self, agno: u32) -> Result<Vec<InodeNumber>> {
        let group = self.volume.allocation_group(&*self.src, agno)?;
        let free = group.free_inodes(&*self.src)?;
        debug!(agno, free = free.len(), "xfs_free_inodes");
        Ok(free
            .into_iter()
            .map(|agino| InodeNumber(self.volume.make_ino(agno, agino)))
            .collect())
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<XfsDinode> {
        self.volume.read_inode(&*self.src, ino.0)
    }

    pub fn block_map(&self, ino: InodeNumber, root_fsbno: u64, root_level: u16) -> Result<BlockMap> {
        self.volume.block_map(ino.0, root_fsbno, root_level)
    }

    fn attr(&self, ino: InodeNumber, inode: &XfsDinode) -> InodeAttr {
        let mtime = timestamp(inode.mtime);
        InodeAttr {
            ino,
            size: inode.size,
            blocks: inode
                .nblocks
                .saturating_mul(u64::from(self.superblock().blocksize) / 512),
            atime: timestamp(inode.atime),
            mtime,
            ctime: timestamp(inode.ctime),
            crtime: inode.crtime.map_or(mtime, timestamp),
            kind: FileType::from_mode(u32::from(inode.mode)).unwrap_or(FileType::RegularFile),
            perm: inode.mode & 0o7777,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev: 0,
            blksize: self.superblock().blocksize,
        }
    }

    /// File bytes in `[offset, offset + size)`, cut at the inode size.
    fn read_content(
        &self,
        ino: InodeNumber,
        inode: &XfsDinode,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(u64::from(size)).min(inode.size);
        let len = usize::try_from(end - offset)
            .map_err(|_| PfsError::InvalidGeometry("read length overflows".to_owned()))?;
        match self.volume.data_fork(ino.0, inode)? {
            DataFork::Device => Ok(Vec::new()),
            DataFork::Local(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                let stop = start.saturating_add(len);
                data.get(start..stop).map(<[u8]>::to_vec).ok_or_else(|| {
                    PfsError::Structural {
                        block: 0,
                        detail: format!("inode {} inline data shorter than its size", ino.0),
                    }
                })
            }
            DataFork::Mapped(map) => {
                let mut buf = vec![0_u8; len];
                self.read_mapped(&map, offset, &mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Fill `buf` with file bytes from `offset` through `map`, one extent
    /// lookup per extent touched. Holes and unwritten extents read as
    /// zeros.
    pub fn read_mapped(&self, map: &BlockMap, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = u64::from(self.superblock().blocksize);
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PfsError::InvalidGeometry("file read overflows".to_owned()))?;
        let slot = |pos: u64| usize::try_from(pos - offset).unwrap_or(usize::MAX);

        let mut pos = offset;
        let mut current: Option<XfsBmbtRec> = None;
        while pos < end {
            let fileoff = pos / block_size;
            let extent = match current {
                Some(extent) if extent.startoff.saturating_add(extent.blockcount) > fileoff => {
                    extent
                }
                _ => match map.extent_from(&*self.src, fileoff)? {
                    Some(extent) => extent,
                    None => {
                        buf[slot(pos)..].fill(0);
                        break;
                    }
                },
            };
            current = Some(extent);

            let start = extent.startoff.saturating_mul(block_size);
            if start > pos {
                let stop = start.min(end);
                buf[slot(pos)..slot(stop)].fill(0);
                pos = stop;
                continue;
            }
            let stop = extent
                .startoff
                .saturating_add(extent.blockcount)
                .saturating_mul(block_size)
                .min(end);
            let dest = &mut buf[slot(pos)..slot(stop)];
            if extent.unwritten {
                dest.fill(0);
            } else {
                let at = map.extent_offset(&extent, fileoff)? + pos % block_size;
                self.src.read_exact_at(at, dest)?;
            }
            pos = stop;
        }
        Ok(())
    }
}

impl ReadOnlyFs for XfsFs {
    fn root_ino(&self) -> InodeNumber {
        InodeNumber(self.superblock().rootino)
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = self.inode(ino)?;
        Ok(self.attr(ino, &inode))
    }

    fn lookup(&self, _parent: InodeNumber, _name: &OsStr) -> Result<InodeAttr> {
        Err(no_directories())
    }

    fn readdir(&self, _ino: InodeNumber, _offset: u64) -> Result<Vec<DirEntry>> {
        Err(no_directories())
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inode = self.inode(ino)?;
        if FileType::from_mode(u32::from(inode.mode)) == Some(FileType::Directory) {
            return Err(PfsError::IsDirectory);
        }
        self.read_content(ino, &inode, offset, size)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.inode(ino)?;
        if FileType::from_mode(u32::from(inode.mode)) != Some(FileType::Symlink) {
            return Err(not_a_symlink(ino));
        }
        let size = u32::try_from(inode.size).unwrap_or(u32::MAX);
        self.read_content(ino, &inode, 0, size)
    }
}
