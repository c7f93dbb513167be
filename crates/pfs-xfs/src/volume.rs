//! Superblock handling and inode-number arithmetic.

use std::sync::Arc;

use pfs_block::{BlockSource, read_xfs_superblock_region};
use pfs_btree::{Tree, TreeOptions, node_error, parse_error};
use pfs_error::{PfsError, Result};
use pfs_ondisk::xfs::{XFS_DINODE_CRC_OFF, verify_xfs_block_crc};
use pfs_ondisk::{XfsBmbtRec, XfsBmdrBlock, XfsDinode, XfsForkFormat, XfsInobtRec, XfsSuperblock};
use pfs_types::{NodeRef, ParseError};
use tracing::{debug, info};

use crate::ag::{AllocationGroup, XfsTree};
use crate::format::XfsTreeFormat;

/// Offset of `sb_crc` in the v5 superblock.
const XFS_SB_CRC_OFF: usize = 224;

fn validate_superblock(sb: &XfsSuperblock) -> Result<()> {
    if sb.sectsize < 512 || !sb.sectsize.is_power_of_two() || u32::from(sb.sectsize) > sb.blocksize {
        return Err(PfsError::InvalidGeometry(format!(
            "xfs sector size {} invalid for block size {}",
            sb.sectsize, sb.blocksize
        )));
    }
    if sb.inodesize < 256 || !sb.inodesize.is_power_of_two() {
        return Err(PfsError::InvalidGeometry(format!(
            "xfs inode size {} invalid",
            sb.inodesize
        )));
    }
    if u32::from(sb.inodesize) * u32::from(sb.inopblock) != sb.blocksize
        || u32::from(sb.inopblock).trailing_zeros() != u32::from(sb.inopblog)
    {
        return Err(PfsError::InvalidGeometry(format!(
            "xfs inopblock {} disagrees with inode size {} and block size {}",
            sb.inopblock, sb.inodesize, sb.blocksize
        )));
    }
    let ag_total = u64::from(sb.agcount).saturating_mul(u64::from(sb.agblocks));
    if ag_total < sb.dblocks {
        return Err(PfsError::InvalidGeometry(format!(
            "xfs allocation groups cover {ag_total} blocks of {}",
            sb.dblocks
        )));
    }
    Ok(())
}

/// An opened XFS filesystem.
#[derive(Debug)]
pub struct XfsVolume {
    superblock: Arc<XfsSuperblock>,
    options: TreeOptions,
}

impl XfsVolume {
    pub fn open(src: &dyn BlockSource, options: TreeOptions) -> Result<Self> {
        let region = read_xfs_superblock_region(src)?;
        let superblock = XfsSuperblock::parse_superblock_region(&region)
            .map_err(|err| parse_error("xfs superblock", err))?;
        validate_superblock(&superblock)?;
        if superblock.has_crc() && options.verify_checksums {
            let sector = src.read_at(0, usize::from(superblock.sectsize))?;
            verify_xfs_block_crc(sector.as_slice(), XFS_SB_CRC_OFF)
                .map_err(|err| node_error(NodeRef(0), err))?;
        }
        info!(
            version = superblock.version,
            blocksize = superblock.blocksize,
            agcount = superblock.agcount,
            label = %superblock.fname,
            "xfs_volume_open"
        );
        Ok(Self {
            superblock: Arc::new(superblock),
            options,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &XfsSuperblock {
        &self.superblock
    }

    pub fn allocation_group(&self, src: &dyn BlockSource, agno: u32) -> Result<AllocationGroup> {
        AllocationGroup::open(src, &self.superblock, agno, self.options)
    }

    /// Split `ino` into its allocation group and AG-relative inode number.
    pub fn split_ino(&self, ino: u64) -> Result<(u32, u32)> {
        let (agno, agino) = self.superblock.split_ino(ino);
        let agno = u32::try_from(agno)
            .ok()
            .filter(|agno| *agno < self.superblock.agcount)
            .ok_or_else(|| PfsError::InvalidGeometry(format!("inode {ino} beyond last AG")))?;
        Ok((agno, agino))
    }

    #[must_use]
    pub fn make_ino(&self, agno: u32, agino: u32) -> u64 {
        (u64::from(agno) << self.superblock.agino_bits()) | u64::from(agino)
    }

    pub fn inode_chunk(&self, src: &dyn BlockSource, ino: u64) -> Result<Option<XfsInobtRec>> {
        let (agno, agino) = self.split_ino(ino)?;
        self.allocation_group(src, agno)?.inode_chunk(src, agino)
    }

    pub fn is_allocated(&self, src: &dyn BlockSource, ino: u64) -> Result<bool> {
        let (agno, agino) = self.split_ino(ino)?;
        self.allocation_group(src, agno)?.is_allocated(src, agino)
    }

    /// Byte offset of the on-disk inode `ino`, or `None` when the inode is
    /// not allocated.
    pub fn inode_offset(&self, src: &dyn BlockSource, ino: u64) -> Result<Option<u64>> {
        if !self.is_allocated(src, ino)? {
            return Ok(None);
        }
        let (agno, agino) = self.split_ino(ino)?;
        let sb = &self.superblock;
        let agbno = agino >> sb.inopblog;
        let index = u64::from(agino & ((1_u32 << sb.inopblog) - 1));
        let block = sb
            .agbno_to_daddr(agno, agbno)
            .and_then(|daddr| daddr.checked_mul(512))
            .and_then(|at| at.checked_add(index * u64::from(sb.inodesize)))
            .ok_or_else(|| PfsError::InvalidGeometry(format!("inode {ino} address overflows")))?;
        Ok(Some(block))
    }

    /// Decode the on-disk inode `ino`. Free inodes are `NotFound`.
    pub fn read_inode(&self, src: &dyn BlockSource, ino: u64) -> Result<XfsDinode> {
        let at = self
            .inode_offset(src, ino)?
            .ok_or_else(|| PfsError::NotFound(format!("xfs inode {ino}")))?;
        let block = NodeRef(at / 512);
        let raw = src.read_at(at, usize::from(self.superblock.inodesize))?;
        let raw = raw.as_slice();
        if self.superblock.has_crc() && self.options.verify_checksums {
            verify_xfs_block_crc(raw, XFS_DINODE_CRC_OFF).map_err(|err| node_error(block, err))?;
        }
        let inode = XfsDinode::parse(raw).map_err(|err| match err {
            ParseError::InvalidMagic { .. } => PfsError::Corruption {
                block: block.0,
                detail: format!("inode {ino}: {err}"),
            },
            other => node_error(block, other),
        })?;
        if self.options.check_owner {
            if let Some(recorded) = inode.ino.filter(|recorded| *recorded != ino) {
                return Err(PfsError::Corruption {
                    block: block.0,
                    detail: format!("inode {ino} records number {recorded}"),
                });
            }
        }
        debug!(ino, format = ?inode.format, size = inode.size, "xfs_read_inode");
        Ok(inode)
    }

    /// Content source of `inode`'s data fork.
    pub fn data_fork(&self, ino: u64, inode: &XfsDinode) -> Result<DataFork> {
        match inode.format {
            XfsForkFormat::Device => Ok(DataFork::Device),
            XfsForkFormat::Local => Ok(DataFork::Local(inode.data_fork.clone())),
            XfsForkFormat::Extents => {
                let extents = inode
                    .extent_list()
                    .map_err(|err| parse_error("xfs extent list", err))?;
                Ok(DataFork::Mapped(BlockMap {
                    ino,
                    superblock: Arc::clone(&self.superblock),
                    source: MapSource::List(extents),
                }))
            }
            XfsForkFormat::Btree => {
                let root = XfsBmdrBlock::parse(&inode.data_fork)
                    .map_err(|err| parse_error("xfs bmbt root", err))?;
                let mut subtrees = Vec::with_capacity(root.ptrs.len());
                for (first, ptr) in root.keys.iter().zip(&root.ptrs) {
                    subtrees.push((*first, self.bmbt(ino, *ptr, root.level - 1)?));
                }
                Ok(DataFork::Mapped(BlockMap {
                    ino,
                    superblock: Arc::clone(&self.superblock),
                    source: MapSource::Btree(subtrees),
                }))
            }
        }
    }

    /// Block map of inode `ino` whose bmbt root sits at filesystem block
    /// `root_fsbno`.
    pub fn block_map(&self, ino: u64, root_fsbno: u64, root_level: u16) -> Result<BlockMap> {
        Ok(BlockMap {
            ino,
            superblock: Arc::clone(&self.superblock),
            source: MapSource::Btree(vec![(0, self.bmbt(ino, root_fsbno, root_level)?)]),
        })
    }

    fn bmbt(&self, ino: u64, root_fsbno: u64, root_level: u16) -> Result<XfsTree> {
        let format = XfsTreeFormat::block_map(Arc::clone(&self.superblock));
        let root = format
            .pointer(root_fsbno)
            .map_err(|err| parse_error("bmbt root", err))?;
        Ok(Tree::new(format, root)
            .with_options(self.options)
            .with_root_level(root_level)
            .with_owner(ino))
    }
}

/// Where a file's content lives.
#[derive(Debug)]
pub enum DataFork {
    /// Device special file; no content.
    Device,
    /// Bytes stored in the inode itself.
    Local(Vec<u8>),
    Mapped(BlockMap),
}

#[derive(Debug)]
enum MapSource {
    /// Extent records copied out of the inode, in file-offset order.
    List(Vec<XfsBmbtRec>),
    /// bmbt subtrees with the first file offset each one covers.
    Btree(Vec<(u64, XfsTree)>),
}

/// Mapping from file block offsets to filesystem blocks for one inode.
#[derive(Debug)]
pub struct BlockMap {
    ino: u64,
    superblock: Arc<XfsSuperblock>,
    source: MapSource,
}

impl BlockMap {
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// The extent covering file block `fileoff`; `None` inside a hole.
    pub fn map_block(&self, src: &dyn BlockSource, fileoff: u64) -> Result<Option<XfsBmbtRec>> {
        Ok(self
            .extent_from(src, fileoff)?
            .filter(|extent| extent.covers(fileoff)))
    }

    /// The extent covering `fileoff`, or else the first one after it.
    pub fn extent_from(&self, src: &dyn BlockSource, fileoff: u64) -> Result<Option<XfsBmbtRec>> {
        let subtrees = match &self.source {
            MapSource::List(extents) => {
                let idx = extents.partition_point(|extent| {
                    extent.startoff.saturating_add(extent.blockcount) <= fileoff
                });
                return Ok(extents.get(idx).copied());
            }
            MapSource::Btree(subtrees) => subtrees,
        };
        let slot = subtrees
            .partition_point(|(first, _)| *first <= fileoff)
            .saturating_sub(1);
        let Some((_, tree)) = subtrees.get(slot) else {
            return Ok(None);
        };
        if let Some(entry) = tree.find_floor(src, &fileoff)? {
            if let Some(extent) = entry.record.as_extent().filter(|e| e.covers(fileoff)) {
                return Ok(Some(*extent));
            }
        }
        for (first, tree) in &subtrees[slot..] {
            for entry in tree.iter_from(src, &fileoff.max(*first)) {
                if let Some(extent) = entry?.record.as_extent() {
                    return Ok(Some(*extent));
                }
            }
        }
        Ok(None)
    }

    /// Device byte offset of file block `fileoff` inside `extent`.
    pub fn extent_offset(&self, extent: &XfsBmbtRec, fileoff: u64) -> Result<u64> {
        let sb = &self.superblock;
        let (_, agbno) = sb.split_fsbno(extent.startblock);
        if agbno.saturating_add(extent.blockcount) > u64::from(sb.agblocks) {
            return Err(PfsError::Corruption {
                block: extent.startblock,
                detail: format!(
                    "inode {} extent at file block {} crosses its allocation group",
                    self.ino, extent.startoff
                ),
            });
        }
        extent
            .startblock
            .checked_add(fileoff.saturating_sub(extent.startoff))
            .and_then(|fsbno| sb.fsbno_to_daddr(fsbno))
            .and_then(|daddr| daddr.checked_mul(512))
            .ok_or_else(|| {
                PfsError::InvalidGeometry(format!(
                    "inode {} file block {fileoff} overflows",
                    self.ino
                ))
            })
    }

    /// Byte offset on the device of file block `fileoff`. Holes and
    /// unwritten extents read as zeros and map to `None`.
    pub fn block_offset(&self, src: &dyn BlockSource, fileoff: u64) -> Result<Option<u64>> {
        match self.map_block(src, fileoff)? {
            Some(extent) if !extent.unwritten => self.extent_offset(&extent, fileoff).map(Some),
            _ => Ok(None),
        }
    }

    /// All extents in file-offset order.
    pub fn extents(&self, src: &dyn BlockSource) -> Result<Vec<XfsBmbtRec>> {
        let subtrees = match &self.source {
            MapSource::List(extents) => return Ok(extents.clone()),
            MapSource::Btree(subtrees) => subtrees,
        };
        let mut out = Vec::new();
        for (idx, (first, tree)) in subtrees.iter().enumerate() {
            // Leaf sibling links run across subtrees; stop at the next one.
            let end = subtrees.get(idx + 1).map_or(u64::MAX, |(next, _)| *next);
            for entry in tree.iter_from(src, first) {
                let entry = entry?;
                let Some(extent) = entry.record.as_extent() else {
                    continue;
                };
                if extent.startoff >= end {
                    break;
                }
                out.push(*extent);
            }
        }
        Ok(out)
    }
}
