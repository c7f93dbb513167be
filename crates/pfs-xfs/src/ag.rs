//! Allocation groups: AGI header plus the inode and free-inode btrees.

use std::sync::Arc;

use pfs_block::BlockSource;
use pfs_btree::{Subtree, Tree, TreeOptions, node_error, parse_error};
use pfs_error::{PfsError, Result};
use pfs_ondisk::xfs::{XFS_AGI_CRC_OFF, XFS_INODES_PER_CHUNK, verify_xfs_block_crc};
use pfs_ondisk::{XfsAgi, XfsInobtRec, XfsSuperblock};
use pfs_types::NodeRef;
use tracing::debug;

use crate::format::{XfsRecord, XfsTreeFormat, XfsTreeKind};

pub type XfsTree = Tree<XfsTreeFormat>;

fn ag_tree(
    superblock: &Arc<XfsSuperblock>,
    kind: XfsTreeKind,
    agno: u32,
    root: u32,
    level: u32,
    options: TreeOptions,
) -> Result<XfsTree> {
    let format = XfsTreeFormat::ag_btree(Arc::clone(superblock), kind, agno);
    let root = format
        .pointer(u64::from(root))
        .map_err(|err| parse_error("agi root", err))?;
    let level = u16::try_from(level.saturating_sub(1))
        .map_err(|_| PfsError::Parse(format!("agi level {level} out of range")))?;
    Ok(Tree::new(format, root)
        .with_options(options)
        .with_root_level(level)
        .with_owner(u64::from(agno)))
}

/// One allocation group's inode index.
#[derive(Debug)]
pub struct AllocationGroup {
    agno: u32,
    agi: XfsAgi,
    inobt: XfsTree,
    finobt: Option<XfsTree>,
}

impl AllocationGroup {
    /// Read and check the AGI of group `agno`, then bind its btrees.
    pub fn open(
        src: &dyn BlockSource,
        superblock: &Arc<XfsSuperblock>,
        agno: u32,
        options: TreeOptions,
    ) -> Result<Self> {
        if agno >= superblock.agcount {
            return Err(PfsError::InvalidGeometry(format!(
                "allocation group {agno} beyond agcount {}",
                superblock.agcount
            )));
        }
        let offset = superblock
            .agi_offset(agno)
            .ok_or_else(|| PfsError::InvalidGeometry(format!("agi {agno} offset overflows")))?;
        let sector = src.read_at(offset, usize::from(superblock.sectsize))?;
        let sector = sector.as_slice();
        let agi_ref = NodeRef(offset / 512);
        if superblock.has_crc() && options.verify_checksums {
            verify_xfs_block_crc(sector, XFS_AGI_CRC_OFF).map_err(|err| node_error(agi_ref, err))?;
        }
        let agi = XfsAgi::parse(sector, superblock.has_crc()).map_err(|err| node_error(agi_ref, err))?;
        if agi.seqno != agno {
            return Err(PfsError::Corruption {
                block: agi_ref.0,
                detail: format!("agi seqno {} in allocation group {agno}", agi.seqno),
            });
        }
        if superblock.has_crc() && agi.uuid != superblock.metadata_uuid() {
            return Err(PfsError::Corruption {
                block: agi_ref.0,
                detail: "agi uuid does not match superblock".to_owned(),
            });
        }

        let inobt = ag_tree(superblock, XfsTreeKind::Inode, agno, agi.root, agi.level, options)?;
        let finobt = if agi.has_finobt() {
            Some(ag_tree(
                superblock,
                XfsTreeKind::FreeInode,
                agno,
                agi.free_root,
                agi.free_level,
                options,
            )?)
        } else {
            None
        };
        debug!(
            agno,
            inodes = agi.count,
            free = agi.freecount,
            finobt = finobt.is_some(),
            "xfs_ag_open"
        );
        Ok(Self {
            agno,
            agi,
            inobt,
            finobt,
        })
    }

    #[must_use]
    pub fn agno(&self) -> u32 {
        self.agno
    }

    #[must_use]
    pub fn agi(&self) -> &XfsAgi {
        &self.agi
    }

    #[must_use]
    pub fn inode_btree(&self) -> &XfsTree {
        &self.inobt
    }

    #[must_use]
    pub fn free_inode_btree(&self) -> Option<&XfsTree> {
        self.finobt.as_ref()
    }

    /// The inode chunk whose 64-inode span contains `agino`.
    pub fn inode_chunk(&self, src: &dyn BlockSource, agino: u32) -> Result<Option<XfsInobtRec>> {
        let Some(entry) = self.inobt.find_floor(src, &u64::from(agino))? else {
            return Ok(None);
        };
        Ok(entry
            .record
            .as_inode_chunk()
            .copied()
            .filter(|chunk| chunk.covers(agino)))
    }

    /// Whether `agino` is an allocated inode. Inodes outside every chunk
    /// and inodes in sparse holes are not.
    pub fn is_allocated(&self, src: &dyn BlockSource, agino: u32) -> Result<bool> {
        Ok(self
            .inode_chunk(src, agino)?
            .is_some_and(|chunk| chunk.is_allocated(agino - chunk.startino)))
    }

    /// AG inode numbers of every free inode, ascending. Reads the finobt
    /// when the group has one and falls back to the full inobt.
    pub fn free_inodes(&self, src: &dyn BlockSource) -> Result<Vec<u32>> {
        let tree = self.finobt.as_ref().unwrap_or(&self.inobt);
        let mut free = Vec::new();
        for entry in tree.iter_from(src, &0) {
            let entry = entry?;
            let Some(chunk) = entry.record.as_inode_chunk() else {
                continue;
            };
            free.extend(
                (0..XFS_INODES_PER_CHUNK)
                    .filter(|idx| !chunk.is_hole(*idx) && (chunk.free >> idx) & 1 == 1)
                    .map(|idx| chunk.startino + idx),
            );
        }
        Ok(free)
    }

    /// Every node of the inode btree, loaded eagerly.
    pub fn load_inode_btree(&self, src: &dyn BlockSource) -> Result<Subtree<u64, XfsRecord>> {
        self.inobt
            .load_all(src)?
            .ok_or_else(|| PfsError::NotFound(format!("inode btree of AG {}", self.agno)))
    }
}
