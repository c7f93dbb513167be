//! Volume bootstrap: superblock → sys_chunk_array → chunk tree → root tree.

use std::sync::Arc;

use pfs_block::{BlockSource, read_btrfs_superblock_region};
use pfs_btree::{LeafEntry, Tree, TreeOptions, node_error, parse_error};
use pfs_error::{PfsError, Result};
use pfs_ondisk::btrfs::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_CHUNK_TREE_OBJECTID, BTRFS_FIRST_CHUNK_TREE_OBJECTID,
    BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID, BtrfsChunkEntry,
    BtrfsKey, BtrfsRootItem, BtrfsSuperblock, map_logical_to_physical, parse_sys_chunk_array,
    verify_tree_block_checksum,
};
use pfs_types::{BTRFS_SUPER_INFO_OFFSET, NodeRef};
use tracing::{debug, info};

use crate::format::{BtrfsTreeFormat, item_prefix};

pub type BtrfsTree = Tree<BtrfsTreeFormat>;

/// Mount-time geometry limits, as enforced by the kernel.
fn validate_superblock(sb: &BtrfsSuperblock) -> Result<()> {
    if sb.sectorsize < 512 || sb.sectorsize > 64 * 1024 {
        return Err(PfsError::InvalidGeometry(format!(
            "btrfs sectorsize {} out of range [512, 65536]",
            sb.sectorsize
        )));
    }
    if sb.nodesize < sb.sectorsize {
        return Err(PfsError::InvalidGeometry(format!(
            "btrfs nodesize {} smaller than sectorsize {}",
            sb.nodesize, sb.sectorsize
        )));
    }
    Ok(())
}

/// An opened btrfs volume: validated superblock, full chunk map and the
/// root tree of tree roots.
#[derive(Debug)]
pub struct BtrfsVolume {
    superblock: BtrfsSuperblock,
    format: BtrfsTreeFormat,
    options: TreeOptions,
    root_tree: BtrfsTree,
}

impl BtrfsVolume {
    pub fn open(src: &dyn BlockSource, options: TreeOptions) -> Result<Self> {
        let region = read_btrfs_superblock_region(src)?;
        let superblock = BtrfsSuperblock::parse_superblock_region(&region)
            .map_err(|err| parse_error("btrfs superblock", err))?;
        validate_superblock(&superblock)?;
        if options.verify_checksums {
            let at = u64::try_from(BTRFS_SUPER_INFO_OFFSET).unwrap_or(u64::MAX);
            verify_tree_block_checksum(&region, superblock.csum_type)
                .map_err(|err| node_error(NodeRef(at), err))?;
        }

        let sys_chunks = parse_sys_chunk_array(&superblock.sys_chunk_array)
            .map_err(|err| parse_error("sys_chunk_array", err))?;
        let bootstrap = BtrfsTreeFormat::new(
            superblock.nodesize,
            superblock.fsid,
            superblock.csum_type,
            sys_chunks.clone(),
        );

        let chunk_tree = Tree::new(bootstrap.clone(), NodeRef(superblock.chunk_root))
            .with_options(options)
            .with_root_level(u16::from(superblock.chunk_root_level))
            .with_owner(BTRFS_CHUNK_TREE_OBJECTID);
        let chunks = read_chunk_map(src, &chunk_tree, sys_chunks)?;
        info!(
            fsid = ?superblock.fsid,
            label = %superblock.label,
            nodesize = superblock.nodesize,
            chunks = chunks.len(),
            "btrfs_volume_open"
        );

        let format = bootstrap.with_chunks(chunks);
        let root_tree = Tree::new(format.clone(), NodeRef(superblock.root))
            .with_options(options)
            .with_root_level(u16::from(superblock.root_level))
            .with_owner(BTRFS_ROOT_TREE_OBJECTID);
        Ok(Self {
            superblock,
            format,
            options,
            root_tree,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &BtrfsSuperblock {
        &self.superblock
    }

    #[must_use]
    pub fn chunks(&self) -> &[BtrfsChunkEntry] {
        self.format.chunks()
    }

    #[must_use]
    pub fn format(&self) -> &BtrfsTreeFormat {
        &self.format
    }

    #[must_use]
    pub fn root_tree(&self) -> &BtrfsTree {
        &self.root_tree
    }

    /// ROOT_ITEM of tree `tree_id`, if the root tree has one.
    pub fn root_item(&self, src: &dyn BlockSource, tree_id: u64) -> Result<Option<BtrfsRootItem>> {
        let Some(entry) = self
            .root_tree
            .find_first_prefix(src, &item_prefix(tree_id, BTRFS_ROOT_ITEM_KEY))?
        else {
            return Ok(None);
        };
        entry
            .record
            .root_item()
            .map(Some)
            .map_err(|err| parse_error("root item", err))
    }

    /// Open tree `tree_id` through its ROOT_ITEM.
    ///
    /// Subvolume and snapshot trees share nodes, so their owner field is
    /// not checked.
    pub fn open_tree(&self, src: &dyn BlockSource, tree_id: u64) -> Result<Option<BtrfsTree>> {
        let Some(root) = self.root_item(src, tree_id)? else {
            return Ok(None);
        };
        debug!(tree_id, bytenr = root.bytenr, level = root.level, "btrfs_tree_open");
        Ok(Some(
            Tree::new(self.format.clone(), NodeRef(root.bytenr))
                .with_options(self.options)
                .with_root_level(u16::from(root.level)),
        ))
    }

    /// The default subvolume (`FS_TREE`).
    pub fn fs_tree(&self, src: &dyn BlockSource) -> Result<BtrfsTree> {
        self.open_tree(src, BTRFS_FS_TREE_OBJECTID)?
            .ok_or_else(|| PfsError::NotFound("btrfs FS_TREE root item".to_owned()))
    }

    /// Read `buf.len()` bytes at logical address `logical`, splitting the
    /// read where it crosses chunk boundaries.
    pub fn read_logical(&self, src: &dyn BlockSource, logical: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = logical
                .checked_add(u64::try_from(done).unwrap_or(u64::MAX))
                .ok_or_else(|| PfsError::InvalidGeometry("logical read overflows".to_owned()))?;
            let chunk = self
                .chunks()
                .iter()
                .find(|chunk| chunk.contains(pos))
                .ok_or_else(|| {
                    PfsError::InvalidGeometry(format!("logical {pos} not covered by any chunk"))
                })?;
            let mapping = map_logical_to_physical(std::slice::from_ref(chunk), pos)
                .map_err(|err| parse_error("chunk mapping", err))?
                .ok_or_else(|| PfsError::InvalidGeometry(format!("logical {pos} unmapped")))?;
            let left_in_chunk = chunk
                .logical_start()
                .saturating_add(chunk.length)
                .saturating_sub(pos);
            let take = usize::try_from(left_in_chunk)
                .unwrap_or(usize::MAX)
                .min(buf.len() - done);
            src.read_exact_at(mapping.physical, &mut buf[done..done + take])?;
            done += take;
        }
        Ok(())
    }
}

/// Every CHUNK_ITEM in the chunk tree, merged with the bootstrap chunks
/// and sorted by logical start.
fn read_chunk_map(
    src: &dyn BlockSource,
    chunk_tree: &BtrfsTree,
    sys_chunks: Vec<BtrfsChunkEntry>,
) -> Result<Arc<[BtrfsChunkEntry]>> {
    let mut chunks = sys_chunks;
    let prefix = BtrfsKey::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0);
    for entry in chunk_tree.find(src, &prefix) {
        let LeafEntry { key, record } = entry?;
        let chunk = record
            .chunk()
            .map_err(|err| parse_error("chunk item", err))?;
        if !chunks.iter().any(|c| c.key.offset == key.offset) {
            chunks.push(chunk);
        }
    }
    chunks.sort_by_key(BtrfsChunkEntry::logical_start);
    Ok(chunks.into())
}

