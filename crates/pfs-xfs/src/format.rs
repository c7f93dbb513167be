//! XFS btrees as a [`TreeFormat`].
//!
//! Nodes are addressed by 512-byte disk address (`daddr`), which is also
//! what v5 headers record in `blkno`. Short-form trees (inobt, finobt)
//! store AG-relative block pointers; long-form trees (bmbt) store encoded
//! filesystem block numbers. Both are translated to `daddr` while decoding
//! so the engine never sees the on-disk pointer encoding.
//!
//! Internal nodes lay out all keys first and start the pointer array after
//! `maxrecs` key slots, not after `numrecs`.

use std::cmp::Ordering;
use std::sync::Arc;

use pfs_btree::{
    DuplicateKeys, ExtendedHeader, HeaderVersion, IndexEntry, InternalNode, KeyCodec, LeafEntry,
    LeafNode, LevelPolicy, Node, NodeHeader, NodeKind, NodeLayout, TreeFormat,
};
use pfs_ondisk::xfs::{
    XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC, XFS_BMBT_KEY_SIZE, XFS_BMBT_PTR_SIZE, XFS_BMBT_REC_SIZE,
    XFS_BTREE_LBLOCK_CRC_LEN, XFS_BTREE_LBLOCK_CRC_OFF, XFS_BTREE_LBLOCK_LEN, XFS_BTREE_MAXLEVELS,
    XFS_BTREE_SBLOCK_CRC_LEN, XFS_BTREE_SBLOCK_CRC_OFF, XFS_BTREE_SBLOCK_LEN, XFS_FIBT_CRC_MAGIC,
    XFS_FIBT_MAGIC, XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC, XFS_INOBT_KEY_SIZE, XFS_INOBT_PTR_SIZE,
    XFS_INOBT_REC_SIZE, XfsBmbtRec, XfsBtreeHeader, XfsInobtRec, XfsSuperblock,
    verify_xfs_block_crc,
};
use pfs_types::{NodeRef, ParseError, ensure_slice, read_be_u32, read_be_u64};
use serde::{Deserialize, Serialize};

/// Which XFS btree a format instance decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XfsTreeKind {
    /// Inode allocation btree (`IABT` / `IAB3`).
    Inode,
    /// Free-inode btree (`FIBT` / `FIB3`).
    FreeInode,
    /// Per-inode block map (`BMAP` / `BMA3`).
    BlockMap,
}

impl XfsTreeKind {
    #[must_use]
    pub fn magic(self, has_crc: bool) -> u32 {
        match (self, has_crc) {
            (Self::Inode, false) => XFS_IBT_MAGIC,
            (Self::Inode, true) => XFS_IBT_CRC_MAGIC,
            (Self::FreeInode, false) => XFS_FIBT_MAGIC,
            (Self::FreeInode, true) => XFS_FIBT_CRC_MAGIC,
            (Self::BlockMap, false) => XFS_BMAP_MAGIC,
            (Self::BlockMap, true) => XFS_BMAP_CRC_MAGIC,
        }
    }

    /// Long-form headers carry 64-bit filesystem block pointers.
    #[must_use]
    pub fn long_form(self) -> bool {
        matches!(self, Self::BlockMap)
    }

    fn key_size(self) -> usize {
        if self.long_form() {
            XFS_BMBT_KEY_SIZE
        } else {
            XFS_INOBT_KEY_SIZE
        }
    }

    fn ptr_size(self) -> usize {
        if self.long_form() {
            XFS_BMBT_PTR_SIZE
        } else {
            XFS_INOBT_PTR_SIZE
        }
    }

    fn record_size(self) -> usize {
        if self.long_form() {
            XFS_BMBT_REC_SIZE
        } else {
            XFS_INOBT_REC_SIZE
        }
    }

    fn header_len(self, has_crc: bool) -> usize {
        match (self.long_form(), has_crc) {
            (false, false) => XFS_BTREE_SBLOCK_LEN,
            (false, true) => XFS_BTREE_SBLOCK_CRC_LEN,
            (true, false) => XFS_BTREE_LBLOCK_LEN,
            (true, true) => XFS_BTREE_LBLOCK_CRC_LEN,
        }
    }

    fn crc_offset(self) -> usize {
        if self.long_form() {
            XFS_BTREE_LBLOCK_CRC_OFF
        } else {
            XFS_BTREE_SBLOCK_CRC_OFF
        }
    }
}

/// Node geometry of one XFS btree kind.
#[must_use]
pub fn xfs_layout(kind: XfsTreeKind, blocksize: u32, has_crc: bool) -> NodeLayout {
    NodeLayout {
        version: if has_crc {
            HeaderVersion::Extended
        } else {
            HeaderVersion::Legacy
        },
        node_size: blocksize,
        header_len: kind.header_len(has_crc),
        leaf_record_width: kind.record_size(),
        internal_record_width: kind.key_size() + kind.ptr_size(),
        max_level: XFS_BTREE_MAXLEVELS,
        sibling_links: true,
        duplicates: DuplicateKeys::Forbidden,
        level_policy: LevelPolicy::StrictByOne,
    }
}

/// A decoded leaf record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XfsRecord {
    InodeChunk(XfsInobtRec),
    Extent(XfsBmbtRec),
}

impl XfsRecord {
    /// Search key: `startino` for inode chunks, `startoff` for extents.
    #[must_use]
    pub fn key(&self) -> u64 {
        match self {
            Self::InodeChunk(rec) => u64::from(rec.startino),
            Self::Extent(rec) => rec.startoff,
        }
    }

    #[must_use]
    pub fn as_inode_chunk(&self) -> Option<&XfsInobtRec> {
        match self {
            Self::InodeChunk(rec) => Some(rec),
            Self::Extent(_) => None,
        }
    }

    #[must_use]
    pub fn as_extent(&self) -> Option<&XfsBmbtRec> {
        match self {
            Self::Extent(rec) => Some(rec),
            Self::InodeChunk(_) => None,
        }
    }
}

/// Format of one XFS btree. Short-form trees are bound to their
/// allocation group.
#[derive(Debug, Clone)]
pub struct XfsTreeFormat {
    kind: XfsTreeKind,
    layout: NodeLayout,
    superblock: Arc<XfsSuperblock>,
    agno: u32,
}

impl XfsTreeFormat {
    /// inobt or finobt of allocation group `agno`.
    #[must_use]
    pub fn ag_btree(superblock: Arc<XfsSuperblock>, kind: XfsTreeKind, agno: u32) -> Self {
        Self {
            layout: xfs_layout(kind, superblock.blocksize, superblock.has_crc()),
            kind,
            superblock,
            agno,
        }
    }

    /// Block-map btree of a file.
    #[must_use]
    pub fn block_map(superblock: Arc<XfsSuperblock>) -> Self {
        Self::ag_btree(superblock, XfsTreeKind::BlockMap, 0)
    }

    #[must_use]
    pub fn kind(&self) -> XfsTreeKind {
        self.kind
    }

    #[must_use]
    pub fn superblock(&self) -> &XfsSuperblock {
        &self.superblock
    }

    /// Translate an on-disk block pointer into a node address.
    pub fn pointer(&self, raw: u64) -> Result<NodeRef, ParseError> {
        let out_of_range = ParseError::InvalidField {
            field: "btree_ptr",
            reason: "block pointer outside the filesystem",
        };
        let daddr = if self.kind.long_form() {
            let (agno, agbno) = self.superblock.split_fsbno(raw);
            if agno >= u64::from(self.superblock.agcount)
                || agbno >= u64::from(self.superblock.agblocks)
            {
                return Err(out_of_range);
            }
            self.superblock.fsbno_to_daddr(raw)
        } else {
            let agbno = u32::try_from(raw).map_err(|_| out_of_range.clone())?;
            if agbno >= self.superblock.agblocks {
                return Err(out_of_range);
            }
            self.superblock.agbno_to_daddr(self.agno, agbno)
        };
        daddr.map(NodeRef).ok_or(ParseError::IntegerConversion {
            field: "btree_ptr",
        })
    }

    fn node_header(&self, header: &XfsBtreeHeader) -> Result<NodeHeader, ParseError> {
        Ok(NodeHeader {
            magic: header.magic,
            level: header.level,
            record_count: u32::from(header.numrecs),
            left_sibling: header.leftsib.map(|p| self.pointer(p)).transpose()?,
            right_sibling: header.rightsib.map(|p| self.pointer(p)).transpose()?,
            extended: header.crc_fields.map(|crc| ExtendedHeader {
                block_number: crc.blkno,
                lsn: crc.lsn,
                uuid: crc.uuid,
                owner: crc.owner,
                checksum: crc.crc,
            }),
        })
    }

    fn decode_record(&self, raw: &[u8]) -> Result<XfsRecord, ParseError> {
        if self.kind.long_form() {
            XfsBmbtRec::parse(raw).map(XfsRecord::Extent)
        } else {
            XfsInobtRec::parse(raw, self.superblock.has_sparse_inodes()).map(XfsRecord::InodeChunk)
        }
    }
}

impl KeyCodec for XfsTreeFormat {
    type Key = u64;

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u64, ParseError> {
        if self.kind.long_form() {
            read_be_u64(raw, 0)
        } else {
            read_be_u32(raw, 0).map(u64::from)
        }
    }

    fn matches_prefix(&self, candidate: &u64, prefix: &u64) -> bool {
        candidate == prefix
    }
}

impl TreeFormat for XfsTreeFormat {
    type Record = XfsRecord;

    fn name(&self) -> &'static str {
        match self.kind {
            XfsTreeKind::Inode => "xfs-inobt",
            XfsTreeKind::FreeInode => "xfs-finobt",
            XfsTreeKind::BlockMap => "xfs-bmbt",
        }
    }

    fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn locate(&self, node: NodeRef) -> Result<u64, ParseError> {
        node.0.checked_mul(512).ok_or(ParseError::IntegerConversion {
            field: "daddr",
        })
    }

    fn verify_checksum(&self, _node: NodeRef, raw: &[u8]) -> Result<(), ParseError> {
        verify_xfs_block_crc(raw, self.kind.crc_offset())
    }

    fn decode_node(&self, _node: NodeRef, raw: &[u8]) -> Result<Node<u64, XfsRecord>, ParseError> {
        let has_crc = self.superblock.has_crc();
        let header = if self.kind.long_form() {
            XfsBtreeHeader::parse_long(raw, has_crc)?
        } else {
            XfsBtreeHeader::parse_short(raw, has_crc)?
        };
        let expected = self.kind.magic(has_crc);
        if header.magic != expected {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected),
                actual: u64::from(header.magic),
            });
        }

        let count = usize::from(header.numrecs);
        let node_kind = if header.level == 0 {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        };
        self.layout.check_record_count(node_kind, count)?;
        let node_header = self.node_header(&header)?;
        let base = self.layout.header_len;

        if node_kind == NodeKind::Leaf {
            let width = self.kind.record_size();
            let entries = (0..count)
                .map(|idx| {
                    let record = self.decode_record(ensure_slice(raw, base + idx * width, width)?)?;
                    Ok(LeafEntry {
                        key: record.key(),
                        record,
                    })
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            return Ok(Node::Leaf(LeafNode {
                header: node_header,
                entries,
            }));
        }

        let key_size = self.kind.key_size();
        let ptr_size = self.kind.ptr_size();
        let ptr_base = base + self.layout.capacity(NodeKind::Internal) * key_size;
        let entries = (0..count)
            .map(|idx| {
                let key = self.decode_key(ensure_slice(raw, base + idx * key_size, key_size)?)?;
                let at = ptr_base + idx * ptr_size;
                let raw_ptr = if self.kind.long_form() {
                    read_be_u64(raw, at)?
                } else {
                    u64::from(read_be_u32(raw, at)?)
                };
                Ok(IndexEntry {
                    key,
                    child: self.pointer(raw_ptr)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Node::Internal(InternalNode {
            header: node_header,
            entries,
        }))
    }

    fn check_identity(&self, node: NodeRef, header: &NodeHeader) -> Result<(), String> {
        let Some(extended) = header.extended else {
            return Ok(());
        };
        if extended.block_number != node.0 {
            return Err(format!(
                "blkno {} does not match daddr {}",
                extended.block_number, node.0
            ));
        }
        if extended.uuid != self.superblock.metadata_uuid() {
            return Err("uuid does not match superblock".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock(version: u16) -> Arc<XfsSuperblock> {
        Arc::new(XfsSuperblock {
            blocksize: 4096,
            dblocks: 128,
            uuid: pfs_types::FsUuid([0x5A; 16]),
            rootino: 128,
            agblocks: 64,
            agcount: 2,
            version,
            sectsize: 512,
            inodesize: 512,
            inopblock: 8,
            fname: String::new(),
            blocklog: 12,
            sectlog: 9,
            inodelog: 9,
            inopblog: 3,
            agblklog: 6,
            icount: 0,
            ifree: 0,
            features_ro_compat: 0,
            features_incompat: 0,
            meta_uuid: pfs_types::FsUuid::NIL,
        })
    }

    #[test]
    fn internal_pointers_follow_maxrecs_keys() {
        let layout = xfs_layout(XfsTreeKind::Inode, 4096, true);
        assert_eq!(layout.header_len, 56);
        assert_eq!(layout.capacity(NodeKind::Internal), (4096 - 56) / 8);
        assert_eq!(layout.capacity(NodeKind::Leaf), (4096 - 56) / 16);

        let long = xfs_layout(XfsTreeKind::BlockMap, 4096, false);
        assert_eq!(long.header_len, 24);
        assert_eq!(long.capacity(NodeKind::Internal), (4096 - 24) / 16);
        assert_eq!(long.version, HeaderVersion::Legacy);
    }

    #[test]
    fn short_pointers_are_ag_relative() {
        let format = XfsTreeFormat::ag_btree(superblock(5), XfsTreeKind::Inode, 1);
        // AG 1 starts at fs block 64; 8 sectors per 4K block.
        assert_eq!(format.pointer(3), Ok(NodeRef((64 + 3) * 8)));
        assert!(format.pointer(64).is_err());
    }

    #[test]
    fn long_pointers_are_encoded_fsbno() {
        let format = XfsTreeFormat::block_map(superblock(5));
        let fsbno = (1_u64 << 6) | 10;
        assert_eq!(format.pointer(fsbno), Ok(NodeRef((64 + 10) * 8)));
        assert!(format.pointer((2_u64 << 6) | 1).is_err());
    }

    #[test]
    fn magic_depends_on_version() {
        assert_eq!(XfsTreeKind::FreeInode.magic(false), XFS_FIBT_MAGIC);
        assert_eq!(XfsTreeKind::BlockMap.magic(true), XFS_BMAP_CRC_MAGIC);
    }

    #[test]
    fn identity_is_skipped_on_v4() {
        let format = XfsTreeFormat::ag_btree(superblock(4), XfsTreeKind::Inode, 0);
        let header = NodeHeader {
            magic: XFS_IBT_MAGIC,
            level: 0,
            record_count: 0,
            left_sibling: None,
            right_sibling: None,
            extended: None,
        };
        assert!(format.check_identity(NodeRef(24), &header).is_ok());
    }
}
