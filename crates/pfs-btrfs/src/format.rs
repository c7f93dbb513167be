//! btrfs as a [`TreeFormat`].
//!
//! Every btrfs tree shares one node layout: a 101-byte header carrying the
//! checksum, fsid, logical address (`bytenr`), generation and owner,
//! followed by 25-byte item slots (leaves) or 33-byte key pointers
//! (internal nodes). Nodes are addressed by logical bytenr and located on
//! disk through the chunk map. There are no sibling links.

use std::cmp::Ordering;
use std::sync::Arc;

use pfs_btree::{
    DuplicateKeys, ExtendedHeader, HeaderVersion, IndexEntry, InternalNode, KeyCodec, LeafEntry,
    LeafNode, LevelPolicy, Node, NodeHeader, NodeLayout, TreeFormat,
};
use pfs_ondisk::btrfs::{
    BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE, BTRFS_MAX_LEVEL, BtrfsChunkEntry,
    BtrfsDirItem, BtrfsFileExtentItem, BtrfsHeader, BtrfsInodeItem, BtrfsItem, BtrfsKey,
    BtrfsRootItem, map_logical_to_physical, parse_chunk_item, parse_dir_items,
    parse_internal_items, parse_leaf_items, verify_tree_block_checksum,
};
use pfs_types::{FsUuid, NodeRef, ParseError};

/// A leaf item with its payload. Payload decoding is left to the caller,
/// since the item type decides the structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsRecord {
    item: BtrfsItem,
    payload: Arc<[u8]>,
}

impl BtrfsRecord {
    #[must_use]
    pub fn new(item: BtrfsItem, payload: &[u8]) -> Self {
        Self {
            item,
            payload: Arc::from(payload),
        }
    }

    #[must_use]
    pub fn item(&self) -> &BtrfsItem {
        &self.item
    }

    #[must_use]
    pub fn key(&self) -> BtrfsKey {
        self.item.key
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn inode_item(&self) -> Result<BtrfsInodeItem, ParseError> {
        BtrfsInodeItem::parse(&self.payload)
    }

    pub fn root_item(&self) -> Result<BtrfsRootItem, ParseError> {
        BtrfsRootItem::parse(&self.payload)
    }

    pub fn dir_items(&self) -> Result<Vec<BtrfsDirItem>, ParseError> {
        parse_dir_items(&self.payload)
    }

    pub fn file_extent(&self) -> Result<BtrfsFileExtentItem, ParseError> {
        BtrfsFileExtentItem::parse(&self.payload)
    }

    pub fn chunk(&self) -> Result<BtrfsChunkEntry, ParseError> {
        parse_chunk_item(&self.payload, self.item.key).map(|(chunk, _)| chunk)
    }
}

/// Node layout shared by all btrfs trees of a filesystem with `nodesize`.
#[must_use]
pub fn btrfs_layout(nodesize: u32) -> NodeLayout {
    NodeLayout {
        version: HeaderVersion::Extended,
        node_size: nodesize,
        header_len: BTRFS_HEADER_SIZE,
        leaf_record_width: BTRFS_ITEM_SIZE,
        internal_record_width: BTRFS_KEY_PTR_SIZE,
        max_level: u16::from(BTRFS_MAX_LEVEL),
        sibling_links: false,
        duplicates: DuplicateKeys::Forbidden,
        level_policy: LevelPolicy::StrictByOne,
    }
}

/// Key codec, node decoder and locator for one btrfs filesystem.
///
/// Cheap to clone: the chunk map is shared.
#[derive(Debug, Clone)]
pub struct BtrfsTreeFormat {
    layout: NodeLayout,
    fsid: FsUuid,
    csum_type: u16,
    chunks: Arc<[BtrfsChunkEntry]>,
}

impl BtrfsTreeFormat {
    #[must_use]
    pub fn new(
        nodesize: u32,
        fsid: FsUuid,
        csum_type: u16,
        chunks: impl Into<Arc<[BtrfsChunkEntry]>>,
    ) -> Self {
        Self {
            layout: btrfs_layout(nodesize),
            fsid,
            csum_type,
            chunks: chunks.into(),
        }
    }

    #[must_use]
    pub fn fsid(&self) -> FsUuid {
        self.fsid
    }

    #[must_use]
    pub fn chunks(&self) -> &[BtrfsChunkEntry] {
        &self.chunks
    }

    /// Same filesystem, different chunk map (used once the full chunk tree
    /// has been read).
    #[must_use]
    pub fn with_chunks(&self, chunks: impl Into<Arc<[BtrfsChunkEntry]>>) -> Self {
        Self {
            chunks: chunks.into(),
            ..self.clone()
        }
    }
}

/// `(objectid, type)` prefix of a key; the offset is the discriminator.
#[must_use]
pub fn item_prefix(objectid: u64, item_type: u8) -> BtrfsKey {
    BtrfsKey::new(objectid, item_type, 0)
}

impl KeyCodec for BtrfsTreeFormat {
    type Key = BtrfsKey;

    fn compare(&self, a: &BtrfsKey, b: &BtrfsKey) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<BtrfsKey, ParseError> {
        BtrfsKey::parse(raw, 0)
    }

    fn matches_prefix(&self, candidate: &BtrfsKey, prefix: &BtrfsKey) -> bool {
        candidate.same_item(prefix)
    }

    fn prefix_start(&self, prefix: &BtrfsKey) -> BtrfsKey {
        item_prefix(prefix.objectid, prefix.item_type)
    }
}

fn header_of(header: &BtrfsHeader) -> NodeHeader {
    NodeHeader {
        magic: 0,
        level: u16::from(header.level),
        record_count: header.nritems,
        left_sibling: None,
        right_sibling: None,
        extended: Some(ExtendedHeader {
            block_number: header.bytenr,
            lsn: header.generation,
            uuid: header.fsid,
            owner: header.owner,
            checksum: header.stored_crc32c(),
        }),
    }
}

impl TreeFormat for BtrfsTreeFormat {
    type Record = BtrfsRecord;

    fn name(&self) -> &'static str {
        "btrfs"
    }

    fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn locate(&self, node: NodeRef) -> Result<u64, ParseError> {
        map_logical_to_physical(&self.chunks, node.0)?
            .map(|mapping| mapping.physical)
            .ok_or(ParseError::InvalidField {
                field: "logical_address",
                reason: "not covered by any chunk",
            })
    }

    fn verify_checksum(&self, _node: NodeRef, raw: &[u8]) -> Result<(), ParseError> {
        verify_tree_block_checksum(raw, self.csum_type)
    }

    fn decode_node(
        &self,
        _node: NodeRef,
        raw: &[u8],
    ) -> Result<Node<BtrfsKey, BtrfsRecord>, ParseError> {
        let header = BtrfsHeader::parse_from_block(raw)?;
        header.validate(raw.len())?;
        if header.level == 0 {
            let (header, items) = parse_leaf_items(raw)?;
            let entries = items
                .iter()
                .map(|item| {
                    Ok(LeafEntry {
                        key: item.key,
                        record: BtrfsRecord::new(*item, item.payload(raw)?),
                    })
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(Node::Leaf(LeafNode {
                header: header_of(&header),
                entries,
            }))
        } else {
            let (header, ptrs) = parse_internal_items(raw)?;
            let entries = ptrs
                .iter()
                .map(|ptr| IndexEntry {
                    key: ptr.key,
                    child: NodeRef(ptr.blockptr),
                })
                .collect();
            Ok(Node::Internal(InternalNode {
                header: header_of(&header),
                entries,
            }))
        }
    }

    fn check_identity(&self, node: NodeRef, header: &NodeHeader) -> Result<(), String> {
        let Some(extended) = header.extended else {
            return Err("btrfs node without extended header".to_owned());
        };
        if extended.block_number != node.0 {
            return Err(format!(
                "bytenr {} does not match logical address {}",
                extended.block_number, node.0
            ));
        }
        if extended.uuid != self.fsid {
            return Err("fsid does not match superblock".to_owned());
        }
        Ok(())
    }
}
