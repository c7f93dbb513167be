#![forbid(unsafe_code)]
//! HFS+ / HFSX volume header, B-tree node and catalog structures.
//!
//! All multi-byte fields are big-endian. B-tree nodes start with a 14-byte
//! node descriptor and end with a table of u16 record offsets growing
//! backwards from the end of the node.

use pfs_types::{
    HFSPLUS_SIGNATURE, HFSPLUS_VOLUME_HEADER_SIZE, HFSX_SIGNATURE, ParseError, ensure_slice,
    read_be_i16, read_be_u16, read_be_u32, read_be_u64, read_u8,
};
use serde::{Deserialize, Serialize};

pub const HFS_NODE_DESCRIPTOR_SIZE: usize = 14;
pub const HFS_HEADER_RECORD_SIZE: usize = 106;
pub const HFS_FORK_DATA_SIZE: usize = 80;
pub const HFS_EXTENT_KEY_LENGTH: u16 = 10;
pub const HFS_EXTENT_DENSITY: usize = 8;

pub const HFS_NODE_KIND_LEAF: i8 = -1;
pub const HFS_NODE_KIND_INDEX: i8 = 0;
pub const HFS_NODE_KIND_HEADER: i8 = 1;
pub const HFS_NODE_KIND_MAP: i8 = 2;

/// `kHFSBinaryCompare`: HFSX volume whose names compare as raw code units.
pub const HFS_KEY_COMPARE_BINARY: u8 = 0xBC;
/// `kHFSCaseFolding`
pub const HFS_KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const HFS_ATTR_BIG_KEYS: u32 = 1 << 1;
pub const HFS_ATTR_VARIABLE_INDEX_KEYS: u32 = 1 << 2;

pub const HFS_FOLDER_RECORD: i16 = 1;
pub const HFS_FILE_RECORD: i16 = 2;
pub const HFS_FOLDER_THREAD_RECORD: i16 = 3;
pub const HFS_FILE_THREAD_RECORD: i16 = 4;

pub const HFS_ROOT_PARENT_ID: u32 = 1;
pub const HFS_ROOT_FOLDER_ID: u32 = 2;
pub const HFS_EXTENTS_FILE_ID: u32 = 3;
pub const HFS_CATALOG_FILE_ID: u32 = 4;

pub const HFS_DATA_FORK: u8 = 0x00;
pub const HFS_RESOURCE_FORK: u8 = 0xFF;

/// Seconds between the HFS epoch (1904-01-01) and the Unix epoch.
pub const HFS_EPOCH_OFFSET: u64 = 2_082_844_800;
const HFS_MAX_NAME_UNITS: usize = 255;

// ── Volume header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [HfsExtentDescriptor; HFS_EXTENT_DENSITY],
}

impl HfsForkData {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, HFS_FORK_DATA_SIZE)?;
        Ok(Self {
            logical_size: read_be_u64(raw, 0)?,
            clump_size: read_be_u32(raw, 8)?,
            total_blocks: read_be_u32(raw, 12)?,
            extents: parse_extent_record(raw, 16)?,
        })
    }

    /// Blocks covered by the inline extent descriptors.
    #[must_use]
    pub fn inline_blocks(&self) -> u64 {
        self.extents
            .iter()
            .map(|extent| u64::from(extent.block_count))
            .sum()
    }
}

/// Parse the 8 extent descriptors of an extent record.
pub fn parse_extent_record(
    data: &[u8],
    offset: usize,
) -> Result<[HfsExtentDescriptor; HFS_EXTENT_DENSITY], ParseError> {
    let mut extents = [HfsExtentDescriptor {
        start_block: 0,
        block_count: 0,
    }; HFS_EXTENT_DENSITY];
    for (idx, slot) in extents.iter_mut().enumerate() {
        let at = offset + idx * 8;
        *slot = HfsExtentDescriptor {
            start_block: read_be_u32(data, at)?,
            block_count: read_be_u32(data, at + 4)?,
        };
    }
    Ok(extents)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsPlusVolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_catalog_id: u32,
    pub allocation_file: HfsForkData,
    pub extents_file: HfsForkData,
    pub catalog_file: HfsForkData,
    pub attributes_file: HfsForkData,
    pub startup_file: HfsForkData,
}

impl HfsPlusVolumeHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, HFSPLUS_VOLUME_HEADER_SIZE)?;
        let signature = read_be_u16(region, 0)?;
        if signature != HFSPLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFSPLUS_SIGNATURE),
                actual: u64::from(signature),
            });
        }
        let block_size = read_be_u32(region, 40)?;
        if !(512..=1 << 20).contains(&block_size) || !block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "blockSize",
                reason: "must be a power of two of at least 512",
            });
        }
        Ok(Self {
            signature,
            version: read_be_u16(region, 2)?,
            attributes: read_be_u32(region, 4)?,
            create_date: read_be_u32(region, 16)?,
            modify_date: read_be_u32(region, 20)?,
            file_count: read_be_u32(region, 32)?,
            folder_count: read_be_u32(region, 36)?,
            block_size,
            total_blocks: read_be_u32(region, 44)?,
            free_blocks: read_be_u32(region, 48)?,
            next_catalog_id: read_be_u32(region, 64)?,
            allocation_file: HfsForkData::parse(region, 112)?,
            extents_file: HfsForkData::parse(region, 192)?,
            catalog_file: HfsForkData::parse(region, 272)?,
            attributes_file: HfsForkData::parse(region, 352)?,
            startup_file: HfsForkData::parse(region, 432)?,
        })
    }

    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }
}

// ── B-tree nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsNodeDescriptor {
    pub f_link: u32,
    pub b_link: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
}

impl HfsNodeDescriptor {
    pub fn parse(node: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(node, 0, HFS_NODE_DESCRIPTOR_SIZE)?;
        let kind = i8::from_be_bytes([read_u8(node, 8)?]);
        if !(HFS_NODE_KIND_LEAF..=HFS_NODE_KIND_MAP).contains(&kind) {
            return Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown B-tree node kind",
            });
        }
        Ok(Self {
            f_link: read_be_u32(node, 0)?,
            b_link: read_be_u32(node, 4)?,
            kind,
            height: read_u8(node, 9)?,
            num_records: read_be_u16(node, 10)?,
        })
    }
}

/// The header record stored as record 0 of node 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl HfsHeaderRecord {
    pub fn parse(node: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(node, HFS_NODE_DESCRIPTOR_SIZE, HFS_HEADER_RECORD_SIZE)?;
        let node_size = read_be_u16(raw, 18)?;
        if !(512..=32768).contains(&node_size) || !node_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodeSize",
                reason: "must be a power of two in 512..=32768",
            });
        }
        Ok(Self {
            tree_depth: read_be_u16(raw, 0)?,
            root_node: read_be_u32(raw, 2)?,
            leaf_records: read_be_u32(raw, 6)?,
            first_leaf_node: read_be_u32(raw, 10)?,
            last_leaf_node: read_be_u32(raw, 14)?,
            node_size,
            max_key_length: read_be_u16(raw, 20)?,
            total_nodes: read_be_u32(raw, 22)?,
            free_nodes: read_be_u32(raw, 26)?,
            clump_size: read_be_u32(raw, 32)?,
            btree_type: read_u8(raw, 36)?,
            key_compare_type: read_u8(raw, 37)?,
            attributes: read_be_u32(raw, 38)?,
        })
    }

    #[must_use]
    pub fn has_variable_index_keys(&self) -> bool {
        self.attributes & HFS_ATTR_VARIABLE_INDEX_KEYS != 0
    }
}

/// Largest record count whose offset table still fits beside the descriptor.
#[must_use]
pub fn max_records(node_size: usize) -> usize {
    // One extra slot holds the free-space offset.
    (node_size.saturating_sub(HFS_NODE_DESCRIPTOR_SIZE) / 2).saturating_sub(1)
}

/// Byte ranges of the `num_records` records in `node`, validated against
/// the offset table and each other.
pub fn record_ranges(
    node: &[u8],
    num_records: u16,
) -> Result<Vec<std::ops::Range<usize>>, ParseError> {
    let count = usize::from(num_records);
    if count > max_records(node.len()) {
        return Err(ParseError::InvalidField {
            field: "numRecords",
            reason: "offset table exceeds node size",
        });
    }
    let table_start = node.len() - 2 * (count + 1);
    let offset_at = |idx: usize| -> Result<usize, ParseError> {
        Ok(usize::from(read_be_u16(node, node.len() - 2 * (idx + 1))?))
    };

    let mut ranges = Vec::with_capacity(count);
    for idx in 0..count {
        let start = offset_at(idx)?;
        let end = offset_at(idx + 1)?;
        if start < HFS_NODE_DESCRIPTOR_SIZE || end < start || end > table_start {
            return Err(ParseError::InvalidField {
                field: "record_offset",
                reason: "record offsets out of order or outside the node",
            });
        }
        ranges.push(start..end);
    }
    Ok(ranges)
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Catalog file key: parent folder id plus UTF-16 node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HfsCatalogKey {
    pub parent_id: u32,
    pub name: Vec<u16>,
}

impl HfsCatalogKey {
    #[must_use]
    pub fn new(parent_id: u32, name: &str) -> Self {
        Self {
            parent_id,
            name: name.encode_utf16().collect(),
        }
    }

    /// Parse a key at the start of `record`; returns the key and the number
    /// of bytes it occupies including the length prefix.
    pub fn parse(record: &[u8]) -> Result<(Self, usize), ParseError> {
        let key_length = usize::from(read_be_u16(record, 0)?);
        if key_length < 6 {
            return Err(ParseError::InvalidField {
                field: "keyLength",
                reason: "catalog key shorter than its fixed fields",
            });
        }
        let body = ensure_slice(record, 2, key_length)?;
        let parent_id = read_be_u32(body, 0)?;
        let name = parse_unistr(body, 4)?;
        if 6 + 2 * name.len() > key_length {
            return Err(ParseError::InvalidField {
                field: "nodeName",
                reason: "name overruns key length",
            });
        }
        Ok((Self { parent_id, name }, 2 + key_length))
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

/// Parse an `HFSUniStr255` at `offset`.
pub fn parse_unistr(data: &[u8], offset: usize) -> Result<Vec<u16>, ParseError> {
    let len = usize::from(read_be_u16(data, offset)?);
    if len > HFS_MAX_NAME_UNITS {
        return Err(ParseError::InvalidField {
            field: "HFSUniStr255",
            reason: "name longer than 255 units",
        });
    }
    let raw = ensure_slice(data, offset + 2, len * 2)?;
    Ok(raw
        .chunks_exact(2)
        .map(|unit| u16::from_be_bytes([unit[0], unit[1]]))
        .collect())
}

/// Extents-overflow file key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HfsExtentKey {
    pub fork_type: u8,
    pub file_id: u32,
    pub start_block: u32,
}

impl HfsExtentKey {
    pub fn parse(record: &[u8]) -> Result<(Self, usize), ParseError> {
        let key_length = read_be_u16(record, 0)?;
        if key_length != HFS_EXTENT_KEY_LENGTH {
            return Err(ParseError::InvalidField {
                field: "keyLength",
                reason: "extents key must be 10 bytes",
            });
        }
        Ok((
            Self {
                fork_type: read_u8(record, 2)?,
                file_id: read_be_u32(record, 4)?,
                start_block: read_be_u32(record, 8)?,
            },
            2 + usize::from(key_length),
        ))
    }
}

// ── Catalog records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsBsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Link count or device number, depending on the file type.
    pub special: u32,
}

impl HfsBsdInfo {
    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            owner_id: read_be_u32(data, offset)?,
            group_id: read_be_u32(data, offset + 4)?,
            admin_flags: read_u8(data, offset + 8)?,
            owner_flags: read_u8(data, offset + 9)?,
            file_mode: read_be_u16(data, offset + 10)?,
            special: read_be_u32(data, offset + 12)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsCatalogFolder {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub permissions: HfsBsdInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsCatalogFile {
    pub flags: u16,
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub permissions: HfsBsdInfo,
    pub data_fork: HfsForkData,
    pub resource_fork: HfsForkData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsCatalogThread {
    pub parent_id: u32,
    pub name: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HfsCatalogRecord {
    Folder(HfsCatalogFolder),
    File(HfsCatalogFile),
    FolderThread(HfsCatalogThread),
    FileThread(HfsCatalogThread),
}

impl HfsCatalogRecord {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let record_type = read_be_i16(data, 0)?;
        match record_type {
            HFS_FOLDER_RECORD => {
                ensure_slice(data, 0, 88)?;
                Ok(Self::Folder(HfsCatalogFolder {
                    flags: read_be_u16(data, 2)?,
                    valence: read_be_u32(data, 4)?,
                    folder_id: read_be_u32(data, 8)?,
                    create_date: read_be_u32(data, 12)?,
                    content_mod_date: read_be_u32(data, 16)?,
                    attribute_mod_date: read_be_u32(data, 20)?,
                    access_date: read_be_u32(data, 24)?,
                    permissions: HfsBsdInfo::parse(data, 32)?,
                }))
            }
            HFS_FILE_RECORD => {
                ensure_slice(data, 0, 248)?;
                Ok(Self::File(HfsCatalogFile {
                    flags: read_be_u16(data, 2)?,
                    file_id: read_be_u32(data, 8)?,
                    create_date: read_be_u32(data, 12)?,
                    content_mod_date: read_be_u32(data, 16)?,
                    attribute_mod_date: read_be_u32(data, 20)?,
                    access_date: read_be_u32(data, 24)?,
                    permissions: HfsBsdInfo::parse(data, 32)?,
                    data_fork: HfsForkData::parse(data, 88)?,
                    resource_fork: HfsForkData::parse(data, 168)?,
                }))
            }
            HFS_FOLDER_THREAD_RECORD | HFS_FILE_THREAD_RECORD => {
                let thread = HfsCatalogThread {
                    parent_id: read_be_u32(data, 4)?,
                    name: parse_unistr(data, 8)?,
                };
                Ok(if record_type == HFS_FOLDER_THREAD_RECORD {
                    Self::FolderThread(thread)
                } else {
                    Self::FileThread(thread)
                })
            }
            _ => Err(ParseError::InvalidField {
                field: "recordType",
                reason: "unknown catalog record type",
            }),
        }
    }

    #[must_use]
    pub fn is_thread(&self) -> bool {
        matches!(self, Self::FolderThread(_) | Self::FileThread(_))
    }

    /// Catalog node id of a folder or file record.
    #[must_use]
    pub fn cnid(&self) -> Option<u32> {
        match self {
            Self::Folder(folder) => Some(folder.folder_id),
            Self::File(file) => Some(file.file_id),
            Self::FolderThread(_) | Self::FileThread(_) => None,
        }
    }
}

/// Convert an HFS timestamp (seconds since 1904) to Unix seconds, clamping
/// pre-1970 dates to zero.
#[must_use]
pub fn hfs_time_to_unix(seconds: u32) -> u64 {
    u64::from(seconds).saturating_sub(HFS_EPOCH_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_header_bytes(signature: u16) -> [u8; HFSPLUS_VOLUME_HEADER_SIZE] {
        let mut vh = [0_u8; HFSPLUS_VOLUME_HEADER_SIZE];
        vh[0..2].copy_from_slice(&signature.to_be_bytes());
        vh[2..4].copy_from_slice(&4_u16.to_be_bytes());
        vh[40..44].copy_from_slice(&4096_u32.to_be_bytes());
        vh[44..48].copy_from_slice(&1024_u32.to_be_bytes());
        // catalog fork: 8192 bytes, one extent at block 10 for 2 blocks
        vh[272..280].copy_from_slice(&8192_u64.to_be_bytes());
        vh[284..288].copy_from_slice(&2_u32.to_be_bytes());
        vh[288..292].copy_from_slice(&10_u32.to_be_bytes());
        vh[292..296].copy_from_slice(&2_u32.to_be_bytes());
        vh
    }

    #[test]
    fn parse_volume_header_and_catalog_fork() {
        let vh = HfsPlusVolumeHeader::parse(&volume_header_bytes(HFSPLUS_SIGNATURE)).expect("vh");
        assert!(!vh.is_hfsx());
        assert_eq!(vh.block_size, 4096);
        assert_eq!(vh.catalog_file.logical_size, 8192);
        assert_eq!(vh.catalog_file.extents[0].start_block, 10);
        assert_eq!(vh.catalog_file.inline_blocks(), 2);

        let hfsx = HfsPlusVolumeHeader::parse(&volume_header_bytes(HFSX_SIGNATURE)).expect("vh");
        assert!(hfsx.is_hfsx());
    }

    #[test]
    fn volume_header_rejects_bad_signature() {
        let err = HfsPlusVolumeHeader::parse(&volume_header_bytes(0x4244)).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    fn node_with_records(node_size: usize, kind: i8, records: &[&[u8]]) -> Vec<u8> {
        let mut node = vec![0_u8; node_size];
        node[8] = kind.to_be_bytes()[0];
        node[10..12].copy_from_slice(&u16::try_from(records.len()).unwrap().to_be_bytes());
        let mut offset = HFS_NODE_DESCRIPTOR_SIZE;
        for (idx, record) in records.iter().enumerate() {
            node[offset..offset + record.len()].copy_from_slice(record);
            let slot = node_size - 2 * (idx + 1);
            node[slot..slot + 2].copy_from_slice(&u16::try_from(offset).unwrap().to_be_bytes());
            offset += record.len();
        }
        let slot = node_size - 2 * (records.len() + 1);
        node[slot..slot + 2].copy_from_slice(&u16::try_from(offset).unwrap().to_be_bytes());
        node
    }

    #[test]
    fn descriptor_and_record_ranges() {
        let node = node_with_records(512, HFS_NODE_KIND_LEAF, &[b"abcd", b"efghij"]);
        let desc = HfsNodeDescriptor::parse(&node).expect("descriptor");
        assert_eq!(desc.kind, HFS_NODE_KIND_LEAF);
        assert_eq!(desc.num_records, 2);
        let ranges = record_ranges(&node, desc.num_records).expect("ranges");
        assert_eq!(ranges, vec![14..18, 18..24]);
    }

    #[test]
    fn record_ranges_reject_out_of_order_offsets() {
        let mut node = node_with_records(512, HFS_NODE_KIND_LEAF, &[b"abcd", b"efgh"]);
        // Point record 1 before record 0.
        node[508..510].copy_from_slice(&10_u16.to_be_bytes());
        assert!(record_ranges(&node, 2).is_err());
    }

    #[test]
    fn record_count_bounded_by_offset_table() {
        let node = node_with_records(512, HFS_NODE_KIND_LEAF, &[]);
        assert_eq!(max_records(512), 248);
        let err = record_ranges(&node, 249).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "numRecords",
                ..
            }
        ));
    }

    #[test]
    fn descriptor_rejects_unknown_kind() {
        let mut node = vec![0_u8; 512];
        node[8] = 7;
        assert!(HfsNodeDescriptor::parse(&node).is_err());
    }

    #[test]
    fn header_record_fields() {
        let mut node = vec![0_u8; 4096];
        let h = HFS_NODE_DESCRIPTOR_SIZE;
        node[h..h + 2].copy_from_slice(&2_u16.to_be_bytes());
        node[h + 2..h + 6].copy_from_slice(&3_u32.to_be_bytes());
        node[h + 18..h + 20].copy_from_slice(&4096_u16.to_be_bytes());
        node[h + 20..h + 22].copy_from_slice(&516_u16.to_be_bytes());
        node[h + 37] = HFS_KEY_COMPARE_BINARY;
        let attributes = HFS_ATTR_BIG_KEYS | HFS_ATTR_VARIABLE_INDEX_KEYS;
        node[h + 38..h + 42].copy_from_slice(&attributes.to_be_bytes());
        let header = HfsHeaderRecord::parse(&node).expect("header");
        assert_eq!(header.tree_depth, 2);
        assert_eq!(header.root_node, 3);
        assert_eq!(header.node_size, 4096);
        assert_eq!(header.key_compare_type, HFS_KEY_COMPARE_BINARY);
        assert!(header.has_variable_index_keys());
    }

    fn catalog_key_bytes(parent: u32, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let key_length = u16::try_from(6 + 2 * units.len()).unwrap();
        let mut raw = key_length.to_be_bytes().to_vec();
        raw.extend_from_slice(&parent.to_be_bytes());
        raw.extend_from_slice(&u16::try_from(units.len()).unwrap().to_be_bytes());
        for unit in units {
            raw.extend_from_slice(&unit.to_be_bytes());
        }
        raw
    }

    #[test]
    fn catalog_key_round_trip() {
        let raw = catalog_key_bytes(2, "Documents");
        let (key, used) = HfsCatalogKey::parse(&raw).expect("key");
        assert_eq!(key, HfsCatalogKey::new(2, "Documents"));
        assert_eq!(used, raw.len());
        assert_eq!(key.name_lossy(), "Documents");
    }

    #[test]
    fn catalog_key_rejects_name_overrun() {
        let mut raw = catalog_key_bytes(2, "abc");
        // Claim a 4-unit name inside a 3-unit key.
        raw[6..8].copy_from_slice(&4_u16.to_be_bytes());
        raw.extend_from_slice(&[0, 0]);
        assert!(HfsCatalogKey::parse(&raw).is_err());
    }

    #[test]
    fn extent_key_parse() {
        let mut raw = vec![0_u8; 12];
        raw[0..2].copy_from_slice(&10_u16.to_be_bytes());
        raw[2] = HFS_RESOURCE_FORK;
        raw[4..8].copy_from_slice(&77_u32.to_be_bytes());
        raw[8..12].copy_from_slice(&16_u32.to_be_bytes());
        let (key, used) = HfsExtentKey::parse(&raw).expect("key");
        assert_eq!(used, 12);
        assert_eq!(key.fork_type, HFS_RESOURCE_FORK);
        assert_eq!(key.file_id, 77);
        assert_eq!(key.start_block, 16);

        raw[0..2].copy_from_slice(&8_u16.to_be_bytes());
        assert!(HfsExtentKey::parse(&raw).is_err());
    }

    #[test]
    fn catalog_records() {
        let mut folder = vec![0_u8; 88];
        folder[0..2].copy_from_slice(&HFS_FOLDER_RECORD.to_be_bytes());
        folder[4..8].copy_from_slice(&3_u32.to_be_bytes());
        folder[8..12].copy_from_slice(&18_u32.to_be_bytes());
        folder[42..44].copy_from_slice(&0o040_755_u16.to_be_bytes());
        let parsed = HfsCatalogRecord::parse(&folder).expect("folder");
        assert_eq!(parsed.cnid(), Some(18));
        let HfsCatalogRecord::Folder(f) = parsed else {
            panic!("expected folder");
        };
        assert_eq!(f.valence, 3);
        assert_eq!(f.permissions.file_mode, 0o040_755);

        let mut file = vec![0_u8; 248];
        file[0..2].copy_from_slice(&HFS_FILE_RECORD.to_be_bytes());
        file[8..12].copy_from_slice(&25_u32.to_be_bytes());
        file[88..96].copy_from_slice(&5_u64.to_be_bytes());
        let HfsCatalogRecord::File(f) = HfsCatalogRecord::parse(&file).expect("file") else {
            panic!("expected file");
        };
        assert_eq!(f.file_id, 25);
        assert_eq!(f.data_fork.logical_size, 5);

        let mut thread = vec![0_u8; 8];
        thread[0..2].copy_from_slice(&HFS_FOLDER_THREAD_RECORD.to_be_bytes());
        thread[4..8].copy_from_slice(&2_u32.to_be_bytes());
        thread.extend_from_slice(&2_u16.to_be_bytes());
        thread.extend_from_slice(&[0, b'h', 0, b'i']);
        let parsed = HfsCatalogRecord::parse(&thread).expect("thread");
        assert!(parsed.is_thread());
        assert_eq!(parsed.cnid(), None);

        let mut bogus = vec![0_u8; 88];
        bogus[0..2].copy_from_slice(&9_i16.to_be_bytes());
        assert!(HfsCatalogRecord::parse(&bogus).is_err());
    }

    #[test]
    fn epoch_conversion() {
        assert_eq!(hfs_time_to_unix(0), 0);
        assert_eq!(
            hfs_time_to_unix(u32::try_from(HFS_EPOCH_OFFSET + 10).unwrap()),
            10
        );
    }
}
