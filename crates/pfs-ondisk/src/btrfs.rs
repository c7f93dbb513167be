#![forbid(unsafe_code)]

use std::cmp::Ordering;

use pfs_types::{
    BTRFS_CSUM_TYPE_CRC32C, BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, FsUuid,
    ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8,
    trim_nul_padded, u32_to_usize,
};
use serde::{Deserialize, Serialize};

pub const BTRFS_HEADER_SIZE: usize = 101;
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Size of a btrfs_key_ptr on disk (key:17 + blockptr:u64 + generation:u64).
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
/// Maximum tree depth in btrfs (levels 0-7).
pub const BTRFS_MAX_LEVEL: u8 = 7;
/// Size of a btrfs_disk_key on disk (objectid:u64 + type:u8 + offset:u64).
pub const BTRFS_DISK_KEY_SIZE: usize = 17;
/// The header checksum covers everything after the 32-byte csum field.
pub const BTRFS_CSUM_SIZE: usize = 0x20;

const BTRFS_SUPER_LABEL_OFFSET: usize = 0x12B;
const BTRFS_SUPER_LABEL_LEN: usize = 256;
const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Chunk header fields before the stripe array.
const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
/// devid:u64 + offset:u64 + dev_uuid:16
const BTRFS_STRIPE_SIZE: usize = 32;

// ── Well-known object ids and item types ────────────────────────────────────

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
/// First object id handed out to user inodes and subvolumes.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
pub const BTRFS_INODE_REF_KEY: u8 = 12;
pub const BTRFS_XATTR_ITEM_KEY: u8 = 24;
pub const BTRFS_DIR_ITEM_KEY: u8 = 84;
pub const BTRFS_DIR_INDEX_KEY: u8 = 96;
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;
pub const BTRFS_ROOT_REF_KEY: u8 = 156;
pub const BTRFS_DEV_ITEM_KEY: u8 = 216;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

pub const BTRFS_FT_UNKNOWN: u8 = 0;
pub const BTRFS_FT_REG_FILE: u8 = 1;
pub const BTRFS_FT_DIR: u8 = 2;
pub const BTRFS_FT_CHRDEV: u8 = 3;
pub const BTRFS_FT_BLKDEV: u8 = 4;
pub const BTRFS_FT_FIFO: u8 = 5;
pub const BTRFS_FT_SOCK: u8 = 6;
pub const BTRFS_FT_SYMLINK: u8 = 7;
pub const BTRFS_FT_XATTR: u8 = 8;

pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSuperblock {
    pub csum: [u8; 32],
    pub fsid: FsUuid,
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
}

impl BtrfsSuperblock {
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let stripesize = read_le_u32(region, 0x9C)?;
        if sectorsize == 0 || !sectorsize.is_power_of_two() || sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be a power of two up to 256K",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() || nodesize > 64 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be a power of two up to 64K",
            });
        }
        if usize::try_from(nodesize).map_or(true, |size| size <= BTRFS_HEADER_SIZE) {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than a tree block header",
            });
        }
        if stripesize != 0 && !stripesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "stripesize",
                reason: "must be zero or power of two",
            });
        }

        let root_level = read_u8(region, 0xC6)?;
        let chunk_root_level = read_u8(region, 0xC7)?;
        if root_level > BTRFS_MAX_LEVEL || chunk_root_level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "root_level",
                reason: "exceeds maximum tree depth",
            });
        }

        let sys_array_len = u32_to_usize(read_le_u32(region, 0xA0)?, "sys_chunk_array_size")?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let sys_chunk_array =
            ensure_slice(region, BTRFS_SYS_CHUNK_ARRAY_OFFSET, sys_array_len)?.to_vec();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: FsUuid(read_fixed::<16>(region, 0x20)?),
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            stripesize,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level,
            chunk_root_level,
            log_root_level: read_u8(region, 0xC8)?,
            label: trim_nul_padded(&read_fixed::<BTRFS_SUPER_LABEL_LEN>(
                region,
                BTRFS_SUPER_LABEL_OFFSET,
            )?),
            sys_chunk_array,
        })
    }

    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE)?;
        Self::parse_superblock_region(region)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Search key of every btrfs tree, ordered by `(objectid, item_type, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: read_u8(data, offset + 8)?,
            offset: read_le_u64(data, offset + 9)?,
        })
    }

    /// Whether `self` shares `(objectid, item_type)` with `other`.
    #[must_use]
    pub fn same_item(&self, other: &Self) -> bool {
        self.objectid == other.objectid && self.item_type == other.item_type
    }
}

impl Ord for BtrfsKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.objectid, self.item_type, self.offset).cmp(&(
            other.objectid,
            other.item_type,
            other.offset,
        ))
    }
}

impl PartialOrd for BtrfsKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── sys_chunk_array / chunk items ───────────────────────────────────────────

/// A single stripe within a btrfs chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: FsUuid,
}

/// A chunk mapping a logical range onto device stripes. Parsed from the
/// superblock's sys_chunk_array or from CHUNK_ITEM payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsChunkEntry {
    pub key: BtrfsKey,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

impl BtrfsChunkEntry {
    #[must_use]
    pub fn logical_start(&self) -> u64 {
        self.key.offset
    }

    #[must_use]
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.key.offset && logical - self.key.offset < self.length
    }
}

/// Parse one `btrfs_chunk` body at the start of `data`; returns the entry
/// and the number of bytes consumed.
pub fn parse_chunk_item(data: &[u8], key: BtrfsKey) -> Result<(BtrfsChunkEntry, usize), ParseError> {
    ensure_slice(data, 0, BTRFS_CHUNK_FIXED_SIZE)?;
    let length = read_le_u64(data, 0)?;
    let owner = read_le_u64(data, 8)?;
    let stripe_len = read_le_u64(data, 16)?;
    let chunk_type = read_le_u64(data, 24)?;
    let num_stripes = read_le_u16(data, 44)?;
    let sub_stripes = read_le_u16(data, 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }
    if length == 0 {
        return Err(ParseError::InvalidField {
            field: "chunk_length",
            reason: "chunk covers no bytes",
        });
    }

    let count = usize::from(num_stripes);
    let table = ensure_slice(data, BTRFS_CHUNK_FIXED_SIZE, count * BTRFS_STRIPE_SIZE)?;
    let mut stripes = Vec::with_capacity(count);
    for raw in table.chunks_exact(BTRFS_STRIPE_SIZE) {
        stripes.push(BtrfsStripe {
            devid: read_le_u64(raw, 0)?,
            offset: read_le_u64(raw, 8)?,
            dev_uuid: FsUuid(read_fixed::<16>(raw, 16)?),
        });
    }

    Ok((
        BtrfsChunkEntry {
            key,
            length,
            owner,
            stripe_len,
            chunk_type,
            num_stripes,
            sub_stripes,
            stripes,
        },
        BTRFS_CHUNK_FIXED_SIZE + count * BTRFS_STRIPE_SIZE,
    ))
}

/// Parse all entries from a sys_chunk_array byte slice.
///
/// The array alternates `btrfs_disk_key` and `btrfs_chunk` records.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<BtrfsChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        ensure_slice(data, cur, BTRFS_DISK_KEY_SIZE)?;
        let key = BtrfsKey::parse(data, cur)?;
        cur += BTRFS_DISK_KEY_SIZE;
        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "entry key is not a CHUNK_ITEM",
            });
        }
        let (entry, consumed) = parse_chunk_item(&data[cur..], key)?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

/// Result of a logical-to-physical bytenr mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsPhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Map a logical byte address through `chunks`, using the first stripe
/// (single-device images).
///
/// Returns `Ok(None)` when no chunk covers `logical`.
pub fn map_logical_to_physical(
    chunks: &[BtrfsChunkEntry],
    logical: u64,
) -> Result<Option<BtrfsPhysicalMapping>, ParseError> {
    let Some(chunk) = chunks.iter().find(|chunk| chunk.contains(logical)) else {
        return Ok(None);
    };
    let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
        field: "stripes",
        reason: "chunk has no stripes",
    })?;
    let physical = stripe
        .offset
        .checked_add(logical - chunk.key.offset)
        .ok_or(ParseError::InvalidField {
            field: "stripe_offset",
            reason: "physical address overflow",
        })?;
    Ok(Some(BtrfsPhysicalMapping {
        devid: stripe.devid,
        physical,
    }))
}

// ── Tree blocks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsHeader {
    pub csum: [u8; 32],
    pub fsid: FsUuid,
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: FsUuid,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl BtrfsHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, BTRFS_HEADER_SIZE)?;
        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: FsUuid(read_fixed::<16>(block, 0x20)?),
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: FsUuid(read_fixed::<16>(block, 0x40)?),
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: read_u8(block, 0x64)?,
        })
    }

    /// The CRC-32C stored in the first four bytes of the csum field.
    #[must_use]
    pub fn stored_crc32c(&self) -> u32 {
        u32::from_le_bytes([self.csum[0], self.csum[1], self.csum[2], self.csum[3]])
    }

    /// Check `nritems` and `level` against the block geometry.
    pub fn validate(&self, block_size: usize) -> Result<(), ParseError> {
        if self.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(BTRFS_HEADER_SIZE);
        let item_size = if self.level == 0 {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        if u32_to_usize(self.nritems, "nritems")? > payload_space / item_size {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }
        Ok(())
    }
}

/// CRC-32C of a tree block: everything after the 32-byte checksum field.
#[must_use]
pub fn tree_block_crc32c(block: &[u8]) -> u32 {
    crc32c::crc32c(block.get(BTRFS_CSUM_SIZE..).unwrap_or_default())
}

/// Verify the checksum of a tree block (or superblock) under `csum_type`.
///
/// Only CRC-32C is recognised; other algorithms are reported as an
/// unsupported version so callers can decide whether to skip verification.
pub fn verify_tree_block_checksum(block: &[u8], csum_type: u16) -> Result<(), ParseError> {
    if csum_type != BTRFS_CSUM_TYPE_CRC32C {
        return Err(ParseError::UnsupportedVersion {
            field: "csum_type",
            version: u64::from(csum_type),
        });
    }
    ensure_slice(block, 0, BTRFS_HEADER_SIZE)?;
    let stored = read_le_u32(block, 0)?;
    let computed = tree_block_crc32c(block);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

/// A leaf item table entry. `data_offset` is relative to the end of the
/// header, as on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub data_offset: u32,
    pub data_size: u32,
}

impl BtrfsItem {
    /// The item's payload inside `block`.
    pub fn payload<'a>(&self, block: &'a [u8]) -> Result<&'a [u8], ParseError> {
        let start = BTRFS_HEADER_SIZE
            .checked_add(u32_to_usize(self.data_offset, "item_offset")?)
            .ok_or(ParseError::IntegerConversion {
                field: "item_offset",
            })?;
        ensure_slice(block, start, u32_to_usize(self.data_size, "item_size")?)
    }
}

/// An internal node entry: a key paired with a child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

pub fn parse_leaf_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsItem>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len())?;

    let nritems = u32_to_usize(header.nritems, "nritems")?;
    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let item = BtrfsItem {
            key: BtrfsKey::parse(block, base)?,
            data_offset: read_le_u32(block, base + 17)?,
            data_size: read_le_u32(block, base + 21)?,
        };
        if item.payload(block).is_err() {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "item points outside block",
            });
        }
        items.push(item);
    }

    Ok((header, items))
}

/// Parse a btrfs internal (non-leaf) node, returning the header and
/// key-pointer entries.
pub fn parse_internal_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsKeyPtr>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len())?;

    let nritems = u32_to_usize(header.nritems, "nritems")?;
    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let key = BtrfsKey::parse(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }
        ptrs.push(BtrfsKeyPtr {
            key,
            blockptr,
            generation: read_le_u64(block, base + 25)?,
        });
    }

    Ok((header, ptrs))
}

// ── Item payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsTimespec {
    pub sec: u64,
    pub nsec: u32,
}

impl BtrfsTimespec {
    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            sec: read_le_u64(data, offset)?,
            nsec: read_le_u32(data, offset + 8)?,
        })
    }
}

pub const BTRFS_INODE_ITEM_SIZE: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsInodeItem {
    pub generation: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub atime: BtrfsTimespec,
    pub ctime: BtrfsTimespec,
    pub mtime: BtrfsTimespec,
    pub otime: BtrfsTimespec,
}

impl BtrfsInodeItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, BTRFS_INODE_ITEM_SIZE)?;
        Ok(Self {
            generation: read_le_u64(data, 0)?,
            size: read_le_u64(data, 16)?,
            nbytes: read_le_u64(data, 24)?,
            nlink: read_le_u32(data, 40)?,
            uid: read_le_u32(data, 44)?,
            gid: read_le_u32(data, 48)?,
            mode: read_le_u32(data, 52)?,
            rdev: read_le_u64(data, 56)?,
            flags: read_le_u64(data, 64)?,
            atime: BtrfsTimespec::parse(data, 112)?,
            ctime: BtrfsTimespec::parse(data, 124)?,
            mtime: BtrfsTimespec::parse(data, 136)?,
            otime: BtrfsTimespec::parse(data, 148)?,
        })
    }
}

/// One directory entry from a DIR_ITEM or DIR_INDEX payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsDirItem {
    /// Inode key of the target, or a ROOT_ITEM key for a subvolume.
    pub location: BtrfsKey,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

const BTRFS_DIR_ITEM_FIXED: usize = 30;

/// Parse every entry packed into a DIR_ITEM/DIR_INDEX payload. Hash
/// collisions put several entries into one DIR_ITEM.
pub fn parse_dir_items(data: &[u8]) -> Result<Vec<BtrfsDirItem>, ParseError> {
    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        ensure_slice(data, cur, BTRFS_DIR_ITEM_FIXED)?;
        let data_len = usize::from(read_le_u16(data, cur + 25)?);
        let name_len = usize::from(read_le_u16(data, cur + 27)?);
        let name = ensure_slice(data, cur + BTRFS_DIR_ITEM_FIXED, name_len)?.to_vec();
        ensure_slice(data, cur + BTRFS_DIR_ITEM_FIXED + name_len, data_len)?;
        out.push(BtrfsDirItem {
            location: BtrfsKey::parse(data, cur)?,
            transid: read_le_u64(data, cur + 17)?,
            file_type: read_u8(data, cur + 29)?,
            name,
        });
        cur += BTRFS_DIR_ITEM_FIXED + name_len + data_len;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsRootItem {
    pub inode: BtrfsInodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub bytes_used: u64,
    pub flags: u64,
    pub refs: u32,
    pub level: u8,
}

impl BtrfsRootItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let level = read_u8(data, 238)?;
        if level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "root_item.level",
                reason: "exceeds maximum tree depth",
            });
        }
        Ok(Self {
            inode: BtrfsInodeItem::parse(data)?,
            generation: read_le_u64(data, 160)?,
            root_dirid: read_le_u64(data, 168)?,
            bytenr: read_le_u64(data, 176)?,
            bytes_used: read_le_u64(data, 192)?,
            flags: read_le_u64(data, 208)?,
            refs: read_le_u32(data, 216)?,
            level,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BtrfsFileExtentBody {
    Inline(Vec<u8>),
    Regular {
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsFileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub extent_type: u8,
    pub body: BtrfsFileExtentBody,
}

impl BtrfsFileExtentItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let extent_type = read_u8(data, 20)?;
        let body = match extent_type {
            BTRFS_FILE_EXTENT_INLINE => BtrfsFileExtentBody::Inline(
                data.get(21..)
                    .ok_or(ParseError::InsufficientData {
                        needed: 21,
                        offset: 0,
                        actual: data.len(),
                    })?
                    .to_vec(),
            ),
            BTRFS_FILE_EXTENT_REG | BTRFS_FILE_EXTENT_PREALLOC => BtrfsFileExtentBody::Regular {
                disk_bytenr: read_le_u64(data, 21)?,
                disk_num_bytes: read_le_u64(data, 29)?,
                offset: read_le_u64(data, 37)?,
                num_bytes: read_le_u64(data, 45)?,
            },
            _ => {
                return Err(ParseError::InvalidField {
                    field: "extent_type",
                    reason: "unknown file extent type",
                });
            }
        };
        Ok(Self {
            generation: read_le_u64(data, 0)?,
            ram_bytes: read_le_u64(data, 8)?,
            compression: read_u8(data, 16)?,
            encryption: read_u8(data, 17)?,
            extent_type,
            body,
        })
    }

    #[must_use]
    pub fn is_prealloc(&self) -> bool {
        self.extent_type == BTRFS_FILE_EXTENT_PREALLOC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_superblock() -> [u8; BTRFS_SUPER_INFO_SIZE] {
        let mut sb = [0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&16384_u32.to_le_bytes());
        sb[0x9C..0xA0].copy_from_slice(&65536_u32.to_le_bytes());
        sb
    }

    fn write_chunk(buf: &mut [u8], at: usize, logical: u64, length: u64, physical: u64) -> usize {
        buf[at..at + 8].copy_from_slice(&BTRFS_FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
        buf[at + 8] = BTRFS_CHUNK_ITEM_KEY;
        buf[at + 9..at + 17].copy_from_slice(&logical.to_le_bytes());
        let c = at + 17;
        buf[c..c + 8].copy_from_slice(&length.to_le_bytes());
        buf[c + 8..c + 16].copy_from_slice(&2_u64.to_le_bytes());
        buf[c + 16..c + 24].copy_from_slice(&(64 * 1024_u64).to_le_bytes());
        buf[c + 24..c + 32].copy_from_slice(&2_u64.to_le_bytes());
        buf[c + 44..c + 46].copy_from_slice(&1_u16.to_le_bytes());
        let s = c + 48;
        buf[s..s + 8].copy_from_slice(&1_u64.to_le_bytes());
        buf[s + 8..s + 16].copy_from_slice(&physical.to_le_bytes());
        17 + 48 + 32
    }

    #[test]
    fn parse_superblock_smoke() {
        let mut sb = base_superblock();
        sb[0x48..0x50].copy_from_slice(&9_u64.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        sb[0xC6] = 1;
        sb[BTRFS_SUPER_LABEL_OFFSET..BTRFS_SUPER_LABEL_OFFSET + 3].copy_from_slice(b"pfs");

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("superblock parse");
        assert_eq!(parsed.magic, BTRFS_MAGIC);
        assert_eq!(parsed.generation, 9);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.chunk_root, 0x10_0000);
        assert_eq!(parsed.root_level, 1);
        assert_eq!(parsed.nodesize, 16384);
        assert_eq!(parsed.label, "pfs");
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = base_superblock();
        sb[0x40] ^= 0xFF;
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }), "{err:?}");
    }

    #[test]
    fn superblock_rejects_non_power_of_two_nodesize() {
        let mut sb = base_superblock();
        sb[0x94..0x98].copy_from_slice(&5000_u32.to_le_bytes());
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "nodesize",
                    ..
                }
            ),
            "expected nodesize error, got: {err:?}"
        );
    }

    #[test]
    fn superblock_rejects_root_level_past_max() {
        let mut sb = base_superblock();
        sb[0xC6] = 8;
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "root_level",
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn sys_chunk_array_round_trip_through_superblock() {
        let mut sb = base_superblock();
        let len = write_chunk(
            &mut sb,
            BTRFS_SYS_CHUNK_ARRAY_OFFSET,
            0x10_0000,
            0x80_0000,
            0x20_0000,
        );
        sb[0xA0..0xA4].copy_from_slice(&u32::try_from(len).unwrap().to_le_bytes());

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("sb parse");
        let entries = parse_sys_chunk_array(&parsed.sys_chunk_array).expect("chunk parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].logical_start(), 0x10_0000);
        assert_eq!(entries[0].length, 0x80_0000);
        assert_eq!(entries[0].stripes[0].offset, 0x20_0000);
    }

    #[test]
    fn sys_chunk_array_truncated_key() {
        let err = parse_sys_chunk_array(&[0_u8; 10]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn map_logical_to_physical_hit_and_miss() {
        let mut buf = vec![0_u8; 97];
        write_chunk(&mut buf, 0, 0x100_0000, 0x80_0000, 0x20_0000);
        let chunks = parse_sys_chunk_array(&buf).expect("chunks");

        let hit = map_logical_to_physical(&chunks, 0x100_1000)
            .expect("map")
            .expect("covered");
        assert_eq!(hit.devid, 1);
        assert_eq!(hit.physical, 0x20_1000);

        assert_eq!(map_logical_to_physical(&chunks, 0x180_0000).expect("map"), None);
        assert_eq!(map_logical_to_physical(&[], 0).expect("map"), None);
    }

    #[test]
    fn key_order_is_objectid_type_offset() {
        let a = BtrfsKey::new(256, BTRFS_INODE_ITEM_KEY, 0);
        let b = BtrfsKey::new(256, BTRFS_DIR_ITEM_KEY, 0);
        let c = BtrfsKey::new(256, BTRFS_DIR_ITEM_KEY, 7);
        let d = BtrfsKey::new(257, 0, 0);
        assert!(a < b && b < c && c < d);
        assert!(b.same_item(&c));
        assert!(!a.same_item(&b));
    }

    fn make_block(size: usize, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; size];
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    #[test]
    fn parse_leaf_items_exposes_payload() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&123_u64.to_le_bytes());
        block[base + 8] = 42;
        block[base + 9..base + 17].copy_from_slice(&999_u64.to_le_bytes());
        block[base + 17..base + 21].copy_from_slice(&300_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&4_u32.to_le_bytes());
        let data = BTRFS_HEADER_SIZE + 300;
        block[data..data + 4].copy_from_slice(b"abcd");

        let (_, items) = parse_leaf_items(&block).expect("leaf parse");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, BtrfsKey::new(123, 42, 999));
        assert_eq!(items[0].payload(&block).expect("payload"), b"abcd");
    }

    #[test]
    fn parse_leaf_items_rejects_out_of_bounds_data() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base + 17..base + 21].copy_from_slice(&600_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&10_u32.to_le_bytes());

        let err = parse_leaf_items(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "item_offset",
                    ..
                }
            ),
            "expected item_offset error, got: {err:?}"
        );
    }

    #[test]
    fn parse_internal_items_smoke() {
        let mut block = make_block(4096, 2, 1);
        for (idx, (objectid, ptr)) in [(256_u64, 0x4000_u64), (512, 0x8000)].iter().enumerate() {
            let b = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
            block[b..b + 8].copy_from_slice(&objectid.to_le_bytes());
            block[b + 8] = BTRFS_ROOT_ITEM_KEY;
            block[b + 17..b + 25].copy_from_slice(&ptr.to_le_bytes());
            block[b + 25..b + 33].copy_from_slice(&10_u64.to_le_bytes());
        }

        let (header, ptrs) = parse_internal_items(&block).expect("internal parse");
        assert_eq!(header.level, 1);
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0].blockptr, 0x4000);
        assert_eq!(ptrs[1].key.objectid, 512);
        assert_eq!(ptrs[1].generation, 10);
    }

    #[test]
    fn parse_internal_items_rejects_zero_blockptr() {
        let block = make_block(4096, 1, 1);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "blockptr",
                    ..
                }
            ),
            "expected blockptr error, got: {err:?}"
        );
    }

    #[test]
    fn header_validate_nritems_overflow() {
        // (4096-101)/25 = 159 leaf items, (4096-101)/33 = 121 key pointers.
        let leaf = BtrfsHeader::parse_from_block(&make_block(4096, 160, 0)).expect("parse");
        assert!(leaf.validate(4096).is_err());
        let leaf = BtrfsHeader::parse_from_block(&make_block(4096, 159, 0)).expect("parse");
        assert!(leaf.validate(4096).is_ok());
        let internal = BtrfsHeader::parse_from_block(&make_block(4096, 122, 1)).expect("parse");
        assert!(internal.validate(4096).is_err());
    }

    #[test]
    fn checksum_covers_only_bytes_after_csum_field() {
        let mut block = make_block(4096, 0, 0);
        block[0x30..0x38].copy_from_slice(&0x1_0000_u64.to_le_bytes());
        let crc = tree_block_crc32c(&block);
        block[0..4].copy_from_slice(&crc.to_le_bytes());
        verify_tree_block_checksum(&block, BTRFS_CSUM_TYPE_CRC32C).expect("valid");

        // Unused tail of the csum field is outside the checksummed region.
        block[4..0x20].fill(0xEE);
        verify_tree_block_checksum(&block, BTRFS_CSUM_TYPE_CRC32C).expect("still valid");

        block[0x200] ^= 1;
        let err = verify_tree_block_checksum(&block, BTRFS_CSUM_TYPE_CRC32C).unwrap_err();
        assert!(matches!(err, ParseError::ChecksumMismatch { .. }));
    }

    #[test]
    fn checksum_rejects_unknown_algorithm() {
        let block = make_block(4096, 0, 0);
        let err = verify_tree_block_checksum(&block, 2).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedVersion { version: 2, .. }));
    }

    #[test]
    fn inode_item_fields() {
        let mut raw = vec![0_u8; BTRFS_INODE_ITEM_SIZE];
        raw[16..24].copy_from_slice(&4242_u64.to_le_bytes());
        raw[40..44].copy_from_slice(&2_u32.to_le_bytes());
        raw[44..48].copy_from_slice(&1000_u32.to_le_bytes());
        raw[52..56].copy_from_slice(&0o100_644_u32.to_le_bytes());
        raw[136..144].copy_from_slice(&1_700_000_000_u64.to_le_bytes());

        let inode = BtrfsInodeItem::parse(&raw).expect("inode");
        assert_eq!(inode.size, 4242);
        assert_eq!(inode.nlink, 2);
        assert_eq!(inode.uid, 1000);
        assert_eq!(inode.mode, 0o100_644);
        assert_eq!(inode.mtime.sec, 1_700_000_000);
    }

    fn dir_item(target: u64, kind: u8, name: &[u8]) -> Vec<u8> {
        let mut raw = vec![0_u8; BTRFS_DIR_ITEM_FIXED];
        raw[0..8].copy_from_slice(&target.to_le_bytes());
        raw[8] = BTRFS_INODE_ITEM_KEY;
        raw[27..29].copy_from_slice(&u16::try_from(name.len()).unwrap().to_le_bytes());
        raw[29] = kind;
        raw.extend_from_slice(name);
        raw
    }

    #[test]
    fn dir_items_with_hash_collision() {
        let mut raw = dir_item(257, BTRFS_FT_REG_FILE, b"a.txt");
        raw.extend(dir_item(258, BTRFS_FT_DIR, b"sub"));
        let items = parse_dir_items(&raw).expect("dir items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, b"a.txt");
        assert_eq!(items[0].location.objectid, 257);
        assert_eq!(items[1].file_type, BTRFS_FT_DIR);
    }

    #[test]
    fn dir_item_truncated_name_rejected() {
        let mut raw = dir_item(257, BTRFS_FT_REG_FILE, b"name");
        raw.truncate(raw.len() - 2);
        assert!(parse_dir_items(&raw).is_err());
    }

    #[test]
    fn root_item_fields() {
        let mut raw = vec![0_u8; 439];
        raw[168..176].copy_from_slice(&256_u64.to_le_bytes());
        raw[176..184].copy_from_slice(&0x50_0000_u64.to_le_bytes());
        raw[238] = 2;
        let root = BtrfsRootItem::parse(&raw).expect("root item");
        assert_eq!(root.root_dirid, 256);
        assert_eq!(root.bytenr, 0x50_0000);
        assert_eq!(root.level, 2);

        raw[238] = 9;
        assert!(BtrfsRootItem::parse(&raw).is_err());
    }

    #[test]
    fn file_extent_inline_and_regular() {
        let mut inline = vec![0_u8; 21];
        inline[8..16].copy_from_slice(&5_u64.to_le_bytes());
        inline[20] = BTRFS_FILE_EXTENT_INLINE;
        inline.extend_from_slice(b"hello");
        let parsed = BtrfsFileExtentItem::parse(&inline).expect("inline");
        assert_eq!(parsed.body, BtrfsFileExtentBody::Inline(b"hello".to_vec()));

        let mut regular = vec![0_u8; 53];
        regular[20] = BTRFS_FILE_EXTENT_REG;
        regular[21..29].copy_from_slice(&0x80_0000_u64.to_le_bytes());
        regular[45..53].copy_from_slice(&8192_u64.to_le_bytes());
        let parsed = BtrfsFileExtentItem::parse(&regular).expect("regular");
        assert!(matches!(
            parsed.body,
            BtrfsFileExtentBody::Regular {
                disk_bytenr: 0x80_0000,
                num_bytes: 8192,
                ..
            }
        ));

        regular[20] = 9;
        assert!(BtrfsFileExtentItem::parse(&regular).is_err());
    }
}
