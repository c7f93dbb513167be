#![forbid(unsafe_code)]
//! XFS superblock, AGI and btree block structures (big-endian).
//!
//! Covers the two btree header shapes XFS uses:
//!
//! | Shape | Sibling width | v4 header | v5 header | Used by |
//! |-------|---------------|-----------|-----------|---------|
//! | short | u32 AG block  | 16 bytes  | 56 bytes  | inobt, finobt |
//! | long  | u64 fs block  | 24 bytes  | 72 bytes  | bmbt |
//!
//! v5 headers add a self-describing tail (block number, LSN, UUID, owner
//! and a little-endian CRC-32C over the whole block).

use pfs_types::{
    FsUuid, ParseError, XFS_AGI_MAGIC, XFS_SB_MAGIC, XFS_SUPERBLOCK_SIZE, ensure_slice,
    read_be_u16, read_be_u32, read_be_u64, read_fixed, read_le_u32, read_u8,
};
use serde::{Deserialize, Serialize};

pub const XFS_IBT_MAGIC: u32 = 0x4941_4254; // "IABT"
pub const XFS_IBT_CRC_MAGIC: u32 = 0x4941_4233; // "IAB3"
pub const XFS_FIBT_MAGIC: u32 = 0x4649_4254; // "FIBT"
pub const XFS_FIBT_CRC_MAGIC: u32 = 0x4649_4233; // "FIB3"
pub const XFS_BMAP_MAGIC: u32 = 0x424D_4150; // "BMAP"
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424D_4133; // "BMA3"

pub const XFS_BTREE_SBLOCK_LEN: usize = 16;
pub const XFS_BTREE_SBLOCK_CRC_LEN: usize = 56;
pub const XFS_BTREE_LBLOCK_LEN: usize = 24;
pub const XFS_BTREE_LBLOCK_CRC_LEN: usize = 72;
/// Offset of the CRC within a short-form v5 header.
pub const XFS_BTREE_SBLOCK_CRC_OFF: usize = 52;
/// Offset of the CRC within a long-form v5 header.
pub const XFS_BTREE_LBLOCK_CRC_OFF: usize = 64;
/// Offset of the CRC within a v5 AGI sector.
pub const XFS_AGI_CRC_OFF: usize = 312;

pub const XFS_INOBT_REC_SIZE: usize = 16;
pub const XFS_INOBT_KEY_SIZE: usize = 4;
pub const XFS_INOBT_PTR_SIZE: usize = 4;
pub const XFS_BMBT_REC_SIZE: usize = 16;
pub const XFS_BMBT_KEY_SIZE: usize = 8;
pub const XFS_BMBT_PTR_SIZE: usize = 8;

pub const XFS_INODES_PER_CHUNK: u32 = 64;
/// Each holemask bit covers this many inodes of a sparse chunk.
pub const XFS_INODES_PER_HOLEMASK_BIT: u32 = 4;
/// Btrees never grow deeper than this in practice; used as the level bound.
pub const XFS_BTREE_MAXLEVELS: u16 = 9;

pub const XFS_SB_FEAT_INCOMPAT_SPINODES: u32 = 1 << 1;
pub const XFS_SB_FEAT_INCOMPAT_META_UUID: u32 = 1 << 2;
const XFS_SB_VERSION_NUMBITS: u16 = 0x000F;

const NULL_AGBLOCK: u32 = u32::MAX;
const NULL_FSBLOCK: u64 = u64::MAX;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsSuperblock {
    pub blocksize: u32,
    pub dblocks: u64,
    pub uuid: FsUuid,
    pub rootino: u64,
    pub agblocks: u32,
    pub agcount: u32,
    pub version: u16,
    pub sectsize: u16,
    pub inodesize: u16,
    pub inopblock: u16,
    pub fname: String,
    pub blocklog: u8,
    pub sectlog: u8,
    pub inodelog: u8,
    pub inopblog: u8,
    pub agblklog: u8,
    pub icount: u64,
    pub ifree: u64,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
    pub meta_uuid: FsUuid,
}

impl XfsSuperblock {
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, XFS_SUPERBLOCK_SIZE)?;
        let magic = read_be_u32(region, 0)?;
        if magic != XFS_SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_SB_MAGIC),
                actual: u64::from(magic),
            });
        }

        let versionnum = read_be_u16(region, 100)?;
        let version = versionnum & XFS_SB_VERSION_NUMBITS;
        if !(4..=5).contains(&version) {
            return Err(ParseError::UnsupportedVersion {
                field: "sb_versionnum",
                version: u64::from(version),
            });
        }

        let blocksize = read_be_u32(region, 4)?;
        let blocklog = read_u8(region, 120)?;
        if !(512..=65536).contains(&blocksize)
            || !blocksize.is_power_of_two()
            || blocksize.trailing_zeros() != u32::from(blocklog)
        {
            return Err(ParseError::InvalidField {
                field: "sb_blocksize",
                reason: "must be a power of two in 512..=65536 matching sb_blocklog",
            });
        }

        let agblocks = read_be_u32(region, 84)?;
        let agcount = read_be_u32(region, 88)?;
        let agblklog = read_u8(region, 124)?;
        if agblocks == 0 || agcount == 0 || agblklog > 31 || u64::from(agblocks) > 1_u64 << agblklog
        {
            return Err(ParseError::InvalidField {
                field: "sb_agblocks",
                reason: "allocation group geometry out of range",
            });
        }

        let inopblog = read_u8(region, 123)?;
        if u32::from(agblklog) + u32::from(inopblog) > 32 {
            return Err(ParseError::InvalidField {
                field: "sb_inopblog",
                reason: "AG inode number does not fit 32 bits",
            });
        }

        let features_incompat = if version == 5 {
            read_be_u32(region, 216)?
        } else {
            0
        };

        Ok(Self {
            blocksize,
            dblocks: read_be_u64(region, 8)?,
            uuid: FsUuid(read_fixed::<16>(region, 32)?),
            rootino: read_be_u64(region, 56)?,
            agblocks,
            agcount,
            version,
            sectsize: read_be_u16(region, 102)?,
            inodesize: read_be_u16(region, 104)?,
            inopblock: read_be_u16(region, 106)?,
            fname: pfs_types::trim_nul_padded(&read_fixed::<12>(region, 108)?),
            blocklog,
            sectlog: read_u8(region, 121)?,
            inodelog: read_u8(region, 122)?,
            inopblog,
            agblklog,
            icount: read_be_u64(region, 128)?,
            ifree: read_be_u64(region, 136)?,
            features_ro_compat: if version == 5 {
                read_be_u32(region, 212)?
            } else {
                0
            },
            features_incompat,
            meta_uuid: FsUuid(read_fixed::<16>(region, 248)?),
        })
    }

    /// Whether metadata blocks carry v5 self-describing headers.
    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.version == 5
    }

    #[must_use]
    pub fn has_sparse_inodes(&self) -> bool {
        self.features_incompat & XFS_SB_FEAT_INCOMPAT_SPINODES != 0
    }

    /// The UUID stamped into v5 metadata headers.
    #[must_use]
    pub fn metadata_uuid(&self) -> FsUuid {
        if self.features_incompat & XFS_SB_FEAT_INCOMPAT_META_UUID != 0 {
            self.meta_uuid
        } else {
            self.uuid
        }
    }

    /// Bits of an inode number that select the inode within its AG.
    #[must_use]
    pub fn agino_bits(&self) -> u32 {
        u32::from(self.agblklog) + u32::from(self.inopblog)
    }

    /// Split an absolute inode number into `(agno, agino)`.
    #[must_use]
    pub fn split_ino(&self, ino: u64) -> (u64, u32) {
        let bits = self.agino_bits();
        let mask = (1_u64 << bits) - 1;
        // agino_bits is at most 32, so the masked value always fits.
        let agino = u32::try_from(ino & mask).unwrap_or(u32::MAX);
        (ino >> bits, agino)
    }

    /// 512-byte sector address ("daddr") of an AG-relative block.
    #[must_use]
    pub fn agbno_to_daddr(&self, agno: u32, agbno: u32) -> Option<u64> {
        let fs_block = u64::from(agno)
            .checked_mul(u64::from(self.agblocks))?
            .checked_add(u64::from(agbno))?;
        fs_block.checked_mul(u64::from(self.blocksize / 512))
    }

    /// Split an encoded filesystem block number into `(agno, agbno)`.
    #[must_use]
    pub fn split_fsbno(&self, fsbno: u64) -> (u64, u64) {
        let mask = (1_u64 << self.agblklog) - 1;
        (fsbno >> self.agblklog, fsbno & mask)
    }

    /// 512-byte sector address of an encoded filesystem block number.
    #[must_use]
    pub fn fsbno_to_daddr(&self, fsbno: u64) -> Option<u64> {
        let (agno, agbno) = self.split_fsbno(fsbno);
        agno.checked_mul(u64::from(self.agblocks))?
            .checked_add(agbno)?
            .checked_mul(u64::from(self.blocksize / 512))
    }

    /// Byte offset of the AGI header of allocation group `agno`.
    #[must_use]
    pub fn agi_offset(&self, agno: u32) -> Option<u64> {
        let ag_start = u64::from(agno)
            .checked_mul(u64::from(self.agblocks))?
            .checked_mul(u64::from(self.blocksize))?;
        ag_start.checked_add(2 * u64::from(self.sectsize))
    }
}

// ── AGI ─────────────────────────────────────────────────────────────────────

/// Allocation group inode header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsAgi {
    pub versionnum: u32,
    pub seqno: u32,
    pub length: u32,
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    pub newino: u32,
    pub dirino: u32,
    pub uuid: FsUuid,
    pub crc: u32,
    pub free_root: u32,
    pub free_level: u32,
}

impl XfsAgi {
    pub fn parse(sector: &[u8], has_crc: bool) -> Result<Self, ParseError> {
        let magic = read_be_u32(sector, 0)?;
        if magic != XFS_AGI_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_AGI_MAGIC),
                actual: u64::from(magic),
            });
        }
        let level = read_be_u32(sector, 24)?;
        if level == 0 || level > u32::from(XFS_BTREE_MAXLEVELS) {
            return Err(ParseError::InvalidField {
                field: "agi_level",
                reason: "inode btree level out of range",
            });
        }
        let (uuid, crc, free_root, free_level) = if has_crc {
            (
                FsUuid(read_fixed::<16>(sector, 296)?),
                read_le_u32(sector, XFS_AGI_CRC_OFF)?,
                read_be_u32(sector, 328)?,
                read_be_u32(sector, 332)?,
            )
        } else {
            (FsUuid::NIL, 0, 0, 0)
        };
        Ok(Self {
            versionnum: read_be_u32(sector, 4)?,
            seqno: read_be_u32(sector, 8)?,
            length: read_be_u32(sector, 12)?,
            count: read_be_u32(sector, 16)?,
            root: read_be_u32(sector, 20)?,
            level,
            freecount: read_be_u32(sector, 28)?,
            newino: read_be_u32(sector, 32)?,
            dirino: read_be_u32(sector, 36)?,
            uuid,
            crc,
            free_root,
            free_level,
        })
    }

    /// Whether the AG carries a free-inode btree.
    #[must_use]
    pub fn has_finobt(&self) -> bool {
        self.free_root != 0 && self.free_level != 0
    }
}

// ── Btree blocks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsBtreeCrcFields {
    pub blkno: u64,
    pub lsn: u64,
    pub uuid: FsUuid,
    pub owner: u64,
    pub crc: u32,
}

/// Common view of short- and long-form btree block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsBtreeHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    /// Left sibling; `None` for the null sentinel.
    pub leftsib: Option<u64>,
    pub rightsib: Option<u64>,
    pub crc_fields: Option<XfsBtreeCrcFields>,
}

impl XfsBtreeHeader {
    /// Parse a short-form header (AG-relative u32 sibling pointers).
    pub fn parse_short(block: &[u8], has_crc: bool) -> Result<Self, ParseError> {
        let len = if has_crc {
            XFS_BTREE_SBLOCK_CRC_LEN
        } else {
            XFS_BTREE_SBLOCK_LEN
        };
        ensure_slice(block, 0, len)?;
        let sib = |raw: u32| (raw != NULL_AGBLOCK).then_some(u64::from(raw));
        let crc_fields = if has_crc {
            Some(XfsBtreeCrcFields {
                blkno: read_be_u64(block, 16)?,
                lsn: read_be_u64(block, 24)?,
                uuid: FsUuid(read_fixed::<16>(block, 32)?),
                owner: u64::from(read_be_u32(block, 48)?),
                crc: read_le_u32(block, XFS_BTREE_SBLOCK_CRC_OFF)?,
            })
        } else {
            None
        };
        Ok(Self {
            magic: read_be_u32(block, 0)?,
            level: read_be_u16(block, 4)?,
            numrecs: read_be_u16(block, 6)?,
            leftsib: sib(read_be_u32(block, 8)?),
            rightsib: sib(read_be_u32(block, 12)?),
            crc_fields,
        })
    }

    /// Parse a long-form header (u64 filesystem-block sibling pointers).
    pub fn parse_long(block: &[u8], has_crc: bool) -> Result<Self, ParseError> {
        let len = if has_crc {
            XFS_BTREE_LBLOCK_CRC_LEN
        } else {
            XFS_BTREE_LBLOCK_LEN
        };
        ensure_slice(block, 0, len)?;
        let sib = |raw: u64| (raw != NULL_FSBLOCK).then_some(raw);
        let crc_fields = if has_crc {
            Some(XfsBtreeCrcFields {
                blkno: read_be_u64(block, 24)?,
                lsn: read_be_u64(block, 32)?,
                uuid: FsUuid(read_fixed::<16>(block, 40)?),
                owner: read_be_u64(block, 56)?,
                crc: read_le_u32(block, XFS_BTREE_LBLOCK_CRC_OFF)?,
            })
        } else {
            None
        };
        Ok(Self {
            magic: read_be_u32(block, 0)?,
            level: read_be_u16(block, 4)?,
            numrecs: read_be_u16(block, 6)?,
            leftsib: sib(read_be_u64(block, 8)?),
            rightsib: sib(read_be_u64(block, 16)?),
            crc_fields,
        })
    }
}

/// CRC-32C of a metadata block with the 4-byte CRC field at `crc_off`
/// treated as zero.
pub fn xfs_block_crc(block: &[u8], crc_off: usize) -> Result<u32, ParseError> {
    ensure_slice(block, crc_off, 4)?;
    let crc = crc32c::crc32c(&block[..crc_off]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &block[crc_off + 4..]))
}

/// Verify the little-endian CRC stored at `crc_off`.
pub fn verify_xfs_block_crc(block: &[u8], crc_off: usize) -> Result<(), ParseError> {
    let stored = read_le_u32(block, crc_off)?;
    let computed = xfs_block_crc(block, crc_off)?;
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

/// Maximum records per btree block for a given header and entry width.
#[must_use]
pub fn btree_maxrecs(block_size: usize, header_len: usize, entry_width: usize) -> usize {
    block_size.saturating_sub(header_len) / entry_width
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Inode btree record describing a 64-inode chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsInobtRec {
    pub startino: u32,
    /// One bit per 4 inodes; a set bit marks a hole (sparse chunks only).
    pub holemask: u16,
    pub count: u8,
    pub freecount: u32,
    /// One bit per inode; a set bit marks a free inode.
    pub free: u64,
}

impl XfsInobtRec {
    pub fn parse(raw: &[u8], sparse: bool) -> Result<Self, ParseError> {
        ensure_slice(raw, 0, XFS_INOBT_REC_SIZE)?;
        let startino = read_be_u32(raw, 0)?;
        let (holemask, count, freecount) = if sparse {
            (
                read_be_u16(raw, 4)?,
                read_u8(raw, 6)?,
                u32::from(read_u8(raw, 7)?),
            )
        } else {
            (0, 64, read_be_u32(raw, 4)?)
        };
        if freecount > XFS_INODES_PER_CHUNK || u32::from(count) > XFS_INODES_PER_CHUNK {
            return Err(ParseError::InvalidField {
                field: "ir_freecount",
                reason: "exceeds inodes per chunk",
            });
        }
        Ok(Self {
            startino,
            holemask,
            count,
            freecount,
            free: read_be_u64(raw, 8)?,
        })
    }

    /// Whether `agino` falls inside this chunk's 64-inode span.
    #[must_use]
    pub fn covers(&self, agino: u32) -> bool {
        agino >= self.startino && agino - self.startino < XFS_INODES_PER_CHUNK
    }

    /// Whether the inode at `index` within the chunk is physically absent.
    #[must_use]
    pub fn is_hole(&self, index: u32) -> bool {
        index < XFS_INODES_PER_CHUNK
            && (self.holemask >> (index / XFS_INODES_PER_HOLEMASK_BIT)) & 1 == 1
    }

    /// Whether the inode at `index` within the chunk is allocated.
    #[must_use]
    pub fn is_allocated(&self, index: u32) -> bool {
        index < XFS_INODES_PER_CHUNK && !self.is_hole(index) && (self.free >> index) & 1 == 0
    }
}

/// Block map record: a file-offset range mapped to filesystem blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsBmbtRec {
    pub startoff: u64,
    pub startblock: u64,
    pub blockcount: u64,
    pub unwritten: bool,
}

impl XfsBmbtRec {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let l0 = read_be_u64(raw, 0)?;
        let l1 = read_be_u64(raw, 8)?;
        Ok(Self {
            startoff: (l0 & 0x7FFF_FFFF_FFFF_FE00) >> 9,
            startblock: ((l0 & 0x1FF) << 43) | (l1 >> 21),
            blockcount: l1 & 0x1F_FFFF,
            unwritten: l0 >> 63 == 1,
        })
    }

    /// Whether file block `fileoff` lies inside this mapping.
    #[must_use]
    pub fn covers(&self, fileoff: u64) -> bool {
        fileoff >= self.startoff && fileoff - self.startoff < self.blockcount
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// "IN"
pub const XFS_DINODE_MAGIC: u16 = 0x494E;
/// Inode core length (data fork offset) for v1/v2 and v3 inodes.
pub const XFS_DINODE_CORE_LEN: usize = 100;
pub const XFS_DINODE_V3_CORE_LEN: usize = 176;
/// Offset of the little-endian `di_crc` in a v3 inode.
pub const XFS_DINODE_CRC_OFF: usize = 100;
/// `bb_level` and `bb_numrecs` of an in-inode bmbt root.
pub const XFS_BMDR_HDR_LEN: usize = 4;

/// How a fork stores its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XfsForkFormat {
    /// Device number only.
    Device,
    /// Content held inline in the fork.
    Local,
    /// Packed bmbt records in the fork.
    Extents,
    /// A headerless bmbt root in the fork.
    Btree,
}

impl XfsForkFormat {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Device),
            1 => Ok(Self::Local),
            2 => Ok(Self::Extents),
            3 => Ok(Self::Btree),
            _ => Err(ParseError::InvalidField {
                field: "di_format",
                reason: "unknown data fork format",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XfsTimestamp {
    pub sec: i32,
    pub nsec: u32,
}

impl XfsTimestamp {
    fn parse(raw: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            sec: i32::from_be_bytes(read_fixed::<4>(raw, offset)?),
            nsec: read_be_u32(raw, offset + 4)?,
        })
    }
}

/// Inode core and a copy of its data fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsDinode {
    pub mode: u16,
    pub version: u8,
    pub format: XfsForkFormat,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: XfsTimestamp,
    pub mtime: XfsTimestamp,
    pub ctime: XfsTimestamp,
    /// Creation time, recorded by v3 inodes only.
    pub crtime: Option<XfsTimestamp>,
    pub size: u64,
    pub nblocks: u64,
    pub nextents: u32,
    pub forkoff: u8,
    /// Self-reported inode number (v3).
    pub ino: Option<u64>,
    pub data_fork: Vec<u8>,
}

impl XfsDinode {
    /// Decode one on-disk inode; `raw` is exactly `sb_inodesize` bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u16(raw, 0)?;
        if magic != XFS_DINODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_DINODE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_u8(raw, 4)?;
        let core_len = match version {
            1 | 2 => XFS_DINODE_CORE_LEN,
            3 => XFS_DINODE_V3_CORE_LEN,
            _ => {
                return Err(ParseError::UnsupportedVersion {
                    field: "di_version",
                    version: u64::from(version),
                });
            }
        };
        let forkoff = read_u8(raw, 82)?;
        let fork_len = if forkoff == 0 {
            raw.len().saturating_sub(core_len)
        } else {
            usize::from(forkoff) * 8
        };
        let data_fork = ensure_slice(raw, core_len, fork_len)?.to_vec();
        let nlink = if version == 1 {
            u32::from(read_be_u16(raw, 6)?)
        } else {
            read_be_u32(raw, 16)?
        };
        let v3 = version == 3;
        Ok(Self {
            mode: read_be_u16(raw, 2)?,
            version,
            format: XfsForkFormat::from_raw(read_u8(raw, 5)?)?,
            uid: read_be_u32(raw, 8)?,
            gid: read_be_u32(raw, 12)?,
            nlink,
            atime: XfsTimestamp::parse(raw, 32)?,
            mtime: XfsTimestamp::parse(raw, 40)?,
            ctime: XfsTimestamp::parse(raw, 48)?,
            crtime: if v3 {
                Some(XfsTimestamp::parse(raw, 144)?)
            } else {
                None
            },
            size: read_be_u64(raw, 56)?,
            nblocks: read_be_u64(raw, 64)?,
            nextents: read_be_u32(raw, 76)?,
            forkoff,
            ino: if v3 { Some(read_be_u64(raw, 152)?) } else { None },
            data_fork,
        })
    }

    /// Extent records of an extent-format data fork.
    pub fn extent_list(&self) -> Result<Vec<XfsBmbtRec>, ParseError> {
        let count = usize::try_from(self.nextents).map_err(|_| ParseError::IntegerConversion {
            field: "di_nextents",
        })?;
        if count.saturating_mul(XFS_BMBT_REC_SIZE) > self.data_fork.len() {
            return Err(ParseError::InvalidField {
                field: "di_nextents",
                reason: "more extents than the data fork holds",
            });
        }
        let extents = self
            .data_fork
            .chunks_exact(XFS_BMBT_REC_SIZE)
            .take(count)
            .map(XfsBmbtRec::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if extents
            .windows(2)
            .any(|pair| pair[0].startoff.saturating_add(pair[0].blockcount) > pair[1].startoff)
        {
            return Err(ParseError::InvalidField {
                field: "di_u.di_bmx",
                reason: "extents overlap or are out of order",
            });
        }
        Ok(extents)
    }
}

/// bmbt root stored in an inode fork: a level and parallel key/pointer
/// arrays, with no block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsBmdrBlock {
    pub level: u16,
    /// First file offset under each child.
    pub keys: Vec<u64>,
    /// Child filesystem block numbers.
    pub ptrs: Vec<u64>,
}

impl XfsBmdrBlock {
    pub fn parse(fork: &[u8]) -> Result<Self, ParseError> {
        let level = read_be_u16(fork, 0)?;
        let numrecs = usize::from(read_be_u16(fork, 2)?);
        let maxrecs = btree_maxrecs(
            fork.len(),
            XFS_BMDR_HDR_LEN,
            XFS_BMBT_KEY_SIZE + XFS_BMBT_PTR_SIZE,
        );
        if level == 0 || level >= XFS_BTREE_MAXLEVELS {
            return Err(ParseError::InvalidField {
                field: "bb_level",
                reason: "in-inode bmbt root must be an internal level",
            });
        }
        if numrecs == 0 || numrecs > maxrecs {
            return Err(ParseError::InvalidField {
                field: "bb_numrecs",
                reason: "outside 1..=maxrecs for the fork size",
            });
        }
        let ptr_base = XFS_BMDR_HDR_LEN + maxrecs * XFS_BMBT_KEY_SIZE;
        let keys = (0..numrecs)
            .map(|idx| read_be_u64(fork, XFS_BMDR_HDR_LEN + idx * XFS_BMBT_KEY_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = (0..numrecs)
            .map(|idx| read_be_u64(fork, ptr_base + idx * XFS_BMBT_PTR_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ParseError::InvalidField {
                field: "bmdr_key",
                reason: "keys must ascend",
            });
        }
        Ok(Self { level, keys, ptrs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock_bytes(version: u16, incompat: u32) -> [u8; XFS_SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; XFS_SUPERBLOCK_SIZE];
        sb[0..4].copy_from_slice(&XFS_SB_MAGIC.to_be_bytes());
        sb[4..8].copy_from_slice(&4096_u32.to_be_bytes());
        sb[8..16].copy_from_slice(&65536_u64.to_be_bytes());
        sb[56..64].copy_from_slice(&128_u64.to_be_bytes());
        sb[84..88].copy_from_slice(&16384_u32.to_be_bytes());
        sb[88..92].copy_from_slice(&4_u32.to_be_bytes());
        sb[100..102].copy_from_slice(&(0xB4A0 | version).to_be_bytes());
        sb[102..104].copy_from_slice(&512_u16.to_be_bytes());
        sb[104..106].copy_from_slice(&512_u16.to_be_bytes());
        sb[106..108].copy_from_slice(&8_u16.to_be_bytes());
        sb[120] = 12;
        sb[121] = 9;
        sb[122] = 9;
        sb[123] = 3;
        sb[124] = 14;
        sb[216..220].copy_from_slice(&incompat.to_be_bytes());
        sb
    }

    #[test]
    fn parse_v5_superblock() {
        let sb = XfsSuperblock::parse_superblock_region(&superblock_bytes(
            5,
            XFS_SB_FEAT_INCOMPAT_SPINODES,
        ))
        .expect("parse");
        assert_eq!(sb.blocksize, 4096);
        assert_eq!(sb.agcount, 4);
        assert_eq!(sb.rootino, 128);
        assert!(sb.has_crc());
        assert!(sb.has_sparse_inodes());
        assert_eq!(sb.agino_bits(), 17);
    }

    #[test]
    fn v4_superblock_ignores_incompat_field() {
        let sb = XfsSuperblock::parse_superblock_region(&superblock_bytes(4, u32::MAX))
            .expect("parse");
        assert!(!sb.has_crc());
        assert!(!sb.has_sparse_inodes());
    }

    #[test]
    fn superblock_rejects_unknown_version() {
        let err =
            XfsSuperblock::parse_superblock_region(&superblock_bytes(3, 0)).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedVersion { version: 3, .. }));
    }

    #[test]
    fn superblock_rejects_blocklog_mismatch() {
        let mut raw = superblock_bytes(5, 0);
        raw[120] = 11;
        let err = XfsSuperblock::parse_superblock_region(&raw).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "sb_blocksize",
                ..
            }
        ));
    }

    #[test]
    fn address_arithmetic() {
        let sb = XfsSuperblock::parse_superblock_region(&superblock_bytes(5, 0)).expect("parse");
        // agblocks 16384, 8 sectors per 4K block.
        assert_eq!(sb.agbno_to_daddr(0, 3), Some(24));
        assert_eq!(sb.agbno_to_daddr(1, 0), Some(16384 * 8));
        let fsbno = (1_u64 << 14) | 5;
        assert_eq!(sb.split_fsbno(fsbno), (1, 5));
        assert_eq!(sb.fsbno_to_daddr(fsbno), Some((16384 + 5) * 8));
        assert_eq!(sb.split_ino((2_u64 << 17) | 99), (2, 99));
        assert_eq!(sb.agi_offset(1), Some(16384 * 4096 + 1024));
    }

    #[test]
    fn short_header_v4_and_v5() {
        let mut block = vec![0_u8; 512];
        block[0..4].copy_from_slice(&XFS_IBT_CRC_MAGIC.to_be_bytes());
        block[4..6].copy_from_slice(&1_u16.to_be_bytes());
        block[6..8].copy_from_slice(&3_u16.to_be_bytes());
        block[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        block[12..16].copy_from_slice(&9_u32.to_be_bytes());
        block[16..24].copy_from_slice(&24_u64.to_be_bytes());
        block[48..52].copy_from_slice(&2_u32.to_be_bytes());

        let v4 = XfsBtreeHeader::parse_short(&block, false).expect("v4");
        assert_eq!(v4.level, 1);
        assert_eq!(v4.numrecs, 3);
        assert_eq!(v4.leftsib, None);
        assert_eq!(v4.rightsib, Some(9));
        assert!(v4.crc_fields.is_none());

        let v5 = XfsBtreeHeader::parse_short(&block, true).expect("v5");
        let crc = v5.crc_fields.expect("crc fields");
        assert_eq!(crc.blkno, 24);
        assert_eq!(crc.owner, 2);
    }

    #[test]
    fn long_header_null_siblings() {
        let mut block = vec![0_u8; 512];
        block[0..4].copy_from_slice(&XFS_BMAP_CRC_MAGIC.to_be_bytes());
        block[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        block[16..24].copy_from_slice(&u64::MAX.to_be_bytes());
        block[56..64].copy_from_slice(&131_u64.to_be_bytes());
        let header = XfsBtreeHeader::parse_long(&block, true).expect("parse");
        assert_eq!(header.leftsib, None);
        assert_eq!(header.rightsib, None);
        assert_eq!(header.crc_fields.expect("crc").owner, 131);
    }

    #[test]
    fn block_crc_round_trip_and_mismatch() {
        let mut block = vec![0x5A_u8; 1024];
        let crc = xfs_block_crc(&block, XFS_BTREE_SBLOCK_CRC_OFF).expect("crc");
        block[XFS_BTREE_SBLOCK_CRC_OFF..XFS_BTREE_SBLOCK_CRC_OFF + 4]
            .copy_from_slice(&crc.to_le_bytes());
        verify_xfs_block_crc(&block, XFS_BTREE_SBLOCK_CRC_OFF).expect("valid");

        block[900] ^= 0x01;
        let err = verify_xfs_block_crc(&block, XFS_BTREE_SBLOCK_CRC_OFF).unwrap_err();
        assert!(matches!(err, ParseError::ChecksumMismatch { .. }));
    }

    #[test]
    fn inobt_record_dense_and_sparse() {
        let mut raw = [0_u8; XFS_INOBT_REC_SIZE];
        raw[0..4].copy_from_slice(&128_u32.to_be_bytes());
        raw[4..8].copy_from_slice(&62_u32.to_be_bytes());
        raw[8..16].copy_from_slice(&(!0b11_u64).to_be_bytes());
        let dense = XfsInobtRec::parse(&raw, false).expect("dense");
        assert_eq!(dense.freecount, 62);
        assert!(dense.covers(128) && dense.covers(191) && !dense.covers(192));
        assert!(dense.is_allocated(0) && dense.is_allocated(1));
        assert!(!dense.is_allocated(2));

        raw[4..6].copy_from_slice(&0xFF00_u16.to_be_bytes());
        raw[6] = 32;
        raw[7] = 30;
        let sparse = XfsInobtRec::parse(&raw, true).expect("sparse");
        assert_eq!(sparse.count, 32);
        assert_eq!(sparse.freecount, 30);
        assert!(sparse.is_hole(40));
        assert!(!sparse.is_allocated(40));
        assert!(sparse.is_allocated(1));
    }

    #[test]
    fn inobt_record_rejects_bad_freecount() {
        let mut raw = [0_u8; XFS_INOBT_REC_SIZE];
        raw[4..8].copy_from_slice(&65_u32.to_be_bytes());
        assert!(XfsInobtRec::parse(&raw, false).is_err());
    }

    #[test]
    fn bmbt_record_unpacks_bitfields() {
        let startoff = 0x1234_u64;
        let startblock = 0x0ABC_DEF0_u64;
        let blockcount = 77_u64;
        let l0 = (1_u64 << 63) | (startoff << 9) | (startblock >> 43);
        let l1 = ((startblock & ((1 << 43) - 1)) << 21) | blockcount;
        let mut raw = [0_u8; 16];
        raw[0..8].copy_from_slice(&l0.to_be_bytes());
        raw[8..16].copy_from_slice(&l1.to_be_bytes());

        let rec = XfsBmbtRec::parse(&raw).expect("parse");
        assert_eq!(rec.startoff, startoff);
        assert_eq!(rec.startblock, startblock);
        assert_eq!(rec.blockcount, blockcount);
        assert!(rec.unwritten);
        assert!(rec.covers(startoff + 76));
        assert!(!rec.covers(startoff + 77));
    }

    #[test]
    fn agi_parse_with_finobt() {
        let mut sector = vec![0_u8; 512];
        sector[0..4].copy_from_slice(&XFS_AGI_MAGIC.to_be_bytes());
        sector[8..12].copy_from_slice(&1_u32.to_be_bytes());
        sector[20..24].copy_from_slice(&3_u32.to_be_bytes());
        sector[24..28].copy_from_slice(&1_u32.to_be_bytes());
        sector[328..332].copy_from_slice(&4_u32.to_be_bytes());
        sector[332..336].copy_from_slice(&1_u32.to_be_bytes());
        let agi = XfsAgi::parse(&sector, true).expect("agi");
        assert_eq!(agi.seqno, 1);
        assert_eq!(agi.root, 3);
        assert!(agi.has_finobt());

        let v4 = XfsAgi::parse(&sector, false).expect("agi v4");
        assert!(!v4.has_finobt());

        sector[24..28].copy_from_slice(&0_u32.to_be_bytes());
        assert!(XfsAgi::parse(&sector, true).is_err());
    }

    #[test]
    fn maxrecs_matches_layout() {
        assert_eq!(btree_maxrecs(4096, XFS_BTREE_SBLOCK_CRC_LEN, 16), 252);
        assert_eq!(
            btree_maxrecs(
                4096,
                XFS_BTREE_SBLOCK_LEN,
                XFS_INOBT_KEY_SIZE + XFS_INOBT_PTR_SIZE
            ),
            510
        );
    }

    fn dinode_bytes(version: u8, format: u8) -> Vec<u8> {
        let mut raw = vec![0_u8; 512];
        raw[0..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
        raw[2..4].copy_from_slice(&0o100_640_u16.to_be_bytes());
        raw[4] = version;
        raw[5] = format;
        raw[6..8].copy_from_slice(&7_u16.to_be_bytes());
        raw[8..12].copy_from_slice(&1000_u32.to_be_bytes());
        raw[12..16].copy_from_slice(&100_u32.to_be_bytes());
        raw[16..20].copy_from_slice(&2_u32.to_be_bytes());
        raw[40..44].copy_from_slice(&1_700_000_000_i32.to_be_bytes());
        raw[44..48].copy_from_slice(&5_u32.to_be_bytes());
        raw[56..64].copy_from_slice(&10_000_u64.to_be_bytes());
        raw[64..72].copy_from_slice(&3_u64.to_be_bytes());
        raw[76..80].copy_from_slice(&2_u32.to_be_bytes());
        raw[144..148].copy_from_slice(&(-1_i32).to_be_bytes());
        raw[152..160].copy_from_slice(&131_u64.to_be_bytes());
        raw
    }

    #[test]
    fn dinode_core_by_version() {
        let v2 = XfsDinode::parse(&dinode_bytes(2, 2)).expect("v2");
        assert_eq!(v2.mode, 0o100_640);
        assert_eq!(v2.format, XfsForkFormat::Extents);
        assert_eq!((v2.uid, v2.gid, v2.nlink), (1000, 100, 2));
        assert_eq!(v2.mtime, XfsTimestamp { sec: 1_700_000_000, nsec: 5 });
        assert_eq!((v2.size, v2.nblocks, v2.nextents), (10_000, 3, 2));
        assert_eq!(v2.crtime, None);
        assert_eq!(v2.ino, None);
        assert_eq!(v2.data_fork.len(), 512 - XFS_DINODE_CORE_LEN);

        let v1 = XfsDinode::parse(&dinode_bytes(1, 2)).expect("v1");
        assert_eq!(v1.nlink, 7);

        let v3 = XfsDinode::parse(&dinode_bytes(3, 2)).expect("v3");
        assert_eq!(v3.ino, Some(131));
        assert_eq!(v3.crtime.map(|t| t.sec), Some(-1));
        assert_eq!(v3.data_fork.len(), 512 - XFS_DINODE_V3_CORE_LEN);

        let mut raw = dinode_bytes(3, 2);
        raw[82] = 20;
        assert_eq!(XfsDinode::parse(&raw).expect("attr fork").data_fork.len(), 160);
    }

    #[test]
    fn dinode_rejects_bad_magic_version_and_format() {
        let mut raw = dinode_bytes(2, 2);
        raw[0] = 0;
        assert!(matches!(XfsDinode::parse(&raw), Err(ParseError::InvalidMagic { .. })));
        assert!(matches!(
            XfsDinode::parse(&dinode_bytes(4, 2)),
            Err(ParseError::UnsupportedVersion { version: 4, .. })
        ));
        assert!(XfsDinode::parse(&dinode_bytes(2, 6)).is_err());
    }

    #[test]
    fn extent_list_is_bounded_by_the_fork() {
        let mut raw = dinode_bytes(2, 2);
        let rec = |startoff: u64, startblock: u64, count: u64| {
            let l0 = (startoff << 9) | (startblock >> 43);
            let l1 = (startblock << 21) | count;
            let mut out = [0_u8; 16];
            out[..8].copy_from_slice(&l0.to_be_bytes());
            out[8..].copy_from_slice(&l1.to_be_bytes());
            out
        };
        raw[100..116].copy_from_slice(&rec(0, 80, 2));
        raw[116..132].copy_from_slice(&rec(4, 90, 1));
        let inode = XfsDinode::parse(&raw).expect("inode");
        let extents = inode.extent_list().expect("extents");
        assert_eq!(extents.len(), 2);
        assert_eq!((extents[1].startoff, extents[1].startblock), (4, 90));

        raw[76..80].copy_from_slice(&1000_u32.to_be_bytes());
        let inode = XfsDinode::parse(&raw).expect("inode");
        assert!(inode.extent_list().is_err());

        raw[76..80].copy_from_slice(&2_u32.to_be_bytes());
        raw[116..132].copy_from_slice(&rec(1, 90, 1));
        let inode = XfsDinode::parse(&raw).expect("inode");
        assert!(inode.extent_list().is_err(), "overlapping extents");
    }

    #[test]
    fn bmdr_pointers_follow_maxrecs_keys() {
        // 76-byte fork: maxrecs = (76 - 4) / 16 = 4.
        let mut fork = vec![0_u8; 76];
        fork[0..2].copy_from_slice(&1_u16.to_be_bytes());
        fork[2..4].copy_from_slice(&2_u16.to_be_bytes());
        fork[4..12].copy_from_slice(&0_u64.to_be_bytes());
        fork[12..20].copy_from_slice(&64_u64.to_be_bytes());
        fork[36..44].copy_from_slice(&74_u64.to_be_bytes());
        fork[44..52].copy_from_slice(&75_u64.to_be_bytes());
        let root = XfsBmdrBlock::parse(&fork).expect("root");
        assert_eq!(root.level, 1);
        assert_eq!(root.keys, vec![0, 64]);
        assert_eq!(root.ptrs, vec![74, 75]);

        fork[2..4].copy_from_slice(&5_u16.to_be_bytes());
        assert!(XfsBmdrBlock::parse(&fork).is_err());
        fork[0..4].copy_from_slice(&[0, 0, 0, 1]);
        assert!(XfsBmdrBlock::parse(&fork).is_err());
    }
}
