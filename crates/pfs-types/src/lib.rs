#![forbid(unsafe_code)]
//! Shared vocabulary for PolyFS: unit-carrying newtypes, the parse-layer
//! error, and bounds-checked field readers for both byte orders.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── btrfs ───────────────────────────────────────────────────────────────────

pub const BTRFS_SUPER_INFO_OFFSET: usize = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// btrfs checksum algorithm types (stored in superblock `csum_type` field).
pub const BTRFS_CSUM_TYPE_CRC32C: u16 = 0;
pub const BTRFS_CSUM_TYPE_XXHASH64: u16 = 1;
pub const BTRFS_CSUM_TYPE_SHA256: u16 = 2;
pub const BTRFS_CSUM_TYPE_BLAKE2B: u16 = 3;

// ── XFS ─────────────────────────────────────────────────────────────────────

pub const XFS_SUPERBLOCK_OFFSET: usize = 0;
pub const XFS_SUPERBLOCK_SIZE: usize = 512;
/// "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x5846_5342;
/// "XAGI"
pub const XFS_AGI_MAGIC: u32 = 0x5841_4749;

// ── HFS+ ────────────────────────────────────────────────────────────────────

pub const HFSPLUS_VOLUME_HEADER_OFFSET: usize = 1024;
pub const HFSPLUS_VOLUME_HEADER_SIZE: usize = 512;
/// "H+"
pub const HFSPLUS_SIGNATURE: u16 = 0x482B;
/// "HX" (case-sensitive variant)
pub const HFSX_SIGNATURE: u16 = 0x4858;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Reference to an on-disk tree node, in the owning format's addressing unit
/// (btrfs logical bytenr, XFS AG block or filesystem block, HFS+ node number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef(pub u64);

/// Inode number as the VFS layer sees it; each filesystem context decides
/// how it maps onto on-disk identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// 16-byte on-disk UUID, kept in on-disk byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FsUuid(pub [u8; 16]);

impl FsUuid {
    pub const NIL: Self = Self([0; 16]);

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error("unsupported {field} version {version}")]
    UnsupportedVersion { field: &'static str, version: u64 },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_be_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_be_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    Ok(i16::from_be_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_be_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_be_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `u32` to `usize` with an explicit error path.
pub fn u32_to_usize(value: u32, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FsUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if matches!(idx, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers_both_orders() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_le_u16(&bytes, 0).unwrap(), 0x0201);
        assert_eq!(read_be_u16(&bytes, 0).unwrap(), 0x0102);
        assert_eq!(read_le_u32(&bytes, 0).unwrap(), 0x0403_0201);
        assert_eq!(read_be_u32(&bytes, 0).unwrap(), 0x0102_0304);
        assert_eq!(read_le_u64(&bytes, 0).unwrap(), 0x0807_0605_0403_0201);
        assert_eq!(read_be_u64(&bytes, 0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(read_be_i16(&[0xFF, 0xFF], 0).unwrap(), -1);
        assert_eq!(read_u8(&bytes, 7).unwrap(), 8);
    }

    #[test]
    fn test_read_past_end_reports_insufficient_data() {
        let bytes = [0_u8; 6];
        let err = read_be_u64(&bytes, 2).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 2,
                actual: 4,
            }
        );
    }

    #[test]
    fn test_offset_overflow_is_invalid_field() {
        let err = ensure_slice(&[0_u8; 4], usize::MAX, 2).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "offset", .. }));
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"label\0\0\0"), "label");
        assert_eq!(trim_nul_padded(b"  spaced \0"), "spaced");
        assert_eq!(trim_nul_padded(b"\0"), "");
    }

    #[test]
    fn test_u32_to_usize_widens() {
        assert_eq!(u32_to_usize(4096, "nodesize"), Ok(4096));
    }

    #[test]
    fn test_uuid_display() {
        let uuid = FsUuid([
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        assert_eq!(uuid.to_string(), "12345678-9abc-def0-0123-456789abcdef");
        assert!(FsUuid::NIL.is_nil());
        assert!(!uuid.is_nil());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: stored 0x00000001, computed 0x00000002"
        );
        let err = ParseError::UnsupportedVersion {
            field: "btree_magic",
            version: 4,
        };
        assert_eq!(err.to_string(), "unsupported btree_magic version 4");
    }
}
