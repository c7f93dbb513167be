#![forbid(unsafe_code)]
//! Error types for PolyFS.
//!
//! # Error Taxonomy
//!
//! PolyFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `PfsError` | `pfs-error` (this crate) | Errors surfaced by tree traversal, the VFS layer and the CLI |
//!
//! A key that is absent from an intact tree is *not* an error: lookups
//! return `Ok(None)`. Every variant below means the operation could not
//! produce a trustworthy answer.
//!
//! ## Mapping Policy: ParseError → PfsError
//!
//! `pfs-error` is independent of `pfs-types` to avoid cyclic dependencies.
//! The conversion lives in `pfs-btree` (`node_error`), which depends on both.
//!
//! | ParseError Variant | PfsError Variant | Rationale |
//! |--------------------|------------------|-----------|
//! | `InsufficientData` | `Structural { block, detail }` | Node geometry does not fit its declared size |
//! | `InvalidField` | `Structural { block, detail }` | Out-of-range field; this branch cannot be trusted |
//! | `IntegerConversion` | `Structural { block, detail }` | Arithmetic overflow in parsed values |
//! | `InvalidMagic` | `UnsupportedFormat(detail)` | Unrecognized layout; the engine declines to guess |
//! | `UnsupportedVersion` | `UnsupportedFormat(detail)` | Same as above |
//! | `ChecksumMismatch` | `Corruption { block, detail }` | Stored and recomputed checksum disagree |
//!
//! ## Errno Mapping
//!
//! Every `PfsError` variant maps to exactly one POSIX errno via
//! [`PfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Structural` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `UnsupportedFormat` | `EOPNOTSUPP` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all PolyFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Block source I/O error (wraps `std::io::Error`). Propagated verbatim,
    /// never retried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node geometry is inconsistent with its declared size or record count.
    ///
    /// The traversal branch that produced it cannot safely continue.
    #[error("structural error in node {block}: {detail}")]
    Structural { block: u64, detail: String },

    /// Checksum, owner, level-sequence or ordering validation failed.
    ///
    /// The data may be damaged or adversarial. Never downgraded to "not found".
    #[error("corrupt metadata at node {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Unrecognized magic or on-disk version.
    #[error("unsupported on-disk format: {0}")]
    UnsupportedFormat(String),

    /// The image uses a feature this build does not read (compression,
    /// multi-stripe segments, ...).
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Parse-layer error surfaced without node context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Path component or named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// PolyFS never writes; any mutating request ends here.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl PfsError {
    /// Convert this error into a POSIX errno suitable for a VFS reply.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Structural { .. } | Self::Corruption { .. } => libc::EIO,
            Self::UnsupportedFormat(_) | Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether the error came from tree validation (as opposed to I/O or
    /// caller misuse). Callers use this to report a damaged subtree without
    /// failing the whole mount.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Structural { .. } | Self::Corruption { .. })
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                PfsError::Structural {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (
                PfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (PfsError::UnsupportedFormat("test".into()), libc::EOPNOTSUPP),
            (
                PfsError::UnsupportedFeature("zstd".into()),
                libc::EOPNOTSUPP,
            ),
            (PfsError::Parse("test".into()), libc::EINVAL),
            (PfsError::InvalidGeometry("nodesize=0".into()), libc::EINVAL),
            (PfsError::NotFound("test".into()), libc::ENOENT),
            (PfsError::NotDirectory, libc::ENOTDIR),
            (PfsError::IsDirectory, libc::EISDIR),
            (PfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = PfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = PfsError::Corruption {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at node 42: bad checksum");

        let err = PfsError::Structural {
            block: 7,
            detail: "record count 900 exceeds capacity 120".into(),
        };
        assert_eq!(
            err.to_string(),
            "structural error in node 7: record count 900 exceeds capacity 120"
        );

        let unsup = PfsError::UnsupportedFormat("btree magic 0xdeadbeef".into());
        assert_eq!(
            unsup.to_string(),
            "unsupported on-disk format: btree magic 0xdeadbeef"
        );
        assert_eq!(PfsError::ReadOnly.to_string(), "read-only filesystem");
    }

    #[test]
    fn integrity_failures_are_distinguished() {
        assert!(
            PfsError::Corruption {
                block: 1,
                detail: String::new()
            }
            .is_integrity_failure()
        );
        assert!(
            PfsError::Structural {
                block: 1,
                detail: String::new()
            }
            .is_integrity_failure()
        );
        assert!(!PfsError::NotFound("x".into()).is_integrity_failure());
        assert!(!PfsError::Io(std::io::Error::other("x")).is_integrity_failure());
    }
}
