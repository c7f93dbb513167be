//! Mapping from parse-layer errors to runtime errors.

use pfs_error::PfsError;
use pfs_types::{NodeRef, ParseError};

/// Convert a `ParseError` raised while decoding `node` into a `PfsError`.
///
/// Geometry problems become `Structural`, checksum disagreement becomes
/// `Corruption`, and unrecognised magic or versions become
/// `UnsupportedFormat`.
#[must_use]
pub fn node_error(node: NodeRef, err: ParseError) -> PfsError {
    match err {
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => PfsError::Structural {
            block: node.0,
            detail: err.to_string(),
        },
        ParseError::InvalidMagic { .. } | ParseError::UnsupportedVersion { .. } => {
            PfsError::UnsupportedFormat(format!("node {}: {err}", node.0))
        }
        ParseError::ChecksumMismatch { .. } => PfsError::Corruption {
            block: node.0,
            detail: err.to_string(),
        },
    }
}

/// Convert a `ParseError` raised outside any tree node (superblocks,
/// volume headers, item payloads).
#[must_use]
pub fn parse_error(what: &str, err: ParseError) -> PfsError {
    match err {
        ParseError::InvalidMagic { .. } | ParseError::UnsupportedVersion { .. } => {
            PfsError::UnsupportedFormat(format!("{what}: {err}"))
        }
        ParseError::ChecksumMismatch { .. } => PfsError::Corruption {
            block: 0,
            detail: format!("{what}: {err}"),
        },
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => PfsError::Parse(format!("{what}: {err}")),
    }
}

pub(crate) fn structural(node: NodeRef, detail: impl Into<String>) -> PfsError {
    PfsError::Structural {
        block: node.0,
        detail: detail.into(),
    }
}

pub(crate) fn corruption(node: NodeRef, detail: impl Into<String>) -> PfsError {
    PfsError::Corruption {
        block: node.0,
        detail: detail.into(),
    }
}
