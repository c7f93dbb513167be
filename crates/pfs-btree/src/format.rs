//! Traits a concrete on-disk format implements to plug into the engine.

use std::cmp::Ordering;
use std::fmt;

use pfs_types::{NodeRef, ParseError};

use crate::layout::NodeLayout;
use crate::node::{Node, NodeHeader};

/// Key decoding and ordering for one tree type.
pub trait KeyCodec {
    type Key: Clone + fmt::Debug + Send + Sync;

    /// Total order over keys as the format defines it.
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Decode a key from the start of `raw`.
    fn decode_key(&self, raw: &[u8]) -> Result<Self::Key, ParseError>;

    /// Whether `candidate` shares the leading fields of `prefix`.
    ///
    /// For every prefix the matching keys must form one contiguous run in
    /// key order.
    fn matches_prefix(&self, candidate: &Self::Key, prefix: &Self::Key) -> bool;

    /// Smallest key sharing `prefix`'s leading fields. Prefix scans start
    /// here so entries whose trailing fields sort below the caller's key
    /// are not skipped.
    fn prefix_start(&self, prefix: &Self::Key) -> Self::Key {
        prefix.clone()
    }
}

/// A complete node format: geometry, addressing, checksum and decoding.
pub trait TreeFormat: KeyCodec + Send + Sync {
    type Record: Clone + fmt::Debug + Send + Sync;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn layout(&self) -> &NodeLayout;

    /// Byte offset on the block source of node `node`.
    fn locate(&self, node: NodeRef) -> Result<u64, ParseError>;

    /// Verify the node checksum over the raw bytes. Only called for
    /// `HeaderVersion::Extended` layouts and before any decoding.
    fn verify_checksum(&self, _node: NodeRef, _raw: &[u8]) -> Result<(), ParseError> {
        Ok(())
    }

    /// Decode raw node bytes into header and entries.
    ///
    /// Implementations must call `NodeLayout::check_record_count` before
    /// reading entries so a corrupt count never causes out-of-bounds reads.
    fn decode_node(
        &self,
        node: NodeRef,
        raw: &[u8],
    ) -> Result<Node<Self::Key, Self::Record>, ParseError>;

    /// Format-specific identity checks on a decoded header (self-address,
    /// filesystem UUID). Returns a description of the first mismatch.
    fn check_identity(&self, _node: NodeRef, _header: &NodeHeader) -> Result<(), String> {
        Ok(())
    }
}
