//! Extents-overflow tree and fork assembly.

use std::cmp::Ordering;

use pfs_block::Segment;
use pfs_error::PfsError;
use pfs_ondisk::hfsplus::{
    HFS_EXTENT_DENSITY, HfsExtentDescriptor, HfsExtentKey, parse_extent_record,
};
use pfs_types::ParseError;

use crate::format::HfsTreeKind;

/// Eight extent descriptors continuing a fork.
pub type ExtentRecord = [HfsExtentDescriptor; HFS_EXTENT_DENSITY];

/// Extents-overflow file codec. Keys order by file id, fork type, then
/// start block; the prefix of a key is its `(fork type, file id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentsKind;

impl HfsTreeKind for ExtentsKind {
    type Key = HfsExtentKey;
    type Record = ExtentRecord;

    const NAME: &'static str = "hfsplus-extents";
    const MIN_LEAF_RECORD: usize = 12 + 8 * HFS_EXTENT_DENSITY;
    const MIN_INDEX_KEY: usize = 12;

    fn compare(&self, a: &HfsExtentKey, b: &HfsExtentKey) -> Ordering {
        (a.file_id, a.fork_type, a.start_block).cmp(&(b.file_id, b.fork_type, b.start_block))
    }

    fn parse_key(&self, record: &[u8]) -> Result<(HfsExtentKey, usize), ParseError> {
        HfsExtentKey::parse(record)
    }

    fn parse_record(&self, data: &[u8]) -> Result<ExtentRecord, ParseError> {
        parse_extent_record(data, 0)
    }

    fn matches_prefix(&self, candidate: &HfsExtentKey, prefix: &HfsExtentKey) -> bool {
        candidate.file_id == prefix.file_id && candidate.fork_type == prefix.fork_type
    }

    fn prefix_start(&self, prefix: &HfsExtentKey) -> HfsExtentKey {
        HfsExtentKey {
            start_block: 0,
            ..*prefix
        }
    }
}

/// Byte segments of a fork made of `extents`, cut at `logical_size`.
///
/// The segments map fork offsets to volume offsets and tile
/// `[0, logical_size)` without gaps.
pub fn fork_segments(
    block_size: u32,
    logical_size: u64,
    extents: &[HfsExtentDescriptor],
) -> Result<Vec<Segment>, PfsError> {
    let block_size = u64::from(block_size);
    let mut segments = Vec::new();
    let mut logical = 0_u64;
    for extent in extents.iter().filter(|e| e.block_count != 0) {
        if logical >= logical_size {
            break;
        }
        let physical = u64::from(extent.start_block) * block_size;
        let length = (u64::from(extent.block_count) * block_size).min(logical_size - logical);
        segments.push(Segment {
            logical,
            physical,
            length,
        });
        logical += length;
    }
    if logical < logical_size {
        return Err(PfsError::InvalidGeometry(format!(
            "fork of {logical_size} bytes has extents for only {logical}"
        )));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_ondisk::hfsplus::{HFS_DATA_FORK, HFS_RESOURCE_FORK};

    fn extent(start_block: u32, block_count: u32) -> HfsExtentDescriptor {
        HfsExtentDescriptor {
            start_block,
            block_count,
        }
    }

    #[test]
    fn segments_tile_the_fork() {
        let extents = [extent(10, 2), extent(40, 1), extent(0, 0)];
        let segments = fork_segments(4096, 10_000, &extents).expect("segments");
        assert_eq!(
            segments,
            vec![
                Segment {
                    logical: 0,
                    physical: 40_960,
                    length: 8192,
                },
                Segment {
                    logical: 8192,
                    physical: 163_840,
                    length: 1808,
                },
            ]
        );
    }

    #[test]
    fn extents_past_logical_size_are_dropped() {
        let segments = fork_segments(512, 512, &[extent(3, 1), extent(9, 4)]).expect("segments");
        assert_eq!(segments.len(), 1);
        assert!(fork_segments(512, 0, &[extent(3, 1)]).expect("empty").is_empty());
    }

    #[test]
    fn short_fork_is_rejected() {
        let err = fork_segments(4096, 9000, &[extent(10, 2)]).unwrap_err();
        assert!(matches!(err, PfsError::InvalidGeometry(_)));
    }

    #[test]
    fn key_order_and_prefix() {
        let kind = ExtentsKind;
        let data = HfsExtentKey {
            fork_type: HFS_DATA_FORK,
            file_id: 30,
            start_block: 8,
        };
        let rsrc = HfsExtentKey {
            fork_type: HFS_RESOURCE_FORK,
            file_id: 30,
            start_block: 0,
        };
        let other = HfsExtentKey {
            fork_type: HFS_DATA_FORK,
            file_id: 31,
            start_block: 0,
        };
        assert_eq!(kind.compare(&data, &rsrc), Ordering::Less);
        assert_eq!(kind.compare(&rsrc, &other), Ordering::Less);
        assert!(kind.matches_prefix(&kind.prefix_start(&data), &data));
        assert!(!kind.matches_prefix(&rsrc, &data));
        assert_eq!(kind.prefix_start(&data).start_block, 0);
    }
}
