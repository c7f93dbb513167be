//! LVM2 logical volumes assembled from already-parsed metadata.
//!
//! Only linear volumes are readable: every segment must be `striped` with
//! a single stripe, and segments must cover the volume's extents without
//! gaps. The result is a [`ConcatSource`] any filesystem context can open.

use std::sync::Arc;

use pfs_block::{BlockSource, ConcatSource, ExtentMappedSource};
use pfs_error::{PfsError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Extent sizes are counted in sectors of this many bytes.
pub const LVM_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvStatus {
    pub read: bool,
    pub write: bool,
    pub visible: bool,
}

impl LvStatus {
    /// Status from metadata flags such as `["READ", "WRITE", "VISIBLE"]`.
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut status = Self::default();
        for flag in flags {
            match flag.trim().to_ascii_lowercase().as_str() {
                "read" => status.read = true,
                "write" => status.write = true,
                "visible" => status.visible = true,
                other => {
                    return Err(PfsError::Parse(format!(
                        "unexpected logical volume status {other:?}"
                    )));
                }
            }
        }
        Ok(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Striped,
    Other(String),
}

impl SegmentKind {
    #[must_use]
    pub fn parse(kind: &str) -> Self {
        if kind.trim().eq_ignore_ascii_case("striped") {
            Self::Striped
        } else {
            Self::Other(kind.trim().to_owned())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvStripe {
    pub pv_name: String,
    /// First extent on the physical volume.
    pub start_extent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvSegment {
    /// First extent within the logical volume.
    pub start_extent: u64,
    pub extent_count: u64,
    pub kind: SegmentKind,
    pub stripes: Vec<LvStripe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub status: LvStatus,
    pub segments: Vec<LvSegment>,
}

/// A physical volume's content and the byte offsets of its data areas.
#[derive(Clone)]
pub struct PhysicalVolume {
    pub name: String,
    pub data_areas: Vec<u64>,
    pub source: Arc<dyn BlockSource>,
}

impl std::fmt::Debug for PhysicalVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalVolume")
            .field("name", &self.name)
            .field("data_areas", &self.data_areas)
            .field("len", &self.source.len_bytes())
            .finish()
    }
}

fn extent_bytes(extents: u64, extent_size: u64) -> Result<u64> {
    extents
        .checked_mul(extent_size)
        .and_then(|sectors| sectors.checked_mul(LVM_SECTOR_SIZE))
        .ok_or_else(|| PfsError::InvalidGeometry(format!("{extents} extents overflow u64")))
}

impl LogicalVolume {
    /// Assemble the volume from `pvs`. `extent_size` is in sectors.
    pub fn open(&self, pvs: &[PhysicalVolume], extent_size: u64) -> Result<ConcatSource> {
        if !self.status.read {
            return Err(PfsError::UnsupportedFeature(format!(
                "logical volume {} is not readable",
                self.name
            )));
        }
        let mut segments: Vec<&LvSegment> = self.segments.iter().collect();
        if let Some(other) = segments.iter().find_map(|seg| match &seg.kind {
            SegmentKind::Striped => None,
            SegmentKind::Other(kind) => Some(kind),
        }) {
            return Err(PfsError::UnsupportedFeature(format!(
                "logical volume segment type {other}"
            )));
        }
        segments.sort_by_key(|seg| seg.start_extent);

        let mut next = 0_u64;
        for seg in &segments {
            if seg.start_extent != next {
                return Err(PfsError::InvalidGeometry(format!(
                    "logical volume {} extents are non-contiguous at {next}",
                    self.name
                )));
            }
            next = next.checked_add(seg.extent_count).ok_or_else(|| {
                PfsError::InvalidGeometry("logical volume extent count overflows".to_owned())
            })?;
        }

        let parts = segments
            .into_iter()
            .map(|seg| open_segment(seg, pvs, extent_size))
            .collect::<Result<Vec<_>>>()?;
        let volume = ConcatSource::new(parts)?;
        debug!(
            name = %self.name,
            segments = volume.part_count(),
            len = volume.len_bytes(),
            "lvm_volume_open"
        );
        Ok(volume)
    }
}

fn open_segment(
    seg: &LvSegment,
    pvs: &[PhysicalVolume],
    extent_size: u64,
) -> Result<Arc<dyn BlockSource>> {
    let [stripe] = seg.stripes.as_slice() else {
        return Err(PfsError::UnsupportedFeature(format!(
            "segment with {} stripes",
            seg.stripes.len()
        )));
    };
    let pv = pvs
        .iter()
        .find(|pv| pv.name == stripe.pv_name)
        .ok_or_else(|| PfsError::NotFound(format!("physical volume {}", stripe.pv_name)))?;
    let [data_area] = pv.data_areas.as_slice() else {
        return Err(PfsError::UnsupportedFeature(format!(
            "physical volume {} has {} data areas",
            pv.name,
            pv.data_areas.len()
        )));
    };
    let start = extent_bytes(stripe.start_extent, extent_size)?
        .checked_add(*data_area)
        .ok_or_else(|| PfsError::InvalidGeometry("segment start overflows u64".to_owned()))?;
    let length = extent_bytes(seg.extent_count, extent_size)?;
    let window = ExtentMappedSource::sub_range(Arc::clone(&pv.source), start, length)?;
    Ok(Arc::new(window))
}

#[cfg(test)]
mod tests {
    use pfs_block::MemBlockSource;

    use super::*;

    /// One sector per extent keeps the fixtures small.
    const EXTENT: u64 = 1;
    const DATA_AREA: u64 = 1024;

    fn pv(name: &str, fill: &[u8]) -> PhysicalVolume {
        let mut bytes = vec![0_u8; DATA_AREA as usize];
        for byte in fill {
            bytes.extend(std::iter::repeat_n(*byte, LVM_SECTOR_SIZE as usize));
        }
        PhysicalVolume {
            name: name.to_owned(),
            data_areas: vec![DATA_AREA],
            source: Arc::new(MemBlockSource::new(bytes)),
        }
    }

    fn segment(start_extent: u64, extent_count: u64, pv_name: &str, pv_start: u64) -> LvSegment {
        LvSegment {
            start_extent,
            extent_count,
            kind: SegmentKind::Striped,
            stripes: vec![LvStripe {
                pv_name: pv_name.to_owned(),
                start_extent: pv_start,
            }],
        }
    }

    fn volume(segments: Vec<LvSegment>) -> LogicalVolume {
        LogicalVolume {
            name: "root".to_owned(),
            status: LvStatus::from_flags(["READ", "WRITE", "VISIBLE"]).expect("flags"),
            segments,
        }
    }

    fn sector_tags(src: &ConcatSource) -> Vec<u8> {
        let sectors = src.len_bytes() / LVM_SECTOR_SIZE;
        (0..sectors)
            .map(|i| src.read_at(i * LVM_SECTOR_SIZE, 1).expect("read").as_slice()[0])
            .collect()
    }

    #[test]
    fn segments_are_sorted_and_concatenated() {
        let pvs = [pv("pv0", b"abcd"), pv("pv1", b"wxyz")];
        let lv = volume(vec![segment(2, 2, "pv0", 0), segment(0, 2, "pv1", 1)]);
        let src = lv.open(&pvs, EXTENT).expect("open");
        assert_eq!(src.part_count(), 2);
        assert_eq!(sector_tags(&src), b"xyab");
    }

    #[test]
    fn reads_cross_segment_boundaries() {
        let pvs = [pv("pv0", b"ab"), pv("pv1", b"cd")];
        let lv = volume(vec![segment(0, 1, "pv0", 1), segment(1, 1, "pv1", 0)]);
        let src = lv.open(&pvs, EXTENT).expect("open");
        let mut buf = [0_u8; 4];
        src.read_exact_at(LVM_SECTOR_SIZE - 2, &mut buf).expect("read");
        assert_eq!(&buf, b"bbcc");
    }

    #[test]
    fn gaps_between_segments_are_rejected() {
        let pvs = [pv("pv0", b"abcd")];
        let lv = volume(vec![segment(0, 1, "pv0", 0), segment(2, 1, "pv0", 1)]);
        assert!(matches!(
            lv.open(&pvs, EXTENT),
            Err(PfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn unreadable_volumes_are_rejected() {
        let pvs = [pv("pv0", b"a")];
        let mut lv = volume(vec![segment(0, 1, "pv0", 0)]);
        lv.status = LvStatus::from_flags(["WRITE"]).expect("flags");
        assert!(matches!(
            lv.open(&pvs, EXTENT),
            Err(PfsError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn mirrored_and_multi_stripe_segments_are_unsupported() {
        let pvs = [pv("pv0", b"ab"), pv("pv1", b"ab")];
        let mut mirrored = segment(0, 1, "pv0", 0);
        mirrored.kind = SegmentKind::parse("mirror");
        assert!(matches!(
            volume(vec![mirrored]).open(&pvs, EXTENT),
            Err(PfsError::UnsupportedFeature(_))
        ));

        let mut striped = segment(0, 2, "pv0", 0);
        striped.stripes.push(LvStripe {
            pv_name: "pv1".to_owned(),
            start_extent: 0,
        });
        assert!(matches!(
            volume(vec![striped]).open(&pvs, EXTENT),
            Err(PfsError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn missing_physical_volume_is_not_found() {
        let pvs = [pv("pv0", b"a")];
        let lv = volume(vec![segment(0, 1, "pv9", 0)]);
        assert!(matches!(lv.open(&pvs, EXTENT), Err(PfsError::NotFound(_))));
    }

    #[test]
    fn segment_past_the_physical_volume_is_invalid_geometry() {
        let pvs = [pv("pv0", b"ab")];
        let lv = volume(vec![segment(0, 3, "pv0", 0)]);
        assert!(matches!(
            lv.open(&pvs, EXTENT),
            Err(PfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn unknown_status_flag_is_a_parse_error() {
        assert!(matches!(
            LvStatus::from_flags(["READ", "LOCKED"]),
            Err(PfsError::Parse(_))
        ));
        assert_eq!(SegmentKind::parse(" Striped "), SegmentKind::Striped);
    }
}
