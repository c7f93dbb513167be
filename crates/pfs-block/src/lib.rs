#![forbid(unsafe_code)]
//! Read-only block sources.
//!
//! Provides the `BlockSource` trait (absolute-offset reads, no shared seek
//! position), a file-backed source using `pread`, an in-memory source for
//! synthetic images, `ExtentMappedSource`, which stitches sub-ranges of
//! another source into one contiguous address space (fork extents), and
//! `ConcatSource`, which lays whole sources end to end (LVM segments).

use pfs_error::{PfsError, Result};
use pfs_types::{
    BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, HFSPLUS_VOLUME_HEADER_OFFSET,
    HFSPLUS_VOLUME_HEADER_SIZE, XFS_SUPERBLOCK_OFFSET, XFS_SUPERBLOCK_SIZE,
};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned buffer holding the bytes of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn out_of_range(offset: u64, len: usize, source_len: u64) -> PfsError {
    PfsError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read out of bounds: offset={offset} len={len} source_len={source_len}"),
    ))
}

fn checked_end(offset: u64, len: usize) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| PfsError::InvalidGeometry("read length overflows u64".to_owned()))?;
    offset
        .checked_add(len)
        .ok_or_else(|| PfsError::InvalidGeometry("read range overflows u64".to_owned()))
}

/// Byte-addressed, read-only source (pread semantics).
///
/// Every read is addressed by absolute offset, so independent readers on
/// different threads never contend for a cursor position.
pub trait BlockSource: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// Fails with `PfsError::Io` when the range is out of bounds or the
    /// medium is unreadable.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_at(&self, offset: u64, len: usize) -> Result<BlockBuf> {
        let mut bytes = vec![0_u8; len];
        self.read_exact_at(offset, &mut bytes)?;
        Ok(BlockBuf::new(bytes))
    }
}

impl<S: BlockSource + ?Sized> BlockSource for &S {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<S: BlockSource + ?Sized> BlockSource for Arc<S> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// File-backed source using `pread`.
///
/// Opened read-only; PolyFS never writes to an image.
#[derive(Debug, Clone)]
pub struct FileBlockSource {
    file: Arc<File>,
    len: u64,
}

impl FileBlockSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl BlockSource for FileBlockSource {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(out_of_range(offset, buf.len(), self.len));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory source over a shared byte image.
#[derive(Debug, Clone)]
pub struct MemBlockSource {
    bytes: Arc<[u8]>,
}

impl MemBlockSource {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl BlockSource for MemBlockSource {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        let start = usize::try_from(offset).ok();
        let stop = usize::try_from(end).ok();
        match (start, stop) {
            (Some(start), Some(stop)) if stop <= self.bytes.len() => {
                buf.copy_from_slice(&self.bytes[start..stop]);
                Ok(())
            }
            _ => Err(out_of_range(offset, buf.len(), self.len_bytes())),
        }
    }
}

/// One contiguous run of an [`ExtentMappedSource`]: `length` bytes that
/// appear at `logical` in the mapped space and live at `physical` in the
/// inner source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

/// A source assembled from ordered, gap-free segments of another source.
///
/// Used for HFS+ fork content (extent list → byte stream) and for LVM
/// logical volumes (segment list → volume).
#[derive(Debug, Clone)]
pub struct ExtentMappedSource<S> {
    inner: S,
    segments: Vec<Segment>,
    len: u64,
}

impl<S: BlockSource> ExtentMappedSource<S> {
    /// Build from segments that must tile `[0, total)` without gaps or
    /// overlaps, in ascending logical order.
    pub fn new(inner: S, segments: Vec<Segment>) -> Result<Self> {
        let mut expected = 0_u64;
        for seg in &segments {
            if seg.logical != expected {
                return Err(PfsError::InvalidGeometry(format!(
                    "segment at logical {} does not follow previous end {expected}",
                    seg.logical
                )));
            }
            let physical_end = seg.physical.checked_add(seg.length).ok_or_else(|| {
                PfsError::InvalidGeometry("segment physical range overflows u64".to_owned())
            })?;
            if physical_end > inner.len_bytes() {
                return Err(PfsError::InvalidGeometry(format!(
                    "segment physical end {physical_end} exceeds source length {}",
                    inner.len_bytes()
                )));
            }
            expected = expected.checked_add(seg.length).ok_or_else(|| {
                PfsError::InvalidGeometry("segment logical range overflows u64".to_owned())
            })?;
        }
        Ok(Self {
            inner,
            segments,
            len: expected,
        })
    }

    /// A window of `length` bytes starting at `offset` in `inner`.
    pub fn sub_range(inner: S, offset: u64, length: u64) -> Result<Self> {
        Self::new(
            inner,
            vec![Segment {
                logical: 0,
                physical: offset,
                length,
            }],
        )
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn segment_for(&self, logical: u64) -> Option<&Segment> {
        let idx = self.segments.partition_point(|s| s.logical <= logical);
        let seg = self.segments.get(idx.checked_sub(1)?)?;
        (logical < seg.logical + seg.length).then_some(seg)
    }
}

impl<S: BlockSource> BlockSource for ExtentMappedSource<S> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(out_of_range(offset, buf.len(), self.len));
        }

        let mut done = 0_usize;
        let mut pos = offset;
        while done < buf.len() {
            let seg = self
                .segment_for(pos)
                .ok_or_else(|| out_of_range(pos, buf.len() - done, self.len))?;
            let within = pos - seg.logical;
            let avail = seg.length - within;
            let take = usize::try_from(avail)
                .map_or(buf.len() - done, |avail| avail.min(buf.len() - done));
            trace!(
                logical = pos,
                physical = seg.physical + within,
                len = take,
                "extent_mapped_read"
            );
            self.inner
                .read_exact_at(seg.physical + within, &mut buf[done..done + take])?;
            done += take;
            pos += u64::try_from(take).unwrap_or(u64::MAX);
        }
        Ok(())
    }
}

/// Whole sources laid end to end: part `i` starts where part `i - 1` ends.
#[derive(Clone)]
pub struct ConcatSource {
    parts: Vec<Arc<dyn BlockSource>>,
    starts: Vec<u64>,
    len: u64,
}

impl ConcatSource {
    pub fn new(parts: Vec<Arc<dyn BlockSource>>) -> Result<Self> {
        let mut starts = Vec::with_capacity(parts.len());
        let mut len = 0_u64;
        for part in &parts {
            starts.push(len);
            len = len.checked_add(part.len_bytes()).ok_or_else(|| {
                PfsError::InvalidGeometry("concatenated length overflows u64".to_owned())
            })?;
        }
        Ok(Self { parts, starts, len })
    }

    #[must_use]
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Index of the part holding byte `pos`; empty parts are never chosen.
    fn part_for(&self, pos: u64) -> Option<usize> {
        let idx = self.starts.partition_point(|start| *start <= pos);
        let idx = idx.checked_sub(1)?;
        (pos < self.starts[idx] + self.parts[idx].len_bytes()).then_some(idx)
    }
}

impl std::fmt::Debug for ConcatSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcatSource")
            .field("parts", &self.parts.len())
            .field("starts", &self.starts)
            .field("len", &self.len)
            .finish()
    }
}

impl BlockSource for ConcatSource {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(out_of_range(offset, buf.len(), self.len));
        }

        let mut done = 0_usize;
        let mut pos = offset;
        while done < buf.len() {
            let idx = self
                .part_for(pos)
                .ok_or_else(|| out_of_range(pos, buf.len() - done, self.len))?;
            let within = pos - self.starts[idx];
            let avail = self.parts[idx].len_bytes() - within;
            let take = usize::try_from(avail)
                .map_or(buf.len() - done, |avail| avail.min(buf.len() - done));
            self.parts[idx].read_exact_at(within, &mut buf[done..done + take])?;
            done += take;
            pos += u64::try_from(take).unwrap_or(u64::MAX);
        }
        Ok(())
    }
}

/// Read the btrfs superblock region (4096 bytes at offset 64 KiB).
pub fn read_btrfs_superblock_region(
    src: &dyn BlockSource,
) -> Result<[u8; BTRFS_SUPER_INFO_SIZE]> {
    read_region::<BTRFS_SUPER_INFO_SIZE>(src, BTRFS_SUPER_INFO_OFFSET)
}

/// Read the XFS primary superblock sector (512 bytes at offset 0).
pub fn read_xfs_superblock_region(src: &dyn BlockSource) -> Result<[u8; XFS_SUPERBLOCK_SIZE]> {
    read_region::<XFS_SUPERBLOCK_SIZE>(src, XFS_SUPERBLOCK_OFFSET)
}

/// Read the HFS+ volume header (512 bytes at offset 1024).
pub fn read_hfsplus_header_region(
    src: &dyn BlockSource,
) -> Result<[u8; HFSPLUS_VOLUME_HEADER_SIZE]> {
    read_region::<HFSPLUS_VOLUME_HEADER_SIZE>(src, HFSPLUS_VOLUME_HEADER_OFFSET)
}

fn read_region<const N: usize>(src: &dyn BlockSource, offset: usize) -> Result<[u8; N]> {
    let mut buf = [0_u8; N];
    let offset = u64::try_from(offset)
        .map_err(|_| PfsError::InvalidGeometry("region offset does not fit u64".to_owned()))?;
    src.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
