//! Two-AG XFS images (v4 or v5) with hand-placed btree blocks.
//!
//! Geometry: 4 KiB blocks, 512-byte sectors and inodes, 64 blocks per AG.
//! Every AG starts with an AGI pointing at an empty inobt leaf (block 3)
//! and, on v5, an empty finobt leaf (block 4).

use pfs_block::MemBlockSource;
use pfs_ondisk::xfs::{
    XFS_AGI_CRC_OFF, XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC, XFS_BMDR_HDR_LEN,
    XFS_BTREE_LBLOCK_CRC_LEN, XFS_BTREE_LBLOCK_CRC_OFF, XFS_BTREE_LBLOCK_LEN,
    XFS_BTREE_SBLOCK_CRC_LEN, XFS_BTREE_SBLOCK_CRC_OFF, XFS_BTREE_SBLOCK_LEN,
    XFS_DINODE_CORE_LEN, XFS_DINODE_CRC_OFF, XFS_DINODE_MAGIC, XFS_DINODE_V3_CORE_LEN,
    XFS_FIBT_CRC_MAGIC, XFS_FIBT_MAGIC, XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC,
    XFS_SB_FEAT_INCOMPAT_SPINODES, xfs_block_crc,
};
use pfs_types::{XFS_AGI_MAGIC, XFS_SB_MAGIC};

pub const BLOCKSIZE: u32 = 4096;
pub const SECTSIZE: u16 = 512;
pub const AGBLOCKS: u32 = 64;
pub const AGCOUNT: u32 = 2;
pub const AGBLKLOG: u8 = 6;
pub const INOPBLOG: u8 = 3;
pub const UUID: [u8; 16] = [0x5A; 16];
pub const ROOTINO: u64 = 128;
pub const INOBT_ROOT: u32 = 3;
pub const FINOBT_ROOT: u32 = 4;
pub const INODESIZE: usize = 512;
/// Modification time stamped on every harness inode.
pub const MTIME: i32 = 1_700_000_000;

const BLOCK: usize = BLOCKSIZE as usize;
const SB_CRC_OFF: usize = 224;

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_be_bytes());
}

fn split_fsbno(fsbno: u64) -> (u32, u32) {
    let agno = u32::try_from(fsbno >> AGBLKLOG).unwrap_or(u32::MAX);
    let agbno = u32::try_from(fsbno & ((1 << AGBLKLOG) - 1)).unwrap_or(u32::MAX);
    (agno, agbno)
}

fn seal(block: &mut [u8], crc_off: usize) {
    let crc = xfs_block_crc(block, crc_off).unwrap_or_default();
    block[crc_off..crc_off + 4].copy_from_slice(&crc.to_le_bytes());
}

/// One inobt/finobt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeChunk {
    pub startino: u32,
    /// Set bit = free inode.
    pub free: u64,
    /// Set bit = 4-inode hole (sparse images only).
    pub holemask: u16,
}

impl InodeChunk {
    #[must_use]
    pub fn allocated(startino: u32) -> Self {
        Self {
            startino,
            free: 0,
            holemask: 0,
        }
    }

    #[must_use]
    pub fn with_free(startino: u32, free: u64) -> Self {
        Self {
            startino,
            free,
            holemask: 0,
        }
    }
}

/// One bmbt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub startoff: u64,
    pub startblock: u64,
    pub blockcount: u64,
    pub unwritten: bool,
}

impl Extent {
    #[must_use]
    pub fn new(startoff: u64, startblock: u64, blockcount: u64) -> Self {
        Self {
            startoff,
            startblock,
            blockcount,
            unwritten: false,
        }
    }

    fn encode(self) -> [u8; 16] {
        let l0 = (u64::from(self.unwritten) << 63) | (self.startoff << 9) | (self.startblock >> 43);
        let l1 = (self.startblock << 21) | (self.blockcount & 0x1F_FFFF);
        let mut out = [0_u8; 16];
        out[..8].copy_from_slice(&l0.to_be_bytes());
        out[8..].copy_from_slice(&l1.to_be_bytes());
        out
    }
}

/// Data fork of a harness inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fork {
    Device,
    Local(Vec<u8>),
    Extents(Vec<Extent>),
    /// In-inode bmbt root at `level` with `(startoff, child fsbno)` entries.
    Btree { level: u16, children: Vec<(u64, u64)> },
}

impl Fork {
    fn format(&self) -> u8 {
        match self {
            Self::Device => 0,
            Self::Local(_) => 1,
            Self::Extents(_) => 2,
            Self::Btree { .. } => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct XfsImage {
    bytes: Vec<u8>,
    crc: bool,
    sparse: bool,
}

impl XfsImage {
    #[must_use]
    pub fn v4() -> Self {
        Self::new(4, false)
    }

    #[must_use]
    pub fn v5() -> Self {
        Self::new(5, false)
    }

    /// v5 with the sparse-inode feature.
    #[must_use]
    pub fn v5_sparse() -> Self {
        Self::new(5, true)
    }

    fn new(version: u16, sparse: bool) -> Self {
        let mut image = Self {
            bytes: vec![0_u8; BLOCK * (AGBLOCKS * AGCOUNT) as usize],
            crc: version == 5,
            sparse,
        };
        image.write_superblock(version);
        for agno in 0..AGCOUNT {
            image.inobt_leaf(agno, INOBT_ROOT, &[], None, None);
            if image.crc {
                image.finobt_leaf(agno, FINOBT_ROOT, &[], None, None);
                image.set_agi(agno, INOBT_ROOT, 1, Some((FINOBT_ROOT, 1)));
            } else {
                image.set_agi(agno, INOBT_ROOT, 1, None);
            }
        }
        image
    }

    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.crc
    }

    fn write_superblock(&mut self, version: u16) {
        let sparse = self.sparse;
        let sb = &mut self.bytes[..usize::from(SECTSIZE)];
        put_u32(sb, 0, XFS_SB_MAGIC);
        put_u32(sb, 4, BLOCKSIZE);
        put_u64(sb, 8, u64::from(AGBLOCKS * AGCOUNT));
        sb[32..48].copy_from_slice(&UUID);
        put_u64(sb, 56, ROOTINO);
        put_u32(sb, 84, AGBLOCKS);
        put_u32(sb, 88, AGCOUNT);
        put_u16(sb, 100, version);
        put_u16(sb, 102, SECTSIZE);
        put_u16(sb, 104, 512);
        put_u16(sb, 106, 8);
        sb[108..116].copy_from_slice(b"pfs-test");
        sb[120] = 12;
        sb[121] = 9;
        sb[122] = 9;
        sb[123] = INOPBLOG;
        sb[124] = AGBLKLOG;
        put_u64(sb, 128, 64);
        put_u64(sb, 136, 0);
        if version == 5 {
            let incompat = if sparse {
                XFS_SB_FEAT_INCOMPAT_SPINODES
            } else {
                0
            };
            put_u32(sb, 216, incompat);
            seal(sb, SB_CRC_OFF);
        }
    }

    /// Byte offset of AG block `agbno` in group `agno`.
    #[must_use]
    pub fn offset(agno: u32, agbno: u32) -> usize {
        (agno * AGBLOCKS + agbno) as usize * BLOCK
    }

    /// 512-byte disk address of AG block `agbno` in group `agno`.
    #[must_use]
    pub fn daddr(agno: u32, agbno: u32) -> u64 {
        Self::offset(agno, agbno) as u64 / 512
    }

    /// Encoded filesystem block number.
    #[must_use]
    pub fn fsbno(agno: u32, agbno: u32) -> u64 {
        (u64::from(agno) << AGBLKLOG) | u64::from(agbno)
    }

    /// Absolute inode number.
    #[must_use]
    pub fn ino(agno: u32, agino: u32) -> u64 {
        (u64::from(agno) << (AGBLKLOG + INOPBLOG)) | u64::from(agino)
    }

    pub fn set_agi(&mut self, agno: u32, root: u32, level: u32, free: Option<(u32, u32)>) {
        let at = Self::offset(agno, 0) + 2 * usize::from(SECTSIZE);
        let crc = self.crc;
        let agi = &mut self.bytes[at..at + usize::from(SECTSIZE)];
        agi.fill(0);
        put_u32(agi, 0, XFS_AGI_MAGIC);
        put_u32(agi, 4, 1);
        put_u32(agi, 8, agno);
        put_u32(agi, 12, AGBLOCKS);
        put_u32(agi, 20, root);
        put_u32(agi, 24, level);
        put_u32(agi, 32, u32::MAX);
        put_u32(agi, 36, u32::MAX);
        for bucket in 0..64 {
            put_u32(agi, 40 + bucket * 4, u32::MAX);
        }
        if crc {
            agi[296..312].copy_from_slice(&UUID);
            if let Some((free_root, free_level)) = free {
                put_u32(agi, 328, free_root);
                put_u32(agi, 332, free_level);
            }
            seal(agi, XFS_AGI_CRC_OFF);
        }
    }

    fn short_header(
        &mut self,
        agno: u32,
        agbno: u32,
        magic: u32,
        level: u16,
        numrecs: usize,
        sibs: (Option<u32>, Option<u32>),
    ) -> usize {
        let at = Self::offset(agno, agbno);
        let block = &mut self.bytes[at..at + BLOCK];
        block.fill(0);
        put_u32(block, 0, magic);
        put_u16(block, 4, level);
        put_u16(block, 6, u16::try_from(numrecs).unwrap_or(u16::MAX));
        put_u32(block, 8, sibs.0.unwrap_or(u32::MAX));
        put_u32(block, 12, sibs.1.unwrap_or(u32::MAX));
        if self.crc {
            put_u64(block, 16, Self::daddr(agno, agbno));
            put_u64(block, 24, 1);
            block[32..48].copy_from_slice(&UUID);
            put_u32(block, 48, agno);
            XFS_BTREE_SBLOCK_CRC_LEN
        } else {
            XFS_BTREE_SBLOCK_LEN
        }
    }

    fn chunk_leaf(
        &mut self,
        magic: u32,
        agno: u32,
        agbno: u32,
        chunks: &[InodeChunk],
        sibs: (Option<u32>, Option<u32>),
    ) {
        let hdr = self.short_header(agno, agbno, magic, 0, chunks.len(), sibs);
        let at = Self::offset(agno, agbno);
        let sparse = self.sparse;
        let block = &mut self.bytes[at..at + BLOCK];
        for (idx, chunk) in chunks.iter().enumerate() {
            let rec = hdr + idx * 16;
            put_u32(block, rec, chunk.startino);
            let mut holes = 0_u64;
            for bit in 0..16 {
                if (chunk.holemask >> bit) & 1 == 1 {
                    holes |= 0xF << (bit * 4);
                }
            }
            let freecount = (chunk.free & !holes).count_ones();
            if sparse {
                put_u16(block, rec + 4, chunk.holemask);
                block[rec + 6] = u8::try_from(64 - holes.count_ones()).unwrap_or(64);
                block[rec + 7] = u8::try_from(freecount).unwrap_or(64);
            } else {
                put_u32(block, rec + 4, freecount);
            }
            put_u64(block, rec + 8, chunk.free | holes);
        }
        if self.crc {
            seal(block, XFS_BTREE_SBLOCK_CRC_OFF);
        }
    }

    /// inobt leaf; `left`/`right` are sibling AG block numbers.
    pub fn inobt_leaf(
        &mut self,
        agno: u32,
        agbno: u32,
        chunks: &[InodeChunk],
        left: Option<u32>,
        right: Option<u32>,
    ) {
        let magic = if self.crc { XFS_IBT_CRC_MAGIC } else { XFS_IBT_MAGIC };
        self.chunk_leaf(magic, agno, agbno, chunks, (left, right));
    }

    pub fn finobt_leaf(
        &mut self,
        agno: u32,
        agbno: u32,
        chunks: &[InodeChunk],
        left: Option<u32>,
        right: Option<u32>,
    ) {
        let magic = if self.crc { XFS_FIBT_CRC_MAGIC } else { XFS_FIBT_MAGIC };
        self.chunk_leaf(magic, agno, agbno, chunks, (left, right));
    }

    /// inobt internal node with `(startino, child agbno)` entries.
    pub fn inobt_internal(&mut self, agno: u32, agbno: u32, level: u16, entries: &[(u32, u32)]) {
        let magic = if self.crc { XFS_IBT_CRC_MAGIC } else { XFS_IBT_MAGIC };
        let hdr = self.short_header(agno, agbno, magic, level, entries.len(), (None, None));
        let maxrecs = (BLOCK - hdr) / 8;
        let at = Self::offset(agno, agbno);
        let block = &mut self.bytes[at..at + BLOCK];
        for (idx, (key, ptr)) in entries.iter().enumerate() {
            put_u32(block, hdr + idx * 4, *key);
            put_u32(block, hdr + maxrecs * 4 + idx * 4, *ptr);
        }
        if self.crc {
            seal(block, XFS_BTREE_SBLOCK_CRC_OFF);
        }
    }

    fn long_header(
        &mut self,
        fsbno: u64,
        owner: u64,
        level: u16,
        numrecs: usize,
        sibs: (Option<u64>, Option<u64>),
    ) -> (usize, usize) {
        let (agno, agbno) = split_fsbno(fsbno);
        let at = Self::offset(agno, agbno);
        let crc = self.crc;
        let block = &mut self.bytes[at..at + BLOCK];
        block.fill(0);
        put_u32(block, 0, if crc { XFS_BMAP_CRC_MAGIC } else { XFS_BMAP_MAGIC });
        put_u16(block, 4, level);
        put_u16(block, 6, u16::try_from(numrecs).unwrap_or(u16::MAX));
        put_u64(block, 8, sibs.0.unwrap_or(u64::MAX));
        put_u64(block, 16, sibs.1.unwrap_or(u64::MAX));
        if crc {
            put_u64(block, 24, Self::daddr(agno, agbno));
            put_u64(block, 32, 1);
            block[40..56].copy_from_slice(&UUID);
            put_u64(block, 56, owner);
            (at, XFS_BTREE_LBLOCK_CRC_LEN)
        } else {
            (at, XFS_BTREE_LBLOCK_LEN)
        }
    }

    pub fn bmbt_leaf(
        &mut self,
        fsbno: u64,
        owner: u64,
        extents: &[Extent],
        left: Option<u64>,
        right: Option<u64>,
    ) {
        let (at, hdr) = self.long_header(fsbno, owner, 0, extents.len(), (left, right));
        let block = &mut self.bytes[at..at + BLOCK];
        for (idx, extent) in extents.iter().enumerate() {
            block[hdr + idx * 16..hdr + idx * 16 + 16].copy_from_slice(&extent.encode());
        }
        if self.crc {
            seal(block, XFS_BTREE_LBLOCK_CRC_OFF);
        }
    }

    /// bmbt internal node with `(startoff, child fsbno)` entries.
    pub fn bmbt_internal(&mut self, fsbno: u64, owner: u64, level: u16, entries: &[(u64, u64)]) {
        let (at, hdr) = self.long_header(fsbno, owner, level, entries.len(), (None, None));
        let maxrecs = (BLOCK - hdr) / 16;
        let block = &mut self.bytes[at..at + BLOCK];
        for (idx, (key, ptr)) in entries.iter().enumerate() {
            put_u64(block, hdr + idx * 8, *key);
            put_u64(block, hdr + maxrecs * 8 + idx * 8, *ptr);
        }
        if self.crc {
            seal(block, XFS_BTREE_LBLOCK_CRC_OFF);
        }
    }

    /// Byte offset of inode `ino` in the image.
    #[must_use]
    pub fn inode_offset(ino: u64) -> usize {
        let agino_bits = AGBLKLOG + INOPBLOG;
        let agno = u32::try_from(ino >> agino_bits).unwrap_or(u32::MAX);
        let agino = u32::try_from(ino & ((1 << agino_bits) - 1)).unwrap_or(u32::MAX);
        let index = usize::try_from(agino & ((1 << INOPBLOG) - 1)).unwrap_or(0);
        Self::offset(agno, agino >> INOPBLOG) + index * INODESIZE
    }

    /// Write inode `ino` (v3 on v5 images, v2 otherwise) with owner
    /// 1000:1000, one link and every timestamp at [`MTIME`].
    pub fn write_inode(&mut self, ino: u64, mode: u16, size: u64, fork: &Fork) {
        let at = Self::inode_offset(ino);
        let crc = self.crc;
        let raw = &mut self.bytes[at..at + INODESIZE];
        raw.fill(0);
        put_u16(raw, 0, XFS_DINODE_MAGIC);
        put_u16(raw, 2, mode);
        raw[4] = if crc { 3 } else { 2 };
        raw[5] = fork.format();
        put_u32(raw, 8, 1000);
        put_u32(raw, 12, 1000);
        put_u32(raw, 16, 1);
        for stamp in [32, 40, 48] {
            raw[stamp..stamp + 4].copy_from_slice(&MTIME.to_be_bytes());
        }
        put_u64(raw, 56, size);
        let core = if crc {
            raw[144..148].copy_from_slice(&MTIME.to_be_bytes());
            put_u64(raw, 152, ino);
            raw[160..176].copy_from_slice(&UUID);
            XFS_DINODE_V3_CORE_LEN
        } else {
            XFS_DINODE_CORE_LEN
        };
        let data = &mut raw[core..];
        match fork {
            Fork::Device => {}
            Fork::Local(bytes) => data[..bytes.len()].copy_from_slice(bytes),
            Fork::Extents(extents) => {
                for (idx, extent) in extents.iter().enumerate() {
                    data[idx * 16..idx * 16 + 16].copy_from_slice(&extent.encode());
                }
                let blocks: u64 = extents.iter().map(|extent| extent.blockcount).sum();
                put_u64(raw, 64, blocks);
                put_u32(raw, 76, u32::try_from(extents.len()).unwrap_or(u32::MAX));
            }
            Fork::Btree { level, children } => {
                let maxrecs = (data.len() - XFS_BMDR_HDR_LEN) / 16;
                put_u16(data, 0, *level);
                put_u16(data, 2, u16::try_from(children.len()).unwrap_or(u16::MAX));
                for (idx, (key, ptr)) in children.iter().enumerate() {
                    put_u64(data, XFS_BMDR_HDR_LEN + idx * 8, *key);
                    put_u64(data, XFS_BMDR_HDR_LEN + maxrecs * 8 + idx * 8, *ptr);
                }
            }
        }
        if crc {
            seal(raw, XFS_DINODE_CRC_OFF);
        }
    }

    /// Recompute the CRC of inode `ino` after editing it.
    pub fn reseal_inode(&mut self, ino: u64) {
        if self.crc {
            let at = Self::inode_offset(ino);
            seal(&mut self.bytes[at..at + INODESIZE], XFS_DINODE_CRC_OFF);
        }
    }

    /// Raw image bytes, for corrupting blocks after they are sealed.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Recompute the CRC of a short-form block after editing it.
    pub fn reseal_short(&mut self, agno: u32, agbno: u32) {
        if self.crc {
            let at = Self::offset(agno, agbno);
            seal(&mut self.bytes[at..at + BLOCK], XFS_BTREE_SBLOCK_CRC_OFF);
        }
    }

    /// Recompute the CRC of a long-form block after editing it.
    pub fn reseal_long(&mut self, fsbno: u64) {
        if self.crc {
            let (agno, agbno) = split_fsbno(fsbno);
            let at = Self::offset(agno, agbno);
            seal(&mut self.bytes[at..at + BLOCK], XFS_BTREE_LBLOCK_CRC_OFF);
        }
    }

    #[must_use]
    pub fn build(&self) -> MemBlockSource {
        MemBlockSource::new(self.bytes.clone())
    }
}
