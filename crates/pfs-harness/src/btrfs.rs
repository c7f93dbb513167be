//! Single-device btrfs images with one identity-offset chunk.
//!
//! Logical addresses `[LOGICAL_BASE, LOGICAL_BASE + CHUNK_LEN)` map to
//! physical `PHYSICAL_BASE + (logical - LOGICAL_BASE)`. The chunk is
//! described both in the superblock's sys_chunk_array and in a chunk-tree
//! leaf written by [`BtrfsImage::new`].

use std::collections::BTreeMap;

use pfs_block::MemBlockSource;
use pfs_ondisk::btrfs::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_CHUNK_TREE_OBJECTID, BTRFS_FIRST_CHUNK_TREE_OBJECTID,
    BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE, BtrfsKey,
};
use pfs_types::{BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};

pub const NODESIZE: u32 = 4096;
pub const LOGICAL_BASE: u64 = 0x100_0000;
pub const PHYSICAL_BASE: u64 = 0x10_0000;
pub const CHUNK_LEN: u64 = 0x100_0000;
pub const FSID: [u8; 16] = [0x42; 16];
pub const GENERATION: u64 = 7;

const NODE: usize = NODESIZE as usize;

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_key(buf: &mut [u8], at: usize, key: BtrfsKey) {
    put_u64(buf, at, key.objectid);
    buf[at + 8] = key.item_type;
    put_u64(buf, at + 9, key.offset);
}

fn seal(block: &mut [u8]) {
    let crc = crc32c::crc32c(&block[0x20..]);
    block[..0x20].fill(0);
    put_u32(block, 0, crc);
}

/// `btrfs_chunk` body with one stripe at `physical`.
#[must_use]
pub fn chunk_item(length: u64, physical: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; 48 + 32];
    put_u64(&mut buf, 0, length);
    put_u64(&mut buf, 8, 2);
    put_u64(&mut buf, 16, 0x1_0000);
    put_u64(&mut buf, 24, 2);
    put_u32(&mut buf, 32, NODESIZE);
    put_u32(&mut buf, 36, NODESIZE);
    put_u32(&mut buf, 40, NODESIZE);
    put_u16(&mut buf, 44, 1);
    put_u64(&mut buf, 48, 1);
    put_u64(&mut buf, 56, physical);
    buf
}

/// 160-byte inode item.
#[must_use]
pub fn inode_item(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
    let mut buf = vec![0_u8; 160];
    put_u64(&mut buf, 0, GENERATION);
    put_u64(&mut buf, 16, size);
    put_u64(&mut buf, 24, size.next_multiple_of(4096));
    put_u32(&mut buf, 40, nlink);
    put_u32(&mut buf, 44, 1000);
    put_u32(&mut buf, 48, 1000);
    put_u32(&mut buf, 52, mode);
    for at in [112, 124, 136, 148] {
        put_u64(&mut buf, at, 1_700_000_000);
    }
    buf
}

/// Root item pointing at a tree rooted at `bytenr`.
#[must_use]
pub fn root_item(bytenr: u64, level: u8, root_dirid: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; 439];
    buf[..160].copy_from_slice(&inode_item(0o40_755, 3, 1));
    put_u64(&mut buf, 160, GENERATION);
    put_u64(&mut buf, 168, root_dirid);
    put_u64(&mut buf, 176, bytenr);
    put_u32(&mut buf, 216, 1);
    buf[238] = level;
    buf
}

/// One DIR_ITEM / DIR_INDEX entry.
#[must_use]
pub fn dir_item(location: BtrfsKey, file_type: u8, name: &str) -> Vec<u8> {
    let mut buf = vec![0_u8; 30 + name.len()];
    put_key(&mut buf, 0, location);
    put_u64(&mut buf, 17, GENERATION);
    put_u16(&mut buf, 27, u16::try_from(name.len()).unwrap_or(u16::MAX));
    buf[29] = file_type;
    buf[30..].copy_from_slice(name.as_bytes());
    buf
}

/// Inline file extent carrying `data`.
#[must_use]
pub fn inline_extent(data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0_u8; 21 + data.len()];
    put_u64(&mut buf, 0, GENERATION);
    put_u64(&mut buf, 8, data.len() as u64);
    buf[20] = 0;
    buf[21..].copy_from_slice(data);
    buf
}

/// Regular file extent referencing `num_bytes` at `disk_bytenr + offset`.
#[must_use]
pub fn regular_extent(
    disk_bytenr: u64,
    disk_num_bytes: u64,
    offset: u64,
    num_bytes: u64,
    compression: u8,
) -> Vec<u8> {
    let mut buf = vec![0_u8; 53];
    put_u64(&mut buf, 0, GENERATION);
    put_u64(&mut buf, 8, num_bytes);
    buf[16] = compression;
    buf[20] = 1;
    put_u64(&mut buf, 21, disk_bytenr);
    put_u64(&mut buf, 29, disk_num_bytes);
    put_u64(&mut buf, 37, offset);
    put_u64(&mut buf, 45, num_bytes);
    buf
}

/// An in-memory btrfs image under construction.
#[derive(Debug, Clone)]
pub struct BtrfsImage {
    nodes: BTreeMap<u64, Vec<u8>>,
    data: BTreeMap<u64, Vec<u8>>,
    next: u64,
    root: u64,
    root_level: u8,
    chunk_root: u64,
    chunk_root_level: u8,
    csum_type: u16,
    fsid: [u8; 16],
}

impl Default for BtrfsImage {
    fn default() -> Self {
        Self::new()
    }
}

impl BtrfsImage {
    /// Empty image with a one-leaf chunk tree describing the single chunk.
    #[must_use]
    pub fn new() -> Self {
        let mut image = Self {
            nodes: BTreeMap::new(),
            data: BTreeMap::new(),
            next: LOGICAL_BASE,
            root: 0,
            root_level: 0,
            chunk_root: 0,
            chunk_root_level: 0,
            csum_type: 0,
            fsid: FSID,
        };
        let chunk_key =
            BtrfsKey::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, LOGICAL_BASE);
        let leaf = image.leaf(
            BTRFS_CHUNK_TREE_OBJECTID,
            &[(chunk_key, chunk_item(CHUNK_LEN, PHYSICAL_BASE))],
        );
        image.chunk_root = leaf;
        image
    }

    /// Reserve the next node address.
    pub fn alloc(&mut self) -> u64 {
        let at = self.next;
        self.next += u64::from(NODESIZE);
        at
    }

    /// Reserve `len` bytes of file data and fill them with `bytes`.
    pub fn data_extent(&mut self, bytes: &[u8]) -> u64 {
        let at = self.next;
        let len = (bytes.len() as u64)
            .next_multiple_of(u64::from(NODESIZE))
            .max(u64::from(NODESIZE));
        self.next += len;
        self.data.insert(at, bytes.to_vec());
        at
    }

    pub fn leaf(&mut self, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) -> u64 {
        let at = self.alloc();
        self.write_leaf(at, owner, items);
        at
    }

    /// Write a leaf at `at`. Items are written in the given order.
    pub fn write_leaf(&mut self, at: u64, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) {
        let mut block = self.header(at, owner, items.len(), 0);
        let mut data_end = NODE;
        for (idx, (key, payload)) in items.iter().enumerate() {
            data_end -= payload.len();
            block[data_end..data_end + payload.len()].copy_from_slice(payload);
            let slot = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
            put_key(&mut block, slot, *key);
            put_u32(&mut block, slot + 17, u32::try_from(data_end - BTRFS_HEADER_SIZE).unwrap_or(u32::MAX));
            put_u32(&mut block, slot + 21, u32::try_from(payload.len()).unwrap_or(u32::MAX));
        }
        seal(&mut block);
        self.nodes.insert(at, block);
    }

    pub fn internal(&mut self, owner: u64, level: u8, ptrs: &[(BtrfsKey, u64)]) -> u64 {
        let at = self.alloc();
        self.write_internal(at, owner, level, ptrs);
        at
    }

    pub fn write_internal(&mut self, at: u64, owner: u64, level: u8, ptrs: &[(BtrfsKey, u64)]) {
        let mut block = self.header(at, owner, ptrs.len(), level);
        for (idx, (key, child)) in ptrs.iter().enumerate() {
            let slot = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
            put_key(&mut block, slot, *key);
            put_u64(&mut block, slot + 17, *child);
            put_u64(&mut block, slot + 25, GENERATION);
        }
        seal(&mut block);
        self.nodes.insert(at, block);
    }

    fn header(&self, at: u64, owner: u64, nritems: usize, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; NODE];
        block[0x20..0x30].copy_from_slice(&self.fsid);
        put_u64(&mut block, 0x30, at);
        put_u64(&mut block, 0x50, GENERATION);
        put_u64(&mut block, 0x58, owner);
        put_u32(&mut block, 0x60, u32::try_from(nritems).unwrap_or(u32::MAX));
        block[0x64] = level;
        block
    }

    pub fn set_root_tree(&mut self, at: u64, level: u8) {
        self.root = at;
        self.root_level = level;
    }

    pub fn set_chunk_tree(&mut self, at: u64, level: u8) {
        self.chunk_root = at;
        self.chunk_root_level = level;
    }

    pub fn set_csum_type(&mut self, csum_type: u16) {
        self.csum_type = csum_type;
    }

    /// Raw bytes of the node at `at`, for corruption tests. Call
    /// [`reseal`](Self::reseal) to make the checksum valid again.
    ///
    /// # Panics
    /// If no node was written at `at`.
    pub fn node_mut(&mut self, at: u64) -> &mut [u8] {
        self.nodes.get_mut(&at).expect("node written")
    }

    pub fn reseal(&mut self, at: u64) {
        if let Some(block) = self.nodes.get_mut(&at) {
            seal(block);
        }
    }

    fn superblock(&self) -> Vec<u8> {
        let mut sb = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x20..0x30].copy_from_slice(&self.fsid);
        put_u64(&mut sb, 0x30, BTRFS_SUPER_INFO_OFFSET as u64);
        put_u64(&mut sb, 0x40, BTRFS_MAGIC);
        put_u64(&mut sb, 0x48, GENERATION);
        put_u64(&mut sb, 0x50, self.root);
        put_u64(&mut sb, 0x58, self.chunk_root);
        put_u64(&mut sb, 0x70, PHYSICAL_BASE + CHUNK_LEN);
        put_u64(&mut sb, 0x80, 6);
        put_u64(&mut sb, 0x88, 1);
        put_u32(&mut sb, 0x90, NODESIZE);
        put_u32(&mut sb, 0x94, NODESIZE);
        put_u32(&mut sb, 0x9C, NODESIZE);
        put_u16(&mut sb, 0xC4, self.csum_type);
        sb[0xC6] = self.root_level;
        sb[0xC7] = self.chunk_root_level;
        sb[0x12B..0x12B + 8].copy_from_slice(b"pfs-test");

        let key = BtrfsKey::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, LOGICAL_BASE);
        let chunk = chunk_item(CHUNK_LEN, PHYSICAL_BASE);
        let array = 0x32B;
        put_key(&mut sb, array, key);
        sb[array + 17..array + 17 + chunk.len()].copy_from_slice(&chunk);
        put_u32(&mut sb, 0xA0, u32::try_from(17 + chunk.len()).unwrap_or(u32::MAX));
        seal(&mut sb);
        sb
    }

    fn physical(logical: u64) -> usize {
        usize::try_from(logical - LOGICAL_BASE + PHYSICAL_BASE).unwrap_or(usize::MAX)
    }

    /// Flatten into device bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dev = vec![0_u8; Self::physical(self.next)];
        dev[BTRFS_SUPER_INFO_OFFSET..BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE]
            .copy_from_slice(&self.superblock());
        for (at, block) in &self.nodes {
            let start = Self::physical(*at);
            dev[start..start + block.len()].copy_from_slice(block);
        }
        for (at, bytes) in &self.data {
            let start = Self::physical(*at);
            dev[start..start + bytes.len()].copy_from_slice(bytes);
        }
        dev
    }

    #[must_use]
    pub fn build(&self) -> MemBlockSource {
        MemBlockSource::new(self.to_bytes())
    }
}
