//! HFS+ / HFSX images with hand-placed catalog nodes.
//!
//! Tests write catalog leaves and index nodes by node number; [`HfsImage`]
//! adds the header nodes, lays the catalog and extents-overflow files out
//! on disk and fills in the volume header. Node size equals the block size
//! so one catalog node occupies one allocation block.

use std::collections::BTreeMap;

use pfs_block::MemBlockSource;
use pfs_ondisk::hfsplus::{
    HFS_ATTR_BIG_KEYS, HFS_ATTR_VARIABLE_INDEX_KEYS, HFS_CATALOG_FILE_ID, HFS_DATA_FORK,
    HFS_EXTENT_DENSITY, HFS_FILE_RECORD, HFS_FILE_THREAD_RECORD, HFS_FOLDER_RECORD,
    HFS_FOLDER_THREAD_RECORD, HFS_KEY_COMPARE_BINARY, HFS_KEY_COMPARE_CASE_FOLDING,
    HFS_NODE_DESCRIPTOR_SIZE, HFS_NODE_KIND_HEADER, HFS_NODE_KIND_INDEX, HFS_NODE_KIND_LEAF,
};
use pfs_types::{HFSPLUS_SIGNATURE, HFSPLUS_VOLUME_HEADER_OFFSET, HFSX_SIGNATURE};

pub const BLOCK_SIZE: u32 = 4096;
pub const TOTAL_BLOCKS: u32 = 128;
/// First block of the extents-overflow file (two nodes).
pub const EXTENTS_START: u32 = 2;

const BLOCK: usize = BLOCK_SIZE as usize;
const FIRST_FREE_BLOCK: u32 = EXTENTS_START + 2;
const CATALOG_MAX_KEY: u16 = 516;
const EXTENTS_MAX_KEY: u16 = 10;

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_be_bytes());
}

fn len_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn unistr(name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut buf = len_u16(units.len()).to_be_bytes().to_vec();
    for unit in units {
        buf.extend_from_slice(&unit.to_be_bytes());
    }
    buf
}

/// Catalog key bytes, length prefix included.
#[must_use]
pub fn catalog_key(parent_id: u32, name: &str) -> Vec<u8> {
    let name = unistr(name);
    let mut buf = len_u16(4 + name.len()).to_be_bytes().to_vec();
    buf.extend_from_slice(&parent_id.to_be_bytes());
    buf.extend_from_slice(&name);
    buf
}

/// Extents-overflow key bytes, length prefix included.
#[must_use]
pub fn extent_key(fork_type: u8, file_id: u32, start_block: u32) -> Vec<u8> {
    let mut buf = vec![0_u8; 12];
    put_u16(&mut buf, 0, EXTENTS_MAX_KEY);
    buf[2] = fork_type;
    put_u32(&mut buf, 4, file_id);
    put_u32(&mut buf, 8, start_block);
    buf
}

/// On-disk placement of one fork.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fork {
    pub logical_size: u64,
    /// `(start block, block count)` in fork order, overflow included.
    pub extents: Vec<(u32, u32)>,
}

impl Fork {
    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.extents.iter().map(|(_, count)| count).sum()
    }

    /// The 80-byte `HFSPlusForkData` with the first eight extents inline.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; 80];
        put_u64(&mut buf, 0, self.logical_size);
        put_u32(&mut buf, 12, self.total_blocks());
        for (idx, (start, count)) in self.extents.iter().take(HFS_EXTENT_DENSITY).enumerate() {
            put_u32(&mut buf, 16 + idx * 8, *start);
            put_u32(&mut buf, 20 + idx * 8, *count);
        }
        buf
    }

    /// Overflow records for extents past the inline eight, keyed by the
    /// fork block each record starts at.
    #[must_use]
    pub fn overflow(&self) -> Vec<(u32, Vec<(u32, u32)>)> {
        let split = self.extents.len().min(HFS_EXTENT_DENSITY);
        let (inline, rest) = self.extents.split_at(split);
        overflow_records(inline.iter().map(|(_, count)| count).sum(), rest)
    }
}

/// `rest` cut into overflow records of eight, the first starting at fork
/// block `start_block`.
fn overflow_records(mut start_block: u32, rest: &[(u32, u32)]) -> Vec<(u32, Vec<(u32, u32)>)> {
    rest.chunks(HFS_EXTENT_DENSITY)
        .map(|chunk| {
            let record = (start_block, chunk.to_vec());
            start_block += chunk.iter().map(|(_, count)| count).sum::<u32>();
            record
        })
        .collect()
}

fn bsd_info(buf: &mut [u8], mode: u16) {
    put_u32(buf, 32, 501);
    put_u32(buf, 36, 20);
    put_u16(buf, 42, mode);
}

/// Folder record body.
#[must_use]
pub fn folder_record(folder_id: u32, valence: u32) -> Vec<u8> {
    let mut buf = vec![0_u8; 88];
    buf[0..2].copy_from_slice(&HFS_FOLDER_RECORD.to_be_bytes());
    put_u32(&mut buf, 4, valence);
    put_u32(&mut buf, 8, folder_id);
    for at in [12, 16, 20, 24] {
        put_u32(&mut buf, at, 3_800_000_000);
    }
    bsd_info(&mut buf, 0o040_755);
    buf
}

/// File record body with `data` as its data fork.
#[must_use]
pub fn file_record(file_id: u32, data: &Fork) -> Vec<u8> {
    let mut buf = vec![0_u8; 248];
    buf[0..2].copy_from_slice(&HFS_FILE_RECORD.to_be_bytes());
    put_u32(&mut buf, 8, file_id);
    for at in [12, 16, 20, 24] {
        put_u32(&mut buf, at, 3_800_000_000);
    }
    bsd_info(&mut buf, 0o100_644);
    buf[88..168].copy_from_slice(&data.encode());
    buf
}

/// Thread record body naming `parent_id` and `name`.
#[must_use]
pub fn thread_record(folder: bool, parent_id: u32, name: &str) -> Vec<u8> {
    let kind = if folder {
        HFS_FOLDER_THREAD_RECORD
    } else {
        HFS_FILE_THREAD_RECORD
    };
    let mut buf = vec![0_u8; 8];
    buf[0..2].copy_from_slice(&kind.to_be_bytes());
    put_u32(&mut buf, 4, parent_id);
    buf.extend_from_slice(&unistr(name));
    buf
}

/// A B-tree node with `records` packed after the descriptor.
#[must_use]
pub fn node(kind: i8, height: u8, links: (u32, u32), records: &[Vec<u8>]) -> Vec<u8> {
    let (b_link, f_link) = links;
    let mut buf = vec![0_u8; BLOCK];
    put_u32(&mut buf, 0, f_link);
    put_u32(&mut buf, 4, b_link);
    buf[8] = kind.to_be_bytes()[0];
    buf[9] = height;
    put_u16(&mut buf, 10, len_u16(records.len()));
    let mut at = HFS_NODE_DESCRIPTOR_SIZE;
    for (idx, record) in records.iter().enumerate() {
        buf[at..at + record.len()].copy_from_slice(record);
        put_u16(&mut buf, BLOCK - 2 * (idx + 1), len_u16(at));
        at += record.len();
    }
    put_u16(&mut buf, BLOCK - 2 * (records.len() + 1), len_u16(at));
    buf
}

/// Header-node fields a test may set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeHeader {
    pub depth: u16,
    pub root: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
}

/// Header node 0 of a B-tree file with `BLOCK_SIZE` nodes.
#[must_use]
pub fn header_node(
    tree: TreeHeader,
    total_nodes: u32,
    max_key: u16,
    compare: u8,
    attrs: u32,
) -> Vec<u8> {
    let mut record = vec![0_u8; 106];
    put_u16(&mut record, 0, tree.depth);
    put_u32(&mut record, 2, tree.root);
    put_u32(&mut record, 6, tree.leaf_records);
    put_u32(&mut record, 10, tree.first_leaf);
    put_u32(&mut record, 14, tree.last_leaf);
    put_u16(&mut record, 18, len_u16(BLOCK));
    put_u16(&mut record, 20, max_key);
    put_u32(&mut record, 22, total_nodes);
    put_u32(&mut record, 32, BLOCK_SIZE);
    record[37] = compare;
    put_u32(&mut record, 38, attrs);
    let user = vec![0_u8; 128];
    let map = vec![0xFF_u8; 4];
    node(HFS_NODE_KIND_HEADER, 0, (0, 0), &[record, user, map])
}

/// Where the catalog file goes on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogLayout {
    /// One contiguous extent.
    #[default]
    Contiguous,
    /// One block per extent with a free block between extents.
    Fragmented,
    /// Fragmented, with only the header node's extent inline and the rest
    /// in the extents-overflow file.
    Overflow,
}

#[derive(Debug, Clone)]
pub struct HfsImage {
    bytes: Vec<u8>,
    hfsx: bool,
    key_compare: u8,
    next_block: u32,
    catalog: BTreeMap<u32, Vec<u8>>,
    catalog_header: TreeHeader,
    layout: CatalogLayout,
    /// `(file id, fork type, start block)` → extents.
    overflow: BTreeMap<(u32, u8, u32), Vec<(u32, u32)>>,
}

impl Default for HfsImage {
    fn default() -> Self {
        Self::new()
    }
}

impl HfsImage {
    /// Case-insensitive HFS+ volume.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK * TOTAL_BLOCKS as usize],
            hfsx: false,
            key_compare: HFS_KEY_COMPARE_CASE_FOLDING,
            next_block: FIRST_FREE_BLOCK,
            catalog: BTreeMap::new(),
            catalog_header: TreeHeader::default(),
            layout: CatalogLayout::Contiguous,
            overflow: BTreeMap::new(),
        }
    }

    /// HFSX volume with binary name ordering.
    #[must_use]
    pub fn hfsx_binary() -> Self {
        Self {
            hfsx: true,
            key_compare: HFS_KEY_COMPARE_BINARY,
            ..Self::new()
        }
    }

    pub fn set_catalog_layout(&mut self, layout: CatalogLayout) {
        self.layout = layout;
    }

    pub fn set_catalog_header(&mut self, header: TreeHeader) {
        self.catalog_header = header;
    }

    /// Catalog leaf `number` holding `(key, body)` records.
    pub fn catalog_leaf(
        &mut self,
        number: u32,
        links: (u32, u32),
        records: &[(Vec<u8>, Vec<u8>)],
    ) {
        let records: Vec<Vec<u8>> = records
            .iter()
            .map(|(key, body)| [key.as_slice(), body.as_slice()].concat())
            .collect();
        self.catalog
            .insert(number, node(HFS_NODE_KIND_LEAF, 1, links, &records));
    }

    /// Catalog index node `number` at `height` with `(parent, name, child)`
    /// entries and variable-length keys.
    pub fn catalog_index(&mut self, number: u32, height: u8, entries: &[(u32, &str, u32)]) {
        let records: Vec<Vec<u8>> = entries
            .iter()
            .map(|(parent, name, child)| {
                let mut record = catalog_key(*parent, name);
                record.extend_from_slice(&child.to_be_bytes());
                record
            })
            .collect();
        self.catalog
            .insert(number, node(HFS_NODE_KIND_INDEX, height, (0, 0), &records));
    }

    /// Raw catalog node, for tests that corrupt one.
    pub fn catalog_node_mut(&mut self, number: u32) -> Option<&mut Vec<u8>> {
        self.catalog.get_mut(&number)
    }

    /// Write `data` into freshly allocated blocks, `pieces` extents with a
    /// free block between consecutive extents.
    pub fn write_data(&mut self, data: &[u8], pieces: u32) -> Fork {
        let blocks = u32::try_from(data.len().div_ceil(BLOCK)).unwrap_or(u32::MAX);
        let pieces = pieces.clamp(1, blocks.max(1));
        let mut extents = Vec::new();
        let mut done = 0_u32;
        for piece in 0..pieces {
            let count = if piece + 1 == pieces {
                blocks - done
            } else {
                blocks / pieces
            };
            if count == 0 {
                continue;
            }
            extents.push((self.next_block, count));
            self.next_block += count + 1;
            done += count;
        }
        let mut written = 0_usize;
        for (start, count) in &extents {
            let at = *start as usize * BLOCK;
            let len = (*count as usize * BLOCK).min(data.len() - written);
            self.bytes[at..at + len].copy_from_slice(&data[written..written + len]);
            written += len;
        }
        Fork {
            logical_size: data.len() as u64,
            extents,
        }
    }

    /// Record the overflow extents of `fork` for `file_id`'s data fork.
    pub fn add_overflow(&mut self, file_id: u32, fork: &Fork) {
        for (start_block, extents) in fork.overflow() {
            self.overflow
                .insert((file_id, HFS_DATA_FORK, start_block), extents);
        }
    }

    /// Overflow record with arbitrary contents.
    pub fn add_overflow_record(&mut self, file_id: u32, start_block: u32, extents: &[(u32, u32)]) {
        self.overflow
            .insert((file_id, HFS_DATA_FORK, start_block), extents.to_vec());
    }

    fn catalog_nodes(&self) -> u32 {
        self.catalog.keys().next_back().map_or(1, |last| last + 1)
    }

    /// Block of each catalog node, in node order.
    #[must_use]
    pub fn catalog_blocks(&self) -> Vec<u32> {
        let gap = u32::from(self.layout != CatalogLayout::Contiguous);
        (0..self.catalog_nodes())
            .map(|node| self.next_block + node * (1 + gap))
            .collect()
    }

    /// Byte offset of catalog node `number` in the image.
    #[must_use]
    pub fn catalog_node_offset(&self, number: u32) -> Option<usize> {
        self.catalog_blocks()
            .get(number as usize)
            .map(|block| *block as usize * BLOCK)
    }

    fn catalog_fork(&self) -> Fork {
        let mut extents: Vec<(u32, u32)> = Vec::new();
        for block in self.catalog_blocks() {
            match extents.last_mut() {
                Some((start, count)) if *start + *count == block => *count += 1,
                _ => extents.push((block, 1)),
            }
        }
        Fork {
            logical_size: u64::from(self.catalog_nodes()) * u64::from(BLOCK_SIZE),
            extents,
        }
    }

    /// Image bytes with header nodes, both B-tree files and the volume
    /// header in place.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        let catalog_fork = self.catalog_fork();
        let mut overflow = self.overflow.clone();
        let (inline_catalog, spilled) = if self.layout == CatalogLayout::Overflow {
            let (first, rest) = catalog_fork.extents.split_at(1);
            let inline = Fork {
                logical_size: catalog_fork.logical_size,
                extents: first.to_vec(),
            };
            (inline, overflow_records(first[0].1, rest))
        } else {
            (catalog_fork.clone(), catalog_fork.overflow())
        };
        for (start_block, extents) in spilled {
            overflow.insert((HFS_CATALOG_FILE_ID, HFS_DATA_FORK, start_block), extents);
        }

        let compare = self.key_compare;
        let catalog_attrs = HFS_ATTR_BIG_KEYS | HFS_ATTR_VARIABLE_INDEX_KEYS;
        let mut catalog = self.catalog.clone();
        catalog.insert(
            0,
            header_node(
                self.catalog_header,
                self.catalog_nodes(),
                CATALOG_MAX_KEY,
                compare,
                catalog_attrs,
            ),
        );
        for (block, number) in self.catalog_blocks().into_iter().zip(0_u32..) {
            let Some(raw) = catalog.get(&number) else {
                continue;
            };
            let at = block as usize * BLOCK;
            bytes[at..at + BLOCK].copy_from_slice(raw);
        }

        let records: Vec<Vec<u8>> = overflow
            .iter()
            .map(|((file_id, fork_type, start_block), extents)| {
                let mut record = extent_key(*fork_type, *file_id, *start_block);
                let mut body = vec![0_u8; 8 * HFS_EXTENT_DENSITY];
                for (idx, (start, count)) in extents.iter().enumerate() {
                    put_u32(&mut body, idx * 8, *start);
                    put_u32(&mut body, idx * 8 + 4, *count);
                }
                record.extend_from_slice(&body);
                record
            })
            .collect();
        let extents_header = if records.is_empty() {
            TreeHeader::default()
        } else {
            TreeHeader {
                depth: 1,
                root: 1,
                leaf_records: u32::try_from(records.len()).unwrap_or(u32::MAX),
                first_leaf: 1,
                last_leaf: 1,
            }
        };
        let at = EXTENTS_START as usize * BLOCK;
        bytes[at..at + BLOCK].copy_from_slice(&header_node(
            extents_header,
            2,
            EXTENTS_MAX_KEY,
            0,
            HFS_ATTR_BIG_KEYS,
        ));
        if !records.is_empty() {
            bytes[at + BLOCK..at + 2 * BLOCK]
                .copy_from_slice(&node(HFS_NODE_KIND_LEAF, 1, (0, 0), &records));
        }

        let vh = &mut bytes[HFSPLUS_VOLUME_HEADER_OFFSET..HFSPLUS_VOLUME_HEADER_OFFSET + 512];
        let (signature, version) = if self.hfsx {
            (HFSX_SIGNATURE, 5)
        } else {
            (HFSPLUS_SIGNATURE, 4)
        };
        put_u16(vh, 0, signature);
        put_u16(vh, 2, version);
        put_u32(vh, 40, BLOCK_SIZE);
        put_u32(vh, 44, TOTAL_BLOCKS);
        put_u32(vh, 64, 100);
        let extents_fork = Fork {
            logical_size: 2 * u64::from(BLOCK_SIZE),
            extents: vec![(EXTENTS_START, 2)],
        };
        vh[192..272].copy_from_slice(&extents_fork.encode());
        let mut catalog_fork_raw = inline_catalog.encode();
        put_u32(&mut catalog_fork_raw, 12, catalog_fork.total_blocks());
        vh[272..352].copy_from_slice(&catalog_fork_raw);
        bytes
    }

    #[must_use]
    pub fn build(&self) -> MemBlockSource {
        MemBlockSource::new(self.to_bytes())
    }
}
