#![forbid(unsafe_code)]

use pfs_btree::TreeOptions;
use pfs_error::PfsError;
use pfs_harness::xfs::{
    AGBLOCKS, BLOCKSIZE, Extent, FINOBT_ROOT, INOBT_ROOT, InodeChunk, XfsImage,
};
use pfs_xfs::XfsVolume;

fn open(image: &XfsImage) -> (pfs_block::MemBlockSource, XfsVolume) {
    let src = image.build();
    let volume = XfsVolume::open(&src, TreeOptions::default()).expect("open");
    (src, volume)
}

#[test]
fn v4_superblock_and_empty_groups() {
    let image = XfsImage::v4();
    let (src, volume) = open(&image);
    assert_eq!(volume.superblock().blocksize, BLOCKSIZE);
    assert_eq!(volume.superblock().agcount, 2);
    assert!(!volume.superblock().has_crc());

    let ag = volume.allocation_group(&src, 1).expect("ag 1");
    assert_eq!(ag.agno(), 1);
    assert!(ag.free_inode_btree().is_none());
    assert!(ag.inode_chunk(&src, 64).expect("lookup").is_none());
    assert!(volume.allocation_group(&src, 2).is_err());
}

#[test]
fn inode_chunk_lookup_uses_floor() {
    let mut image = XfsImage::v4();
    image.inobt_leaf(
        0,
        INOBT_ROOT,
        &[InodeChunk::allocated(64), InodeChunk::allocated(128)],
        None,
        None,
    );
    let (src, volume) = open(&image);

    let chunk = |ino| volume.inode_chunk(&src, ino).expect("lookup");
    assert_eq!(chunk(64).map(|c| c.startino), Some(64));
    assert_eq!(chunk(100).map(|c| c.startino), Some(64));
    assert_eq!(chunk(191).map(|c| c.startino), Some(128));
    assert!(chunk(192).is_none());
    assert!(chunk(10).is_none());
}

#[test]
fn allocation_status_reads_free_mask() {
    let mut image = XfsImage::v4();
    image.inobt_leaf(0, INOBT_ROOT, &[InodeChunk::with_free(128, 0b1010)], None, None);
    let (src, volume) = open(&image);

    assert!(volume.is_allocated(&src, 128).expect("status"));
    assert!(!volume.is_allocated(&src, 129).expect("status"));
    assert!(volume.is_allocated(&src, 130).expect("status"));
    assert!(!volume.is_allocated(&src, 131).expect("status"));
    assert!(!volume.is_allocated(&src, 300).expect("status"));

    // Inode 130: block 16 of AG 0, third slot.
    assert_eq!(
        volume.inode_offset(&src, 130).expect("offset"),
        Some(16 * u64::from(BLOCKSIZE) + 2 * 512)
    );
    assert_eq!(volume.inode_offset(&src, 129).expect("offset"), None);
}

#[test]
fn inode_numbers_carry_the_group() {
    let mut image = XfsImage::v4();
    image.inobt_leaf(1, INOBT_ROOT, &[InodeChunk::allocated(64)], None, None);
    let (src, volume) = open(&image);

    let ino = XfsImage::ino(1, 70);
    assert_eq!(volume.split_ino(ino).expect("split"), (1, 70));
    assert_eq!(volume.make_ino(1, 70), ino);
    assert!(volume.is_allocated(&src, ino).expect("status"));
    assert!(!volume.is_allocated(&src, 70).expect("status"));
    assert!(volume.split_ino(XfsImage::ino(2, 0)).is_err());
}

/// Two-level v5 inobt: root at block 3 over leaves at 5 and 6.
fn two_level_v5() -> XfsImage {
    let mut image = XfsImage::v5();
    image.inobt_leaf(
        0,
        5,
        &[InodeChunk::allocated(64), InodeChunk::with_free(128, 1 << 5)],
        None,
        Some(6),
    );
    image.inobt_leaf(
        0,
        6,
        &[InodeChunk::allocated(256), InodeChunk::with_free(320, u64::MAX)],
        Some(5),
        None,
    );
    image.inobt_internal(0, INOBT_ROOT, 1, &[(64, 5), (256, 6)]);
    image.finobt_leaf(
        0,
        FINOBT_ROOT,
        &[InodeChunk::with_free(128, 1 << 5), InodeChunk::with_free(320, u64::MAX)],
        None,
        None,
    );
    image.set_agi(0, INOBT_ROOT, 2, Some((FINOBT_ROOT, 1)));
    image
}

#[test]
fn v5_two_level_tree() {
    let image = two_level_v5();
    let (src, volume) = open(&image);
    let ag = volume.allocation_group(&src, 0).expect("ag");

    assert_eq!(ag.inode_chunk(&src, 300).expect("lookup").map(|c| c.startino), Some(256));
    assert!(ag.inode_chunk(&src, 255).expect("lookup").is_none());
    assert!(!ag.is_allocated(&src, 133).expect("status"));
    assert!(ag.is_allocated(&src, 134).expect("status"));

    let subtree = ag.load_inode_btree(&src).expect("load");
    assert_eq!(subtree.len(), 3);
    assert_eq!(subtree.height(), 2);
    let starts: Vec<u64> = subtree.entries().map(|e| e.key).collect();
    assert_eq!(starts, vec![64, 128, 256, 320]);
}

#[test]
fn free_inodes_come_from_finobt() {
    let image = two_level_v5();
    let (src, volume) = open(&image);
    let ag = volume.allocation_group(&src, 0).expect("ag");
    assert!(ag.free_inode_btree().is_some());

    let free = ag.free_inodes(&src).expect("scan");
    assert_eq!(free.len(), 65);
    assert_eq!(free[0], 133);
    assert_eq!(free[1], 320);
    assert_eq!(free[64], 383);
}

#[test]
fn free_inodes_fall_back_to_inobt_scan() {
    let mut image = XfsImage::v4();
    image.inobt_leaf(0, 5, &[InodeChunk::with_free(64, 0b11)], None, Some(6));
    image.inobt_leaf(0, 6, &[InodeChunk::with_free(256, 1 << 63)], Some(5), None);
    image.inobt_internal(0, INOBT_ROOT, 1, &[(64, 5), (256, 6)]);
    image.set_agi(0, INOBT_ROOT, 2, None);
    let (src, volume) = open(&image);

    let ag = volume.allocation_group(&src, 0).expect("ag");
    assert_eq!(ag.free_inodes(&src).expect("scan"), vec![64, 65, 319]);
}

#[test]
fn sparse_holes_are_not_allocated() {
    let mut image = XfsImage::v5_sparse();
    let chunk = InodeChunk {
        startino: 128,
        free: 1 << 8,
        holemask: 0b1,
    };
    image.inobt_leaf(0, INOBT_ROOT, &[chunk], None, None);
    image.finobt_leaf(0, FINOBT_ROOT, &[chunk], None, None);
    let (src, volume) = open(&image);
    let ag = volume.allocation_group(&src, 0).expect("ag");

    assert!(!ag.is_allocated(&src, 129).expect("status"));
    assert!(ag.is_allocated(&src, 132).expect("status"));
    assert!(!ag.is_allocated(&src, 136).expect("status"));
    assert_eq!(ag.free_inodes(&src).expect("scan"), vec![136]);
}

#[test]
fn v5_checksum_mismatch_is_corruption() {
    let mut image = XfsImage::v5();
    image.inobt_leaf(0, INOBT_ROOT, &[InodeChunk::allocated(64)], None, None);
    // Low bit of the record's free mask: inode 64 reads as free.
    let at = XfsImage::offset(0, INOBT_ROOT) + 56 + 15;
    image.bytes_mut()[at] ^= 0x01;
    let (src, volume) = open(&image);

    let err = volume.inode_chunk(&src, 64).unwrap_err();
    assert!(
        matches!(err, PfsError::Corruption { block, .. } if block == XfsImage::daddr(0, INOBT_ROOT)),
        "got {err:?}"
    );

    let lenient = XfsVolume::open(&src, TreeOptions::lenient()).expect("open");
    let chunk = lenient.inode_chunk(&src, 64).expect("lookup").expect("chunk");
    assert!(!chunk.is_allocated(0));
}

#[test]
fn v4_trees_carry_no_checksum() {
    let mut image = XfsImage::v4();
    image.inobt_leaf(0, INOBT_ROOT, &[InodeChunk::allocated(64)], None, None);
    let at = XfsImage::offset(0, INOBT_ROOT) + 16 + 15;
    image.bytes_mut()[at] ^= 0x01;
    let (src, volume) = open(&image);
    assert!(!volume.is_allocated(&src, 64).expect("status"));
    assert!(volume.is_allocated(&src, 65).expect("status"));
}

#[test]
fn owner_mismatch_is_corruption() {
    let mut image = XfsImage::v5();
    image.inobt_leaf(0, INOBT_ROOT, &[InodeChunk::allocated(64)], None, None);
    let at = XfsImage::offset(0, INOBT_ROOT) + 48;
    image.bytes_mut()[at..at + 4].copy_from_slice(&1_u32.to_be_bytes());
    image.reseal_short(0, INOBT_ROOT);
    let (src, volume) = open(&image);

    let err = volume.inode_chunk(&src, 64).unwrap_err();
    assert!(
        matches!(err, PfsError::Corruption { ref detail, .. } if detail.contains("owner")),
        "got {err:?}"
    );
    let lenient = XfsVolume::open(&src, TreeOptions::lenient()).expect("open");
    assert!(lenient.inode_chunk(&src, 64).expect("lookup").is_some());
}

#[test]
fn misplaced_block_fails_identity_check() {
    let mut image = XfsImage::v5();
    image.inobt_leaf(0, INOBT_ROOT, &[InodeChunk::allocated(64)], None, None);
    let from = XfsImage::offset(0, INOBT_ROOT);
    let to = XfsImage::offset(0, 7);
    let block = image.bytes_mut()[from..from + BLOCKSIZE as usize].to_vec();
    image.bytes_mut()[to..to + BLOCKSIZE as usize].copy_from_slice(&block);
    image.set_agi(0, 7, 1, Some((FINOBT_ROOT, 1)));
    let src = image.build();

    // blkno is checked even when integrity metadata is otherwise ignored.
    let volume = XfsVolume::open(&src, TreeOptions::lenient()).expect("open");
    let err = volume.inode_chunk(&src, 64).unwrap_err();
    assert!(
        matches!(err, PfsError::Corruption { ref detail, .. } if detail.contains("blkno")),
        "got {err:?}"
    );
}

#[test]
fn wrong_magic_is_unsupported_format() {
    let mut image = XfsImage::v4();
    image.set_agi(0, 9, 1, None);
    let (src, volume) = open(&image);
    let err = volume.inode_chunk(&src, 64).unwrap_err();
    assert!(matches!(err, PfsError::UnsupportedFormat(_)), "got {err:?}");
}

#[test]
fn agi_from_another_group_is_corruption() {
    let mut image = XfsImage::v4();
    let at = XfsImage::offset(0, 0) + 1024 + 8;
    image.bytes_mut()[at..at + 4].copy_from_slice(&1_u32.to_be_bytes());
    let (src, volume) = open(&image);
    let err = volume.allocation_group(&src, 0).unwrap_err();
    assert!(matches!(err, PfsError::Corruption { ref detail, .. } if detail.contains("seqno")));
}

#[test]
fn superblock_checksum_is_verified() {
    let mut image = XfsImage::v5();
    image.bytes_mut()[110] ^= 0x20;
    let src = image.build();
    let err = XfsVolume::open(&src, TreeOptions::default()).unwrap_err();
    assert!(matches!(err, PfsError::Corruption { block: 0, .. }), "got {err:?}");
    assert!(XfsVolume::open(&src, TreeOptions::lenient()).is_ok());
}

#[test]
fn pointer_past_group_end_is_structural() {
    let mut image = XfsImage::v4();
    image.inobt_internal(0, INOBT_ROOT, 1, &[(64, AGBLOCKS)]);
    image.set_agi(0, INOBT_ROOT, 2, None);
    let (src, volume) = open(&image);
    let err = volume.inode_chunk(&src, 64).unwrap_err();
    assert!(matches!(err, PfsError::Structural { .. }), "got {err:?}");
}

const FILE_INO: u64 = 131;

/// bmbt rooted at AG 1 block 10 over two sibling leaves.
fn block_map_image() -> XfsImage {
    let mut image = XfsImage::v5();
    let root = XfsImage::fsbno(1, 10);
    let left = XfsImage::fsbno(1, 11);
    let right = XfsImage::fsbno(1, 12);
    image.bmbt_leaf(
        left,
        FILE_INO,
        &[
            Extent::new(0, XfsImage::fsbno(1, 20), 4),
            Extent::new(8, XfsImage::fsbno(1, 30), 2),
        ],
        None,
        Some(right),
    );
    image.bmbt_leaf(
        right,
        FILE_INO,
        &[Extent {
            unwritten: true,
            ..Extent::new(16, XfsImage::fsbno(1, 40), 4)
        }],
        Some(left),
        None,
    );
    image.bmbt_internal(root, FILE_INO, 1, &[(0, left), (16, right)]);
    image
}

#[test]
fn block_map_lookup() {
    let image = block_map_image();
    let (src, volume) = open(&image);
    let map = volume
        .block_map(FILE_INO, XfsImage::fsbno(1, 10), 1)
        .expect("bmap");

    let hit = map.map_block(&src, 2).expect("map").expect("mapped");
    assert_eq!((hit.startoff, hit.blockcount), (0, 4));
    assert!(map.map_block(&src, 5).expect("hole").is_none());
    assert!(map.map_block(&src, 10).expect("hole").is_none());
    let tail = map.map_block(&src, 19).expect("map").expect("mapped");
    assert!(tail.unwritten);
    assert!(map.map_block(&src, 20).expect("past end").is_none());

    assert_eq!(
        map.block_offset(&src, 9).expect("offset"),
        Some(u64::from(AGBLOCKS + 31) * u64::from(BLOCKSIZE))
    );
    assert_eq!(map.block_offset(&src, 17).expect("unwritten"), None);

    let starts: Vec<u64> = map.extents(&src).expect("extents").iter().map(|e| e.startoff).collect();
    assert_eq!(starts, vec![0, 8, 16]);
}

#[test]
fn block_map_owner_is_the_inode() {
    let image = block_map_image();
    let (src, volume) = open(&image);
    let map = volume
        .block_map(FILE_INO + 1, XfsImage::fsbno(1, 10), 1)
        .expect("bmap");
    let err = map.map_block(&src, 0).unwrap_err();
    assert!(matches!(err, PfsError::Corruption { ref detail, .. } if detail.contains("owner")));
}
