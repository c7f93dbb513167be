#![forbid(unsafe_code)]

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use pfs_block::BlockSource;
use pfs_btrfs::{
    BTRFS_DIR_INDEX_KEY, BTRFS_EXTENT_DATA_KEY, BTRFS_FS_TREE_OBJECTID, BTRFS_FT_DIR,
    BTRFS_FT_REG_FILE, BTRFS_FT_SYMLINK, BTRFS_INODE_ITEM_KEY, BTRFS_ROOT_ITEM_KEY,
    BTRFS_ROOT_TREE_OBJECTID, BtrfsKey,
};
use pfs_core::{BtrfsInode, FileType, InodeNumber, OpenFs, OpenOptions, ReadOnlyFs};
use pfs_error::PfsError;
use pfs_harness::btrfs::{
    BtrfsImage, dir_item, inline_extent, inode_item, regular_extent, root_item,
};

const ROOT_DIR: u64 = 256;
const HELLO: u64 = 257;
const BIG: u64 = 258;
const LINK: u64 = 259;
const PACKED: u64 = 260;
const TORN: u64 = 261;
const SUBVOL: u64 = 256;

const HELLO_TEXT: &[u8] = b"hello, btrfs\n";
const INNER_TEXT: &[u8] = b"inner";
const PAGE: u64 = 4096;

fn inode_key(objectid: u64) -> BtrfsKey {
    BtrfsKey::new(objectid, BTRFS_INODE_ITEM_KEY, 0)
}

fn index_key(dir: u64, index: u64) -> BtrfsKey {
    BtrfsKey::new(dir, BTRFS_DIR_INDEX_KEY, index)
}

fn extent_key(objectid: u64, file_pos: u64) -> BtrfsKey {
    BtrfsKey::new(objectid, BTRFS_EXTENT_DATA_KEY, file_pos)
}

fn first_block() -> Vec<u8> {
    vec![b'A'; PAGE as usize]
}

fn second_block() -> Vec<u8> {
    (0..2 * PAGE).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

/// `big.bin` is three pages: data, a hole, then data taken 100 bytes into
/// its on-disk extent.
fn expected_big() -> Vec<u8> {
    let mut out = first_block();
    out.extend(vec![0_u8; PAGE as usize]);
    out.extend_from_slice(&second_block()[100..100 + PAGE as usize]);
    out
}

/// The image and the address of its FS tree leaf.
fn build_image() -> (BtrfsImage, u64) {
    let mut image = BtrfsImage::new();
    let first = image.data_extent(&first_block());
    let second = image.data_extent(&second_block());

    let fs = image.leaf(
        BTRFS_FS_TREE_OBJECTID,
        &[
            (inode_key(ROOT_DIR), inode_item(0o40_755, 0, 1)),
            (
                index_key(ROOT_DIR, 2),
                dir_item(inode_key(HELLO), BTRFS_FT_REG_FILE, "hello.txt"),
            ),
            (
                index_key(ROOT_DIR, 3),
                dir_item(inode_key(BIG), BTRFS_FT_REG_FILE, "big.bin"),
            ),
            (
                index_key(ROOT_DIR, 4),
                dir_item(inode_key(LINK), BTRFS_FT_SYMLINK, "link"),
            ),
            (
                index_key(ROOT_DIR, 5),
                dir_item(
                    BtrfsKey::new(SUBVOL, BTRFS_ROOT_ITEM_KEY, u64::MAX),
                    BTRFS_FT_DIR,
                    "sub",
                ),
            ),
            (
                index_key(ROOT_DIR, 6),
                dir_item(inode_key(PACKED), BTRFS_FT_REG_FILE, "packed.z"),
            ),
            (
                inode_key(HELLO),
                inode_item(0o100_644, HELLO_TEXT.len() as u64, 1),
            ),
            (extent_key(HELLO, 0), inline_extent(HELLO_TEXT)),
            (inode_key(BIG), inode_item(0o100_600, 3 * PAGE, 1)),
            (extent_key(BIG, 0), regular_extent(first, PAGE, 0, PAGE, 0)),
            (
                extent_key(BIG, 2 * PAGE),
                regular_extent(second, 2 * PAGE, 100, PAGE, 0),
            ),
            (inode_key(LINK), inode_item(0o120_777, 9, 1)),
            (extent_key(LINK, 0), inline_extent(b"hello.txt")),
            (inode_key(PACKED), inode_item(0o100_644, 10, 1)),
            (extent_key(PACKED, 0), regular_extent(first, PAGE, 0, 10, 1)),
            (inode_key(TORN), inode_item(0o100_644, 2 * PAGE, 1)),
            (extent_key(TORN, 0), vec![0xEE; 5]),
            (extent_key(TORN, PAGE), regular_extent(first, PAGE, 0, PAGE, 0)),
        ],
    );
    let sub = image.leaf(
        SUBVOL,
        &[
            (inode_key(256), inode_item(0o40_700, 0, 1)),
            (
                index_key(256, 2),
                dir_item(inode_key(257), BTRFS_FT_REG_FILE, "inner.txt"),
            ),
            (
                inode_key(257),
                inode_item(0o100_644, INNER_TEXT.len() as u64, 1),
            ),
            (extent_key(257, 0), inline_extent(INNER_TEXT)),
        ],
    );
    let root = image.leaf(
        BTRFS_ROOT_TREE_OBJECTID,
        &[
            (
                BtrfsKey::new(BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0),
                root_item(fs, 0, ROOT_DIR),
            ),
            (
                BtrfsKey::new(SUBVOL, BTRFS_ROOT_ITEM_KEY, 0),
                root_item(sub, 0, 256),
            ),
        ],
    );
    image.set_root_tree(root, 0);
    (image, fs)
}

fn image() -> BtrfsImage {
    build_image().0
}

fn open_with(options: &OpenOptions) -> OpenFs {
    let src: Arc<dyn BlockSource> = Arc::new(image().build());
    OpenFs::from_source(src, options).expect("btrfs opens")
}

fn open() -> OpenFs {
    open_with(&OpenOptions::default())
}

fn read_path(fs: &OpenFs, path: &str) -> Vec<u8> {
    let attr = fs.resolve_path(path).expect("path resolves");
    fs.read(attr.ino, 0, u32::try_from(attr.size).unwrap())
        .expect("read")
}

#[test]
fn detected_as_btrfs_with_a_vfs_view() {
    let fs = open();
    assert_eq!(fs.flavor.name(), "btrfs");
    assert_eq!(fs.vfs().root_ino(), InodeNumber(ROOT_DIR));
    assert!(fs.btrfs().is_some());
    assert_eq!(fs.root_ino(), InodeNumber(ROOT_DIR));
}

#[test]
fn root_lists_in_index_order_with_cookies() {
    let fs = open();
    let entries = fs.readdir(fs.root_ino(), 0).expect("readdir");
    let names: Vec<String> = entries.iter().map(|e| e.name_str()).collect();
    assert_eq!(names, ["hello.txt", "big.bin", "link", "sub", "packed.z"]);
    let cookies: Vec<u64> = entries.iter().map(|e| e.offset).collect();
    assert_eq!(cookies, [1, 2, 3, 4, 5]);
    assert_eq!(entries[2].kind, FileType::Symlink);
    assert_eq!(entries[3].kind, FileType::Directory);

    let rest = fs.readdir(fs.root_ino(), entries[1].offset).expect("resume");
    assert_eq!(rest[0].name_str(), "link");
    assert!(fs.readdir(fs.root_ino(), 5).expect("end").is_empty());
}

#[test]
fn getattr_reports_the_inode_item() {
    let fs = open();
    let attr = fs
        .lookup(fs.root_ino(), OsStr::new("hello.txt"))
        .expect("lookup");
    assert_eq!(attr.ino, InodeNumber(HELLO));
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.size, HELLO_TEXT.len() as u64);
    assert_eq!(attr.perm, 0o644);
    assert_eq!((attr.uid, attr.gid, attr.nlink), (1000, 1000, 1));
    assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    assert_eq!(attr.blksize, 4096);

    let root = fs.getattr(fs.root_ino()).expect("root attr");
    assert_eq!(root.kind, FileType::Directory);
    assert_eq!(root.perm, 0o755);
}

#[test]
fn inline_content_reads_and_clips() {
    let fs = open();
    let ino = InodeNumber(HELLO);
    assert_eq!(fs.read(ino, 0, 4096).expect("read"), HELLO_TEXT);
    assert_eq!(fs.read(ino, 7, 5).expect("read"), b"btrfs");
    assert!(fs.read(ino, 100, 10).expect("past eof").is_empty());
}

#[test]
fn regular_extents_and_holes() {
    let fs = open();
    assert_eq!(read_path(&fs, "big.bin"), expected_big());

    let ino = InodeNumber(BIG);
    let across = fs.read(ino, PAGE - 8, 16).expect("read across hole");
    assert_eq!(&across[..8], b"AAAAAAAA");
    assert_eq!(&across[8..], &[0_u8; 8]);
    let tail = fs.read(ino, 3 * PAGE - 4, 100).expect("tail");
    assert_eq!(tail, expected_big()[3 * PAGE as usize - 4..]);
}

#[test]
fn reads_begin_at_the_extent_covering_the_offset() {
    let fs = open();
    let ino = InodeNumber(TORN);
    // The torn extent at 0 is never decoded for reads past it.
    assert_eq!(fs.read(ino, PAGE, 8).expect("second extent"), b"AAAAAAAA");
    assert_eq!(fs.read(ino, PAGE + 100, 4).expect("inside extent"), b"AAAA");
    assert!(fs.read(ino, 0, 8).is_err());
    assert!(fs.read(ino, PAGE - 1, 2).is_err());
}

#[test]
fn subvolume_entries_cross_into_their_tree() {
    let fs = open();
    let sub = fs.resolve_path("/sub").expect("subvolume root");
    assert_eq!(sub.kind, FileType::Directory);
    assert_eq!(sub.perm, 0o700);
    assert_eq!(
        BtrfsInode::from_ino(sub.ino),
        BtrfsInode {
            tree: SUBVOL,
            objectid: 256
        }
    );
    assert_ne!(sub.ino, fs.root_ino());
    assert_eq!(read_path(&fs, "sub/inner.txt"), INNER_TEXT);
    assert_eq!(read_path(&fs, "./sub//inner.txt"), INNER_TEXT);
}

#[test]
fn symlinks_read_their_target() {
    let fs = open();
    let link = fs.resolve_path("link").expect("link");
    assert_eq!(link.kind, FileType::Symlink);
    assert_eq!(fs.readlink(link.ino).expect("readlink"), b"hello.txt");

    let err = fs.readlink(InodeNumber(HELLO)).unwrap_err();
    assert!(matches!(err, PfsError::Parse(_)));
}

#[test]
fn compressed_extents_are_unsupported() {
    let fs = open();
    let err = fs.read(InodeNumber(PACKED), 0, 10).unwrap_err();
    assert!(matches!(err, PfsError::UnsupportedFeature(_)));
}

#[test]
fn wrong_kind_errors() {
    let fs = open();
    assert!(matches!(
        fs.read(fs.root_ino(), 0, 10),
        Err(PfsError::IsDirectory)
    ));
    assert!(matches!(
        fs.readdir(InodeNumber(HELLO), 0),
        Err(PfsError::NotDirectory)
    ));
    assert!(matches!(
        fs.resolve_path("hello.txt/x"),
        Err(PfsError::NotDirectory)
    ));
    assert!(matches!(
        fs.lookup(fs.root_ino(), OsStr::new("missing")),
        Err(PfsError::NotFound(_))
    ));
    assert!(matches!(
        fs.getattr(InodeNumber(999)),
        Err(PfsError::NotFound(_))
    ));
}

#[test]
fn uncached_directories_list_the_same() {
    let cached = open();
    let uncached = open_with(&OpenOptions {
        cache_directories: false,
        cache_nodes: false,
        ..OpenOptions::default()
    });
    for _ in 0..2 {
        assert_eq!(
            cached.readdir(cached.root_ino(), 0).expect("cached"),
            uncached.readdir(uncached.root_ino(), 0).expect("uncached")
        );
    }
}

#[test]
fn damaged_fs_leaf_reads_only_without_validation() {
    let (mut image, fs_leaf) = build_image();
    image.node_mut(fs_leaf)[2048] ^= 0xFF;
    let src: Arc<dyn BlockSource> = Arc::new(image.build());

    let strict = OpenFs::from_source(Arc::clone(&src), &OpenOptions::default()).expect("opens");
    let err = strict.readdir(strict.root_ino(), 0).unwrap_err();
    assert!(err.is_integrity_failure(), "got {err:?}");

    let lenient = OpenFs::from_source(
        src,
        &OpenOptions {
            skip_validation: true,
            ..OpenOptions::default()
        },
    )
    .expect("opens");
    assert_eq!(lenient.readdir(lenient.root_ino(), 0).expect("lists").len(), 5);
}
