//! HFS+ B-tree files as a [`TreeFormat`].
//!
//! Catalog and extents-overflow files share one node format: a 14-byte
//! big-endian descriptor, variable-length records and a table of record
//! offsets growing backwards from the node end. Node 0 is the header node.
//! Nodes are addressed by node number and read from a view of the B-tree
//! file's fork, so a node's byte offset is `number * node_size`.

use std::cmp::Ordering;
use std::fmt;

use pfs_block::BlockSource;
use pfs_btree::{
    DuplicateKeys, HeaderNode, HeaderVersion, IndexEntry, InternalNode, KeyCodec, LeafEntry,
    LeafNode, LevelPolicy, Node, NodeHeader, NodeKind, NodeLayout, Tree, TreeFormat, TreeMeta,
    TreeOptions, decode_node, parse_error,
};
use pfs_error::{PfsError, Result};
use pfs_ondisk::hfsplus::{
    HFS_HEADER_RECORD_SIZE, HFS_NODE_DESCRIPTOR_SIZE, HFS_NODE_KIND_HEADER, HFS_NODE_KIND_INDEX,
    HFS_NODE_KIND_LEAF, HfsHeaderRecord, HfsNodeDescriptor, record_ranges,
};
use pfs_types::{NodeRef, ParseError, read_be_u32};
use tracing::debug;

/// Deepest tree the engine accepts (`kMaxTreeDepth`).
const HFS_MAX_TREE_DEPTH: u16 = 16;
const OFFSET_SLOT: usize = 2;
const CHILD_POINTER: usize = 4;

/// Key and record codec for one kind of HFS+ B-tree file.
pub trait HfsTreeKind: fmt::Debug + Clone + Send + Sync {
    type Key: Clone + fmt::Debug + Send + Sync;
    type Record: Clone + fmt::Debug + Send + Sync;

    const NAME: &'static str;
    /// Smallest leaf record (key plus data) the file can hold.
    const MIN_LEAF_RECORD: usize;
    /// Smallest index key including its length prefix.
    const MIN_INDEX_KEY: usize;

    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Parse the key at the start of `record`; returns the key and the
    /// bytes it occupies.
    fn parse_key(&self, record: &[u8]) -> std::result::Result<(Self::Key, usize), ParseError>;

    fn parse_record(&self, data: &[u8]) -> std::result::Result<Self::Record, ParseError>;

    fn matches_prefix(&self, candidate: &Self::Key, prefix: &Self::Key) -> bool;

    fn prefix_start(&self, prefix: &Self::Key) -> Self::Key;
}

/// Node layout of an HFS+ B-tree file of kind `K`.
#[must_use]
pub fn hfs_layout<K: HfsTreeKind>(node_size: u16) -> NodeLayout {
    NodeLayout {
        version: HeaderVersion::Legacy,
        node_size: u32::from(node_size),
        header_len: HFS_NODE_DESCRIPTOR_SIZE,
        leaf_record_width: K::MIN_LEAF_RECORD + OFFSET_SLOT,
        internal_record_width: K::MIN_INDEX_KEY + CHILD_POINTER + OFFSET_SLOT,
        max_level: HFS_MAX_TREE_DEPTH - 1,
        sibling_links: true,
        duplicates: DuplicateKeys::Forbidden,
        level_policy: LevelPolicy::StrictByOne,
    }
}

#[derive(Debug, Clone)]
pub struct HfsTreeFormat<K> {
    kind: K,
    layout: NodeLayout,
    /// Index keys occupy their own length instead of `max_key_length`.
    variable_index_keys: bool,
    max_key_length: u16,
}

impl<K: HfsTreeKind> HfsTreeFormat<K> {
    #[must_use]
    pub fn new(kind: K, header: &HfsHeaderRecord) -> Self {
        Self {
            kind,
            layout: hfs_layout::<K>(header.node_size),
            variable_index_keys: header.has_variable_index_keys(),
            max_key_length: header.max_key_length,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &K {
        &self.kind
    }

    fn index_key_span(&self, used: usize) -> usize {
        if self.variable_index_keys {
            used
        } else {
            2 + usize::from(self.max_key_length)
        }
    }
}

fn link(raw: u32) -> Option<NodeRef> {
    (raw != 0).then_some(NodeRef(u64::from(raw)))
}

fn header_of(desc: &HfsNodeDescriptor) -> NodeHeader {
    NodeHeader {
        magic: 0,
        level: u16::from(desc.height).saturating_sub(1),
        record_count: u32::from(desc.num_records),
        left_sibling: link(desc.b_link),
        right_sibling: link(desc.f_link),
        extended: None,
    }
}

fn tree_meta(header: &HfsHeaderRecord) -> TreeMeta {
    TreeMeta {
        root: link(header.root_node),
        depth: header.tree_depth,
        leaf_records: u64::from(header.leaf_records),
        first_leaf: link(header.first_leaf_node),
        last_leaf: link(header.last_leaf_node),
        node_size: u32::from(header.node_size),
        max_key_length: header.max_key_length,
        total_nodes: u64::from(header.total_nodes),
        free_nodes: u64::from(header.free_nodes),
        key_compare: header.key_compare_type,
        attributes: header.attributes,
    }
}

impl<K: HfsTreeKind> KeyCodec for HfsTreeFormat<K> {
    type Key = K::Key;

    fn compare(&self, a: &K::Key, b: &K::Key) -> Ordering {
        self.kind.compare(a, b)
    }

    fn decode_key(&self, raw: &[u8]) -> std::result::Result<K::Key, ParseError> {
        self.kind.parse_key(raw).map(|(key, _)| key)
    }

    fn matches_prefix(&self, candidate: &K::Key, prefix: &K::Key) -> bool {
        self.kind.matches_prefix(candidate, prefix)
    }

    fn prefix_start(&self, prefix: &K::Key) -> K::Key {
        self.kind.prefix_start(prefix)
    }
}

impl<K: HfsTreeKind> TreeFormat for HfsTreeFormat<K> {
    type Record = K::Record;

    fn name(&self) -> &'static str {
        K::NAME
    }

    fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn locate(&self, node: NodeRef) -> std::result::Result<u64, ParseError> {
        node.0
            .checked_mul(u64::from(self.layout.node_size))
            .ok_or(ParseError::IntegerConversion {
                field: "node_number",
            })
    }

    fn decode_node(
        &self,
        _node: NodeRef,
        raw: &[u8],
    ) -> std::result::Result<Node<K::Key, K::Record>, ParseError> {
        let desc = HfsNodeDescriptor::parse(raw)?;
        let header = header_of(&desc);
        match desc.kind {
            HFS_NODE_KIND_HEADER => Ok(Node::Header(HeaderNode {
                header,
                meta: tree_meta(&HfsHeaderRecord::parse(raw)?),
            })),
            HFS_NODE_KIND_LEAF => {
                self.layout
                    .check_record_count(NodeKind::Leaf, usize::from(desc.num_records))?;
                let entries = record_ranges(raw, desc.num_records)?
                    .into_iter()
                    .map(|range| {
                        let record = &raw[range];
                        let (key, used) = self.kind.parse_key(record)?;
                        let data = record.get(used..).ok_or(ParseError::InvalidField {
                            field: "record",
                            reason: "key overruns record",
                        })?;
                        Ok(LeafEntry {
                            key,
                            record: self.kind.parse_record(data)?,
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, ParseError>>()?;
                Ok(Node::Leaf(LeafNode { header, entries }))
            }
            HFS_NODE_KIND_INDEX => {
                self.layout
                    .check_record_count(NodeKind::Internal, usize::from(desc.num_records))?;
                let entries = record_ranges(raw, desc.num_records)?
                    .into_iter()
                    .map(|range| {
                        let record = &raw[range];
                        let (key, used) = self.kind.parse_key(record)?;
                        let child = read_be_u32(record, self.index_key_span(used))?;
                        Ok(IndexEntry {
                            key,
                            child: NodeRef(u64::from(child)),
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, ParseError>>()?;
                // An index node at height 0 or 1 decodes to level 0 and is
                // rejected by intrinsic validation.
                Ok(Node::Internal(InternalNode { header, entries }))
            }
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "map node is not part of the tree",
            }),
        }
    }
}

pub type HfsTree<K> = Tree<HfsTreeFormat<K>>;

/// Open the B-tree stored in `file`: read the header node, build the format
/// from it and bind the root it names.
///
/// `kind` sees the header record first, since the catalog's name ordering
/// is declared there.
pub fn open_btree<K: HfsTreeKind>(
    file: &dyn BlockSource,
    options: TreeOptions,
    kind: impl FnOnce(&HfsHeaderRecord) -> K,
) -> Result<(HfsTree<K>, TreeMeta)> {
    let head = file.read_at(0, HFS_NODE_DESCRIPTOR_SIZE + HFS_HEADER_RECORD_SIZE)?;
    let record = HfsHeaderRecord::parse(head.as_slice())
        .map_err(|err| parse_error(K::NAME, err))?;
    let format = HfsTreeFormat::new(kind(&record), &record);

    let raw = file.read_at(0, format.layout().node_len())?;
    let node = decode_node(&format, &options, None, NodeRef(0), raw.as_slice())?;
    let Some(header) = node.as_header() else {
        return Err(PfsError::Corruption {
            block: 0,
            detail: format!("{} node 0 is not a header node", K::NAME),
        });
    };
    let meta = header.meta;
    debug!(
        tree = K::NAME,
        root = meta.root.map(|r| r.0),
        depth = meta.depth,
        node_size = meta.node_size,
        records = meta.leaf_records,
        "hfs_btree_open"
    );

    let tree = match meta.root {
        Some(root) => Tree::new(format, root)
            .with_options(options)
            .with_root_level(meta.depth.saturating_sub(1)),
        None => Tree::empty(format).with_options(options),
    };
    Ok((tree, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogKind, NameOrder};
    use pfs_block::MemBlockSource;
    use pfs_harness::hfsplus::{TreeHeader, catalog_key, folder_record, header_node, node};
    use pfs_ondisk::hfsplus::{
        HFS_ATTR_BIG_KEYS, HFS_ATTR_VARIABLE_INDEX_KEYS, HFS_KEY_COMPARE_CASE_FOLDING,
        HFS_NODE_KIND_MAP, HfsCatalogKey, HfsCatalogRecord,
    };

    const VARIABLE: u32 = HFS_ATTR_BIG_KEYS | HFS_ATTR_VARIABLE_INDEX_KEYS;

    fn kind() -> CatalogKind {
        CatalogKind {
            order: NameOrder::CaseFolding,
        }
    }

    fn catalog_format(attributes: u32) -> HfsTreeFormat<CatalogKind> {
        let header = HfsHeaderRecord {
            tree_depth: 2,
            root_node: 3,
            leaf_records: 2,
            first_leaf_node: 1,
            last_leaf_node: 2,
            node_size: 4096,
            max_key_length: 516,
            total_nodes: 4,
            free_nodes: 0,
            clump_size: 0,
            btree_type: 0,
            key_compare_type: HFS_KEY_COMPARE_CASE_FOLDING,
            attributes,
        };
        HfsTreeFormat::new(kind(), &header)
    }

    fn root_record() -> Vec<u8> {
        [catalog_key(1, "root"), folder_record(2, 0)].concat()
    }

    #[test]
    fn leaf_height_one_is_level_zero_with_links() {
        let format = catalog_format(VARIABLE);
        let raw = node(HFS_NODE_KIND_LEAF, 1, (4, 7), &[root_record()]);
        let decoded = decode_node(&format, &TreeOptions::default(), None, NodeRef(5), &raw)
            .expect("leaf decodes");
        let header = decoded.header();
        assert_eq!(header.level, 0);
        assert_eq!(header.left_sibling, Some(NodeRef(4)));
        assert_eq!(header.right_sibling, Some(NodeRef(7)));
        let leaf = decoded.as_leaf().expect("leaf node");
        assert_eq!(leaf.entries[0].key, HfsCatalogKey::new(1, "root"));
        assert!(matches!(leaf.entries[0].record, HfsCatalogRecord::Folder(_)));
    }

    #[test]
    fn variable_index_keys_are_followed_by_the_child() {
        let format = catalog_format(VARIABLE);
        let mut record = catalog_key(1, "a");
        record.extend_from_slice(&9_u32.to_be_bytes());
        let raw = node(HFS_NODE_KIND_INDEX, 2, (0, 0), &[record]);
        let decoded = format.decode_node(NodeRef(3), &raw).expect("index decodes");
        assert_eq!(decoded.level(), 1);
        assert_eq!(decoded.as_internal().expect("index").entries[0].child, NodeRef(9));
    }

    #[test]
    fn fixed_index_keys_span_max_key_length() {
        let format = catalog_format(HFS_ATTR_BIG_KEYS);
        let mut record = catalog_key(1, "a");
        record.resize(2 + 516, 0);
        record.extend_from_slice(&9_u32.to_be_bytes());
        let raw = node(HFS_NODE_KIND_INDEX, 2, (0, 0), &[record]);
        let decoded = format.decode_node(NodeRef(3), &raw).expect("index decodes");
        let internal = decoded.as_internal().expect("index");
        assert_eq!(internal.entries[0].key, HfsCatalogKey::new(1, "a"));
        assert_eq!(internal.entries[0].child, NodeRef(9));
    }

    #[test]
    fn map_nodes_are_rejected() {
        let format = catalog_format(VARIABLE);
        let raw = node(HFS_NODE_KIND_MAP, 0, (0, 0), &[vec![0xFF; 16]]);
        let err = format.decode_node(NodeRef(6), &raw).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "kind", .. }));
    }

    #[test]
    fn index_node_at_height_one_is_corruption() {
        let format = catalog_format(VARIABLE);
        let mut record = catalog_key(1, "a");
        record.extend_from_slice(&9_u32.to_be_bytes());
        let raw = node(HFS_NODE_KIND_INDEX, 1, (0, 0), &[record]);
        let err = decode_node(&format, &TreeOptions::default(), None, NodeRef(3), &raw)
            .unwrap_err();
        assert!(matches!(err, PfsError::Corruption { block: 3, .. }), "{err:?}");
    }

    #[test]
    fn open_binds_the_root_named_by_the_header_node() {
        let header = TreeHeader {
            depth: 1,
            root: 1,
            leaf_records: 1,
            first_leaf: 1,
            last_leaf: 1,
        };
        let leaf = node(HFS_NODE_KIND_LEAF, 1, (0, 0), &[root_record()]);
        let file = MemBlockSource::new(
            [
                header_node(header, 2, 516, HFS_KEY_COMPARE_CASE_FOLDING, VARIABLE),
                leaf,
            ]
            .concat(),
        );
        let (tree, meta) =
            open_btree(&file, TreeOptions::default(), |_| kind()).expect("tree opens");
        assert_eq!(tree.root(), Some(NodeRef(1)));
        assert_eq!(tree.root_level(), Some(0));
        assert_eq!(meta.node_size, 4096);
        assert_eq!(meta.total_nodes, 2);
        assert_eq!(meta.key_compare, HFS_KEY_COMPARE_CASE_FOLDING);
        assert_eq!(meta.first_leaf, Some(NodeRef(1)));

        let found = tree
            .find_first(&file, &HfsCatalogKey::new(1, "ROOT"))
            .expect("search")
            .expect("root record");
        assert_eq!(found.record.cnid(), Some(2));
    }

    #[test]
    fn zero_root_opens_an_empty_tree() {
        let file = MemBlockSource::new(header_node(
            TreeHeader::default(),
            1,
            516,
            HFS_KEY_COMPARE_CASE_FOLDING,
            VARIABLE,
        ));
        let (tree, meta) =
            open_btree(&file, TreeOptions::default(), |_| kind()).expect("tree opens");
        assert_eq!(tree.root(), None);
        assert_eq!(meta.root, None);
        let missing = tree
            .find_first(&file, &HfsCatalogKey::new(1, "root"))
            .expect("search");
        assert!(missing.is_none());
    }
}
