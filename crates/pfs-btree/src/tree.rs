//! Tree handle, node loading and the public search operations.

use std::sync::Arc;

use pfs_block::BlockSource;
use pfs_error::Result;
use pfs_types::NodeRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cache::NodeCache;
use crate::cursor::{RangeScan, ScanBound, TreeCursor};
use crate::error::{node_error, structural};
use crate::format::TreeFormat;
use crate::layout::HeaderVersion;
use crate::node::{LeafEntry, Node};
use crate::subtree::{Subtree, load_subtree};
use crate::validate::check_intrinsic;

/// Validation and caching switches for one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Verify per-node checksums on extended layouts.
    pub verify_checksums: bool,
    /// Compare the extended header owner with the tree's expected owner.
    pub check_owner: bool,
    /// Verify key order inside nodes and against parent separators.
    pub check_key_order: bool,
    pub cache_nodes: bool,
    pub cache_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            check_owner: true,
            check_key_order: true,
            cache_nodes: true,
            cache_capacity: 4096,
        }
    }
}

impl TreeOptions {
    /// Options for damaged images: structural checks stay on, integrity
    /// metadata (checksums, owners) is ignored.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            verify_checksums: false,
            check_owner: false,
            ..Self::default()
        }
    }
}

/// Decode and intrinsically validate one node from raw bytes.
///
/// Pure function of its inputs: no I/O, no cache. The checksum is verified
/// before any field is interpreted.
pub fn decode_node<F: TreeFormat>(
    format: &F,
    options: &TreeOptions,
    owner: Option<u64>,
    addr: NodeRef,
    raw: &[u8],
) -> Result<Node<F::Key, F::Record>> {
    let layout = format.layout();
    if raw.len() != layout.node_len() {
        return Err(structural(
            addr,
            format!("node is {} bytes, layout says {}", raw.len(), layout.node_size),
        ));
    }
    if options.verify_checksums && layout.version == HeaderVersion::Extended {
        format
            .verify_checksum(addr, raw)
            .map_err(|err| node_error(addr, err))?;
    }
    let node = format
        .decode_node(addr, raw)
        .map_err(|err| node_error(addr, err))?;
    check_intrinsic(format, options, owner, addr, &node)?;
    trace!(
        format = format.name(),
        node = addr.0,
        kind = ?node.kind(),
        level = node.level(),
        entries = node.len(),
        "node_decoded"
    );
    Ok(node)
}

/// A read-only view of one on-disk tree.
///
/// The block source is passed to each operation rather than stored, so a
/// tree can be shared across threads and sources freely.
#[derive(Debug)]
pub struct Tree<F: TreeFormat> {
    format: F,
    root: Option<NodeRef>,
    root_level: Option<u16>,
    owner: Option<u64>,
    options: TreeOptions,
    cache: Option<NodeCache<F::Key, F::Record>>,
}

impl<F: TreeFormat> Tree<F> {
    #[must_use]
    pub fn new(format: F, root: NodeRef) -> Self {
        Self::build(format, Some(root))
    }

    /// A tree with no root; every search returns nothing.
    #[must_use]
    pub fn empty(format: F) -> Self {
        Self::build(format, None)
    }

    fn build(format: F, root: Option<NodeRef>) -> Self {
        let options = TreeOptions::default();
        Self {
            format,
            root,
            root_level: None,
            owner: None,
            cache: Self::make_cache(&options),
            options,
        }
    }

    fn make_cache(options: &TreeOptions) -> Option<NodeCache<F::Key, F::Record>> {
        options
            .cache_nodes
            .then(|| NodeCache::new(options.cache_capacity))
    }

    #[must_use]
    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.cache = Self::make_cache(&options);
        self.options = options;
        self
    }

    /// Require the root node to sit at `level`.
    #[must_use]
    pub fn with_root_level(mut self, level: u16) -> Self {
        self.root_level = Some(level);
        self
    }

    /// Require every node's extended-header owner to equal `owner`.
    #[must_use]
    pub fn with_owner(mut self, owner: u64) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn format(&self) -> &F {
        &self.format
    }

    #[must_use]
    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    #[must_use]
    pub fn root_level(&self) -> Option<u16> {
        self.root_level
    }

    #[must_use]
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    #[must_use]
    pub fn cached_nodes(&self) -> usize {
        self.cache.as_ref().map_or(0, NodeCache::len)
    }

    /// Read, verify and decode node `addr`, consulting the cache first.
    pub fn load_node(
        &self,
        src: &dyn BlockSource,
        addr: NodeRef,
    ) -> Result<Arc<Node<F::Key, F::Record>>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(addr) {
                return Ok(hit);
            }
        }
        let offset = self
            .format
            .locate(addr)
            .map_err(|err| node_error(addr, err))?;
        let raw = src.read_at(offset, self.format.layout().node_len())?;
        let node = Arc::new(decode_node(
            &self.format,
            &self.options,
            self.owner,
            addr,
            raw.as_slice(),
        )?);
        Ok(match &self.cache {
            Some(cache) => cache.insert(addr, node),
            None => node,
        })
    }

    #[must_use]
    pub fn cursor<'a>(&'a self, src: &'a dyn BlockSource) -> TreeCursor<'a, F> {
        TreeCursor::new(self, src)
    }

    /// Exact-match lookup. `Ok(None)` means the key is absent from an
    /// intact tree.
    pub fn find_first(
        &self,
        src: &dyn BlockSource,
        key: &F::Key,
    ) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        let found = self.cursor(src).find_first(key)?;
        debug!(
            format = self.format.name(),
            found = found.is_some(),
            "btree_find_first"
        );
        Ok(found)
    }

    /// First entry whose key shares `prefix`'s leading fields.
    pub fn find_first_prefix(
        &self,
        src: &dyn BlockSource,
        prefix: &F::Key,
    ) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        self.find(src, prefix).next().transpose()
    }

    /// Greatest entry whose key is `<= key`.
    pub fn find_floor(
        &self,
        src: &dyn BlockSource,
        key: &F::Key,
    ) -> Result<Option<LeafEntry<F::Key, F::Record>>> {
        self.cursor(src).find_floor(key)
    }

    /// Lazy scan of every entry matching `prefix`, in key order.
    #[must_use]
    pub fn find<'a>(&'a self, src: &'a dyn BlockSource, prefix: &F::Key) -> RangeScan<'a, F> {
        let start = self.format.prefix_start(prefix);
        RangeScan::new(
            self.cursor(src),
            start,
            ScanBound::Prefix(prefix.clone()),
        )
    }

    /// Lazy scan of every entry with key `>= start`, to the end of the tree.
    #[must_use]
    pub fn iter_from<'a>(&'a self, src: &'a dyn BlockSource, start: &F::Key) -> RangeScan<'a, F> {
        RangeScan::new(self.cursor(src), start.clone(), ScanBound::Unbounded)
    }

    /// Eagerly load every node reachable from `node`.
    pub fn load_subtree(
        &self,
        src: &dyn BlockSource,
        node: NodeRef,
    ) -> Result<Subtree<F::Key, F::Record>> {
        load_subtree(self, src, node)
    }

    /// Eagerly load the whole tree. `None` for an empty tree.
    pub fn load_all(&self, src: &dyn BlockSource) -> Result<Option<Subtree<F::Key, F::Record>>> {
        self.root
            .map(|root| load_subtree(self, src, root))
            .transpose()
    }
}
