//! Volume header, B-tree bootstrap and catalog operations.

use pfs_block::{BlockSource, ExtentMappedSource, Segment, read_hfsplus_header_region};
use pfs_btree::{LeafEntry, TreeMeta, TreeOptions, parse_error};
use pfs_error::{PfsError, Result};
use pfs_ondisk::hfsplus::{
    HFS_CATALOG_FILE_ID, HFS_DATA_FORK, HFS_ROOT_FOLDER_ID, HfsCatalogFile, HfsCatalogKey,
    HfsCatalogRecord, HfsCatalogThread, HfsExtentDescriptor, HfsExtentKey, HfsForkData,
    HfsPlusVolumeHeader,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{CatalogKind, NameOrder};
use crate::extents::{ExtentsKind, fork_segments};
use crate::format::{HfsTree, open_btree};

pub type CatalogTree = HfsTree<CatalogKind>;
pub type ExtentsTree = HfsTree<ExtentsKind>;

/// Fork content as a byte stream over the volume.
pub type ForkSource<'a> = ExtentMappedSource<&'a dyn BlockSource>;

const HFSPLUS_VERSION: u16 = 4;
const HFSX_VERSION: u16 = 5;

/// A folder or file record together with the name it has in its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HfsDirEntry {
    pub parent_id: u32,
    pub name: String,
    pub record: HfsCatalogRecord,
}

impl HfsDirEntry {
    fn from_leaf(entry: LeafEntry<HfsCatalogKey, HfsCatalogRecord>) -> Self {
        Self {
            parent_id: entry.key.parent_id,
            name: entry.key.name_lossy(),
            record: entry.record,
        }
    }

    /// Catalog node id of the folder or file.
    #[must_use]
    pub fn cnid(&self) -> u32 {
        self.record.cnid().unwrap_or_default()
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.record, HfsCatalogRecord::Folder(_))
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&HfsCatalogFile> {
        match &self.record {
            HfsCatalogRecord::File(file) => Some(file),
            _ => None,
        }
    }
}

fn validate_header(header: &HfsPlusVolumeHeader, src: &dyn BlockSource) -> Result<()> {
    let expected = if header.is_hfsx() {
        HFSX_VERSION
    } else {
        HFSPLUS_VERSION
    };
    if header.version != expected {
        return Err(PfsError::UnsupportedFormat(format!(
            "hfs+ volume header version {}",
            header.version
        )));
    }
    let volume_len = u64::from(header.total_blocks) * u64::from(header.block_size);
    if volume_len > src.len_bytes() {
        return Err(PfsError::InvalidGeometry(format!(
            "hfs+ volume of {volume_len} bytes on a {}-byte source",
            src.len_bytes()
        )));
    }
    if header.catalog_file.logical_size == 0 {
        return Err(PfsError::InvalidGeometry("hfs+ catalog file is empty".to_owned()));
    }
    Ok(())
}

/// The extents-overflow file: its tree plus where its fork lives.
#[derive(Debug)]
struct ExtentsFile {
    tree: ExtentsTree,
    segments: Vec<Segment>,
}

/// All extents of a fork: the eight inline descriptors followed by any
/// overflow records, checked to continue each other without gaps.
fn fork_extents(
    src: &dyn BlockSource,
    overflow: Option<&ExtentsFile>,
    file_id: u32,
    fork_type: u8,
    fork: &HfsForkData,
) -> Result<Vec<HfsExtentDescriptor>> {
    let total = u64::from(fork.total_blocks);
    let mut extents: Vec<_> = fork
        .extents
        .iter()
        .copied()
        .filter(|extent| extent.block_count != 0)
        .collect();
    let mut blocks = fork.inline_blocks();
    if blocks >= total {
        return Ok(extents);
    }
    let Some(overflow) = overflow else {
        return Err(PfsError::Corruption {
            block: 0,
            detail: format!("fork of file {file_id} needs overflow extents but none exist"),
        });
    };

    let file = ExtentMappedSource::new(src, overflow.segments.clone())?;
    let prefix = HfsExtentKey {
        fork_type,
        file_id,
        start_block: 0,
    };
    for entry in overflow.tree.find(&file, &prefix) {
        let entry = entry?;
        if u64::from(entry.key.start_block) != blocks {
            return Err(PfsError::Corruption {
                block: 0,
                detail: format!(
                    "overflow extents of file {file_id} resume at block {} after {blocks}",
                    entry.key.start_block
                ),
            });
        }
        for extent in entry.record.iter().take_while(|e| e.block_count != 0) {
            blocks += u64::from(extent.block_count);
            extents.push(*extent);
        }
        if blocks >= total {
            break;
        }
    }
    if blocks < total {
        return Err(PfsError::Corruption {
            block: 0,
            detail: format!("fork of file {file_id} maps {blocks} of {total} blocks"),
        });
    }
    debug!(file_id, fork_type, extents = extents.len(), "hfs_fork_overflow");
    Ok(extents)
}

/// An opened HFS+ or HFSX volume.
#[derive(Debug)]
pub struct HfsVolume {
    header: HfsPlusVolumeHeader,
    extents: Option<ExtentsFile>,
    catalog: CatalogTree,
    catalog_meta: TreeMeta,
    catalog_segments: Vec<Segment>,
}

impl HfsVolume {
    pub fn open(src: &dyn BlockSource, options: TreeOptions) -> Result<Self> {
        let region = read_hfsplus_header_region(src)?;
        let header = HfsPlusVolumeHeader::parse(&region)
            .map_err(|err| parse_error("hfs+ volume header", err))?;
        validate_header(&header, src)?;

        let extents = if header.extents_file.logical_size == 0 {
            None
        } else {
            let fork = &header.extents_file;
            if fork.inline_blocks() < u64::from(fork.total_blocks) {
                return Err(PfsError::Corruption {
                    block: 0,
                    detail: "extents file does not fit its inline extents".to_owned(),
                });
            }
            let segments = fork_segments(header.block_size, fork.logical_size, &fork.extents)?;
            let file = ExtentMappedSource::new(src, segments.clone())?;
            let (tree, _) = open_btree(&file, options, |_| ExtentsKind)?;
            Some(ExtentsFile { tree, segments })
        };

        let catalog_extents = fork_extents(
            src,
            extents.as_ref(),
            HFS_CATALOG_FILE_ID,
            HFS_DATA_FORK,
            &header.catalog_file,
        )?;
        let catalog_segments = fork_segments(
            header.block_size,
            header.catalog_file.logical_size,
            &catalog_extents,
        )?;
        let file = ExtentMappedSource::new(src, catalog_segments.clone())?;
        let is_hfsx = header.is_hfsx();
        let (catalog, catalog_meta) = open_btree(&file, options, |record| CatalogKind {
            order: NameOrder::from_header(record, is_hfsx),
        })?;

        info!(
            hfsx = is_hfsx,
            block_size = header.block_size,
            files = header.file_count,
            folders = header.folder_count,
            catalog_depth = catalog_meta.depth,
            "hfsplus_volume_open"
        );
        Ok(Self {
            header,
            extents,
            catalog,
            catalog_meta,
            catalog_segments,
        })
    }

    #[must_use]
    pub fn header(&self) -> &HfsPlusVolumeHeader {
        &self.header
    }

    #[must_use]
    pub fn catalog(&self) -> &CatalogTree {
        &self.catalog
    }

    /// Catalog header-node metadata.
    #[must_use]
    pub fn catalog_meta(&self) -> &TreeMeta {
        &self.catalog_meta
    }

    #[must_use]
    pub fn extents_tree(&self) -> Option<&ExtentsTree> {
        self.extents.as_ref().map(|file| &file.tree)
    }

    #[must_use]
    pub fn name_order(&self) -> NameOrder {
        self.catalog.format().kind().order
    }

    /// The catalog file as a byte stream; every catalog search reads
    /// through it.
    pub fn catalog_file<'a>(&self, src: &'a dyn BlockSource) -> Result<ForkSource<'a>> {
        ExtentMappedSource::new(src, self.catalog_segments.clone())
    }

    /// Folder or file named `name` inside folder `parent_id`.
    pub fn lookup(
        &self,
        src: &dyn BlockSource,
        parent_id: u32,
        name: &str,
    ) -> Result<Option<HfsDirEntry>> {
        let file = self.catalog_file(src)?;
        let key = HfsCatalogKey::new(parent_id, name);
        Ok(self
            .catalog
            .find_first(&file, &key)?
            .filter(|entry| !entry.record.is_thread())
            .map(HfsDirEntry::from_leaf))
    }

    /// Thread record of `cnid`: its parent and its name.
    pub fn thread(&self, src: &dyn BlockSource, cnid: u32) -> Result<Option<HfsCatalogThread>> {
        Ok(self.thread_record(src, cnid)?.map(|(thread, _)| thread))
    }

    /// Thread of `cnid` and whether it belongs to a folder.
    fn thread_record(
        &self,
        src: &dyn BlockSource,
        cnid: u32,
    ) -> Result<Option<(HfsCatalogThread, bool)>> {
        let file = self.catalog_file(src)?;
        let key = HfsCatalogKey {
            parent_id: cnid,
            name: Vec::new(),
        };
        match self.catalog.find_first(&file, &key)?.map(|entry| entry.record) {
            None => Ok(None),
            Some(HfsCatalogRecord::FolderThread(thread)) => Ok(Some((thread, true))),
            Some(HfsCatalogRecord::FileThread(thread)) => Ok(Some((thread, false))),
            Some(_) => Err(PfsError::Corruption {
                block: 0,
                detail: format!("catalog key ({cnid}, \"\") is not a thread record"),
            }),
        }
    }

    /// Folder or file record of `cnid`, found through its thread.
    pub fn record(&self, src: &dyn BlockSource, cnid: u32) -> Result<Option<HfsDirEntry>> {
        let Some(thread) = self.thread(src, cnid)? else {
            return Ok(None);
        };
        let name = String::from_utf16_lossy(&thread.name);
        let entry = self.lookup(src, thread.parent_id, &name)?;
        if let Some(found) = &entry {
            if found.cnid() != cnid {
                return Err(PfsError::Corruption {
                    block: 0,
                    detail: format!("thread of {cnid} names record of {}", found.cnid()),
                });
            }
        }
        Ok(entry)
    }

    /// Children of folder `folder_id` in catalog order. Thread records
    /// share the folder's key prefix and are skipped.
    pub fn list_dir(&self, src: &dyn BlockSource, folder_id: u32) -> Result<Vec<HfsDirEntry>> {
        match self.thread_record(src, folder_id)? {
            None => return Err(PfsError::NotFound(format!("catalog node {folder_id}"))),
            Some((_, false)) => return Err(PfsError::NotDirectory),
            Some((_, true)) => {}
        }
        let file = self.catalog_file(src)?;
        let prefix = HfsCatalogKey {
            parent_id: folder_id,
            name: Vec::new(),
        };
        let mut children = Vec::new();
        for entry in self.catalog.find(&file, &prefix) {
            let entry = entry?;
            if !entry.record.is_thread() {
                children.push(HfsDirEntry::from_leaf(entry));
            }
        }
        debug!(folder_id, children = children.len(), "hfs_list_dir");
        Ok(children)
    }

    /// Walk `path` from the root folder. `/` and the empty path name the
    /// root itself.
    pub fn resolve_path(&self, src: &dyn BlockSource, path: &str) -> Result<HfsDirEntry> {
        let mut current = self
            .record(src, HFS_ROOT_FOLDER_ID)?
            .ok_or_else(|| PfsError::NotFound("hfs+ root folder".to_owned()))?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_folder() {
                return Err(PfsError::NotDirectory);
            }
            current = self
                .lookup(src, current.cnid(), component)?
                .ok_or_else(|| PfsError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    /// The data fork of `file` as a byte stream of its logical size.
    pub fn data_fork<'a>(
        &self,
        src: &'a dyn BlockSource,
        file: &HfsCatalogFile,
    ) -> Result<ForkSource<'a>> {
        let extents = fork_extents(
            src,
            self.extents.as_ref(),
            file.file_id,
            HFS_DATA_FORK,
            &file.data_fork,
        )?;
        let segments = fork_segments(self.header.block_size, file.data_fork.logical_size, &extents)?;
        ExtentMappedSource::new(src, segments)
    }

    /// Read file content at `offset` into `buf`; returns the bytes read,
    /// short at end of file.
    pub fn read_file(
        &self,
        src: &dyn BlockSource,
        file: &HfsCatalogFile,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let fork = self.data_fork(src, file)?;
        let len = fork.len_bytes();
        if offset >= len {
            return Ok(0);
        }
        let take = usize::try_from(len - offset).map_or(buf.len(), |left| left.min(buf.len()));
        fork.read_exact_at(offset, &mut buf[..take])?;
        Ok(take)
    }
}
