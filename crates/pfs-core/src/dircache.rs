//! Shared cache of full directory listings.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use pfs_error::Result;
use tracing::trace;

use crate::vfs::DirEntry;

/// Listings kept per context. Past this the cache serves listings
/// uncached.
pub(crate) const DIR_CACHE_CAPACITY: usize = 1024;

/// Maps a directory to its complete listing.
///
/// Images are immutable, so entries never go stale. Concurrent readers
/// that miss on the same directory may both load it; the first insert wins.
#[derive(Debug)]
pub(crate) struct DirCache<K> {
    listings: RwLock<HashMap<K, Arc<[DirEntry]>>>,
    capacity: usize,
}

impl<K: Copy + Eq + Hash + Debug> DirCache<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            listings: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Listing of `dir`, running `load` on a miss.
    pub(crate) fn get_or_load(
        &self,
        dir: K,
        load: impl FnOnce() -> Result<Vec<DirEntry>>,
    ) -> Result<Arc<[DirEntry]>> {
        if let Some(hit) = self.listings.read().get(&dir) {
            trace!(?dir, "dir_cache_hit");
            return Ok(Arc::clone(hit));
        }
        let loaded: Arc<[DirEntry]> = load()?.into();
        let mut listings = self.listings.write();
        if let Some(existing) = listings.get(&dir) {
            return Ok(Arc::clone(existing));
        }
        if listings.len() < self.capacity {
            listings.insert(dir, Arc::clone(&loaded));
        }
        Ok(loaded)
    }

    pub(crate) fn len(&self) -> usize {
        self.listings.read().len()
    }
}
