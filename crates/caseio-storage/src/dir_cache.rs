//! Per-rank cache of decomposed directory listings
//!
//! Listing an instance directory on every lookup is the metadata storm
//! this cache exists to avoid. A listing is read once per path and kept
//! until `clear` or `clear_all` is called; nothing expires on its own.

use crate::processor::parse_group_dir;
use caseio_common::{DecomposedDirectoryGroup, Error, Rank, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Decomposed directories found under one path
#[derive(Clone, Debug)]
pub struct CachedDirectoryListing {
    /// Groups sorted by first rank, then size, then name
    pub entries: Arc<[DecomposedDirectoryGroup]>,
    /// Cache generation the listing was read in
    pub generation: u64,
}

impl CachedDirectoryListing {
    /// Groups whose rank range holds `rank`
    pub fn covering(&self, rank: Rank) -> impl Iterator<Item = &DecomposedDirectoryGroup> {
        self.entries.iter().filter(move |group| group.contains(rank))
    }

    /// Whether a directory with this exact name was listed
    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.iter().any(|group| group.name == name)
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct DirectoryCacheStats {
    /// Lookups answered from memory
    pub hits: AtomicU64,
    /// Lookups that listed the directory
    pub misses: AtomicU64,
    /// Listings dropped by `clear`/`clear_all`
    pub invalidations: AtomicU64,
}

impl DirectoryCacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Directory listing cache
#[derive(Debug, Default)]
pub struct DirectoryCache {
    listings: RwLock<HashMap<PathBuf, CachedDirectoryListing>>,
    generation: AtomicU64,
    stats: DirectoryCacheStats,
}

impl DirectoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decomposed directories under `path`, listing it on first use
    ///
    /// A missing directory is cached as an empty listing.
    pub fn get(&self, path: &Path) -> Result<CachedDirectoryListing> {
        if let Some(listing) = self.listings.read().get(path) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(listing.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Acquire);
        let entries = scan_groups(path)?;
        debug!(path = %path.display(), groups = entries.len(), "Listed decomposed directories");

        let listing = CachedDirectoryListing {
            entries: entries.into(),
            generation,
        };
        // A concurrent `get` may have filled the slot first; keep whichever landed
        let mut listings = self.listings.write();
        Ok(listings
            .entry(path.to_path_buf())
            .or_insert(listing)
            .clone())
    }

    /// Cached listing for `path` without touching the filesystem
    #[must_use]
    pub fn peek(&self, path: &Path) -> Option<CachedDirectoryListing> {
        self.listings.read().get(path).cloned()
    }

    /// Drop the listing for `path`
    pub fn clear(&self, path: &Path) {
        if self.listings.write().remove(path).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop every listing
    pub fn clear_all(&self) {
        let mut listings = self.listings.write();
        self.stats
            .invalidations
            .fetch_add(listings.len() as u64, Ordering::Relaxed);
        listings.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Current generation; bumped by every invalidation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of cached listings
    pub fn len(&self) -> usize {
        self.listings.read().len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.listings.read().is_empty()
    }

    /// Cache statistics
    pub fn stats(&self) -> &DirectoryCacheStats {
        &self.stats
    }
}

fn scan_groups(path: &Path) -> Result<Vec<DecomposedDirectoryGroup>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => return Ok(Vec::new()),
        Err(e) => return Err(Error::open_failure(path, e)),
    };

    let mut groups = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(group) = entry.file_name().to_str().and_then(parse_group_dir) {
            groups.push(group);
        }
    }
    groups.sort_by(|a, b| {
        a.group_start
            .cmp(&b.group_start)
            .then(a.group_size.cmp(&b.group_size))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(groups)
}
