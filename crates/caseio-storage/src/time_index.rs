//! Known time instants of a case
//!
//! Seeded from the case layout or, when the layout lists none, by
//! scanning the case root for numerically named directories on first use.
//! Like the directory cache, the list only changes through `clear`.

use caseio_common::{Result, TimeInstant, sort_instants};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Lazily populated, ascending list of time instants
#[derive(Debug)]
pub struct TimeIndex {
    root: PathBuf,
    cached: RwLock<Option<Arc<[TimeInstant]>>>,
    generation: AtomicU64,
}

impl TimeIndex {
    /// Index for the case at `root`; a non-empty `seed` skips the scan
    pub fn new(root: impl Into<PathBuf>, seed: &[TimeInstant]) -> Self {
        let cached = if seed.is_empty() {
            None
        } else {
            let mut seed = seed.to_vec();
            sort_instants(&mut seed);
            Some(seed.into())
        };
        Self {
            root: root.into(),
            cached: RwLock::new(cached),
            generation: AtomicU64::new(0),
        }
    }

    /// Case root this index scans
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Instants in ascending order
    pub fn instants(&self) -> Result<Arc<[TimeInstant]>> {
        if let Some(instants) = self.cached.read().as_ref() {
            return Ok(Arc::clone(instants));
        }

        let instants: Arc<[TimeInstant]> = scan_instants(&self.root)?.into();
        debug!(root = %self.root.display(), count = instants.len(), "Scanned time directories");
        let mut cached = self.cached.write();
        Ok(Arc::clone(cached.get_or_insert(instants)))
    }

    /// Instant closest to `value`, if it lies within `tolerance`
    pub fn find_closest(&self, value: f64, tolerance: f64) -> Result<Option<TimeInstant>> {
        let instants = self.instants()?;
        let closest = instants
            .iter()
            .min_by(|a, b| (a.value - value).abs().total_cmp(&(b.value - value).abs()));
        Ok(closest.filter(|t| t.matches(value, tolerance)).cloned())
    }

    /// Close match for an instance label; `None` for non-numeric labels
    pub fn find_instance(&self, label: &str, tolerance: f64) -> Result<Option<TimeInstant>> {
        match TimeInstant::parse(label) {
            Some(target) => self.find_closest(target.value, tolerance),
            None => Ok(None),
        }
    }

    /// Forget the list; the next query rescans the root
    pub fn clear(&self) {
        *self.cached.write() = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Bumped by every `clear`
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

fn scan_instants(root: &Path) -> Result<Vec<TimeInstant>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut instants = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(instant) = entry.file_name().to_str().and_then(TimeInstant::parse) {
            instants.push(instant);
        }
    }
    sort_instants(&mut instants);
    Ok(instants)
}
