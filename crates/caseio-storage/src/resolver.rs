//! Path resolution over a possibly decomposed case
//!
//! Candidate locations for an object, tried in order until one exists:
//! 1. an absolute instance: `instance/name`
//! 2. the rank-local path (`processor<rank>` when decomposed; its
//!    existence is checked against the cached instance listing first)
//! 3. `constant`/`system` objects under the undecomposed root
//! 4. any group directory covering this rank, in listing order
//! 5. the closest known time directory when the instance is missing
//!
//! A miss is `None`, never an error.

use crate::dir_cache::DirectoryCache;
use crate::processor::processor_dir_name;
use crate::time_index::TimeIndex;
use caseio_common::config::ResolverConfig;
use caseio_common::{
    CaseLayout, DecomposedDirectoryGroup, ObjectIdentity, Rank, Result, TimeInstant,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a resolved path must be
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryKind {
    #[default]
    File,
    Dir,
}

impl EntryKind {
    fn matches(self, path: &Path) -> bool {
        match self {
            Self::File => path.is_file(),
            Self::Dir => path.is_dir(),
        }
    }
}

/// Options of a single lookup
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolveOptions {
    pub check_global_fallback: bool,
    pub kind: EntryKind,
    pub fuzzy_time: bool,
    pub time_tolerance: f64,
}

impl ResolveOptions {
    /// File lookup with every fallback enabled
    #[must_use]
    pub fn file() -> Self {
        Self::from_config(&ResolverConfig::default())
    }

    /// File lookup configured from the resolver section
    #[must_use]
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            check_global_fallback: config.check_global_fallback,
            kind: EntryKind::File,
            fuzzy_time: config.fuzzy_time,
            time_tolerance: config.time_tolerance,
        }
    }

    /// Same options, looking for a directory
    #[must_use]
    pub fn dir(self) -> Self {
        Self {
            kind: EntryKind::Dir,
            ..self
        }
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self::file()
    }
}

/// Files found in a resolved directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectListing {
    /// Directory that was listed
    pub path: PathBuf,
    /// Instance label actually used; differs from the request after a close-time match
    pub instance: String,
    /// Regular file names, sorted
    pub names: Vec<String>,
}

/// Resolves object identities to paths for one rank
#[derive(Debug)]
pub struct PathResolver {
    layout: CaseLayout,
    rank: Rank,
    dir_cache: Arc<DirectoryCache>,
    times: TimeIndex,
}

impl PathResolver {
    /// Resolver for `rank` with a fresh directory cache
    pub fn new(layout: CaseLayout, rank: Rank) -> Self {
        Self::with_directory_cache(layout, rank, Arc::new(DirectoryCache::new()))
    }

    /// Resolver sharing an existing directory cache
    pub fn with_directory_cache(
        layout: CaseLayout,
        rank: Rank,
        dir_cache: Arc<DirectoryCache>,
    ) -> Self {
        let times = TimeIndex::new(layout.root.clone(), &layout.instants);
        Self {
            layout,
            rank,
            dir_cache,
            times,
        }
    }

    pub fn layout(&self) -> &CaseLayout {
        &self.layout
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn directory_cache(&self) -> &Arc<DirectoryCache> {
        &self.dir_cache
    }

    pub fn time_index(&self) -> &TimeIndex {
        &self.times
    }

    /// Locate an existing object
    pub fn resolve(&self, id: &ObjectIdentity, opts: &ResolveOptions) -> Option<PathBuf> {
        self.resolve_with_instance(id, opts).map(|(path, _)| path)
    }

    /// Rank-local path an object would be written to
    #[must_use]
    pub fn object_path(&self, id: &ObjectIdentity) -> PathBuf {
        let mut dir = self.layout.instance_dir(&id.instance);
        if self.layout.decomposed {
            dir.push(processor_dir_name(self.rank));
        }
        compose(dir, id)
    }

    /// Undecomposed path of an object
    #[must_use]
    pub fn global_object_path(&self, id: &ObjectIdentity) -> PathBuf {
        compose(self.layout.instance_dir(&id.instance), id)
    }

    /// Path of an object inside a group directory
    #[must_use]
    pub fn group_object_path(
        &self,
        id: &ObjectIdentity,
        group: &DecomposedDirectoryGroup,
    ) -> PathBuf {
        compose(self.layout.instance_dir(&id.instance).join(&group.name), id)
    }

    /// Known time instant closest to `label`
    pub fn find_instance(&self, label: &str, tolerance: f64) -> Result<Option<TimeInstant>> {
        self.times.find_instance(label, tolerance)
    }

    /// Regular files in the directory `dir_id` resolves to
    pub fn list_objects(
        &self,
        dir_id: &ObjectIdentity,
        opts: &ResolveOptions,
    ) -> Result<Option<ObjectListing>> {
        let Some((path, instance)) = self.resolve_with_instance(dir_id, &opts.dir()) else {
            return Ok(None);
        };

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(Some(ObjectListing {
            path,
            instance,
            names,
        }))
    }

    fn resolve_with_instance(
        &self,
        id: &ObjectIdentity,
        opts: &ResolveOptions,
    ) -> Option<(PathBuf, String)> {
        if id.has_absolute_instance() {
            let path = compose_name(PathBuf::from(&id.instance), &id.name);
            return opts
                .kind
                .matches(&path)
                .then(|| (path, id.instance.clone()));
        }

        if let Some(path) = self.resolve_local(id, opts) {
            debug!(rank = %self.rank, object = %id, path = %path.display(), "Resolved");
            return Some((path, id.instance.clone()));
        }

        if !opts.fuzzy_time || self.layout.instance_dir(&id.instance).is_dir() {
            return None;
        }

        let matched = match self.times.find_instance(&id.instance, opts.time_tolerance) {
            Ok(matched) => matched?,
            Err(e) => {
                warn!(rank = %self.rank, instance = %id.instance, error = %e, "Time lookup failed");
                return None;
            }
        };
        if matched.name == id.instance {
            return None;
        }

        let retry = id.at_instance(&matched.name);
        let path = self.resolve_local(&retry, opts)?;
        debug!(
            rank = %self.rank,
            requested = %id.instance,
            matched = %matched.name,
            path = %path.display(),
            "Resolved through close time"
        );
        Some((path, matched.name))
    }

    /// Steps 2 to 4
    fn resolve_local(&self, id: &ObjectIdentity, opts: &ResolveOptions) -> Option<PathBuf> {
        if !self.layout.decomposed {
            let path = self.global_object_path(id);
            return opts.kind.matches(&path).then_some(path);
        }

        let instance_dir = self.layout.instance_dir(&id.instance);
        let listing = match self.dir_cache.get(&instance_dir) {
            Ok(listing) => Some(listing),
            Err(e) => {
                warn!(rank = %self.rank, path = %instance_dir.display(), error = %e, "Directory listing failed");
                None
            }
        };

        let own_dir = processor_dir_name(self.rank);
        if listing.as_ref().is_some_and(|l| l.contains_name(&own_dir)) {
            let path = self.object_path(id);
            if opts.kind.matches(&path) {
                return Some(path);
            }
        }

        if opts.check_global_fallback && id.is_shared_instance() {
            let path = self.global_object_path(id);
            if opts.kind.matches(&path) {
                return Some(path);
            }
        }

        listing?
            .covering(self.rank)
            .filter(|group| group.name != own_dir)
            .map(|group| self.group_object_path(id, group))
            .find(|path| opts.kind.matches(path))
    }
}

fn compose(dir: PathBuf, id: &ObjectIdentity) -> PathBuf {
    compose_name(dir.join(id.relative_dir()), &id.name)
}

fn compose_name(mut dir: PathBuf, name: &str) -> PathBuf {
    if !name.is_empty() {
        dir.push(name);
    }
    dir
}
