//! Core type definitions for caseio
//!
//! This module defines the identifiers and layout descriptions shared by
//! the communication and storage layers.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

/// Instance label holding mesh and physical constants
pub const CONSTANT_INSTANCE: &str = "constant";

/// Instance label holding run-control configuration
pub const SYSTEM_INSTANCE: &str = "system";

/// Identifier of one participant in a distributed run
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct Rank(u32);

impl Rank {
    /// The conventional master rank
    pub const MASTER: Self = Self(0);

    /// Create a rank from its numeric id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric id
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Numeric id as an index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({})", self.0)
    }
}

/// A time directory: numeric value plus the text form used on disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeInstant {
    /// Numeric time value
    pub value: f64,
    /// Directory name as written on disk
    pub name: String,
}

impl TimeInstant {
    /// Create an instant from an explicit value and name
    #[must_use]
    pub fn new(value: f64, name: impl Into<String>) -> Self {
        Self {
            value,
            name: name.into(),
        }
    }

    /// Parse a directory name as a time instant
    ///
    /// Returns `None` for names that are not finite numbers.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let value: f64 = name.trim().parse().ok()?;
        value.is_finite().then(|| Self::new(value, name))
    }

    /// Compare values under a relative tolerance
    #[must_use]
    pub fn matches(&self, value: f64, tolerance: f64) -> bool {
        relative_eq(self.value, value, tolerance)
    }
}

impl PartialOrd for TimeInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

/// `|a - b| <= tolerance * max(|a|, |b|)`, with exact equality always accepted
#[must_use]
pub fn relative_eq(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= tolerance * a.abs().max(b.abs())
}

/// Sort instants by value and drop duplicate names
pub fn sort_instants(instants: &mut Vec<TimeInstant>) {
    instants.sort_by(|a, b| a.value.total_cmp(&b.value).then_with(|| a.name.cmp(&b.name)));
    instants.dedup_by(|a, b| a.name == b.name);
}

/// On-disk description of a case
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseLayout {
    /// Case root directory
    pub root: PathBuf,
    /// Whether objects live in per-rank or per-group subdirectories
    pub decomposed: bool,
    /// Total number of ranks in the run
    pub rank_count: u32,
    /// Known time instants, ascending
    pub instants: Vec<TimeInstant>,
}

impl CaseLayout {
    /// Layout where every object lives directly under its instance
    #[must_use]
    pub fn undecomposed(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            decomposed: false,
            rank_count: 1,
            instants: Vec::new(),
        }
    }

    /// Layout split into per-rank or per-group directories
    #[must_use]
    pub fn decomposed(root: impl Into<PathBuf>, rank_count: u32) -> Self {
        Self {
            root: root.into(),
            decomposed: true,
            rank_count,
            instants: Vec::new(),
        }
    }

    /// Attach known time instants; names that do not parse are skipped
    #[must_use]
    pub fn with_instants<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.instants = names
            .into_iter()
            .filter_map(|name| TimeInstant::parse(name.as_ref()))
            .collect();
        sort_instants(&mut self.instants);
        self
    }

    /// Same case seen without decomposition
    #[must_use]
    pub fn as_undecomposed(&self) -> Self {
        Self {
            decomposed: false,
            ..self.clone()
        }
    }

    /// Directory of an instance label
    #[must_use]
    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
}

/// Decomposition-independent address of a stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    /// Time or fixed label (`constant`, `system`), or an absolute directory
    pub instance: String,
    /// Region subdirectory, empty for the default region
    pub region: String,
    /// Local subpath below the region, may be empty
    pub local: String,
    /// Object file name
    pub name: String,
}

impl ObjectIdentity {
    /// Object in the default region
    #[must_use]
    pub fn new(instance: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            region: String::new(),
            local: String::new(),
            name: name.into(),
        }
    }

    /// Set the region subdirectory
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the local subpath
    #[must_use]
    pub fn with_local(mut self, local: impl Into<String>) -> Self {
        self.local = local.into();
        self
    }

    /// Same object at another instance
    #[must_use]
    pub fn at_instance(&self, instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            ..self.clone()
        }
    }

    /// True when the instance is an absolute directory
    #[must_use]
    pub fn has_absolute_instance(&self) -> bool {
        Path::new(&self.instance).is_absolute()
    }

    /// True for the instances a decomposed case may share with its root
    #[must_use]
    pub fn is_shared_instance(&self) -> bool {
        self.instance == CONSTANT_INSTANCE || self.instance == SYSTEM_INSTANCE
    }

    /// `region/local` with empty components skipped
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::new();
        for part in [&self.region, &self.local] {
            if !part.is_empty() {
                dir.push(part);
            }
        }
        dir
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = Path::new(&self.instance)
            .join(self.relative_dir())
            .join(&self.name);
        write!(f, "{}", path.display())
    }
}

/// Position of one rank within a communication tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankInfo {
    /// This rank
    pub rank: Rank,
    /// Total number of ranks
    pub rank_count: u32,
    /// Rank to receive from, `None` at the root
    pub parent: Option<Rank>,
    /// Ranks to forward to, in send order
    pub children: Vec<Rank>,
}

impl RankInfo {
    /// True for the root of the tree
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True when no rank receives from this one
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A decomposed directory and the contiguous rank range it holds
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecomposedDirectoryGroup {
    /// Directory name on disk
    pub name: String,
    /// First rank held
    pub group_start: Rank,
    /// Number of ranks held; 1 for a single-rank directory
    pub group_size: u32,
    /// Total rank count encoded in the name, if any
    pub total: Option<u32>,
}

impl DecomposedDirectoryGroup {
    /// True when the directory belongs to exactly one rank
    #[must_use]
    pub fn is_per_rank(&self) -> bool {
        self.group_size == 1 && self.total.is_none()
    }

    /// Whether `rank` falls in this group
    #[must_use]
    pub fn contains(&self, rank: Rank) -> bool {
        self.slot(rank).is_some()
    }

    /// Local slot of `rank` inside the group
    #[must_use]
    pub fn slot(&self, rank: Rank) -> Option<u32> {
        rank.get()
            .checked_sub(self.group_start.get())
            .filter(|slot| *slot < self.group_size)
    }

    /// Last rank held
    #[must_use]
    pub fn last(&self) -> Rank {
        Rank::new(self.group_start.get() + self.group_size.saturating_sub(1))
    }
}
