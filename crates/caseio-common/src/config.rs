//! Configuration types for caseio
//!
//! Every section defaults independently, so a partial TOML file only
//! overrides what it names.

use crate::error::{Error, Result};
use crate::types::Rank;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration for caseio
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage strategy selection
    pub io: IoConfig,
    /// Collective communication tuning
    pub comm: CommConfig,
    /// Path resolution behaviour
    pub resolver: ResolverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.comm.fanout == 0 {
            return Err(Error::configuration("comm.fanout must be at least 1"));
        }
        if !self.resolver.time_tolerance.is_finite() || self.resolver.time_tolerance < 0.0 {
            return Err(Error::configuration(
                "resolver.time_tolerance must be a finite non-negative number",
            ));
        }
        Ok(())
    }
}

/// How objects are laid out and who touches the filesystem
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoStrategy {
    /// One `processor<N>` directory per rank
    #[default]
    PerRank,
    /// A single undecomposed copy read by the master
    MasterShared,
    /// `processors<N>(a-b)` block containers shared by rank groups
    Grouped,
}

impl IoStrategy {
    /// Name used in configuration files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerRank => "per-rank",
            Self::MasterShared => "master-shared",
            Self::Grouped => "grouped",
        }
    }
}

impl std::str::FromStr for IoStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "per-rank" => Ok(Self::PerRank),
            "master-shared" => Ok(Self::MasterShared),
            "grouped" => Ok(Self::Grouped),
            other => Err(Error::configuration(format!("unknown io strategy: {other}"))),
        }
    }
}

/// Storage strategy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Strategy chosen when the case is opened
    pub strategy: IoStrategy,
    /// Rank performing master-only I/O
    pub master_rank: u32,
    /// Ranks per block container; 0 puts every rank in one container
    pub group_size: u32,
}

impl IoConfig {
    /// Master rank as a typed id
    #[must_use]
    pub const fn master(&self) -> Rank {
        Rank::new(self.master_rank)
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            strategy: IoStrategy::default(),
            master_rank: 0,
            group_size: 0,
        }
    }
}

/// Collective communication configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Rank counts below this use a linear chain
    pub tree_threshold: u32,
    /// Children per node in the tree schedule
    pub fanout: u32,
    /// Receive timeout; unset blocks indefinitely
    pub recv_timeout_ms: Option<u64>,
}

impl CommConfig {
    /// Receive timeout as a duration
    #[must_use]
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            tree_threshold: 16,
            fanout: 2,
            recv_timeout_ms: None,
        }
    }
}

/// Path resolution configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Look for `constant`/`system` objects under the undecomposed root
    pub check_global_fallback: bool,
    /// Search for a numerically close time directory on a miss
    pub fuzzy_time: bool,
    /// Relative tolerance of the close-time search
    pub time_tolerance: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            check_global_fallback: true,
            fuzzy_time: true,
            time_tolerance: 1e-6,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
