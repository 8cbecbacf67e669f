//! Growth trajectories: time-bucketed checkpoints for an identity group.
//!
//! A trajectory belongs to one identity group under one rubric and may span
//! several repositories, whose commits are merged chronologically. Commits are
//! bucketed into fixed-length periods from the start date. Periods accumulate
//! until enough commits exist, then one checkpoint is evaluated against the
//! previous one. Checkpoints are append-only.
pub mod accumulator;
pub mod service;
pub mod store;

pub use accumulator::{AccumulationState, PeriodClock, growth_comparison};
pub use service::{CheckpointStatus, TrajectoryService, TrajectorySettings};
pub use store::TrajectoryStore;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluator::EvalError;
use crate::model::{Evaluation, IdentityGroup};
use crate::rubric::UnknownRubric;
use crate::source::{RepoRef, SourceError};

#[derive(Error, Debug)]
pub enum TrajectoryError {
    #[error("trajectory file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt trajectory file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    UnknownRubric(#[from] UnknownRubric),

    #[error("accumulated commits no longer in history: {0}")]
    MissingCommits(String),

    #[error("no repositories tracked for {0}")]
    NoRepositories(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDelta {
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
    pub trend: Trend,
}

/// Change relative to the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthComparison {
    pub previous_checkpoint_id: u32,
    pub dimensions: BTreeMap<String, DimensionDelta>,
    pub mean_delta: f64,
    pub overall_trend: Trend,
}

/// Commits covered by one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitsRange {
    pub start_sha: String,
    pub end_sha: String,
    pub commit_count: usize,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub accumulated_from_periods: u32,
}

/// An immutable evaluation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: u32,
    pub created_at: DateTime<Utc>,
    pub commits_range: CommitsRange,
    pub evaluation: Evaluation,
    pub previous_checkpoint_id: Option<u32>,
    pub growth_comparison: Option<GrowthComparison>,
    #[serde(default)]
    pub aliases_used: Vec<String>,
}

/// Persisted trajectory of one identity group under one rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryCache {
    pub identity_group: Vec<String>,
    pub plugin_id: String,
    pub repo_urls: Vec<String>,
    /// Last observed commit per tracked repository url.
    #[serde(default)]
    pub synced_shas: BTreeMap<String, String>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub accumulation_state: AccumulationState,
    pub last_synced_sha: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_checkpoints: usize,
}

impl TrajectoryCache {
    #[must_use]
    pub fn new(group: &IdentityGroup, plugin_id: &str) -> Self {
        Self {
            identity_group: group.identities().to_vec(),
            plugin_id: plugin_id.to_string(),
            repo_urls: Vec::new(),
            synced_shas: BTreeMap::new(),
            checkpoints: Vec::new(),
            accumulation_state: AccumulationState::default(),
            last_synced_sha: None,
            last_synced_at: None,
            total_checkpoints: 0,
        }
    }

    /// Start tracking `repos`; already tracked ones are kept in place.
    pub fn track(&mut self, repos: &[RepoRef]) {
        for url in repos.iter().map(RepoRef::url) {
            if !self.repo_urls.contains(&url) {
                self.repo_urls.push(url);
            }
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Id the next checkpoint will get.
    #[must_use]
    pub fn next_checkpoint_id(&self) -> u32 {
        self.latest().map_or(1, |c| c.checkpoint_id + 1)
    }

    /// Append a checkpoint. Existing checkpoints are never touched.
    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
        self.total_checkpoints = self.checkpoints.len();
    }
}
