//! Incremental, cached evaluation of one identity or an alias group.
//!
//! The cache is keyed by (repository, plugin, normalized identity). A run
//! fetches only the commits after the cached `last_commit_id`, judges them
//! with the cached evaluation as baseline, and replaces the entry.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

use crate::config::EvaluationConfig;
use crate::db::{CacheError, CacheKey, CachedSummary, Db};
use crate::engine::{ExecutionError, Executor, ExecutorSettings};
use crate::judge::{Baseline, Judge};
use crate::locks::KeyedLocks;
use crate::model::{
    ChunkingMetadata, ChunkingStrategy, Commit, CommitsSummary, Evaluation, IdentityGroup,
};
use crate::planner::{ChunkBudget, PlanningError, plan_chunks, validate_commits};
use crate::rubric::{Rubric, RubricRegistry, UnknownRubric};
use crate::source::{CommitSource, RepoRef, SourceError};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("invalid commit input: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("failed to read evaluation cache: {0}")]
    CacheRead(#[source] CacheError),

    #[error("failed to write evaluation cache: {0}")]
    CacheWrite(#[source] CacheError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    UnknownRubric(#[from] UnknownRubric),

    #[error("no author identities given")]
    EmptyIdentitySet,
}

/// Defaults for every run of a service.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationSettings {
    pub strategy: ChunkingStrategy,
    pub max_workers: usize,
    pub budget: ChunkBudget,
    pub call_timeout: Duration,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Sequential,
            max_workers: 3,
            budget: ChunkBudget::default(),
            call_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&EvaluationConfig> for EvaluationSettings {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            strategy: config.strategy(),
            max_workers: config.max_parallel_workers,
            budget: config.budget(),
            call_timeout: config.chunk_timeout(),
        }
    }
}

/// Per-call scheduling choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub strategy: ChunkingStrategy,
    pub max_workers: usize,
}

/// Arguments of [`EvaluationService::evaluate`].
#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub repo: RepoRef,
    /// One identity, or several aliases of the same person.
    pub identities: Vec<String>,
    /// Rubric id; empty selects the default.
    pub plugin: String,
    /// Overrides the configured strategy.
    pub mode: Option<ChunkingStrategy>,
    pub max_workers: Option<usize>,
}

pub struct EvaluationService {
    pub(crate) db: Arc<TokioMutex<Db>>,
    pub(crate) source: Arc<dyn CommitSource>,
    pub(crate) judge: Arc<dyn Judge>,
    pub(crate) registry: Arc<RubricRegistry>,
    pub(crate) settings: EvaluationSettings,
    pub(crate) locks: Arc<KeyedLocks>,
}

impl EvaluationService {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        source: Arc<dyn CommitSource>,
        judge: Arc<dyn Judge>,
        registry: Arc<RubricRegistry>,
        settings: EvaluationSettings,
    ) -> Self {
        Self {
            db,
            source,
            judge,
            registry,
            settings,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RubricRegistry {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> EvaluationSettings {
        self.settings
    }

    /// Resolve per-call overrides against the configured defaults.
    #[must_use]
    pub fn run_options(&self, mode: Option<ChunkingStrategy>, max_workers: Option<usize>) -> RunOptions {
        RunOptions {
            strategy: mode.unwrap_or(self.settings.strategy),
            max_workers: max_workers.filter(|w| *w > 0).unwrap_or(self.settings.max_workers),
        }
    }

    /// Evaluate one identity or an alias group.
    ///
    /// Idempotent while history is unchanged; extends the cached result when
    /// new commits exist.
    pub async fn evaluate(&self, request: &EvaluateRequest) -> Result<Evaluation, EvalError> {
        let group = IdentityGroup::new(&request.identities).ok_or(EvalError::EmptyIdentitySet)?;
        let rubric = self.registry.resolve(&request.plugin)?;
        let run = self.run_options(request.mode, request.max_workers);

        if group.len() == 1 {
            self.evaluate_identity(&request.repo, &group.identities()[0], rubric, run)
                .await
        } else {
            self.evaluate_aliases(&request.repo, &group, rubric, run).await
        }
    }

    /// Cached, incremental evaluation of a single identity.
    pub async fn evaluate_identity(
        &self,
        repo: &RepoRef,
        identity: &str,
        rubric: Arc<dyn Rubric>,
        run: RunOptions,
    ) -> Result<Evaluation, EvalError> {
        let identity = identity.trim();
        let key = CacheKey::for_identity(repo, rubric.id(), identity);
        let _guard = self.locks.lock(&key.to_string()).await;

        let cached = {
            let db = self.db.lock().await;
            db.get_evaluation(&key).map_err(EvalError::CacheRead)?
        };

        let since = cached.as_ref().and_then(|e| e.last_commit_id.clone());
        let new_commits =
            self.source
                .get_commits(repo, &[identity.to_string()], since.as_deref())?;

        if new_commits.is_empty() {
            return Ok(match cached {
                Some(evaluation) => {
                    debug!("{key}: no new commits, returning cached evaluation");
                    evaluation
                }
                None => {
                    info!("{key}: no commits found");
                    Evaluation::empty(identity, rubric.id(), rubric.version(), &rubric.dimension_keys())
                }
            });
        }

        info!(
            "{key}: {} new commit(s){}",
            new_commits.len(),
            if cached.is_some() { ", incremental" } else { "" }
        );

        let evaluation = self
            .judge_commits(identity, &new_commits, rubric, cached.as_ref(), run)
            .await?;

        {
            let mut db = self.db.lock().await;
            db.put_evaluation(&key, &evaluation)
                .map_err(EvalError::CacheWrite)?;
        }

        Ok(evaluation)
    }

    /// Cached entries of `repo`, ordered by identity key then plugin.
    pub async fn cached(&self, repo: &RepoRef) -> Result<Vec<CachedSummary>, EvalError> {
        let db = self.db.lock().await;
        db.list_evaluations(repo).map_err(EvalError::CacheRead)
    }

    /// Drop the cached evaluations of `identities` under `plugin`, plus their
    /// alias-group entry when several are given. Returns how many existed.
    ///
    /// The next evaluation of a forgotten key starts from scratch.
    pub async fn forget(&self, repo: &RepoRef, identities: &[String], plugin: &str) -> Result<usize, EvalError> {
        let group = IdentityGroup::new(identities).ok_or(EvalError::EmptyIdentitySet)?;
        let rubric = self.registry.resolve(plugin)?;

        let mut keys: Vec<CacheKey> = group
            .identities()
            .iter()
            .map(|identity| CacheKey::for_identity(repo, rubric.id(), identity))
            .collect();
        if group.len() > 1 {
            keys.push(CacheKey::for_group(repo, rubric.id(), &group.key()));
        }

        let mut removed = 0;
        for key in keys {
            let _guard = self.locks.lock(&key.to_string()).await;
            let db = self.db.lock().await;
            if db.delete_evaluation(&key).map_err(EvalError::CacheWrite)? {
                info!("{key}: removed from cache");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Judge `commits` on top of an optional previous evaluation.
    ///
    /// Does not touch the cache. Totals and the summary accumulate over
    /// `previous`; commits of failed chunks still count as evaluated.
    pub async fn judge_commits(
        &self,
        identity: &str,
        commits: &[Commit],
        rubric: Arc<dyn Rubric>,
        previous: Option<&Evaluation>,
        run: RunOptions,
    ) -> Result<Evaluation, EvalError> {
        validate_commits(commits)?;

        let reuse_size = previous.and_then(|p| p.chunking.chunk_size);
        let chunk_size = reuse_size
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.budget.max_commits);
        let chunks = plan_chunks(commits, self.settings.budget, reuse_size);
        let chunk_count = chunks.len();

        let baseline = previous.map(|p| Baseline {
            scores: p.scores.clone(),
            reasoning: p.reasoning.clone(),
            commits_evaluated: p.total_commits_evaluated,
        });

        let executor = Executor::new(
            Arc::clone(&self.judge),
            Arc::clone(&rubric),
            ExecutorSettings {
                strategy: run.strategy,
                max_workers: run.max_workers,
                call_timeout: self.settings.call_timeout,
            },
        );
        let outcome = executor.run(identity, chunks, baseline).await?;

        let summary = CommitsSummary::from_commits(commits);
        let commits_summary = match previous {
            Some(p) => p.commits_summary.combine(&summary),
            None => summary,
        };

        Ok(Evaluation {
            identity: identity.to_string(),
            scores: outcome.merged.verdict.scores,
            reasoning: outcome.merged.verdict.reasoning,
            commits_summary,
            last_commit_id: commits.last().map(|c| c.id.clone()),
            total_commits_evaluated: previous.map_or(0, |p| p.total_commits_evaluated) + commits.len(),
            new_commits_count: commits.len(),
            incremental: previous.is_some(),
            evaluated_at: Utc::now(),
            plugin_id: rubric.id().to_string(),
            plugin_version: rubric.version().to_string(),
            chunking: ChunkingMetadata {
                chunked: chunk_count > 1,
                chunks_processed: outcome.chunks_processed,
                chunks_failed: outcome.failures.len(),
                strategy: Some(outcome.strategy),
                merge_path: Some(outcome.merged.path),
                chunk_size: Some(chunk_size),
            },
            merged_from: Vec::new(),
            reasoning_source: None,
        })
    }
}
