//! Drives judge calls over a chunk plan.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::merge::{Merged, ProgressiveMerge, merge_parallel, successes_in_order};
use super::{ChunkFailure, ChunkOutcome, ChunkResult, ExecutionError};
use crate::judge::{Baseline, Judge, ScoreRequest, call_blocking};
use crate::model::{ChunkingStrategy, CommitsSummary};
use crate::planner::Chunk;
use crate::rubric::Rubric;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub strategy: ChunkingStrategy,
    pub max_workers: usize,
    /// Limit for each judge call; a timeout is a chunk failure.
    pub call_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Sequential,
            max_workers: 3,
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// Merged verdict of a run plus what happened to each chunk.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub merged: Merged,
    pub strategy: ChunkingStrategy,
    pub chunks_processed: usize,
    pub failures: Vec<ChunkFailure>,
}

pub struct Executor {
    judge: Arc<dyn Judge>,
    rubric: Arc<dyn Rubric>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(judge: Arc<dyn Judge>, rubric: Arc<dyn Rubric>, settings: ExecutorSettings) -> Self {
        Self {
            judge,
            rubric,
            settings,
        }
    }

    /// Judge every chunk and merge the results.
    ///
    /// Fails only when no chunk succeeds.
    pub async fn run(
        &self,
        identity: &str,
        chunks: Vec<Chunk>,
        baseline: Option<Baseline>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let total = chunks.len();
        info!(
            "Evaluating {identity}: {total} chunk(s), {:?} mode",
            self.settings.strategy
        );

        let (merged, failures) = match self.settings.strategy {
            ChunkingStrategy::Sequential => self.run_sequential(identity, chunks, baseline).await,
            ChunkingStrategy::Parallel => self.run_parallel(identity, chunks, baseline).await,
        };

        match merged {
            Some(merged) => {
                if !failures.is_empty() {
                    warn!("{identity}: {} of {total} chunks failed", failures.len());
                }
                Ok(ExecutionOutcome {
                    merged,
                    strategy: self.settings.strategy,
                    chunks_processed: total,
                    failures,
                })
            }
            None => Err(ExecutionError::all_failed(&failures)),
        }
    }

    async fn run_sequential(
        &self,
        identity: &str,
        chunks: Vec<Chunk>,
        baseline: Option<Baseline>,
    ) -> (Option<Merged>, Vec<ChunkFailure>) {
        let mut progressive = ProgressiveMerge::new(baseline);
        let mut failures = Vec::new();

        for chunk in chunks {
            let outcome = score_chunk(
                Arc::clone(&self.judge),
                Arc::clone(&self.rubric),
                identity.to_string(),
                chunk,
                progressive.context(),
                self.settings.call_timeout,
            )
            .await;
            match outcome {
                Ok(result) => progressive.absorb(&result),
                Err(failure) => failures.push(failure),
            }
        }

        (progressive.finish(), failures)
    }

    async fn run_parallel(
        &self,
        identity: &str,
        chunks: Vec<Chunk>,
        baseline: Option<Baseline>,
    ) -> (Option<Merged>, Vec<ChunkFailure>) {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            // Later chunks are judged without history
            let context = if chunk.index == 0 { baseline.clone() } else { None };
            let index = chunk.index;
            let label = chunk.label();
            let semaphore = Arc::clone(&semaphore);
            let judge = Arc::clone(&self.judge);
            let rubric = Arc::clone(&self.rubric);
            let identity = identity.to_string();
            let limit = self.settings.call_timeout;

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Err(ChunkFailure {
                            chunk_index: chunk.index,
                            chunk_label: chunk.label(),
                            error: format!("worker pool closed: {e}"),
                        });
                    }
                };
                score_chunk(judge, rubric, identity, chunk, context, limit).await
            });
            handles.push((index, label, handle));
        }

        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(handles.len());
        for (index, label, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(ChunkFailure {
                    chunk_index: index,
                    chunk_label: label,
                    error: format!("worker task failed: {e}"),
                })
            });
            outcomes.push(outcome);
        }

        let successes = successes_in_order(&outcomes);
        let mut failures: Vec<ChunkFailure> = outcomes.into_iter().filter_map(Result::err).collect();
        failures.sort_by_key(|f| f.chunk_index);

        let merged = merge_parallel(
            Arc::clone(&self.judge),
            Arc::clone(&self.rubric),
            identity,
            &successes,
            baseline,
            self.settings.call_timeout,
        )
        .await;

        (merged, failures)
    }
}

/// Score one chunk, turning every error into a [`ChunkFailure`].
async fn score_chunk(
    judge: Arc<dyn Judge>,
    rubric: Arc<dyn Rubric>,
    identity: String,
    chunk: Chunk,
    context: Option<Baseline>,
    limit: Duration,
) -> ChunkOutcome {
    let label = chunk.label();
    let request = ScoreRequest {
        identity,
        chunk_label: label.clone(),
        commits_text: chunk.text,
        commit_count: chunk.commits.len(),
        baseline: context,
    };
    let commits_summary = CommitsSummary::from_commits(&chunk.commits);
    let commit_count = chunk.commits.len();

    debug!("Scoring chunk {label} ({commit_count} commits)");
    let call_rubric = Arc::clone(&rubric);
    let verdict = call_blocking(limit, move || {
        judge
            .score(call_rubric.as_ref(), &request)
            .and_then(|v| call_rubric.validate(v))
    })
    .await;

    match verdict {
        Ok(verdict) => Ok(ChunkResult {
            chunk_index: chunk.index,
            chunk_label: label,
            commit_count,
            scores: verdict.scores,
            reasoning: verdict.reasoning,
            commits_summary,
        }),
        Err(e) => {
            warn!("Chunk {label} failed: {e}");
            Err(ChunkFailure {
                chunk_index: chunk.index,
                chunk_label: label,
                error: e.to_string(),
            })
        }
    }
}
