/// Judge trait and shared request/response types.
///
/// A judge turns rendered commit text into rubric scores plus reasoning. The
/// trait is synchronous; the pipeline drives it from async code through
/// [`call_blocking`], which enforces the per-call timeout.
pub mod mock;
pub mod openrouter;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Scores;
use crate::rubric::Rubric;

/// Errors that can occur during a judge call.
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("judge request failed: {0}")]
    Request(String),

    #[error("judge returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid judge response: {0}")]
    InvalidResponse(String),

    #[error("judge call timed out after {0}s")]
    Timeout(u64),

    #[error("judge not configured: {0}")]
    NotConfigured(String),

    #[error("judge task aborted: {0}")]
    Aborted(String),
}

/// Scores and reasoning returned by a judge call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub scores: Scores,
    pub reasoning: String,
}

/// Prior scores handed to the judge as read-only context.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub scores: Scores,
    pub reasoning: String,
    pub commits_evaluated: usize,
}

/// Score one chunk of commits.
#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub identity: String,
    /// `i/N` position of the chunk.
    pub chunk_label: String,
    pub commits_text: String,
    pub commit_count: usize,
    pub baseline: Option<Baseline>,
}

/// One successful chunk as seen by a merge call.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub chunk_label: String,
    pub commit_count: usize,
    pub scores: Scores,
    pub reasoning: String,
}

/// Merge independently scored chunks into one verdict.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub identity: String,
    pub chunks: Vec<MergeInput>,
    pub baseline: Option<Baseline>,
}

/// One identity's evaluation as seen by a synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisEntry {
    pub identity: String,
    pub weight: usize,
    pub reasoning: String,
}

/// Unify per-identity reasoning for an alias group.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub entries: Vec<SynthesisEntry>,
    pub merged_scores: Scores,
    pub total_commits: usize,
}

/// Trait for LLM judge implementations.
///
/// All implementations must be `Send + Sync` so calls can run on the
/// blocking pool behind `Arc`.
pub trait Judge: Send + Sync {
    /// Score a batch of commits against the rubric.
    fn score(&self, rubric: &dyn Rubric, request: &ScoreRequest) -> Result<JudgeVerdict, JudgeError>;

    /// Merge several chunk verdicts into one.
    fn merge(&self, rubric: &dyn Rubric, request: &MergeRequest) -> Result<JudgeVerdict, JudgeError>;

    /// Write unified reasoning for several identities of one person.
    fn synthesize(&self, rubric: &dyn Rubric, request: &SynthesisRequest) -> Result<String, JudgeError>;
}

/// Run a blocking judge call on the blocking pool with a wall-clock limit.
///
/// A call that exceeds `limit` is reported as [`JudgeError::Timeout`]; the
/// underlying thread is left to finish on its own.
pub async fn call_blocking<T, F>(limit: Duration, call: F) -> Result<T, JudgeError>
where
    F: FnOnce() -> Result<T, JudgeError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(JudgeError::Aborted(join_err.to_string())),
        Err(_) => Err(JudgeError::Timeout(limit.as_secs())),
    }
}
