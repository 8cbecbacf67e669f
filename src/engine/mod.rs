//! Chunk execution and merging.
//!
//! The executor drives one judge call per chunk, sequentially with the
//! running result as context or in parallel under a worker bound. The merge
//! engine turns per-chunk results into one verdict.
pub mod executor;
pub mod merge;

pub use executor::{ExecutionOutcome, Executor, ExecutorSettings};

use thiserror::Error;

use crate::model::{CommitsSummary, Scores};

/// A successfully judged chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub chunk_label: String,
    pub commit_count: usize,
    pub scores: Scores,
    pub reasoning: String,
    pub commits_summary: CommitsSummary,
}

/// A chunk whose judge call failed, timed out or returned an invalid verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub chunk_label: String,
    pub error: String,
}

pub type ChunkOutcome = Result<ChunkResult, ChunkFailure>;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("all {attempted} chunks failed: {}", .failures.join("; "))]
    AllChunksFailed {
        attempted: usize,
        failures: Vec<String>,
    },
}

impl ExecutionError {
    pub(crate) fn all_failed(failures: &[ChunkFailure]) -> Self {
        Self::AllChunksFailed {
            attempted: failures.len(),
            failures: failures
                .iter()
                .map(|f| format!("chunk {}: {}", f.chunk_label, f.error))
                .collect(),
        }
    }
}
