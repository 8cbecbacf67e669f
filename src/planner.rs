//! Splits an ordered commit list into bounded chunks for the judge.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Commit;

/// Input rejected before planning.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanningError {
    #[error("commit at position {0} has an empty id")]
    EmptyId(usize),

    #[error("duplicate commit id {0}")]
    DuplicateId(String),
}

/// Upper bounds for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBudget {
    pub max_commits: usize,
    /// Max rendered bytes per chunk.
    pub max_bytes: usize,
}

impl Default for ChunkBudget {
    fn default() -> Self {
        Self {
            max_commits: 20,
            max_bytes: 60_000,
        }
    }
}

/// A contiguous slice of commit history sent to the judge in one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Zero-based position in the plan.
    pub index: usize,
    pub total: usize,
    pub commits: Vec<Commit>,
    /// Rendered judge input.
    pub text: String,
}

impl Chunk {
    /// `i/N` label, one-based.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.index + 1, self.total)
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.text.len()
    }
}

/// Reject commits with empty or repeated ids.
pub fn validate_commits(commits: &[Commit]) -> Result<(), PlanningError> {
    let mut seen = HashSet::with_capacity(commits.len());
    for (pos, commit) in commits.iter().enumerate() {
        if commit.id.trim().is_empty() {
            return Err(PlanningError::EmptyId(pos));
        }
        if !seen.insert(commit.id.as_str()) {
            return Err(PlanningError::DuplicateId(commit.id.clone()));
        }
    }
    Ok(())
}

/// Split `commits` into chunks, preserving order.
///
/// A chunk closes when adding the next commit would exceed either budget.
/// `reuse_size` (the commit count of a previous run's chunks) replaces the
/// commit budget when given. A single commit over the byte budget gets a
/// chunk to itself.
#[must_use]
pub fn plan_chunks(commits: &[Commit], budget: ChunkBudget, reuse_size: Option<usize>) -> Vec<Chunk> {
    if commits.is_empty() {
        return Vec::new();
    }

    let max_commits = reuse_size.filter(|n| *n > 0).unwrap_or(budget.max_commits).max(1);
    let max_bytes = budget.max_bytes.max(1);

    let mut groups: Vec<(Vec<Commit>, String)> = Vec::new();
    let mut current: Vec<Commit> = Vec::new();
    let mut text = String::new();

    for (pos, commit) in commits.iter().enumerate() {
        let rendered = commit.render(pos + 1);
        let sep = if text.is_empty() { 0 } else { 1 };

        if !current.is_empty()
            && (current.len() >= max_commits || text.len() + sep + rendered.len() > max_bytes)
        {
            groups.push((std::mem::take(&mut current), std::mem::take(&mut text)));
        }

        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&rendered);
        current.push(commit.clone());
    }
    if !current.is_empty() {
        groups.push((current, text));
    }

    let total = groups.len();
    groups
        .into_iter()
        .enumerate()
        .map(|(index, (commits, text))| Chunk {
            index,
            total,
            commits,
            text,
        })
        .collect()
}
