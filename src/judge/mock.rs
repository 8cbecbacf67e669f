/// Mock judge for testing and offline runs.
///
/// Produces deterministic scores from a hash of the input text, honors the
/// score-continuity instruction when a baseline is supplied, and can be told
/// to fail specific calls.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Judge, JudgeError, JudgeVerdict, MergeRequest, ScoreRequest, SynthesisRequest};
use crate::model::{Scores, round1};
use crate::rubric::Rubric;

/// A mock judge that derives scores from text hashes.
#[derive(Default)]
pub struct MockJudge {
    fail_merge: bool,
    fail_synthesis: bool,
    fail_scores_containing: Vec<String>,
    score_calls: AtomicUsize,
    merge_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
}

impl MockJudge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every merge call fail.
    #[must_use]
    pub fn failing_merge(mut self) -> Self {
        self.fail_merge = true;
        self
    }

    /// Make every synthesis call fail.
    #[must_use]
    pub fn failing_synthesis(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    /// Fail score calls whose commit text contains `needle` (e.g. a sha).
    #[must_use]
    pub fn failing_scores_containing(mut self, needle: &str) -> Self {
        self.fail_scores_containing.push(needle.to_string());
        self
    }

    #[must_use]
    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn synthesis_calls(&self) -> usize {
        self.synthesis_calls.load(Ordering::SeqCst)
    }

    /// Total judge calls of any kind.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.score_calls() + self.merge_calls() + self.synthesis_calls()
    }
}

/// Deterministic score in `30..=90` for a dimension and input text.
fn hashed_score(dimension: &str, text: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    dimension.hash(&mut hasher);
    text.hash(&mut hasher);
    (30 + hasher.finish() % 61) as f64
}

impl Judge for MockJudge {
    fn score(&self, rubric: &dyn Rubric, request: &ScoreRequest) -> Result<JudgeVerdict, JudgeError> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_scores_containing
            .iter()
            .any(|needle| request.commits_text.contains(needle.as_str()))
        {
            return Err(JudgeError::Request(format!(
                "mock failure for chunk {}",
                request.chunk_label
            )));
        }

        let scores: Scores = rubric
            .dimension_keys()
            .into_iter()
            .map(|key| {
                let fresh = hashed_score(key, &request.commits_text);
                let prior = request
                    .baseline
                    .as_ref()
                    .and_then(|b| b.scores.get(key).copied())
                    .unwrap_or(0.0);
                (key.to_string(), fresh.max(prior))
            })
            .collect();

        Ok(JudgeVerdict {
            scores,
            reasoning: format!(
                "Mock evaluation of chunk {} ({} commits) for {}.",
                request.chunk_label, request.commit_count, request.identity
            ),
        })
    }

    fn merge(&self, rubric: &dyn Rubric, request: &MergeRequest) -> Result<JudgeVerdict, JudgeError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_merge {
            return Err(JudgeError::InvalidResponse("mock merge failure".to_string()));
        }
        let total: usize = request.chunks.iter().map(|c| c.commit_count.max(1)).sum();
        let scores: Scores = rubric
            .dimension_keys()
            .into_iter()
            .map(|key| {
                let weighted: f64 = request
                    .chunks
                    .iter()
                    .map(|c| c.scores.get(key).copied().unwrap_or(0.0) * c.commit_count.max(1) as f64)
                    .sum();
                let prior = request
                    .baseline
                    .as_ref()
                    .and_then(|b| b.scores.get(key).copied())
                    .unwrap_or(0.0);
                (key.to_string(), round1(weighted / total.max(1) as f64).max(prior))
            })
            .collect();
        Ok(JudgeVerdict {
            scores,
            reasoning: format!(
                "Mock merge of {} chunks for {}.",
                request.chunks.len(),
                request.identity
            ),
        })
    }

    fn synthesize(&self, _rubric: &dyn Rubric, request: &SynthesisRequest) -> Result<String, JudgeError> {
        self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_synthesis {
            return Err(JudgeError::Status {
                status: 503,
                body: "mock synthesis failure".to_string(),
            });
        }
        let names: Vec<&str> = request.entries.iter().map(|e| e.identity.as_str()).collect();
        Ok(format!(
            "Unified analysis of {} across {} commits.",
            names.join(", "),
            request.total_commits
        ))
    }
}
