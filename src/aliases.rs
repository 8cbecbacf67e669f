//! Aggregation of several author identities that belong to one person.
//!
//! Each identity is evaluated through the regular cached path; the results
//! are combined with commit-count weights and one synthesis call writes the
//! unified reasoning.
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::CacheKey;
use crate::evaluator::{EvalError, EvaluationService, RunOptions};
use crate::judge::{Judge, SynthesisEntry, SynthesisRequest, call_blocking};
use crate::model::{
    ChunkingMetadata, CommitsSummary, Evaluation, IdentityGroup, IdentityWeight, ReasoningSource,
    Scores, round1,
};
use crate::rubric::Rubric;
use crate::source::RepoRef;

impl EvaluationService {
    /// Evaluate every identity of `group` and merge the results.
    ///
    /// A one-member group is a plain identity evaluation. The merged result is
    /// cached under the group key and reused while no member has new commits.
    pub async fn evaluate_aliases(
        &self,
        repo: &RepoRef,
        group: &IdentityGroup,
        rubric: Arc<dyn Rubric>,
        run: RunOptions,
    ) -> Result<Evaluation, EvalError> {
        if group.len() == 1 {
            return self
                .evaluate_identity(repo, &group.identities()[0], rubric, run)
                .await;
        }

        let mut members = Vec::with_capacity(group.len());
        for identity in group.identities() {
            members.push(
                self.evaluate_identity(repo, identity, Arc::clone(&rubric), run)
                    .await?,
            );
        }

        let key = CacheKey::for_group(repo, rubric.id(), &group.key());
        let _guard = self.locks.lock(&key.to_string()).await;

        let cached = {
            let db = self.db.lock().await;
            db.get_evaluation(&key).map_err(EvalError::CacheRead)?
        };
        let weights = member_weights(group, &members);
        if let Some(cached) = cached.filter(|c| c.merged_from == weights) {
            debug!("{key}: members unchanged, returning cached merge");
            return Ok(cached);
        }

        let merged = merge_identities(
            Arc::clone(&self.judge),
            rubric,
            group,
            &members,
            self.settings.call_timeout,
        )
        .await;

        if merged.total_commits_evaluated > 0 {
            let mut db = self.db.lock().await;
            db.put_evaluation(&key, &merged)
                .map_err(EvalError::CacheWrite)?;
        }

        Ok(merged)
    }
}

/// `(identity, commits)` for each member with at least one commit.
fn member_weights(group: &IdentityGroup, members: &[Evaluation]) -> Vec<IdentityWeight> {
    group
        .identities()
        .iter()
        .zip(members)
        .filter(|(_, m)| m.total_commits_evaluated > 0)
        .map(|(identity, m)| IdentityWeight {
            identity: identity.clone(),
            weight: m.total_commits_evaluated,
        })
        .collect()
}

/// Commit-count-weighted mean per dimension, rounded to one decimal.
#[must_use]
pub fn weighted_scores(rubric: &dyn Rubric, members: &[(&Evaluation, usize)]) -> Scores {
    let total: usize = members.iter().map(|(_, w)| *w).sum();
    rubric
        .dimension_keys()
        .into_iter()
        .map(|key| {
            let sum: f64 = members
                .iter()
                .map(|(e, w)| e.scores.get(key).copied().unwrap_or(0.0) * *w as f64)
                .sum();
            let mean = if total == 0 { 0.0 } else { sum / total as f64 };
            (key.to_string(), round1(mean))
        })
        .collect()
}

/// Deterministic reasoning used when synthesis fails.
#[must_use]
pub fn concatenated_reasoning(entries: &[SynthesisEntry]) -> String {
    let total: usize = entries.iter().map(|e| e.weight).sum();
    let names: Vec<&str> = entries.iter().map(|e| e.identity.as_str()).collect();
    let mut out = format!(
        "Combined analysis from {} identities ({}):\n",
        entries.len(),
        names.join(", ")
    );
    for entry in entries {
        let pct = if total == 0 {
            0.0
        } else {
            entry.weight as f64 * 100.0 / total as f64
        };
        let _ = write!(
            out,
            "\n### {} ({} commits, {:.1}% weight)\n{}\n",
            entry.identity, entry.weight, pct, entry.reasoning
        );
    }
    out
}

/// Merge per-identity evaluations into one.
///
/// Identities without commits are left out; if none remain the result is an
/// empty evaluation for the group label.
pub async fn merge_identities(
    judge: Arc<dyn Judge>,
    rubric: Arc<dyn Rubric>,
    group: &IdentityGroup,
    members: &[Evaluation],
    call_timeout: Duration,
) -> Evaluation {
    let label = group.label();
    let weighted: Vec<(&Evaluation, usize)> = members
        .iter()
        .filter(|m| m.total_commits_evaluated > 0)
        .map(|m| (m, m.total_commits_evaluated))
        .collect();

    if weighted.is_empty() {
        info!("{label}: no identity has commits");
        return Evaluation::empty(&label, rubric.id(), rubric.version(), &rubric.dimension_keys());
    }

    let scores = weighted_scores(rubric.as_ref(), &weighted);
    let total_commits: usize = weighted.iter().map(|(_, w)| *w).sum();
    let entries: Vec<SynthesisEntry> = weighted
        .iter()
        .map(|(e, w)| SynthesisEntry {
            identity: e.identity.clone(),
            weight: *w,
            reasoning: e.reasoning.clone(),
        })
        .collect();

    let request = SynthesisRequest {
        entries: entries.clone(),
        merged_scores: scores.clone(),
        total_commits,
    };
    let call_rubric = Arc::clone(&rubric);
    let synthesized = call_blocking(call_timeout, move || {
        judge.synthesize(call_rubric.as_ref(), &request)
    })
    .await;

    let (reasoning, source) = match synthesized {
        Ok(text) if !text.trim().is_empty() => (text, ReasoningSource::Synthesis),
        Ok(_) => {
            warn!("{label}: empty synthesis, concatenating reasoning");
            (concatenated_reasoning(&entries), ReasoningSource::ConcatenationFallback)
        }
        Err(e) => {
            warn!("{label}: synthesis failed: {e}; concatenating reasoning");
            (concatenated_reasoning(&entries), ReasoningSource::ConcatenationFallback)
        }
    };

    let commits_summary = weighted
        .iter()
        .fold(CommitsSummary::default(), |acc, (e, _)| acc.combine(&e.commits_summary));

    let chunking = weighted.iter().fold(ChunkingMetadata::default(), |mut acc, (e, _)| {
        acc.chunked |= e.chunking.chunked;
        acc.chunks_processed += e.chunking.chunks_processed;
        acc.chunks_failed += e.chunking.chunks_failed;
        acc
    });

    let merged_from = member_weights(group, members);

    Evaluation {
        identity: label,
        scores,
        reasoning,
        commits_summary,
        last_commit_id: None,
        total_commits_evaluated: total_commits,
        new_commits_count: weighted.iter().map(|(e, _)| e.new_commits_count).sum(),
        incremental: weighted.iter().any(|(e, _)| e.incremental),
        evaluated_at: Utc::now(),
        plugin_id: rubric.id().to_string(),
        plugin_version: rubric.version().to_string(),
        chunking,
        merged_from,
        reasoning_source: Some(source),
    }
}
