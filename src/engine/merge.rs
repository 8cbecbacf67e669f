//! Merging per-chunk verdicts.
//!
//! Sequential runs fold each chunk into the running result through the judge
//! itself ([`ProgressiveMerge`]). Parallel runs make one judge merge call and
//! fall back to a plain per-dimension mean when that call fails.
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ChunkOutcome, ChunkResult};
use crate::judge::{Baseline, Judge, JudgeVerdict, MergeInput, MergeRequest, call_blocking};
use crate::model::{MergePath, Scores, round1};
use crate::rubric::Rubric;

/// Max characters of concatenated reasoning kept by the average fallback.
const FALLBACK_REASONING_LIMIT: usize = 4000;

/// A merged verdict plus the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub verdict: JudgeVerdict,
    pub path: MergePath,
}

/// Running state of a sequential evaluation.
///
/// Starts from the cached baseline (if any); each successful chunk replaces
/// it, so the next chunk is judged with everything seen so far as context.
#[derive(Debug, Clone, Default)]
pub struct ProgressiveMerge {
    running: Option<Baseline>,
    absorbed: usize,
}

impl ProgressiveMerge {
    #[must_use]
    pub fn new(baseline: Option<Baseline>) -> Self {
        Self {
            running: baseline,
            absorbed: 0,
        }
    }

    /// Context for the next judge call.
    #[must_use]
    pub fn context(&self) -> Option<Baseline> {
        self.running.clone()
    }

    pub fn absorb(&mut self, result: &ChunkResult) {
        let prior = self.running.as_ref().map_or(0, |b| b.commits_evaluated);
        self.running = Some(Baseline {
            scores: result.scores.clone(),
            reasoning: result.reasoning.clone(),
            commits_evaluated: prior + result.commit_count,
        });
        self.absorbed += 1;
    }

    /// Final state, or `None` when no chunk was absorbed.
    #[must_use]
    pub fn finish(self) -> Option<Merged> {
        if self.absorbed == 0 {
            return None;
        }
        self.running.map(|state| Merged {
            verdict: JudgeVerdict {
                scores: state.scores,
                reasoning: state.reasoning,
            },
            path: MergePath::Progressive,
        })
    }
}

/// Successful results of `outcomes`, ordered by chunk index.
#[must_use]
pub fn successes_in_order(outcomes: &[ChunkOutcome]) -> Vec<ChunkResult> {
    let mut ok: Vec<ChunkResult> = outcomes.iter().filter_map(|o| o.as_ref().ok().cloned()).collect();
    ok.sort_by_key(|r| r.chunk_index);
    ok
}

/// Merge independently scored chunks.
///
/// A lone success is taken as-is when it is the first chunk or there is no
/// baseline; only the first chunk is judged against the baseline, so any other
/// lone success still goes through the judge merge call to see it. That call
/// falls back to the unweighted mean when it fails or returns an invalid
/// verdict. Returns `None` only when `results` is empty.
pub async fn merge_parallel(
    judge: Arc<dyn Judge>,
    rubric: Arc<dyn Rubric>,
    identity: &str,
    results: &[ChunkResult],
    baseline: Option<Baseline>,
    call_timeout: Duration,
) -> Option<Merged> {
    match results {
        [] => None,
        [only] if only.chunk_index == 0 || baseline.is_none() => Some(Merged {
            verdict: JudgeVerdict {
                scores: only.scores.clone(),
                reasoning: only.reasoning.clone(),
            },
            path: MergePath::Single,
        }),
        _ => {
            let request = MergeRequest {
                identity: identity.to_string(),
                chunks: results
                    .iter()
                    .map(|r| MergeInput {
                        chunk_label: r.chunk_label.clone(),
                        commit_count: r.commit_count,
                        scores: r.scores.clone(),
                        reasoning: r.reasoning.clone(),
                    })
                    .collect(),
                baseline,
            };

            let call_rubric = Arc::clone(&rubric);
            let outcome = call_blocking(call_timeout, move || {
                judge
                    .merge(call_rubric.as_ref(), &request)
                    .and_then(|v| call_rubric.validate(v))
            })
            .await;

            match outcome {
                Ok(verdict) => {
                    debug!("Merged {} chunks for {identity} via judge", results.len());
                    Some(Merged {
                        verdict,
                        path: MergePath::Llm,
                    })
                }
                Err(e) => {
                    warn!("Judge merge failed for {identity}: {e}; using average fallback");
                    Some(Merged {
                        verdict: average_fallback(rubric.as_ref(), results),
                        path: MergePath::AverageFallback,
                    })
                }
            }
        }
    }
}

/// Unweighted per-dimension mean with chunk-labelled reasoning.
#[must_use]
pub fn average_fallback(rubric: &dyn Rubric, results: &[ChunkResult]) -> JudgeVerdict {
    let count = results.len().max(1) as f64;
    let scores: Scores = rubric
        .dimension_keys()
        .into_iter()
        .map(|key| {
            let sum: f64 = results
                .iter()
                .map(|r| r.scores.get(key).copied().unwrap_or(0.0))
                .sum();
            (key.to_string(), round1(sum / count))
        })
        .collect();

    let joined = results
        .iter()
        .map(|r| format!("[Chunk {}] {}", r.chunk_label, r.reasoning))
        .collect::<Vec<_>>()
        .join("\n\n");
    let reasoning = if joined.chars().count() > FALLBACK_REASONING_LIMIT {
        let mut cut: String = joined.chars().take(FALLBACK_REASONING_LIMIT).collect();
        cut.push_str("...");
        cut
    } else {
        joined
    };

    JudgeVerdict { scores, reasoning }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::mock::MockJudge;
    use crate::judge::{JudgeError, ScoreRequest, SynthesisRequest};
    use crate::model::CommitsSummary;
    use crate::rubric::{SimpleRubric, uniform_scores};

    fn result(index: usize, value: f64, commits: usize) -> ChunkResult {
        ChunkResult {
            chunk_index: index,
            chunk_label: format!("{}/3", index + 1),
            commit_count: commits,
            scores: uniform_scores(&SimpleRubric, value),
            reasoning: format!("chunk {index}"),
            commits_summary: CommitsSummary::default(),
        }
    }

    #[test]
    fn test_average_fallback_is_unweighted() {
        let verdict = average_fallback(&SimpleRubric, &[result(0, 60.0, 1), result(1, 75.0, 9)]);
        assert!(verdict.scores.values().all(|s| *s == 67.5));
        assert!(verdict.reasoning.starts_with("[Chunk 1/3] chunk 0"));
    }

    #[test]
    fn test_average_fallback_truncates_reasoning() {
        let mut a = result(0, 50.0, 1);
        a.reasoning = "r".repeat(5000);
        let verdict = average_fallback(&SimpleRubric, &[a, result(1, 50.0, 1)]);
        assert_eq!(verdict.reasoning.chars().count(), FALLBACK_REASONING_LIMIT + 3);
    }

    #[test]
    fn test_progressive_merge_threads_context() {
        let mut progressive = ProgressiveMerge::new(Some(Baseline {
            scores: uniform_scores(&SimpleRubric, 40.0),
            reasoning: "cached".to_string(),
            commits_evaluated: 10,
        }));
        assert_eq!(progressive.context().unwrap().commits_evaluated, 10);
        progressive.absorb(&result(0, 55.0, 4));
        let ctx = progressive.context().unwrap();
        assert_eq!(ctx.commits_evaluated, 14);
        assert_eq!(ctx.scores["spec_quality"], 55.0);
        let merged = progressive.finish().unwrap();
        assert_eq!(merged.path, MergePath::Progressive);
        assert_eq!(merged.verdict.reasoning, "chunk 0");
    }

    #[test]
    fn test_progressive_merge_without_results() {
        assert!(ProgressiveMerge::new(None).finish().is_none());
    }

    #[tokio::test]
    async fn test_single_success_skips_judge() {
        let judge = Arc::new(MockJudge::new());
        let merged = merge_parallel(
            judge.clone(),
            Arc::new(SimpleRubric),
            "alice",
            &[result(1, 70.0, 3)],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(merged.path, MergePath::Single);
        assert_eq!(judge.merge_calls(), 0);
    }

    #[tokio::test]
    async fn test_lone_later_chunk_is_merged_against_baseline() {
        let judge = Arc::new(MockJudge::new());
        let baseline = Baseline {
            scores: uniform_scores(&SimpleRubric, 95.0),
            reasoning: "cached".to_string(),
            commits_evaluated: 100,
        };
        let merged = merge_parallel(
            judge.clone(),
            Arc::new(SimpleRubric),
            "alice",
            &[result(1, 40.0, 10)],
            Some(baseline.clone()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(merged.path, MergePath::Llm);
        assert_eq!(judge.merge_calls(), 1);
        assert!(merged.verdict.scores.values().all(|s| *s == 95.0));

        // The first chunk was already judged against the baseline
        let first = merge_parallel(
            judge.clone(),
            Arc::new(SimpleRubric),
            "alice",
            &[result(0, 96.0, 10)],
            Some(baseline),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(first.path, MergePath::Single);
        assert_eq!(judge.merge_calls(), 1);
    }

    #[tokio::test]
    async fn test_merge_failure_falls_back_to_average() {
        let judge = Arc::new(MockJudge::new().failing_merge());
        let merged = merge_parallel(
            judge.clone(),
            Arc::new(SimpleRubric),
            "alice",
            &[result(0, 60.0, 2), result(1, 80.0, 2), result(2, 70.0, 2)],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(merged.path, MergePath::AverageFallback);
        assert!(merged.verdict.scores.values().all(|s| *s == 70.0));
        assert_eq!(judge.merge_calls(), 1);
    }

    /// Merge replies with a score above 100.
    struct OverflowingMerge;

    impl Judge for OverflowingMerge {
        fn score(&self, _: &dyn Rubric, _: &ScoreRequest) -> Result<JudgeVerdict, JudgeError> {
            Err(JudgeError::Request("unused".to_string()))
        }

        fn merge(&self, rubric: &dyn Rubric, _: &MergeRequest) -> Result<JudgeVerdict, JudgeError> {
            Ok(JudgeVerdict {
                scores: uniform_scores(rubric, 250.0),
                reasoning: "too generous".to_string(),
            })
        }

        fn synthesize(&self, _: &dyn Rubric, _: &SynthesisRequest) -> Result<String, JudgeError> {
            Err(JudgeError::Request("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_out_of_range_merge_falls_back_to_average() {
        let merged = merge_parallel(
            Arc::new(OverflowingMerge),
            Arc::new(SimpleRubric),
            "alice",
            &[result(0, 60.0, 1), result(1, 80.0, 1)],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(merged.path, MergePath::AverageFallback);
        assert!(merged.verdict.scores.values().all(|s| *s == 70.0));
    }

    #[tokio::test]
    async fn test_merge_via_judge() {
        let judge = Arc::new(MockJudge::new());
        let merged = merge_parallel(
            judge,
            Arc::new(SimpleRubric),
            "alice",
            &[result(0, 60.0, 1), result(1, 80.0, 3)],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(merged.path, MergePath::Llm);
        assert!(merged.verdict.scores.values().all(|s| *s == 75.0));
    }

    #[test]
    fn test_successes_in_order() {
        let outcomes: Vec<ChunkOutcome> = vec![
            Ok(result(2, 1.0, 1)),
            Err(crate::engine::ChunkFailure {
                chunk_index: 1,
                chunk_label: "2/3".to_string(),
                error: "boom".to_string(),
            }),
            Ok(result(0, 1.0, 1)),
        ];
        let ordered = successes_in_order(&outcomes);
        assert_eq!(ordered.iter().map(|r| r.chunk_index).collect::<Vec<_>>(), vec![0, 2]);
    }
}
