//! Scoring rubrics ("plugins").
//!
//! A rubric declares its dimension set and builds the prompts for the three
//! judge capabilities (score, merge, synthesize). The pipeline only talks to
//! `dyn Rubric` and never branches on a rubric id.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::judge::{Baseline, JudgeError, JudgeVerdict, MergeRequest, ScoreRequest, SynthesisRequest};
use crate::model::Scores;

/// Id used when a caller passes an empty plugin id.
pub const DEFAULT_RUBRIC_ID: &str = "zgc_ai_native_2026";

#[derive(Error, Debug)]
#[error("unknown plugin: {0}")]
pub struct UnknownRubric(pub String);

/// One scoring dimension of a rubric.
#[derive(Debug, Clone, Copy)]
pub struct Dimension {
    pub key: &'static str,
    pub label: &'static str,
    pub guidance: &'static str,
}

const CONTINUITY_POLICY: &str = "SCORE CONTINUITY: previous scores are given below. Maintain or increase each score unless the new commits show explicit negative evidence (regressions, reintroduced bugs, anti-patterns). If such evidence exists, lower the affected scores and say why.";

pub trait Rubric: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
    fn dimensions(&self) -> &[Dimension];

    fn dimension_keys(&self) -> Vec<&'static str> {
        self.dimensions().iter().map(|d| d.key).collect()
    }

    /// Prompt for scoring one chunk.
    fn score_prompt(&self, request: &ScoreRequest) -> String {
        let mut prompt = format!(
            "You are an expert engineering evaluator. Analyze the following commits from author \"{}\" (chunk {}, {} commits) and score their engineering capabilities. Each score must be an integer from 0 to 100.\n\nCOMMITS TO ANALYZE:\n{}\n\nEVALUATION DIMENSIONS:\n",
            request.identity, request.chunk_label, request.commit_count, request.commits_text
        );
        write_dimensions(&mut prompt, self.dimensions());
        if let Some(baseline) = &request.baseline {
            write_baseline(&mut prompt, baseline);
        }
        write_response_format(&mut prompt, self.dimensions());
        prompt
    }

    /// Prompt for merging independently scored chunks.
    fn merge_prompt(&self, request: &MergeRequest) -> String {
        let mut prompt = format!(
            "You are merging {} independent evaluations of consecutive commit chunks from author \"{}\" into one coherent evaluation. Weigh chunks by their commit counts and reconcile contradictions.\n\nCHUNK EVALUATIONS:\n",
            request.chunks.len(),
            request.identity
        );
        for chunk in &request.chunks {
            let _ = writeln!(prompt, "\n### Chunk {} ({} commits)", chunk.chunk_label, chunk.commit_count);
            for (key, score) in &chunk.scores {
                let _ = writeln!(prompt, "- {key}: {score}");
            }
            let _ = writeln!(prompt, "Reasoning: {}", chunk.reasoning);
        }
        prompt.push_str("\nEVALUATION DIMENSIONS:\n");
        write_dimensions(&mut prompt, self.dimensions());
        if let Some(baseline) = &request.baseline {
            write_baseline(&mut prompt, baseline);
        }
        write_response_format(&mut prompt, self.dimensions());
        prompt
    }

    /// Prompt for synthesizing reasoning across the identities of one person.
    fn synthesis_prompt(&self, request: &SynthesisRequest) -> String {
        let total_weight: usize = request.entries.iter().map(|e| e.weight).sum();
        let mut prompt = String::from(
            "You are analyzing a software engineer who uses multiple names in their commits. You have separate evaluations for each identity and must write one unified analysis.\n\nIndividual analyses, weighted by commit count:\n",
        );
        for entry in &request.entries {
            let pct = if total_weight == 0 {
                0.0
            } else {
                entry.weight as f64 * 100.0 / total_weight as f64
            };
            let _ = writeln!(
                prompt,
                "\n### {} ({} commits, {:.1}% weight):\n{}",
                entry.identity, entry.weight, pct, entry.reasoning
            );
        }
        let _ = writeln!(prompt, "\nTotal commits: {}\nWeighted average scores:", request.total_commits);
        for dim in self.dimensions() {
            if let Some(score) = request.merged_scores.get(dim.key) {
                let _ = writeln!(prompt, "- {}: {score}/100", dim.label);
            }
        }
        prompt.push_str("\nWrite a unified analysis (3-5 paragraphs) that synthesizes all identities, gives more weight to identities with more commits, names common themes, and keeps a professional, objective tone. Return only the analysis text.");
        prompt
    }

    /// Check a verdict against the dimension set.
    ///
    /// Every dimension must be present and within `[0, 100]`. Keys outside
    /// the rubric are dropped.
    fn validate(&self, verdict: JudgeVerdict) -> Result<JudgeVerdict, JudgeError> {
        let mut scores = BTreeMap::new();
        for dim in self.dimensions() {
            let value = *verdict.scores.get(dim.key).ok_or_else(|| {
                JudgeError::InvalidResponse(format!("missing dimension {}", dim.key))
            })?;
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(JudgeError::InvalidResponse(format!(
                    "score {value} for {} outside 0..=100",
                    dim.key
                )));
            }
            scores.insert(dim.key.to_string(), value);
        }
        Ok(JudgeVerdict {
            scores,
            reasoning: verdict.reasoning,
        })
    }
}

fn write_dimensions(prompt: &mut String, dimensions: &[Dimension]) {
    for (i, dim) in dimensions.iter().enumerate() {
        let _ = writeln!(prompt, "{}. **{} ({})**: {}", i + 1, dim.label, dim.key, dim.guidance);
    }
}

fn write_baseline(prompt: &mut String, baseline: &Baseline) {
    let _ = writeln!(
        prompt,
        "\n{CONTINUITY_POLICY}\nPREVIOUS EVALUATION ({} commits):",
        baseline.commits_evaluated
    );
    for (key, score) in &baseline.scores {
        let _ = writeln!(prompt, "- {key}: {score}");
    }
    let _ = writeln!(prompt, "Previous reasoning: {}", baseline.reasoning);
}

fn write_response_format(prompt: &mut String, dimensions: &[Dimension]) {
    prompt.push_str("\nIMPORTANT: Return ONLY a valid JSON object. No text before or after.\n\nFormat:\n{\n");
    for dim in dimensions {
        let _ = writeln!(prompt, "  \"{}\": <0-100>,", dim.key);
    }
    prompt.push_str("  \"reasoning\": \"Explanation of the evaluation\"\n}");
}

// ── Built-in rubrics ─────────────────────────────────────────────────

const AI_NATIVE_DIMENSIONS: &[Dimension] = &[
    Dimension {
        key: "ai_fullstack",
        label: "AI Model Full-Stack",
        guidance: "AI/ML model development, training, optimization, deployment, model serving.",
    },
    Dimension {
        key: "ai_architecture",
        label: "AI Native Architecture",
        guidance: "AI-first system design, API design, service architecture, integration patterns.",
    },
    Dimension {
        key: "cloud_native",
        label: "Cloud Native Engineering",
        guidance: "Containerization, infrastructure as code, CI/CD, deployment automation.",
    },
    Dimension {
        key: "open_source",
        label: "Open Source Collaboration",
        guidance: "Clear commit messages, issue references, refactoring, bug fixes.",
    },
    Dimension {
        key: "intelligent_dev",
        label: "Intelligent Development",
        guidance: "Test coverage, automation scripts, build tooling, linting, developer efficiency.",
    },
    Dimension {
        key: "leadership",
        label: "Engineering Leadership",
        guidance: "Architecture decisions, performance, security, code quality.",
    },
];

const SIMPLE_DIMENSIONS: &[Dimension] = &[
    Dimension {
        key: "spec_quality",
        label: "Specification & Trade-offs",
        guidance: "Clarity of intent, design trade-offs, documentation of decisions.",
    },
    Dimension {
        key: "cloud_architecture",
        label: "Architecture & Communication",
        guidance: "System structure, interfaces, communication through code and messages.",
    },
    Dimension {
        key: "ai_engineering",
        label: "Engineering Practice",
        guidance: "Testing, automation, deployment and tooling.",
    },
    Dimension {
        key: "mastery_professionalism",
        label: "Mastery & Professionalism",
        guidance: "Code quality, consistency, care for maintainability.",
    },
];

/// Six-dimension AI-native engineering rubric.
pub struct AiNativeRubric;

impl Rubric for AiNativeRubric {
    fn id(&self) -> &str {
        DEFAULT_RUBRIC_ID
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn dimensions(&self) -> &[Dimension] {
        AI_NATIVE_DIMENSIONS
    }
}

/// Four-dimension general rubric.
pub struct SimpleRubric;

impl Rubric for SimpleRubric {
    fn id(&self) -> &str {
        "zgc_simple"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn dimensions(&self) -> &[Dimension] {
        SIMPLE_DIMENSIONS
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Resolves rubric ids to implementations.
pub struct RubricRegistry {
    rubrics: Vec<Arc<dyn Rubric>>,
    default_id: String,
}

impl RubricRegistry {
    /// Registry with the built-in rubrics.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            rubrics: vec![Arc::new(AiNativeRubric), Arc::new(SimpleRubric)],
            default_id: DEFAULT_RUBRIC_ID.to_string(),
        }
    }

    /// Change the rubric used for empty ids.
    pub fn with_default(mut self, id: &str) -> Result<Self, UnknownRubric> {
        if !self.rubrics.iter().any(|r| r.id() == id) {
            return Err(UnknownRubric(id.to_string()));
        }
        self.default_id = id.to_string();
        Ok(self)
    }

    /// Resolve an id; empty means the default rubric.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Rubric>, UnknownRubric> {
        let id = id.trim();
        let wanted = if id.is_empty() { self.default_id.as_str() } else { id };
        self.rubrics
            .iter()
            .find(|r| r.id() == wanted)
            .cloned()
            .ok_or_else(|| UnknownRubric(wanted.to_string()))
    }

    #[must_use]
    pub fn list(&self) -> &[Arc<dyn Rubric>] {
        &self.rubrics
    }
}

/// Scores helper used by tests and mocks: every dimension set to `value`.
#[must_use]
pub fn uniform_scores(rubric: &dyn Rubric, value: f64) -> Scores {
    rubric
        .dimension_keys()
        .into_iter()
        .map(|k| (k.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default_and_named() {
        let registry = RubricRegistry::builtin();
        assert_eq!(registry.resolve("").unwrap().id(), DEFAULT_RUBRIC_ID);
        assert_eq!(registry.resolve("zgc_simple").unwrap().dimensions().len(), 4);
        assert!(registry.resolve("nope").is_err());
    }

    #[test]
    fn test_with_default_rejects_unknown() {
        assert!(RubricRegistry::builtin().with_default("missing").is_err());
        let registry = RubricRegistry::builtin().with_default("zgc_simple").unwrap();
        assert_eq!(registry.resolve(" ").unwrap().id(), "zgc_simple");
    }

    #[test]
    fn test_validate_rejects_missing_and_out_of_range() {
        let rubric = SimpleRubric;
        let mut scores = uniform_scores(&rubric, 50.0);
        scores.remove("spec_quality");
        let missing = JudgeVerdict {
            scores,
            reasoning: String::new(),
        };
        assert!(rubric.validate(missing).is_err());

        let mut scores = uniform_scores(&rubric, 50.0);
        scores.insert("ai_engineering".to_string(), 101.0);
        let high = JudgeVerdict {
            scores,
            reasoning: String::new(),
        };
        assert!(rubric.validate(high).is_err());
    }

    #[test]
    fn test_validate_drops_foreign_keys() {
        let rubric = SimpleRubric;
        let mut scores = uniform_scores(&rubric, 70.0);
        scores.insert("extra".to_string(), 5.0);
        let verdict = rubric
            .validate(JudgeVerdict {
                scores,
                reasoning: "ok".to_string(),
            })
            .unwrap();
        assert_eq!(verdict.scores.len(), 4);
        assert!(!verdict.scores.contains_key("extra"));
    }

    #[test]
    fn test_score_prompt_carries_baseline() {
        let rubric = AiNativeRubric;
        let mut request = ScoreRequest {
            identity: "alice".to_string(),
            chunk_label: "1/2".to_string(),
            commits_text: "Commit #1".to_string(),
            commit_count: 1,
            baseline: None,
        };
        assert!(!rubric.score_prompt(&request).contains("SCORE CONTINUITY"));

        request.baseline = Some(Baseline {
            scores: uniform_scores(&rubric, 61.0),
            reasoning: "earlier".to_string(),
            commits_evaluated: 12,
        });
        let prompt = rubric.score_prompt(&request);
        assert!(prompt.contains("SCORE CONTINUITY"));
        assert!(prompt.contains("- leadership: 61"));
        assert!(prompt.contains("\"cloud_native\": <0-100>"));
    }
}
