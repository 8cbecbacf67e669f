//! Core data types shared by the pipeline: commits, summaries, evaluations
//! and identity groups.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-dimension scores in `[0, 100]`, keyed by rubric dimension.
pub type Scores = BTreeMap<String, f64>;

/// Max languages kept in a per-run summary.
const MAX_LANGUAGES: usize = 10;

/// Reasoning attached to an evaluation for an author without commits.
pub const NO_COMMITS_REASONING: &str = "No commits found for this author.";

// ── Commits ──────────────────────────────────────────────────────────

/// A single file touched by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// A commit as supplied by a commit source. Read-only for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    /// Free-form diff or summary text, used when no per-file changes exist.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files: Vec<FileChange>,
    #[serde(default)]
    pub files_changed: usize,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Commit {
    /// Languages touched by this commit: explicit ones, else file extensions.
    #[must_use]
    pub fn detected_languages(&self) -> Vec<String> {
        if !self.languages.is_empty() {
            return self.languages.clone();
        }
        let set: BTreeSet<String> = self
            .files
            .iter()
            .filter_map(|f| extension_of(&f.filename))
            .collect();
        set.into_iter().collect()
    }

    /// Number of files changed, preferring the per-file list when present.
    #[must_use]
    pub fn file_count(&self) -> usize {
        if self.files.is_empty() {
            self.files_changed
        } else {
            self.files.len()
        }
    }

    /// Render the commit as judge input text.
    ///
    /// Shows the first 200 characters of the message, line stats, up to five
    /// files, and patches under 1000 bytes (first 500 characters each).
    #[must_use]
    pub fn render(&self, position: usize) -> String {
        let message: String = self.message.chars().take(200).collect();
        let mut out = format!(
            "Commit #{position} ({id}):\nMessage: {message}\nAuthor: {author}\nDate: {date}\nChanges: +{add} -{del} lines\nFiles changed: {files}\n",
            id = self.id,
            author = self.author,
            date = self.timestamp.to_rfc3339(),
            add = self.additions,
            del = self.deletions,
            files = self.file_count(),
        );

        if !self.files.is_empty() {
            out.push_str("\nKey files modified:\n");
            for file in self.files.iter().take(5) {
                out.push_str(&format!(
                    "  - {} ({}) +{} -{}\n",
                    file.filename, file.status, file.additions, file.deletions
                ));
                if let Some(patch) = &file.patch {
                    if !patch.is_empty() && patch.len() < 1000 {
                        let shown: String = patch.chars().take(500).collect();
                        out.push_str(&format!("\n```diff\n{shown}\n```\n"));
                    }
                }
            }
        } else if !self.summary.is_empty() {
            out.push_str(&format!("\n{}\n", self.summary));
        }

        out
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    // Dotfiles like `.gitignore` report the name after the dot
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

// ── Summaries ────────────────────────────────────────────────────────

/// Aggregate line and file statistics over a set of commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitsSummary {
    pub total_additions: u64,
    pub total_deletions: u64,
    pub files_changed: usize,
    pub languages: Vec<String>,
}

impl CommitsSummary {
    /// Summarize a commit slice. File paths are counted once across commits.
    #[must_use]
    pub fn from_commits(commits: &[Commit]) -> Self {
        let mut paths = BTreeSet::new();
        let mut unlisted_files = 0usize;
        let mut languages = BTreeSet::new();
        let mut summary = Self::default();

        for commit in commits {
            summary.total_additions += commit.additions;
            summary.total_deletions += commit.deletions;
            if commit.files.is_empty() {
                unlisted_files += commit.files_changed;
            } else {
                paths.extend(commit.files.iter().map(|f| f.filename.as_str()));
            }
            languages.extend(commit.detected_languages());
        }

        summary.files_changed = paths.len() + unlisted_files;
        summary.languages = languages.into_iter().take(MAX_LANGUAGES).collect();
        summary
    }

    /// Sum two summaries; languages are unioned.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        let languages: BTreeSet<String> = self
            .languages
            .iter()
            .chain(other.languages.iter())
            .cloned()
            .collect();
        Self {
            total_additions: self.total_additions + other.total_additions,
            total_deletions: self.total_deletions + other.total_deletions,
            files_changed: self.files_changed + other.files_changed,
            languages: languages.into_iter().collect(),
        }
    }
}

// ── Evaluations ──────────────────────────────────────────────────────

/// How chunks were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Sequential,
    Parallel,
}

impl ChunkingStrategy {
    #[must_use]
    pub fn from_parallel_flag(parallel: bool) -> Self {
        if parallel { Self::Parallel } else { Self::Sequential }
    }
}

/// Which merge algorithm produced the final scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePath {
    /// Sequential fold through the judge.
    Progressive,
    /// Only one chunk succeeded; taken as-is.
    Single,
    /// Judge merge call in parallel mode.
    Llm,
    /// Judge merge failed; unweighted per-dimension mean.
    AverageFallback,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingMetadata {
    pub chunked: bool,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ChunkingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_path: Option<MergePath>,
    /// Commits per chunk used for this run; reused by incremental runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

/// Where the reasoning of an alias-merged evaluation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningSource {
    Synthesis,
    ConcatenationFallback,
}

/// One identity's share in an alias-merged evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityWeight {
    pub identity: String,
    pub weight: usize,
}

/// The merged result of judging an identity's (or alias group's) commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub identity: String,
    pub scores: Scores,
    pub reasoning: String,
    pub commits_summary: CommitsSummary,
    pub last_commit_id: Option<String>,
    pub total_commits_evaluated: usize,
    pub new_commits_count: usize,
    #[serde(default)]
    pub incremental: bool,
    pub evaluated_at: DateTime<Utc>,
    pub plugin_id: String,
    pub plugin_version: String,
    #[serde(default)]
    pub chunking: ChunkingMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<IdentityWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_source: Option<ReasoningSource>,
}

impl Evaluation {
    /// Zero-score evaluation for an author with no commits.
    #[must_use]
    pub fn empty(identity: &str, plugin_id: &str, plugin_version: &str, dimensions: &[&str]) -> Self {
        Self {
            identity: identity.to_string(),
            scores: dimensions.iter().map(|d| ((*d).to_string(), 0.0)).collect(),
            reasoning: NO_COMMITS_REASONING.to_string(),
            commits_summary: CommitsSummary::default(),
            last_commit_id: None,
            total_commits_evaluated: 0,
            new_commits_count: 0,
            incremental: false,
            evaluated_at: Utc::now(),
            plugin_id: plugin_id.to_string(),
            plugin_version: plugin_version.to_string(),
            chunking: ChunkingMetadata::default(),
            merged_from: Vec::new(),
            reasoning_source: None,
        }
    }
}

/// Round to one decimal place, the precision scores are stored with.
#[must_use]
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ── Identities ───────────────────────────────────────────────────────

/// Normalize an author identity for case-insensitive matching and keys.
#[must_use]
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// A non-empty set of author names known to denote one person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityGroup {
    identities: Vec<String>,
}

impl IdentityGroup {
    /// Build a group, dropping blanks and case-insensitive duplicates.
    /// Returns `None` when nothing remains.
    pub fn new<I, S>(identities: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut kept = Vec::new();
        for identity in identities {
            let trimmed = identity.as_ref().trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(normalize_identity(trimmed)) {
                kept.push(trimmed.to_string());
            }
        }
        if kept.is_empty() {
            None
        } else {
            Some(Self { identities: kept })
        }
    }

    /// Identities in the order they were given.
    #[must_use]
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Stable storage key: sorted normalized identities joined by commas.
    #[must_use]
    pub fn key(&self) -> String {
        let sorted: BTreeSet<String> = self
            .identities
            .iter()
            .map(|i| normalize_identity(i))
            .collect();
        sorted.into_iter().collect::<Vec<_>>().join(",")
    }

    /// Human-readable label, e.g. `alice + Alice Smith`.
    #[must_use]
    pub fn label(&self) -> String {
        self.identities.join(" + ")
    }
}
