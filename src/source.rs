//! Commit sources: where the pipeline gets commit history from.
//!
//! The local source reads the `commits_list.json` files written by the
//! extraction step, one per repository under
//! `<data_dir>/<platform>/<owner>/<repo>/`.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Commit, FileChange, normalize_identity};

/// Name of the per-repository commit file.
pub const COMMITS_FILE: &str = "commits_list.json";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported repository url: {0}")]
    InvalidUrl(String),

    #[error("no extracted commit data at {0}")]
    NotExtracted(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid commit data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed commit record: {0}")]
    Malformed(String),
}

// ── Repository references ────────────────────────────────────────────

/// A hosted repository, identified by platform, owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub platform: String,
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    #[must_use]
    pub fn new(platform: &str, owner: &str, repo: &str) -> Self {
        Self {
            platform: platform.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    /// Canonical https url.
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://{}.com/{}/{}", self.platform, self.owner, self.repo)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.platform, self.owner, self.repo)
    }
}

static REPO_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^https?://(?:www\.)?(github|gitee)\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
        r"^(github|gitee)\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
        r"^git@(github|gitee)\.com:([^/\s]+)/([^/\s]+?)(?:\.git)?$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Parse a GitHub or Gitee repository url.
///
/// Accepts `https://github.com/o/r(.git)`, `github.com/o/r` and
/// `git@github.com:o/r.git`, and the same forms on gitee.com.
pub fn parse_repo_url(url: &str) -> Result<RepoRef, SourceError> {
    let trimmed = url.trim();
    REPO_URL_PATTERNS
        .iter()
        .find_map(|re| re.captures(trimmed))
        .map(|caps| RepoRef::new(&caps[1], &caps[2], &caps[3]))
        .ok_or_else(|| SourceError::InvalidUrl(url.to_string()))
}

// ── Commit sources ───────────────────────────────────────────────────

/// Supplies commit history for a repository and a set of author identities.
pub trait CommitSource: Send + Sync {
    /// Commits by any of `identities`, oldest first.
    ///
    /// When `since` names a commit in the history, only later commits are
    /// returned; an unknown `since` returns everything.
    fn get_commits(
        &self,
        repo: &RepoRef,
        identities: &[String],
        since: Option<&str>,
    ) -> Result<Vec<Commit>, SourceError>;
}

/// Keep commits after `since` (by position in the full history) whose author
/// matches one of `identities`.
fn select(history: Vec<Commit>, identities: &[String], since: Option<&str>) -> Vec<Commit> {
    let wanted: Vec<String> = identities.iter().map(|i| normalize_identity(i)).collect();
    let start = since
        .and_then(|sha| history.iter().position(|c| c.id == sha))
        .map_or(0, |pos| pos + 1);

    history
        .into_iter()
        .skip(start)
        .filter(|c| wanted.contains(&normalize_identity(&c.author)))
        .collect()
}

/// Reads extracted commit lists from the local data directory.
pub struct LocalCommitSource {
    root: PathBuf,
}

impl LocalCommitSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of the commit list for `repo`.
    #[must_use]
    pub fn commits_path(&self, repo: &RepoRef) -> PathBuf {
        self.root
            .join(&repo.platform)
            .join(&repo.owner)
            .join(&repo.repo)
            .join(COMMITS_FILE)
    }

    /// Load the full history of `repo`, oldest first.
    pub fn load_history(&self, repo: &RepoRef) -> Result<Vec<Commit>, SourceError> {
        let path = self.commits_path(repo);
        if !path.exists() {
            return Err(SourceError::NotExtracted(path));
        }
        let data = std::fs::read_to_string(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        let records: Vec<Value> = serde_json::from_str(&data)?;

        // Stored newest first
        let mut commits = records
            .iter()
            .map(parse_record)
            .collect::<Result<Vec<_>, _>>()?;
        commits.reverse();

        debug!("Loaded {} commits from {}", commits.len(), path.display());
        Ok(commits)
    }
}

impl CommitSource for LocalCommitSource {
    fn get_commits(
        &self,
        repo: &RepoRef,
        identities: &[String],
        since: Option<&str>,
    ) -> Result<Vec<Commit>, SourceError> {
        let history = self.load_history(repo)?;
        let commits = select(history, identities, since);
        info!(
            "{repo}: {} commits for [{}]{}",
            commits.len(),
            identities.join(", "),
            since.map(|s| format!(" since {s}")).unwrap_or_default()
        );
        Ok(commits)
    }
}

/// A fixed in-memory history, oldest first. Used by tests and demos.
#[derive(Default)]
pub struct StaticCommitSource {
    history: std::sync::RwLock<Vec<Commit>>,
}

impl StaticCommitSource {
    #[must_use]
    pub fn new(history: Vec<Commit>) -> Self {
        Self {
            history: std::sync::RwLock::new(history),
        }
    }

    /// Append newer commits to the history.
    pub fn push(&self, commits: impl IntoIterator<Item = Commit>) {
        self.history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .extend(commits);
    }
}

impl CommitSource for StaticCommitSource {
    fn get_commits(
        &self,
        _repo: &RepoRef,
        identities: &[String],
        since: Option<&str>,
    ) -> Result<Vec<Commit>, SourceError> {
        let history = self
            .history
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        Ok(select(history, identities, since))
    }
}

// ── Author listing ───────────────────────────────────────────────────

/// Commit activity of one author in a history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorStats {
    /// Spelling of the author's earliest commit.
    pub author: String,
    pub commits: usize,
    pub first_commit: DateTime<Utc>,
    pub last_commit: DateTime<Utc>,
}

/// Authors of `history`, merged case-insensitively, most active first.
#[must_use]
pub fn author_stats(history: &[Commit]) -> Vec<AuthorStats> {
    let mut by_key: HashMap<String, AuthorStats> = HashMap::new();
    for commit in history.iter().filter(|c| !c.author.trim().is_empty()) {
        by_key
            .entry(normalize_identity(&commit.author))
            .and_modify(|stats| {
                stats.commits += 1;
                stats.first_commit = stats.first_commit.min(commit.timestamp);
                stats.last_commit = stats.last_commit.max(commit.timestamp);
            })
            .or_insert_with(|| AuthorStats {
                author: commit.author.trim().to_string(),
                commits: 1,
                first_commit: commit.timestamp,
                last_commit: commit.timestamp,
            });
    }

    let mut authors: Vec<AuthorStats> = by_key.into_values().collect();
    authors.sort_by(|a, b| b.commits.cmp(&a.commits).then_with(|| a.author.cmp(&b.author)));
    authors
}

// ── Record parsing ───────────────────────────────────────────────────

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    path.iter().try_fold(value, |v, key| v.get(key)).and_then(Value::as_u64)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Naive ISO timestamps are taken as UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse one record in either the hosting-API shape (`sha`, `commit.author`)
/// or the flat extraction shape (`hash`, `author`, `date`).
fn parse_record(record: &Value) -> Result<Commit, SourceError> {
    // A missing id is left empty and rejected by planning validation
    let id = str_at(record, &["sha"])
        .or_else(|| str_at(record, &["hash"]))
        .or_else(|| str_at(record, &["id"]))
        .unwrap_or_default()
        .to_string();

    let author = str_at(record, &["author"])
        .or_else(|| str_at(record, &["commit", "author", "name"]))
        .or_else(|| str_at(record, &["commit", "committer", "name"]))
        .or_else(|| str_at(record, &["author", "name"]))
        .or_else(|| str_at(record, &["committer", "name"]))
        .unwrap_or_default()
        .to_string();

    let raw_date = str_at(record, &["commit", "author", "date"])
        .or_else(|| str_at(record, &["date"]))
        .or_else(|| str_at(record, &["timestamp"]))
        .ok_or_else(|| SourceError::Malformed(format!("commit {id:?} has no date")))?;
    let timestamp = parse_timestamp(raw_date)
        .ok_or_else(|| SourceError::Malformed(format!("commit {id:?} has bad date {raw_date:?}")))?;

    let message = str_at(record, &["commit", "message"])
        .or_else(|| str_at(record, &["message"]))
        .unwrap_or_default()
        .to_string();

    let summary = str_at(record, &["summary"])
        .or_else(|| str_at(record, &["diff"]))
        .unwrap_or_default()
        .to_string();

    let files: Vec<FileChange> = match record.get("files") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|f| serde_json::from_value(f.clone()).ok())
            .collect(),
        _ => Vec::new(),
    };

    let additions = u64_at(record, &["stats", "additions"])
        .or_else(|| u64_at(record, &["additions"]))
        .unwrap_or_else(|| files.iter().map(|f| f.additions).sum());
    let deletions = u64_at(record, &["stats", "deletions"])
        .or_else(|| u64_at(record, &["deletions"]))
        .unwrap_or_else(|| files.iter().map(|f| f.deletions).sum());
    let files_changed = u64_at(record, &["files_changed"])
        .map_or(files.len(), |n| n as usize);

    let languages = match record.get("languages") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Ok(Commit {
        id,
        author,
        timestamp,
        message,
        summary,
        files,
        files_changed,
        additions,
        deletions,
        languages,
    })
}
