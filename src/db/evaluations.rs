use super::{Db, models::*};
use crate::model::Evaluation;
use crate::source::RepoRef;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache payload error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("refusing to replace {key}: total_commits_evaluated would drop from {stored} to {incoming}")]
    NonMonotonic {
        key: String,
        stored: usize,
        incoming: usize,
    },
}

impl Db {
    /// Returns the cached evaluation for `key`, if any
    pub fn get_evaluation(&self, key: &CacheKey) -> Result<Option<Evaluation>, CacheError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                r#"
                SELECT payload FROM evaluations
                WHERE platform = ? AND owner = ? AND repo = ? AND plugin_id = ? AND identity_key = ?
                "#,
                params![key.platform, key.owner, key.repo, key.plugin_id, key.identity_key],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(CacheError::from))
            .transpose()
    }

    /// Atomically inserts or replaces the evaluation stored under `key`.
    ///
    /// The replacement is rejected if it would lower `total_commits_evaluated`.
    pub fn put_evaluation(&mut self, key: &CacheKey, evaluation: &Evaluation) -> Result<(), CacheError> {
        let payload = serde_json::to_string(evaluation)?;
        let tx = self.conn.transaction()?;

        let stored: Option<i64> = tx
            .query_row(
                r#"
                SELECT total_commits FROM evaluations
                WHERE platform = ? AND owner = ? AND repo = ? AND plugin_id = ? AND identity_key = ?
                "#,
                params![key.platform, key.owner, key.repo, key.plugin_id, key.identity_key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(stored) = stored {
            let stored = stored as usize;
            if evaluation.total_commits_evaluated < stored {
                return Err(CacheError::NonMonotonic {
                    key: key.to_string(),
                    stored,
                    incoming: evaluation.total_commits_evaluated,
                });
            }
        }

        tx.execute(
            r#"
            INSERT INTO evaluations
                (platform, owner, repo, plugin_id, identity_key, payload, last_commit_id, total_commits, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, owner, repo, plugin_id, identity_key) DO UPDATE SET
                payload = excluded.payload,
                last_commit_id = excluded.last_commit_id,
                total_commits = excluded.total_commits,
                updated_at = excluded.updated_at
            "#,
            params![
                key.platform,
                key.owner,
                key.repo,
                key.plugin_id,
                key.identity_key,
                payload,
                evaluation.last_commit_id,
                evaluation.total_commits_evaluated as i64,
                Utc::now(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Deletes a cached evaluation, returning whether one existed
    pub fn delete_evaluation(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let rows = self.conn.execute(
            r#"
            DELETE FROM evaluations
            WHERE platform = ? AND owner = ? AND repo = ? AND plugin_id = ? AND identity_key = ?
            "#,
            params![key.platform, key.owner, key.repo, key.plugin_id, key.identity_key],
        )?;
        Ok(rows > 0)
    }

    /// Lists cached evaluations for a repository
    pub fn list_evaluations(&self, repo: &RepoRef) -> Result<Vec<CachedSummary>, CacheError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT identity_key, plugin_id, last_commit_id, total_commits
            FROM evaluations
            WHERE platform = ? AND owner = ? AND repo = ?
            ORDER BY identity_key, plugin_id
            "#,
        )?;
        let rows = stmt.query_map(params![repo.platform, repo.owner, repo.repo], |row| {
            let total: i64 = row.get(3)?;
            Ok(CachedSummary {
                identity_key: row.get(0)?,
                plugin_id: row.get(1)?,
                last_commit_id: row.get(2)?,
                total_commits: total as usize,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
