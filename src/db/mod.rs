//! Evaluation cache backed by SQLite
use rusqlite::{Connection, Result};
use std::path::Path;
use tracing::info;

pub mod evaluations;
pub mod models;

pub use evaluations::CacheError;
pub use models::{CacheKey, CachedSummary};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    plugin_id TEXT NOT NULL,
    identity_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    last_commit_id TEXT,
    total_commits INTEGER NOT NULL DEFAULT 0,
    updated_at DATETIME NOT NULL,
    UNIQUE(platform, owner, repo, plugin_id, identity_key)
);

CREATE INDEX IF NOT EXISTS idx_eval_repo ON evaluations(platform, owner, repo);
CREATE INDEX IF NOT EXISTS idx_eval_plugin ON evaluations(plugin_id);
"#;

/// A wrapper around a SQLite connection initialized with the cache schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing evaluation cache: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Surfaced by Connection::open below if this fails
            let _ = std::fs::create_dir_all(parent);
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}
