use std::fmt;

use serde::Serialize;

use crate::model::normalize_identity;
use crate::source::RepoRef;

/// Prefix of keys holding alias-merged evaluations.
pub const ALIAS_KEY_PREFIX: &str = "aliases:";

/// Address of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub platform: String,
    pub owner: String,
    pub repo: String,
    pub plugin_id: String,
    /// Normalized identity, or `aliases:<ids>` for a group.
    pub identity_key: String,
}

impl CacheKey {
    /// Key for a single identity.
    #[must_use]
    pub fn for_identity(repo: &RepoRef, plugin_id: &str, identity: &str) -> Self {
        Self::with_identity_key(repo, plugin_id, normalize_identity(identity))
    }

    /// Key for an alias group given its sorted, normalized member key.
    #[must_use]
    pub fn for_group(repo: &RepoRef, plugin_id: &str, group_key: &str) -> Self {
        Self::with_identity_key(repo, plugin_id, format!("{ALIAS_KEY_PREFIX}{group_key}"))
    }

    fn with_identity_key(repo: &RepoRef, plugin_id: &str, identity_key: String) -> Self {
        Self {
            platform: repo.platform.clone(),
            owner: repo.owner.clone(),
            repo: repo.repo.clone(),
            plugin_id: plugin_id.to_string(),
            identity_key,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}@{}",
            self.platform, self.owner, self.repo, self.identity_key, self.plugin_id
        )
    }
}

/// Listing row for a cached evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedSummary {
    pub identity_key: String,
    pub plugin_id: String,
    pub last_commit_id: Option<String>,
    pub total_commits: usize,
}
