//! File-backed trajectory cache: one JSON record per (rubric, group).
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{TrajectoryCache, TrajectoryError};
use crate::model::IdentityGroup;

/// Longest file or directory name the store produces.
const MAX_NAME_BYTES: usize = 200;

pub struct TrajectoryStore {
    root: PathBuf,
}

/// Reversible file-name form of `raw`: bytes outside `[a-z0-9-_,@+]` become
/// `%XX`, so distinct keys never share a file.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || matches!(byte, b'-' | b'_' | b',' | b'@' | b'+') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Split an escaped name into directory levels of at most [`MAX_NAME_BYTES`].
fn segments(escaped: &str) -> Vec<&str> {
    // Escaped names are ASCII, so byte offsets are char boundaries
    let mut rest = escaped;
    let mut parts = Vec::new();
    while rest.len() > MAX_NAME_BYTES {
        let (head, tail) = rest.split_at(MAX_NAME_BYTES);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);
    parts
}

fn io_error(path: &Path, source: std::io::Error) -> TrajectoryError {
    TrajectoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl TrajectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self, plugin_id: &str, group: &IdentityGroup) -> PathBuf {
        let mut path = self.root.join(escape(plugin_id));
        let escaped = escape(&group.key());
        let parts = segments(&escaped);
        let (file, dirs) = parts.split_last().unwrap_or((&"", &[]));
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{file}.json"));
        path
    }

    /// Load the record for `group`; `None` if there is none yet.
    pub fn load(&self, plugin_id: &str, group: &IdentityGroup) -> Result<Option<TrajectoryCache>, TrajectoryError> {
        let path = self.path(plugin_id, group);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|source| TrajectoryError::Corrupt { path, source })
    }

    /// Write the record atomically via a temp file and rename.
    pub fn save(&self, group: &IdentityGroup, cache: &TrajectoryCache) -> Result<(), TrajectoryError> {
        let path = self.path(&cache.plugin_id, group);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let data = serde_json::to_string_pretty(cache).map_err(|source| TrajectoryError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&path, e));
        }

        debug!(
            "Saved trajectory {} ({} checkpoints)",
            path.display(),
            cache.total_checkpoints
        );
        Ok(())
    }

    /// Delete the record for `group`. Returns whether one existed.
    pub fn remove(&self, plugin_id: &str, group: &IdentityGroup) -> Result<bool, TrajectoryError> {
        let path = self.path(plugin_id, group);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed trajectory {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLUGIN: &str = "zgc_ai_native_2026";

    fn group() -> IdentityGroup {
        IdentityGroup::new(["Alice", "alice/smith"]).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(temp.path());
        assert!(store.load(PLUGIN, &group()).unwrap().is_none());

        let cache = TrajectoryCache::new(&group(), PLUGIN);
        store.save(&group(), &cache).unwrap();

        let path = store.path(PLUGIN, &group());
        assert!(path.ends_with("zgc_ai_native_2026/alice,alice%2Fsmith.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load(PLUGIN, &group()).unwrap().unwrap();
        assert_eq!(loaded, cache);

        assert!(store.remove(PLUGIN, &group()).unwrap());
        assert!(!store.remove(PLUGIN, &group()).unwrap());
        assert!(store.load(PLUGIN, &group()).unwrap().is_none());
    }

    #[test]
    fn test_distinct_keys_get_distinct_files() {
        let store = TrajectoryStore::new("/tmp/trajectories");
        let slash = IdentityGroup::new(["a/b"]).unwrap();
        let underscore = IdentityGroup::new(["a_b"]).unwrap();
        let dots = IdentityGroup::new([".."]).unwrap();
        assert_ne!(store.path(PLUGIN, &slash), store.path(PLUGIN, &underscore));
        assert!(store.path(PLUGIN, &dots).ends_with("%2E%2E.json"));
        assert_ne!(store.path(PLUGIN, &slash), store.path("zgc_simple", &slash));
    }

    #[test]
    fn test_long_group_key_is_split_into_directories() {
        let store = TrajectoryStore::new("/tmp/trajectories");
        let names: Vec<String> = (0..40).map(|i| format!("contributor-number-{i}")).collect();
        let group = IdentityGroup::new(&names).unwrap();
        let path = store.path(PLUGIN, &group);
        assert!(path.components().count() > 4);
        assert!(
            path.iter()
                .all(|c| c.len() <= MAX_NAME_BYTES + ".json".len()),
            "{}",
            path.display()
        );
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(temp.path());
        let path = store.path(PLUGIN, &group());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{").unwrap();
        assert!(matches!(
            store.load(PLUGIN, &group()),
            Err(TrajectoryError::Corrupt { .. })
        ));
    }
}
