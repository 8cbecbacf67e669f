/// Configuration module for commit-judge.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::ChunkingStrategy;
use crate::planner::ChunkBudget;

// ── Default value functions ──────────────────────────────────────────

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_db_file() -> String {
    "evaluations.db".to_string()
}

fn default_trajectory_subdir() -> String {
    "trajectories".to_string()
}

fn default_plugin() -> String {
    crate::rubric::DEFAULT_RUBRIC_ID.to_string()
}

fn default_max_parallel_workers() -> usize {
    3
}

fn default_max_commits_per_chunk() -> usize {
    20
}

fn default_max_bytes_per_chunk() -> usize {
    60_000
}

fn default_chunk_timeout_secs() -> u64 {
    300
}

fn default_period_length_days() -> u32 {
    14
}

fn default_min_commits_per_checkpoint() -> usize {
    10
}

fn default_provider() -> String {
    "openrouter".to_string()
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "anthropic/claude-haiku-4.5".to_string()
}

fn default_api_key_env() -> String {
    "OPEN_ROUTER_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    120
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root for commit data, the evaluation cache and trajectories. An empty
    /// string selects the platform data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Evaluation cache file, relative to `data_dir` unless absolute.
    #[serde(default = "default_db_file")]
    pub db_file: String,

    #[serde(default = "default_trajectory_subdir")]
    pub trajectory_dir: String,

    #[serde(default = "default_plugin")]
    pub default_plugin: String,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub trajectory: TrajectoryConfig,

    #[serde(default)]
    pub judge: JudgeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub parallel_chunking: bool,

    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,

    #[serde(default)]
    pub chunk_size_budget: ChunkBudgetConfig,

    /// Wall-clock limit for a single judge call.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkBudgetConfig {
    #[serde(default = "default_max_commits_per_chunk")]
    pub max_commits: usize,

    #[serde(default = "default_max_bytes_per_chunk")]
    pub max_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrajectoryConfig {
    #[serde(default = "default_period_length_days")]
    pub period_length_days: u32,

    #[serde(default = "default_min_commits_per_checkpoint")]
    pub min_commits_per_checkpoint: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JudgeConfig {
    /// `openrouter` or `mock`.
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_file: default_db_file(),
            trajectory_dir: default_trajectory_subdir(),
            default_plugin: default_plugin(),
            evaluation: EvaluationConfig::default(),
            trajectory: TrajectoryConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            parallel_chunking: false,
            max_parallel_workers: default_max_parallel_workers(),
            chunk_size_budget: ChunkBudgetConfig::default(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
        }
    }
}

impl Default for ChunkBudgetConfig {
    fn default() -> Self {
        Self {
            max_commits: default_max_commits_per_chunk(),
            max_bytes: default_max_bytes_per_chunk(),
        }
    }
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            period_length_days: default_period_length_days(),
            min_commits_per_checkpoint: default_min_commits_per_checkpoint(),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_url: default_api_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl EvaluationConfig {
    #[must_use]
    pub fn strategy(&self) -> ChunkingStrategy {
        ChunkingStrategy::from_parallel_flag(self.parallel_chunking)
    }

    #[must_use]
    pub fn budget(&self) -> ChunkBudget {
        ChunkBudget {
            max_commits: self.chunk_size_budget.max_commits,
            max_bytes: self.chunk_size_budget.max_bytes,
        }
    }

    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let eval = &self.evaluation;
        anyhow::ensure!(
            eval.max_parallel_workers > 0,
            "evaluation.max_parallel_workers must be positive"
        );
        anyhow::ensure!(
            eval.chunk_size_budget.max_commits > 0,
            "evaluation.chunk_size_budget.max_commits must be positive"
        );
        anyhow::ensure!(
            eval.chunk_size_budget.max_bytes > 0,
            "evaluation.chunk_size_budget.max_bytes must be positive"
        );
        anyhow::ensure!(
            eval.chunk_timeout_secs > 0,
            "evaluation.chunk_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.trajectory.period_length_days > 0,
            "trajectory.period_length_days must be positive"
        );
        anyhow::ensure!(
            self.trajectory.min_commits_per_checkpoint > 0,
            "trajectory.min_commits_per_checkpoint must be positive"
        );
        anyhow::ensure!(
            matches!(self.judge.provider.as_str(), "openrouter" | "mock"),
            "judge.provider must be \"openrouter\" or \"mock\", got {:?}",
            self.judge.provider
        );
        Ok(())
    }

    /// Resolved data root.
    #[must_use]
    pub fn data_root(&self) -> PathBuf {
        if self.data_dir.trim().is_empty() {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("commit-judge")
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_root().join(&self.db_file)
    }

    #[must_use]
    pub fn trajectory_root(&self) -> PathBuf {
        self.data_root().join(&self.trajectory_dir)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.evaluation.parallel_chunking);
        assert_eq!(config.evaluation.max_parallel_workers, 3);
        assert_eq!(config.evaluation.chunk_size_budget.max_commits, 20);
        assert_eq!(config.trajectory.period_length_days, 14);
        assert_eq!(config.trajectory.min_commits_per_checkpoint, 10);
        assert_eq!(config.judge.provider, "openrouter");
        assert_eq!(config.evaluation.strategy(), ChunkingStrategy::Sequential);
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"evaluation": {"parallel_chunking": true, "max_parallel_workers": 5}, "data_dir": "./x"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.evaluation.parallel_chunking);
        assert_eq!(config.evaluation.max_parallel_workers, 5);
        assert_eq!(config.evaluation.strategy(), ChunkingStrategy::Parallel);
        // Other fields should have defaults
        assert_eq!(config.evaluation.chunk_timeout_secs, 300);
        assert_eq!(config.trajectory.min_commits_per_checkpoint, 10);
        assert_eq!(config.db_path(), PathBuf::from("./x").join("evaluations.db"));
    }

    #[test]
    fn test_validate_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_workers() {
        let mut config = Config::default();
        config.evaluation.max_parallel_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_provider() {
        let mut config = Config::default();
        config.judge.provider = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_custom_path_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.json");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.evaluation.max_parallel_workers, 3);
        assert!(!path.exists(), "templates are only generated for config.json");
    }

    #[test]
    fn test_load_invalid_json_falls_back() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.trajectory.period_length_days, 14);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.default_plugin, config.default_plugin);
        assert_eq!(parsed.judge.model, config.judge.model);
    }
}
