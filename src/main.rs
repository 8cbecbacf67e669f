use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commit_judge::config::Config;
use commit_judge::db::Db;
use commit_judge::evaluator::{EvaluateRequest, EvaluationService, EvaluationSettings};
use commit_judge::judge::Judge;
use commit_judge::judge::mock::MockJudge;
use commit_judge::judge::openrouter::OpenRouterJudge;
use commit_judge::model::{ChunkingStrategy, IdentityGroup};
use commit_judge::rubric::RubricRegistry;
use commit_judge::source::{CommitSource, LocalCommitSource, RepoRef, author_stats, parse_repo_url};
use commit_judge::trajectory::{TrajectoryService, TrajectorySettings, TrajectoryStore};
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "commit-judge", version)]
#[command(about = "Incremental, cached LLM evaluation of contributor commit history")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, short, default_value = "config.json")]
    config: String,

    /// Use the offline mock judge instead of the configured provider
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one author identity (or several aliases) in a repository
    Evaluate {
        /// Repository url (GitHub or Gitee)
        repo: String,
        /// Author identities; more than one are merged as aliases
        #[arg(required = true)]
        identities: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Merge several identities of one person
    Aggregate {
        repo: String,
        #[arg(required = true, num_args = 2..)]
        identities: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Create growth checkpoints for an identity group when enough commits exist
    Checkpoint {
        /// Repository to track; repeat for several. Tracked ones are remembered
        #[arg(long = "repo")]
        repos: Vec<String>,
        #[arg(required = true)]
        identities: Vec<String>,
        #[arg(long, default_value = "")]
        plugin: String,
    },
    /// Delete the stored trajectory of an identity group
    ClearTrajectory {
        #[arg(required = true)]
        identities: Vec<String>,
        #[arg(long, default_value = "")]
        plugin: String,
    },
    /// List the authors of a repository by commit count
    Authors { repo: String },
    /// Inspect or prune the evaluation cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// List available scoring plugins
    Plugins,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List cached evaluations of a repository
    List { repo: String },
    /// Drop cached evaluations so the next run starts over
    Forget {
        repo: String,
        #[arg(required = true)]
        identities: Vec<String>,
        #[arg(long, default_value = "")]
        plugin: String,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Scoring plugin id (default from config)
    #[arg(long, default_value = "")]
    plugin: String,
    /// Chunk scheduling mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Max concurrent judge calls in parallel mode
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Sequential,
    Parallel,
}

impl From<Mode> for ChunkingStrategy {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sequential => ChunkingStrategy::Sequential,
            Mode::Parallel => ChunkingStrategy::Parallel,
        }
    }
}

#[derive(Serialize)]
struct PluginInfo<'a> {
    id: &'a str,
    version: &'a str,
    dimensions: Vec<&'static str>,
    default: bool,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to render output")?);
    Ok(())
}

fn build_judge(config: &Config, force_mock: bool) -> Result<Arc<dyn Judge>> {
    if force_mock || config.judge.provider == "mock" {
        info!("Using mock judge");
        return Ok(Arc::new(MockJudge::new()));
    }
    let judge = OpenRouterJudge::from_config(&config.judge).context("failed to configure judge")?;
    info!("Using judge model {}", config.judge.model);
    Ok(Arc::new(judge))
}

fn trajectories(evaluator: Arc<EvaluationService>, config: &Config) -> TrajectoryService {
    TrajectoryService::new(
        evaluator,
        TrajectoryStore::new(config.trajectory_root()),
        TrajectorySettings::from(&config.trajectory),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let config = Config::load(&cli.config)?;
    config.validate().context("invalid configuration")?;

    let registry = Arc::new(RubricRegistry::builtin().with_default(&config.default_plugin)?);

    if let Command::Plugins = cli.command {
        let default_id = registry.resolve("")?.id().to_string();
        let plugins: Vec<PluginInfo> = registry
            .list()
            .iter()
            .map(|r| PluginInfo {
                id: r.id(),
                version: r.version(),
                dimensions: r.dimension_keys(),
                default: r.id() == default_id,
            })
            .collect();
        return print_json(&plugins);
    }

    // 2. Init cache, source and judge
    let data_root = config.data_root();
    let db = Db::open(config.db_path()).context("Failed to open evaluation cache")?;
    let db = Arc::new(TokioMutex::new(db));
    let source = Arc::new(LocalCommitSource::new(&data_root));
    let judge = build_judge(&config, cli.mock)?;

    let evaluator = Arc::new(EvaluationService::new(
        db,
        Arc::clone(&source) as Arc<dyn CommitSource>,
        judge,
        registry,
        EvaluationSettings::from(&config.evaluation),
    ));

    // 3. Run
    match cli.command {
        Command::Evaluate { repo, identities, run } | Command::Aggregate { repo, identities, run } => {
            let request = EvaluateRequest {
                repo: parse_repo_url(&repo)?,
                identities,
                plugin: run.plugin,
                mode: run.mode.map(ChunkingStrategy::from),
                max_workers: run.workers,
            };
            let evaluation = evaluator.evaluate(&request).await?;
            print_json(&evaluation)
        }
        Command::Checkpoint {
            repos,
            identities,
            plugin,
        } => {
            let repos = repos
                .iter()
                .map(|url| parse_repo_url(url))
                .collect::<Result<Vec<RepoRef>, _>>()?;
            let group = IdentityGroup::new(&identities).context("no author identities given")?;
            let status = trajectories(evaluator, &config)
                .get_or_create_checkpoint(&repos, &group, &plugin)
                .await?;
            print_json(&status)
        }
        Command::ClearTrajectory { identities, plugin } => {
            let group = IdentityGroup::new(&identities).context("no author identities given")?;
            let removed = trajectories(evaluator, &config).clear(&group, &plugin).await?;
            print_json(&serde_json::json!({ "group": group.label(), "removed": removed }))
        }
        Command::Authors { repo } => {
            let history = source.load_history(&parse_repo_url(&repo)?)?;
            print_json(&author_stats(&history))
        }
        Command::Cache {
            command: CacheCommand::List { repo },
        } => print_json(&evaluator.cached(&parse_repo_url(&repo)?).await?),
        Command::Cache {
            command: CacheCommand::Forget {
                repo,
                identities,
                plugin,
            },
        } => {
            let removed = evaluator
                .forget(&parse_repo_url(&repo)?, &identities, &plugin)
                .await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Command::Plugins => Ok(()),
    }
}
