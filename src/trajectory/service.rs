use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::accumulator::{group_by_period, start_of_day};
use super::{
    Checkpoint, CommitsRange, PeriodClock, TrajectoryCache, TrajectoryError, TrajectoryStore,
    growth_comparison,
};
use crate::config::TrajectoryConfig;
use crate::evaluator::EvaluationService;
use crate::locks::KeyedLocks;
use crate::model::{Commit, IdentityGroup};
use crate::rubric::Rubric;
use crate::source::{RepoRef, parse_repo_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrajectorySettings {
    pub period_length_days: u32,
    pub min_commits_per_checkpoint: usize,
}

impl Default for TrajectorySettings {
    fn default() -> Self {
        Self {
            period_length_days: 14,
            min_commits_per_checkpoint: 10,
        }
    }
}

impl From<&TrajectoryConfig> for TrajectorySettings {
    fn from(config: &TrajectoryConfig) -> Self {
        Self {
            period_length_days: config.period_length_days,
            min_commits_per_checkpoint: config.min_commits_per_checkpoint,
        }
    }
}

/// Result of [`TrajectoryService::get_or_create_checkpoint`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// One or more checkpoints were appended.
    Created {
        checkpoints: Vec<Checkpoint>,
        /// Commits accumulated toward the next checkpoint.
        commits_pending: usize,
    },
    /// Not enough commits yet.
    Pending {
        commits_needed: usize,
        accumulated: usize,
        latest: Option<Checkpoint>,
    },
}

pub struct TrajectoryService {
    evaluator: Arc<EvaluationService>,
    store: TrajectoryStore,
    settings: TrajectorySettings,
    locks: KeyedLocks,
}

/// Commits of all tracked repositories, merged chronologically.
struct MergedHistory {
    urls: Vec<String>,
    /// Every commit of the group, for resolving accumulated ids.
    all: Vec<Commit>,
    /// Commits after each repository's sync point, oldest first.
    new: Vec<Commit>,
    /// `(repository index, position among that repository's new commits)`
    /// for each entry of `new`.
    origin: Vec<(usize, usize)>,
    /// Ids of each repository's new commits, oldest first.
    new_ids: Vec<Vec<String>>,
}

impl TrajectoryService {
    pub fn new(evaluator: Arc<EvaluationService>, store: TrajectoryStore, settings: TrajectorySettings) -> Self {
        Self {
            evaluator,
            store,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Stored trajectory of `group` under `plugin`, if any.
    pub fn trajectory(&self, group: &IdentityGroup, plugin: &str) -> Result<Option<TrajectoryCache>, TrajectoryError> {
        let rubric = self.evaluator.registry().resolve(plugin)?;
        self.store.load(rubric.id(), group)
    }

    /// Delete the trajectory of `group` under `plugin`. Returns whether one existed.
    pub async fn clear(&self, group: &IdentityGroup, plugin: &str) -> Result<bool, TrajectoryError> {
        let rubric = self.evaluator.registry().resolve(plugin)?;
        let path = self.store.path(rubric.id(), group);
        let _guard = self.locks.lock(&path.to_string_lossy()).await;
        self.store.remove(rubric.id(), group)
    }

    /// Observe commits since the last sync and emit every checkpoint that is due.
    ///
    /// `repos` are added to the repositories the trajectory already tracks;
    /// the commits of all of them are merged by timestamp. The trajectory is
    /// saved even when a checkpoint evaluation fails, so already created
    /// checkpoints and the accumulated state survive and the next call retries.
    pub async fn get_or_create_checkpoint(
        &self,
        repos: &[RepoRef],
        group: &IdentityGroup,
        plugin: &str,
    ) -> Result<CheckpointStatus, TrajectoryError> {
        let rubric = self.evaluator.registry().resolve(plugin)?;
        let path = self.store.path(rubric.id(), group);
        let _guard = self.locks.lock(&path.to_string_lossy()).await;

        let mut trajectory = self
            .store
            .load(rubric.id(), group)?
            .unwrap_or_else(|| TrajectoryCache::new(group, rubric.id()));
        trajectory.track(repos);
        if trajectory.repo_urls.is_empty() {
            return Err(TrajectoryError::NoRepositories(group.label()));
        }

        let history = self.merged_history(&trajectory, group)?;

        let mut created = Vec::new();
        let advanced = self
            .advance(&mut trajectory, group, rubric, &history, &mut created)
            .await;
        self.store.save(group, &trajectory)?;
        advanced?;

        let min = self.settings.min_commits_per_checkpoint;
        let state = &trajectory.accumulation_state;
        if created.is_empty() {
            info!(
                "{}: {} commit(s) accumulated, {} more needed",
                group.label(),
                state.len(),
                state.commits_needed(min)
            );
            Ok(CheckpointStatus::Pending {
                commits_needed: state.commits_needed(min),
                accumulated: state.len(),
                latest: trajectory.latest().cloned(),
            })
        } else {
            Ok(CheckpointStatus::Created {
                checkpoints: created,
                commits_pending: state.len(),
            })
        }
    }

    fn merged_history(
        &self,
        trajectory: &TrajectoryCache,
        group: &IdentityGroup,
    ) -> Result<MergedHistory, TrajectoryError> {
        let mut history = MergedHistory {
            urls: trajectory.repo_urls.clone(),
            all: Vec::new(),
            new: Vec::new(),
            origin: Vec::new(),
            new_ids: Vec::with_capacity(trajectory.repo_urls.len()),
        };

        for (repo_index, url) in trajectory.repo_urls.iter().enumerate() {
            let repo = parse_repo_url(url)?;
            let commits = self
                .evaluator
                .source
                .get_commits(&repo, group.identities(), None)?;

            let start = trajectory
                .synced_shas
                .get(url)
                .and_then(|sha| commits.iter().position(|c| &c.id == sha))
                .map_or(0, |pos| pos + 1);
            let fresh = &commits[start..];
            debug!("{repo}: {} new commit(s) for {}", fresh.len(), group.label());

            history.new_ids.push(fresh.iter().map(|c| c.id.clone()).collect());
            history.origin.extend((0..fresh.len()).map(|pos| (repo_index, pos)));
            history.new.extend_from_slice(fresh);
            history.all.extend(commits);
        }

        // Stable: equal timestamps keep repository order
        let mut order: Vec<usize> = (0..history.new.len()).collect();
        order.sort_by_key(|&i| history.new[i].timestamp);
        history.new = order.iter().map(|&i| history.new[i].clone()).collect();
        history.origin = order.iter().map(|&i| history.origin[i]).collect();

        Ok(history)
    }

    async fn advance(
        &self,
        trajectory: &mut TrajectoryCache,
        group: &IdentityGroup,
        rubric: Arc<dyn Rubric>,
        history: &MergedHistory,
        created: &mut Vec<Checkpoint>,
    ) -> Result<(), TrajectoryError> {
        let min = self.settings.min_commits_per_checkpoint;
        let by_id: HashMap<&str, &Commit> = history.all.iter().map(|c| (c.id.as_str(), c)).collect();

        // A state left ready by a failed call goes first
        if trajectory.accumulation_state.is_ready(min) {
            created.push(self.emit(trajectory, group, Arc::clone(&rubric), &by_id).await?);
        }

        let new_commits = &history.new;
        if new_commits.is_empty() {
            return Ok(());
        }

        let state = &mut trajectory.accumulation_state;
        let repo_start = match state.repo_start_date {
            Some(date) => date,
            None => {
                let earliest = new_commits
                    .iter()
                    .map(|c| c.timestamp)
                    .min()
                    .unwrap_or_else(Utc::now);
                let date = start_of_day(earliest);
                state.repo_start_date = Some(date);
                date
            }
        };
        let clock = PeriodClock::new(repo_start, self.settings.period_length_days);

        // A repository's sync point only moves past a fully observed prefix
        let mut observed: Vec<Vec<bool>> = history.new_ids.iter().map(|ids| vec![false; ids.len()]).collect();
        let mut newest: Option<usize> = None;
        for (period, commits) in group_by_period(&clock, new_commits) {
            trajectory
                .accumulation_state
                .observe(&clock, period, commits.iter().map(|(_, c)| c.id.as_str()));

            for (pos, _) in &commits {
                let (repo_index, repo_pos) = history.origin[*pos];
                observed[repo_index][repo_pos] = true;
            }
            newest = newest.max(commits.iter().map(|(pos, _)| *pos).max());
            mark_synced(trajectory, history, &observed, newest);

            if trajectory.accumulation_state.is_ready(min) {
                created.push(self.emit(trajectory, group, Arc::clone(&rubric), &by_id).await?);
            }
        }

        Ok(())
    }

    /// Evaluate the accumulated commits into the next checkpoint.
    async fn emit(
        &self,
        trajectory: &mut TrajectoryCache,
        group: &IdentityGroup,
        rubric: Arc<dyn Rubric>,
        by_id: &HashMap<&str, &Commit>,
    ) -> Result<Checkpoint, TrajectoryError> {
        let state = trajectory.accumulation_state.clone();

        let mut commits: Vec<Commit> = Vec::with_capacity(state.len());
        let mut missing = Vec::new();
        for id in &state.accumulated_commit_ids {
            match by_id.get(id.as_str()) {
                Some(commit) => commits.push((*commit).clone()),
                None => missing.push(id.as_str()),
            }
        }
        if !missing.is_empty() {
            warn!("{}: {} accumulated commit(s) missing from history", group.label(), missing.len());
        }
        let (Some(first), Some(last)) = (commits.first(), commits.last()) else {
            return Err(TrajectoryError::MissingCommits(missing.join(", ")));
        };
        let (start_sha, end_sha) = (first.id.clone(), last.id.clone());

        let previous = trajectory.latest();
        let run = self.evaluator.run_options(None, None);
        let evaluation = self
            .evaluator
            .judge_commits(&group.label(), &commits, rubric, previous.map(|c| &c.evaluation), run)
            .await?;

        let checkpoint = Checkpoint {
            checkpoint_id: trajectory.next_checkpoint_id(),
            created_at: Utc::now(),
            commits_range: CommitsRange {
                start_sha,
                end_sha,
                commit_count: commits.len(),
                period_start: state.period_start,
                period_end: state.period_end,
                accumulated_from_periods: state.accumulated_from_periods,
            },
            growth_comparison: previous
                .map(|p| growth_comparison(p.checkpoint_id, &p.evaluation.scores, &evaluation.scores)),
            previous_checkpoint_id: previous.map(|p| p.checkpoint_id),
            evaluation,
            aliases_used: group.identities().to_vec(),
        };

        info!(
            "{}: checkpoint #{} over {} commits from {} period(s)",
            group.label(),
            checkpoint.checkpoint_id,
            checkpoint.commits_range.commit_count,
            checkpoint.commits_range.accumulated_from_periods
        );

        trajectory.push_checkpoint(checkpoint.clone());
        trajectory.accumulation_state.reset();
        Ok(checkpoint)
    }
}

/// Move each repository's sync point to the end of its observed prefix.
fn mark_synced(
    trajectory: &mut TrajectoryCache,
    history: &MergedHistory,
    observed: &[Vec<bool>],
    newest: Option<usize>,
) {
    for (repo_index, seen) in observed.iter().enumerate() {
        let prefix = seen.iter().take_while(|s| **s).count();
        if prefix > 0 {
            trajectory.synced_shas.insert(
                history.urls[repo_index].clone(),
                history.new_ids[repo_index][prefix - 1].clone(),
            );
        }
    }
    if let Some(pos) = newest {
        trajectory.last_synced_sha = Some(history.new[pos].id.clone());
        trajectory.last_synced_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::evaluator::EvaluationSettings;
    use crate::judge::mock::MockJudge;
    use crate::rubric::RubricRegistry;
    use crate::source::{CommitSource, SourceError, StaticCommitSource};
    use chrono::{DateTime, Duration, TimeZone};
    use tokio::sync::Mutex as TokioMutex;

    fn at(day: i64, n: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap() + Duration::days(day) + Duration::minutes(n as i64)
    }

    fn commits(prefix: &str, day: i64, count: usize) -> Vec<Commit> {
        (0..count)
            .map(|n| Commit {
                id: format!("{prefix}{n}"),
                author: "alice".to_string(),
                timestamp: at(day, n),
                message: format!("{prefix} work {n}"),
                summary: String::new(),
                files: Vec::new(),
                files_changed: 1,
                additions: 4,
                deletions: 1,
                languages: Vec::new(),
            })
            .collect()
    }

    /// One static history per repository.
    #[derive(Default)]
    struct MultiRepoSource {
        repos: HashMap<RepoRef, StaticCommitSource>,
    }

    impl CommitSource for MultiRepoSource {
        fn get_commits(
            &self,
            repo: &RepoRef,
            identities: &[String],
            since: Option<&str>,
        ) -> Result<Vec<Commit>, SourceError> {
            match self.repos.get(repo) {
                Some(source) => source.get_commits(repo, identities, since),
                None => Err(SourceError::NotExtracted(repo.to_string().into())),
            }
        }
    }

    fn service_with(source: Arc<dyn CommitSource>, judge: Arc<MockJudge>, root: &std::path::Path) -> TrajectoryService {
        let evaluator = EvaluationService::new(
            Arc::new(TokioMutex::new(Db::open_in_memory().unwrap())),
            source,
            judge,
            Arc::new(RubricRegistry::builtin()),
            EvaluationSettings::default(),
        );
        TrajectoryService::new(
            Arc::new(evaluator),
            TrajectoryStore::new(root),
            TrajectorySettings::default(),
        )
    }

    fn setup(source: Arc<StaticCommitSource>, judge: Arc<MockJudge>) -> (TrajectoryService, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let service = service_with(source, judge, temp.path());
        (service, temp)
    }

    fn repo() -> RepoRef {
        RepoRef::new("github", "octo", "hello")
    }

    fn group() -> IdentityGroup {
        IdentityGroup::new(["alice"]).unwrap()
    }

    #[tokio::test]
    async fn test_several_checkpoints_in_one_call() {
        let mut history = commits("a", 0, 10);
        history.extend(commits("b", 15, 12));
        history.extend(commits("c", 30, 3));
        let source = Arc::new(StaticCommitSource::new(history));
        let (service, _temp) = setup(source, Arc::new(MockJudge::new()));

        let status = service.get_or_create_checkpoint(&[repo()], &group(), "").await.unwrap();
        let CheckpointStatus::Created {
            checkpoints,
            commits_pending,
        } = status
        else {
            panic!("expected checkpoints");
        };
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].checkpoint_id, 1);
        assert_eq!(checkpoints[0].commits_range.commit_count, 10);
        assert!(checkpoints[0].growth_comparison.is_none());
        assert_eq!(checkpoints[1].checkpoint_id, 2);
        assert_eq!(checkpoints[1].previous_checkpoint_id, Some(1));
        assert_eq!(checkpoints[1].commits_range.start_sha, "b0");
        assert!(checkpoints[1].growth_comparison.is_some());
        assert_eq!(checkpoints[1].evaluation.total_commits_evaluated, 22);
        assert_eq!(commits_pending, 3);

        let stored = service.trajectory(&group(), "").unwrap().unwrap();
        assert_eq!(stored.total_checkpoints, 2);
        assert_eq!(stored.plugin_id, "zgc_ai_native_2026");
        assert_eq!(stored.last_synced_sha.as_deref(), Some("c2"));
        assert_eq!(stored.synced_shas.get(&repo().url()).map(String::as_str), Some("c2"));
    }

    #[tokio::test]
    async fn test_failed_checkpoint_is_retried() {
        let source = Arc::new(StaticCommitSource::new(commits("a", 0, 10)));
        let judge = Arc::new(MockJudge::new().failing_scores_containing("a work"));
        let (service, temp) = setup(source.clone(), judge);

        assert!(service.get_or_create_checkpoint(&[repo()], &group(), "").await.is_err());
        let stored = service.trajectory(&group(), "").unwrap().unwrap();
        assert_eq!(stored.accumulation_state.len(), 10);
        assert!(stored.checkpoints.is_empty());

        // Same store, healthy judge; the repository is remembered
        let retry = service_with(source, Arc::new(MockJudge::new()), temp.path());
        let status = retry.get_or_create_checkpoint(&[], &group(), "").await.unwrap();
        assert!(matches!(status, CheckpointStatus::Created { ref checkpoints, .. } if checkpoints.len() == 1));
    }

    #[tokio::test]
    async fn test_pending_reports_needed() {
        let source = Arc::new(StaticCommitSource::new(commits("a", 0, 4)));
        let judge = Arc::new(MockJudge::new());
        let (service, _temp) = setup(source, judge.clone());

        let status = service.get_or_create_checkpoint(&[repo()], &group(), "").await.unwrap();
        assert_eq!(
            status,
            CheckpointStatus::Pending {
                commits_needed: 6,
                accumulated: 4,
                latest: None,
            }
        );
        assert_eq!(judge.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_repositories_is_an_error() {
        let (service, _temp) = setup(Arc::new(StaticCommitSource::default()), Arc::new(MockJudge::new()));
        assert!(matches!(
            service.get_or_create_checkpoint(&[], &group(), "").await,
            Err(TrajectoryError::NoRepositories(_))
        ));
    }

    #[tokio::test]
    async fn test_plugins_keep_separate_trajectories() {
        let source = Arc::new(StaticCommitSource::new(commits("a", 0, 10)));
        let (service, _temp) = setup(source.clone(), Arc::new(MockJudge::new()));

        service
            .get_or_create_checkpoint(&[repo()], &group(), "zgc_ai_native_2026")
            .await
            .unwrap();
        source.push(commits("b", 15, 10));
        let status = service
            .get_or_create_checkpoint(&[repo()], &group(), "zgc_simple")
            .await
            .unwrap();

        // The second rubric starts its own history from the first commit
        let CheckpointStatus::Created { checkpoints, .. } = status else {
            panic!("expected checkpoints");
        };
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].checkpoint_id, 1);
        assert_eq!(checkpoints[0].previous_checkpoint_id, None);
        assert!(checkpoints[0].growth_comparison.is_none());
        assert_eq!(checkpoints[0].evaluation.plugin_id, "zgc_simple");
        let growth = checkpoints[1].growth_comparison.as_ref().unwrap();
        let mut dims: Vec<&str> = growth.dimensions.keys().map(String::as_str).collect();
        dims.sort_unstable();
        assert_eq!(
            dims,
            vec!["ai_engineering", "cloud_architecture", "mastery_professionalism", "spec_quality"]
        );
        assert!(growth.dimensions.values().all(|d| d.previous > 0.0));

        let native = service.trajectory(&group(), "zgc_ai_native_2026").unwrap().unwrap();
        assert_eq!(native.total_checkpoints, 1);
        assert_eq!(native.checkpoints[0].evaluation.plugin_id, "zgc_ai_native_2026");
    }

    #[tokio::test]
    async fn test_repositories_are_merged_by_time() {
        let other = RepoRef::new("gitee", "octo", "side");
        let mut repos = HashMap::new();
        repos.insert(repo(), StaticCommitSource::new(commits("a", 0, 6)));
        repos.insert(other.clone(), StaticCommitSource::new(commits("g", 1, 6)));
        let temp = tempfile::tempdir().unwrap();
        let service = service_with(Arc::new(MultiRepoSource { repos }), Arc::new(MockJudge::new()), temp.path());

        let status = service
            .get_or_create_checkpoint(&[repo(), other.clone()], &group(), "")
            .await
            .unwrap();
        let CheckpointStatus::Created { checkpoints, .. } = status else {
            panic!("expected a checkpoint");
        };
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].commits_range.commit_count, 12);
        assert_eq!(checkpoints[0].commits_range.start_sha, "a0");
        assert_eq!(checkpoints[0].commits_range.end_sha, "g5");

        let stored = service.trajectory(&group(), "").unwrap().unwrap();
        assert_eq!(stored.repo_urls, vec![repo().url(), other.url()]);
        assert_eq!(stored.synced_shas.get(&repo().url()).map(String::as_str), Some("a5"));
        assert_eq!(stored.synced_shas.get(&other.url()).map(String::as_str), Some("g5"));
    }

    #[tokio::test]
    async fn test_clear_removes_trajectory() {
        let source = Arc::new(StaticCommitSource::new(commits("a", 0, 4)));
        let (service, _temp) = setup(source, Arc::new(MockJudge::new()));

        service.get_or_create_checkpoint(&[repo()], &group(), "").await.unwrap();
        assert!(service.clear(&group(), "").await.unwrap());
        assert!(service.trajectory(&group(), "").unwrap().is_none());
        assert!(!service.clear(&group(), "").await.unwrap());
    }
}
