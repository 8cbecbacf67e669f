//! Period bucketing and the accumulate-then-evaluate state machine.
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{DimensionDelta, GrowthComparison, Trend};
use crate::model::{Commit, Scores, round1};

/// Score change beyond which a dimension counts as moving.
pub const TREND_BAND: f64 = 2.0;

/// Fixed-length periods counted from the repository start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodClock {
    pub repo_start: DateTime<Utc>,
    pub period_days: u32,
}

impl PeriodClock {
    #[must_use]
    pub fn new(repo_start: DateTime<Utc>, period_days: u32) -> Self {
        Self {
            repo_start,
            period_days: period_days.max(1),
        }
    }

    /// Zero-based period containing `ts`. Times before the start fall in 0.
    #[must_use]
    pub fn period_index(&self, ts: DateTime<Utc>) -> u32 {
        let days = (ts - self.repo_start).num_days().max(0);
        (days / i64::from(self.period_days)) as u32
    }

    /// `[start, end)` of period `index`.
    #[must_use]
    pub fn bounds(&self, index: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let len = i64::from(self.period_days);
        let start = self.repo_start + Duration::days(i64::from(index) * len);
        (start, start + Duration::days(len))
    }
}

/// Midnight UTC of the day `ts` falls on.
#[must_use]
pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_hms_opt(0, 0, 0).map_or(ts, |naive| naive.and_utc())
}

/// Group commits by period, chronologically. Commits keep their input order
/// within a period and are paired with their input position.
#[must_use]
pub fn group_by_period<'a>(clock: &PeriodClock, commits: &'a [Commit]) -> BTreeMap<u32, Vec<(usize, &'a Commit)>> {
    let mut periods: BTreeMap<u32, Vec<(usize, &Commit)>> = BTreeMap::new();
    for (pos, commit) in commits.iter().enumerate() {
        periods
            .entry(clock.period_index(commit.timestamp))
            .or_default()
            .push((pos, commit));
    }
    periods
}

/// Commits gathered toward the next checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulationState {
    /// Day of the earliest commit first observed; survives resets.
    pub repo_start_date: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period: Option<u32>,
    pub accumulated_commit_ids: Vec<String>,
    pub accumulated_from_periods: u32,
}

impl AccumulationState {
    /// Add the commits of one period.
    ///
    /// A period later than the current one counts toward
    /// `accumulated_from_periods`. Ids already held are ignored.
    pub fn observe<'a, I>(&mut self, clock: &PeriodClock, period: u32, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let (start, end) = clock.bounds(period);
        if self.current_period.is_none_or(|current| period > current) {
            self.accumulated_from_periods += 1;
            self.current_period = Some(period);
            self.period_end = Some(end);
        }
        if self.period_start.is_none() {
            self.period_start = Some(start);
        }

        let mut held: HashSet<String> = self.accumulated_commit_ids.iter().cloned().collect();
        for id in ids {
            if held.insert(id.to_string()) {
                self.accumulated_commit_ids.push(id.to_string());
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accumulated_commit_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accumulated_commit_ids.is_empty()
    }

    #[must_use]
    pub fn is_ready(&self, min_commits: usize) -> bool {
        !self.is_empty() && self.len() >= min_commits
    }

    #[must_use]
    pub fn commits_needed(&self, min_commits: usize) -> usize {
        min_commits.saturating_sub(self.len())
    }

    /// Clear after a checkpoint, keeping the repo start date.
    pub fn reset(&mut self) {
        *self = Self {
            repo_start_date: self.repo_start_date,
            ..Self::default()
        };
    }
}

fn trend_of(delta: f64) -> Trend {
    if delta > TREND_BAND {
        Trend::Increasing
    } else if delta < -TREND_BAND {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Per-dimension change from `previous` to `current`.
#[must_use]
pub fn growth_comparison(previous_checkpoint_id: u32, previous: &Scores, current: &Scores) -> GrowthComparison {
    let dimensions: BTreeMap<String, DimensionDelta> = current
        .iter()
        .map(|(key, &now)| {
            let before = previous.get(key).copied().unwrap_or(0.0);
            let delta = round1(now - before);
            (
                key.clone(),
                DimensionDelta {
                    previous: before,
                    current: now,
                    delta,
                    trend: trend_of(delta),
                },
            )
        })
        .collect();

    let mean_delta = if dimensions.is_empty() {
        0.0
    } else {
        round1(dimensions.values().map(|d| d.delta).sum::<f64>() / dimensions.len() as f64)
    };

    GrowthComparison {
        previous_checkpoint_id,
        dimensions,
        mean_delta,
        overall_trend: trend_of(mean_delta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(i64::from(d))
    }

    #[test]
    fn test_period_index_and_bounds() {
        let clock = PeriodClock::new(day(0), 14);
        assert_eq!(clock.period_index(day(0)), 0);
        assert_eq!(clock.period_index(day(13) + Duration::hours(23)), 0);
        assert_eq!(clock.period_index(day(14)), 1);
        assert_eq!(clock.period_index(day(0) - Duration::days(3)), 0);
        assert_eq!(clock.bounds(2), (day(28), day(42)));
    }

    #[test]
    fn test_start_of_day() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 6, 17, 45, 3).unwrap();
        assert_eq!(start_of_day(ts), Utc.with_ymd_and_hms(2025, 5, 6, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_accumulation_over_periods() {
        let clock = PeriodClock::new(day(0), 14);
        let mut state = AccumulationState {
            repo_start_date: Some(day(0)),
            ..AccumulationState::default()
        };

        let p0: Vec<String> = (0..8).map(|i| format!("a{i}")).collect();
        state.observe(&clock, 0, p0.iter().map(String::as_str));
        assert_eq!(state.accumulated_from_periods, 1);
        assert!(!state.is_ready(10));
        assert_eq!(state.commits_needed(10), 2);

        state.observe(&clock, 1, ["b0"]);
        assert_eq!(state.accumulated_from_periods, 2);
        assert!(!state.is_ready(10));

        state.observe(&clock, 3, ["c0", "c1", "c2", "c3", "c4", "a0"]);
        assert_eq!(state.accumulated_from_periods, 3);
        assert_eq!(state.len(), 14);
        assert!(state.is_ready(10));
        assert_eq!(state.period_start, Some(day(0)));
        assert_eq!(state.period_end, Some(day(56)));

        state.reset();
        assert!(state.is_empty());
        assert_eq!(state.accumulated_from_periods, 0);
        assert_eq!(state.repo_start_date, Some(day(0)));
    }

    #[test]
    fn test_growth_comparison_trends() {
        let prev: Scores = [("a", 50.0), ("b", 50.0), ("c", 50.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let now: Scores = [("a", 55.0), ("b", 48.0), ("c", 52.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let growth = growth_comparison(1, &prev, &now);
        assert_eq!(growth.dimensions["a"].trend, Trend::Increasing);
        assert_eq!(growth.dimensions["b"].trend, Trend::Stable);
        assert_eq!(growth.dimensions["c"].trend, Trend::Stable);
        assert_eq!(growth.dimensions["b"].delta, -2.0);
        assert_eq!(growth.mean_delta, 1.7);
        assert_eq!(growth.overall_trend, Trend::Stable);
    }
}
