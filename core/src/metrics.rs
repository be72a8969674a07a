//! Query-time analytics over stored events and commits
//!
//! [`MetricsEngine`] holds no state of its own: every call reads from
//! [`Storage`] and computes its aggregate from scratch, with "now" taken
//! from an injected [`Clock`]. Sparse inputs degrade to empty results or
//! [`IntervalStats::Insufficient`] rather than errors.
//!
//! All weights, targets and thresholds live in [`MetricsPolicy`]. The
//! defaults are tuning choices, not derived truths.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{Category, Event, EventQuery, EventType, RiskLevel};

/// Event types counted toward each health sub-score.
const ACTIVITY_TYPES: &[EventType] = &[
    EventType::PushEvent,
    EventType::PullRequestEvent,
    EventType::IssuesEvent,
];
const COLLABORATION_TYPES: &[EventType] = &[
    EventType::PullRequestReviewEvent,
    EventType::PullRequestReviewCommentEvent,
    EventType::PullRequestReviewThreadEvent,
    EventType::IssueCommentEvent,
    EventType::CommitCommentEvent,
];
const MAINTENANCE_TYPES: &[EventType] = &[
    EventType::ReleaseEvent,
    EventType::DeploymentEvent,
    EventType::DeploymentStatusEvent,
];
const SECURITY_TYPES: &[EventType] = &[
    EventType::CheckRunEvent,
    EventType::CheckSuiteEvent,
    EventType::StatusEvent,
    EventType::WorkflowRunEvent,
];

/// Relative weight of each health sub-score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthWeights {
    pub activity: f64,
    pub collaboration: f64,
    pub maintenance: f64,
    pub security: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            activity: 0.35,
            collaboration: 0.25,
            maintenance: 0.20,
            security: 0.20,
        }
    }
}

/// Tunable constants for every metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsPolicy {
    pub health_weights: HealthWeights,
    /// Daily events that score 100 for activity
    pub activity_target_per_day: f64,
    /// Daily events that score 100 for collaboration
    pub collaboration_target_per_day: f64,
    /// Daily events that score 100 for maintenance
    pub maintenance_target_per_day: f64,
    /// Daily events that score 100 for security
    pub security_target_per_day: f64,
    /// Deviations from the baseline mean that count as anomalous
    pub anomaly_k: f64,
    /// Lower bound on the baseline standard deviation
    pub anomaly_spread_floor: f64,
    /// Hourly buckets required before a baseline is trusted
    pub anomaly_min_buckets: usize,
    /// Longest anomaly window, in hourly buckets
    pub anomaly_max_buckets: usize,
    /// Maximum commits scanned per productivity or overview query
    pub commit_scan_limit: usize,
}

impl Default for MetricsPolicy {
    fn default() -> Self {
        Self {
            health_weights: HealthWeights::default(),
            activity_target_per_day: 10.0,
            collaboration_target_per_day: 5.0,
            maintenance_target_per_day: 0.5,
            security_target_per_day: 10.0,
            anomaly_k: 2.0,
            anomaly_spread_floor: 1.0,
            anomaly_min_buckets: 3,
            anomaly_max_buckets: 24 * 90,
            commit_scan_limit: 1000,
        }
    }
}

/// Event counts per type over a window ending now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventCounts {
    pub repo: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counts: BTreeMap<EventType, u64>,
    pub total: u64,
}

/// Health of one repository over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryMetricSnapshot {
    pub repo: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub activity: f64,
    pub collaboration: f64,
    pub maintenance: f64,
    pub security: f64,
    /// Weighted combination of the four sub-scores, 0-100
    pub health_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Spike,
    Drop,
}

/// Latest hourly bucket of one event type deviating from its baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub event_type: EventType,
    pub kind: AnomalyKind,
    /// Events in the most recent hour
    pub current: u64,
    /// Mean of the preceding hourly buckets
    pub baseline_mean: f64,
    /// Floored standard deviation of the preceding buckets
    pub spread: f64,
    pub z_score: f64,
    /// `min(1, z / 2k)`
    pub confidence: f64,
}

/// Which events an interval query measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    PullRequests,
    Issues,
}

impl IntervalKind {
    fn event_type(&self) -> EventType {
        match self {
            IntervalKind::PullRequests => EventType::PullRequestEvent,
            IntervalKind::Issues => EventType::IssuesEvent,
        }
    }
}

/// Time between consecutive opened pull requests or issues, in hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntervalStats {
    /// Fewer than two qualifying events
    Insufficient { count: usize },
    Computed {
        count: usize,
        mean_hours: f64,
        median_hours: f64,
        min_hours: f64,
        max_hours: f64,
    },
}

/// A repository's activity in the current window against the one before.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendingRepo {
    pub repo_name: String,
    pub current: u64,
    pub previous: u64,
    /// `(current - previous) / previous`; `None` when there was no prior activity
    pub growth: Option<f64>,
}

/// Per-author commit totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeveloperStats {
    pub author: String,
    pub commits: u64,
    pub additions: u64,
    pub deletions: u64,
    pub files_changed: u64,
    /// Mean impact over commits that have a summary
    pub mean_impact: Option<f64>,
}

/// Category and risk breakdown of a repository's recent commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeOverview {
    pub repo: String,
    pub commits: u64,
    pub analyzed: u64,
    pub categories: BTreeMap<Category, u64>,
    pub risk: BTreeMap<RiskLevel, u64>,
    pub breaking_changes: u64,
    pub security_relevant: u64,
    pub mean_impact: Option<f64>,
}

/// Stateless aggregator over a storage backend.
pub struct MetricsEngine {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    policy: MetricsPolicy,
}

impl MetricsEngine {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, policy: MetricsPolicy) -> Self {
        Self {
            storage,
            clock,
            policy,
        }
    }

    /// Event counts per type over the last `hours`, for one repo or globally.
    pub fn event_counts(&self, hours: i64, repo: Option<&str>) -> Result<EventCounts> {
        let window_end = self.clock.now();
        let window_start = start_of(window_end, hours_window(hours)?)?;

        let counts = self.storage.count_events_by_type(window_start, repo)?;
        let total = counts.values().sum();

        Ok(EventCounts {
            repo: repo.map(str::to_string),
            window_start,
            window_end,
            counts,
            total,
        })
    }

    /// Weighted health score of `repo` over the last `days`.
    pub fn health_score(&self, repo: &str, days: i64) -> Result<RepositoryMetricSnapshot> {
        let window_end = self.clock.now();
        let window_start = start_of(window_end, days_window(days)?)?;
        let counts = self.storage.count_events_by_type(window_start, Some(repo))?;

        let sum = |types: &[EventType]| -> u64 {
            types.iter().filter_map(|t| counts.get(t)).sum()
        };
        let days = days as f64;
        let p = &self.policy;

        let activity = density_score(sum(ACTIVITY_TYPES), days, p.activity_target_per_day);
        let collaboration =
            density_score(sum(COLLABORATION_TYPES), days, p.collaboration_target_per_day);
        let maintenance = density_score(sum(MAINTENANCE_TYPES), days, p.maintenance_target_per_day);
        let security = density_score(sum(SECURITY_TYPES), days, p.security_target_per_day);

        let w = &p.health_weights;
        let weight_total = w.activity + w.collaboration + w.maintenance + w.security;
        let health_score = if weight_total > 0.0 {
            (activity * w.activity
                + collaboration * w.collaboration
                + maintenance * w.maintenance
                + security * w.security)
                / weight_total
        } else {
            0.0
        };

        Ok(RepositoryMetricSnapshot {
            repo: repo.to_string(),
            window_start,
            window_end,
            activity: round2(activity),
            collaboration: round2(collaboration),
            maintenance: round2(maintenance),
            security: round2(security),
            health_score: round2(health_score),
        })
    }

    /// Flag event types whose most recent hour deviates from the preceding
    /// hours of the window.
    ///
    /// Windows shorter than the policy's minimum bucket count yield nothing;
    /// windows longer than its maximum are rejected.
    pub fn detect_anomalies(&self, repo: Option<&str>, hours: i64) -> Result<Vec<Anomaly>> {
        let buckets = usize::try_from(hours).unwrap_or(0);
        if buckets < self.policy.anomaly_min_buckets.max(2) {
            debug!("Anomaly window of {} hours is too short", hours);
            return Ok(Vec::new());
        }
        if buckets > self.policy.anomaly_max_buckets {
            return Err(Error::Other(format!(
                "anomaly window of {hours} hours exceeds the {} bucket limit",
                self.policy.anomaly_max_buckets
            )));
        }

        let window_start = start_of(self.clock.now(), hours_window(hours)?)?;

        let mut query = EventQuery::since(window_start);
        if let Some(repo) = repo {
            query = query.repo(repo);
        }
        let events = self.storage.list_events(&query)?;

        let mut histograms: BTreeMap<EventType, Vec<u64>> = BTreeMap::new();
        for event in &events {
            let offset = event.created_at - window_start;
            let index = match usize::try_from(offset.num_hours()) {
                Ok(i) if i < buckets => i,
                _ => continue,
            };
            histograms
                .entry(event.event_type)
                .or_insert_with(|| vec![0; buckets])[index] += 1;
        }

        let k = self.policy.anomaly_k;
        let mut anomalies = Vec::new();
        for (event_type, histogram) in histograms {
            let (baseline, current) = histogram.split_at(buckets - 1);
            let current = current[0];

            let mean = baseline.iter().sum::<u64>() as f64 / baseline.len() as f64;
            let variance = baseline
                .iter()
                .map(|&c| (c as f64 - mean).powi(2))
                .sum::<f64>()
                / baseline.len() as f64;
            let spread = variance.sqrt().max(self.policy.anomaly_spread_floor);

            let deviation = current as f64 - mean;
            let z_score = deviation.abs() / spread;
            if z_score <= k {
                continue;
            }

            anomalies.push(Anomaly {
                event_type,
                kind: if deviation > 0.0 {
                    AnomalyKind::Spike
                } else {
                    AnomalyKind::Drop
                },
                current,
                baseline_mean: round2(mean),
                spread: round2(spread),
                z_score: round2(z_score),
                confidence: round2((z_score / (2.0 * k)).min(1.0)),
            });
        }

        Ok(anomalies)
    }

    /// Time between consecutive opened pull requests or issues in `repo`.
    ///
    /// Events whose payload carries an `action` other than `opened` do not
    /// qualify; events without an `action` do.
    pub fn intervals(&self, repo: &str, kind: IntervalKind, days: i64) -> Result<IntervalStats> {
        let since = start_of(self.clock.now(), days_window(days)?)?;
        let query = EventQuery::since(since)
            .repo(repo)
            .types(&[kind.event_type()]);

        let times: Vec<DateTime<Utc>> = self
            .storage
            .list_events(&query)?
            .iter()
            .filter(|e| is_opened(e))
            .map(|e| e.created_at)
            .collect();

        Ok(interval_stats(&times))
    }

    /// Repositories ranked by event count in the last `hours`, with growth
    /// against the `hours` before that.
    pub fn trending(&self, hours: i64, limit: usize) -> Result<Vec<TrendingRepo>> {
        let window = hours_window(hours)?;
        let current_start = start_of(self.clock.now(), window)?;
        let previous_start = start_of(current_start, window)?;

        let current = self.storage.count_events_by_repo(current_start, None)?;
        let previous = self
            .storage
            .count_events_by_repo(previous_start, Some(current_start))?;

        let mut ranked: Vec<TrendingRepo> = current
            .into_iter()
            .map(|(repo_name, current)| {
                let previous = previous.get(&repo_name).copied().unwrap_or(0);
                let growth = (previous > 0)
                    .then(|| round2((current as f64 - previous as f64) / previous as f64));
                TrendingRepo {
                    repo_name,
                    current,
                    previous,
                    growth,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.current
                .cmp(&a.current)
                .then_with(|| a.repo_name.cmp(&b.repo_name))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Per-author totals over commits of `repo` from the last `days`.
    ///
    /// Authors are keyed by login when known, otherwise by name.
    pub fn developer_productivity(&self, repo: &str, days: i64) -> Result<Vec<DeveloperStats>> {
        let since = start_of(self.clock.now(), days_window(days)?)?;
        let commits = self
            .storage
            .get_recent_commits(repo, since, self.policy.commit_scan_limit)?;

        let mut by_author: BTreeMap<String, (DeveloperStats, f64, u64)> = BTreeMap::new();
        for commit in &commits {
            let author = commit
                .author_login
                .clone()
                .unwrap_or_else(|| commit.author_name.clone());
            let summary = self.storage.get_commit_summary(repo, &commit.sha)?;

            let (stats, impact_sum, analyzed) =
                by_author.entry(author.clone()).or_insert_with(|| {
                    (
                        DeveloperStats {
                            author,
                            commits: 0,
                            additions: 0,
                            deletions: 0,
                            files_changed: 0,
                            mean_impact: None,
                        },
                        0.0,
                        0,
                    )
                });
            stats.commits += 1;
            stats.additions += commit.stats.additions;
            stats.deletions += commit.stats.deletions;
            stats.files_changed += commit.files_changed;
            if let Some(summary) = summary {
                *impact_sum += summary.impact_score;
                *analyzed += 1;
            }
        }

        let mut developers: Vec<DeveloperStats> = by_author
            .into_values()
            .map(|(mut stats, impact_sum, analyzed)| {
                stats.mean_impact = (analyzed > 0).then(|| round2(impact_sum / analyzed as f64));
                stats
            })
            .collect();
        developers
            .sort_by(|a, b| b.commits.cmp(&a.commits).then_with(|| a.author.cmp(&b.author)));
        Ok(developers)
    }

    /// Category histogram and risk distribution of `repo`'s analyzed
    /// commits from the last `days`.
    pub fn change_overview(&self, repo: &str, days: i64) -> Result<ChangeOverview> {
        let since = start_of(self.clock.now(), days_window(days)?)?;
        let commits = self
            .storage
            .get_recent_commits(repo, since, self.policy.commit_scan_limit)?;

        let mut overview = ChangeOverview {
            repo: repo.to_string(),
            commits: commits.len() as u64,
            analyzed: 0,
            categories: BTreeMap::new(),
            risk: BTreeMap::new(),
            breaking_changes: 0,
            security_relevant: 0,
            mean_impact: None,
        };

        let mut impact_sum = 0.0;
        for commit in &commits {
            let Some(summary) = self.storage.get_commit_summary(repo, &commit.sha)? else {
                continue;
            };
            overview.analyzed += 1;
            impact_sum += summary.impact_score;
            for category in &summary.categories {
                *overview.categories.entry(*category).or_insert(0) += 1;
            }
            *overview.risk.entry(summary.risk_level).or_insert(0) += 1;
            overview.breaking_changes += u64::from(summary.breaking_changes);
            overview.security_relevant += u64::from(summary.security_relevant);
        }

        if overview.analyzed > 0 {
            overview.mean_impact = Some(round2(impact_sum / overview.analyzed as f64));
        }
        Ok(overview)
    }
}

fn hours_window(hours: i64) -> Result<Duration> {
    positive_window(Duration::try_hours(hours), hours, "hours")
}

fn days_window(days: i64) -> Result<Duration> {
    positive_window(Duration::try_days(days), days, "days")
}

fn positive_window(window: Option<Duration>, amount: i64, unit: &str) -> Result<Duration> {
    match window {
        Some(window) if window > Duration::zero() => Ok(window),
        Some(_) => Err(Error::Other(format!(
            "metrics window must be positive, got {amount} {unit}"
        ))),
        None => Err(Error::Other(format!(
            "metrics window of {amount} {unit} is out of range"
        ))),
    }
}

/// Start of a `window` that ends at `end`.
fn start_of(end: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    end.checked_sub_signed(window).ok_or_else(|| {
        Error::Other(format!(
            "metrics window of {}s reaches past the earliest timestamp",
            window.num_seconds()
        ))
    })
}

/// Score 0-100 of `count` events over `days` against a daily target.
fn density_score(count: u64, days: f64, target_per_day: f64) -> f64 {
    if days <= 0.0 || target_per_day <= 0.0 {
        return 0.0;
    }
    ((count as f64 / days) / target_per_day * 100.0).min(100.0)
}

fn is_opened(event: &Event) -> bool {
    match event.payload.get("action").and_then(|a| a.as_str()) {
        Some(action) => action == "opened",
        None => true,
    }
}

fn interval_stats(times: &[DateTime<Utc>]) -> IntervalStats {
    if times.len() < 2 {
        return IntervalStats::Insufficient { count: times.len() };
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let mut deltas: Vec<f64> = sorted
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 3_600_000.0)
        .collect();
    deltas.sort_by(f64::total_cmp);

    let n = deltas.len();
    let mean = deltas.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 0 {
        (deltas[n / 2 - 1] + deltas[n / 2]) / 2.0
    } else {
        deltas[n / 2]
    };

    IntervalStats::Computed {
        count: times.len(),
        mean_hours: round2(mean),
        median_hours: round2(median),
        min_hours: round2(deltas[0]),
        max_hours: round2(deltas[n - 1]),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
