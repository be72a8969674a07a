//! Core data types for repopulse
//!
//! These types are shared between the storage backends, the commit analyzer,
//! the metrics engine and the collector daemon.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width timestamp format used in every persisted key and column.
///
/// Lexicographic order of formatted strings equals chronological order, which
/// both backends rely on for range scans.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Drop sub-millisecond precision, matching what [`format_timestamp`] keeps.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Parse a timestamp previously written by [`format_timestamp`].
///
/// Falls back to RFC 3339 so values written by other tools still load.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Upstream event kinds the system knows how to store.
///
/// Anything the feed sends that is not listed here fails to parse and is
/// dropped at the filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    PushEvent,
    PullRequestEvent,
    PullRequestReviewEvent,
    PullRequestReviewCommentEvent,
    PullRequestReviewThreadEvent,
    IssuesEvent,
    IssueCommentEvent,
    CommitCommentEvent,
    CreateEvent,
    DeleteEvent,
    ForkEvent,
    WatchEvent,
    ReleaseEvent,
    PublicEvent,
    MemberEvent,
    GollumEvent,
    DeploymentEvent,
    DeploymentStatusEvent,
    CheckRunEvent,
    CheckSuiteEvent,
    StatusEvent,
    WorkflowRunEvent,
    SponsorshipEvent,
}

impl EventType {
    /// Every known event kind, in declaration order.
    pub const ALL: [EventType; 23] = [
        EventType::PushEvent,
        EventType::PullRequestEvent,
        EventType::PullRequestReviewEvent,
        EventType::PullRequestReviewCommentEvent,
        EventType::PullRequestReviewThreadEvent,
        EventType::IssuesEvent,
        EventType::IssueCommentEvent,
        EventType::CommitCommentEvent,
        EventType::CreateEvent,
        EventType::DeleteEvent,
        EventType::ForkEvent,
        EventType::WatchEvent,
        EventType::ReleaseEvent,
        EventType::PublicEvent,
        EventType::MemberEvent,
        EventType::GollumEvent,
        EventType::DeploymentEvent,
        EventType::DeploymentStatusEvent,
        EventType::CheckRunEvent,
        EventType::CheckSuiteEvent,
        EventType::StatusEvent,
        EventType::WorkflowRunEvent,
        EventType::SponsorshipEvent,
    ];

    /// Return the upstream type name used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PushEvent => "PushEvent",
            EventType::PullRequestEvent => "PullRequestEvent",
            EventType::PullRequestReviewEvent => "PullRequestReviewEvent",
            EventType::PullRequestReviewCommentEvent => "PullRequestReviewCommentEvent",
            EventType::PullRequestReviewThreadEvent => "PullRequestReviewThreadEvent",
            EventType::IssuesEvent => "IssuesEvent",
            EventType::IssueCommentEvent => "IssueCommentEvent",
            EventType::CommitCommentEvent => "CommitCommentEvent",
            EventType::CreateEvent => "CreateEvent",
            EventType::DeleteEvent => "DeleteEvent",
            EventType::ForkEvent => "ForkEvent",
            EventType::WatchEvent => "WatchEvent",
            EventType::ReleaseEvent => "ReleaseEvent",
            EventType::PublicEvent => "PublicEvent",
            EventType::MemberEvent => "MemberEvent",
            EventType::GollumEvent => "GollumEvent",
            EventType::DeploymentEvent => "DeploymentEvent",
            EventType::DeploymentStatusEvent => "DeploymentStatusEvent",
            EventType::CheckRunEvent => "CheckRunEvent",
            EventType::CheckSuiteEvent => "CheckSuiteEvent",
            EventType::StatusEvent => "StatusEvent",
            EventType::WorkflowRunEvent => "WorkflowRunEvent",
            EventType::SponsorshipEvent => "SponsorshipEvent",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A repository event as received from the upstream feed.
///
/// # Fields
/// - `id`: Feed-unique identifier; the idempotency key for ingestion.
/// - `event_type`: Monitored event kind.
/// - `repo_name`: Repository in `owner/name` form.
/// - `actor_login`: Login of the user that triggered the event.
/// - `created_at`: When the upstream recorded the event.
/// - `payload`: Opaque event payload, stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub repo_name: String,
    pub actor_login: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Commit SHAs referenced by a push event's payload.
    ///
    /// Reads `payload.commits[].sha` and falls back to `payload.head` when the
    /// feed omits the commit list. Non-push events yield nothing.
    pub fn pushed_shas(&self) -> Vec<String> {
        if self.event_type != EventType::PushEvent {
            return Vec::new();
        }

        let mut shas: Vec<String> = self
            .payload
            .get("commits")
            .and_then(|c| c.as_array())
            .map(|commits| {
                commits
                    .iter()
                    .filter_map(|c| c.get("sha").and_then(|s| s.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if shas.is_empty() {
            if let Some(head) = self.payload.get("head").and_then(|h| h.as_str()) {
                shas.push(head.to_string());
            }
        }

        shas.dedup();
        shas
    }

    /// Branch name from a push payload `ref` (`refs/heads/main` -> `main`).
    pub fn pushed_branch(&self) -> Option<String> {
        let git_ref = self.payload.get("ref")?.as_str()?;
        Some(
            git_ref
                .strip_prefix("refs/heads/")
                .unwrap_or(git_ref)
                .to_string(),
        )
    }
}

/// Filters for listing stored events.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Inclusive lower bound on `created_at`
    pub since: DateTime<Utc>,
    /// Restrict to a single repository
    pub repo: Option<String>,
    /// Restrict to these types (empty means all)
    pub types: Vec<EventType>,
    /// Maximum number of events to return
    pub limit: Option<usize>,
}

impl EventQuery {
    /// All events since `since`.
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since,
            repo: None,
            types: Vec::new(),
            limit: None,
        }
    }

    /// Restrict to one repository.
    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Restrict to the given event types.
    pub fn types(mut self, types: &[EventType]) -> Self {
        self.types = types.to_vec();
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies this query.
    ///
    /// `since` is compared at stored (millisecond) precision.
    pub fn matches(&self, event: &Event) -> bool {
        event.created_at >= truncate_to_millis(self.since)
            && self.repo.as_deref().map_or(true, |r| r == event.repo_name)
            && (self.types.is_empty() || self.types.contains(&event.event_type))
    }
}

/// Line-change statistics for a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub additions: u64,
    pub deletions: u64,
    pub total_changes: u64,
}

impl CommitStats {
    /// Build stats whose total is the sum of additions and deletions.
    pub fn new(additions: u64, deletions: u64) -> Self {
        Self {
            additions,
            deletions,
            total_changes: additions + deletions,
        }
    }
}

/// A commit fetched from the upstream commit-detail endpoint.
///
/// `(sha, repo_name)` is the unique key: forks legitimately share SHAs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub repo_name: String,
    pub author_name: String,
    pub author_email: String,
    pub author_login: Option<String>,
    pub message: String,
    pub commit_date: DateTime<Utc>,
    pub branch_name: Option<String>,
    pub stats: CommitStats,
    pub files_changed: u64,
    pub parent_shas: Vec<String>,
}

/// Status of a file within a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl FileStatus {
    /// Return the lowercase string representation used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "added",
            FileStatus::Modified => "modified",
            FileStatus::Removed => "removed",
            FileStatus::Renamed => "renamed",
        }
    }

    /// Map an upstream status string; unknown variants count as modified.
    pub fn from_upstream(status: &str) -> Self {
        match status {
            "added" => FileStatus::Added,
            "removed" => FileStatus::Removed,
            "renamed" => FileStatus::Renamed,
            _ => FileStatus::Modified,
        }
    }
}

/// A single file touched by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFile {
    pub commit_sha: String,
    pub repo_name: String,
    pub filename: String,
    pub status: FileStatus,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

/// Change categories assigned by the commit analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bugfix,
    Feature,
    Refactor,
    Documentation,
    Testing,
    Performance,
    Security,
    Breaking,
    Configuration,
    Database,
    Infrastructure,
}

impl Category {
    /// Return the snake_case string representation used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bugfix => "bugfix",
            Category::Feature => "feature",
            Category::Refactor => "refactor",
            Category::Documentation => "documentation",
            Category::Testing => "testing",
            Category::Performance => "performance",
            Category::Security => "security",
            Category::Breaking => "breaking",
            Category::Configuration => "configuration",
            Category::Database => "database",
            Category::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk classification of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Expected effect of a commit on runtime performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceImpact {
    Positive,
    Neutral,
    Negative,
}

impl PerformanceImpact {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceImpact::Positive => "positive",
            PerformanceImpact::Neutral => "neutral",
            PerformanceImpact::Negative => "negative",
        }
    }
}

/// Analyzer output for one commit; re-analysis overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub commit_sha: String,
    pub repo_name: String,
    pub short_summary: String,
    pub detailed_summary: String,
    pub categories: BTreeSet<Category>,
    pub impact_score: f64,
    pub complexity_score: f64,
    pub risk_level: RiskLevel,
    pub breaking_changes: bool,
    pub security_relevant: bool,
    pub performance_impact: PerformanceImpact,
}
