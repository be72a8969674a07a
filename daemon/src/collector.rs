//! Event collection cycle
//!
//! One [`Collector::run_cycle`] walks the phases
//! `Idle -> Fetching -> Filtering -> Deduping -> Persisting -> (Idle | CommitFetch -> Idle)`:
//!
//! 1. Fetch the latest page(s) of each feed with its last validator
//! 2. Drop malformed entries, unknown kinds, unmonitored types and untracked repos
//! 3. Drop ids the seen cache already holds
//! 4. Insert the rest; storage skips ids it already has
//! 5. Fetch commit detail for pushed shas under the rate budget, store and
//!    analyze each new commit
//!
//! A transient fetch failure or a rate limit aborts the cycle and leaves
//! validators untouched, so the next cycle retries the same pages. A feed
//! that is gone, forbidden or unreadable is skipped for the cycle while the
//! other feeds proceed. Per-item failures are logged and skipped. A summary
//! whose write fails is kept and written again next cycle. The current phase
//! and the last report are published on a `watch` channel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use repopulse_core::{analyzer, Clock, CommitSummary, Event, EventType, Storage};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::budget::RateBudget;
use crate::seen::SeenCache;
use crate::upstream::{CommitDetail, Feed, FeedPage, RawEvent, UpstreamClient, UpstreamError};

/// Deferred commits kept across cycles before the oldest are dropped
const MAX_DEFERRED_COMMITS: usize = 10_000;
/// Unsaved summaries kept across cycles before the oldest are dropped
const MAX_UNSAVED_SUMMARIES: usize = 10_000;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("Storage error: {0}")]
    Storage(#[from] repopulse_core::Error),
}

/// Where the collector is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Filtering,
    Deduping,
    Persisting,
    CommitFetch,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Raw entries received across all feeds and pages
    pub fetched: usize,
    /// Feeds answered with 304
    pub not_modified: usize,
    /// Feeds skipped this cycle as missing, forbidden or unreadable
    pub feeds_skipped: usize,
    pub malformed: usize,
    /// Unknown kinds, unmonitored types and untracked repos
    pub filtered: usize,
    /// Ids dropped by the seen cache or repeated within the cycle
    pub cached: usize,
    /// Events storage actually inserted
    pub inserted: usize,
    pub commits_stored: usize,
    pub commits_deferred: usize,
    /// Shas that no longer exist upstream or came back unusable
    pub commits_dropped: usize,
    pub summaries: usize,
}

/// Observable collector state.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub phase: CyclePhase,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<CycleReport>,
    pub deferred_commits: usize,
    /// Analyzed summaries waiting to be written again
    pub unsaved_summaries: usize,
    /// Event ids held by the seen cache
    pub seen_ids: usize,
    /// Commit fetches left in the current budget window
    pub budget_remaining: u32,
}

impl Default for CollectorStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycles: 0,
            failed_cycles: 0,
            last_cycle_at: None,
            last_error: None,
            last_report: None,
            deferred_commits: 0,
            unsaved_summaries: 0,
            seen_ids: 0,
            budget_remaining: 0,
        }
    }
}

/// Which events the collector keeps and how hard it polls.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub event_types: HashSet<EventType>,
    /// Empty follows the public feed
    pub target_repos: BTreeSet<String>,
    pub pages_per_poll: u32,
    pub commit_concurrency: usize,
    pub seen_cache_capacity: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            event_types: EventType::ALL.into_iter().collect(),
            target_repos: BTreeSet::new(),
            pages_per_poll: 1,
            commit_concurrency: 4,
            seen_cache_capacity: 10_000,
        }
    }
}

/// A pushed commit waiting for its detail fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingCommit {
    repo: String,
    sha: String,
    branch: Option<String>,
}

/// Owns the polling state: validators, seen ids, deferred commits and budget.
pub struct Collector {
    settings: CollectorSettings,
    storage: Arc<dyn Storage>,
    upstream: Arc<dyn UpstreamClient>,
    clock: Arc<dyn Clock>,
    budget: Mutex<RateBudget>,
    etags: HashMap<Feed, String>,
    seen: SeenCache,
    deferred: VecDeque<PendingCommit>,
    unsaved: VecDeque<CommitSummary>,
    status: watch::Sender<CollectorStatus>,
}

impl Collector {
    pub fn new(
        settings: CollectorSettings,
        storage: Arc<dyn Storage>,
        upstream: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
        budget: RateBudget,
    ) -> Self {
        let (status, _) = watch::channel(CollectorStatus::default());
        Self {
            seen: SeenCache::new(settings.seen_cache_capacity),
            settings,
            storage,
            upstream,
            clock,
            budget: Mutex::new(budget),
            etags: HashMap::new(),
            deferred: VecDeque::new(),
            unsaved: VecDeque::new(),
            status,
        }
    }

    /// Receiver for status updates.
    pub fn subscribe(&self) -> watch::Receiver<CollectorStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> CollectorStatus {
        self.status.borrow().clone()
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    fn with_budget<T>(&self, f: impl FnOnce(&mut RateBudget) -> T) -> T {
        let mut budget = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut budget)
    }

    fn feeds(&self) -> Vec<Feed> {
        if self.settings.target_repos.is_empty() {
            vec![Feed::Public]
        } else {
            self.settings
                .target_repos
                .iter()
                .cloned()
                .map(Feed::Repo)
                .collect()
        }
    }

    /// Run one cycle and record its outcome in the status.
    ///
    /// Failures are logged, never propagated: the next tick retries.
    pub async fn poll(&mut self) -> Option<CycleReport> {
        let result = self.run_cycle().await;
        let now = self.clock.now();
        let deferred = self.deferred.len();
        let unsaved_summaries = self.unsaved.len();
        let seen_ids = self.seen.len();
        let budget_remaining = self.with_budget(|b| b.remaining());

        match result {
            Ok(report) => {
                if report.inserted > 0 || report.commits_stored > 0 {
                    info!(
                        "Cycle stored {} events, {} commits ({} deferred)",
                        report.inserted, report.commits_stored, deferred
                    );
                } else {
                    debug!("Cycle found nothing new");
                }
                self.status.send_modify(|s| {
                    s.phase = CyclePhase::Idle;
                    s.cycles += 1;
                    s.last_cycle_at = Some(now);
                    s.last_error = None;
                    s.last_report = Some(report.clone());
                    s.deferred_commits = deferred;
                    s.unsaved_summaries = unsaved_summaries;
                    s.seen_ids = seen_ids;
                    s.budget_remaining = budget_remaining;
                });
                Some(report)
            }
            Err(e) => {
                warn!("Collection cycle failed: {}", e);
                self.status.send_modify(|s| {
                    s.phase = CyclePhase::Idle;
                    s.cycles += 1;
                    s.failed_cycles += 1;
                    s.last_cycle_at = Some(now);
                    s.last_error = Some(e.to_string());
                    s.deferred_commits = deferred;
                    s.unsaved_summaries = unsaved_summaries;
                    s.seen_ids = seen_ids;
                    s.budget_remaining = budget_remaining;
                });
                None
            }
        }
    }

    /// Run one fetch/filter/dedup/persist/commit cycle.
    ///
    /// # Errors
    /// Returns an error if a feed fetch fails or storage is unavailable.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();

        self.set_phase(CyclePhase::Fetching);
        let (raw, etags) = match self.fetch_feeds(&mut report).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.set_phase(CyclePhase::Idle);
                return Err(e.into());
            }
        };

        self.set_phase(CyclePhase::Filtering);
        let events = self.filter(raw, &mut report);

        self.set_phase(CyclePhase::Deduping);
        let fresh = self.dedup(events, &mut report);

        self.set_phase(CyclePhase::Persisting);
        if !fresh.is_empty() {
            report.inserted = match self.storage.insert_events(&fresh) {
                Ok(n) => n,
                Err(e) => {
                    self.set_phase(CyclePhase::Idle);
                    return Err(e.into());
                }
            };
        }
        for event in &fresh {
            self.seen.insert(&event.id);
        }
        // Validators advance only once their pages are stored
        self.etags.extend(etags);

        if let Err(e) = self.write_unsaved_summaries(&mut report) {
            self.set_phase(CyclePhase::Idle);
            return Err(e.into());
        }

        let pending = self.pending_commits(&fresh);
        if !pending.is_empty() {
            self.set_phase(CyclePhase::CommitFetch);
            let outcome = self.fetch_commits(pending, &mut report).await;
            if let Err(e) = outcome {
                self.set_phase(CyclePhase::Idle);
                return Err(e);
            }
        }

        self.set_phase(CyclePhase::Idle);
        Ok(report)
    }

    /// Fetch every feed; returns raw entries and the validators to keep.
    ///
    /// A feed that is gone, forbidden or unreadable is skipped along with
    /// its validator; the remaining feeds are still fetched.
    async fn fetch_feeds(
        &self,
        report: &mut CycleReport,
    ) -> Result<(Vec<serde_json::Value>, HashMap<Feed, String>), UpstreamError> {
        let mut raw = Vec::new();
        let mut etags = HashMap::new();

        for feed in self.feeds() {
            for page in 1..=self.settings.pages_per_poll.max(1) {
                let etag = if page == 1 {
                    self.etags.get(&feed).map(String::as_str)
                } else {
                    None
                };

                let fetched = match self.upstream.fetch_events(&feed, page, etag).await {
                    Ok(fetched) => fetched,
                    Err(UpstreamError::RateLimited(info)) => {
                        self.with_budget(|b| b.exhaust(&info));
                        return Err(UpstreamError::RateLimited(info));
                    }
                    Err(
                        e @ (UpstreamError::NotFound(_)
                        | UpstreamError::Forbidden(_)
                        | UpstreamError::Malformed(_)),
                    ) => {
                        warn!("Skipping feed {} this cycle: {}", feed, e);
                        report.feeds_skipped += 1;
                        // Later pages were not read, so page 1 must be fetched in full again
                        etags.remove(&feed);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                if let Some(info) = &fetched.rate_limit {
                    self.with_budget(|b| b.observe(info));
                }

                match fetched.value {
                    FeedPage::NotModified => {
                        report.not_modified += 1;
                        break;
                    }
                    FeedPage::Events { events, etag } => {
                        if page == 1 {
                            if let Some(etag) = etag {
                                etags.insert(feed.clone(), etag);
                            }
                        }
                        let done = events.is_empty();
                        report.fetched += events.len();
                        raw.extend(events);
                        if done {
                            break;
                        }
                    }
                }
            }
        }

        Ok((raw, etags))
    }

    fn filter(&self, raw: Vec<serde_json::Value>, report: &mut CycleReport) -> Vec<Event> {
        let mut events = Vec::with_capacity(raw.len());
        for value in raw {
            let entry: RawEvent = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping malformed event: {}", e);
                    report.malformed += 1;
                    continue;
                }
            };

            let Some(event) = entry.into_event() else {
                report.filtered += 1;
                continue;
            };
            let monitored = self.settings.event_types.contains(&event.event_type);
            let tracked = self.settings.target_repos.is_empty()
                || self.settings.target_repos.contains(&event.repo_name);
            if !(monitored && tracked) {
                report.filtered += 1;
                continue;
            }
            events.push(event);
        }
        events
    }

    fn dedup(&self, events: Vec<Event>, report: &mut CycleReport) -> Vec<Event> {
        let mut batch = HashSet::new();
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if self.seen.contains(&event.id) || !batch.insert(event.id.clone()) {
                report.cached += 1;
                continue;
            }
            fresh.push(event);
        }
        fresh
    }

    /// Deferred commits first, then shas pushed by this batch, minus stored ones.
    fn pending_commits(&mut self, fresh: &[Event]) -> Vec<PendingCommit> {
        let mut candidates: Vec<PendingCommit> = self.deferred.drain(..).collect();
        for event in fresh {
            let branch = event.pushed_branch();
            for sha in event.pushed_shas() {
                candidates.push(PendingCommit {
                    repo: event.repo_name.clone(),
                    sha,
                    branch: branch.clone(),
                });
            }
        }

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        for commit in candidates {
            if !queued.insert((commit.repo.clone(), commit.sha.clone())) {
                continue;
            }
            match self.storage.commit_exists(&commit.repo, &commit.sha) {
                Ok(true) => continue,
                Ok(false) => pending.push(commit),
                Err(e) => {
                    // Check again next cycle
                    warn!("Could not check commit {}@{}: {}", commit.repo, commit.sha, e);
                    self.defer(commit);
                }
            }
        }
        pending
    }

    /// Write summaries whose earlier write failed, oldest first.
    ///
    /// Stops at the first failure and keeps it and everything after it.
    fn write_unsaved_summaries(&mut self, report: &mut CycleReport) -> repopulse_core::Result<()> {
        while let Some(summary) = self.unsaved.front() {
            self.storage.upsert_commit_summary(summary)?;
            debug!("Wrote held summary for {}@{}", summary.repo_name, summary.commit_sha);
            report.summaries += 1;
            self.unsaved.pop_front();
        }
        Ok(())
    }

    fn hold_summary(&mut self, summary: CommitSummary) {
        if self.unsaved.len() >= MAX_UNSAVED_SUMMARIES {
            if let Some(dropped) = self.unsaved.pop_front() {
                warn!(
                    "Unsaved summary queue full, dropping {}@{}",
                    dropped.repo_name, dropped.commit_sha
                );
            }
        }
        self.unsaved.push_back(summary);
    }

    fn defer(&mut self, commit: PendingCommit) {
        if self.deferred.len() >= MAX_DEFERRED_COMMITS {
            if let Some(dropped) = self.deferred.pop_front() {
                warn!("Deferred queue full, dropping {}@{}", dropped.repo, dropped.sha);
            }
        }
        self.deferred.push_back(commit);
    }

    async fn fetch_commits(
        &mut self,
        pending: Vec<PendingCommit>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let mut batch = Vec::new();
        for commit in pending {
            if self.with_budget(|b| b.try_acquire()) {
                batch.push(commit);
            } else {
                report.commits_deferred += 1;
                self.defer(commit);
            }
        }
        if report.commits_deferred > 0 {
            info!("Rate budget spent, deferring {} commits", report.commits_deferred);
        }

        let upstream = Arc::clone(&self.upstream);
        let results: Vec<(PendingCommit, Result<_, UpstreamError>)> = stream::iter(batch)
            .map(|commit| {
                let upstream = Arc::clone(&upstream);
                async move {
                    let result = upstream.fetch_commit(&commit.repo, &commit.sha).await;
                    (commit, result)
                }
            })
            .buffer_unordered(self.settings.commit_concurrency.max(1))
            .collect()
            .await;

        let mut storage_error = None;
        for (commit, result) in results {
            if storage_error.is_some() {
                self.defer(commit);
                continue;
            }

            match result {
                Ok(fetched) => {
                    if let Some(info) = &fetched.rate_limit {
                        self.with_budget(|b| b.observe(info));
                    }
                    match self.store_commit(&commit, fetched.value, report) {
                        Ok(()) => {}
                        Err(e) => {
                            storage_error = Some(e);
                            self.defer(commit);
                        }
                    }
                }
                Err(UpstreamError::NotFound(_)) => {
                    warn!("Commit {}@{} not found upstream, dropping", commit.repo, commit.sha);
                    report.commits_dropped += 1;
                }
                Err(UpstreamError::Forbidden(_)) => {
                    warn!("Commit {}@{} is not accessible, dropping", commit.repo, commit.sha);
                    report.commits_dropped += 1;
                }
                Err(UpstreamError::Malformed(e)) => {
                    warn!("Skipping malformed commit {}@{}: {}", commit.repo, commit.sha, e);
                    report.commits_dropped += 1;
                }
                Err(UpstreamError::RateLimited(info)) => {
                    self.with_budget(|b| b.exhaust(&info));
                    report.commits_deferred += 1;
                    self.defer(commit);
                }
                Err(UpstreamError::Transient(e)) => {
                    debug!("Deferring commit {}@{}: {}", commit.repo, commit.sha, e);
                    report.commits_deferred += 1;
                    self.defer(commit);
                }
            }
        }

        match storage_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Insert a fetched commit and write its analysis.
    ///
    /// The commit is already stored when the summary write fails, so the
    /// summary is held for the next cycle instead of the commit.
    fn store_commit(
        &mut self,
        pending: &PendingCommit,
        detail: CommitDetail,
        report: &mut CycleReport,
    ) -> repopulse_core::Result<()> {
        let CommitDetail { mut commit, files } = detail;
        commit.branch_name = pending.branch.clone();

        if !self.storage.insert_commit(&commit, &files)? {
            debug!("Commit {}@{} already stored", commit.repo_name, commit.sha);
            return Ok(());
        }
        report.commits_stored += 1;

        let summary = analyzer::analyze(&commit, &files);
        if let Err(e) = self.storage.upsert_commit_summary(&summary) {
            warn!(
                "Summary of {}@{} not written, retrying next cycle: {}",
                commit.repo_name, commit.sha, e
            );
            self.hold_summary(summary);
            return Err(e);
        }
        report.summaries += 1;
        debug!(
            "Analyzed {}@{}: {} ({})",
            commit.repo_name,
            commit.sha,
            summary.short_summary,
            summary.risk_level.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{Fetched, RateLimitInfo};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use repopulse_core::{
        Commit, CommitFile, CommitStats, EventQuery, FileStatus, HealthStatus, ManualClock,
        PartitionedStorage,
    };
    use std::collections::BTreeMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn raw_event(
        id: &str,
        kind: &str,
        repo: &str,
        payload: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "type": kind,
            "actor": {"login": "octocat"},
            "repo": {"name": repo},
            "payload": payload,
            "created_at": "2024-05-01T11:59:00Z"
        })
    }

    fn push(id: &str, repo: &str, shas: &[&str]) -> serde_json::Value {
        let commits: Vec<_> = shas.iter().map(|s| json!({"sha": s})).collect();
        raw_event(
            id,
            "PushEvent",
            repo,
            json!({"ref": "refs/heads/main", "commits": commits}),
        )
    }

    /// Scripted upstream: feed responses are served in order, commits by sha.
    #[derive(Default)]
    struct FakeUpstream {
        pages: Mutex<VecDeque<Result<Fetched<FeedPage>, UpstreamError>>>,
        etags_seen: Mutex<Vec<Option<String>>>,
        missing: HashSet<String>,
        flaky: HashSet<String>,
        commit_calls: AtomicUsize,
    }

    impl FakeUpstream {
        fn with_pages(pages: Vec<Result<Fetched<FeedPage>, UpstreamError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Self::default()
            }
        }
    }

    fn page(
        events: Vec<serde_json::Value>,
        etag: &str,
    ) -> Result<Fetched<FeedPage>, UpstreamError> {
        Ok(Fetched {
            value: FeedPage::Events {
                events,
                etag: Some(etag.to_string()),
            },
            rate_limit: None,
        })
    }

    fn not_modified() -> Result<Fetched<FeedPage>, UpstreamError> {
        Ok(Fetched {
            value: FeedPage::NotModified,
            rate_limit: None,
        })
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn fetch_events(
            &self,
            _feed: &Feed,
            _page: u32,
            etag: Option<&str>,
        ) -> Result<Fetched<FeedPage>, UpstreamError> {
            self.etags_seen.lock().unwrap().push(etag.map(str::to_string));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(not_modified)
        }

        async fn fetch_commit(
            &self,
            repo: &str,
            sha: &str,
        ) -> Result<Fetched<CommitDetail>, UpstreamError> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if self.missing.contains(sha) {
                return Err(UpstreamError::NotFound(sha.to_string()));
            }
            if self.flaky.contains(sha) {
                return Err(UpstreamError::Transient("timeout".to_string()));
            }
            let commit = Commit {
                sha: sha.to_string(),
                repo_name: repo.to_string(),
                author_name: "Mona".to_string(),
                author_email: "mona@example.com".to_string(),
                author_login: Some("mona".to_string()),
                message: "fix: resolve null pointer in parser".to_string(),
                commit_date: t0(),
                branch_name: None,
                stats: CommitStats::new(4, 1),
                files_changed: 1,
                parent_shas: vec![],
            };
            let files = vec![CommitFile {
                commit_sha: sha.to_string(),
                repo_name: repo.to_string(),
                filename: "src/parser.rs".to_string(),
                status: FileStatus::Modified,
                additions: 4,
                deletions: 1,
                patch: None,
            }];
            Ok(Fetched {
                value: CommitDetail { commit, files },
                rate_limit: None,
            })
        }
    }

    struct Harness {
        collector: Collector,
        storage: Arc<dyn Storage>,
        upstream: Arc<FakeUpstream>,
        clock: Arc<ManualClock>,
    }

    fn harness(upstream: FakeUpstream, settings: CollectorSettings, budget: u32) -> Harness {
        let storage: Arc<dyn Storage> = Arc::new(PartitionedStorage::in_memory(4));
        let upstream = Arc::new(upstream);
        let clock = Arc::new(ManualClock::new(t0()));
        let collector = Collector::new(
            settings,
            storage.clone(),
            upstream.clone(),
            clock.clone(),
            RateBudget::new(budget, clock.clone()),
        );
        Harness {
            collector,
            storage,
            upstream,
            clock,
        }
    }

    fn all_events(storage: &Arc<dyn Storage>) -> Vec<Event> {
        storage
            .list_events(&EventQuery::since(t0() - Duration::days(1)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_stores_events_and_analyzes_commits() {
        let upstream = FakeUpstream::with_pages(vec![page(
            vec![
                push("1", "o/r", &["aaa", "bbb"]),
                raw_event("2", "WatchEvent", "o/r", json!({"action": "started"})),
            ],
            "\"v1\"",
        )]);
        let mut h = harness(upstream, CollectorSettings::default(), 60);

        let report = h.collector.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.commits_stored, 2);
        assert_eq!(report.summaries, 2);

        let commits = h
            .storage
            .get_recent_commits("o/r", t0() - Duration::hours(1), 10)
            .unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].branch_name.as_deref(), Some("main"));

        let summary = h.storage.get_commit_summary("o/r", "aaa").unwrap().unwrap();
        assert!(summary
            .categories
            .contains(&repopulse_core::Category::Bugfix));
        assert_eq!(h.collector.status.borrow().phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_filter_drops_unknown_malformed_and_unmonitored() {
        let upstream = FakeUpstream::with_pages(vec![page(
            vec![
                raw_event("1", "IssuesEvent", "o/r", json!({})),
                raw_event("2", "WatchEvent", "o/r", json!({})),
                raw_event("3", "BrandNewEvent", "o/r", json!({})),
                raw_event("4", "IssuesEvent", "other/repo", json!({})),
                json!({"id": "5", "type": "IssuesEvent"}),
            ],
            "\"v1\"",
        )]);
        let settings = CollectorSettings {
            event_types: [EventType::IssuesEvent].into_iter().collect(),
            target_repos: ["o/r".to_string()].into_iter().collect(),
            ..CollectorSettings::default()
        };
        let mut h = harness(upstream, settings, 60);

        let report = h.collector.run_cycle().await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.filtered, 3);
        assert_eq!(report.inserted, 1);

        let stored = all_events(&h.storage);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "1");
    }

    #[tokio::test]
    async fn test_repeated_pages_are_deduplicated() {
        let body = vec![push("1", "o/r", &["aaa"]), push("1", "o/r", &["aaa"])];
        let upstream = FakeUpstream::with_pages(vec![
            page(body.clone(), "\"v1\""),
            page(body, "\"v2\""),
            not_modified(),
        ]);
        let mut h = harness(upstream, CollectorSettings::default(), 60);

        let first = h.collector.run_cycle().await.unwrap();
        assert_eq!(first.cached, 1);
        assert_eq!(first.inserted, 1);

        let second = h.collector.run_cycle().await.unwrap();
        assert_eq!(second.cached, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.commits_stored, 0);

        let third = h.collector.run_cycle().await.unwrap();
        assert_eq!(third.not_modified, 1);

        assert_eq!(all_events(&h.storage).len(), 1);
        assert_eq!(h.upstream.commit_calls.load(Ordering::SeqCst), 1);

        // Validators are echoed once stored
        let etags = h.upstream.etags_seen.lock().unwrap().clone();
        assert_eq!(
            etags,
            vec![None, Some("\"v1\"".to_string()), Some("\"v2\"".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_validator() {
        let upstream = FakeUpstream::with_pages(vec![
            page(vec![push("1", "o/r", &[])], "\"v1\""),
            Err(UpstreamError::Transient("connection reset".to_string())),
        ]);
        let mut h = harness(upstream, CollectorSettings::default(), 60);

        assert!(h.collector.poll().await.is_some());
        assert!(h.collector.poll().await.is_none());
        assert!(h.collector.poll().await.is_some());

        let status = h.collector.status();
        assert_eq!(status.cycles, 3);
        assert_eq!(status.failed_cycles, 1);
        assert!(status.last_error.is_none());

        let etags = h.upstream.etags_seen.lock().unwrap().clone();
        assert_eq!(etags[1], Some("\"v1\"".to_string()));
        assert_eq!(etags[2], Some("\"v1\"".to_string()));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_defers_commits() {
        let upstream = FakeUpstream::with_pages(vec![page(
            vec![push("1", "o/r", &["a1", "a2", "a3"])],
            "\"v1\"",
        )]);
        let mut h = harness(upstream, CollectorSettings::default(), 2);

        let first = h.collector.run_cycle().await.unwrap();
        assert_eq!(first.commits_stored, 2);
        assert_eq!(first.commits_deferred, 1);
        assert_eq!(h.collector.deferred.len(), 1);

        // Still no budget in the same hour
        let second = h.collector.run_cycle().await.unwrap();
        assert_eq!(second.commits_deferred, 1);

        h.clock.advance(Duration::hours(1));
        let third = h.collector.run_cycle().await.unwrap();
        assert_eq!(third.commits_stored, 1);
        assert!(h.collector.deferred.is_empty());
        assert!(h.storage.commit_exists("o/r", "a3").unwrap());
    }

    #[tokio::test]
    async fn test_missing_commit_dropped_and_transient_deferred() {
        let upstream = FakeUpstream {
            missing: ["gone".to_string()].into_iter().collect(),
            flaky: ["later".to_string()].into_iter().collect(),
            ..FakeUpstream::with_pages(vec![page(
                vec![push("1", "o/r", &["gone", "later", "ok"])],
                "\"v1\"",
            )])
        };
        let mut h = harness(upstream, CollectorSettings::default(), 60);

        let report = h.collector.run_cycle().await.unwrap();
        assert_eq!(report.commits_stored, 1);
        assert_eq!(report.commits_dropped, 1);
        assert_eq!(report.commits_deferred, 1);

        let deferred: Vec<&str> = h.collector.deferred.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(deferred, vec!["later"]);
    }

    #[tokio::test]
    async fn test_missing_feed_does_not_block_other_feeds() {
        let upstream = FakeUpstream::with_pages(vec![
            Err(UpstreamError::NotFound("/repos/a/gone/events".to_string())),
            page(
                vec![raw_event("7", "IssuesEvent", "o/r", json!({"action": "opened"}))],
                "\"r1\"",
            ),
        ]);
        let settings = CollectorSettings {
            target_repos: ["a/gone".to_string(), "o/r".to_string()]
                .into_iter()
                .collect(),
            ..CollectorSettings::default()
        };
        let mut h = harness(upstream, settings, 60);

        let report = h.collector.poll().await.unwrap();
        assert_eq!(report.feeds_skipped, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(all_events(&h.storage).len(), 1);

        // The gone feed keeps no validator; the live one does
        assert!(!h.collector.etags.contains_key(&Feed::Repo("a/gone".to_string())));
        assert_eq!(
            h.collector.etags.get(&Feed::Repo("o/r".to_string())).map(String::as_str),
            Some("\"r1\"")
        );
        assert_eq!(h.collector.status().failed_cycles, 0);
    }

    /// Delegates to an in-memory store but fails the first summary writes.
    struct FlakySummaries {
        inner: PartitionedStorage,
        failures_left: AtomicUsize,
    }

    impl Storage for FlakySummaries {
        fn backend_name(&self) -> &'static str {
            self.inner.backend_name()
        }

        fn insert_events(&self, events: &[Event]) -> repopulse_core::Result<usize> {
            self.inner.insert_events(events)
        }

        fn count_events_by_type(
            &self,
            window_start: DateTime<Utc>,
            repo: Option<&str>,
        ) -> repopulse_core::Result<BTreeMap<EventType, u64>> {
            self.inner.count_events_by_type(window_start, repo)
        }

        fn count_events_by_repo(
            &self,
            window_start: DateTime<Utc>,
            window_end: Option<DateTime<Utc>>,
        ) -> repopulse_core::Result<BTreeMap<String, u64>> {
            self.inner.count_events_by_repo(window_start, window_end)
        }

        fn list_events(&self, query: &EventQuery) -> repopulse_core::Result<Vec<Event>> {
            self.inner.list_events(query)
        }

        fn insert_commit(
            &self,
            commit: &Commit,
            files: &[CommitFile],
        ) -> repopulse_core::Result<bool> {
            self.inner.insert_commit(commit, files)
        }

        fn commit_exists(&self, repo: &str, sha: &str) -> repopulse_core::Result<bool> {
            self.inner.commit_exists(repo, sha)
        }

        fn get_recent_commits(
            &self,
            repo: &str,
            since: DateTime<Utc>,
            limit: usize,
        ) -> repopulse_core::Result<Vec<Commit>> {
            self.inner.get_recent_commits(repo, since, limit)
        }

        fn get_commit_files(
            &self,
            repo: &str,
            sha: &str,
        ) -> repopulse_core::Result<Vec<CommitFile>> {
            self.inner.get_commit_files(repo, sha)
        }

        fn upsert_commit_summary(&self, summary: &CommitSummary) -> repopulse_core::Result<()> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(repopulse_core::Error::StorageUnavailable(
                    "summary table busy".to_string(),
                ));
            }
            self.inner.upsert_commit_summary(summary)
        }

        fn get_commit_summary(
            &self,
            repo: &str,
            sha: &str,
        ) -> repopulse_core::Result<Option<CommitSummary>> {
            self.inner.get_commit_summary(repo, sha)
        }

        fn health_check(&self) -> HealthStatus {
            self.inner.health_check()
        }
    }

    #[tokio::test]
    async fn test_failed_summary_write_is_retried() {
        let storage: Arc<dyn Storage> = Arc::new(FlakySummaries {
            inner: PartitionedStorage::in_memory(4),
            failures_left: AtomicUsize::new(1),
        });
        let upstream = Arc::new(FakeUpstream::with_pages(vec![page(
            vec![push("1", "o/r", &["aaa"])],
            "\"v1\"",
        )]));
        let clock = Arc::new(ManualClock::new(t0()));
        let mut collector = Collector::new(
            CollectorSettings::default(),
            storage.clone(),
            upstream.clone(),
            clock.clone(),
            RateBudget::new(60, clock),
        );

        assert!(collector.poll().await.is_none());
        assert!(storage.commit_exists("o/r", "aaa").unwrap());
        assert!(storage.get_commit_summary("o/r", "aaa").unwrap().is_none());
        assert_eq!(collector.status().unsaved_summaries, 1);

        let report = collector.poll().await.unwrap();
        assert_eq!(report.summaries, 1);
        assert_eq!(report.commits_stored, 0);
        let summary = storage.get_commit_summary("o/r", "aaa").unwrap().unwrap();
        assert_eq!(summary.commit_sha, "aaa");
        assert_eq!(collector.status().unsaved_summaries, 0);
        // The commit itself is never fetched twice
        assert_eq!(upstream.commit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_rate_limit_exhausts_budget() {
        let reset_at = t0() + Duration::minutes(30);
        let upstream = FakeUpstream::with_pages(vec![Err(UpstreamError::RateLimited(
            RateLimitInfo {
                remaining: 0,
                reset_at,
            },
        ))]);
        let mut h = harness(upstream, CollectorSettings::default(), 60);

        assert!(matches!(
            h.collector.run_cycle().await,
            Err(CycleError::Upstream(UpstreamError::RateLimited(_)))
        ));
        assert_eq!(h.collector.with_budget(|b| b.remaining()), 0);

        h.clock.set(reset_at);
        assert_eq!(h.collector.with_budget(|b| b.remaining()), 60);
    }
}
