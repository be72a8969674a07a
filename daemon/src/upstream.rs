//! Upstream event feed and commit-detail client
//!
//! [`UpstreamClient`] is the seam the collector polls through; the
//! [`GitHubClient`] implementation talks to the GitHub REST API with
//! `If-None-Match` validators and reports the rate-limit headers of every
//! response so the collector can clamp its budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repopulse_core::{
    Clock, Commit, CommitFile, CommitStats, Event, EventType, FileStatus,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("repopulse/", env!("CARGO_PKG_VERSION"));
const GITHUB_ACCEPT: &str = "application/vnd.github+json";
/// Largest page the events endpoints serve
const PER_PAGE: u32 = 100;

#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network failure, timeout or 5xx; retried next cycle
    #[error("Transient upstream error: {0}")]
    Transient(String),
    #[error("Rate limited until {}", .0.reset_at)]
    RateLimited(RateLimitInfo),
    #[error("Not found: {0}")]
    NotFound(String),
    /// 403 with request quota left: access denied, not throttled
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Malformed(e.to_string())
        } else {
            UpstreamError::Transient(e.to_string())
        }
    }
}

/// Rate limit information from response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// A response body together with the rate limit it reported.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Which event feed to poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feed {
    /// `/events`
    Public,
    /// `/repos/{owner}/{name}/events`
    Repo(String),
}

impl Feed {
    fn path(&self) -> String {
        match self {
            Feed::Public => "/events".to_string(),
            Feed::Repo(name) => format!("/repos/{name}/events"),
        }
    }
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feed::Public => f.write_str("public"),
            Feed::Repo(name) => f.write_str(name),
        }
    }
}

/// One poll of a feed page.
#[derive(Debug, Clone)]
pub enum FeedPage {
    /// The validator still matches; nothing new
    NotModified,
    /// Raw events, newest first as served, plus the page's validator
    Events {
        events: Vec<serde_json::Value>,
        etag: Option<String>,
    },
}

/// A commit and its files as served by the commit-detail endpoint.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub commit: Commit,
    pub files: Vec<CommitFile>,
}

/// Feed entry as served upstream.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: RawActor,
    pub repo: RawRepo,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RawActor {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct RawRepo {
    pub name: String,
}

impl RawEvent {
    /// Convert into a stored event; `None` for kinds this system does not know.
    pub fn into_event(self) -> Option<Event> {
        let event_type = self.kind.parse::<EventType>().ok()?;
        Some(Event {
            id: self.id,
            event_type,
            repo_name: self.repo.name,
            actor_login: self.actor.login,
            created_at: self.created_at,
            payload: self.payload,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    sha: String,
    commit: RawCommitBody,
    author: Option<RawActor>,
    #[serde(default)]
    parents: Vec<RawParent>,
    #[serde(default)]
    stats: Option<RawStats>,
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawCommitBody {
    author: Option<RawSignature>,
    committer: Option<RawSignature>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawSignature {
    name: Option<String>,
    email: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawParent {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RawStats {
    additions: u64,
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    filename: String,
    status: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    patch: Option<String>,
}

impl RawCommit {
    fn into_detail(self, repo: &str) -> Result<CommitDetail, UpstreamError> {
        let signature = self.commit.author.as_ref().or(self.commit.committer.as_ref());
        let commit_date = signature
            .and_then(|s| s.date)
            .or_else(|| self.commit.committer.as_ref().and_then(|s| s.date))
            .ok_or_else(|| UpstreamError::Malformed(format!("commit {} has no date", self.sha)))?;

        let files: Vec<CommitFile> = self
            .files
            .into_iter()
            .map(|f| CommitFile {
                commit_sha: self.sha.clone(),
                repo_name: repo.to_string(),
                filename: f.filename,
                status: FileStatus::from_upstream(&f.status),
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch,
            })
            .collect();

        // Large commits may omit stats; fall back to the file totals
        let stats = match self.stats {
            Some(s) => CommitStats::new(s.additions, s.deletions),
            None => CommitStats::new(
                files.iter().map(|f| f.additions).sum(),
                files.iter().map(|f| f.deletions).sum(),
            ),
        };

        let commit = Commit {
            sha: self.sha.clone(),
            repo_name: repo.to_string(),
            author_name: signature.and_then(|s| s.name.clone()).unwrap_or_default(),
            author_email: signature.and_then(|s| s.email.clone()).unwrap_or_default(),
            author_login: self.author.map(|a| a.login),
            message: self.commit.message,
            commit_date,
            branch_name: None,
            stats,
            files_changed: files.len() as u64,
            parent_shas: self.parents.into_iter().map(|p| p.sha).collect(),
        };

        Ok(CommitDetail { commit, files })
    }
}

/// Source of events and commit details.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch one page (1-based) of a feed, echoing `etag` as `If-None-Match`.
    async fn fetch_events(
        &self,
        feed: &Feed,
        page: u32,
        etag: Option<&str>,
    ) -> Result<Fetched<FeedPage>, UpstreamError>;

    /// Fetch a commit with stats and files.
    async fn fetch_commit(
        &self,
        repo: &str,
        sha: &str,
    ) -> Result<Fetched<CommitDetail>, UpstreamError>;
}

/// GitHub REST API client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl GitHubClient {
    /// Create a client with an optional token and a per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the token is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<&str>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));

        if let Some(t) = token {
            let mut auth_val = HeaderValue::from_str(&format!("token {t}"))
                .map_err(|e| UpstreamError::Malformed(format!("invalid token: {e}")))?;
            auth_val.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth_val);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            clock,
        })
    }

    /// Send a GET and classify non-success statuses.
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
    ) -> Result<(reqwest::Response, Option<RateLimitInfo>), UpstreamError> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let resp = request.send().await?;
        let rate_limit = extract_rate_limit_from_headers(resp.headers());
        let status = resp.status();

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok((resp, rate_limit));
        }

        match (status.as_u16(), rate_limit) {
            (403, Some(info)) if info.remaining > 0 => {
                Err(UpstreamError::Forbidden(url.to_string()))
            }
            (403 | 429, _) => Err(UpstreamError::RateLimited(rate_limit.unwrap_or_else(|| {
                RateLimitInfo {
                    remaining: 0,
                    reset_at: self.clock.now() + chrono::Duration::hours(1),
                }
            }))),
            (404, _) => Err(UpstreamError::NotFound(url.to_string())),
            _ => Err(UpstreamError::Transient(format!("HTTP {status} from {url}"))),
        }
    }
}

#[async_trait]
impl UpstreamClient for GitHubClient {
    async fn fetch_events(
        &self,
        feed: &Feed,
        page: u32,
        etag: Option<&str>,
    ) -> Result<Fetched<FeedPage>, UpstreamError> {
        let url = format!(
            "{}{}?per_page={PER_PAGE}&page={page}",
            self.base_url,
            feed.path()
        );
        let (resp, rate_limit) = self.get(&url, etag).await?;

        if resp.status() == StatusCode::NOT_MODIFIED {
            debug!("Feed {} page {} not modified", feed, page);
            return Ok(Fetched {
                value: FeedPage::NotModified,
                rate_limit,
            });
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        let events: Vec<serde_json::Value> = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Malformed(format!("feed {feed}: {e}")))?;

        Ok(Fetched {
            value: FeedPage::Events { events, etag },
            rate_limit,
        })
    }

    async fn fetch_commit(
        &self,
        repo: &str,
        sha: &str,
    ) -> Result<Fetched<CommitDetail>, UpstreamError> {
        let url = format!("{}/repos/{repo}/commits/{sha}", self.base_url);
        let (resp, rate_limit) = self.get(&url, None).await?;

        let body = resp.text().await?;
        let raw: RawCommit = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Malformed(format!("commit {repo}@{sha}: {e}")))?;

        Ok(Fetched {
            value: raw.into_detail(repo)?,
            rate_limit,
        })
    }
}

/// Extract rate limit information from API response headers
fn extract_rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .parse::<u32>()
        .ok()?;
    let reset_timestamp = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()?;
    let reset_at = DateTime::from_timestamp(reset_timestamp, 0)?;

    Some(RateLimitInfo {
        remaining,
        reset_at,
    })
}
