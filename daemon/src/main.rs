//! Repopulse Daemon (repopulsed)
//!
//! Long-running service providing:
//! - Periodic polling of the repository event feed
//! - Commit-detail fetches and change analysis for pushed commits
//! - One-shot metric reports over the stored data
//!
//! Architecture:
//! - Configuration at ~/.repopulse/config.toml
//! - Storage backend selected once at startup (SQLite or partitioned KV)
//! - One background collection task, stopped on Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use repopulse_core::metrics::IntervalKind;
use repopulse_core::{storage, Clock, MetricsEngine, Storage, SystemClock};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod background;
mod budget;
mod collector;
mod config;
mod seen;
mod upstream;

use background::Scheduler;
use budget::RateBudget;
use collector::{Collector, CollectorSettings};
use config::Config;
use upstream::GitHubClient;

/// Window of the one-shot report, in hours
const REPORT_WINDOW_HOURS: i64 = 24;
/// Window of the per-repository report sections, in days
const REPORT_WINDOW_DAYS: i64 = 7;
const REPORT_TRENDING_LIMIT: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "repopulsed", version, about = "Repository event collector")]
struct Args {
    /// Config file (default: ~/.repopulse/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single collection cycle and exit
    #[arg(long)]
    once: bool,

    /// Print a JSON metrics report for the stored data and exit
    #[arg(long, conflicts_with = "once")]
    report: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let home = config::home_dir();
    std::fs::create_dir_all(home.join("logs"))
        .with_context(|| format!("Failed to create {}", home.display()))?;

    // Initialize logging: stdout plus a daily file under ~/.repopulse/logs
    let file_appender = tracing_appender::rolling::daily(home.join("logs"), "repopulsed.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("repopulsed=info".parse()?),
        )
        .with_ansi(false)
        .with_writer(std::io::stdout.and(file_writer))
        .init();

    info!("Starting repopulsed v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(|| home.join("config.toml"));
    let config = Config::load(&config_path)?;

    let storage_config = config.storage_config(&home)?;
    let storage: Arc<dyn Storage> = Arc::from(
        storage::open(&storage_config).context("Failed to open storage")?,
    );
    let health = storage.health_check();
    if health.healthy {
        info!(
            "Storage {} ready ({} events, {} commits)",
            health.backend, health.events, health.commits
        );
    } else {
        warn!(
            "Storage {} unhealthy: {}",
            health.backend,
            health.detail.as_deref().unwrap_or("unknown")
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if args.report {
        let engine = MetricsEngine::new(storage, clock, config.metrics.clone());
        let report = build_report(&engine, &config.collector.target_repos)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let token = config::resolve_token(&config.collector);
    if token.is_none() {
        info!(
            "No API token found, commit fetches limited to {}/h. Set GITHUB_TOKEN to raise it.",
            budget::UNAUTHENTICATED_HOURLY
        );
    }

    let upstream = GitHubClient::new(
        config.collector.api_base_url.clone(),
        token.as_deref(),
        Duration::from_secs(config.collector.request_timeout_secs),
        clock.clone(),
    )?;
    let budget = RateBudget::for_credential(token.is_some(), clock.clone());

    let settings = CollectorSettings {
        event_types: config.collector.event_types.iter().copied().collect(),
        target_repos: config.collector.target_repos.iter().cloned().collect(),
        pages_per_poll: config.collector.pages_per_poll,
        commit_concurrency: config.collector.commit_concurrency,
        seen_cache_capacity: config.collector.seen_cache_capacity,
    };
    let mut collector = Collector::new(settings, storage, Arc::new(upstream), clock, budget);

    if args.once {
        let report = collector.poll().await;
        println!("{}", serde_json::to_string_pretty(&collector.status())?);
        if report.is_none() {
            anyhow::bail!("Collection cycle failed");
        }
        return Ok(());
    }

    let scheduler = Scheduler::start(
        collector,
        Duration::from_secs(config.collector.poll_interval_secs),
    );

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown requested during {:?} phase, waiting for the current cycle",
        scheduler.status().phase
    );

    if let Some(collector) = scheduler.stop().await {
        let status = collector.status();
        info!(
            "Collector stopped after {} cycles ({} failed)",
            status.cycles, status.failed_cycles
        );
    }

    Ok(())
}

/// Snapshot of global activity plus per-repository health for tracked repos
fn build_report(engine: &MetricsEngine, repos: &[String]) -> Result<serde_json::Value> {
    let mut per_repo = serde_json::Map::new();
    for repo in repos {
        per_repo.insert(
            repo.clone(),
            json!({
                "event_counts": engine.event_counts(REPORT_WINDOW_HOURS, Some(repo))?,
                "health": engine.health_score(repo, REPORT_WINDOW_DAYS)?,
                "anomalies": engine.detect_anomalies(Some(repo), REPORT_WINDOW_HOURS)?,
                "pull_request_intervals":
                    engine.intervals(repo, IntervalKind::PullRequests, REPORT_WINDOW_DAYS)?,
                "issue_intervals":
                    engine.intervals(repo, IntervalKind::Issues, REPORT_WINDOW_DAYS)?,
                "developers": engine.developer_productivity(repo, REPORT_WINDOW_DAYS)?,
                "changes": engine.change_overview(repo, REPORT_WINDOW_DAYS)?,
            }),
        );
    }

    Ok(json!({
        "event_counts": engine.event_counts(REPORT_WINDOW_HOURS, None)?,
        "trending": engine.trending(REPORT_WINDOW_HOURS, REPORT_TRENDING_LIMIT)?,
        "anomalies": engine.detect_anomalies(None, REPORT_WINDOW_HOURS)?,
        "repositories": per_repo,
    }))
}
