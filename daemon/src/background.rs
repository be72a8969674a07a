//! Background collection task
//!
//! Runs the collector on a fixed interval until cancelled. Cancellation is
//! only observed between cycles: a cycle in flight always finishes its
//! storage writes first.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{Collector, CollectorStatus};

/// Handle to a running collection loop.
pub struct Scheduler {
    cancel: CancellationToken,
    status: watch::Receiver<CollectorStatus>,
    handle: JoinHandle<Collector>,
}

impl Scheduler {
    /// Spawn the collection loop, polling every `period`.
    pub fn start(collector: Collector, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let status = collector.subscribe();
        let handle = tokio::spawn(collection_task(collector, period, cancel.clone()));
        Self {
            cancel,
            status,
            handle,
        }
    }

    /// Latest published collector status.
    pub fn status(&self) -> CollectorStatus {
        self.status.borrow().clone()
    }

    /// Stop the loop and wait for the in-flight cycle to finish.
    ///
    /// # Returns
    /// The collector, or `None` if the task panicked.
    pub async fn stop(self) -> Option<Collector> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(collector) => Some(collector),
            Err(e) => {
                warn!("Collection task ended abnormally: {}", e);
                None
            }
        }
    }
}

/// Run the collector until `cancel` fires
async fn collection_task(
    mut collector: Collector,
    period: Duration,
    cancel: CancellationToken,
) -> Collector {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Background collection task started (interval: {}s)",
        period.as_secs()
    );

    loop {
        // Wait for next tick or shutdown
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Background collection task stopping due to shutdown");
                break;
            }
            _ = ticker.tick() => {}
        }

        debug!("Running collection cycle...");
        collector.poll().await;
    }

    collector
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use repopulse_core::{PartitionedStorage, SystemClock};

    use crate::budget::RateBudget;
    use crate::collector::CollectorSettings;
    use crate::upstream::{CommitDetail, Feed, FeedPage, Fetched, UpstreamClient, UpstreamError};

    struct QuietUpstream;

    #[async_trait]
    impl UpstreamClient for QuietUpstream {
        async fn fetch_events(
            &self,
            _feed: &Feed,
            _page: u32,
            _etag: Option<&str>,
        ) -> Result<Fetched<FeedPage>, UpstreamError> {
            Ok(Fetched {
                value: FeedPage::NotModified,
                rate_limit: None,
            })
        }

        async fn fetch_commit(
            &self,
            repo: &str,
            sha: &str,
        ) -> Result<Fetched<CommitDetail>, UpstreamError> {
            Err(UpstreamError::NotFound(format!("{repo}@{sha}")))
        }
    }

    #[tokio::test]
    async fn test_scheduler_polls_until_stopped() {
        let clock = Arc::new(SystemClock);
        let collector = Collector::new(
            CollectorSettings::default(),
            Arc::new(PartitionedStorage::in_memory(2)),
            Arc::new(QuietUpstream),
            clock.clone(),
            RateBudget::new(60, clock),
        );

        let scheduler = Scheduler::start(collector, Duration::from_millis(10));
        let mut status = scheduler.status.clone();
        // First tick fires immediately
        status.wait_for(|s| s.cycles >= 2).await.unwrap();

        let collector = scheduler.stop().await.unwrap();
        let final_status = collector.status();
        assert!(final_status.cycles >= 2);
        assert_eq!(final_status.failed_cycles, 0);
        assert_eq!(final_status.last_report.unwrap().not_modified, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_cycle() {
        let clock = Arc::new(SystemClock);
        let collector = Collector::new(
            CollectorSettings::default(),
            Arc::new(PartitionedStorage::in_memory(2)),
            Arc::new(QuietUpstream),
            clock.clone(),
            RateBudget::new(60, clock),
        );

        let scheduler = Scheduler::start(collector, Duration::from_secs(3600));
        scheduler.cancel.cancel();
        let collector = scheduler.stop().await.unwrap();
        assert!(collector.status().cycles <= 1);
    }
}
