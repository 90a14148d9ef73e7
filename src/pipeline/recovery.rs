//! Recovery sweep: returns work orphaned by crashed consumers to the queue.
//!
//! A consumer that dies mid-item leaves its row in `processing`. Once the
//! claim is older than `stale_after`, the sweep requeues it (or fails it when
//! the attempt cap is reached). With a `failed_retry_after` policy it also
//! re-admits failed items that still have attempts left.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::DatabaseError;
use crate::items::SweepReport;
use crate::pipeline::{PipelineStats, sleep_or_cancel};
use crate::store::ItemStore;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub stale: SweepReport,
    /// Failed items returned to `pending` by the retry policy.
    pub readmitted: u64,
}

pub struct RecoverySweeper {
    store: Arc<dyn ItemStore>,
    stale_after: Duration,
    sweep_interval: Duration,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl RecoverySweeper {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            store,
            stale_after: defaults.stale_after,
            sweep_interval: defaults.sweep_interval,
            retry: defaults.retry,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_timing(mut self, stale_after: Duration, sweep_interval: Duration) -> Self {
        self.stale_after = stale_after;
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub async fn sweep_once(&self) -> Result<RecoveryReport, DatabaseError> {
        let now = Utc::now();
        let stale = self
            .store
            .requeue_stale(cutoff(now, self.stale_after), self.retry.max_attempts)
            .await?;

        let readmitted = match self.retry.failed_retry_after {
            Some(after) => {
                self.store
                    .readmit_failed(cutoff(now, after), self.retry.max_attempts)
                    .await?
            }
            None => 0,
        };

        let report = RecoveryReport { stale, readmitted };
        self.stats.add_recovered(stale.requeued + readmitted);
        if stale.requeued > 0 || stale.exhausted > 0 || readmitted > 0 {
            warn!(
                requeued = stale.requeued,
                exhausted = stale.exhausted,
                readmitted,
                "Recovered orphaned items"
            );
        }
        Ok(report)
    }

    /// Sweep at startup, then every `sweep_interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            stale_after_secs = self.stale_after.as_secs(),
            interval_secs = self.sweep_interval.as_secs(),
            "Recovery sweeper started"
        );

        while !cancel.is_cancelled() {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Recovery sweep failed");
            }
            if sleep_or_cancel(&cancel, self.sweep_interval).await {
                break;
            }
        }

        info!("Recovery sweeper stopped");
    }
}

/// `now - age`, saturating at the earliest representable time.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
