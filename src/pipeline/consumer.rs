//! Enrichment consumer. Claims one item at a time, runs the three
//! capabilities concurrently, and records the outcome.
//!
//! A capability failure fails only the claimed item. A store failure while
//! recording the outcome is returned to the loop; the row stays `processing`
//! until the recovery sweep returns it to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::enrich::Enrichers;
use crate::error::{EnrichError, PipelineError};
use crate::items::{Claimed, Enrichment, MessagePayload};
use crate::pipeline::{PipelineStats, sleep_or_cancel};
use crate::store::ItemStore;

/// What happened to one claimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { id: String },
    Failed { id: String, reason: String },
}

/// One enrichment worker.
pub struct Consumer {
    store: Arc<dyn ItemStore>,
    enrichers: Enrichers,
    enrich_timeout: Duration,
    idle_interval: Duration,
    stats: Arc<PipelineStats>,
    name: String,
}

impl Consumer {
    pub fn new(store: Arc<dyn ItemStore>, enrichers: Enrichers) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            store,
            enrichers,
            enrich_timeout: defaults.enrich_timeout,
            idle_interval: defaults.idle_interval,
            stats: Arc::new(PipelineStats::default()),
            name: "consumer".into(),
        }
    }

    pub fn with_timing(mut self, enrich_timeout: Duration, idle_interval: Duration) -> Self {
        self.enrich_timeout = enrich_timeout;
        self.idle_interval = idle_interval;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Claim and process one item. `Ok(None)` means the queue had nothing
    /// claimable.
    pub async fn process_next(&self) -> Result<Option<ItemOutcome>, PipelineError> {
        let Some(Claimed { item, token }) = self.store.claim_one().await? else {
            return Ok(None);
        };
        debug!(worker = %self.name, id = %item.id, attempts = item.attempts, "Processing item");

        match self.enrich(&item.payload).await {
            Ok(enrichment) => {
                self.store.save_result(&token, &enrichment).await?;
                self.stats.add_completed();
                info!(
                    worker = %self.name,
                    id = %item.id,
                    todos = enrichment.todos.len(),
                    flags = enrichment.flags.len(),
                    "Item completed"
                );
                Ok(Some(ItemOutcome::Completed { id: item.id }))
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_failed(&token, &reason).await?;
                self.stats.add_failed();
                warn!(worker = %self.name, id = %item.id, reason = %reason, "Item failed");
                Ok(Some(ItemOutcome::Failed {
                    id: item.id,
                    reason,
                }))
            }
        }
    }

    async fn enrich(&self, payload: &MessagePayload) -> Result<Enrichment, EnrichError> {
        let timeout = self.enrich_timeout;
        let (summary, todos, flags) = tokio::try_join!(
            bounded(
                "summarize",
                timeout,
                self.enrichers.summarizer.summarize(payload)
            ),
            bounded(
                "extract_todos",
                timeout,
                self.enrichers.todos.extract_todos(payload)
            ),
            bounded(
                "classify_flags",
                timeout,
                self.enrichers
                    .flags
                    .classify_flags(payload, &self.enrichers.taxonomy)
            ),
        )?;
        Ok(Enrichment {
            summary,
            todos,
            flags,
        })
    }

    /// Process items until cancelled. Cancellation is observed between
    /// items, never in the middle of one.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.name, "Consumer started");

        while !cancel.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = %self.name, error = %e, "Consumer step failed"),
            }
            if sleep_or_cancel(&cancel, self.idle_interval).await {
                break;
            }
        }

        info!(worker = %self.name, "Consumer stopped");
    }
}

async fn bounded<T>(
    capability: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<T, EnrichError>>,
) -> Result<T, EnrichError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| EnrichError::Timeout {
            capability,
            timeout,
        })?
}
