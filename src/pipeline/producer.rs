//! Ingestion producer — polls the mailbox and admits new messages as
//! `pending` items.
//!
//! Deduplication is the store's job (`insert_if_absent` on the external id),
//! so a fetch may safely return messages that were already ingested.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::mailbox::{Mailbox, is_sender_allowed, parse_email};
use crate::pipeline::{PipelineStats, sleep_or_cancel};
use crate::store::ItemStore;

/// Counts from one ingestion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Messages returned by the mailbox.
    pub fetched: usize,
    /// New `pending` items created.
    pub inserted: usize,
    /// Messages whose external id was already queued.
    pub duplicates: usize,
    /// Unparseable, filtered, or failed to store. Retried next cycle where
    /// applicable.
    pub skipped: usize,
}

/// Polls one mailbox into one store.
pub struct Producer {
    mailbox: Arc<dyn Mailbox>,
    store: Arc<dyn ItemStore>,
    allowed_senders: Vec<String>,
    own_address: Option<String>,
    fetch_interval: Duration,
    fetch_error_interval: Duration,
    stats: Arc<PipelineStats>,
}

impl Producer {
    pub fn new(mailbox: Arc<dyn Mailbox>, store: Arc<dyn ItemStore>) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            mailbox,
            store,
            allowed_senders: Vec::new(),
            own_address: None,
            fetch_interval: defaults.fetch_interval,
            fetch_error_interval: defaults.fetch_error_interval,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Only ingest mail from `allowed` senders (empty = everyone), and never
    /// mail sent from `own_address`.
    pub fn with_sender_filter(mut self, allowed: Vec<String>, own_address: Option<String>) -> Self {
        self.allowed_senders = allowed;
        self.own_address = own_address;
        self
    }

    pub fn with_intervals(mut self, fetch: Duration, on_error: Duration) -> Self {
        self.fetch_interval = fetch;
        self.fetch_error_interval = on_error;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    fn accepts_sender(&self, sender: &str) -> bool {
        if self
            .own_address
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(sender))
        {
            return false;
        }
        is_sender_allowed(&self.allowed_senders, sender)
    }

    /// Run one fetch → parse → insert cycle.
    ///
    /// Only a mailbox failure aborts the cycle; per-message problems are
    /// counted and logged.
    pub async fn ingest_once(&self) -> Result<IngestReport, PipelineError> {
        let raw_messages = self.mailbox.fetch_all().await?;
        let mut report = IngestReport {
            fetched: raw_messages.len(),
            ..IngestReport::default()
        };

        for raw in &raw_messages {
            let item = match parse_email(raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(uid = %raw.uid, error = %e, "Skipping unparseable message");
                    report.skipped += 1;
                    continue;
                }
            };

            if !self.accepts_sender(&item.payload.sender) {
                debug!(sender = %item.payload.sender, "Sender not allowed, skipping");
                report.skipped += 1;
                continue;
            }

            match self.store.insert_if_absent(&item).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    error!(external_id = %item.external_id, error = %e, "Failed to queue message");
                    report.skipped += 1;
                }
            }
        }

        self.stats.add_ingested(report.inserted as u64);
        info!(
            mailbox = self.mailbox.name(),
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "Ingestion cycle complete"
        );
        Ok(report)
    }

    /// Ingest on a timer until cancelled. A cycle in progress is finished
    /// before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            mailbox = self.mailbox.name(),
            interval_secs = self.fetch_interval.as_secs(),
            "Producer started"
        );

        while !cancel.is_cancelled() {
            let wait = match self.ingest_once().await {
                Ok(_) => self.fetch_interval,
                Err(e) => {
                    error!(error = %e, "Ingestion cycle failed");
                    self.fetch_error_interval
                }
            };
            if sleep_or_cancel(&cancel, wait).await {
                break;
            }
        }

        info!("Producer stopped");
    }
}
