//! Background loops: ingestion, enrichment, crash recovery, and the
//! supervisor that owns them.
//!
//! ```text
//! Mailbox ──► Producer ──► ItemStore (pending)
//!                              │ claim_one
//!                              ▼
//!                          Consumer ×N ──► Enrichers ──► ItemStore (completed | failed)
//!                              ▲
//!             RecoverySweeper ─┘ (stale processing → pending)
//! ```

pub mod consumer;
pub mod producer;
pub mod recovery;
pub mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use consumer::{Consumer, ItemOutcome};
pub use producer::{IngestReport, Producer};
pub use recovery::{RecoveryReport, RecoverySweeper};
pub use supervisor::{LoopStatus, PipelineDeps, Supervisor, SupervisorStatus};

/// Process-wide counters. Reporting only; nothing reads them to make decisions.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ingested: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ingested: u64,
    pub completed: u64,
    pub failed: u64,
    pub recovered: u64,
}

impl PipelineStats {
    pub(crate) fn add_ingested(&self, n: u64) {
        self.ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_recovered(&self, n: u64) {
        self.recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `true` if cancelled.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
