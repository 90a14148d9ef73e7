//! `ItemStore` trait — the single async interface to the work queue.
//!
//! Every status transition is one conditional statement, so any number of
//! producers and consumers (in one process or many) can share a store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::items::{
    ClaimToken, Claimed, Enrichment, ItemStatus, NewItem, StatusCounts, SweepReport, WorkItem,
};

/// Backend-agnostic persistence for work items.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Create tables and indexes. Safe to run repeatedly.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Ingestion ───────────────────────────────────────────────────

    /// Insert a `pending` item unless one with the same external id exists.
    ///
    /// Returns `true` when a row was inserted.
    async fn insert_if_absent(&self, item: &NewItem) -> Result<bool, DatabaseError>;

    // ── Claim protocol ──────────────────────────────────────────────

    /// Atomically move the oldest `pending` item to `processing` and return it.
    ///
    /// Concurrent callers never receive the same item.
    async fn claim_one(&self) -> Result<Option<Claimed>, DatabaseError>;

    /// Store enrichment results and mark the item `completed`.
    ///
    /// Fails with [`DatabaseError::StaleClaim`] if the claim is no longer current.
    async fn save_result(
        &self,
        claim: &ClaimToken,
        enrichment: &Enrichment,
    ) -> Result<(), DatabaseError>;

    /// Mark the claimed item `failed` with a reason.
    async fn mark_failed(&self, claim: &ClaimToken, reason: &str) -> Result<(), DatabaseError>;

    // ── Recovery ────────────────────────────────────────────────────

    /// Recover `processing` items claimed before `claimed_before`.
    ///
    /// Items under `max_attempts` go back to `pending`; the rest become `failed`.
    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<SweepReport, DatabaseError>;

    /// Return `failed` items last updated before `failed_before` to `pending`,
    /// provided they are under `max_attempts`.
    async fn readmit_failed(
        &self,
        failed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64, DatabaseError>;

    /// Explicitly return one `failed` item to `pending`.
    ///
    /// Returns `false` if the item does not exist or is not `failed`.
    async fn retry_failed(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, DatabaseError>;

    async fn get_by_external_id(&self, external_id: &str)
    -> Result<Option<WorkItem>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_items(
        &self,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, DatabaseError>;

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError>;
}
