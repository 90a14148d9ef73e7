//! libSQL backend — async `ItemStore` implementation.
//!
//! Supports local file, in-memory, and remote (`libsql://`) databases. Every
//! state change is a single conditional statement: the claim is an
//! `UPDATE ... RETURNING` over the oldest pending row, and result writes are
//! guarded by the claim token, so the store stays correct when many workers
//! share it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::items::{
    ClaimToken, Claimed, Enrichment, Flag, ItemStatus, MessagePayload, NewItem, StatusCounts,
    SweepReport, TodoItem, WorkItem,
};
use crate::store::migrations;
use crate::store::traits::ItemStore;

/// Milliseconds a local writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    ///
    /// The file is switched to WAL mode so several processes can share it.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        for pragma in [
            format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"),
            "PRAGMA journal_mode = WAL".to_string(),
        ] {
            conn.query(&pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Connect to a remote libSQL server and run migrations.
    pub async fn new_remote(url: &str, token: &SecretString) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), token.expose_secret().to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to connect to {url}: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(url = url, "Remote database connected");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_items(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so lexical order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_str() -> String {
    format_datetime(&Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

const ITEM_COLUMNS: &str = "id, external_id, subject, sender, recipient, body, timestamp, \
    attachments, status, summary, todos, flags, attempts, last_error, claimed_at, created_at, \
    updated_at";

/// Map a libsql Row to a WorkItem.
///
/// Column order matches ITEM_COLUMNS.
fn row_to_item(row: &libsql::Row) -> Result<WorkItem, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let timestamp_str: Option<String> = row.get(6).map_err(get_err)?;
    let attachments_str: String = row.get(7).map_err(get_err)?;
    let status_str: String = row.get(8).map_err(get_err)?;
    let todos_str: String = row.get(10).map_err(get_err)?;
    let flags_str: String = row.get(11).map_err(get_err)?;
    let attempts: i64 = row.get(12).map_err(get_err)?;
    let claimed_at_str: Option<String> = row.get(14).map_err(get_err)?;
    let created_str: String = row.get(15).map_err(get_err)?;
    let updated_str: String = row.get(16).map_err(get_err)?;

    let status: ItemStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let attachments: Vec<String> = from_json("attachments", &attachments_str)?;
    let todos: Vec<TodoItem> = from_json("todos", &todos_str)?;
    let flags: Vec<Flag> = from_json("flags", &flags_str)?;

    Ok(WorkItem {
        id: row.get(0).map_err(get_err)?,
        external_id: row.get(1).map_err(get_err)?,
        payload: MessagePayload {
            subject: row.get(2).map_err(get_err)?,
            sender: row.get(3).map_err(get_err)?,
            recipient: row.get(4).map_err(get_err)?,
            body: row.get(5).map_err(get_err)?,
            timestamp: parse_optional_datetime(&timestamp_str),
            attachments,
        },
        status,
        summary: row.get(9).map_err(get_err)?,
        todos,
        flags,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get(13).map_err(get_err)?,
        claimed_at: parse_optional_datetime(&claimed_at_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ItemStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Ingestion ───────────────────────────────────────────────────

    async fn insert_if_absent(&self, item: &NewItem) -> Result<bool, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let payload = &item.payload;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO work_items (id, external_id, subject, sender, recipient, body,
                    timestamp, attachments, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id.clone(),
                    item.external_id.clone(),
                    payload.subject.clone(),
                    payload.sender.clone(),
                    payload.recipient.clone(),
                    payload.body.clone(),
                    opt_text_owned(payload.timestamp.as_ref().map(format_datetime)),
                    to_json(&payload.attachments)?,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_if_absent: {e}")))?;

        if inserted > 0 {
            debug!(id = %id, external_id = %item.external_id, "Item queued");
        }
        Ok(inserted > 0)
    }

    // ── Claim protocol ──────────────────────────────────────────────

    async fn claim_one(&self) -> Result<Option<Claimed>, DatabaseError> {
        let token = Uuid::new_v4().to_string();
        let now = now_str();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE work_items
                     SET status = 'processing', claim_token = ?1, claimed_at = ?2,
                         updated_at = ?2, attempts = attempts + 1
                     WHERE status = 'pending'
                       AND id = (SELECT id FROM work_items WHERE status = 'pending'
                                 ORDER BY created_at ASC, rowid ASC LIMIT 1)
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![token.clone(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_one: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_one: {e}")))?;

        match row {
            Some(row) => {
                let item = row_to_item(&row)?;
                debug!(id = %item.id, attempts = item.attempts, "Item claimed");
                Ok(Some(Claimed {
                    token: ClaimToken {
                        item_id: item.id.clone(),
                        token,
                    },
                    item,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_result(
        &self,
        claim: &ClaimToken,
        enrichment: &Enrichment,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'completed', summary = ?1, todos = ?2, flags = ?3,
                     last_error = NULL, claim_token = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = 'processing' AND claim_token = ?6",
                params![
                    enrichment.summary.clone(),
                    to_json(&enrichment.todos)?,
                    to_json(&enrichment.flags)?,
                    now_str(),
                    claim.item_id.clone(),
                    claim.token.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_result: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::StaleClaim {
                id: claim.item_id.clone(),
            });
        }
        debug!(id = %claim.item_id, "Item completed");
        Ok(())
    }

    async fn mark_failed(&self, claim: &ClaimToken, reason: &str) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'failed', last_error = ?1, claim_token = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing' AND claim_token = ?4",
                params![
                    reason,
                    now_str(),
                    claim.item_id.clone(),
                    claim.token.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::StaleClaim {
                id: claim.item_id.clone(),
            });
        }
        debug!(id = %claim.item_id, reason = reason, "Item failed");
        Ok(())
    }

    // ── Recovery ────────────────────────────────────────────────────

    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<SweepReport, DatabaseError> {
        let cutoff = format_datetime(&claimed_before);
        let now = now_str();
        let conn = self.conn();

        let exhausted = conn
            .execute(
                "UPDATE work_items
                 SET status = 'failed', last_error = 'processing timed out',
                     claim_token = NULL, updated_at = ?1
                 WHERE status = 'processing' AND claimed_at < ?2 AND attempts >= ?3",
                params![now.clone(), cutoff.clone(), i64::from(max_attempts)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale: {e}")))?;

        let requeued = conn
            .execute(
                "UPDATE work_items
                 SET status = 'pending', claim_token = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE status = 'processing' AND claimed_at < ?2 AND attempts < ?3",
                params![now, cutoff, i64::from(max_attempts)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale: {e}")))?;

        Ok(SweepReport {
            requeued,
            exhausted,
        })
    }

    async fn readmit_failed(
        &self,
        failed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE work_items
                 SET status = 'pending', summary = NULL, todos = '[]', flags = '[]',
                     last_error = NULL, claim_token = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE status = 'failed' AND updated_at < ?2 AND attempts < ?3",
                params![
                    now_str(),
                    format_datetime(&failed_before),
                    i64::from(max_attempts)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("readmit_failed: {e}")))
    }

    async fn retry_failed(&self, id: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'pending', summary = NULL, todos = '[]', flags = '[]',
                     attempts = 0, last_error = NULL, claim_token = NULL, claimed_at = NULL,
                     updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![now_str(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_failed: {e}")))?;
        Ok(updated > 0)
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, DatabaseError> {
        let items = self
            .query_items(
                "get_item",
                &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<WorkItem>, DatabaseError> {
        let items = self
            .query_items(
                "get_by_external_id",
                &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE external_id = ?1"),
                params![external_id],
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn list_items(
        &self,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => {
                self.query_items(
                    "list_items",
                    &format!(
                        "SELECT {ITEM_COLUMNS} FROM work_items WHERE status = ?1
                         ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit],
                )
                .await
            }
            None => {
                self.query_items(
                    "list_items",
                    &format!(
                        "SELECT {ITEM_COLUMNS} FROM work_items
                         ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                    ),
                    params![limit],
                )
                .await
            }
        }
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM work_items GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?
        {
            let status_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;
            if let Ok(status) = status_str.parse::<ItemStatus>() {
                counts.set(status, count.max(0) as u64);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::items::Priority;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_item(external_id: &str) -> NewItem {
        NewItem {
            external_id: external_id.to_string(),
            payload: MessagePayload {
                subject: format!("Subject {external_id}"),
                sender: "alice@example.com".into(),
                recipient: "team@example.com".into(),
                body: "Please review the attached proposal by Friday.".into(),
                timestamp: Some(Utc::now()),
                attachments: vec!["proposal.pdf".into()],
            },
        }
    }

    fn sample_enrichment() -> Enrichment {
        Enrichment {
            summary: "Alice asks for a proposal review.".into(),
            todos: vec![TodoItem {
                task: "Review proposal".into(),
                priority: Priority::High,
                due_date: Some("Friday".into()),
            }],
            flags: vec![Flag::new("requires_response", "Email requires a response")],
        }
    }

    // ── Ingestion ───────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let db = test_db().await;
        assert!(db.insert_if_absent(&make_item("m1")).await.unwrap());
        assert!(!db.insert_if_absent(&make_item("m1")).await.unwrap());

        let counts = db.status_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn inserted_item_round_trips_payload() {
        let db = test_db().await;
        let new = make_item("m1");
        db.insert_if_absent(&new).await.unwrap();

        let item = db.get_by_external_id("m1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.payload.subject, new.payload.subject);
        assert_eq!(item.payload.attachments, vec!["proposal.pdf".to_string()]);
        assert_eq!(item.attempts, 0);
        assert!(item.summary.is_none());
        assert!(item.todos.is_empty());

        let by_id = db.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(by_id.external_id, "m1");
    }

    #[tokio::test]
    async fn duplicate_does_not_touch_existing_row() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();
        db.save_result(&claimed.token, &sample_enrichment())
            .await
            .unwrap();

        assert!(!db.insert_if_absent(&make_item("m1")).await.unwrap());
        let item = db.get_by_external_id("m1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn get_missing_item_returns_none() {
        let db = test_db().await;
        assert!(db.get_item("nope").await.unwrap().is_none());
        assert!(db.get_by_external_id("nope").await.unwrap().is_none());
    }

    // ── Claim protocol ──────────────────────────────────────────────

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let db = test_db().await;
        assert!(db.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_marks_processing() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("first")).await.unwrap();
        db.insert_if_absent(&make_item("second")).await.unwrap();

        let claimed = db.claim_one().await.unwrap().unwrap();
        assert_eq!(claimed.item.external_id, "first");
        assert_eq!(claimed.item.status, ItemStatus::Processing);
        assert_eq!(claimed.item.attempts, 1);
        assert!(claimed.item.claimed_at.is_some());
        assert_eq!(claimed.token.item_id, claimed.item.id);

        let next = db.claim_one().await.unwrap().unwrap();
        assert_eq!(next.item.external_id, "second");
        assert!(db.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_result_completes_item() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();

        db.save_result(&claimed.token, &sample_enrichment())
            .await
            .unwrap();

        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(
            item.summary.as_deref(),
            Some("Alice asks for a proposal review.")
        );
        assert_eq!(item.todos.len(), 1);
        assert_eq!(item.todos[0].priority, Priority::High);
        assert_eq!(item.flags[0].kind, "requires_response");
    }

    #[tokio::test]
    async fn save_result_with_stale_token_is_rejected() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();

        let forged = ClaimToken {
            item_id: claimed.item.id.clone(),
            token: "not-the-token".into(),
        };
        let err = db
            .save_result(&forged, &sample_enrichment())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::StaleClaim { .. }));

        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
    }

    #[tokio::test]
    async fn completed_item_cannot_be_saved_again() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();
        db.save_result(&claimed.token, &sample_enrichment())
            .await
            .unwrap();

        assert!(db
            .mark_failed(&claimed.token, "late failure")
            .await
            .is_err());
        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn mark_failed_records_reason_and_leaves_no_results() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();

        db.mark_failed(&claimed.token, "summarize: timed out")
            .await
            .unwrap();

        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("summarize: timed out"));
        assert!(item.summary.is_none());
        assert!(item.todos.is_empty());
        assert!(item.flags.is_empty());
        assert!(db.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_item_once() {
        let db = Arc::new(test_db().await);
        for i in 0..20 {
            db.insert_if_absent(&make_item(&format!("m{i}")))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(claimed) = db.claim_one().await.unwrap() {
                    mine.push(claimed.item.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    // ── Recovery ────────────────────────────────────────────────────

    #[tokio::test]
    async fn requeue_stale_returns_item_to_pending() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();

        let report = db
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), 3)
            .await
            .unwrap();
        assert_eq!(report, SweepReport { requeued: 1, exhausted: 0 });

        // The first worker's late write is rejected.
        assert!(db
            .save_result(&claimed.token, &sample_enrichment())
            .await
            .is_err());

        let again = db.claim_one().await.unwrap().unwrap();
        assert_eq!(again.item.id, claimed.item.id);
        assert_eq!(again.item.attempts, 2);
        assert_ne!(again.token, claimed.token);
    }

    #[tokio::test]
    async fn requeue_stale_ignores_recent_claims() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        db.claim_one().await.unwrap().unwrap();

        let report = db
            .requeue_stale(Utc::now() - chrono::Duration::seconds(600), 3)
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(db.status_counts().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn requeue_stale_fails_exhausted_items() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();

        let report = db
            .requeue_stale(Utc::now() + chrono::Duration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(report, SweepReport { requeued: 0, exhausted: 1 });

        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("processing timed out"));
    }

    #[tokio::test]
    async fn readmit_failed_respects_attempt_cap() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let claimed = db.claim_one().await.unwrap().unwrap();
        db.mark_failed(&claimed.token, "boom").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.readmit_failed(later, 1).await.unwrap(), 0);
        assert_eq!(db.readmit_failed(later, 2).await.unwrap(), 1);

        let item = db.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn retry_failed_only_affects_failed_items() {
        let db = test_db().await;
        db.insert_if_absent(&make_item("m1")).await.unwrap();
        let item = db.get_by_external_id("m1").await.unwrap().unwrap();
        assert!(!db.retry_failed(&item.id).await.unwrap());

        let claimed = db.claim_one().await.unwrap().unwrap();
        db.mark_failed(&claimed.token, "boom").await.unwrap();
        assert!(db.retry_failed(&item.id).await.unwrap());

        let item = db.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.last_error.is_none());
        assert!(!db.retry_failed("missing").await.unwrap());
    }

    // ── Queries ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_items_filters_and_orders_newest_first() {
        let db = test_db().await;
        for id in ["a", "b", "c"] {
            db.insert_if_absent(&make_item(id)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let claimed = db.claim_one().await.unwrap().unwrap();
        db.save_result(&claimed.token, &sample_enrichment())
            .await
            .unwrap();

        let all = db.list_items(None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let pending = db.list_items(Some(ItemStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        let completed = db
            .list_items(Some(ItemStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed[0].external_id, "a");

        assert_eq!(db.list_items(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_counts_cover_every_state() {
        let db = test_db().await;
        for id in ["a", "b", "c", "d"] {
            db.insert_if_absent(&make_item(id)).await.unwrap();
        }
        let done = db.claim_one().await.unwrap().unwrap();
        db.save_result(&done.token, &sample_enrichment())
            .await
            .unwrap();
        let failed = db.claim_one().await.unwrap().unwrap();
        db.mark_failed(&failed.token, "boom").await.unwrap();
        db.claim_one().await.unwrap().unwrap();

        let counts = db.status_counts().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn init_schema_is_repeatable() {
        let db = test_db().await;
        db.init_schema().await.unwrap();
        db.insert_if_absent(&make_item("m1")).await.unwrap();
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_if_absent(&make_item("m1")).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_by_external_id("m1").await.unwrap().is_some());
    }
}
