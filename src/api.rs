//! REST endpoints for inspecting the queue and triggering work by hand.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::enrich::Enrichers;
use crate::error::EnrichError;
use crate::items::{Flag, ItemStatus, MessagePayload, TodoItem};
use crate::mailbox::{Mailbox, OutgoingEmail};
use crate::pipeline::{Producer, Supervisor};
use crate::store::ItemStore;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ItemStore>,
    /// None when this process only serves reads.
    pub supervisor: Option<Arc<Supervisor>>,
    /// Producer used by `POST /ingest`. None if no mailbox is configured.
    pub producer: Option<Arc<Producer>>,
    /// Mailbox used by `POST /send`.
    pub mailbox: Option<Arc<dyn Mailbox>>,
    /// Capabilities behind the on-demand enrichment endpoints.
    pub enrichers: Option<Enrichers>,
}

/// Build the Axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/items", get(list_items))
        .route("/items/{id}", get(get_item))
        .route("/items/{id}/retry", post(retry_item))
        .route("/ingest", post(ingest))
        .route("/send", post(send))
        .route("/summarize", post(summarize))
        .route("/extract_todos", post(extract_todos))
        .route("/get_flags", post(get_flags))
        .route("/todos", get(list_todos))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// GET /status
///
/// Queue counts by state, plus loop liveness when a pipeline runs here.
async fn status(State(state): State<ApiState>) -> Response {
    match state.store.status_counts().await {
        Ok(counts) => {
            let pipeline = state.supervisor.as_ref().map(|s| s.status());
            Json(json!({
                "total": counts.total(),
                "counts": counts,
                "pipeline": pipeline,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to read status counts");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Items ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

/// GET /items?status=&limit=
async fn list_items(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> Response {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<ItemStatus>() {
            Ok(status) => Some(status),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match state.store.list_items(status, limit).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list items");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /items/{id}
async fn get_item(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_item(&id).await {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Item not found"),
        Err(e) => {
            error!(id = %id, error = %e, "Failed to load item");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /items/{id}/retry
///
/// Returns a failed item to the queue. 409 if the item is in any other state.
async fn retry_item(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.retry_failed(&id).await {
        Ok(true) => {
            info!(id = %id, "Item re-queued by request");
            Json(json!({"status": "ok", "id": id})).into_response()
        }
        Ok(false) => match state.store.get_item(&id).await {
            Ok(Some(item)) => error_response(
                StatusCode::CONFLICT,
                format!("Item is {}, only failed items can be retried", item.status),
            ),
            Ok(None) => error_response(StatusCode::NOT_FOUND, "Item not found"),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => {
            error!(id = %id, error = %e, "Failed to retry item");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct TodoEntry {
    item_id: String,
    subject: String,
    #[serde(flatten)]
    todo: TodoItem,
}

/// GET /todos?limit=
///
/// Action items from completed items, newest item first.
async fn list_todos(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> Response {
    let limit = query.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    match state
        .store
        .list_items(Some(ItemStatus::Completed), limit)
        .await
    {
        Ok(items) => {
            let todos: Vec<TodoEntry> = items
                .into_iter()
                .flat_map(|item| {
                    let subject = item.payload.subject;
                    let item_id = item.id;
                    item.todos.into_iter().map(move |todo| TodoEntry {
                        item_id: item_id.clone(),
                        subject: subject.clone(),
                        todo,
                    })
                })
                .collect();
            Json(todos).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list todos");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── On-demand enrichment ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnrichRequest {
    email: MessagePayload,
}

#[derive(Debug, Deserialize)]
struct FlagsRequest {
    email: MessagePayload,
    /// Candidates to choose from. Omitted means the configured taxonomy.
    available_flags: Option<Vec<Flag>>,
}

fn enrich_error_response(e: EnrichError) -> Response {
    warn!(error = %e, "On-demand enrichment failed");
    let status = match e {
        EnrichError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EnrichError::Llm { .. } | EnrichError::InvalidResponse { .. } => StatusCode::BAD_GATEWAY,
    };
    error_response(status, e.to_string())
}

fn no_enrichers() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Enrichment is not configured")
}

/// POST /summarize
async fn summarize(State(state): State<ApiState>, Json(req): Json<EnrichRequest>) -> Response {
    let Some(enrichers) = state.enrichers else {
        return no_enrichers();
    };
    match enrichers.summarizer.summarize(&req.email).await {
        Ok(summary) => Json(json!({"summary": summary})).into_response(),
        Err(e) => enrich_error_response(e),
    }
}

/// POST /extract_todos
async fn extract_todos(State(state): State<ApiState>, Json(req): Json<EnrichRequest>) -> Response {
    let Some(enrichers) = state.enrichers else {
        return no_enrichers();
    };
    match enrichers.todos.extract_todos(&req.email).await {
        Ok(todos) => Json(json!({"todos": todos})).into_response(),
        Err(e) => enrich_error_response(e),
    }
}

/// POST /get_flags
///
/// Classifies against the caller's candidates. An empty list returns no flags.
async fn get_flags(State(state): State<ApiState>, Json(req): Json<FlagsRequest>) -> Response {
    let Some(enrichers) = state.enrichers else {
        return no_enrichers();
    };
    let candidates = req.available_flags.unwrap_or(enrichers.taxonomy);
    if candidates.is_empty() {
        return Json(json!({"flags": []})).into_response();
    }
    match enrichers.flags.classify_flags(&req.email, &candidates).await {
        Ok(flags) => Json(json!({"flags": flags})).into_response(),
        Err(e) => enrich_error_response(e),
    }
}

// ── Triggers ────────────────────────────────────────────────────────────

/// POST /ingest
///
/// Runs one ingestion cycle now, alongside the scheduled ones.
async fn ingest(State(state): State<ApiState>) -> Response {
    let Some(producer) = state.producer else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No mailbox configured");
    };
    match producer.ingest_once().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "Manual ingestion failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    to: String,
    subject: String,
    body: String,
}

/// POST /send
async fn send(State(state): State<ApiState>, Json(req): Json<SendRequest>) -> Response {
    let Some(mailbox) = state.mailbox else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No mailbox configured");
    };
    if req.to.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Recipient is required");
    }

    let email = OutgoingEmail {
        to: req.to,
        subject: req.subject,
        body: req.body,
    };
    match mailbox.send(&email).await {
        Ok(()) => {
            info!(to = %email.to, "Email sent");
            Json(json!({"status": "sent"})).into_response()
        }
        Err(e) => {
            warn!(to = %email.to, error = %e, "Failed to send email");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::enrich::{FlagClassifier, Summarizer, TodoExtractor};
    use crate::error::MailboxError;
    use crate::items::{Enrichment, NewItem, Priority};
    use crate::mailbox::RawEmail;
    use crate::store::LibSqlBackend;

    #[derive(Default)]
    struct RecordingMailbox {
        sent: Mutex<Vec<OutgoingEmail>>,
    }

    #[async_trait]
    impl Mailbox for RecordingMailbox {
        fn name(&self) -> &str {
            "recording"
        }

        async fn fetch_all(&self) -> Result<Vec<RawEmail>, MailboxError> {
            Ok(vec![RawEmail {
                uid: "1".into(),
                bytes: b"From: a@example.com\r\nTo: me@example.com\r\nSubject: Hi\r\nMessage-ID: <api-1@example.com>\r\n\r\nHello\r\n".to_vec(),
            }])
        }

        async fn send(&self, email: &OutgoingEmail) -> Result<(), MailboxError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    /// Answers from the message text; `flags` picks candidates named in the body.
    #[derive(Default)]
    struct KeywordEnricher {
        flag_calls: Mutex<usize>,
    }

    #[async_trait]
    impl Summarizer for KeywordEnricher {
        async fn summarize(&self, payload: &MessagePayload) -> Result<String, EnrichError> {
            if payload.body.is_empty() {
                return Err(EnrichError::InvalidResponse {
                    capability: "summarize",
                    reason: "empty summary".into(),
                });
            }
            Ok(format!("About: {}", payload.subject))
        }
    }

    #[async_trait]
    impl TodoExtractor for KeywordEnricher {
        async fn extract_todos(&self, payload: &MessagePayload) -> Result<Vec<TodoItem>, EnrichError> {
            Ok(payload
                .body
                .lines()
                .filter_map(|l| l.strip_prefix("TODO "))
                .map(|task| TodoItem {
                    task: task.to_string(),
                    priority: Priority::Medium,
                    due_date: None,
                })
                .collect())
        }
    }

    #[async_trait]
    impl FlagClassifier for KeywordEnricher {
        async fn classify_flags(
            &self,
            payload: &MessagePayload,
            candidates: &[Flag],
        ) -> Result<Vec<Flag>, EnrichError> {
            *self.flag_calls.lock().unwrap() += 1;
            Ok(candidates
                .iter()
                .filter(|f| payload.body.contains(&f.kind))
                .cloned()
                .collect())
        }
    }

    fn keyword_enrichers(enricher: Arc<KeywordEnricher>) -> Enrichers {
        Enrichers {
            summarizer: enricher.clone(),
            todos: enricher.clone(),
            flags: enricher,
            taxonomy: Flag::default_taxonomy(),
        }
    }

    fn email_json(body: &str) -> Value {
        json!({
            "subject": "Quarterly report",
            "sender": "boss@example.com",
            "recipient": "me@example.com",
            "body": body,
        })
    }

    fn new_item(id: &str) -> NewItem {
        NewItem {
            external_id: id.to_string(),
            payload: MessagePayload {
                subject: format!("subject {id}"),
                sender: "a@example.com".into(),
                recipient: "b@example.com".into(),
                body: "body".into(),
                timestamp: None,
                attachments: Vec::new(),
            },
        }
    }

    async fn bare_state() -> (ApiState, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let state = ApiState {
            store: store.clone(),
            supervisor: None,
            producer: None,
            mailbox: None,
            enrichers: None,
        };
        (state, store)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = bare_state().await;
        let (status, body) = call(router(state), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let (state, store) = bare_state().await;
        store.insert_if_absent(&new_item("m1")).await.unwrap();
        store.insert_if_absent(&new_item("m2")).await.unwrap();
        store.claim_one().await.unwrap().unwrap();

        let (status, body) = call(router(state), "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["counts"]["pending"], 1);
        assert_eq!(body["counts"]["processing"], 1);
        assert!(body["pipeline"].is_null());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_rejects_unknown() {
        let (state, store) = bare_state().await;
        store.insert_if_absent(&new_item("m1")).await.unwrap();
        store.insert_if_absent(&new_item("m2")).await.unwrap();
        store.claim_one().await.unwrap().unwrap();
        let app = router(state);

        let (status, body) = call(app.clone(), "GET", "/items?status=pending", None).await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["external_id"], "m2");

        let (status, body) = call(app.clone(), "GET", "/items?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(app, "GET", "/items?status=done", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_item_found_and_missing() {
        let (state, store) = bare_state().await;
        store.insert_if_absent(&new_item("m1")).await.unwrap();
        let id = store.get_by_external_id("m1").await.unwrap().unwrap().id;
        let app = router(state);

        let (status, body) = call(app.clone(), "GET", &format!("/items/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["payload"]["subject"], "subject m1");

        let (status, _) = call(app, "GET", "/items/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_only_moves_failed_items() {
        let (state, store) = bare_state().await;
        store.insert_if_absent(&new_item("m1")).await.unwrap();
        store.insert_if_absent(&new_item("m2")).await.unwrap();
        let claimed = store.claim_one().await.unwrap().unwrap();
        store.mark_failed(&claimed.token, "boom").await.unwrap();
        let pending_id = store.get_by_external_id("m2").await.unwrap().unwrap().id;
        let app = router(state);

        let (status, _) = call(
            app.clone(),
            "POST",
            &format!("/items/{}/retry", claimed.item.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let item = store.get_item(&claimed.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);

        let (status, _) = call(app.clone(), "POST", &format!("/items/{pending_id}/retry"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(app, "POST", "/items/nope/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn triggers_unavailable_without_mailbox() {
        let (state, _) = bare_state().await;
        let app = router(state);

        let (status, _) = call(app.clone(), "POST", "/ingest", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body = json!({"to": "x@example.com", "subject": "s", "body": "b"});
        let (status, _) = call(app, "POST", "/send", Some(body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ingest_and_send_use_the_mailbox() {
        let (mut state, store) = bare_state().await;
        let mailbox = Arc::new(RecordingMailbox::default());
        state.producer = Some(Arc::new(Producer::new(mailbox.clone(), store.clone())));
        state.mailbox = Some(mailbox.clone());
        let app = router(state);

        let (status, body) = call(app.clone(), "POST", "/ingest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 1);
        assert_eq!(store.status_counts().await.unwrap().pending, 1);

        let req = json!({"to": "x@example.com", "subject": "Re: Hi", "body": "Thanks"});
        let (status, body) = call(app, "POST", "/send", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");

        let sent = mailbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Re: Hi");
    }

    #[tokio::test]
    async fn enrichment_endpoints_unavailable_without_enrichers() {
        let (state, _) = bare_state().await;
        let app = router(state);
        for uri in ["/summarize", "/extract_todos", "/get_flags"] {
            let body = json!({"email": email_json("hello")});
            let (status, _) = call(app.clone(), "POST", uri, Some(body)).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        }
    }

    #[tokio::test]
    async fn summarize_and_extract_todos_on_demand() {
        let (mut state, store) = bare_state().await;
        state.enrichers = Some(keyword_enrichers(Arc::default()));
        let app = router(state);

        let req = json!({"email": email_json("Numbers attached.\nTODO Review figures")});
        let (status, body) = call(app.clone(), "POST", "/summarize", Some(req.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"], "About: Quarterly report");

        let (status, body) = call(app.clone(), "POST", "/extract_todos", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["todos"][0]["task"], "Review figures");
        assert_eq!(body["todos"][0]["priority"], "medium");

        let req = json!({"email": email_json("")});
        let (status, body) = call(app, "POST", "/summarize", Some(req)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("summarize"));

        // Nothing is queued by on-demand calls.
        assert_eq!(store.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn get_flags_uses_caller_candidates() {
        let (mut state, _) = bare_state().await;
        let enricher = Arc::new(KeywordEnricher::default());
        state.enrichers = Some(keyword_enrichers(enricher.clone()));
        let app = router(state);

        let req = json!({
            "email": email_json("this is urgent, also billing"),
            "available_flags": [
                {"type": "billing", "description": "Invoices and payments"},
                {"type": "newsletter", "description": "Bulk mail"},
            ],
        });
        let (status, body) = call(app.clone(), "POST", "/get_flags", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        let flags = body["flags"].as_array().unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0]["type"], "billing");

        // Omitted candidates fall back to the configured taxonomy.
        let req = json!({"email": email_json("this is urgent")});
        let (status, body) = call(app.clone(), "POST", "/get_flags", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flags"][0]["type"], "urgent");
        assert_eq!(*enricher.flag_calls.lock().unwrap(), 2);

        // An empty candidate list never reaches the classifier.
        let req = json!({"email": email_json("this is urgent"), "available_flags": []});
        let (status, body) = call(app, "POST", "/get_flags", Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"flags": []}));
        assert_eq!(*enricher.flag_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn todos_lists_action_items_of_completed_items() {
        let (state, store) = bare_state().await;
        store.insert_if_absent(&new_item("m1")).await.unwrap();
        store.insert_if_absent(&new_item("m2")).await.unwrap();
        let claimed = store.claim_one().await.unwrap().unwrap();
        let enrichment = Enrichment {
            summary: "s".into(),
            todos: vec![
                TodoItem {
                    task: "Send slides".into(),
                    priority: Priority::High,
                    due_date: Some("2024-05-01".into()),
                },
                TodoItem {
                    task: "Book room".into(),
                    priority: Priority::Low,
                    due_date: None,
                },
            ],
            flags: Vec::new(),
        };
        store.save_result(&claimed.token, &enrichment).await.unwrap();
        // m2 is still pending and contributes nothing.

        let (status, body) = call(router(state), "GET", "/todos", None).await;
        assert_eq!(status, StatusCode::OK);
        let todos = body.as_array().unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0]["item_id"], claimed.item.id.as_str());
        assert_eq!(todos[0]["subject"], "subject m1");
        assert_eq!(todos[0]["task"], "Send slides");
        assert_eq!(todos[0]["priority"], "high");
        assert_eq!(todos[0]["due_date"], "2024-05-01");
        assert!(todos[1].get("due_date").is_none());
    }
}
