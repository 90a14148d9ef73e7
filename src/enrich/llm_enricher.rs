//! LLM-backed implementation of the three enrichment capabilities.
//!
//! Each capability is one completion call with a JSON-only system prompt.
//! Responses are parsed strictly: anything that doesn't match the expected
//! shape is an `EnrichError::InvalidResponse`, which fails the item.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::enrich::{FlagClassifier, Summarizer, TodoExtractor};
use crate::error::EnrichError;
use crate::items::{Flag, MessagePayload, Priority, TodoItem};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

const SUMMARIZE: &str = "summarize";
const EXTRACT_TODOS: &str = "extract_todos";
const CLASSIFY_FLAGS: &str = "classify_flags";

/// Max tokens per enrichment call.
const ENRICH_MAX_TOKENS: u32 = 1024;

/// Low temperature keeps the JSON shape stable.
const ENRICH_TEMPERATURE: f32 = 0.1;

/// Enrichment via an `LlmProvider`.
pub struct LlmEnricher {
    llm: Arc<dyn LlmProvider>,
}

impl LlmEnricher {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    async fn ask(
        &self,
        capability: &'static str,
        system: &str,
        user: String,
    ) -> Result<String, EnrichError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_temperature(ENRICH_TEMPERATURE)
        .with_max_tokens(ENRICH_MAX_TOKENS);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|source| EnrichError::Llm { capability, source })?;

        debug!(
            capability,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Enrichment call complete"
        );
        Ok(response.content)
    }
}

// ── Prompts ─────────────────────────────────────────────────────────

fn build_message_prompt(payload: &MessagePayload) -> String {
    let mut prompt = format!(
        "From: {}\nTo: {}\nSubject: {}\n",
        payload.sender, payload.recipient, payload.subject
    );
    if let Some(ts) = payload.timestamp {
        prompt.push_str(&format!("Date: {}\n", ts.to_rfc3339()));
    }
    if !payload.attachments.is_empty() {
        prompt.push_str(&format!("Attachments: {}\n", payload.attachments.join(", ")));
    }
    prompt.push('\n');
    prompt.push_str(&payload.body);
    prompt
}

const SUMMARY_SYSTEM_PROMPT: &str = r#"You summarize emails.
Write two or three sentences covering who is writing, what they want, and any deadline.
Respond with JSON only, no markdown:
{"summary": "<summary>"}"#;

const TODOS_SYSTEM_PROMPT: &str = r#"You extract action items from emails.
List only concrete tasks the recipient has to do. If there are none, return an empty list.
priority is one of "high", "medium", "low". due_date is the deadline as written in the email, or omitted.
Respond with JSON only, no markdown:
{"todos": [{"task": "<task>", "priority": "high|medium|low", "due_date": "<optional>"}]}"#;

fn build_flags_system_prompt(candidates: &[Flag]) -> String {
    let mut prompt = String::from(
        "You classify emails. Choose every flag below that applies to the email, and no others.\n\nFlags:\n",
    );
    for flag in candidates {
        prompt.push_str(&format!("- {}: {}\n", flag.kind, flag.description));
    }
    prompt.push_str(
        "\nRespond with JSON only, no markdown:\n{\"flags\": [{\"type\": \"<flag type>\", \"description\": \"<flag description>\"}]}",
    );
    prompt
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl Summarizer for LlmEnricher {
    async fn summarize(&self, payload: &MessagePayload) -> Result<String, EnrichError> {
        let raw = self
            .ask(SUMMARIZE, SUMMARY_SYSTEM_PROMPT, build_message_prompt(payload))
            .await?;
        parse_summary(&raw).map_err(|reason| invalid(SUMMARIZE, &raw, reason))
    }
}

#[async_trait]
impl TodoExtractor for LlmEnricher {
    async fn extract_todos(&self, payload: &MessagePayload) -> Result<Vec<TodoItem>, EnrichError> {
        let raw = self
            .ask(EXTRACT_TODOS, TODOS_SYSTEM_PROMPT, build_message_prompt(payload))
            .await?;
        parse_todos(&raw).map_err(|reason| invalid(EXTRACT_TODOS, &raw, reason))
    }
}

#[async_trait]
impl FlagClassifier for LlmEnricher {
    async fn classify_flags(
        &self,
        payload: &MessagePayload,
        candidates: &[Flag],
    ) -> Result<Vec<Flag>, EnrichError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self
            .ask(
                CLASSIFY_FLAGS,
                &build_flags_system_prompt(candidates),
                build_message_prompt(payload),
            )
            .await?;
        parse_flags(&raw, candidates).map_err(|reason| invalid(CLASSIFY_FLAGS, &raw, reason))
    }
}

fn invalid(capability: &'static str, raw: &str, reason: String) -> EnrichError {
    warn!(capability, raw_response = %raw, error = %reason, "Unparseable enrichment response");
    EnrichError::InvalidResponse { capability, reason }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

#[derive(Deserialize)]
struct TodosResponse {
    todos: Vec<RawTodo>,
}

#[derive(Deserialize)]
struct RawTodo {
    task: String,
    priority: String,
    #[serde(default)]
    due_date: Option<String>,
}

#[derive(Deserialize)]
struct FlagsResponse {
    flags: Vec<RawFlag>,
}

#[derive(Deserialize)]
struct RawFlag {
    #[serde(rename = "type")]
    kind: String,
}

pub(crate) fn parse_summary(text: &str) -> Result<String, String> {
    let json = extract_json_object(text);
    let response: SummaryResponse =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {e}"))?;
    let summary = response.summary.trim();
    if summary.is_empty() {
        return Err("empty summary".into());
    }
    Ok(summary.to_string())
}

pub(crate) fn parse_todos(text: &str) -> Result<Vec<TodoItem>, String> {
    let json = extract_json_object(text);
    let response: TodosResponse =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {e}"))?;

    response
        .todos
        .into_iter()
        .filter(|t| !t.task.trim().is_empty())
        .map(|t| -> Result<TodoItem, String> {
            Ok(TodoItem {
                task: t.task.trim().to_string(),
                priority: t.priority.parse::<Priority>()?,
                due_date: t
                    .due_date
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty()),
            })
        })
        .collect()
}

/// Keep only flags from `candidates`, in candidate order, without duplicates.
pub(crate) fn parse_flags(text: &str, candidates: &[Flag]) -> Result<Vec<Flag>, String> {
    let json = extract_json_object(text);
    let response: FlagsResponse =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {e}"))?;

    let chosen: Vec<String> = response
        .flags
        .into_iter()
        .map(|f| f.kind.trim().to_ascii_lowercase())
        .collect();

    Ok(candidates
        .iter()
        .filter(|c| chosen.iter().any(|k| k.eq_ignore_ascii_case(&c.kind)))
        .cloned()
        .collect())
}

/// Extract a JSON object from LLM output (handles markdown wrapping and
/// `<think>` blocks from reasoning models).
fn extract_json_object(text: &str) -> String {
    let without_think = match (text.find("<think>"), text.find("</think>")) {
        (Some(start), Some(end)) if end > start => {
            format!("{}{}", &text[..start], &text[end + "</think>".len()..])
        }
        _ => text.to_string(),
    };
    let trimmed = without_think.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
