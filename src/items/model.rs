//! Work item data model: the queued message, its lifecycle status, and the
//! derived enrichment (summary, todos, flags) embedded in the same row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
///
/// Moves forward only: `Pending → Processing → {Completed | Failed}`.
/// A failed item returns to `Pending` only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown item status: '{other}'")),
        }
    }
}

/// Normalized content of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Attachment file names, in message order.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Priority of an extracted action item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: '{other}'")),
        }
    }
}

/// An action item extracted from a message. Owned by its work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub task: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

/// A classification flag. Candidates are supplied per call; the assigned
/// subset is stored on the work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

impl Flag {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }

    /// The candidate taxonomy the consumer offers when none is configured.
    pub fn default_taxonomy() -> Vec<Flag> {
        vec![
            Flag::new("requires_response", "Email requires a response"),
            Flag::new("urgent", "Urgent email"),
            Flag::new("meeting_request", "Meeting request"),
        ]
    }
}

/// A message about to be admitted to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub external_id: String,
    pub payload: MessagePayload,
}

/// The combined output of the three enrichment capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub summary: String,
    pub todos: Vec<TodoItem>,
    pub flags: Vec<Flag>,
}

/// One queued message and its enrichment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub external_id: String,
    pub payload: MessagePayload,
    pub status: ItemStatus,
    pub summary: Option<String>,
    pub todos: Vec<TodoItem>,
    pub flags: Vec<Flag>,
    /// Number of claims granted so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lease identifying one specific claim of one item.
///
/// Result writes must present the token of the claim that produced them, so a
/// worker whose item was recovered by the sweep cannot overwrite a newer claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub item_id: String,
    pub token: String,
}

/// A work item handed to exactly one caller by `claim_one`.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub item: WorkItem,
    pub token: ClaimToken,
}

/// Per-status item counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub(crate) fn set(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending = count,
            ItemStatus::Processing => self.processing = count,
            ItemStatus::Completed => self.completed = count,
            ItemStatus::Failed => self.failed = count,
        }
    }
}

/// Outcome of one recovery sweep over stale `processing` rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Returned to `pending` for another attempt.
    pub requeued: u64,
    /// Moved to `failed` because the attempt cap was reached.
    pub exhausted: u64,
}
