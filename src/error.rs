//! Error types for mailroom.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The claim backing a result write is no longer the item's current claim
    /// (recovered by the sweep, or re-claimed by another worker).
    #[error("Claim on item {id} is no longer held")]
    StaleClaim { id: String },
}

/// Mailbox transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    Auth { user: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    /// The server answered a command with NO or BAD. The session is still usable.
    #[error("IMAP {command} rejected: {status}")]
    Rejected { command: String, status: String },

    #[error("Failed to parse message {uid}: {reason}")]
    Parse { uid: String, reason: String },

    #[error("Failed to send email: {0}")]
    Send(String),

    #[error("Mailbox task failed: {0}")]
    Join(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Failure of a single enrichment capability call.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("{capability}: {source}")]
    Llm {
        capability: &'static str,
        #[source]
        source: LlmError,
    },

    #[error("{capability}: invalid response: {reason}")]
    InvalidResponse {
        capability: &'static str,
        reason: String,
    },

    #[error("{capability}: timed out after {timeout:?}")]
    Timeout {
        capability: &'static str,
        timeout: Duration,
    },
}

/// Pipeline-level errors, surfaced by one producer cycle or one consumer step.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox fetch failed: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Store operation failed: {0}")]
    Database(#[from] DatabaseError),
}
