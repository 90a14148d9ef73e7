//! Mailroom: a database-backed work queue that ingests email and enriches
//! each message with a summary, action items, and flags.

pub mod api;
pub mod config;
pub mod enrich;
pub mod error;
pub mod items;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod store;
