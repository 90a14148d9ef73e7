//! Enrichment capabilities applied to each claimed item.
//!
//! Each capability is its own trait so the consumer can run them concurrently
//! and tests can fail any one in isolation.

pub mod llm_enricher;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EnrichError;
use crate::items::{Flag, MessagePayload, TodoItem};
use crate::llm::LlmProvider;

pub use llm_enricher::LlmEnricher;

/// Produces a short summary of a message.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, payload: &MessagePayload) -> Result<String, EnrichError>;
}

/// Extracts action items from a message.
#[async_trait]
pub trait TodoExtractor: Send + Sync {
    async fn extract_todos(&self, payload: &MessagePayload) -> Result<Vec<TodoItem>, EnrichError>;
}

/// Picks the applicable flags out of a candidate set.
#[async_trait]
pub trait FlagClassifier: Send + Sync {
    /// Must return a subset of `candidates`. An empty candidate list yields
    /// an empty result.
    async fn classify_flags(
        &self,
        payload: &MessagePayload,
        candidates: &[Flag],
    ) -> Result<Vec<Flag>, EnrichError>;
}

/// The three capabilities plus the flag taxonomy a consumer offers.
#[derive(Clone)]
pub struct Enrichers {
    pub summarizer: Arc<dyn Summarizer>,
    pub todos: Arc<dyn TodoExtractor>,
    pub flags: Arc<dyn FlagClassifier>,
    pub taxonomy: Vec<Flag>,
}

impl Enrichers {
    /// All three capabilities backed by one LLM, with the default taxonomy.
    pub fn from_llm(llm: Arc<dyn LlmProvider>) -> Self {
        let enricher = Arc::new(LlmEnricher::new(llm));
        Self {
            summarizer: enricher.clone(),
            todos: enricher.clone(),
            flags: enricher,
            taxonomy: Flag::default_taxonomy(),
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: Vec<Flag>) -> Self {
        self.taxonomy = taxonomy;
        self
    }
}
