//! Bridges rig's `CompletionModel` to the crate's `LlmProvider` trait.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const PROVIDER: &str = "rig";

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    timeout: Option<Duration>,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A chat request reshaped for rig: system text, prior turns, final prompt.
#[derive(Debug, PartialEq, Eq)]
struct RigTurns {
    preamble: Option<String>,
    history: Vec<ChatMessage>,
    prompt: String,
}

fn split_turns(messages: Vec<ChatMessage>) -> Result<RigTurns, LlmError> {
    let mut system = Vec::new();
    let mut history = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.push(message.content),
            Role::User | Role::Assistant => history.push(message),
        }
    }

    let prompt = match history.pop() {
        Some(ChatMessage {
            role: Role::User,
            content,
        }) => content,
        _ => {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "request must end with a user message".into(),
            });
        }
    };

    Ok(RigTurns {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt,
    })
}

fn to_rig_message(message: ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content),
        Role::User | Role::System => Message::user(message.content),
    }
}

fn clamp_tokens(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let turns = split_turns(request.messages)?;

        let mut builder = self
            .model
            .completion_request(Message::user(turns.prompt))
            .messages(turns.history.into_iter().map(to_rig_message).collect());
        if let Some(preamble) = turns.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let send = builder.send();
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, send).await.map_err(|_| {
                LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("request timed out after {timeout:?}"),
                }
            })?,
            None => send.await,
        };
        let response = result.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        let input_tokens = clamp_tokens(response.usage.input_tokens);
        let output_tokens = clamp_tokens(response.usage.output_tokens);
        debug!(model = %self.model_name, input_tokens, output_tokens, "LLM completion");

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
