pub mod openrouter;
pub mod race;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    /// Timeout, connection failure or a non-2xx status. Retried with backoff.
    Transport(String),
    /// The provider answered but the body was not usable.
    Response(String),
    Config(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport(msg) => write!(f, "LLM transport error: {}", msg),
            LlmError::Response(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::Config(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One model's answer plus the token usage needed for cost accounting.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A chat-completion endpoint for one model. The race coordinator owns
/// retries; an implementation makes exactly one attempt per call.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, LlmError>;
}
