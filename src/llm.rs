//! The LLM collaborator seam.
//!
//! The pipeline only ever needs one operation from a language model: send a
//! fixed system prompt plus one user message, get a completion string back.
//! [`ChatClient`] captures exactly that, so tests can substitute a
//! deterministic stub and the classifier stage never knows which vendor is
//! behind the call.
//!
//! [`OpenAiChatClient`] is the production implementation, speaking the
//! OpenAI-compatible `/chat/completions` protocol. That protocol is also
//! served by Ollama, vLLM, LiteLLM and most gateway proxies, so one client
//! covers local and hosted deployments alike.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Transient;

/// Errors from a single chat completion call.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Connection-level failure (DNS, TLS, reset). Usually transient.
    #[error("request failed: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// The endpoint answered 200 but with no completion choices.
    #[error("empty completion from model")]
    Empty,
}

impl Transient for ChatError {
    fn is_transient(&self) -> bool {
        match self {
            ChatError::Transport(_) => true,
            // 429 = rate limited, 5xx = overloaded backend. 4xx other than
            // 429 (bad key, bad request) will not improve on retry.
            ChatError::Api { status, .. } => *status == 429 || *status >= 500,
            ChatError::Empty => false,
        }
    }
}

/// A chat-completion collaborator.
///
/// Implementations must be cheap to share (`Arc<dyn ChatClient>`); the
/// classifier issues calls concurrently from many tasks.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send one system + user message pair, return the raw completion text.
    async fn complete(&self, system: &str, user: &str) -> Result<String, ChatError>;

    /// Model identifier recorded on the report for reproducibility.
    fn model_id(&self) -> String;
}

// ── Wire types (OpenAI chat-completions schema) ──────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Production [`ChatClient`] for OpenAI-compatible endpoints.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl OpenAiChatClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            // Temperature 0: classification must be as deterministic as the
            // backend allows, matching the versioned prompt contract.
            temperature: 0.0,
            max_tokens: 256,
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n.max(1);
        self
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("decoding response body: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(ChatError::Empty)
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}
