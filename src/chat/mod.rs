//! Chat model backends used to phrase grounded answers.

use crate::config::{ChatProvider, ChatSettings};
use crate::upstream::{self, DEFAULT_MAX_RETRIES, UpstreamError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Errors raised by chat backends.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Backend is not usable with the supplied settings.
    #[error("chat backend misconfigured: {0}")]
    Misconfigured(String),
    /// Provider call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Provider answered without usable content.
    #[error("invalid chat response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(UpstreamError::Http(err))
    }
}

/// One system + user turn sent to the model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System instruction, including retrieved context.
    pub system: String,
    /// The user's question.
    pub user: String,
}

/// Model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    /// Answer text. Structured replies are serialized to JSON.
    pub text: String,
    /// Model that produced the reply.
    pub model: String,
}

/// Interface implemented by chat backends.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Produce a reply for `request`.
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, ChatError>;
}

/// Build the chat client selected by configuration.
pub fn from_settings(settings: &ChatSettings) -> Result<Arc<dyn ChatClient>, ChatError> {
    let api_key = settings
        .api_key
        .clone()
        .ok_or_else(|| ChatError::Misconfigured(format!("{:?} requires an API key", settings.provider)))?;

    let client: Arc<dyn ChatClient> = match settings.provider {
        ChatProvider::Gemini => Arc::new(GeminiChatClient::new(api_key, settings.model.clone())?),
        ChatProvider::OpenAI | ChatProvider::Llama3 | ChatProvider::HfRouter => {
            let base_url = match (settings.provider, settings.base_url.as_deref()) {
                (_, Some(base_url)) => base_url.to_string(),
                (ChatProvider::OpenAI, None) => OPENAI_BASE_URL.to_string(),
                (provider, None) => {
                    return Err(ChatError::Misconfigured(format!(
                        "{provider:?} requires a base URL"
                    )));
                }
            };
            Arc::new(
                OpenAiCompatibleChatClient::new(api_key, settings.model.clone())?
                    .with_base_url(base_url),
            )
        }
    };
    tracing::info!(provider = ?settings.provider, model = %settings.model, "Chat client ready");
    Ok(client)
}

/// Client for OpenAI `chat/completions` and compatible endpoints (Llama 3 hosts, HF router).
pub struct OpenAiCompatibleChatClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleChatClient {
    /// Create a client against the public OpenAI API.
    pub fn new(api_key: String, model: String) -> Result<Self, ChatError> {
        Ok(Self {
            http: upstream::http_client(Duration::from_secs(120))?,
            base_url: OPENAI_BASE_URL.to_string(),
            api_key,
            model,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Point the client at another compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatibleChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
        });
        let response = upstream::send_json(
            || self.http.post(&url).bearer_auth(&self.api_key).json(&body),
            self.max_retries,
        )
        .await?;

        let message = response
            .pointer("/choices/0/message/content")
            .ok_or_else(|| ChatError::InvalidResponse("missing choices[0].message".into()))?;
        let model = response
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_string();
        Ok(ChatReply {
            text: content_to_text(message),
            model,
        })
    }
}

/// Client for Gemini `generateContent`.
pub struct GeminiChatClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl GeminiChatClient {
    /// Create a client against the public Generative Language API.
    pub fn new(api_key: String, model: String) -> Result<Self, ChatError> {
        Ok(Self {
            http: upstream::http_client(Duration::from_secs(120))?,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            model: model.trim_start_matches("models/").to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Point the client at another endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.user }] }],
            "generationConfig": { "temperature": 0 },
        });
        let response = upstream::send_json(
            || {
                self.http
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body)
            },
            self.max_retries,
        )
        .await?;

        let parts = response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| ChatError::InvalidResponse("missing candidates[0].content".into()))?;
        let text = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        Ok(ChatReply {
            text,
            model: self.model.clone(),
        })
    }
}

/// Flatten a message `content` value into text.
///
/// Plain strings pass through, arrays of text parts are concatenated, and anything else is kept
/// as its JSON serialization.
fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts)
            if parts
                .iter()
                .all(|part| part.get("text").and_then(Value::as_str).is_some()) =>
        {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        }
        other => other.to_string(),
    }
}
