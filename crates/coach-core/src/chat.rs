//! Chat completion over an OpenAI-compatible `/chat/completions` endpoint.
//!
//! The service is treated as opaque: role-tagged messages, temperature and a
//! token budget in, generated text out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::CoachConfig;
use crate::error::{CoachError, CoachResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A completion request independent of any provider's wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Anything that turns a [`ChatRequest`] into generated text.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> CoachResult<String>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP chat client for OpenAI-compatible APIs.
pub struct ChatClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> CoachResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CoachError::Chat(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            client,
        })
    }

    /// Build from config. Returns `None` in mock mode, or with a warning when the
    /// live client cannot be built (no API key, client error).
    pub fn from_config(config: &CoachConfig) -> Option<Self> {
        match Self::with_key(config, config.api_key()) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, mode = %config.llm_mode, "chat client unavailable; using canned replies");
                None
            }
        }
    }

    fn with_key(config: &CoachConfig, key: Option<String>) -> CoachResult<Option<Self>> {
        if config.is_mock() {
            return Ok(None);
        }
        let key = key.ok_or_else(|| CoachError::Chat("no API key set (OPENAI_API_KEY or COACH_API_KEY)".into()))?;
        Self::new(&config.api_base, key, &config.chat_model).map(Some)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatCompletion for ChatClient {
    async fn complete(&self, request: ChatRequest) -> CoachResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoachError::Chat(format!("request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CoachError::Chat(format!("API error {}: {}", status, body)));
        }

        let parsed: WireResponse = res
            .json()
            .await
            .map_err(|e| CoachError::Chat(format!("response parse failed: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CoachError::Chat("empty completion".to_string()))
    }
}

/// Canned replies for offline runs and tests.
#[derive(Debug, Clone)]
pub struct MockChat {
    reply: String,
}

impl MockChat {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

impl Default for MockChat {
    fn default() -> Self {
        Self::with_reply(
            r#"{"summary": "Mock feedback: configure llm_mode = \"openai\" and an API key for a real review.", "strengths": [], "improvements": []}"#,
        )
    }
}

#[async_trait]
impl ChatCompletion for MockChat {
    async fn complete(&self, _request: ChatRequest) -> CoachResult<String> {
        Ok(self.reply.clone())
    }
}
