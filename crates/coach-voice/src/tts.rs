//! Text-to-speech backends.
//!
//! A backend turns text into encoded audio bytes (MP3/WAV). An empty result is
//! valid and means "nothing to play"; the speech player then waits an estimated
//! duration so the turn flow is unchanged.

use async_trait::async_trait;
use coach_core::CoachConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{VoiceError, VoiceResult};

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, voice: &str, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Returns empty audio so nothing plays. Used in mock mode and tests.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SpeechSynthesizer for PlaceholderTts {
    async fn synthesize(&self, _voice: &str, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// OpenAI-compatible `/audio/speech` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    model: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(config: &CoachConfig) -> VoiceResult<Self> {
        let key = config
            .api_key()
            .ok_or_else(|| VoiceError::Config("TTS requires OPENAI_API_KEY or COACH_API_KEY".to_string()))?;
        Self::new(&config.api_base, key, &config.tts_model)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn synthesize(&self, voice: &str, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Pick a synthesizer for `config`: the HTTP backend when live with a key, else the placeholder.
pub fn create_best_tts(config: &CoachConfig) -> Arc<dyn SpeechSynthesizer> {
    if config.is_mock() {
        info!("🔇 mock mode: bot prompts are timed, not voiced");
        return Arc::new(PlaceholderTts);
    }
    match OpenAiTts::from_config(config) {
        Ok(tts) => {
            info!("🔊 using {} for bot speech", config.tts_model);
            Arc::new(tts)
        }
        Err(e) => {
            warn!(error = %e, "falling back to placeholder speech");
            Arc::new(PlaceholderTts)
        }
    }
}
