//! Coach configuration loaded from file and environment.
//!
//! Precedence: `COACH__*` environment variables > config file (`COACH_CONFIG`
//! path, default `config/coach`) > built-in defaults. Nested keys use a double
//! underscore, e.g. `COACH__SESSION__SILENCE_TIMEOUT_MS=2500`.
//!
//! API keys are read from `OPENAI_API_KEY` or `COACH_API_KEY` and never live in
//! the config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoachResult;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_CONFIG_PATH: &str = "config/coach";

fn default_llm_mode() -> String {
    "mock".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_feedback_temperature() -> f32 {
    0.4
}

fn default_feedback_max_tokens() -> u32 {
    1200
}

fn default_feedback_system_prompt() -> String {
    "You review practice sessions. Reply with JSON only: \
     {\"overall_score\": 0-100, \"summary\": string, \"strengths\": [string], \
     \"improvements\": [string], \"per_turn\": [{\"index\": number, \"note\": string}]}"
        .to_string()
}

/// Top-level coach configuration.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | llm_mode | mock | `mock` uses canned replies; `openai` calls `api_base`. |
/// | api_base | https://api.openai.com/v1 | OpenAI-compatible base URL for chat and TTS. |
/// | chat_model | gpt-4o-mini | Model used for feedback generation. |
/// | tts_model | tts-1 | Speech synthesis model. |
/// | voice | alloy | Bot voice identifier. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachConfig {
    #[serde(default = "default_llm_mode")]
    pub llm_mode: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_feedback_temperature")]
    pub feedback_temperature: f32,
    #[serde(default = "default_feedback_max_tokens")]
    pub feedback_max_tokens: u32,
    #[serde(default = "default_feedback_system_prompt")]
    pub feedback_system_prompt: String,
    /// Turn-taking timings.
    #[serde(default)]
    pub session: SessionSettings,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            llm_mode: default_llm_mode(),
            api_base: default_api_base(),
            chat_model: default_chat_model(),
            tts_model: default_tts_model(),
            voice: default_voice(),
            feedback_temperature: default_feedback_temperature(),
            feedback_max_tokens: default_feedback_max_tokens(),
            feedback_system_prompt: default_feedback_system_prompt(),
            session: SessionSettings::default(),
        }
    }
}

impl CoachConfig {
    /// Load config from the default file location and environment.
    pub fn load() -> CoachResult<Self> {
        let path = std::env::var("COACH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load config from `path` (extension optional) layered over defaults, then environment.
    pub fn load_from(path: &str) -> CoachResult<Self> {
        let built = config::Config::builder()
            .set_default("llm_mode", default_llm_mode())?
            .set_default("api_base", default_api_base())?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("COACH")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let cfg: CoachConfig = built.try_deserialize()?;
        cfg.session.validate()?;
        Ok(cfg)
    }

    /// True when chat and speech should use canned/placeholder backends.
    pub fn is_mock(&self) -> bool {
        self.llm_mode.trim().eq_ignore_ascii_case("mock")
    }

    /// API key from `OPENAI_API_KEY` or `COACH_API_KEY`. Blank values count as unset.
    pub fn api_key(&self) -> Option<String> {
        ["OPENAI_API_KEY", "COACH_API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Timings and limits for one voice session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Overall session countdown.
    pub duration_secs: u64,
    /// Quiet time after the last final result before the answer is submitted.
    pub silence_timeout_ms: u64,
    /// Hard ceiling on one capture, regardless of activity.
    pub capture_ceiling_ms: u64,
    /// Delay before restarting recognition after "no speech" or a spontaneous end.
    pub restart_delay_ms: u64,
    /// Pause between the bot finishing and the microphone opening.
    pub listen_grace_ms: u64,
    /// Two admitted advances must be at least this far apart.
    pub min_advance_interval_ms: u64,
    /// How long a settled transition still counts as in flight.
    pub settle_delay_ms: u64,
    /// Response recorded for a skipped prompt.
    pub skip_sentinel: String,
    /// Speech-duration estimate used when audio cannot be played.
    pub speech_ms_per_char: u64,
    pub speech_min_ms: u64,
    pub speech_max_ms: u64,
    /// Upper bound on cached synthesized utterances.
    pub synthesis_cache_entries: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            duration_secs: 15 * 60,
            silence_timeout_ms: 3_000,
            capture_ceiling_ms: 120_000,
            restart_delay_ms: 400,
            listen_grace_ms: 800,
            min_advance_interval_ms: 500,
            settle_delay_ms: 250,
            skip_sentinel: "[Skipped]".to_string(),
            speech_ms_per_char: 60,
            speech_min_ms: 1_000,
            speech_max_ms: 20_000,
            synthesis_cache_entries: 64,
        }
    }
}

impl SessionSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn capture_ceiling(&self) -> Duration {
        Duration::from_millis(self.capture_ceiling_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn listen_grace(&self) -> Duration {
        Duration::from_millis(self.listen_grace_ms)
    }

    pub fn min_advance_interval(&self) -> Duration {
        Duration::from_millis(self.min_advance_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Estimated speaking time for `text`, clamped to `[speech_min_ms, speech_max_ms]`.
    pub fn speech_estimate(&self, text: &str) -> Duration {
        let chars = text.trim().chars().count() as u64;
        let ms = chars
            .saturating_mul(self.speech_ms_per_char)
            .clamp(self.speech_min_ms, self.speech_max_ms.max(self.speech_min_ms));
        Duration::from_millis(ms)
    }

    /// Reject settings that would stall or spin the turn loop.
    pub fn validate(&self) -> CoachResult<()> {
        use crate::error::CoachError;

        if self.duration_secs == 0 {
            return Err(CoachError::Config("session.duration_secs must be > 0".to_string()));
        }
        if self.silence_timeout_ms == 0 {
            return Err(CoachError::Config("session.silence_timeout_ms must be > 0".to_string()));
        }
        if self.capture_ceiling_ms < self.silence_timeout_ms {
            return Err(CoachError::Config(format!(
                "session.capture_ceiling_ms ({}) must be >= silence_timeout_ms ({})",
                self.capture_ceiling_ms, self.silence_timeout_ms
            )));
        }
        if self.skip_sentinel.trim().is_empty() {
            return Err(CoachError::Config("session.skip_sentinel must not be blank".to_string()));
        }
        Ok(())
    }
}
