//! Session data shared between the turn controller and feedback generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which practice flow a session belongs to. Both run the same turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Interview,
    Negotiation,
}

impl SessionKind {
    pub fn label(&self) -> &'static str {
        match self {
            SessionKind::Interview => "mock interview",
            SessionKind::Negotiation => "salary negotiation",
        }
    }

    /// Built-in prompts used when no prompt file is supplied.
    pub fn default_prompts(&self) -> Vec<Prompt> {
        let lines: &[&str] = match self {
            SessionKind::Interview => &[
                "Tell me about yourself and the experience most relevant to this role.",
                "Describe a difficult technical problem you solved recently.",
                "Tell me about a time you disagreed with a teammate and how it resolved.",
                "Why do you want this position?",
            ],
            SessionKind::Negotiation => &[
                "We'd like to offer you the role. What are your salary expectations?",
                "That's above our range for this level. How do you justify that number?",
                "We can't move on base salary. Is there anything else that would work for you?",
            ],
        };
        lines.iter().map(|t| Prompt::new(*t)).collect()
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interview" => Ok(SessionKind::Interview),
            "negotiation" | "salary" => Ok(SessionKind::Negotiation),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

/// One prompt the bot speaks. `payload` carries starter material such as a code snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A prompt paired with the user's recorded response. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Time between the microphone opening for this prompt and the admitted advance.
    pub elapsed_ms: u64,
}

impl Turn {
    pub fn elapsed_secs(&self) -> u64 {
        (self.elapsed_ms + 500) / 1000
    }

    /// True when the response is the skip sentinel rather than a real answer.
    pub fn is_skipped(&self, sentinel: &str) -> bool {
        self.response == sentinel
    }
}

/// Metadata handed to feedback generation alongside the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub kind: SessionKind,
    /// Free-form target, e.g. "Senior Backend Engineer at Acme".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl SessionMeta {
    pub fn new(kind: SessionKind, duration_secs: u64) -> Self {
        Self {
            kind,
            target: None,
            started_at: Utc::now(),
            duration_secs,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}
