//! Feedback generation for a finished session.
//!
//! Model replies are parsed defensively: markdown fences are stripped, the
//! first JSON object is decoded, and loosely-typed fields (scores as strings,
//! lists as a single string) are coerced. Anything unusable falls back to a
//! clearly labelled default report so the user is never blocked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chat::{ChatCompletion, ChatMessage, ChatRequest};
use crate::config::CoachConfig;
use crate::error::{CoachError, CoachResult};
use crate::session::{SessionMeta, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnNote {
    pub index: usize,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub source: FeedbackSource,
    /// 0-100 when the reviewer supplied one.
    pub overall_score: Option<u8>,
    pub summary: String,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub per_turn: Vec<TurnNote>,
}

impl FeedbackReport {
    /// Placeholder report used whenever generation or parsing fails.
    pub fn fallback(reason: impl AsRef<str>) -> Self {
        Self {
            source: FeedbackSource::Fallback,
            overall_score: None,
            summary: format!(
                "[Automatic feedback unavailable: {}] Review your transcript: keep answers \
                 specific, quantify results, and close each answer with its impact.",
                reason.as_ref()
            ),
            strengths: Vec::new(),
            improvements: vec![
                "Use concrete examples with measurable outcomes.".to_string(),
                "Keep each answer under two minutes.".to_string(),
            ],
            per_turn: Vec::new(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == FeedbackSource::Fallback
    }
}

/// Remove a surrounding markdown code fence (```json ... ```), if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(o) => o.get("text").and_then(Value::as_str).map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn score(value: Option<&Value>) -> Option<u8> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(n.round().min(100.0) as u8)
}

fn first_of<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

/// Parse a model reply into a report. Returns `None` when nothing usable is found.
pub fn parse_feedback(raw: &str) -> Option<FeedbackReport> {
    let body = strip_code_fences(raw);
    let value: Value = serde_json::from_str(body).ok().or_else(|| {
        // Prose around the object: take the outermost braces.
        let start = body.find('{')?;
        let end = body.rfind('}')?;
        (end > start)
            .then(|| serde_json::from_str(&body[start..=end]).ok())
            .flatten()
    })?;
    let obj = value.as_object()?;

    let summary = first_of(obj, &["summary", "overall", "overall_feedback", "overallFeedback"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let strengths = string_list(first_of(obj, &["strengths"]));
    let improvements = string_list(first_of(obj, &["improvements", "areas_for_improvement", "weaknesses"]));
    let per_turn = match first_of(obj, &["per_turn", "perTurn", "answers"]) {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let note = item
                    .get("note")
                    .or_else(|| item.get("feedback"))
                    .and_then(Value::as_str)?
                    .trim()
                    .to_string();
                let index = item
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(i);
                Some(TurnNote { index, note })
            })
            .collect(),
        _ => Vec::new(),
    };

    if summary.is_empty() && strengths.is_empty() && improvements.is_empty() {
        return None;
    }

    Some(FeedbackReport {
        source: FeedbackSource::Generated,
        overall_score: score(first_of(obj, &["overall_score", "overallScore", "score"])),
        summary,
        strengths,
        improvements,
        per_turn,
    })
}

/// External collaborator that reviews a finished transcript.
#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn generate(&self, transcript: &[Turn], meta: &SessionMeta) -> CoachResult<FeedbackReport>;
}

#[derive(Serialize)]
struct ReviewInput<'a> {
    session: &'a SessionMeta,
    transcript: &'a [Turn],
}

/// Feedback via a chat-completion service.
pub struct ChatFeedbackGenerator {
    chat: Arc<dyn ChatCompletion>,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatFeedbackGenerator {
    pub fn new(chat: Arc<dyn ChatCompletion>, config: &CoachConfig) -> Self {
        Self {
            chat,
            system_prompt: config.feedback_system_prompt.clone(),
            temperature: config.feedback_temperature,
            max_tokens: config.feedback_max_tokens,
        }
    }
}

#[async_trait]
impl FeedbackGenerator for ChatFeedbackGenerator {
    async fn generate(&self, transcript: &[Turn], meta: &SessionMeta) -> CoachResult<FeedbackReport> {
        if transcript.is_empty() {
            return Ok(FeedbackReport::fallback("no answers were recorded"));
        }

        let input = serde_json::to_string(&ReviewInput {
            session: meta,
            transcript,
        })?;
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(input),
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        };

        let raw = self.chat.complete(request).await?;
        parse_feedback(&raw).ok_or_else(|| CoachError::Feedback("reply was not usable feedback JSON".to_string()))
    }
}

/// Run `generator`, substituting a fallback report on any error.
pub async fn feedback_or_fallback(
    generator: &dyn FeedbackGenerator,
    transcript: &[Turn],
    meta: &SessionMeta,
) -> FeedbackReport {
    match generator.generate(transcript, meta).await {
        Ok(report) => {
            info!(turns = transcript.len(), fallback = report.is_fallback(), "feedback ready");
            report
        }
        Err(e) => {
            warn!(error = %e, "feedback generation failed; using fallback");
            FeedbackReport::fallback(e.to_string())
        }
    }
}
