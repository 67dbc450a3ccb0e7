//! Events flowing into and out of a session.
//!
//! Every asynchronous source (user commands, recognition callbacks, playback
//! callbacks, timer firings) is funnelled into one [`SessionEvent`] inbox so
//! that the controller is the only writer of session state.

use chrono::{DateTime, Utc};
use coach_core::Turn;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::capture::RecognitionEvent;
use crate::phase::TurnPhase;
use crate::speech::SpeechEvent;
use crate::timer::TimerFired;

/// User-initiated navigation and edits.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Submit the live buffer now.
    Next,
    /// Record the skip sentinel for the current prompt.
    Skip,
    /// Return to the previous prompt.
    Previous,
    /// Finish early, keeping any buffered partial answer.
    End,
    /// Reopen the microphone after capture stopped on its own.
    Resume,
    /// Replace the live buffer (typed edits, code editor payload).
    EditDraft { text: String, payload: Option<String> },
}

/// A command stamped with the instant the user issued it.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub requested_at: Instant,
}

impl Command {
    pub fn now(kind: CommandKind) -> Self {
        Self {
            kind,
            requested_at: Instant::now(),
        }
    }
}

/// Everything the session driver feeds into the controller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Command(Command),
    Recognition { generation: u64, event: RecognitionEvent },
    Speech(SpeechEvent),
    Timer(TimerFired),
}

/// Why a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The last prompt was answered or skipped.
    PromptsExhausted,
    /// The overall countdown reached zero.
    TimeExpired,
    /// The user ended the session.
    EndedByUser,
}

/// Observable progress for a UI or log.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    PhaseChanged { from: TurnPhase, to: TurnPhase },
    PromptStarted { index: usize, text: String },
    InterimText(String),
    DraftUpdated(String),
    TurnRecorded { index: usize, turn: Turn },
    TranscriptTruncated { len: usize },
    CaptureStopped { reason: CaptureStopReason },
    Completed { reason: CompletionReason, turns: usize, at: DateTime<Utc> },
}

/// Why capture stopped without an advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStopReason {
    Ceiling,
    PermissionRevoked,
    RecognizerFailed,
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: TurnPhase,
    pub index: usize,
    pub prompt_count: usize,
    pub transcript_len: usize,
    pub draft: String,
    pub remaining: Duration,
    pub bot_speaking: bool,
    pub capturing: bool,
}
