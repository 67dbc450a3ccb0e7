//! # Coach Core
//!
//! Shared pieces of the practice coach: session data (`Prompt`, `Turn`,
//! `SessionMeta`), layered configuration, the chat-completion client and
//! tolerant feedback parsing. The voice turn engine lives in `coach-voice`.

pub mod chat;
pub mod config;
pub mod error;
pub mod feedback;
pub mod session;

pub use chat::{ChatClient, ChatCompletion, ChatMessage, ChatRequest, ChatRole, MockChat};
pub use config::{CoachConfig, SessionSettings};
pub use error::{CoachError, CoachResult};
pub use feedback::{
    feedback_or_fallback, parse_feedback, strip_code_fences, ChatFeedbackGenerator, FeedbackGenerator,
    FeedbackReport, FeedbackSource, TurnNote,
};
pub use session::{Prompt, SessionKind, SessionMeta, Turn};
