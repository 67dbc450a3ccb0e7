//! # Coach Voice
//!
//! Voice turn-taking for practice sessions: the bot speaks a prompt, the
//! microphone opens after a short grace period, the answer is captured until
//! the user falls silent (or presses a button), and the controller moves on.
//!
//! ## Architecture
//!
//! ```text
//! SpeechRecognizer ─┐
//! BotSpeechPlayer  ─┼─► SessionEvent inbox ─► TurnController ─► SessionNotice
//! TimerScope       ─┤                             │
//! SessionHandle    ─┘                             └─► transcript ─► FeedbackGenerator
//! ```
//!
//! All asynchronous sources post into one inbox and the controller applies
//! them one at a time.

pub mod capture;
pub mod controller;
pub mod error;
pub mod event;
pub mod guard;
pub mod output;
pub mod phase;
pub mod session;
pub mod speech;
pub mod timer;
pub mod tts;

pub use capture::{
    CaptureContext, CaptureSignal, ChannelRecognizer, RecognitionError, RecognitionEvent, RecognitionSink,
    RecognizerFeed, SpeechCapture, SpeechRecognizer,
};
pub use controller::{AdvanceOptions, AdvanceOutcome, Completion, ControllerDeps, IgnoreReason, TurnController};
pub use error::{VoiceError, VoiceResult};
pub use event::{
    CaptureStopReason, Command, CommandKind, CompletionReason, SessionEvent, SessionNotice, SessionSnapshot,
};
pub use guard::{Rejection, TransitionGuard, TransitionRequest, TransitionToken};
#[cfg(feature = "playback")]
pub use output::RodioOutput;
pub use output::{AudioOutput, NullOutput};
pub use phase::{IllegalTransition, TurnPhase};
pub use session::{SessionHandle, SessionOutcome, VoiceSession};
pub use speech::{BotSpeechPlayer, SpeechEvent, SpeechEventKind, SynthesisCache, UtteranceId};
pub use timer::{Countdown, Stopwatch, TimerFired, TimerKind, TimerScope};
pub use tts::{create_best_tts, OpenAiTts, PlaceholderTts, SpeechSynthesizer};
