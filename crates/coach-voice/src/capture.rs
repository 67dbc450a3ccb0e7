//! **Speech capture**: turn a continuous recognition stream into an answer.
//!
//! Final results accumulate into the live buffer; interim results are only
//! surfaced. A silence timer re-arms on every final result and, when it
//! expires with text buffered, asks the controller to advance. A hard ceiling
//! stops capture regardless of activity.
//!
//! Recognition engines stop on their own ("no speech", mobile quirks). The
//! adapter restarts them while the session is live and the bot is quiet, but
//! never when it stopped the engine itself: that intent is tracked in an
//! explicit `stopped_by_us` flag rather than inferred. Each start bumps a
//! generation number and every event is tagged with the generation that
//! produced it, so a late event from an old engine session is dropped and two
//! sessions never feed the same buffer.

use coach_core::SessionSettings;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{VoiceError, VoiceResult};
use crate::event::{CaptureStopReason, SessionEvent};
use crate::timer::{TimerFired, TimerKind, TimerScope};

/// Consecutive engine failures tolerated before capture gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// Engine heard nothing for a while. Transient.
    NoSpeech,
    /// Engine aborted, usually because we stopped it.
    Aborted,
    /// Microphone could not be read.
    AudioCapture,
    /// User or platform revoked microphone access.
    NotAllowed,
    Network(String),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Result { text: String, is_final: bool },
    Error(RecognitionError),
    /// Engine session ended (requested or spontaneous).
    Ended,
}

/// Where a recognizer delivers events. Tagged with the capture generation it was issued for.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl RecognitionSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the session is gone.
    pub fn send(&self, event: RecognitionEvent) -> bool {
        self.inbox
            .send(SessionEvent::Recognition {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Continuous, interim-enabled speech-to-text provided by the environment.
pub trait SpeechRecognizer: Send {
    /// Ask for microphone access. Called once before a session starts.
    fn request_permission(&mut self) -> VoiceResult<()> {
        Ok(())
    }

    /// Begin a recognition session that reports into `sink`.
    fn start(&mut self, sink: RecognitionSink) -> VoiceResult<()>;

    /// End the current recognition session, if any. Must tolerate redundant calls.
    fn stop(&mut self);
}

#[derive(Debug, Default)]
struct FeedState {
    sink: Option<RecognitionSink>,
    starts: usize,
    permission_denied: bool,
}

/// Recognizer driven from outside through a [`RecognizerFeed`].
///
/// Useful wherever transcription happens elsewhere (a browser bridge, a
/// terminal, a test): the feed forwards events only while the recognizer is
/// started, which mirrors a real engine ignoring audio while stopped.
pub struct ChannelRecognizer {
    state: Arc<Mutex<FeedState>>,
}

/// Handle that injects recognition events into a [`ChannelRecognizer`].
#[derive(Clone)]
pub struct RecognizerFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, RecognizerFeed) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            RecognizerFeed { state },
        )
    }
}

impl SpeechRecognizer for ChannelRecognizer {
    fn request_permission(&mut self) -> VoiceResult<()> {
        let denied = self.state.lock().map(|s| s.permission_denied).unwrap_or(false);
        if denied {
            return Err(VoiceError::PermissionDenied("microphone access was refused".to_string()));
        }
        Ok(())
    }

    fn start(&mut self, sink: RecognitionSink) -> VoiceResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| VoiceError::Recognition(format!("feed lock poisoned: {}", e)))?;
        if state.permission_denied {
            return Err(VoiceError::PermissionDenied("microphone access was refused".to_string()));
        }
        state.sink = Some(sink);
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.sink = None;
        }
    }
}

impl RecognizerFeed {
    fn deliver(&self, event: RecognitionEvent) -> bool {
        let sink = self.state.lock().ok().and_then(|s| s.sink.clone());
        match sink {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    /// A finalized utterance. Returns false if the microphone is closed.
    pub fn final_text(&self, text: impl Into<String>) -> bool {
        self.deliver(RecognitionEvent::Result {
            text: text.into(),
            is_final: true,
        })
    }

    pub fn interim_text(&self, text: impl Into<String>) -> bool {
        self.deliver(RecognitionEvent::Result {
            text: text.into(),
            is_final: false,
        })
    }

    pub fn error(&self, error: RecognitionError) -> bool {
        self.deliver(RecognitionEvent::Error(error))
    }

    /// Simulate the engine ending on its own. The recognizer counts as stopped afterwards.
    pub fn end(&self) -> bool {
        let sink = self.state.lock().ok().and_then(|mut s| s.sink.take());
        match sink {
            Some(sink) => sink.send(RecognitionEvent::Ended),
            None => false,
        }
    }

    /// Whether the recognizer is currently started.
    pub fn is_listening(&self) -> bool {
        self.state.lock().map(|s| s.sink.is_some()).unwrap_or(false)
    }

    /// How many times the recognizer has been started.
    pub fn start_count(&self) -> usize {
        self.state.lock().map(|s| s.starts).unwrap_or(0)
    }

    /// Refuse microphone access from now on.
    pub fn deny_permission(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.permission_denied = true;
        }
    }
}

/// Facts about the rest of the session that gate capture decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureContext {
    pub session_active: bool,
    pub bot_speaking: bool,
    pub transition_in_flight: bool,
}

/// What the controller should do after the adapter handled an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSignal {
    Nothing,
    Interim(String),
    TextAppended,
    /// Silence elapsed with this answer buffered; advance with it.
    SilenceElapsed(String),
    /// Capture stopped without an answer being submitted.
    Stopped(CaptureStopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Stopped,
    Active,
    /// Engine ended; a restart is scheduled.
    Restarting,
}

pub struct SpeechCapture {
    recognizer: Box<dyn SpeechRecognizer>,
    timers: TimerScope,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    state: CaptureState,
    stopped_by_us: bool,
    generation: u64,
    failures: u32,
    text: String,
    interim: String,
    silence_timeout: Duration,
    ceiling: Duration,
    restart_delay: Duration,
}

impl SpeechCapture {
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        inbox: mpsc::UnboundedSender<SessionEvent>,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            recognizer,
            timers: TimerScope::new("capture", inbox.clone()),
            inbox,
            state: CaptureState::Stopped,
            stopped_by_us: true,
            generation: 0,
            failures: 0,
            text: String::new(),
            interim: String::new(),
            silence_timeout: settings.silence_timeout(),
            ceiling: settings.capture_ceiling(),
            restart_delay: settings.restart_delay(),
        }
    }

    pub fn request_permission(&mut self) -> VoiceResult<()> {
        self.recognizer.request_permission()
    }

    /// Open the microphone. A no-op while already capturing, so two engine
    /// sessions never run at once. The live buffer is kept.
    pub fn start(&mut self) -> VoiceResult<()> {
        if self.state != CaptureState::Stopped {
            debug!(generation = self.generation, "capture already active");
            return Ok(());
        }
        self.stopped_by_us = false;
        self.failures = 0;
        self.interim.clear();
        self.open()?;
        self.timers.schedule(TimerKind::CaptureCeiling, self.ceiling);
        info!("🎤 capture armed (generation {})", self.generation);
        Ok(())
    }

    fn open(&mut self) -> VoiceResult<()> {
        self.generation += 1;
        let sink = RecognitionSink {
            generation: self.generation,
            inbox: self.inbox.clone(),
        };
        match self.recognizer.start(sink) {
            Ok(()) => {
                self.state = CaptureState::Active;
                Ok(())
            }
            Err(e) => {
                self.state = CaptureState::Stopped;
                self.stopped_by_us = true;
                self.timers.cancel_all();
                Err(e)
            }
        }
    }

    /// Close the microphone and cancel every capture timer. Idempotent.
    pub fn stop(&mut self) {
        self.stopped_by_us = true;
        self.timers.cancel_all();
        self.interim.clear();
        if self.state != CaptureState::Stopped {
            self.recognizer.stop();
            self.state = CaptureState::Stopped;
            // Anything the old engine session still emits is now stale.
            self.generation += 1;
            debug!("capture stopped");
        }
    }

    /// Whether the adapter owns the microphone (including a pending restart).
    pub fn is_active(&self) -> bool {
        self.state != CaptureState::Stopped
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn clear_text(&mut self) {
        self.text.clear();
        self.interim.clear();
    }

    fn should_restart(&self, ctx: CaptureContext) -> bool {
        ctx.session_active && !ctx.bot_speaking && !self.stopped_by_us
    }

    fn schedule_restart(&mut self) {
        self.state = CaptureState::Restarting;
        self.timers.schedule(TimerKind::CaptureRestart, self.restart_delay);
    }

    pub fn on_recognition(
        &mut self,
        generation: u64,
        event: RecognitionEvent,
        ctx: CaptureContext,
    ) -> CaptureSignal {
        if generation != self.generation || self.state == CaptureState::Stopped {
            debug!(generation, current = self.generation, "dropping stale recognition event");
            return CaptureSignal::Nothing;
        }

        match event {
            RecognitionEvent::Result { text, is_final: true } => {
                self.failures = 0;
                self.interim.clear();
                let text = text.trim();
                if text.is_empty() {
                    return CaptureSignal::Nothing;
                }
                if !self.text.is_empty() {
                    self.text.push(' ');
                }
                self.text.push_str(text);
                self.timers.schedule(TimerKind::Silence, self.silence_timeout);
                CaptureSignal::TextAppended
            }
            RecognitionEvent::Result { text, is_final: false } => {
                self.failures = 0;
                // Still talking: push an armed silence deadline back.
                if self.timers.is_armed(TimerKind::Silence) {
                    self.timers.schedule(TimerKind::Silence, self.silence_timeout);
                }
                self.interim = text.clone();
                CaptureSignal::Interim(text)
            }
            RecognitionEvent::Error(RecognitionError::NotAllowed) => {
                warn!("microphone permission revoked during capture");
                self.stop();
                CaptureSignal::Stopped(CaptureStopReason::PermissionRevoked)
            }
            RecognitionEvent::Error(RecognitionError::NoSpeech) | RecognitionEvent::Error(RecognitionError::Aborted) => {
                if self.should_restart(ctx) && self.state == CaptureState::Active {
                    debug!("no speech; restarting recognition shortly");
                    self.schedule_restart();
                }
                CaptureSignal::Nothing
            }
            RecognitionEvent::Error(err) => {
                self.failures += 1;
                warn!(?err, failures = self.failures, "recognition error");
                if self.failures >= MAX_CONSECUTIVE_FAILURES {
                    self.stop();
                    return CaptureSignal::Stopped(CaptureStopReason::RecognizerFailed);
                }
                if self.should_restart(ctx) && self.state == CaptureState::Active {
                    self.schedule_restart();
                }
                CaptureSignal::Nothing
            }
            RecognitionEvent::Ended => {
                if self.state == CaptureState::Restarting {
                    return CaptureSignal::Nothing;
                }
                if self.should_restart(ctx) {
                    debug!("recognition ended on its own; restarting");
                    self.schedule_restart();
                } else {
                    self.timers.cancel_all();
                    self.state = CaptureState::Stopped;
                }
                CaptureSignal::Nothing
            }
        }
    }

    pub fn on_timer(&mut self, fired: TimerFired, ctx: CaptureContext) -> CaptureSignal {
        if !self.timers.take_fired(fired) {
            debug!(?fired, "ignoring stale capture timer");
            return CaptureSignal::Nothing;
        }

        match fired.kind {
            TimerKind::Silence => {
                let ready = self.state != CaptureState::Stopped
                    && !ctx.bot_speaking
                    && !ctx.transition_in_flight
                    && !self.text.trim().is_empty();
                if ready {
                    info!("🤫 silence elapsed, submitting answer");
                    CaptureSignal::SilenceElapsed(self.text.trim().to_string())
                } else {
                    debug!(?ctx, "silence elapsed but answer not submittable");
                    CaptureSignal::Nothing
                }
            }
            TimerKind::CaptureCeiling => {
                warn!("⏱️ capture ceiling reached, stopping microphone");
                self.stop();
                CaptureSignal::Stopped(CaptureStopReason::Ceiling)
            }
            TimerKind::CaptureRestart => {
                if self.state != CaptureState::Restarting || !self.should_restart(ctx) {
                    return CaptureSignal::Nothing;
                }
                self.recognizer.stop();
                match self.open() {
                    Ok(()) => {
                        // The ceiling keeps counting across restarts.
                        debug!(generation = self.generation, "recognition restarted");
                        CaptureSignal::Nothing
                    }
                    Err(e) => {
                        warn!(error = %e, "recognition restart failed");
                        let reason = match e {
                            VoiceError::PermissionDenied(_) => CaptureStopReason::PermissionRevoked,
                            _ => CaptureStopReason::RecognizerFailed,
                        };
                        self.stop();
                        CaptureSignal::Stopped(reason)
                    }
                }
            }
            TimerKind::ListenGrace | TimerKind::SessionDeadline => CaptureSignal::Nothing,
        }
    }
}
