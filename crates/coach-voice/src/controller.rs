//! **Turn controller**: the single writer of session state.
//!
//! Owns the prompt list, the transcript, the live draft, the phase machine and
//! every collaborator that produces events (capture, bot speech, timers). The
//! session driver feeds it [`SessionEvent`]s one at a time, so no two
//! transitions ever interleave; the [`TransitionGuard`] additionally makes
//! near-simultaneous advance requests (silence + button) count once.
//!
//! Invariants held between events:
//! - `transcript.len() == index` while the session is active;
//! - the bot is never speaking while capture owns the microphone;
//! - `Complete` is reached exactly once and produces exactly one [`Completion`].

use chrono::Utc;
use coach_core::{Prompt, SessionSettings, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{CaptureContext, CaptureSignal, SpeechCapture, SpeechRecognizer};
use crate::error::{VoiceError, VoiceResult};
use crate::event::{
    CaptureStopReason, CommandKind, CompletionReason, SessionEvent, SessionNotice, SessionSnapshot,
};
use crate::guard::{Rejection, TransitionGuard};
use crate::output::AudioOutput;
use crate::phase::TurnPhase;
use crate::speech::{BotSpeechPlayer, SpeechEvent, SpeechEventKind, UtteranceId};
use crate::timer::{Countdown, Stopwatch, TimerFired, TimerKind, TimerScope};
use crate::tts::SpeechSynthesizer;

/// Collaborators the controller drives.
pub struct ControllerDeps {
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub output: Arc<dyn AudioOutput>,
    /// Voice identifier passed to the synthesizer.
    pub voice: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdvanceOptions {
    /// Direct user navigation: skips the in-flight check, not the minimum interval.
    pub bypass_guard: bool,
    /// When the request was issued. Defaults to the handling instant.
    pub requested_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved on to the prompt at `index`.
    Advanced { index: usize },
    /// The last prompt was answered; the session is complete.
    Completed,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotActive,
    EmptyResponse,
    Rejected(Rejection),
}

/// Final state handed to feedback generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reason: CompletionReason,
    pub transcript: Vec<Turn>,
}

pub struct TurnController {
    settings: SessionSettings,
    phase: TurnPhase,
    prompts: Vec<Prompt>,
    index: usize,
    transcript: Vec<Turn>,
    draft_payload: Option<String>,

    guard: TransitionGuard,
    stopwatch: Stopwatch,
    countdown: Countdown,
    timers: TimerScope,

    capture: SpeechCapture,
    bot: BotSpeechPlayer,
    utterance: Option<UtteranceId>,

    completion: Option<Completion>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl TurnController {
    /// Create a controller whose collaborators report into `inbox`.
    pub fn new(
        settings: SessionSettings,
        deps: ControllerDeps,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let controller = Self {
            guard: TransitionGuard::new(settings.min_advance_interval(), settings.settle_delay()),
            timers: TimerScope::new("session", inbox.clone()),
            capture: SpeechCapture::new(deps.recognizer, inbox.clone(), &settings),
            bot: BotSpeechPlayer::new(deps.synthesizer, deps.output, deps.voice, &settings, inbox),
            settings,
            phase: TurnPhase::NotStarted,
            prompts: Vec::new(),
            index: 0,
            transcript: Vec::new(),
            draft_payload: None,
            stopwatch: Stopwatch::default(),
            countdown: Countdown::default(),
            utterance: None,
            completion: None,
            notices,
        };

        (controller, notice_rx)
    }

    /// Validate the prompts, start the countdown and speak the first prompt.
    pub fn start_session(&mut self, prompts: Vec<Prompt>, duration: Duration, now: Instant) -> VoiceResult<()> {
        if self.phase != TurnPhase::NotStarted {
            return Err(VoiceError::Config(format!("session already started ({})", self.phase)));
        }
        if prompts.is_empty() {
            return Err(VoiceError::Config("no prompts configured".to_string()));
        }
        if let Some(i) = prompts.iter().position(|p| p.text.trim().is_empty()) {
            return Err(VoiceError::Config(format!("prompt {} is blank", i + 1)));
        }
        if duration.is_zero() {
            return Err(VoiceError::Config("session duration must be greater than zero".to_string()));
        }
        self.capture.request_permission()?;

        self.prompts = prompts;
        self.index = 0;
        self.transcript.clear();
        self.guard.reset();
        self.stopwatch.reset();
        self.countdown.start(now, duration);
        self.timers.schedule(TimerKind::SessionDeadline, duration);
        self.set_phase(TurnPhase::CountdownActive);
        info!("▶️ session started: {} prompts, {:?}", self.prompts.len(), duration);

        self.speak_current();
        Ok(())
    }

    /// Record `response` for the current prompt and move on.
    pub fn advance(&mut self, response: &str, opts: AdvanceOptions, now: Instant) -> AdvanceOutcome {
        if !self.phase.is_active() {
            return AdvanceOutcome::Ignored(IgnoreReason::NotActive);
        }
        let response = response.trim();
        if response.is_empty() {
            debug!("advance with empty response ignored");
            return AdvanceOutcome::Ignored(IgnoreReason::EmptyResponse);
        }

        let request = self.guard.mint(opts.requested_at.unwrap_or(now), opts.bypass_guard);
        if let Err(rejection) = self.guard.admit(&request) {
            debug!(?rejection, index = self.index, "advance rejected");
            return AdvanceOutcome::Ignored(IgnoreReason::Rejected(rejection));
        }

        self.set_phase(TurnPhase::Processing);
        self.silence_everything();
        self.record_turn(response.to_string(), now);
        self.capture.clear_text();

        let outcome = if self.index + 1 < self.prompts.len() {
            self.index += 1;
            self.speak_current();
            AdvanceOutcome::Advanced { index: self.index }
        } else {
            self.finalize(CompletionReason::PromptsExhausted);
            AdvanceOutcome::Completed
        };
        self.guard.settle(request.token, now);
        outcome
    }

    /// Record the skip sentinel for the current prompt.
    pub fn skip(&mut self, requested_at: Instant, now: Instant) -> AdvanceOutcome {
        let sentinel = self.settings.skip_sentinel.clone();
        self.advance(
            &sentinel,
            AdvanceOptions {
                bypass_guard: true,
                requested_at: Some(requested_at),
            },
            now,
        )
    }

    /// Submit the live draft now. A no-op while the draft is empty.
    pub fn next(&mut self, requested_at: Instant, now: Instant) -> AdvanceOutcome {
        let draft = self.capture.text().to_string();
        self.advance(
            &draft,
            AdvanceOptions {
                bypass_guard: true,
                requested_at: Some(requested_at),
            },
            now,
        )
    }

    /// Return to the previous prompt, restoring its answer as the draft.
    pub fn go_back(&mut self, requested_at: Instant, now: Instant) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        if self.index == 0 {
            debug!("already at the first prompt");
            return false;
        }
        let request = self.guard.mint(requested_at, true);
        if let Err(rejection) = self.guard.admit(&request) {
            debug!(?rejection, "go back rejected");
            return false;
        }

        self.silence_everything();
        self.stopwatch.reset();
        self.index -= 1;

        let previous = self.transcript.get(self.index).cloned();
        self.transcript.truncate(self.index);
        self.notify(SessionNotice::TranscriptTruncated { len: self.index });

        let (draft, payload) = match previous {
            Some(turn) if turn.is_skipped(&self.settings.skip_sentinel) => (String::new(), turn.payload),
            Some(turn) => (turn.response, turn.payload),
            None => (String::new(), None),
        };

        info!("⏮️ back to prompt {}", self.index + 1);
        self.speak_current();
        if payload.is_some() {
            self.draft_payload = payload;
        }
        self.capture.set_text(draft.clone());
        self.notify(SessionNotice::DraftUpdated(draft));
        self.guard.settle(request.token, now);
        true
    }

    /// The countdown reached zero: keep any partial answer, then finish.
    pub fn time_expired(&mut self, now: Instant) {
        self.finish(CompletionReason::TimeExpired, now);
    }

    /// The user ended the session early.
    pub fn end_session(&mut self, now: Instant) {
        self.finish(CompletionReason::EndedByUser, now);
    }

    /// Replace the live draft (typed edits). `payload` replaces the attached material when given.
    pub fn edit_draft(&mut self, text: impl Into<String>, payload: Option<String>) {
        if !self.phase.is_active() {
            return;
        }
        let text = text.into();
        self.capture.set_text(text.clone());
        if payload.is_some() {
            self.draft_payload = payload;
        }
        self.notify(SessionNotice::DraftUpdated(text));
    }

    /// Reopen the microphone from `Idle`.
    pub fn resume_capture(&mut self, now: Instant) {
        if self.phase == TurnPhase::Idle && self.utterance.is_none() {
            self.arm_capture(now);
        }
    }

    /// Apply one event. The only entry point used by the session driver.
    pub fn handle(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Command(cmd) => {
                let at = cmd.requested_at;
                match cmd.kind {
                    CommandKind::Next => {
                        self.next(at, now);
                    }
                    CommandKind::Skip => {
                        self.skip(at, now);
                    }
                    CommandKind::Previous => {
                        self.go_back(at, now);
                    }
                    CommandKind::End => self.end_session(now),
                    CommandKind::Resume => self.resume_capture(now),
                    CommandKind::EditDraft { text, payload } => self.edit_draft(text, payload),
                }
            }
            SessionEvent::Recognition { generation, event } => {
                if !self.phase.is_active() {
                    return;
                }
                let ctx = self.capture_context(now);
                let signal = self.capture.on_recognition(generation, event, ctx);
                self.apply_capture_signal(signal, now);
            }
            SessionEvent::Speech(ev) => self.on_speech(ev),
            SessionEvent::Timer(fired) => match fired.kind {
                TimerKind::Silence | TimerKind::CaptureCeiling | TimerKind::CaptureRestart => {
                    if !self.phase.is_active() {
                        return;
                    }
                    let ctx = self.capture_context(now);
                    let signal = self.capture.on_timer(fired, ctx);
                    self.apply_capture_signal(signal, now);
                }
                TimerKind::ListenGrace | TimerKind::SessionDeadline => self.on_session_timer(fired, now),
            },
        }

        debug_assert!(
            !(self.utterance.is_some() && self.capture.is_active()),
            "bot speech and capture overlap"
        );
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            index: self.index,
            prompt_count: self.prompts.len(),
            transcript_len: self.transcript.len(),
            draft: self.capture.text().to_string(),
            remaining: self.countdown.remaining(now),
            bot_speaking: self.utterance.is_some(),
            capturing: self.capture.is_active(),
        }
    }

    /// The completion, once. Later calls return `None`.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn draft(&self) -> &str {
        self.capture.text()
    }

    pub fn draft_payload(&self) -> Option<&str> {
        self.draft_payload.as_deref()
    }

    pub fn is_bot_speaking(&self) -> bool {
        self.utterance.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn set_phase(&mut self, to: TurnPhase) -> bool {
        match self.phase.transition(to) {
            Ok(from) => {
                if from != to || to == TurnPhase::BotSpeaking {
                    debug!(%from, %to, "phase");
                    self.notify(SessionNotice::PhaseChanged { from, to });
                }
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn capture_context(&mut self, now: Instant) -> CaptureContext {
        CaptureContext {
            session_active: self.phase.is_active(),
            bot_speaking: self.utterance.is_some(),
            transition_in_flight: self.guard.is_in_flight(now),
        }
    }

    /// Stop the microphone, the bot and the listen grace timer.
    fn silence_everything(&mut self) {
        self.capture.stop();
        self.timers.cancel(TimerKind::ListenGrace);
        if self.utterance.take().is_some() {
            self.bot.stop();
        }
    }

    fn speak_current(&mut self) {
        self.silence_everything();
        let prompt = &self.prompts[self.index];
        let text = prompt.text.clone();
        self.draft_payload = prompt.payload.clone();

        self.set_phase(TurnPhase::BotSpeaking);
        self.utterance = Some(self.bot.speak(&text));
        self.notify(SessionNotice::PromptStarted {
            index: self.index,
            text,
        });
    }

    fn on_speech(&mut self, ev: SpeechEvent) {
        if self.utterance != Some(ev.utterance) {
            debug!(utterance = ev.utterance.0, "ignoring speech event for a stale utterance");
            return;
        }
        if let SpeechEventKind::Failed(reason) = &ev.kind {
            warn!(%reason, "bot speech failed; continuing as if it finished");
        }
        if !ev.is_finished() {
            return;
        }

        self.utterance = None;
        self.bot.finished(ev.utterance);
        if self.phase == TurnPhase::BotSpeaking && self.set_phase(TurnPhase::PreparingToListen) {
            self.timers.schedule(TimerKind::ListenGrace, self.settings.listen_grace());
        }
    }

    fn on_session_timer(&mut self, fired: TimerFired, now: Instant) {
        if !self.timers.take_fired(fired) {
            debug!(?fired, "ignoring stale session timer");
            return;
        }
        match fired.kind {
            TimerKind::ListenGrace => {
                if self.phase == TurnPhase::PreparingToListen && self.utterance.is_none() {
                    self.arm_capture(now);
                }
            }
            TimerKind::SessionDeadline => {
                info!("⏱️ session time expired");
                self.time_expired(now);
            }
            _ => {}
        }
    }

    fn arm_capture(&mut self, now: Instant) {
        match self.capture.start() {
            Ok(()) => {
                self.set_phase(TurnPhase::Listening);
                self.stopwatch.start(now);
            }
            Err(e) => {
                warn!(error = %e, "could not open the microphone");
                let reason = match e {
                    VoiceError::PermissionDenied(_) => CaptureStopReason::PermissionRevoked,
                    _ => CaptureStopReason::RecognizerFailed,
                };
                self.set_phase(TurnPhase::Idle);
                self.notify(SessionNotice::CaptureStopped { reason });
            }
        }
    }

    fn apply_capture_signal(&mut self, signal: CaptureSignal, now: Instant) {
        match signal {
            CaptureSignal::Nothing => {}
            CaptureSignal::Interim(text) => {
                if self.phase == TurnPhase::Listening {
                    self.set_phase(TurnPhase::Recording);
                }
                self.notify(SessionNotice::InterimText(text));
            }
            CaptureSignal::TextAppended => {
                if self.phase == TurnPhase::Listening {
                    self.set_phase(TurnPhase::Recording);
                }
                self.notify(SessionNotice::DraftUpdated(self.capture.text().to_string()));
            }
            CaptureSignal::SilenceElapsed(text) => {
                let outcome = self.advance(
                    &text,
                    AdvanceOptions {
                        bypass_guard: false,
                        requested_at: Some(now),
                    },
                    now,
                );
                debug!(?outcome, "silence advance");
            }
            CaptureSignal::Stopped(reason) => {
                if self.phase.is_capturing() {
                    self.set_phase(TurnPhase::Idle);
                }
                self.notify(SessionNotice::CaptureStopped { reason });
            }
        }
    }

    fn record_turn(&mut self, response: String, now: Instant) {
        let elapsed = self.stopwatch.stop(now);
        let turn = Turn {
            prompt: self.prompts[self.index].text.clone(),
            response,
            payload: self.draft_payload.take(),
            timestamp: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        info!("📝 turn {} recorded ({}s)", self.index + 1, turn.elapsed_secs());
        self.transcript.push(turn.clone());
        self.notify(SessionNotice::TurnRecorded {
            index: self.index,
            turn,
        });
    }

    fn finish(&mut self, reason: CompletionReason, now: Instant) {
        if !self.phase.is_active() {
            return;
        }
        // The current prompt has no turn yet (`transcript.len() == index`), so the
        // partial answer is recorded even when a recent transition would make the
        // guard refuse it.
        let partial = self.capture.text().trim().to_string();
        if !partial.is_empty() {
            let request = self.guard.mint(now, true);
            if let Err(rejection) = self.guard.admit(&request) {
                debug!(?rejection, "recording partial answer despite recent transition");
            }
            self.record_turn(partial, now);
            self.guard.settle(request.token, now);
        }
        self.finalize(reason);
    }

    fn finalize(&mut self, reason: CompletionReason) {
        self.timers.cancel_all();
        self.silence_everything();
        self.countdown.stop();
        self.stopwatch.reset();
        self.capture.clear_text();
        self.set_phase(TurnPhase::Complete);

        info!("🏁 session complete ({:?}, {} turns)", reason, self.transcript.len());
        self.notify(SessionNotice::Completed {
            reason,
            turns: self.transcript.len(),
            at: Utc::now(),
        });
        self.completion = Some(Completion {
            reason,
            transcript: self.transcript.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelRecognizer, RecognizerFeed};
    use crate::output::NullOutput;
    use crate::tts::PlaceholderTts;

    const MS: Duration = Duration::from_millis(1);

    struct Harness {
        ctrl: TurnController,
        inbox: mpsc::UnboundedReceiver<SessionEvent>,
        feed: RecognizerFeed,
        _notices: mpsc::UnboundedReceiver<SessionNotice>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            let (recognizer, feed) = ChannelRecognizer::new();
            let deps = ControllerDeps {
                recognizer: Box::new(recognizer),
                synthesizer: Arc::new(PlaceholderTts),
                output: Arc::new(NullOutput),
                voice: "alloy".into(),
            };
            let (ctrl, notices) = TurnController::new(SessionSettings::default(), deps, tx);
            Self {
                ctrl,
                inbox,
                feed,
                _notices: notices,
            }
        }

        fn start(&mut self, prompts: &[&str]) {
            let prompts = prompts.iter().map(|p| Prompt::new(*p)).collect();
            self.ctrl
                .start_session(prompts, Duration::from_secs(900), Instant::now())
                .unwrap();
        }

        async fn pump_until(&mut self, done: impl Fn(&TurnController) -> bool) {
            while !done(&self.ctrl) {
                let ev = self.inbox.recv().await.expect("inbox closed");
                self.ctrl.handle(ev, Instant::now());
            }
        }

        async fn until_listening(&mut self) {
            self.pump_until(|c| c.phase() == TurnPhase::Listening).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bot_speaks_then_capture_opens_after_grace() {
        let mut h = Harness::new();
        h.start(&["Tell me about yourself.", "Why us?"]);
        assert_eq!(h.ctrl.phase(), TurnPhase::BotSpeaking);
        assert!(!h.feed.is_listening());

        h.pump_until(|c| c.phase() == TurnPhase::PreparingToListen).await;
        assert!(!h.feed.is_listening());
        let t = Instant::now();
        h.until_listening().await;
        assert!(Instant::now() - t >= Duration::from_millis(800));
        assert!(h.feed.is_listening());
        assert!(!h.ctrl.is_bot_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_and_click_together_record_one_turn() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?", "Third?"]);
        h.until_listening().await;
        h.ctrl.edit_draft("my answer", None);

        let t = Instant::now();
        let auto = h.ctrl.advance(
            "my answer",
            AdvanceOptions {
                bypass_guard: false,
                requested_at: Some(t),
            },
            t,
        );
        let click = h.ctrl.next(t + 30 * MS, t + 30 * MS);

        assert_eq!(auto, AdvanceOutcome::Advanced { index: 1 });
        assert!(matches!(
            click,
            AdvanceOutcome::Ignored(IgnoreReason::Rejected(_)) | AdvanceOutcome::Ignored(IgnoreReason::EmptyResponse)
        ));
        assert_eq!(h.ctrl.transcript().len(), 1);
        assert_eq!(h.ctrl.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_clicks_with_text_still_admit_once() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?", "Third?"]);
        h.until_listening().await;

        let t = Instant::now();
        h.ctrl.edit_draft("answer", None);
        assert_eq!(h.ctrl.next(t, t), AdvanceOutcome::Advanced { index: 1 });
        // A second source re-submits immediately with text of its own.
        h.ctrl.edit_draft("echo", None);
        assert_eq!(
            h.ctrl.next(t + 10 * MS, t + 10 * MS),
            AdvanceOutcome::Ignored(IgnoreReason::Rejected(Rejection::TooSoon { since_last: 10 * MS }))
        );
        assert_eq!(h.ctrl.transcript().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spoken_answer_is_submitted_after_silence() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;

        h.feed.final_text("I led the migration");
        h.pump_until(|c| c.phase() == TurnPhase::Recording).await;
        h.feed.final_text("to Rust");
        h.pump_until(|c| c.index() == 1).await;

        let turn = &h.ctrl.transcript()[0];
        assert_eq!(turn.prompt, "First?");
        assert_eq!(turn.response, "I led the migration to Rust");
        assert_eq!(turn.elapsed_secs(), 3);
        assert_eq!(h.ctrl.phase(), TurnPhase::BotSpeaking);
        assert!(!h.feed.is_listening());
        assert_eq!(h.ctrl.draft(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_runs_from_capture_to_advance() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        h.ctrl.edit_draft("answer", None);
        let now = Instant::now();
        h.ctrl.next(now, now);
        assert_eq!(h.ctrl.transcript()[0].elapsed_secs(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn next_with_empty_draft_is_a_no_op() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;
        let now = Instant::now();
        assert_eq!(h.ctrl.next(now, now), AdvanceOutcome::Ignored(IgnoreReason::EmptyResponse));
        assert_eq!(h.ctrl.index(), 0);
        assert_eq!(h.ctrl.phase(), TurnPhase::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn go_back_restores_answer_and_truncates() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?", "Third?"]);
        h.until_listening().await;
        h.ctrl.edit_draft("first answer", None);
        let t = Instant::now();
        h.ctrl.next(t, t);

        h.until_listening().await;
        let t = Instant::now();
        assert!(h.ctrl.go_back(t, t));
        assert_eq!(h.ctrl.index(), 0);
        assert!(h.ctrl.transcript().is_empty());
        assert_eq!(h.ctrl.draft(), "first answer");
        assert_eq!(h.ctrl.phase(), TurnPhase::BotSpeaking);
        assert!(!h.feed.is_listening());

        // Capture opens with the restored draft; new speech appends to it.
        h.until_listening().await;
        assert_eq!(h.ctrl.draft(), "first answer");
        h.feed.final_text("and more");
        h.pump_until(|c| c.index() == 1).await;
        assert_eq!(h.ctrl.transcript()[0].response, "first answer and more");
    }

    #[tokio::test(start_paused = true)]
    async fn go_back_over_a_skip_restores_empty_draft() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        let t = Instant::now();
        assert_eq!(h.ctrl.skip(t, t), AdvanceOutcome::Advanced { index: 1 });
        assert!(h.ctrl.transcript()[0].is_skipped("[Skipped]"));

        let later = t + Duration::from_secs(1);
        assert!(h.ctrl.go_back(later, later));
        assert_eq!(h.ctrl.draft(), "");
        assert!(h.ctrl.transcript().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn go_back_at_first_prompt_is_refused() {
        let mut h = Harness::new();
        h.start(&["Only?"]);
        let t = Instant::now();
        assert!(!h.ctrl.go_back(t, t));
        assert_eq!(h.ctrl.phase(), TurnPhase::BotSpeaking);
    }

    #[tokio::test(start_paused = true)]
    async fn last_answer_completes_exactly_once() {
        let mut h = Harness::new();
        h.start(&["Only?"]);
        h.until_listening().await;
        h.ctrl.edit_draft("done", None);
        let t = Instant::now();
        assert_eq!(h.ctrl.next(t, t), AdvanceOutcome::Completed);
        assert_eq!(h.ctrl.phase(), TurnPhase::Complete);

        let completion = h.ctrl.take_completion().unwrap();
        assert_eq!(completion.reason, CompletionReason::PromptsExhausted);
        assert_eq!(completion.transcript.len(), 1);
        assert!(h.ctrl.take_completion().is_none());

        // Nothing moves after completion.
        let later = t + Duration::from_secs(5);
        h.ctrl.end_session(later);
        assert!(h.ctrl.take_completion().is_none());
        assert_eq!(h.ctrl.skip(later, later), AdvanceOutcome::Ignored(IgnoreReason::NotActive));
        assert!(!h.feed.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn time_expiry_keeps_partial_answer() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;
        h.ctrl.edit_draft("half an answ", None);

        let t = Instant::now();
        h.ctrl.time_expired(t);
        let completion = h.ctrl.take_completion().unwrap();
        assert_eq!(completion.reason, CompletionReason::TimeExpired);
        assert_eq!(completion.transcript.len(), 1);
        assert_eq!(completion.transcript[0].response, "half an answ");
        assert!(!h.feed.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_right_after_go_back_keeps_restored_answer() {
        for reason in [CompletionReason::TimeExpired, CompletionReason::EndedByUser] {
            let mut h = Harness::new();
            h.start(&["First?", "Second?"]);
            h.until_listening().await;
            h.ctrl.edit_draft("my real answer", None);

            let t = Instant::now();
            assert_eq!(h.ctrl.next(t, t), AdvanceOutcome::Advanced { index: 1 });
            let back = t + Duration::from_secs(5);
            assert!(h.ctrl.go_back(back, back));
            assert_eq!(h.ctrl.draft(), "my real answer");

            let end = back + 200 * MS;
            match reason {
                CompletionReason::TimeExpired => h.ctrl.time_expired(end),
                _ => h.ctrl.end_session(end),
            }
            let completion = h.ctrl.take_completion().unwrap();
            assert_eq!(completion.reason, reason);
            assert_eq!(completion.transcript.len(), 1);
            assert_eq!(completion.transcript[0].prompt, "First?");
            assert_eq!(completion.transcript[0].response, "my real answer");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn skip_then_silence_together_record_one_turn() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?", "Third?"]);
        h.until_listening().await;
        h.feed.final_text("half a thought");
        h.pump_until(|c| c.phase() == TurnPhase::Recording).await;

        let t = Instant::now();
        assert_eq!(h.ctrl.skip(t, t), AdvanceOutcome::Advanced { index: 1 });
        let late = t + 100 * MS;
        let auto = h.ctrl.advance(
            "half a thought",
            AdvanceOptions {
                bypass_guard: false,
                requested_at: Some(late),
            },
            late,
        );
        assert!(matches!(
            auto,
            AdvanceOutcome::Ignored(IgnoreReason::Rejected(Rejection::TooSoon { .. }))
        ));

        // The silence timer armed by the spoken text was cancelled with the skip.
        h.pump_until(|c| c.phase() == TurnPhase::Listening).await;
        assert_eq!(h.ctrl.index(), 1);
        assert_eq!(h.ctrl.transcript().len(), 1);
        assert!(h.ctrl.transcript()[0].is_skipped("[Skipped]"));
        assert_eq!(h.ctrl.draft(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ends_the_session() {
        let (tx, mut inbox) = mpsc::unbounded_channel();
        let (recognizer, _feed) = ChannelRecognizer::new();
        let deps = ControllerDeps {
            recognizer: Box::new(recognizer),
            synthesizer: Arc::new(PlaceholderTts),
            output: Arc::new(NullOutput),
            voice: "alloy".into(),
        };
        let (mut ctrl, _notices) = TurnController::new(SessionSettings::default(), deps, tx);
        ctrl.start_session(vec![Prompt::new("Q?")], Duration::from_secs(5), Instant::now())
            .unwrap();

        let start = Instant::now();
        while ctrl.phase() != TurnPhase::Complete {
            let ev = inbox.recv().await.unwrap();
            ctrl.handle(ev, Instant::now());
        }
        assert!(start.elapsed() >= Duration::from_secs(5));
        let completion = ctrl.take_completion().unwrap();
        assert_eq!(completion.reason, CompletionReason::TimeExpired);
        assert!(completion.transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_drops_to_idle_and_draft_survives() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;
        h.feed.interim_text("umm");
        h.pump_until(|c| c.phase() == TurnPhase::Idle).await;
        assert!(!h.feed.is_listening());

        h.ctrl.edit_draft("typed instead", None);
        let t = Instant::now();
        assert_eq!(h.ctrl.next(t, t), AdvanceOutcome::Advanced { index: 1 });
        assert_eq!(h.ctrl.transcript()[0].response, "typed instead");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_reopens_microphone_after_ceiling() {
        let mut h = Harness::new();
        h.start(&["First?", "Second?"]);
        h.until_listening().await;
        h.feed.interim_text("umm");
        h.pump_until(|c| c.phase() == TurnPhase::Idle).await;
        h.ctrl.edit_draft("partial", None);

        let snap = h.ctrl.snapshot(Instant::now());
        assert_eq!(snap.phase, TurnPhase::Idle);
        assert_eq!(snap.draft, "partial");
        assert_eq!(snap.prompt_count, 2);
        assert!(!snap.capturing);
        assert!(!snap.bot_speaking);
        assert!(snap.remaining < Duration::from_secs(900));

        h.ctrl.resume_capture(Instant::now());
        assert_eq!(h.ctrl.phase(), TurnPhase::Listening);
        assert!(h.feed.is_listening());
        assert_eq!(h.ctrl.draft(), "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn start_session_validates_input() {
        let mut h = Harness::new();
        let now = Instant::now();
        assert!(h.ctrl.start_session(vec![], Duration::from_secs(60), now).is_err());
        assert!(h
            .ctrl
            .start_session(vec![Prompt::new("  ")], Duration::from_secs(60), now)
            .is_err());
        assert!(h
            .ctrl
            .start_session(vec![Prompt::new("Q?")], Duration::ZERO, now)
            .is_err());
        assert_eq!(h.ctrl.phase(), TurnPhase::NotStarted);

        h.start(&["Q?"]);
        assert!(h
            .ctrl
            .start_session(vec![Prompt::new("Q?")], Duration::from_secs(60), now)
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_microphone_fails_start() {
        let mut h = Harness::new();
        h.feed.deny_permission();
        let err = h
            .ctrl
            .start_session(vec![Prompt::new("Q?")], Duration::from_secs(60), Instant::now())
            .unwrap_err();
        assert!(matches!(err, VoiceError::PermissionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_travels_with_the_turn() {
        let mut h = Harness::new();
        let prompts = vec![
            Prompt::new("Reverse a list.").with_payload("fn reverse() {}"),
            Prompt::new("Next?"),
        ];
        h.ctrl
            .start_session(prompts, Duration::from_secs(900), Instant::now())
            .unwrap();
        assert_eq!(h.ctrl.draft_payload(), Some("fn reverse() {}"));
        h.ctrl
            .edit_draft("I'd iterate from both ends", Some("fn reverse(v: &mut [i32]) { v.reverse() }".into()));
        let t = Instant::now();
        h.ctrl.next(t, t);
        assert_eq!(
            h.ctrl.transcript()[0].payload.as_deref(),
            Some("fn reverse(v: &mut [i32]) { v.reverse() }")
        );
        assert_eq!(h.ctrl.draft_payload(), None);
    }
}
