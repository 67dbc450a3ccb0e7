//! End-to-end session flows driven through the public session API.
//!
//! Recognition is fed through a `ChannelRecognizer`, bot speech uses the
//! placeholder synthesizer (timed estimate) and time is paused, so every
//! timer in the flow fires deterministically.

use async_trait::async_trait;
use coach_core::{
    ChatFeedbackGenerator, CoachConfig, CoachResult, FeedbackGenerator, FeedbackReport, MockChat, Prompt, SessionKind,
    SessionMeta, SessionSettings, Turn,
};
use coach_voice::{
    ChannelRecognizer, CompletionReason, ControllerDeps, NullOutput, PlaceholderTts, RecognizerFeed, SessionHandle,
    SessionNotice, SessionOutcome, TurnPhase, VoiceResult, VoiceSession,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

/// Records every transcript it is asked to review.
#[derive(Default)]
struct RecordingFeedback {
    calls: Mutex<Vec<Vec<Turn>>>,
}

#[async_trait]
impl FeedbackGenerator for RecordingFeedback {
    async fn generate(&self, transcript: &[Turn], _meta: &SessionMeta) -> CoachResult<FeedbackReport> {
        self.calls.lock().unwrap().push(transcript.to_vec());
        Ok(FeedbackReport::fallback("recorded"))
    }
}

struct Running {
    handle: SessionHandle,
    feed: RecognizerFeed,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    task: JoinHandle<VoiceResult<SessionOutcome>>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn spawn_session(prompts: &[&str], feedback: Arc<dyn FeedbackGenerator>) -> Running {
    init_logging();
    let (recognizer, feed) = ChannelRecognizer::new();
    let deps = ControllerDeps {
        recognizer: Box::new(recognizer),
        synthesizer: Arc::new(PlaceholderTts),
        output: Arc::new(NullOutput),
        voice: "alloy".into(),
    };
    let settings = SessionSettings::default();
    let meta = SessionMeta::new(SessionKind::Interview, settings.duration_secs);
    let (session, handle, notices) = VoiceSession::new(settings, meta, deps, feedback);
    let prompts: Vec<Prompt> = prompts.iter().map(|p| Prompt::new(*p)).collect();
    let task = tokio::spawn(session.run(prompts));
    Running {
        handle,
        feed,
        notices,
        task,
    }
}

async fn wait_for(
    notices: &mut mpsc::UnboundedReceiver<SessionNotice>,
    pred: impl Fn(&SessionNotice) -> bool,
) -> SessionNotice {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let notice = notices.recv().await.expect("session ended while waiting");
            if pred(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("notice never arrived")
}

fn is_listening(n: &SessionNotice) -> bool {
    matches!(n, SessionNotice::PhaseChanged { to: TurnPhase::Listening, .. })
}

#[tokio::test(start_paused = true)]
async fn silence_then_skip_completes_with_one_feedback_call() {
    let feedback = Arc::new(RecordingFeedback::default());
    let mut s = spawn_session(
        &["Tell me about yourself.", "Why this company?"],
        feedback.clone(),
    );

    let started = wait_for(&mut s.notices, |n| matches!(n, SessionNotice::PromptStarted { .. })).await;
    assert_eq!(
        started,
        SessionNotice::PromptStarted {
            index: 0,
            text: "Tell me about yourself.".into()
        }
    );

    wait_for(&mut s.notices, is_listening).await;
    assert!(s.feed.final_text("I have five years of experience"));

    let recorded = wait_for(&mut s.notices, |n| matches!(n, SessionNotice::TurnRecorded { .. })).await;
    let SessionNotice::TurnRecorded { index, turn } = recorded else {
        unreachable!()
    };
    assert_eq!(index, 0);
    assert_eq!(turn.response, "I have five years of experience");
    assert_eq!(turn.elapsed_secs(), 3);
    assert!(!s.feed.is_listening());

    wait_for(&mut s.notices, |n| matches!(n, SessionNotice::PromptStarted { index: 1, .. })).await;
    wait_for(&mut s.notices, is_listening).await;
    assert_ok!(s.handle.skip());

    let outcome = s.task.await.unwrap().unwrap();
    assert_eq!(outcome.reason, CompletionReason::PromptsExhausted);
    assert_eq!(outcome.transcript.len(), 2);
    assert_eq!(outcome.transcript[0].response, "I have five years of experience");
    assert!(outcome.transcript[1].is_skipped("[Skipped]"));

    let calls = feedback.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn previous_during_capture_restores_first_answer() {
    let feedback = Arc::new(RecordingFeedback::default());
    let mut s = spawn_session(&["First question?", "Second question?"], feedback.clone());

    wait_for(&mut s.notices, is_listening).await;
    s.feed.final_text("My original answer");
    wait_for(&mut s.notices, |n| matches!(n, SessionNotice::TurnRecorded { index: 0, .. })).await;

    wait_for(&mut s.notices, is_listening).await;
    assert!(s.feed.is_listening());
    assert_ok!(s.handle.previous());

    assert_eq!(
        wait_for(&mut s.notices, |n| matches!(n, SessionNotice::TranscriptTruncated { .. })).await,
        SessionNotice::TranscriptTruncated { len: 0 }
    );
    assert!(!s.feed.is_listening());
    assert_eq!(
        wait_for(&mut s.notices, |n| matches!(n, SessionNotice::DraftUpdated(_))).await,
        SessionNotice::DraftUpdated("My original answer".into())
    );

    // Ending right away keeps the restored answer as the in-progress turn.
    assert_ok!(s.handle.end());
    let outcome = s.task.await.unwrap().unwrap();
    assert_eq!(outcome.reason, CompletionReason::EndedByUser);
    assert_eq!(outcome.transcript.len(), 1);
    assert_eq!(outcome.transcript[0].prompt, "First question?");
    assert_eq!(outcome.transcript[0].response, "My original answer");
    assert_eq!(feedback.calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unusable_feedback_reply_falls_back() {
    let chat = Arc::new(MockChat::with_reply("I'm sorry, I can't produce JSON today."));
    let generator = Arc::new(ChatFeedbackGenerator::new(chat, &CoachConfig::default()));
    let mut s = spawn_session(&["Only question?"], generator);

    wait_for(&mut s.notices, is_listening).await;
    s.feed.final_text("An answer");

    let outcome = s.task.await.unwrap().unwrap();
    assert_eq!(outcome.transcript.len(), 1);
    assert!(outcome.feedback.is_fallback());
}

#[tokio::test(start_paused = true)]
async fn commands_after_completion_report_finished_session() {
    let mut s = spawn_session(&["Only question?"], Arc::new(RecordingFeedback::default()));
    wait_for(&mut s.notices, |n| matches!(n, SessionNotice::PromptStarted { .. })).await;
    assert_ok!(s.handle.end());

    let outcome = s.task.await.unwrap().unwrap();
    assert!(outcome.transcript.is_empty());
    assert!(s.handle.next().is_err());
}
