//! Session driver: owns the inbox and the controller, runs until completion,
//! then asks for feedback exactly once.

use coach_core::{feedback_or_fallback, FeedbackGenerator, FeedbackReport, Prompt, SessionMeta, SessionSettings, Turn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::controller::{ControllerDeps, TurnController};
use crate::error::{VoiceError, VoiceResult};
use crate::event::{Command, CommandKind, CompletionReason, SessionEvent, SessionNotice};

/// Cloneable handle for issuing user commands to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, kind: CommandKind) -> VoiceResult<()> {
        self.inbox
            .send(SessionEvent::Command(Command::now(kind)))
            .map_err(|_| VoiceError::SessionFinished)
    }

    pub fn next(&self) -> VoiceResult<()> {
        self.send(CommandKind::Next)
    }

    pub fn skip(&self) -> VoiceResult<()> {
        self.send(CommandKind::Skip)
    }

    pub fn previous(&self) -> VoiceResult<()> {
        self.send(CommandKind::Previous)
    }

    pub fn end(&self) -> VoiceResult<()> {
        self.send(CommandKind::End)
    }

    pub fn resume(&self) -> VoiceResult<()> {
        self.send(CommandKind::Resume)
    }

    pub fn edit_draft(&self, text: impl Into<String>, payload: Option<String>) -> VoiceResult<()> {
        self.send(CommandKind::EditDraft {
            text: text.into(),
            payload,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub reason: CompletionReason,
    pub transcript: Vec<Turn>,
    pub feedback: FeedbackReport,
}

pub struct VoiceSession {
    controller: TurnController,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    feedback: Arc<dyn FeedbackGenerator>,
    settings: SessionSettings,
    meta: SessionMeta,
}

impl VoiceSession {
    pub fn new(
        settings: SessionSettings,
        meta: SessionMeta,
        deps: ControllerDeps,
        feedback: Arc<dyn FeedbackGenerator>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (controller, notices) = TurnController::new(settings.clone(), deps, tx.clone());
        let session = Self {
            controller,
            inbox,
            feedback,
            settings,
            meta,
        };
        (session, SessionHandle { inbox: tx }, notices)
    }

    /// Run the session over `prompts` to completion and return the transcript with feedback.
    pub async fn run(mut self, prompts: Vec<Prompt>) -> VoiceResult<SessionOutcome> {
        info!("🎙️ starting {} session", self.meta.kind.label());
        self.controller
            .start_session(prompts, self.settings.duration(), Instant::now())?;

        let completion = loop {
            if let Some(completion) = self.controller.take_completion() {
                break completion;
            }
            match self.inbox.recv().await {
                Some(event) => self.controller.handle(event, Instant::now()),
                None => {
                    warn!("session inbox closed before completion");
                    return Err(VoiceError::ChannelSend("session inbox closed".to_string()));
                }
            }
        };

        let feedback = feedback_or_fallback(self.feedback.as_ref(), &completion.transcript, &self.meta).await;
        Ok(SessionOutcome {
            reason: completion.reason,
            transcript: completion.transcript,
            feedback,
        })
    }
}
