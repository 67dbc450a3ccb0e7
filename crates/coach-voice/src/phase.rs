//! Turn phase state machine.
//!
//! ```text
//! NotStarted → CountdownActive → BotSpeaking → PreparingToListen → Listening → Recording
//!                                    ▲                                  │          │
//!                                    └──────── Processing ◄─────────────┴──────────┘
//! ```
//!
//! Any active phase may also drop to `Idle` (capture force-stopped), jump back
//! to `BotSpeaking` (previous prompt re-spoken) or finish in `Complete`.
//! `Complete` is terminal.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnPhase {
    NotStarted,
    CountdownActive,
    BotSpeaking,
    PreparingToListen,
    Listening,
    Recording,
    Processing,
    /// A prompt is current but neither the bot nor the microphone is active.
    Idle,
    Complete,
}

/// A rejected phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: TurnPhase,
    pub to: TurnPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal turn transition {} -> {}", self.from, self.to)
    }
}

impl TurnPhase {
    /// Whether a session is running (started and not complete).
    pub fn is_active(self) -> bool {
        !matches!(self, TurnPhase::NotStarted | TurnPhase::Complete)
    }

    /// Whether the microphone may be open in this phase.
    pub fn is_capturing(self) -> bool {
        matches!(self, TurnPhase::Listening | TurnPhase::Recording)
    }

    pub fn can_transition_to(self, to: TurnPhase) -> bool {
        use TurnPhase::*;

        match (self, to) {
            (Complete, _) => false,
            (NotStarted, CountdownActive) => true,
            (NotStarted, _) => false,
            (_, Complete) => true,
            (CountdownActive, BotSpeaking) => true,
            (BotSpeaking, BotSpeaking | PreparingToListen | Processing | Idle) => true,
            (PreparingToListen, Listening | Processing | BotSpeaking | Idle) => true,
            (Listening, Recording | Processing | BotSpeaking | Idle) => true,
            (Recording, Processing | BotSpeaking | Idle) => true,
            (Idle, Listening | Processing | BotSpeaking) => true,
            (Processing, BotSpeaking) => true,
            _ => false,
        }
    }

    /// Validate and apply a transition. Self-transitions other than re-speaking are no-ops.
    pub fn transition(&mut self, to: TurnPhase) -> Result<TurnPhase, IllegalTransition> {
        let from = *self;
        if from == to && from != TurnPhase::BotSpeaking {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { from, to });
        }
        *self = to;
        Ok(from)
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::NotStarted => "not_started",
            TurnPhase::CountdownActive => "countdown_active",
            TurnPhase::BotSpeaking => "bot_speaking",
            TurnPhase::PreparingToListen => "preparing_to_listen",
            TurnPhase::Listening => "listening",
            TurnPhase::Recording => "recording",
            TurnPhase::Processing => "processing",
            TurnPhase::Idle => "idle",
            TurnPhase::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TurnPhase::*;

    #[test]
    fn happy_path_is_legal() {
        let mut phase = NotStarted;
        for next in [
            CountdownActive,
            BotSpeaking,
            PreparingToListen,
            Listening,
            Recording,
            Processing,
            BotSpeaking,
            Complete,
        ] {
            assert!(phase.transition(next).is_ok(), "{phase} -> {next}");
        }
        assert_eq!(phase, Complete);
    }

    #[test]
    fn complete_is_terminal() {
        let mut phase = Complete;
        assert!(phase.transition(BotSpeaking).is_err());
        assert!(phase.transition(Listening).is_err());
        assert_eq!(phase, Complete);
    }

    #[test]
    fn cannot_listen_while_bot_speaks() {
        let mut phase = BotSpeaking;
        let err = phase.transition(Listening).unwrap_err();
        assert_eq!(err, IllegalTransition { from: BotSpeaking, to: Listening });
        assert_eq!(phase, BotSpeaking);
    }

    #[test]
    fn processing_never_reopens_microphone() {
        assert!(!Processing.can_transition_to(Listening));
        assert!(!Processing.can_transition_to(Recording));
    }

    #[test]
    fn capture_flags() {
        assert!(Listening.is_capturing());
        assert!(Recording.is_capturing());
        assert!(!BotSpeaking.is_capturing());
        assert!(!NotStarted.is_active());
        assert!(Idle.is_active());
    }
}
