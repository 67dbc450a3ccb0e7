//! Cancelable timers.
//!
//! A [`TimerScope`] spawns one tokio task per armed timer; each task sleeps
//! under the scope's `CancellationToken` and posts a [`TimerFired`] event to
//! the session inbox. Re-arming a kind replaces the previous timer of that
//! kind, and every firing carries a sequence number so a timer that fires
//! while being cancelled is recognised as stale.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Quiet period after the last final result.
    Silence,
    /// Hard cap on one capture.
    CaptureCeiling,
    /// Delayed recognizer restart after "no speech" or a spontaneous end.
    CaptureRestart,
    /// Pause between the bot finishing and the microphone opening.
    ListenGrace,
    /// Overall session countdown reached zero.
    SessionDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub seq: u64,
}

/// A set of timers cancelled together.
pub struct TimerScope {
    name: &'static str,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    token: CancellationToken,
    armed: HashMap<TimerKind, (u64, CancellationToken)>,
    next_seq: u64,
}

impl TimerScope {
    pub fn new(name: &'static str, inbox: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            name,
            inbox,
            token: CancellationToken::new(),
            armed: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any pending timer of the same kind.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        let seq = self.next_seq;
        self.next_seq += 1;
        let token = self.token.child_token();
        self.armed.insert(kind, (seq, token.clone()));

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox.send(SessionEvent::Timer(TimerFired { kind, seq }));
                }
            }
        });
    }

    /// Cancel one kind. Safe to call when nothing is armed.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, token)) = self.armed.remove(&kind) {
            token.cancel();
        }
    }

    /// Cancel everything in this scope. Idempotent.
    pub fn cancel_all(&mut self) {
        if !self.armed.is_empty() {
            debug!(scope = self.name, pending = self.armed.len(), "cancelling timers");
        }
        self.token.cancel();
        self.token = CancellationToken::new();
        self.armed.clear();
    }

    /// Accept a firing if it belongs to the currently armed timer of its kind, disarming it.
    pub fn take_fired(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some((seq, _)) if *seq == fired.seq => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

impl Drop for TimerScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Per-turn stopwatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stopwatch {
    started_at: Option<Instant>,
}

impl Stopwatch {
    /// Start if not already running.
    pub fn start(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Stop and return the elapsed time (zero if never started).
    pub fn stop(&mut self, now: Instant) -> Duration {
        self.started_at
            .take()
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }
}

/// Overall session countdown. Expiry itself is delivered by a [`TimerKind::SessionDeadline`] timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Countdown {
    deadline: Option<Instant>,
}

impl Countdown {
    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scope = TimerScope::new("test", tx);
        scope.schedule(TimerKind::Silence, Duration::from_secs(3));

        let start = Instant::now();
        let Some(SessionEvent::Timer(fired)) = rx.recv().await else {
            panic!("expected timer event");
        };
        assert_eq!(fired.kind, TimerKind::Silence);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_millis(3_010));
        assert!(scope.take_fired(fired));
        assert!(!scope.take_fired(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_discards_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scope = TimerScope::new("test", tx);
        scope.schedule(TimerKind::Silence, Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(2)).await;
        scope.schedule(TimerKind::Silence, Duration::from_secs(3));

        let start = Instant::now();
        let Some(SessionEvent::Timer(fired)) = rx.recv().await else {
            panic!("expected timer event");
        };
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_millis(3_010));
        assert!(scope.take_fired(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_is_idempotent_and_silences_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scope = TimerScope::new("test", tx);
        scope.schedule(TimerKind::Silence, Duration::from_secs(1));
        scope.schedule(TimerKind::CaptureCeiling, Duration::from_secs(2));
        scope.cancel_all();
        scope.cancel_all();
        assert!(!scope.is_armed(TimerKind::Silence));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_firing_is_rejected_after_cancel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scope = TimerScope::new("test", tx);
        scope.schedule(TimerKind::Silence, Duration::from_secs(1));
        let stale = TimerFired {
            kind: TimerKind::Silence,
            seq: 1,
        };
        scope.cancel(TimerKind::Silence);
        assert!(!scope.take_fired(stale));
    }

    #[test]
    fn stopwatch_measures_from_first_start() {
        let t0 = Instant::now();
        let mut sw = Stopwatch::default();
        sw.start(t0);
        sw.start(t0 + Duration::from_secs(1));
        assert_eq!(sw.stop(t0 + Duration::from_secs(4)), Duration::from_secs(4));
        assert_eq!(sw.stop(t0 + Duration::from_secs(9)), Duration::ZERO);
    }

    #[test]
    fn countdown_saturates_at_zero() {
        let t0 = Instant::now();
        let mut c = Countdown::default();
        c.start(t0, Duration::from_secs(10));
        assert_eq!(c.remaining(t0 + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(c.remaining(t0 + Duration::from_secs(40)), Duration::ZERO);
        c.stop();
        assert!(!c.is_running());
    }
}
