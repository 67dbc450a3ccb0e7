//! Transition guard: admit exactly one advance per genuine event.
//!
//! Silence detection and manual navigation are independent sources that can
//! fire within the same few milliseconds. Each request gets a fresh token and
//! a timestamp; a single slot remembers the last admitted token, so the guard
//! never grows.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Opaque, monotonically increasing transition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionToken(u64);

/// A stamped request to change turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub token: TransitionToken,
    pub requested_at: Instant,
    /// Set only for direct user navigation (next / previous / skip).
    pub bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The token was already admitted (or is older than one that was).
    Stale,
    /// Arrived within the minimum interval of the last admitted request.
    TooSoon { since_last: Duration },
    /// Another transition has not settled yet.
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    token: TransitionToken,
    settled_at: Option<Instant>,
}

#[derive(Debug)]
pub struct TransitionGuard {
    min_interval: Duration,
    settle_delay: Duration,
    next_token: u64,
    last_admitted: Option<(TransitionToken, Instant)>,
    in_flight: Option<InFlight>,
}

impl TransitionGuard {
    pub fn new(min_interval: Duration, settle_delay: Duration) -> Self {
        Self {
            min_interval,
            settle_delay,
            next_token: 1,
            last_admitted: None,
            in_flight: None,
        }
    }

    /// Mint a token for a request issued at `requested_at`.
    pub fn mint(&mut self, requested_at: Instant, bypass: bool) -> TransitionRequest {
        let token = TransitionToken(self.next_token);
        self.next_token += 1;
        TransitionRequest {
            token,
            requested_at,
            bypass,
        }
    }

    /// Admit or reject a request. An admitted request is in flight until [`settle`](Self::settle)
    /// plus the settle delay.
    pub fn admit(&mut self, req: &TransitionRequest) -> Result<(), Rejection> {
        if let Some((last, last_at)) = self.last_admitted {
            if req.token <= last {
                return Err(Rejection::Stale);
            }
            let since_last = req.requested_at.saturating_duration_since(last_at);
            if since_last < self.min_interval {
                return Err(Rejection::TooSoon { since_last });
            }
        }

        if self.is_in_flight(req.requested_at) && !req.bypass {
            return Err(Rejection::InFlight);
        }

        self.last_admitted = Some((req.token, req.requested_at));
        self.in_flight = Some(InFlight {
            token: req.token,
            settled_at: None,
        });
        Ok(())
    }

    /// Mark the mutation for `token` as complete. Tokens other than the current one are ignored.
    pub fn settle(&mut self, token: TransitionToken, now: Instant) {
        match self.in_flight.as_mut() {
            Some(f) if f.token == token => f.settled_at = Some(now),
            _ => debug!(?token, "settle for a transition that is no longer current"),
        }
    }

    /// True while a transition is mutating state or inside its settle delay.
    pub fn is_in_flight(&mut self, now: Instant) -> bool {
        match self.in_flight {
            None => false,
            Some(InFlight { settled_at: None, .. }) => true,
            Some(InFlight {
                settled_at: Some(at), ..
            }) => {
                if now.saturating_duration_since(at) >= self.settle_delay {
                    self.in_flight = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Forget all history (new session).
    pub fn reset(&mut self) {
        self.last_admitted = None;
        self.in_flight = None;
    }
}
