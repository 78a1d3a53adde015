//! Heartbeat bookkeeping for a session.

use std::time::{Duration, Instant};

/// What a poll with no inbound traffic should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Idle,
    SendKeepalive,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    enabled: bool,
    timeout: Duration,
    interval: Duration,
    last_receive: Instant,
    last_send: Instant,
}

impl Liveness {
    pub fn new(timeout: Duration, interval: Duration, now: Instant) -> Self {
        Self {
            enabled: false,
            timeout,
            interval,
            last_receive: now,
            last_send: now,
        }
    }

    pub fn enable(&mut self, now: Instant) {
        if !self.enabled {
            self.enabled = true;
            self.last_receive = now;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_receive(&self) -> Instant {
        self.last_receive
    }

    /// Any frame that passed the integrity check.
    pub fn on_receive(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_send = now;
    }

    /// Restart both timers, e.g. when a handshake completes.
    pub fn restart(&mut self, now: Instant) {
        self.last_receive = now;
        self.last_send = now;
    }

    /// Only meaningful for a `Ready` session; the caller checks state.
    pub fn poll(&self, now: Instant) -> LivenessAction {
        if !self.enabled {
            return LivenessAction::Idle;
        }
        if now.saturating_duration_since(self.last_receive) > self.timeout {
            return LivenessAction::TimedOut;
        }
        if now.saturating_duration_since(self.last_send) >= self.interval {
            return LivenessAction::SendKeepalive;
        }
        LivenessAction::Idle
    }
}
