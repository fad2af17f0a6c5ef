//! Ping/pong liveness monitor.
//!
//! Pure timer state: the owner asks for [`Heartbeat::next_deadline`], sleeps
//! until then, and calls [`Heartbeat::poll`] to learn what to do.
//!
//! ```text
//!  traffic ──► restart interval ──(interval of silence)──► SendPing
//!                                                              │
//!                   traffic ◄──(within timeout)────────────────┤
//!                                                              ▼
//!                                                          TimedOut
//! ```

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    TimedOut,
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    ping_at: Option<Instant>,
    timeout_at: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ping_at: None,
            timeout_at: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.ping_at = Some(now + self.interval);
        self.timeout_at = None;
    }

    pub fn stop(&mut self) {
        self.ping_at = None;
        self.timeout_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.ping_at.is_some() || self.timeout_at.is_some()
    }

    /// Any inbound frame proves the peer is alive.
    pub fn message_received(&mut self, now: Instant) {
        if self.is_running() {
            self.timeout_at = None;
            self.ping_at = Some(now + self.interval);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ping_at, self.timeout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if self.timeout_at.is_some_and(|at| at <= now) {
            self.stop();
            return Some(HeartbeatAction::TimedOut);
        }
        if self.ping_at.is_some_and(|at| at <= now) {
            self.ping_at = None;
            self.timeout_at = Some(now + self.timeout);
            return Some(HeartbeatAction::SendPing);
        }
        None
    }
}
