//! Ping/pong bookkeeping for the broker connection.
//!
//! Times are wall-clock milliseconds so that a clock stepping backwards can
//! be noticed and survived.

use std::time::Duration;

use tracing::{info, warn};

/// Extra time a pong may lag behind the keepalive interval.
pub const PONG_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Idle,
    /// Send a ping now; the ping stamp has already moved
    Ping,
    /// No pong for too long, drop the connection
    Expired,
}

#[derive(Debug, Clone)]
pub struct Keepalive {
    interval_ms: i64,
    last_ping: i64,
    last_pong: i64,
}

impl Keepalive {
    /// `interval_secs == 0` disables keepalive.
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_ms: (interval_secs as i64).saturating_mul(1000),
            last_ping: 0,
            last_pong: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.interval_ms > 0
    }

    pub fn last_ping(&self) -> i64 {
        self.last_ping
    }

    pub fn last_pong(&self) -> i64 {
        self.last_pong
    }

    /// Fresh connection: both stamps start now.
    pub fn reset(&mut self, now: i64) {
        self.last_ping = now;
        self.last_pong = now;
    }

    pub fn pong(&mut self, now: i64) {
        self.last_pong = now;
    }

    pub fn check(&mut self, now: i64) -> KeepaliveAction {
        if !self.enabled() {
            return KeepaliveAction::Idle;
        }

        if now < self.last_ping || now < self.last_pong {
            warn!(
                "system clock went backwards ({} < {}), resetting keepalive",
                now,
                self.last_ping.max(self.last_pong)
            );
            self.reset(now);
        }

        let grace_ms = PONG_GRACE.as_millis() as i64;
        if now - self.last_pong > self.interval_ms + grace_ms {
            info!(
                "broker connection timed out: no pong for {} ms",
                now - self.last_pong
            );
            return KeepaliveAction::Expired;
        }

        if now - self.last_ping >= self.interval_ms {
            self.last_ping = now;
            return KeepaliveAction::Ping;
        }

        KeepaliveAction::Idle
    }
}
