//! Heartbeat bookkeeping for one connection.
//!
//! Pure timekeeping: the owner records traffic and polls with the current
//! instant, then sends a heartbeat or closes as told. Any frame counts as
//! proof of life, not just heartbeat frames.

use std::time::Duration;

use tokio::time::Instant;

/// What the owner should do now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Idle,
    /// Nothing was sent for a full interval.
    SendHeartbeat,
    /// Peer silent for longer than `grace * interval`.
    Expired { silent_for: Duration },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Option<Duration>,
    grace: u32,
    last_received: Instant,
    last_sent: Instant,
}

impl HeartbeatMonitor {
    /// `interval_secs` of 0 disables heartbeats.
    pub fn new(interval_secs: u16, grace: u32, now: Instant) -> Self {
        Self {
            interval: interval_from_secs(interval_secs),
            grace: grace.max(1),
            last_received: now,
            last_sent: now,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Apply the negotiated interval.
    pub fn set_interval(&mut self, interval_secs: u16) {
        self.interval = interval_from_secs(interval_secs);
    }

    pub fn record_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    fn timeout(&self, interval: Duration) -> Duration {
        interval * self.grace
    }

    pub fn poll(&self, now: Instant) -> HeartbeatStatus {
        let Some(interval) = self.interval else {
            return HeartbeatStatus::Idle;
        };
        let silent_for = now.saturating_duration_since(self.last_received);
        if silent_for > self.timeout(interval) {
            return HeartbeatStatus::Expired { silent_for };
        }
        if now.saturating_duration_since(self.last_sent) >= interval {
            return HeartbeatStatus::SendHeartbeat;
        }
        HeartbeatStatus::Idle
    }

    /// Instant at which the peer counts as dead if nothing arrives.
    pub fn expires_at(&self) -> Option<Instant> {
        let interval = self.interval?;
        // strictly past the timeout
        Some(self.last_received + self.timeout(interval) + Duration::from_millis(1))
    }

    /// Next instant at which `poll` can change its answer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let send_at = self.last_sent + self.interval?;
        Some(send_at.min(self.expires_at()?))
    }
}

fn interval_from_secs(secs: u16) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(u64::from(secs)))
}
