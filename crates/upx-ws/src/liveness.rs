//! Connection liveness tracking.
//!
//! Any inbound frame (data, status, ping or pong) proves the connection is
//! alive. Pings go out on a fixed interval while live; a connection that stays
//! silent past the idle timeout is declared dead.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Default ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Liveness state of one connection. Owned by the read loop.
#[derive(Debug, Clone)]
pub struct Liveness {
    ping_interval: Duration,
    idle_timeout: Duration,
    last_inbound: Instant,
    last_ping: Instant,
}

impl Liveness {
    pub fn new(ping_interval: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            idle_timeout,
            last_inbound: now,
            last_ping: now,
        }
    }

    /// Reset on a fresh connection.
    pub fn reset(&mut self, now: Instant) {
        self.last_inbound = now;
        self.last_ping = now;
    }

    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping = now;
        debug!(
            silent_ms = now.duration_since(self.last_inbound).as_millis() as u64,
            "Sent liveness ping"
        );
    }

    pub fn should_ping(&self, now: Instant) -> bool {
        now >= self.next_ping_at()
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now >= self.idle_deadline()
    }

    pub fn next_ping_at(&self) -> Instant {
        self.last_ping + self.ping_interval
    }

    pub fn idle_deadline(&self) -> Instant {
        self.last_inbound + self.idle_timeout
    }

    /// Earliest instant at which the loop has something to do.
    pub fn next_check(&self) -> Instant {
        self.next_ping_at().min(self.idle_deadline())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_schedule() {
        let start = Instant::now();
        let mut liveness = Liveness::new(DEFAULT_PING_INTERVAL, DEFAULT_IDLE_TIMEOUT, start);

        assert!(!liveness.should_ping(start + Duration::from_secs(29)));
        assert!(liveness.should_ping(start + Duration::from_secs(30)));

        liveness.record_ping(start + Duration::from_secs(30));
        assert_eq!(liveness.next_ping_at(), start + Duration::from_secs(60));
        assert_eq!(liveness.next_check(), start + Duration::from_secs(60));
    }

    #[test]
    fn test_idle_only_after_silence() {
        let start = Instant::now();
        let mut liveness = Liveness::new(DEFAULT_PING_INTERVAL, DEFAULT_IDLE_TIMEOUT, start);

        assert!(!liveness.is_idle(start + Duration::from_secs(119)));
        liveness.record_inbound(start + Duration::from_secs(100));
        assert!(!liveness.is_idle(start + Duration::from_secs(200)));
        assert!(liveness.is_idle(start + Duration::from_secs(220)));
    }
}
