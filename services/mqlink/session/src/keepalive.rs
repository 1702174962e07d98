//! Keep alive tracking for the writer task.
//!
//! The writer sends PINGREQ when nothing has been written for the keep alive
//! interval and gives the connection up if PINGRESP does not arrive within
//! the ping timeout.

use std::time::Duration;
use tokio::time::Instant;

/// What the writer should do when the keep alive deadline fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send a PINGREQ
    Ping,
    /// The outstanding PINGREQ went unanswered
    TimedOut,
}

/// Keep alive state for one connection
#[derive(Debug)]
pub struct KeepaliveState {
    keep_alive: Duration,
    ping_timeout: Duration,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepaliveState {
    /// Start tracking from now
    pub fn new(keep_alive: Duration, ping_timeout: Duration) -> Self {
        Self {
            keep_alive,
            ping_timeout,
            last_sent: Instant::now(),
            ping_sent_at: None,
        }
    }

    /// Note that a packet was written
    pub fn record_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    /// Note that a PINGREQ was written
    pub fn record_ping(&mut self) {
        let now = Instant::now();
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    /// Note that a PINGRESP arrived; returns the round trip if a ping was outstanding
    pub fn record_pong(&mut self) -> Option<Duration> {
        self.ping_sent_at.take().map(|sent| sent.elapsed())
    }

    /// Whether a PINGREQ is awaiting its response
    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Next instant the writer must act, or `None` when keep alive is off
    pub fn next_deadline(&self) -> Option<(Instant, KeepaliveAction)> {
        if self.keep_alive.is_zero() {
            return None;
        }
        match self.ping_sent_at {
            Some(sent) => Some((sent + self.ping_timeout, KeepaliveAction::TimedOut)),
            None => Some((self.last_sent + self.keep_alive, KeepaliveAction::Ping)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_cycle() {
        let mut state = KeepaliveState::new(Duration::from_secs(5), Duration::from_secs(2));
        let start = Instant::now();
        assert_eq!(
            state.next_deadline(),
            Some((start + Duration::from_secs(5), KeepaliveAction::Ping))
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        state.record_sent();
        let (deadline, _) = state.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_secs(8));

        state.record_ping();
        assert!(state.ping_outstanding());
        assert_eq!(state.next_deadline().unwrap().1, KeepaliveAction::TimedOut);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(state.record_pong(), Some(Duration::from_millis(500)));
        assert!(!state.ping_outstanding());
        assert_eq!(state.record_pong(), None);
    }

    #[tokio::test]
    async fn test_disabled() {
        let state = KeepaliveState::new(Duration::ZERO, Duration::from_secs(2));
        assert!(state.next_deadline().is_none());
    }
}
