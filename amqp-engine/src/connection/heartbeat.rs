//! Idle timeout tracking in both directions

use std::time::Duration;

use tokio::time::Instant;

use crate::definitions::Milliseconds;

/// Tracks when frames were last received and sent
///
/// The local idle timeout bounds the silence accepted from the peer. The peer's
/// idle timeout is honoured by sending an empty frame once half of it elapsed
/// without traffic.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    local: Option<Duration>,
    remote: Option<Duration>,
    last_received: Instant,
    last_sent: Instant,
}

impl IdleTimer {
    pub(crate) fn new(local: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            local: local.filter(|d| !d.is_zero()),
            remote: None,
            last_received: now,
            last_sent: now,
        }
    }

    pub(crate) fn reset(&mut self) {
        let now = Instant::now();
        self.last_received = now;
        self.last_sent = now;
    }

    /// Zero or absent means the peer does not expect heartbeats
    pub(crate) fn set_remote(&mut self, idle_time_out: Option<Milliseconds>) {
        self.remote = idle_time_out
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
    }

    pub(crate) fn remote(&self) -> Option<Duration> {
        self.remote
    }

    pub(crate) fn on_received(&mut self) {
        self.last_received = Instant::now();
    }

    pub(crate) fn on_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    pub(crate) fn local_expired(&self) -> bool {
        matches!(self.local, Some(timeout) if self.last_received.elapsed() > timeout)
    }

    pub(crate) fn heartbeat_due(&self) -> bool {
        matches!(self.remote, Some(timeout) if self.last_sent.elapsed() >= timeout / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn local_timeout_expires_without_traffic() {
        let mut timer = IdleTimer::new(Some(Duration::from_millis(100)));
        assert!(!timer.local_expired());

        tokio::time::advance(Duration::from_millis(60)).await;
        timer.on_received();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!timer.local_expired());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(timer.local_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_at_half_remote_timeout() {
        let mut timer = IdleTimer::new(None);
        timer.set_remote(Some(0));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!timer.heartbeat_due());

        timer.set_remote(Some(1000));
        timer.on_sent();
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!timer.heartbeat_due());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(timer.heartbeat_due());
    }
}
