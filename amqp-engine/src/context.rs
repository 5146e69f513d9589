//! Cancellation and deadline carrier passed through waiting calls

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    /// [`Context::cancel`] was called on this context or a parent
    Cancelled,

    /// The deadline elapsed
    DeadlineExceeded,
}

/// A cancellation token with an optional deadline
///
/// Cloning a context shares the cancellation token, so cancelling any clone cancels
/// all of them. Use [`Context::child`] to derive a context that can be cancelled on
/// its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires unless cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// A context expiring after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context expiring at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derives a context that is cancelled with this one and expires no later than
    /// `timeout` from now
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Cancels the context
    pub fn cancel(&self) {
        self.token.cancel()
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the deadline has elapsed
    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Returns why the context is done, or `None` if it is still live
    pub fn done_reason(&self) -> Option<Done> {
        if self.is_cancelled() {
            Some(Done::Cancelled)
        } else if self.is_expired() {
            Some(Done::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Completes when the context is cancelled or its deadline elapses
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Done::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Done::Cancelled
            }
        }
    }
}
