//! Bridge from completion callbacks to waiting callers

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::future::select_all;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::Context;

/// Upper bound between two polls while a caller waits on an [`OperationQueue`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Something that can be driven forward by the waiting thread
///
/// A connection is the usual pollable: polling it processes pending transport
/// events, which in turn completes operations.
pub trait Pollable: Send + Sync {
    /// Process whatever work is pending without blocking
    fn poll(&self);

    /// A notifier signalled whenever new work may be available
    fn notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// A FIFO of completed results
///
/// [`complete_operation`](Self::complete_operation) is called by the producer side,
/// typically from inside the protocol engine, and never blocks.
/// [`wait_for_polled_result`](Self::wait_for_polled_result) is the consumer side.
#[derive(Debug)]
pub struct OperationQueue<T> {
    completed: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for OperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OperationQueue<T> {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self {
            completed: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueues a completed result, waking one waiter
    pub fn complete_operation(&self, value: T) {
        self.completed.lock().push_back(value);
        self.notify.notify_one();
    }

    /// Takes a completed result without waiting
    pub fn try_take(&self) -> Option<T> {
        self.completed.lock().pop_front()
    }

    /// Discards all completed results
    pub fn clear(&self) {
        self.completed.lock().clear();
    }

    /// Waits for a result without driving any pollable
    pub async fn wait_for_result(&self, ctx: &Context) -> Option<T> {
        self.wait_for_polled_result(ctx, &[]).await
    }

    /// Waits for a result, polling `pollables` while the queue is empty
    ///
    /// Returns `None` once `ctx` is cancelled or its deadline elapses.
    pub async fn wait_for_polled_result(
        &self,
        ctx: &Context,
        pollables: &[&dyn Pollable],
    ) -> Option<T> {
        let notifiers: Vec<Arc<Notify>> = pollables.iter().filter_map(|p| p.notifier()).collect();

        loop {
            for pollable in pollables {
                pollable.poll();
            }
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            if ctx.done_reason().is_some() {
                return None;
            }

            let woken = async {
                if pollables.is_empty() {
                    std::future::pending::<()>().await
                } else if notifiers.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await
                } else {
                    let notified = notifiers.iter().map(|n| Box::pin(n.notified()));
                    let _ = tokio::time::timeout(POLL_INTERVAL, select_all(notified)).await;
                }
            };

            // A completion racing this check leaves a permit behind for `notified`
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = ctx.done() => {},
                _ = woken => {},
            }
        }
    }
}
