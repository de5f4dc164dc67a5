//! Per-request delivery queue.
//!
//! One `MessageQueue` exists for every in-flight relayed request. The registry
//! is the producer (frames routed by `request_id`), the request handler is the
//! consumer. The queue is FIFO, unbounded from the producer's side and can be
//! closed from either side at any time:
//!
//! - `enqueue` never blocks and never drops an item while the queue is open
//! - `close` is idempotent; waiting and future `dequeue` calls observe `Closed`
//! - after `close`, `enqueue` is silently ignored
//! - at most one `StreamEnd` marker is ever accepted; once it has been
//!   consumed the queue reports `Closed`

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

use crate::websocket::InboundEvent;

/// Items observed by a queue consumer
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Event(InboundEvent),
    /// End of the response stream
    StreamEnd,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("timed out waiting for queue item")]
    Timeout,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
    /// Terminal marker accepted; no further items are taken
    finished: bool,
}

#[derive(Debug)]
pub struct MessageQueue {
    request_id: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Append an item. Returns `false` if the item was ignored.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        {
            let mut state = self.lock();
            if state.closed || state.finished {
                return false;
            }
            if item == QueueItem::StreamEnd {
                state.finished = true;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item
    pub async fn dequeue(&self) -> Result<QueueItem, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a close or enqueue racing with
            // this check still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if state.finished {
                    return Err(QueueError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Wait for the next item, giving up after `timeout`
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Result<QueueItem, QueueError> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .map_err(|_| QueueError::Timeout)?
    }

    /// Close the queue, dropping anything still buffered.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.lock();
            if state.closed {
                false
            } else {
                state.closed = true;
                state.items.clear();
                true
            }
        };
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // State is plain data; a panic elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
