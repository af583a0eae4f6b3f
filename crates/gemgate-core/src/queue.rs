//! Per-request frame queue between the control link and a coordinator task.
//!
//! Effectively SPSC per request id: the link enqueues, the owning
//! coordinator loop dequeues. `close` must wake every waiter with an error
//! so link loss cascades to all in-flight requests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq)]
pub enum QueueFrame {
    ResponseHeaders {
        status: u16,
        headers: BTreeMap<String, String>,
    },
    Chunk(String),
    StreamEnd,
    Error {
        status: u16,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("dequeue timed out")]
    Timeout,
}

#[derive(Debug, Default)]
struct Inner {
    buffer: VecDeque<QueueFrame>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames enqueued after close are dropped.
    pub fn enqueue(&self, frame: QueueFrame) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return;
            }
            inner.buffer.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub async fn dequeue(&self, timeout: Duration) -> Result<QueueFrame, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking state so a concurrent
            // enqueue between the check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = inner.buffer.pop_front() {
                    return Ok(frame);
                }
                if inner.closed {
                    return Err(QueueError::Closed);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Timeout);
            }
        }
    }

    pub async fn dequeue_default(&self) -> Result<QueueFrame, QueueError> {
        self.dequeue(DEFAULT_DEQUEUE_TIMEOUT).await
    }

    /// Drops buffered frames and fails every pending waiter with `Closed`.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
            inner.buffer.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn buffered_frames_dequeue_in_order() {
        let queue = MessageQueue::new();
        queue.enqueue(QueueFrame::Chunk("a".to_string()));
        queue.enqueue(QueueFrame::StreamEnd);
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
            QueueFrame::Chunk("a".to_string())
        );
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
            QueueFrame::StreamEnd
        );
    }

    #[tokio::test]
    async fn waiter_resolves_on_late_enqueue() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(QueueFrame::Chunk("late".to_string()));
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            QueueFrame::Chunk("late".to_string())
        );
    }

    #[tokio::test]
    async fn dequeue_times_out() {
        let queue = MessageQueue::new();
        let err = queue.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, QueueError::Timeout);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_drops_buffer() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(QueueFrame::Chunk("lost on close".to_string()));
        queue.close();
        // The buffered frame was handed to the waiter or dropped; either
        // way a subsequent dequeue reports Closed.
        let _ = waiter.await.unwrap();
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await.unwrap_err(),
            QueueError::Closed
        );
    }

    #[tokio::test]
    async fn enqueue_after_close_is_dropped() {
        let queue = MessageQueue::new();
        queue.close();
        queue.enqueue(QueueFrame::StreamEnd);
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await.unwrap_err(),
            QueueError::Closed
        );
    }
}
