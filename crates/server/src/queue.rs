//! Message hand-off queue between the cloud and the remote driver.
//!
//! FIFO, single consumer: at most one `wait_for_message` may be suspended at
//! a time, and a second concurrent wait is rejected with
//! [`QueueError::WaiterPending`]. A wait whose future was dropped does not
//! count; its slot is reclaimed by the next caller.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use switchyard_connector_core::Attachment;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::observer::{EventChannel, ObserverError};

/// An outbound user message for the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("message queue is closed")]
    Closed,
    #[error("another wait_for_message is already pending")]
    WaiterPending,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedMessage>,
    // Only ever set while `items` is empty.
    waiter: Option<oneshot::Sender<Option<QueuedMessage>>>,
    closed: bool,
}

pub struct MessageQueue {
    state: Mutex<QueueState>,
    /// Fires on every accepted push with the backlog length after the push.
    pushes: EventChannel<usize>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            pushes: EventChannel::new("queue_push"),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message, or hand it straight to a suspended waiter.
    pub fn push(
        &self,
        message: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<(), QueueError> {
        let backlog = {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let msg = QueuedMessage {
                message: message.into(),
                attachments,
            };
            match state.waiter.take() {
                Some(waiter) => {
                    if let Err(Some(returned)) = waiter.send(Some(msg)) {
                        // Waiter went away without being woken.
                        state.items.push_back(returned);
                    }
                }
                None => state.items.push_back(msg),
            }
            state.items.len()
        };

        debug!(
            component = "queue",
            event = "queue.pushed",
            backlog = backlog,
            "Message queued"
        );
        self.pushes.emit(backlog);
        Ok(())
    }

    /// Next message in push order, suspending while the queue is empty.
    ///
    /// Resolves to `Ok(None)` when the queue is reset or closed underneath a
    /// suspended wait, or immediately once the queue is closed.
    pub async fn wait_for_message(&self) -> Result<Option<QueuedMessage>, QueueError> {
        let rx = {
            let mut state = self.state();
            if let Some(msg) = state.items.pop_front() {
                return Ok(Some(msg));
            }
            if state.closed {
                return Ok(None);
            }
            if state.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                return Err(QueueError::WaiterPending);
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };
        Ok(rx.await.unwrap_or(None))
    }

    /// Drop the backlog and wake a suspended waiter with `None`.
    pub fn reset(&self) {
        let (dropped, waiter) = {
            let mut state = self.state();
            let dropped = state.items.len();
            state.items.clear();
            (dropped, state.waiter.take())
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(None);
        }
        debug!(
            component = "queue",
            event = "queue.reset",
            dropped = dropped,
            "Message queue reset"
        );
    }

    /// Refuse further pushes, then reset.
    pub fn close(&self) {
        self.state().closed = true;
        self.reset();
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_push_receiver(&self) -> Result<mpsc::UnboundedReceiver<usize>, ObserverError> {
        self.pushes.take_receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn text(msg: Option<QueuedMessage>) -> Option<String> {
        msg.map(|m| m.message)
    }

    #[tokio::test]
    async fn push_then_wait_resolves_immediately() {
        let queue = MessageQueue::new();
        queue.push("hello", vec![]).expect("push");

        let msg = queue.wait_for_message().await.expect("wait");
        assert_eq!(text(msg).as_deref(), Some("hello"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn suspended_wait_is_resolved_by_push() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::task::yield_now().await;

        queue.push("hi", vec![]).expect("push");
        let msg = waiter.await.expect("join").expect("wait");
        assert_eq!(text(msg).as_deref(), Some("hi"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waits_return_messages_in_push_order() {
        let queue = MessageQueue::new();
        for i in 0..5 {
            queue.push(format!("m{i}"), vec![]).expect("push");
        }
        for i in 0..3 {
            let msg = queue.wait_for_message().await.expect("wait");
            assert_eq!(text(msg), Some(format!("m{i}")));
        }
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn extra_wait_stays_suspended_until_satisfied() {
        let queue = Arc::new(MessageQueue::new());
        queue.push("only", vec![]).expect("push");
        assert_eq!(
            text(queue.wait_for_message().await.expect("wait")).as_deref(),
            Some("only")
        );

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push("later", vec![]).expect("push");
        let msg = waiter.await.expect("join").expect("wait");
        assert_eq!(text(msg).as_deref(), Some("later"));
    }

    #[tokio::test]
    async fn reset_wakes_waiter_with_none_and_drops_backlog() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::task::yield_now().await;

        queue.reset();
        assert_eq!(waiter.await.expect("join"), Ok(None));

        queue.push("a", vec![]).expect("push");
        queue.push("b", vec![]).expect("push");
        queue.reset();
        assert!(queue.is_empty());

        // Reset is not closing: the queue keeps working.
        queue.push("c", vec![]).expect("push");
        assert_eq!(
            text(queue.wait_for_message().await.expect("wait")).as_deref(),
            Some("c")
        );
    }

    #[tokio::test]
    async fn second_concurrent_wait_is_rejected() {
        let queue = Arc::new(MessageQueue::new());
        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            queue.wait_for_message().await,
            Err(QueueError::WaiterPending)
        );

        queue.push("for-first", vec![]).expect("push");
        let msg = first.await.expect("join").expect("wait");
        assert_eq!(text(msg).as_deref(), Some("for-first"));
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_swallow_messages() {
        let queue = MessageQueue::new();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), queue.wait_for_message()).await;
        assert!(abandoned.is_err());

        queue.push("kept", vec![]).expect("push");
        assert_eq!(queue.len(), 1);
        assert_eq!(
            text(queue.wait_for_message().await.expect("wait")).as_deref(),
            Some("kept")
        );
    }

    #[tokio::test]
    async fn close_rejects_pushes_and_releases_waits() {
        let queue = MessageQueue::new();
        queue.push("pending", vec![]).expect("push");
        queue.close();

        assert_eq!(queue.push("late", vec![]), Err(QueueError::Closed));
        assert_eq!(queue.wait_for_message().await, Ok(None));
    }

    #[tokio::test]
    async fn push_observer_fires_with_and_without_waiter() {
        let queue = Arc::new(MessageQueue::new());
        let mut pushes = queue.take_push_receiver().expect("observer");

        queue.push("queued", vec![]).expect("push");
        assert_eq!(pushes.recv().await, Some(1));
        let _ = queue.wait_for_message().await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::task::yield_now().await;
        queue.push("direct", vec![]).expect("push");
        assert_eq!(pushes.recv().await, Some(0));
        assert!(waiter.await.expect("join").expect("wait").is_some());

        assert!(queue.take_push_receiver().is_err());
    }
}
