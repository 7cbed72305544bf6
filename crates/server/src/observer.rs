//! Single-subscriber event channels.
//!
//! Each collaborator publishes into an `EventChannel<T>`; the one consumer
//! takes the receiver once. A second `take_receiver` fails instead of
//! replacing the first subscriber.

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObserverError {
    #[error("{0} channel already has a subscriber")]
    AlreadySubscribed(&'static str),
}

pub struct EventChannel<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> EventChannel<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Publish an event. Events published before anyone subscribes are
    /// buffered; events published after the subscriber is dropped are lost.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn take_receiver(&self) -> Result<mpsc::UnboundedReceiver<T>, ObserverError> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ObserverError::AlreadySubscribed(self.name))
    }

    /// A publishing handle for collaborators that outlive a borrow of the channel.
    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }
}
