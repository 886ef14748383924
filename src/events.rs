// events.rs

use crate::native::{CommErrors, PinChange};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Notifications raised by the pump threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// `bytes` new bytes arrived; `available` are now waiting to be read.
    DataReceived { bytes: usize, available: usize },
    PinChanged(PinChange),
    ErrorReceived(CommErrors),
}

/// Fan-out of [`SerialEvent`]s to any number of channel subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next
/// publish.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<SerialEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SerialEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: SerialEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        log::trace!("event: {:?}", event);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
