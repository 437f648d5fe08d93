//! Out-of-band event channel
//!
//! Transfer completions run on a worker thread with no caller to hand an
//! error back to. Those conditions, together with attach/detach notices, are
//! published here and consumed by whoever drives the bridge (CLI, console,
//! tests).
//!
//! Publishing never blocks: a completion handler must not wait on a slow
//! consumer, so a full channel drops the event with a warning.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use tracing::{trace, warn};

/// Default event channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A device was attached and its port registered
    Attached {
        /// Slot the device occupies
        slot: u8,
        /// USB vendor id
        vendor_id: u16,
        /// USB product id
        product_id: u16,
    },

    /// A device finished detaching; its port is gone
    Detached {
        /// Slot that was released
        slot: u8,
    },

    /// The inbound stream stopped on a hard transfer error
    TransportError {
        /// Slot of the affected device
        slot: u8,
        /// Error description
        message: String,
    },

    /// An asynchronous write failed after the caller already returned
    WriteFailed {
        /// Slot of the affected device
        slot: u8,
        /// Error description
        message: String,
    },

    /// A transfer reported that the device disappeared
    DeviceGone {
        /// Slot of the affected device
        slot: u8,
    },
}

impl BridgeEvent {
    /// Slot the event refers to
    pub fn slot(&self) -> u8 {
        match self {
            BridgeEvent::Attached { slot, .. }
            | BridgeEvent::Detached { slot }
            | BridgeEvent::TransportError { slot, .. }
            | BridgeEvent::WriteFailed { slot, .. }
            | BridgeEvent::DeviceGone { slot } => *slot,
        }
    }
}

/// Publishing half of the event channel
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<BridgeEvent>,
}

impl EventSender {
    /// Publish an event without blocking
    ///
    /// Returns `false` if the event was dropped.
    pub fn publish(&self, event: BridgeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(event)) => {
                trace!("No event listener, dropping {:?}", event);
                false
            }
        }
    }
}

/// Consuming half of the event channel
#[derive(Clone, Debug)]
pub struct EventReceiver {
    rx: Receiver<BridgeEvent>,
}

impl EventReceiver {
    /// Receive the next event (async)
    pub async fn recv(&self) -> crate::Result<BridgeEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<BridgeEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<BridgeEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain every event currently queued
    pub fn drain(&self) -> Vec<BridgeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create the event channel with the default capacity
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    create_event_channel_with_capacity(EVENT_CHANNEL_CAPACITY)
}

/// Create the event channel with an explicit capacity
pub fn create_event_channel_with_capacity(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity);
    (EventSender { tx }, EventReceiver { rx })
}
