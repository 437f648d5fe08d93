//! Bridge error types

use crate::device::SlotId;
use crate::transfer::{SubmitError, TransferError};
use thiserror::Error;

/// Errors returned synchronously by bridge operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The port's device is detached, detaching, or was never attached
    #[error("No device attached")]
    NoDevice,

    /// Registry lookup found nothing in the slot
    #[error("No device in {0}")]
    NotFound(SlotId),

    /// Endpoint discovery did not yield exactly one bulk IN and one bulk OUT
    #[error(
        "Expected exactly one bulk IN and one bulk OUT endpoint, found {bulk_in} IN and {bulk_out} OUT"
    )]
    NoBulkEndpoints { bulk_in: usize, bulk_out: usize },

    /// Attach targeted a slot that already holds a device
    #[error("{0} is already occupied")]
    SlotOccupied(SlotId),

    /// Slot index is beyond the registry capacity
    #[error("{slot} is out of range (capacity {capacity})")]
    SlotOutOfRange { slot: SlotId, capacity: u8 },

    /// Every slot is occupied
    #[error("No free slot (capacity {0})")]
    NoFreeSlot(u8),

    /// An inbound transfer is already outstanding
    #[error("Inbound transfer already outstanding")]
    AlreadyRunning,

    /// The transfer backend refused the request
    #[error("Transfer submission failed: {0}")]
    SubmitFailed(SubmitError),

    /// The inbound stream stopped on a hard transfer error
    #[error("Transport error: {0}")]
    TransportError(TransferError),

    /// The completion worker thread could not be started
    #[error("Failed to spawn completion worker: {0}")]
    WorkerSpawn(String),
}

/// Type alias for bridge results
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::NoBulkEndpoints {
            bulk_in: 1,
            bulk_out: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("1 IN"));
        assert!(msg.contains("0 OUT"));

        let err = BridgeError::SlotOccupied(SlotId(0));
        assert_eq!(err.to_string(), "slot 0 is already occupied");
    }

    #[test]
    fn test_submit_failed_display() {
        let err = BridgeError::SubmitFailed(SubmitError::NoResources);
        assert!(err.to_string().starts_with("Transfer submission failed"));
    }
}
