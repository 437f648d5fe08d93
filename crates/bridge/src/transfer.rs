//! Transfer requests, completions, and the backend seam
//!
//! A [`TransferRequest`] owns its [`TransferBuffer`]. Submitting moves the
//! request into the backend; the backend hands it back either immediately
//! inside a [`SubmitFailure`] or later, exactly once, through
//! [`TransferRequest::complete`]. The buffer therefore has a single owner at
//! every point and is released exactly once when the last owner drops it.

use crate::stats::TransferCounters;
use crate::worker::WorkerMessage;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Per-device transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Counted byte buffer owned by exactly one request at a time
pub struct TransferBuffer {
    data: Vec<u8>,
    counters: Arc<TransferCounters>,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of `size` bytes
    pub fn zeroed(size: usize, counters: Arc<TransferCounters>) -> Self {
        counters.buffer_allocated();
        Self {
            data: vec![0u8; size],
            counters,
        }
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn copy_from(bytes: &[u8], counters: Arc<TransferCounters>) -> Self {
        counters.buffer_allocated();
        Self {
            data: bytes.to_vec(),
            counters,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        self.counters.buffer_released();
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Hard transfer failures reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Pipe,

    #[error("device sent more data than requested")]
    Overflow,

    #[error("input/output error")]
    Io,

    #[error("resource busy")]
    Busy,

    #[error("resubmission failed: {0}")]
    Resubmit(SubmitError),

    #[error("{0}")]
    Other(String),
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Finished; carries the number of bytes actually transferred
    Completed(usize),
    /// Cancelled before it finished
    Cancelled,
    /// The device disappeared underneath the transfer
    DeviceGone,
    /// Failed with a hard error
    Error(TransferError),
}

impl TransferOutcome {
    /// Whether this outcome is an expected teardown rather than a failure
    pub fn is_teardown(&self) -> bool {
        matches!(self, TransferOutcome::Cancelled | TransferOutcome::DeviceGone)
    }
}

/// Reasons a backend refuses a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("out of transfer resources")]
    NoResources,

    #[error("device is gone")]
    DeviceGone,

    #[error("backend is shut down")]
    Closed,
}

/// A refused submission, handing the request (and its buffer) back
#[derive(Debug)]
pub struct SubmitFailure {
    pub error: SubmitError,
    pub request: TransferRequest,
}

impl SubmitFailure {
    pub fn new(error: SubmitError, request: TransferRequest) -> Self {
        Self { error, request }
    }

    /// Recover the buffer so the caller can keep or release it
    pub fn into_buffer(self) -> TransferBuffer {
        self.request.into_buffer()
    }
}

/// Finished transfer, delivered to the device's completion worker
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub direction: Direction,
    pub buffer: TransferBuffer,
    pub outcome: TransferOutcome,
}

/// Where a request reports its completion
#[derive(Clone)]
pub(crate) struct CompletionSender {
    tx: async_channel::Sender<WorkerMessage>,
}

impl CompletionSender {
    pub(crate) fn new(tx: async_channel::Sender<WorkerMessage>) -> Self {
        Self { tx }
    }
}

/// One asynchronous operation against one endpoint
pub struct TransferRequest {
    id: TransferId,
    endpoint: u8,
    direction: Direction,
    buffer: TransferBuffer,
    zero_packet: bool,
    completion: CompletionSender,
}

impl TransferRequest {
    pub(crate) fn new(
        id: TransferId,
        endpoint: u8,
        direction: Direction,
        buffer: TransferBuffer,
        zero_packet: bool,
        completion: CompletionSender,
    ) -> Self {
        Self {
            id,
            endpoint,
            direction,
            buffer,
            zero_packet,
            completion,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Endpoint address including the direction bit
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether an OUT transfer must be terminated with a zero-length packet
    pub fn zero_packet(&self) -> bool {
        self.zero_packet
    }

    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut TransferBuffer {
        &mut self.buffer
    }

    pub(crate) fn into_buffer(self) -> TransferBuffer {
        self.buffer
    }

    /// Finish the request and hand it to the completion worker
    ///
    /// If the worker is already gone the completion is dropped, which
    /// releases the buffer.
    pub fn complete(self, outcome: TransferOutcome) {
        let completion = Completion {
            id: self.id,
            direction: self.direction,
            buffer: self.buffer,
            outcome,
        };
        if self
            .completion
            .tx
            .try_send(WorkerMessage::Completion(completion))
            .is_err()
        {
            trace!("Completion for {} dropped, worker gone", self.id);
        }
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("direction", &self.direction)
            .field("len", &self.buffer.len())
            .field("zero_packet", &self.zero_packet)
            .finish()
    }
}

/// Asynchronous USB transfer engine for one device
///
/// Contract:
/// - `submit` never blocks. On success the backend owns the request and must
///   call [`TransferRequest::complete`] exactly once, from any thread.
/// - `cancel` never blocks and is a no-op for unknown or finished ids. A
///   cancelled request still completes, normally with
///   [`TransferOutcome::Cancelled`].
/// - Requests on the same endpoint are processed in submission order.
pub trait TransferBackend: Send + Sync {
    /// Queue a request
    fn submit(&self, request: TransferRequest) -> Result<TransferId, SubmitFailure>;

    /// Ask for an outstanding request to finish early
    fn cancel(&self, id: TransferId);

    /// Release the underlying device; called once detach has drained
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_counts_live_allocations() {
        let counters = Arc::new(TransferCounters::default());

        let a = TransferBuffer::zeroed(64, counters.clone());
        let b = TransferBuffer::copy_from(b"Turn on\n", counters.clone());
        assert_eq!(counters.snapshot().buffers_live, 2);
        assert_eq!(a.len(), 64);
        assert_eq!(b.as_slice(), b"Turn on\n");

        drop(a);
        assert_eq!(counters.snapshot().buffers_live, 1);
        drop(b);
        assert_eq!(counters.snapshot().buffers_live, 0);
    }

    #[test]
    fn test_complete_after_worker_gone_releases_buffer() {
        let counters = Arc::new(TransferCounters::default());
        let (tx, rx) = async_channel::unbounded();
        drop(rx);

        let request = TransferRequest::new(
            TransferId(1),
            0x81,
            Direction::In,
            TransferBuffer::zeroed(64, counters.clone()),
            false,
            CompletionSender::new(tx),
        );
        request.complete(TransferOutcome::Completed(0));

        assert_eq!(counters.snapshot().buffers_live, 0);
    }

    #[test]
    fn test_outcome_teardown_classes() {
        assert!(TransferOutcome::Cancelled.is_teardown());
        assert!(TransferOutcome::DeviceGone.is_teardown());
        assert!(!TransferOutcome::Completed(3).is_teardown());
        assert!(!TransferOutcome::Error(TransferError::Pipe).is_teardown());
    }
}
