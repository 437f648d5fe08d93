//! Outbound writer
//!
//! Turns each `write` call into one bulk OUT transfer. Submissions are
//! serialized by `submit_lock` so payloads from concurrent writers reach the
//! endpoint whole and in the order they were accepted; the backend keeps
//! FIFO order per endpoint from there.

use crate::device::Device;
use crate::error::{BridgeError, Result};
use crate::sync::{lock, wait};
use crate::transfer::{Completion, Direction, TransferBuffer, TransferId, TransferOutcome};
use common::BridgeEvent;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

/// `write_room` reports this many OUT packets of room
pub const WRITE_ROOM_MULTIPLIER: usize = 16;

pub struct OutboundWriter {
    /// Request context only; held across copy and submission
    submit_lock: Mutex<()>,
    /// Writes submitted but not yet completed
    pending: Mutex<HashSet<TransferId>>,
    drained: Condvar,
}

impl OutboundWriter {
    pub(crate) fn new() -> Self {
        Self {
            submit_lock: Mutex::new(()),
            pending: Mutex::new(HashSet::new()),
            drained: Condvar::new(),
        }
    }

    /// Queue `bytes` as one OUT transfer
    ///
    /// Returns the accepted count as soon as the backend took the request;
    /// it does not wait for the device to acknowledge it.
    pub fn write(&self, device: &Device, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        device.ensure_attached()?;

        let _submit = lock(&self.submit_lock);
        // Detach may have started while we waited for the lock.
        device.ensure_attached()?;

        let endpoint = device.endpoints().bulk_out;
        let max_packet = usize::from(endpoint.max_packet_size).max(1);
        let zero_packet = bytes.len() % max_packet == 0;

        let buffer = TransferBuffer::copy_from(bytes, device.counters().clone());
        let request = device.new_request(Direction::Out, endpoint.address, buffer, zero_packet);

        // Held across submit so the completion cannot be handled before the
        // id is recorded.
        let mut pending = lock(&self.pending);
        match device.backend().submit(request) {
            Ok(id) => {
                pending.insert(id);
                device.counters().write_submitted();
                trace!(
                    "Submitted write {} ({} bytes, zlp: {}) on {}",
                    id,
                    bytes.len(),
                    zero_packet,
                    device.slot()
                );
                Ok(bytes.len())
            }
            Err(failure) => {
                warn!("Write submission failed on {}: {}", device.slot(), failure.error);
                Err(BridgeError::SubmitFailed(failure.error))
            }
        }
    }

    /// Handle a finished write (completion context)
    pub(crate) fn on_completion(&self, device: &Device, completion: Completion) {
        let Completion {
            id,
            buffer,
            outcome,
            ..
        } = completion;
        let requested = buffer.len();
        drop(buffer);

        let mut pending = lock(&self.pending);
        if !pending.remove(&id) {
            warn!("Ignoring stray write completion {} on {}", id, device.slot());
            return;
        }
        device.counters().write_finished();

        match outcome {
            TransferOutcome::Completed(length) => {
                device.counters().add_bytes_out(length);
                if length < requested {
                    warn!(
                        "Short write {} on {}: {} of {} bytes",
                        id,
                        device.slot(),
                        length,
                        requested
                    );
                } else {
                    trace!("Write {} completed ({} bytes)", id, length);
                }
            }
            TransferOutcome::Cancelled => trace!("Write {} cancelled", id),
            TransferOutcome::DeviceGone => debug!("Write {} ended, device gone", id),
            TransferOutcome::Error(e) => {
                error!("Write {} on {} failed: {}", id, device.slot(), e);
                device.publish(BridgeEvent::WriteFailed {
                    slot: device.slot().0,
                    message: e.to_string(),
                });
            }
        }

        if pending.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Cancel every in-flight write and wait until all of them completed
    pub fn cancel_pending(&self, device: &Device) {
        let _submit = lock(&self.submit_lock);
        let mut pending = lock(&self.pending);

        if !pending.is_empty() {
            debug!("Cancelling {} pending writes on {}", pending.len(), device.slot());
        }
        for id in pending.iter() {
            device.backend().cancel(*id);
        }
        while !pending.is_empty() {
            pending = wait(&self.drained, pending);
        }
    }

    /// Bytes a caller may write without waiting
    pub fn capacity_hint(&self, device: &Device) -> usize {
        if !device.is_attached() {
            return 0;
        }
        usize::from(device.endpoints().bulk_out.max_packet_size) * WRITE_ROOM_MULTIPLIER
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Run `f` with submissions excluded
    pub(crate) fn fenced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _submit = lock(&self.submit_lock);
        f()
    }
}
