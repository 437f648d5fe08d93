//! Inbound pump
//!
//! Keeps exactly one bulk IN transfer outstanding while the port is open and
//! not throttled. Each completion delivers its bytes to the port's inbound
//! queue and, if the pump is still wanted, resubmits the same scratch
//! buffer. With a single request in flight there is nothing to reorder:
//! bytes reach the port in completion order.
//!
//! The state lock is taken from both contexts. Completion handlers only
//! hold it for bookkeeping, delivery and a non-blocking resubmit; the one
//! wait (`stop`) parks on a condvar, which releases the lock.

use crate::device::Device;
use crate::error::{BridgeError, Result};
use crate::sync::{lock, wait};
use crate::transfer::{
    Completion, Direction, TransferBuffer, TransferError, TransferId, TransferOutcome,
};
use common::BridgeEvent;
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

/// What the pump is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpActivity {
    /// Not started, stopped, or stopped by an error
    Idle,
    /// Started and resubmitting
    Reading,
    /// Started but throttled; at most one read may still complete
    Paused,
}

struct PumpState {
    /// Set by start, cleared by stop and by hard errors
    running: bool,
    /// Consumer backpressure; a running pump does not resubmit while set
    throttled: bool,
    outstanding: Option<TransferId>,
    /// Scratch buffer while no request owns it
    scratch: Option<TransferBuffer>,
}

impl PumpState {
    fn wants_data(&self) -> bool {
        self.running && !self.throttled
    }
}

pub struct InboundPump {
    state: Mutex<PumpState>,
    idle: Condvar,
}

impl InboundPump {
    pub(crate) fn new(scratch: TransferBuffer) -> Self {
        Self {
            state: Mutex::new(PumpState {
                running: false,
                throttled: false,
                outstanding: None,
                scratch: Some(scratch),
            }),
            idle: Condvar::new(),
        }
    }

    pub fn activity(&self) -> PumpActivity {
        let state = lock(&self.state);
        match (state.running, state.throttled) {
            (false, _) => PumpActivity::Idle,
            (true, false) => PumpActivity::Reading,
            (true, true) => PumpActivity::Paused,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        lock(&self.state).outstanding.is_some()
    }

    pub fn is_throttled(&self) -> bool {
        lock(&self.state).throttled
    }

    /// Start reading
    ///
    /// Fails with `AlreadyRunning` while a request is outstanding. If the
    /// first submission fails the pump is left inactive.
    pub fn start(&self, device: &Device) -> Result<()> {
        let mut state = lock(&self.state);
        if state.outstanding.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        device.ensure_attached()?;

        state.running = true;
        state.throttled = false;
        if let Err(e) = self.submit(device, &mut state) {
            state.running = false;
            warn!("Failed to start inbound pump on {}: {}", device.slot(), e);
            return Err(e);
        }

        debug!("Inbound pump started on {}", device.slot());
        Ok(())
    }

    /// Stop resubmitting; an outstanding read is allowed to complete once
    pub fn pause(&self, device: &Device) {
        let mut state = lock(&self.state);
        state.throttled = true;
        trace!(
            "Inbound pump paused on {} (outstanding: {})",
            device.slot(),
            state.outstanding.is_some()
        );
    }

    /// Re-arm submission after a pause
    ///
    /// Submits immediately if nothing is outstanding; otherwise the pending
    /// completion will resubmit.
    pub fn resume(&self, device: &Device) -> Result<()> {
        let mut state = lock(&self.state);
        device.ensure_attached()?;
        state.throttled = false;

        if state.running && state.outstanding.is_none() {
            if let Err(e) = self.submit(device, &mut state) {
                state.running = false;
                warn!("Failed to resume inbound pump on {}: {}", device.slot(), e);
                return Err(e);
            }
        }

        trace!("Inbound pump resumed on {}", device.slot());
        Ok(())
    }

    /// Deactivate, cancel the outstanding read, and wait for its completion
    ///
    /// Request context only: this blocks until the completion handler ran.
    pub fn stop(&self, device: &Device) {
        let mut state = lock(&self.state);
        state.running = false;
        state.throttled = false;

        if let Some(id) = state.outstanding {
            trace!("Cancelling inbound transfer {} on {}", id, device.slot());
            device.backend().cancel(id);
        }
        while state.outstanding.is_some() {
            state = wait(&self.idle, state);
        }

        debug!("Inbound pump stopped on {}", device.slot());
    }

    /// Handle a finished inbound transfer (completion context)
    pub(crate) fn on_completion(&self, device: &Device, completion: Completion) {
        let Completion {
            id,
            buffer,
            outcome,
            ..
        } = completion;

        let mut state = lock(&self.state);
        if state.outstanding != Some(id) {
            warn!(
                "Ignoring stray inbound completion {} on {} (outstanding: {:?})",
                id,
                device.slot(),
                state.outstanding
            );
            return;
        }
        state.outstanding = None;
        device.counters().inbound_finished();

        match outcome {
            TransferOutcome::Completed(length) => {
                let length = length.min(buffer.len());
                if length > 0 {
                    trace!("Inbound {} delivered {} bytes", id, length);
                    device.counters().add_bytes_in(length);
                    device.inbound().deliver(&buffer.as_slice()[..length]);
                }
                state.scratch = Some(buffer);

                if state.wants_data() {
                    match self.submit(device, &mut state) {
                        Ok(()) => {}
                        // Detach began; the chain just ends.
                        Err(BridgeError::NoDevice) => state.running = false,
                        Err(BridgeError::SubmitFailed(e)) => {
                            state.running = false;
                            self.fail(device, TransferError::Resubmit(e));
                        }
                        Err(e) => {
                            state.running = false;
                            error!("Unexpected resubmit failure on {}: {}", device.slot(), e);
                        }
                    }
                }
            }
            TransferOutcome::Cancelled => {
                trace!("Inbound {} cancelled", id);
                state.scratch = Some(buffer);
            }
            TransferOutcome::DeviceGone => {
                debug!("Inbound {} ended, device gone", id);
                state.scratch = Some(buffer);
                state.running = false;
                device.publish(BridgeEvent::DeviceGone {
                    slot: device.slot().0,
                });
            }
            TransferOutcome::Error(e) => {
                state.scratch = Some(buffer);
                state.running = false;
                self.fail(device, e);
            }
        }

        drop(state);
        self.idle.notify_all();
    }

    /// Run `f` with the state lock held, excluding any submission
    pub(crate) fn fenced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = lock(&self.state);
        f()
    }

    /// Free the scratch buffer once nothing can use it again
    pub(crate) fn release_scratch(&self) {
        let mut state = lock(&self.state);
        debug_assert!(state.outstanding.is_none());
        state.scratch = None;
    }

    /// Submit a read into the scratch buffer; caller holds the state lock
    fn submit(&self, device: &Device, state: &mut MutexGuard<'_, PumpState>) -> Result<()> {
        device.ensure_attached()?;
        let buffer = state.scratch.take().ok_or(BridgeError::NoDevice)?;

        let endpoint = device.endpoints().bulk_in.address;
        let request = device.new_request(Direction::In, endpoint, buffer, false);

        match device.backend().submit(request) {
            Ok(id) => {
                state.outstanding = Some(id);
                device.counters().inbound_submitted();
                trace!("Submitted inbound {} on {:#04x}", id, endpoint);
                Ok(())
            }
            Err(failure) => {
                let error = failure.error.clone();
                state.scratch = Some(failure.into_buffer());
                Err(BridgeError::SubmitFailed(error))
            }
        }
    }

    fn fail(&self, device: &Device, error: TransferError) {
        error!("Inbound stream on {} stopped: {}", device.slot(), error);
        device.inbound().fail(error.clone());
        device.publish(BridgeEvent::TransportError {
            slot: device.slot().0,
            message: error.to_string(),
        });
    }
}
