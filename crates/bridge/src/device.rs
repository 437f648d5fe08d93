//! Device record and lifecycle
//!
//! A [`Device`] is created by the registry on attach and lives until detach
//! has drained every in-flight transfer. It owns the inbound pump, the
//! outbound writer, the inbound byte queue, and the completion worker that
//! runs their handlers.

use crate::endpoint::BulkEndpoints;
use crate::error::{BridgeError, Result};
use crate::port::InboundQueue;
use crate::pump::{InboundPump, PumpActivity};
use crate::stats::{TransferCounters, TransferStats};
use crate::sync::lock;
use crate::transfer::{
    Completion, CompletionSender, Direction, TransferBackend, TransferBuffer, TransferId,
    TransferRequest,
};
use crate::worker::CompletionWorker;
use crate::writer::OutboundWriter;
use common::{BridgeEvent, EventSender};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Externally visible slot a device is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u8);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Vendor/product pair a device is matched by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Observable device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Nothing attached
    Detached,
    /// Attached, inbound stream idle
    Attached,
    /// Inbound stream reading
    Active,
    /// Inbound stream throttled by the consumer
    Paused,
    /// Teardown in progress; no new transfers are accepted
    Detaching,
    /// Teardown finished
    Destroyed,
}

const LIFECYCLE_ATTACHED: u8 = 0;
const LIFECYCLE_DETACHING: u8 = 1;
const LIFECYCLE_DESTROYED: u8 = 2;

/// An attached device and everything that drives it
pub struct Device {
    slot: SlotId,
    identity: DeviceIdentity,
    endpoints: BulkEndpoints,
    backend: Arc<dyn TransferBackend>,
    lifecycle: AtomicU8,
    next_transfer_id: AtomicU64,
    counters: Arc<TransferCounters>,
    completions: CompletionSender,
    events: EventSender,
    inbound: InboundQueue,
    pump: InboundPump,
    writer: OutboundWriter,
    worker: Mutex<Option<CompletionWorker>>,
}

impl Device {
    /// Build the device record and start its completion worker
    ///
    /// The inbound scratch buffer is allocated here, sized to the IN
    /// endpoint's max packet size.
    pub(crate) fn create(
        slot: SlotId,
        identity: DeviceIdentity,
        endpoints: BulkEndpoints,
        backend: Arc<dyn TransferBackend>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        let counters = Arc::new(TransferCounters::default());
        let scratch = TransferBuffer::zeroed(
            endpoints.bulk_in.max_packet_size as usize,
            counters.clone(),
        );
        let (tx, rx) = async_channel::unbounded();

        let device = Arc::new(Self {
            slot,
            identity,
            endpoints,
            backend,
            lifecycle: AtomicU8::new(LIFECYCLE_ATTACHED),
            next_transfer_id: AtomicU64::new(1),
            counters,
            completions: CompletionSender::new(tx.clone()),
            events,
            inbound: InboundQueue::new(),
            pump: InboundPump::new(scratch),
            writer: OutboundWriter::new(),
            worker: Mutex::new(None),
        });

        let worker = CompletionWorker::spawn(device.clone(), tx, rx)?;
        *lock(&device.worker) = Some(worker);

        debug!(
            "Created device {} in {}: in={:#04x}/{} out={:#04x}/{}",
            identity,
            slot,
            endpoints.bulk_in.address,
            endpoints.bulk_in.max_packet_size,
            endpoints.bulk_out.address,
            endpoints.bulk_out.max_packet_size
        );
        Ok(device)
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn endpoints(&self) -> &BulkEndpoints {
        &self.endpoints
    }

    pub fn state(&self) -> DeviceState {
        match self.lifecycle.load(Ordering::SeqCst) {
            LIFECYCLE_ATTACHED => match self.pump.activity() {
                PumpActivity::Idle => DeviceState::Attached,
                PumpActivity::Reading => DeviceState::Active,
                PumpActivity::Paused => DeviceState::Paused,
            },
            LIFECYCLE_DETACHING => DeviceState::Detaching,
            _ => DeviceState::Destroyed,
        }
    }

    /// True until detach begins
    pub fn is_attached(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_ATTACHED
    }

    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(BridgeError::NoDevice)
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.counters.snapshot()
    }

    pub fn pump(&self) -> &InboundPump {
        &self.pump
    }

    pub fn writer(&self) -> &OutboundWriter {
        &self.writer
    }

    pub(crate) fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub(crate) fn backend(&self) -> &dyn TransferBackend {
        self.backend.as_ref()
    }

    pub(crate) fn counters(&self) -> &Arc<TransferCounters> {
        &self.counters
    }

    pub(crate) fn publish(&self, event: BridgeEvent) {
        self.events.publish(event);
    }

    /// Build a request with a fresh id that completes onto this device
    pub(crate) fn new_request(
        &self,
        direction: Direction,
        endpoint: u8,
        buffer: TransferBuffer,
        zero_packet: bool,
    ) -> TransferRequest {
        let id = TransferId(self.next_transfer_id.fetch_add(1, Ordering::Relaxed));
        TransferRequest::new(
            id,
            endpoint,
            direction,
            buffer,
            zero_packet,
            self.completions.clone(),
        )
    }

    /// Route a completion to its handler (completion context)
    pub(crate) fn dispatch(&self, completion: Completion) {
        match completion.direction {
            Direction::In => self.pump.on_completion(self, completion),
            Direction::Out => self.writer.on_completion(self, completion),
        }
    }

    /// Tear the device down (request context, blocking)
    ///
    /// Returns `false` if another caller already started the teardown.
    pub(crate) fn detach(&self) -> bool {
        // Flip to Detaching while both submission paths are fenced so no
        // request can slip in after the state change.
        let started = self.writer.fenced(|| {
            self.pump.fenced(|| {
                self.lifecycle
                    .compare_exchange(
                        LIFECYCLE_ATTACHED,
                        LIFECYCLE_DETACHING,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            })
        });
        if !started {
            return false;
        }

        debug!("Detaching device {} in {}", self.identity, self.slot);

        self.pump.stop(self);
        self.writer.cancel_pending(self);
        self.pump.release_scratch();
        self.inbound.close();
        self.backend.shutdown();

        if let Some(worker) = lock(&self.worker).take() {
            worker.shutdown();
        }

        self.lifecycle.store(LIFECYCLE_DESTROYED, Ordering::SeqCst);
        info!("Device {} in {} destroyed", self.identity, self.slot);
        true
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("slot", &self.slot)
            .field("identity", &self.identity)
            .field("endpoints", &self.endpoints)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let identity = DeviceIdentity::new(0x0525, 0xa4a7);
        assert_eq!(identity.to_string(), "0525:a4a7");
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(SlotId(3).to_string(), "slot 3");
    }
}
