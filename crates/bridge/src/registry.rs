//! Device registry
//!
//! Maps slots to attached devices and their ports. Attach validates the
//! endpoint layout before anything is published; detach drains the device
//! outside the registry lock so lookups on other slots keep working while a
//! teardown waits for in-flight transfers.

use crate::device::{Device, DeviceIdentity, DeviceState, SlotId};
use crate::endpoint::{EndpointDescriptor, discover_bulk_endpoints};
use crate::error::{BridgeError, Result};
use crate::port::StreamPort;
use crate::sync::lock;
use crate::transfer::TransferBackend;
use common::{BridgeEvent, EventSender};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default prefix for port names
pub const DEFAULT_PORT_PREFIX: &str = "ttyMYUSB";

pub struct DeviceRegistry {
    slots: Mutex<BTreeMap<SlotId, Arc<StreamPort>>>,
    capacity: u8,
    port_prefix: String,
    events: EventSender,
}

impl DeviceRegistry {
    /// Create a registry with `capacity` slots (at least one)
    pub fn new(capacity: u8, events: EventSender) -> Self {
        Self::with_port_prefix(capacity, DEFAULT_PORT_PREFIX, events)
    }

    pub fn with_port_prefix(capacity: u8, prefix: impl Into<String>, events: EventSender) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            port_prefix: prefix.into(),
            events,
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Attach a device in `slot`
    ///
    /// `endpoints` are the descriptors of the interface to bridge; exactly
    /// one bulk IN and one bulk OUT endpoint must be among them.
    pub fn attach(
        &self,
        slot: SlotId,
        identity: DeviceIdentity,
        endpoints: &[EndpointDescriptor],
        backend: Arc<dyn TransferBackend>,
    ) -> Result<Arc<StreamPort>> {
        if slot.0 >= self.capacity {
            return Err(BridgeError::SlotOutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        let bulk = discover_bulk_endpoints(endpoints)?;

        let mut slots = lock(&self.slots);
        if slots.contains_key(&slot) {
            return Err(BridgeError::SlotOccupied(slot));
        }

        let device = Device::create(slot, identity, bulk, backend, self.events.clone())?;
        let port = Arc::new(StreamPort::new(
            device,
            format!("{}{}", self.port_prefix, slot.0),
        ));
        slots.insert(slot, port.clone());
        drop(slots);

        info!("Attached {} in {} as {}", identity, slot, port.name());
        self.events.publish(BridgeEvent::Attached {
            slot: slot.0,
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
        });
        Ok(port)
    }

    /// Attach in the lowest free slot
    pub fn attach_next(
        &self,
        identity: DeviceIdentity,
        endpoints: &[EndpointDescriptor],
        backend: Arc<dyn TransferBackend>,
    ) -> Result<Arc<StreamPort>> {
        let slot = self
            .free_slot()
            .ok_or(BridgeError::NoFreeSlot(self.capacity))?;
        self.attach(slot, identity, endpoints, backend)
    }

    /// Detach the device in `slot`, blocking until its transfers drained
    ///
    /// Returns `false` if the slot was empty or another caller is already
    /// detaching it.
    pub fn detach(&self, slot: SlotId) -> bool {
        let Some(port) = lock(&self.slots).get(&slot).cloned() else {
            debug!("Detach of empty {}", slot);
            return false;
        };

        if !port.device().detach() {
            debug!("{} is already being detached", slot);
            return false;
        }

        let mut slots = lock(&self.slots);
        if slots
            .get(&slot)
            .is_some_and(|current| Arc::ptr_eq(current, &port))
        {
            slots.remove(&slot);
        }
        drop(slots);

        if port.open_count() > 0 {
            warn!("{} detached with {} open handles", port.name(), port.open_count());
        }
        self.events.publish(BridgeEvent::Detached { slot: slot.0 });
        true
    }

    /// Detach every attached device
    pub fn detach_all(&self) {
        for slot in self.slots() {
            self.detach(slot);
        }
    }

    pub fn lookup(&self, slot: SlotId) -> Result<Arc<Device>> {
        lock(&self.slots)
            .get(&slot)
            .map(|port| port.device().clone())
            .ok_or(BridgeError::NotFound(slot))
    }

    pub fn port(&self, slot: SlotId) -> Result<Arc<StreamPort>> {
        lock(&self.slots)
            .get(&slot)
            .cloned()
            .ok_or(BridgeError::NoDevice)
    }

    /// Lowest unoccupied slot, if any
    pub fn free_slot(&self) -> Option<SlotId> {
        let slots = lock(&self.slots);
        (0..self.capacity)
            .map(SlotId)
            .find(|slot| !slots.contains_key(slot))
    }

    /// Occupied slots in ascending order
    pub fn slots(&self) -> Vec<SlotId> {
        lock(&self.slots).keys().copied().collect()
    }

    /// Find the slot holding a device with `identity`
    pub fn find(&self, identity: DeviceIdentity) -> Option<SlotId> {
        lock(&self.slots)
            .iter()
            .find(|(_, port)| port.device().identity() == identity)
            .map(|(slot, _)| *slot)
    }

    pub fn state(&self, slot: SlotId) -> DeviceState {
        lock(&self.slots)
            .get(&slot)
            .map(|port| port.state())
            .unwrap_or(DeviceState::Detached)
    }
}

impl Drop for DeviceRegistry {
    // Each completion worker holds its device; without an explicit detach
    // the threads would outlive the registry.
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use common::create_event_channel;

    fn bulk_pair() -> Vec<EndpointDescriptor> {
        vec![
            EndpointDescriptor::bulk_in(1, 64),
            EndpointDescriptor::bulk_out(2, 64),
        ]
    }

    const GADGET: DeviceIdentity = DeviceIdentity::new(0x0525, 0xa4a7);

    #[test]
    fn test_attach_publishes_port_and_event() {
        let (tx, rx) = create_event_channel();
        let registry = DeviceRegistry::new(2, tx);

        let port = registry
            .attach(SlotId(0), GADGET, &bulk_pair(), MockBackend::new())
            .unwrap();

        assert_eq!(port.name(), "ttyMYUSB0");
        assert_eq!(registry.state(SlotId(0)), DeviceState::Attached);
        assert_eq!(registry.slots(), vec![SlotId(0)]);
        assert_eq!(
            rx.try_recv(),
            Some(BridgeEvent::Attached {
                slot: 0,
                vendor_id: 0x0525,
                product_id: 0xa4a7
            })
        );
    }

    #[test]
    fn test_attach_occupied_slot_fails() {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);

        registry
            .attach(SlotId(0), GADGET, &bulk_pair(), MockBackend::new())
            .unwrap();
        let err = registry
            .attach(SlotId(0), GADGET, &bulk_pair(), MockBackend::new())
            .unwrap_err();
        assert_eq!(err, BridgeError::SlotOccupied(SlotId(0)));
    }

    #[test]
    fn test_attach_without_bulk_pair_publishes_nothing() {
        let (tx, rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);

        let err = registry
            .attach(
                SlotId(0),
                GADGET,
                &[EndpointDescriptor::bulk_in(1, 64)],
                MockBackend::new(),
            )
            .unwrap_err();

        assert!(matches!(err, BridgeError::NoBulkEndpoints { .. }));
        assert!(registry.slots().is_empty());
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_attach_out_of_range() {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);

        let err = registry
            .attach(SlotId(3), GADGET, &bulk_pair(), MockBackend::new())
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::SlotOutOfRange {
                slot: SlotId(3),
                capacity: 1
            }
        );
    }

    #[test]
    fn test_attach_next_fills_lowest_slot() {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(2, tx);

        registry
            .attach(SlotId(1), GADGET, &bulk_pair(), MockBackend::new())
            .unwrap();
        let port = registry
            .attach_next(GADGET, &bulk_pair(), MockBackend::new())
            .unwrap();
        assert_eq!(port.slot(), SlotId(0));

        let err = registry
            .attach_next(GADGET, &bulk_pair(), MockBackend::new())
            .unwrap_err();
        assert_eq!(err, BridgeError::NoFreeSlot(2));
        assert_eq!(registry.free_slot(), None);
    }

    #[test]
    fn test_lookup_errors() {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);

        assert_eq!(
            registry.lookup(SlotId(0)).unwrap_err(),
            BridgeError::NotFound(SlotId(0))
        );
        assert_eq!(registry.port(SlotId(0)).unwrap_err(), BridgeError::NoDevice);
        assert_eq!(registry.state(SlotId(0)), DeviceState::Detached);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let (tx, rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);
        let backend = MockBackend::new();

        let port = registry
            .attach(SlotId(0), GADGET, &bulk_pair(), backend.clone())
            .unwrap();
        let _ = rx.try_recv();

        assert!(registry.detach(SlotId(0)));
        assert!(!registry.detach(SlotId(0)));
        assert!(!registry.detach(SlotId(5)));

        assert_eq!(rx.try_recv(), Some(BridgeEvent::Detached { slot: 0 }));
        assert_eq!(rx.try_recv(), None);
        assert_eq!(port.state(), DeviceState::Destroyed);
        assert!(backend.is_shut_down());
        assert!(port.stats().is_quiescent());
    }

    #[test]
    fn test_find_by_identity() {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(2, tx);
        let other = DeviceIdentity::new(0x1234, 0x5678);

        registry
            .attach(SlotId(1), other, &bulk_pair(), MockBackend::new())
            .unwrap();
        assert_eq!(registry.find(other), Some(SlotId(1)));
        assert_eq!(registry.find(GADGET), None);
    }
}
