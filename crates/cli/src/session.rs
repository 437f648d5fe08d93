//! Bridge session shared by the commands
//!
//! Owns the registry, the event receiver and the hot-plug manager thread for
//! the lifetime of one command.

use crate::config::BridgeConfig;
use crate::lines::LineBuffer;
use anyhow::{Context, Result, anyhow};
use bridge::usb::{DeviceManagerHandle, spawn_device_manager};
use bridge::{BridgeError, DeviceIdentity, DeviceRegistry, StreamPort};
use common::{EventReceiver, create_event_channel};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Read slice used while waiting for a reply
const REPLY_POLL: Duration = Duration::from_millis(50);

pub struct Session {
    pub registry: Arc<DeviceRegistry>,
    pub events: EventReceiver,
    pub identity: DeviceIdentity,
    manager: Option<DeviceManagerHandle>,
}

impl Session {
    /// Create the registry and start watching for the configured device
    pub fn start(config: &BridgeConfig) -> Result<Self> {
        let identity = config.device.identity()?;
        let (tx, events) = create_event_channel();
        let registry = Arc::new(DeviceRegistry::with_port_prefix(
            config.port.slots,
            config.port.name.clone(),
            tx,
        ));

        let manager = spawn_device_manager(identity, registry.clone())
            .context("Failed to spawn device manager thread")?;

        info!("Watching for USB device {}", identity);
        Ok(Self {
            registry,
            events,
            identity,
            manager: Some(manager),
        })
    }

    /// Port of the lowest occupied slot, if any
    pub fn current_port(&self) -> Option<Arc<StreamPort>> {
        let slot = self.registry.slots().into_iter().next()?;
        self.registry.port(slot).ok()
    }

    /// Wait for a device to attach
    pub async fn wait_for_port(&self, timeout: Duration) -> Result<Arc<StreamPort>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(port) = self.current_port() {
                return Ok(port);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!(
                    "No {} device attached within {:?}",
                    self.identity,
                    timeout
                ));
            }

            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Ok(event)) => debug!("Bridge event while waiting: {:?}", event),
                Ok(Err(e)) => return Err(e).context("Event channel closed"),
                Err(_) => {}
            }
        }
    }

    /// Ask the manager to re-enumerate connected devices
    pub fn rescan(&self) {
        if let Some(manager) = &self.manager {
            manager.rescan();
        }
    }

    /// Stop the manager thread and detach everything
    pub fn shutdown(mut self) {
        if let Some(manager) = self.manager.take()
            && let Err(e) = manager.shutdown()
        {
            error!("Device manager stopped with error: {}", e);
        }
        self.registry.detach_all();
    }
}

/// Read lines until one equals `expected` or `timeout` passes (blocking)
///
/// Returns every line received, the expected one last.
pub fn wait_for_reply(port: &StreamPort, expected: &str, timeout: Duration) -> Result<Vec<String>> {
    let deadline = Instant::now() + timeout;
    let mut lines = LineBuffer::default();
    let mut received = Vec::new();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        let n = match port.read_timeout(&mut buf, REPLY_POLL) {
            Ok(n) => n,
            Err(BridgeError::NoDevice) => return Err(anyhow!("Device detached while waiting for reply")),
            Err(e) => return Err(e).context("Failed to read reply"),
        };

        for line in lines.push(&buf[..n]) {
            let done = line == expected;
            received.push(line);
            if done {
                return Ok(received);
            }
        }
    }

    Err(anyhow!(
        "No '{}' reply within {} ms",
        expected,
        timeout.as_millis()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::testing::MockBackend;
    use bridge::{EndpointDescriptor, SlotId};

    fn attach(backend: Arc<MockBackend>) -> (DeviceRegistry, Arc<StreamPort>) {
        let (tx, _rx) = create_event_channel();
        let registry = DeviceRegistry::new(1, tx);
        let port = registry
            .attach(
                SlotId(0),
                DeviceIdentity::new(0x0525, 0xa4a7),
                &[
                    EndpointDescriptor::bulk_in(1, 64),
                    EndpointDescriptor::bulk_out(2, 64),
                ],
                backend,
            )
            .unwrap();
        (registry, port)
    }

    #[test]
    fn test_wait_for_reply_collects_until_expected() {
        let backend = MockBackend::new();
        let (_registry, port) = attach(backend.clone());
        port.open().unwrap();

        let peer = backend.clone();
        let handle = std::thread::spawn(move || {
            peer.peer_send_all(b"busy\nDo", Duration::from_secs(5));
            peer.peer_send_all(b"ne\n", Duration::from_secs(5));
        });

        let lines = wait_for_reply(&port, "Done", Duration::from_secs(5)).unwrap();
        assert_eq!(lines, vec!["busy", "Done"]);
        handle.join().unwrap();
        port.close();
    }

    #[test]
    fn test_wait_for_reply_times_out() {
        let (_registry, port) = attach(MockBackend::new());
        port.open().unwrap();

        let err = wait_for_reply(&port, "Done", Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("No 'Done' reply"));
        port.close();
    }
}
