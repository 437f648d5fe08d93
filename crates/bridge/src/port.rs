//! Consumer-facing stream port
//!
//! A [`StreamPort`] is registered with its device on attach and lives until
//! detach. Opening it starts the inbound pump, closing the last handle stops
//! it. Inbound bytes are pushed into an ordered queue that `read` drains;
//! writes go straight to the device's outbound writer.

use crate::device::{Device, DeviceState, SlotId};
use crate::error::{BridgeError, Result};
use crate::stats::TransferStats;
use crate::sync::{lock, wait_timeout};
use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Baud classes accepted by [`LineSettings::has_standard_baud`]
pub const STANDARD_BAUD_RATES: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Terminal line configuration
///
/// Stored and handed back unchanged; bulk endpoints have no line
/// discipline, so none of these settings affect the byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub echo: bool,
    pub break_interrupt: bool,
    pub bell_on_full: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            echo: false,
            break_interrupt: false,
            bell_on_full: false,
        }
    }
}

impl LineSettings {
    pub fn has_standard_baud(&self) -> bool {
        STANDARD_BAUD_RATES.contains(&self.baud_rate)
    }

    pub fn has_valid_data_bits(&self) -> bool {
        (5..=8).contains(&self.data_bits)
    }
}

#[derive(Default)]
struct QueueState {
    bytes: VecDeque<u8>,
    /// Hard error that stopped the pump, reported once to a reader
    fault: Option<TransferError>,
    closed: bool,
}

impl QueueState {
    fn readable(&self) -> bool {
        !self.bytes.is_empty() || self.fault.is_some() || self.closed
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(BridgeError::NoDevice);
        }
        if self.bytes.is_empty() {
            return match self.fault.take() {
                Some(e) => Err(BridgeError::TransportError(e)),
                None => Ok(0),
            };
        }

        let n = buf.len().min(self.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(self.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Ordered inbound byte queue fed by the pump
pub(crate) struct InboundQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl InboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    /// Append delivered bytes (completion context)
    pub(crate) fn deliver(&self, bytes: &[u8]) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.bytes.extend(bytes);
        drop(state);
        self.ready.notify_all();
    }

    pub(crate) fn fail(&self, error: TransferError) {
        lock(&self.state).fault = Some(error);
        self.ready.notify_all();
    }

    pub(crate) fn clear_fault(&self) {
        lock(&self.state).fault = None;
    }

    /// Drop queued bytes and make every later read fail with `NoDevice`
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.bytes.clear();
        state.fault = None;
        drop(state);
        self.ready.notify_all();
    }

    pub(crate) fn drain(&self, buf: &mut [u8]) -> Result<usize> {
        lock(&self.state).take(buf)
    }

    /// Wait up to `timeout` for something to read, then drain
    pub(crate) fn wait_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);

        while !state.readable() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            let (guard, timed_out) = wait_timeout(&self.ready, state, remaining);
            state = guard;
            if timed_out && !state.readable() {
                return Ok(0);
            }
        }

        state.take(buf)
    }

    pub(crate) fn available(&self) -> usize {
        lock(&self.state).bytes.len()
    }
}

/// Byte-stream handle over one attached device
pub struct StreamPort {
    device: Arc<Device>,
    name: String,
    open_count: Mutex<u32>,
    line: Mutex<LineSettings>,
}

impl StreamPort {
    pub(crate) fn new(device: Arc<Device>, name: String) -> Self {
        Self {
            device,
            name,
            open_count: Mutex::new(0),
            line: Mutex::new(LineSettings::default()),
        }
    }

    /// Port name, e.g. `ttyMYUSB0`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> SlotId {
        self.device.slot()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn stats(&self) -> TransferStats {
        self.device.stats()
    }

    pub fn open_count(&self) -> u32 {
        *lock(&self.open_count)
    }

    /// Open a handle; the first one starts the inbound pump
    pub fn open(&self) -> Result<()> {
        let mut count = lock(&self.open_count);
        self.device.ensure_attached()?;

        if *count == 0 {
            self.device.inbound().clear_fault();
            self.device.pump().start(&self.device)?;
        }
        *count += 1;

        debug!("Opened {} (open count {})", self.name, *count);
        Ok(())
    }

    /// Close a handle; the last one stops the inbound pump
    pub fn close(&self) {
        let mut count = lock(&self.open_count);
        if *count == 0 {
            warn!("Close on {} which is not open", self.name);
            return;
        }

        *count -= 1;
        if *count == 0 {
            self.device.pump().stop(&self.device);
        }
        debug!("Closed {} (open count {})", self.name, *count);
    }

    /// Drain queued inbound bytes without blocking
    ///
    /// Returns `Ok(0)` when nothing is queued. A hard inbound error is
    /// reported once, after the bytes delivered before it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.device.inbound().drain(buf)
    }

    /// Like [`read`](Self::read) but waits up to `timeout` for data
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.device.inbound().wait_timeout(buf, timeout)?;
        if n > 0 {
            trace!("Read {} bytes from {}", n, self.name);
        }
        Ok(n)
    }

    /// Queued inbound byte count
    pub fn available(&self) -> usize {
        self.device.inbound().available()
    }

    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.device.writer().write(&self.device, bytes)
    }

    pub fn write_room(&self) -> usize {
        self.device.writer().capacity_hint(&self.device)
    }

    /// Discard every write still in flight
    pub fn flush(&self) {
        self.device.writer().cancel_pending(&self.device);
    }

    pub fn throttle(&self) {
        self.device.pump().pause(&self.device);
    }

    pub fn unthrottle(&self) -> Result<()> {
        self.device.pump().resume(&self.device)
    }

    pub fn is_throttled(&self) -> bool {
        self.device.pump().is_throttled()
    }

    pub fn line_settings(&self) -> LineSettings {
        lock(&self.line).clone()
    }

    pub fn set_line_settings(&self, settings: LineSettings) {
        debug!("Line settings for {}: {:?}", self.name, settings);
        *lock(&self.line) = settings;
    }
}

impl std::fmt::Debug for StreamPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPort")
            .field("name", &self.name)
            .field("slot", &self.device.slot())
            .field("open_count", &self.open_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order_across_deliveries() {
        let queue = InboundQueue::new();
        queue.deliver(b"Do");
        queue.deliver(b"ne\n");
        assert_eq!(queue.available(), 5);

        let mut buf = [0u8; 3];
        assert_eq!(queue.drain(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"Don");

        let mut buf = [0u8; 16];
        let n = queue.drain(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"e\n");
        assert_eq!(queue.drain(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_fault_reported_once_after_data() {
        let queue = InboundQueue::new();
        queue.deliver(b"ok");
        queue.fail(TransferError::Pipe);

        let mut buf = [0u8; 8];
        assert_eq!(queue.drain(&mut buf).unwrap(), 2);
        assert_eq!(
            queue.drain(&mut buf),
            Err(BridgeError::TransportError(TransferError::Pipe))
        );
        assert_eq!(queue.drain(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_closed_queue_reports_no_device() {
        let queue = InboundQueue::new();
        queue.deliver(b"stale");
        queue.close();
        queue.deliver(b"late");

        let mut buf = [0u8; 8];
        assert_eq!(queue.available(), 0);
        assert_eq!(queue.drain(&mut buf), Err(BridgeError::NoDevice));
    }

    #[test]
    fn test_wait_timeout_returns_zero_when_idle() {
        let queue = InboundQueue::new();
        let mut buf = [0u8; 8];

        let start = Instant::now();
        assert_eq!(
            queue.wait_timeout(&mut buf, Duration::from_millis(20)).unwrap(),
            0
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_wakes_on_delivery() {
        let queue = Arc::new(InboundQueue::new());
        let producer = queue.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.deliver(b"Done\n");
        });

        let mut buf = [0u8; 8];
        let n = queue.wait_timeout(&mut buf, Duration::from_secs(5)).unwrap();
        assert_eq!(&buf[..n], b"Done\n");
        handle.join().unwrap();
    }

    #[test]
    fn test_line_settings_defaults() {
        let settings = LineSettings::default();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, 8);
        assert!(!settings.echo);
        assert!(!settings.break_interrupt);
        assert!(!settings.bell_on_full);
        assert!(settings.has_standard_baud());
        assert!(settings.has_valid_data_bits());
    }

    #[test]
    fn test_line_settings_partial_toml() {
        let settings: LineSettings = toml::from_str("baud_rate = 115200\necho = true").unwrap();
        assert_eq!(settings.baud_rate, 115200);
        assert!(settings.echo);
        assert_eq!(settings.data_bits, 8);
    }

    #[test]
    fn test_line_settings_checks() {
        let settings = LineSettings {
            baud_rate: 12345,
            data_bits: 9,
            ..Default::default()
        };
        assert!(!settings.has_standard_baud());
        assert!(!settings.has_valid_data_bits());
    }
}
