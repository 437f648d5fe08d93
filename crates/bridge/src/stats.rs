//! Transfer instrumentation
//!
//! Lock-free counters updated from both request and completion context.
//! The snapshot is what leak and single-flight checks look at.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one device
#[derive(Debug, Default)]
pub struct TransferCounters {
    buffers_live: AtomicUsize,
    inbound_outstanding: AtomicUsize,
    inbound_outstanding_peak: AtomicUsize,
    writes_in_flight: AtomicUsize,
    transfers_in: AtomicU64,
    transfers_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TransferCounters {
    pub(crate) fn buffer_allocated(&self) {
        self.buffers_live.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn buffer_released(&self) {
        self.buffers_live.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn inbound_submitted(&self) {
        let now = self.inbound_outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.inbound_outstanding_peak
            .fetch_max(now, Ordering::SeqCst);
        self.transfers_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inbound_finished(&self) {
        self.inbound_outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn write_submitted(&self) {
        self.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        self.transfers_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_finished(&self) {
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            buffers_live: self.buffers_live.load(Ordering::SeqCst),
            inbound_outstanding: self.inbound_outstanding.load(Ordering::SeqCst),
            inbound_outstanding_peak: self.inbound_outstanding_peak.load(Ordering::SeqCst),
            writes_in_flight: self.writes_in_flight.load(Ordering::SeqCst),
            transfers_in: self.transfers_in.load(Ordering::Relaxed),
            transfers_out: self.transfers_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`TransferCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Transfer buffers currently allocated (scratch buffer included)
    pub buffers_live: usize,
    /// Inbound requests currently outstanding
    pub inbound_outstanding: usize,
    /// Highest value `inbound_outstanding` ever reached
    pub inbound_outstanding_peak: usize,
    /// Outbound requests submitted but not yet completed
    pub writes_in_flight: usize,
    /// Inbound requests submitted
    pub transfers_in: u64,
    /// Outbound requests submitted
    pub transfers_out: u64,
    /// Bytes delivered to the port
    pub bytes_in: u64,
    /// Bytes the device acknowledged
    pub bytes_out: u64,
}

impl TransferStats {
    /// No buffers allocated and nothing in flight
    pub fn is_quiescent(&self) -> bool {
        self.buffers_live == 0 && self.inbound_outstanding == 0 && self.writes_in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_maximum() {
        let counters = TransferCounters::default();

        counters.inbound_submitted();
        counters.inbound_finished();
        counters.inbound_submitted();

        let stats = counters.snapshot();
        assert_eq!(stats.inbound_outstanding, 1);
        assert_eq!(stats.inbound_outstanding_peak, 1);
        assert_eq!(stats.transfers_in, 2);
    }

    #[test]
    fn test_quiescent() {
        let counters = TransferCounters::default();
        assert!(counters.snapshot().is_quiescent());

        counters.write_submitted();
        assert!(!counters.snapshot().is_quiescent());

        counters.write_finished();
        counters.add_bytes_out(8);
        let stats = counters.snapshot();
        assert!(stats.is_quiescent());
        assert_eq!(stats.bytes_out, 8);
        assert_eq!(stats.transfers_out, 1);
    }
}
