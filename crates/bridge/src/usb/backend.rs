//! `rusb`-backed transfer backend

use crate::endpoint::BulkEndpoints;
use crate::error::{BridgeError, Result};
use crate::sync::lock;
use crate::transfer::{
    Direction, SubmitError, SubmitFailure, TransferBackend, TransferError, TransferId,
    TransferOutcome, TransferRequest,
};
use async_channel::{Receiver, Sender};
use rusb::{Context, DeviceHandle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Length of one blocking read; cancellation is noticed between slices
const READ_SLICE: Duration = Duration::from_millis(100);

/// Upper bound for a single OUT transfer
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a libusb error onto a transfer outcome
///
/// `NoDevice` means the device was unplugged and is a teardown, not a
/// failure.
pub fn map_rusb_error(err: rusb::Error) -> TransferOutcome {
    let error = match err {
        rusb::Error::NoDevice => return TransferOutcome::DeviceGone,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Pipe,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Io => TransferError::Io,
        rusb::Error::Busy => TransferError::Busy,
        _ => TransferError::Other(err.to_string()),
    };
    TransferOutcome::Error(error)
}

#[derive(Default)]
struct TransferTable {
    active: HashSet<TransferId>,
    cancelled: HashSet<TransferId>,
}

/// State shared with the endpoint threads
struct Shared {
    handle: Arc<DeviceHandle<Context>>,
    table: Mutex<TransferTable>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn is_cancelled(&self, id: TransferId) -> bool {
        self.shutting_down.load(Ordering::SeqCst) || lock(&self.table).cancelled.contains(&id)
    }

    fn finish(&self, request: TransferRequest, outcome: TransferOutcome) {
        let id = request.id();
        {
            let mut table = lock(&self.table);
            table.active.remove(&id);
            table.cancelled.remove(&id);
        }
        trace!("Transfer {} finished: {:?}", id, outcome);
        request.complete(outcome);
    }
}

struct EndpointQueue {
    address: u8,
    tx: Sender<TransferRequest>,
}

/// Transfer backend over a claimed bulk interface
pub struct RusbBackend {
    shared: Arc<Shared>,
    interface: u8,
    reattach_kernel_driver: bool,
    queues: Vec<EndpointQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
}

impl RusbBackend {
    /// Start endpoint threads for an already claimed interface
    ///
    /// `reattach_kernel_driver` is set when a kernel driver was detached
    /// before claiming; shutdown then hands the interface back to it.
    pub fn new(
        handle: DeviceHandle<Context>,
        interface: u8,
        endpoints: BulkEndpoints,
        reattach_kernel_driver: bool,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            handle: Arc::new(handle),
            table: Mutex::new(TransferTable::default()),
            shutting_down: AtomicBool::new(false),
        });

        let mut backend = Self {
            shared,
            interface,
            reattach_kernel_driver,
            queues: Vec::with_capacity(2),
            threads: Mutex::new(Vec::with_capacity(2)),
            released: AtomicBool::new(false),
        };

        for (address, direction) in [
            (endpoints.bulk_in.address, Direction::In),
            (endpoints.bulk_out.address, Direction::Out),
        ] {
            let (tx, rx) = async_channel::unbounded();
            let shared = backend.shared.clone();
            let name = match direction {
                Direction::In => format!("usb-in-{:02x}", address),
                Direction::Out => format!("usb-out-{:02x}", address),
            };

            let thread = std::thread::Builder::new()
                .name(name)
                .spawn(move || run_endpoint(shared, address, direction, rx))
                .map_err(|e| BridgeError::WorkerSpawn(e.to_string()))?;

            backend.queues.push(EndpointQueue { address, tx });
            lock(&backend.threads).push(thread);
        }

        debug!("USB backend started on interface {}", interface);
        Ok(backend)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.shutting_down.store(true, Ordering::SeqCst);
        for queue in &self.queues {
            queue.tx.close();
        }
        for thread in lock(&self.threads).drain(..) {
            if thread.join().is_err() {
                warn!("USB endpoint thread panicked");
            }
        }

        let handle = &self.shared.handle;
        if let Err(e) = handle.release_interface(self.interface) {
            debug!("Could not release interface {}: {}", self.interface, e);
        }
        if self.reattach_kernel_driver {
            match handle.attach_kernel_driver(self.interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", self.interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                ),
            }
        }

        debug!("USB backend on interface {} released", self.interface);
    }
}

impl TransferBackend for RusbBackend {
    fn submit(&self, request: TransferRequest) -> std::result::Result<TransferId, SubmitFailure> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(SubmitFailure::new(SubmitError::Closed, request));
        }
        let Some(queue) = self.queues.iter().find(|q| q.address == request.endpoint()) else {
            warn!("No queue for endpoint {:#04x}", request.endpoint());
            return Err(SubmitFailure::new(SubmitError::NoResources, request));
        };

        let id = request.id();
        lock(&self.shared.table).active.insert(id);

        if let Err(e) = queue.tx.try_send(request) {
            lock(&self.shared.table).active.remove(&id);
            return Err(SubmitFailure::new(SubmitError::Closed, e.into_inner()));
        }
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        let mut table = lock(&self.shared.table);
        if table.active.contains(&id) {
            table.cancelled.insert(id);
        }
    }

    fn shutdown(&self) {
        self.release();
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_endpoint(
    shared: Arc<Shared>,
    address: u8,
    direction: Direction,
    rx: Receiver<TransferRequest>,
) {
    debug!("Endpoint {:#04x} thread started", address);

    while let Ok(mut request) = rx.recv_blocking() {
        let id = request.id();
        if shared.is_cancelled(id) {
            shared.finish(request, TransferOutcome::Cancelled);
            continue;
        }

        let outcome = match direction {
            Direction::In => read(&shared, address, id, request.buffer_mut().as_mut_slice()),
            Direction::Out => write(
                &shared,
                address,
                request.buffer().as_slice(),
                request.zero_packet(),
            ),
        };
        shared.finish(request, outcome);
    }

    debug!("Endpoint {:#04x} thread stopped", address);
}

fn read(shared: &Shared, address: u8, id: TransferId, buf: &mut [u8]) -> TransferOutcome {
    loop {
        match shared.handle.read_bulk(address, buf, READ_SLICE) {
            Ok(n) => return TransferOutcome::Completed(n),
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => {
                if shared.is_cancelled(id) {
                    return TransferOutcome::Cancelled;
                }
            }
            Err(e) => return map_rusb_error(e),
        }
    }
}

fn write(shared: &Shared, address: u8, data: &[u8], zero_packet: bool) -> TransferOutcome {
    let written = match shared.handle.write_bulk(address, data, WRITE_TIMEOUT) {
        Ok(n) => n,
        Err(e) => return map_rusb_error(e),
    };

    if zero_packet && written == data.len() {
        if let Err(e) = shared.handle.write_bulk(address, &[], WRITE_TIMEOUT) {
            warn!("Zero-length packet on {:#04x} failed: {}", address, e);
            return map_rusb_error(e);
        }
    }
    TransferOutcome::Completed(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            TransferOutcome::DeviceGone
        );
        assert_eq!(
            map_rusb_error(rusb::Error::Pipe),
            TransferOutcome::Error(TransferError::Pipe)
        );
        assert_eq!(
            map_rusb_error(rusb::Error::Timeout),
            TransferOutcome::Error(TransferError::Timeout)
        );
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            TransferOutcome::Error(TransferError::Other(_))
        ));
    }
}
