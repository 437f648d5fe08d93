//! Completion worker
//!
//! Each device gets one thread that drains its completion channel and runs
//! the pump and writer handlers. This is the bridge's completion context:
//! handlers executed here must not wait on anything a request-context
//! caller could hold for long.

use crate::device::Device;
use crate::error::{BridgeError, Result};
use crate::transfer::Completion;
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Messages consumed by the completion worker
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// A transfer finished
    Completion(Completion),
    /// Stop after the messages queued so far
    Shutdown,
}

pub(crate) struct CompletionWorker {
    tx: Sender<WorkerMessage>,
    thread: JoinHandle<()>,
}

impl CompletionWorker {
    pub(crate) fn spawn(
        device: Arc<Device>,
        tx: Sender<WorkerMessage>,
        rx: Receiver<WorkerMessage>,
    ) -> Result<Self> {
        let name = format!("usb-completion-{}", device.slot().0);

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(device, rx))
            .map_err(|e| BridgeError::WorkerSpawn(e.to_string()))?;

        Ok(Self { tx, thread })
    }

    /// Stop the worker and wait for it to exit (request context)
    pub(crate) fn shutdown(self) {
        let _ = self.tx.try_send(WorkerMessage::Shutdown);
        if let Err(e) = self.thread.join() {
            error!("Completion worker panicked: {:?}", e);
        }
    }
}

fn run(device: Arc<Device>, rx: Receiver<WorkerMessage>) {
    debug!("Completion worker for {} started", device.slot());

    while let Ok(message) = rx.recv_blocking() {
        match message {
            WorkerMessage::Completion(completion) => {
                // A panicking handler must not take the worker down with it,
                // or teardown would wait forever for completions.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    device.dispatch(completion)
                }));
                if let Err(e) = result {
                    error!("Panic in completion handler: {:?}", e);
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }

    debug!("Completion worker for {} stopped", device.slot());
}
