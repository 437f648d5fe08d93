//! USB bulk transfer to byte-stream bridge
//!
//! Turns the bulk IN/OUT endpoint pair of an attached USB device into an
//! ordered byte stream with open/close/read/write/throttle semantics.
//!
//! The crate is organised the same way data flows through it:
//!
//! - [`registry`]: owns attached devices and their attach/detach lifecycle
//! - [`pump`]: keeps exactly one inbound transfer outstanding while active
//! - [`writer`]: serializes outbound writes and tracks in-flight buffers
//! - [`port`]: the consumer-facing stream handle
//!
//! Transfers are asynchronous. A [`TransferBackend`] accepts requests and
//! reports each one exactly once as a [`Completion`] on the device's
//! completion channel. A dedicated worker thread per device consumes that
//! channel and runs the pump and writer handlers; those handlers only take
//! short critical sections and never wait. Request-context calls (open,
//! close, write, detach) may block, and detach is the one place that waits
//! for in-flight transfers to drain.
//!
//! The [`usb`] module provides the libusb-backed transport and hot-plug
//! manager; [`testing`] provides an in-memory backend.

pub mod device;
pub mod endpoint;
pub mod error;
pub mod port;
pub mod pump;
pub mod registry;
pub mod stats;
mod sync;
pub mod testing;
pub mod transfer;
pub mod usb;
mod worker;
pub mod writer;

pub use device::{Device, DeviceIdentity, DeviceState, SlotId};
pub use endpoint::{BulkEndpoints, EndpointDescriptor, TransferKind, discover_bulk_endpoints};
pub use error::{BridgeError, Result};
pub use port::{LineSettings, StreamPort};
pub use registry::DeviceRegistry;
pub use stats::{TransferCounters, TransferStats};
pub use transfer::{
    Completion, Direction, SubmitError, SubmitFailure, TransferBackend, TransferBuffer,
    TransferError, TransferId, TransferOutcome, TransferRequest,
};
