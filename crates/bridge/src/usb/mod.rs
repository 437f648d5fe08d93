//! libusb transport
//!
//! [`RusbBackend`] drives a claimed bulk interface through `rusb`, and the
//! [`manager`] thread watches for matching devices, claims them, and attaches
//! them to a [`DeviceRegistry`](crate::DeviceRegistry).
//!
//! `rusb` only offers synchronous bulk calls, so each endpoint gets its own
//! thread that works through a FIFO request queue. Completions leave those
//! threads through [`TransferRequest::complete`](crate::TransferRequest::complete)
//! like they would from any other backend.

pub mod backend;
pub mod manager;

pub use backend::{RusbBackend, map_rusb_error};
pub use manager::{
    DeviceManager, DeviceManagerHandle, ManagerCommand, MatchedDevice, list_matching,
    select_bulk_interface, spawn_device_manager,
};
