//! Common utilities for usb-tty-bridge
//!
//! This crate provides shared functionality between the bridge library and
//! the command-line front-end: error handling, logging setup, and the
//! out-of-band event channel the bridge uses to report conditions that have
//! no caller to return to.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{BridgeEvent, EventReceiver, EventSender, create_event_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
