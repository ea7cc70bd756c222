//! Shared plumbing for the usbip-host workspace
//!
//! Common error type, logging setup, the channel bridge between the Tokio
//! runtime and the blocking USB worker thread, and the USB-facing types both
//! sides of that bridge exchange.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceRecord, OpenError, UrbOutcome};
