//! USB subsystem: device backends, the registry, and the worker thread

pub mod backend;
pub mod registry;
pub mod worker;

pub use backend::{
    BackendEvent, DeviceBackend, MockBackend, MockHandle, MockUrb, RusbBackend, mock_device,
};
pub use registry::DeviceRegistry;
pub use worker::{UsbWorkerThread, spawn_usb_worker};
