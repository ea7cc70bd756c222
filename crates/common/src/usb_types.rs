//! USB-facing types shared between the worker thread and the server

use protocol::{ExportedDevice, status};
use thiserror::Error;

/// One enumerated device: the wire-visible record plus the descriptor
/// strings the wire format does not carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Wire-visible device record
    pub desc: ExportedDevice,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
}

impl DeviceRecord {
    /// Human-readable label for logs and device listings
    pub fn label(&self) -> String {
        let name = match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => "unknown device".to_string(),
        };
        format!(
            "{} [{:04x}:{:04x}] {}",
            self.desc.busid, self.desc.vendor, self.desc.product, name
        )
    }
}

/// Result of one URB executed by the device backend
#[derive(Debug, Clone)]
pub struct UrbOutcome {
    /// URB status: 0 on success, negative errno on failure
    pub status: i32,
    /// Bytes actually transferred
    pub actual_length: u32,
    /// Data read from the device (IN transfers only)
    pub data: Vec<u8>,
}

impl UrbOutcome {
    /// Successful IN transfer carrying `data`
    pub fn success_in(data: Vec<u8>) -> Self {
        Self {
            status: status::OK,
            actual_length: data.len() as u32,
            data,
        }
    }

    /// Successful OUT transfer that wrote `written` bytes
    pub fn success_out(written: u32) -> Self {
        Self {
            status: status::OK,
            actual_length: written,
            data: Vec::new(),
        }
    }

    /// Failed transfer
    pub fn error(status: i32) -> Self {
        Self {
            status,
            actual_length: 0,
            data: Vec::new(),
        }
    }
}

/// Why the backend refused to open a device for exclusive use
#[derive(Debug, Clone, Error)]
pub enum OpenError {
    /// Bus id is not in the registry (unknown or filtered out)
    #[error("device not found")]
    NotFound,

    /// Device is held by something the backend cannot displace
    #[error("device busy")]
    Busy,

    /// Underlying I/O failure while claiming
    #[error("claim I/O failed: {0}")]
    Io(String),
}
