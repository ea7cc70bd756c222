//! usbip-host server library
//!
//! Host-side USB/IP server: discovers locally attached USB devices,
//! exclusively claims them for export, and serves the USB/IP wire protocol
//! so remote clients can import devices and exchange URBs with them.
//!
//! The binary in `main.rs` is a thin CLI over [`server::UsbIpServer`]; the
//! pieces are exported here so integration tests can drive them directly.

pub mod admission;
pub mod claim;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod usb;

/// Identifier assigned to each accepted connection, unique for the server's
/// lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
