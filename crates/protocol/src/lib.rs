//! USB/IP wire protocol
//!
//! This crate defines the binary message format spoken between the host
//! server and remote usbip clients: a common 8-byte big-endian header
//! (version, command, status) followed by a command-specific payload, over
//! TCP. It provides type-safe message definitions, stateless
//! encoding/decoding, and async frame I/O behind the `async` feature.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, decode_message, encode_message};
//!
//! let msg = Message::DevlistRequest;
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes, 1024 * 1024).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod status;
pub mod types;
pub mod version;

pub use codec::{MAX_DEVLIST_DEVICES, decode_message, encode_message, validate_version};

#[cfg(feature = "async")]
pub use codec::{read_message, write_message};
pub use error::{ProtocolError, Result};
pub use messages::{
    Command, DevlistReply, Header, ImportReply, ImportRequest, Message, SubmitCmd, SubmitReply,
    UnlinkCmd, UnlinkReply,
};
pub use types::{BUS_ID_SIZE, BusId, DeviceSpeed, Direction, ExportedDevice};
pub use version::USBIP_VERSION;
