//! Protocol message definitions
//!
//! Every message is a common 8-byte header followed by a command-specific
//! payload. Requests set bit 15 of the command code, replies clear it; the
//! header status is zero for requests and carries the result for replies.

use crate::error::{ProtocolError, Result};
use crate::status;
use crate::types::{BusId, Direction, ExportedDevice};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Common message header
///
/// All integer fields are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version
    pub version: u16,
    /// Command code
    pub command: u16,
    /// Result status: 0 on success, negative errno on failure
    pub status: i32,
}

impl Header {
    /// Size of the header in bytes
    pub const SIZE: usize = 8;

    /// Read a header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let command = reader.read_u16::<BigEndian>()?;
        let status = reader.read_i32::<BigEndian>()?;
        Ok(Self {
            version,
            command,
            status,
        })
    }

    /// Write a header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.command)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// Command codes
///
/// Requests set bit 15, replies clear it. Submit and unlink keep their
/// USB/IP numbers in the low byte.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Request the exportable device list
    ReqDevlist = 0x8005,
    /// Device list reply
    RepDevlist = 0x0005,
    /// Request import of one device by bus id
    ReqImport = 0x8003,
    /// Import reply
    RepImport = 0x0003,
    /// Submit a URB
    CmdSubmit = 0x8001,
    /// URB completion reply
    RetSubmit = 0x0001,
    /// Cancel a previously submitted, still-pending URB
    CmdUnlink = 0x8002,
    /// Unlink reply
    RetUnlink = 0x0002,
}

impl Command {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x8005 => Ok(Self::ReqDevlist),
            0x0005 => Ok(Self::RepDevlist),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            0x8001 => Ok(Self::CmdSubmit),
            0x0001 => Ok(Self::RetSubmit),
            0x8002 => Ok(Self::CmdUnlink),
            0x0002 => Ok(Self::RetUnlink),
            _ => Err(ProtocolError::UnknownCommand { command: value }),
        }
    }
}

/// Device list reply payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevlistReply {
    /// Reply status (0 on success)
    pub status: i32,
    /// Exportable devices; empty when none are attached
    pub devices: Vec<ExportedDevice>,
}

impl DevlistReply {
    pub fn new(devices: Vec<ExportedDevice>) -> Self {
        Self {
            status: status::OK,
            devices,
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            devices: Vec::new(),
        }
    }
}

/// Import request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// Bus id of the device to import
    pub busid: BusId,
}

/// Import reply payload
///
/// `device` is present exactly when `status` is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReply {
    pub status: i32,
    pub device: Option<ExportedDevice>,
}

impl ImportReply {
    pub fn success(device: ExportedDevice) -> Self {
        Self {
            status: status::OK,
            device: Some(device),
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            device: None,
        }
    }
}

/// URB submit command payload
///
/// For OUT transfers `data` holds exactly `transfer_buffer_length` bytes;
/// for IN transfers `data` is empty and `transfer_buffer_length` declares
/// the buffer the client expects back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCmd {
    /// Sequence number, unique among the device's pending transfers
    pub seqnum: u32,
    /// Target device id (busnum << 16 | devnum)
    pub devid: u32,
    /// Transfer direction
    pub direction: Direction,
    /// Endpoint number
    pub ep: u32,
    /// URB transfer flags (passed through to the device backend)
    pub transfer_flags: u32,
    /// Transfer buffer length
    pub transfer_buffer_length: u32,
    /// Start frame for isochronous transfers
    pub start_frame: u32,
    /// Number of packets for isochronous transfers
    pub number_of_packets: u32,
    /// Polling interval for interrupt transfers
    pub interval: u32,
    /// Setup packet for control transfers; all zeroes otherwise
    pub setup: [u8; 8],
    /// Outbound data (OUT transfers only)
    pub data: Vec<u8>,
}

impl SubmitCmd {
    /// Whether this is a control transfer (non-zero setup packet)
    pub fn is_control(&self) -> bool {
        self.setup != [0u8; 8]
    }
}

/// URB completion reply payload
///
/// The header status carries the URB result; `data` is present exactly for
/// successful IN transfers and then holds `actual_length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// URB status (0 on success)
    pub status: i32,
    /// Bytes actually transferred
    pub actual_length: u32,
    /// Start frame for isochronous transfers
    pub start_frame: u32,
    /// Number of packets
    pub number_of_packets: u32,
    /// Error count
    pub error_count: u32,
    /// Inbound data (successful IN transfers only)
    pub data: Vec<u8>,
}

impl SubmitReply {
    /// Create a successful completion
    pub fn success(
        seqnum: u32,
        devid: u32,
        direction: Direction,
        ep: u32,
        actual_length: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            seqnum,
            devid,
            direction,
            ep,
            status: status::OK,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
        }
    }

    /// Create an error completion
    pub fn error(seqnum: u32, devid: u32, direction: Direction, ep: u32, status: i32) -> Self {
        Self {
            seqnum,
            devid,
            direction,
            ep,
            status,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data: Vec::new(),
        }
    }
}

/// Unlink command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkCmd {
    /// Sequence number of this unlink request itself
    pub seqnum: u32,
    /// Target device id
    pub devid: u32,
    /// Sequence number of the pending submit to cancel
    pub unlink_seqnum: u32,
}

/// Unlink reply payload
///
/// The header status carries the result: 0 when the transfer was cancelled,
/// `-ENOENT` when no such transfer was pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkReply {
    /// Echo of the unlink request's own sequence number
    pub seqnum: u32,
    pub devid: u32,
    pub status: i32,
}

impl UnlinkReply {
    pub fn cancelled(seqnum: u32, devid: u32) -> Self {
        Self {
            seqnum,
            devid,
            status: status::OK,
        }
    }

    pub fn not_found(seqnum: u32, devid: u32) -> Self {
        Self {
            seqnum,
            devid,
            status: status::NOT_FOUND,
        }
    }
}

/// All message kinds in the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DevlistRequest,
    DevlistReply(DevlistReply),
    ImportRequest(ImportRequest),
    ImportReply(ImportReply),
    SubmitCmd(SubmitCmd),
    SubmitReply(SubmitReply),
    UnlinkCmd(UnlinkCmd),
    UnlinkReply(UnlinkReply),
}

impl Message {
    /// Command code for this message kind
    pub fn command(&self) -> Command {
        match self {
            Self::DevlistRequest => Command::ReqDevlist,
            Self::DevlistReply(_) => Command::RepDevlist,
            Self::ImportRequest(_) => Command::ReqImport,
            Self::ImportReply(_) => Command::RepImport,
            Self::SubmitCmd(_) => Command::CmdSubmit,
            Self::SubmitReply(_) => Command::RetSubmit,
            Self::UnlinkCmd(_) => Command::CmdUnlink,
            Self::UnlinkReply(_) => Command::RetUnlink,
        }
    }

    /// Header status for this message (requests always carry zero)
    pub fn status(&self) -> i32 {
        match self {
            Self::DevlistRequest | Self::ImportRequest(_) | Self::SubmitCmd(_)
            | Self::UnlinkCmd(_) => status::OK,
            Self::DevlistReply(reply) => reply.status,
            Self::ImportReply(reply) => reply.status,
            Self::SubmitReply(reply) => reply.status,
            Self::UnlinkReply(reply) => reply.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        // Requests set bit 15, replies clear it
        for (req, rep) in [
            (Command::ReqDevlist, Command::RepDevlist),
            (Command::ReqImport, Command::RepImport),
            (Command::CmdSubmit, Command::RetSubmit),
            (Command::CmdUnlink, Command::RetUnlink),
        ] {
            assert_eq!((req as u16) & 0x8000, 0x8000);
            assert_eq!((rep as u16) & 0x8000, 0);
            assert_eq!((req as u16) & 0x7fff, rep as u16);
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Command::from_u16(0x00ff),
            Err(ProtocolError::UnknownCommand { command: 0x00ff })
        ));
    }

    #[test]
    fn test_request_status_is_zero() {
        assert_eq!(Message::DevlistRequest.status(), status::OK);
        let unlink = Message::UnlinkCmd(UnlinkCmd {
            seqnum: 9,
            devid: 1,
            unlink_seqnum: 3,
        });
        assert_eq!(unlink.status(), status::OK);
    }

    #[test]
    fn test_unlink_reply_constructors() {
        assert_eq!(UnlinkReply::cancelled(1, 2).status, status::OK);
        assert_eq!(UnlinkReply::not_found(1, 2).status, status::NOT_FOUND);
    }
}
