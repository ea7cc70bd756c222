//! Message encoding and decoding
//!
//! Stateless translation between [`Message`] values and the fixed binary
//! wire format: 8-byte big-endian common header, then a command-specific
//! payload. Decode validates, in order: minimum header length, supported
//! version, recognized command, and payload length consistent with the
//! header and with the configured maximum transfer buffer size. Decode never
//! rejects well-formed-but-semantically-invalid content (an unknown bus id,
//! a state-illegal command) — that is the session's responsibility.

use crate::error::{ProtocolError, Result};
use crate::messages::{
    Command, DevlistReply, Header, ImportReply, ImportRequest, Message, SubmitCmd, SubmitReply,
    UnlinkCmd, UnlinkReply,
};
use crate::status;
use crate::types::{BUS_ID_SIZE, BusId, Direction, ExportedDevice};
use crate::version::{USBIP_VERSION, is_supported};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncWrite};

/// Fixed payload bytes of a submit command (before the data section)
const SUBMIT_CMD_FIXED: usize = 44;

/// Fixed payload bytes of a submit reply (before the data section)
const SUBMIT_REPLY_FIXED: usize = 32;

/// Upper bound on device records in one device-list reply
///
/// Bounds the allocation implied by the count field before any record bytes
/// are read.
pub const MAX_DEVLIST_DEVICES: usize = 256;

/// Validate a header-declared protocol version
pub fn validate_version(version: u16) -> Result<()> {
    if !is_supported(version) {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            expected: USBIP_VERSION,
        });
    }
    Ok(())
}

/// Encode a message to its wire bytes
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(Header::SIZE + 64);

    Header {
        version: USBIP_VERSION,
        command: message.command() as u16,
        status: message.status(),
    }
    .write_to(&mut buf)?;

    match message {
        Message::DevlistRequest => {}

        Message::DevlistReply(reply) => {
            buf.write_u32::<BigEndian>(reply.devices.len() as u32)?;
            for device in &reply.devices {
                device.write_to(&mut buf)?;
            }
        }

        Message::ImportRequest(request) => {
            buf.extend_from_slice(&request.busid.to_wire());
        }

        Message::ImportReply(reply) => {
            if let Some(device) = &reply.device {
                device.write_to(&mut buf)?;
            }
        }

        Message::SubmitCmd(cmd) => {
            buf.write_u32::<BigEndian>(cmd.seqnum)?;
            buf.write_u32::<BigEndian>(cmd.devid)?;
            buf.write_u32::<BigEndian>(cmd.direction.to_wire())?;
            buf.write_u32::<BigEndian>(cmd.ep)?;
            buf.write_u32::<BigEndian>(cmd.transfer_flags)?;
            buf.write_u32::<BigEndian>(cmd.transfer_buffer_length)?;
            buf.write_u32::<BigEndian>(cmd.start_frame)?;
            buf.write_u32::<BigEndian>(cmd.number_of_packets)?;
            buf.write_u32::<BigEndian>(cmd.interval)?;
            buf.extend_from_slice(&cmd.setup);
            if cmd.direction == Direction::Out {
                buf.extend_from_slice(&cmd.data);
            }
        }

        Message::SubmitReply(reply) => {
            buf.write_u32::<BigEndian>(reply.seqnum)?;
            buf.write_u32::<BigEndian>(reply.devid)?;
            buf.write_u32::<BigEndian>(reply.direction.to_wire())?;
            buf.write_u32::<BigEndian>(reply.ep)?;
            buf.write_u32::<BigEndian>(reply.actual_length)?;
            buf.write_u32::<BigEndian>(reply.start_frame)?;
            buf.write_u32::<BigEndian>(reply.number_of_packets)?;
            buf.write_u32::<BigEndian>(reply.error_count)?;
            if reply.direction == Direction::In && reply.status == status::OK {
                buf.extend_from_slice(&reply.data);
            }
        }

        Message::UnlinkCmd(cmd) => {
            buf.write_u32::<BigEndian>(cmd.seqnum)?;
            buf.write_u32::<BigEndian>(cmd.devid)?;
            buf.write_u32::<BigEndian>(cmd.unlink_seqnum)?;
        }

        Message::UnlinkReply(reply) => {
            buf.write_u32::<BigEndian>(reply.seqnum)?;
            buf.write_u32::<BigEndian>(reply.devid)?;
        }
    }

    Ok(buf)
}

/// Decode one complete message from its wire bytes
///
/// `max_buffer` caps the declared transfer buffer of submit traffic.
pub fn decode_message(bytes: &[u8], max_buffer: usize) -> Result<Message> {
    if bytes.len() < Header::SIZE {
        return Err(ProtocolError::InvalidHeader {
            reason: "shorter than common header",
        });
    }

    let mut cursor = Cursor::new(bytes);
    let header = Header::read_from(&mut cursor)?;
    validate_version(header.version)?;
    let command = Command::from_u16(header.command)?;

    let payload = &bytes[Header::SIZE..];

    match command {
        Command::ReqDevlist => {
            expect_payload(payload, 0)?;
            Ok(Message::DevlistRequest)
        }

        Command::RepDevlist => {
            if payload.len() < 4 {
                return Err(ProtocolError::TruncatedPayload {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            let mut cursor = Cursor::new(payload);
            let count = cursor.read_u32::<BigEndian>()? as usize;
            if count > MAX_DEVLIST_DEVICES {
                return Err(ProtocolError::PayloadTooLarge {
                    size: count * ExportedDevice::WIRE_SIZE,
                    max: MAX_DEVLIST_DEVICES * ExportedDevice::WIRE_SIZE,
                });
            }
            expect_payload(payload, 4 + count * ExportedDevice::WIRE_SIZE)?;
            let mut devices = Vec::with_capacity(count);
            for _ in 0..count {
                devices.push(ExportedDevice::read_from(&mut cursor)?);
            }
            Ok(Message::DevlistReply(DevlistReply {
                status: header.status,
                devices,
            }))
        }

        Command::ReqImport => {
            expect_payload(payload, BUS_ID_SIZE)?;
            let mut busid_raw = [0u8; BUS_ID_SIZE];
            busid_raw.copy_from_slice(payload);
            Ok(Message::ImportRequest(ImportRequest {
                busid: BusId::from_wire(&busid_raw),
            }))
        }

        Command::RepImport => {
            let device = if header.status == status::OK {
                expect_payload(payload, ExportedDevice::WIRE_SIZE)?;
                Some(ExportedDevice::read_from(&mut Cursor::new(payload))?)
            } else {
                expect_payload(payload, 0)?;
                None
            };
            Ok(Message::ImportReply(ImportReply {
                status: header.status,
                device,
            }))
        }

        Command::CmdSubmit => {
            if payload.len() < SUBMIT_CMD_FIXED {
                return Err(ProtocolError::TruncatedPayload {
                    expected: SUBMIT_CMD_FIXED,
                    actual: payload.len(),
                });
            }
            let mut cursor = Cursor::new(payload);
            let seqnum = cursor.read_u32::<BigEndian>()?;
            let devid = cursor.read_u32::<BigEndian>()?;
            let direction = Direction::from_wire(cursor.read_u32::<BigEndian>()?)?;
            let ep = cursor.read_u32::<BigEndian>()?;
            let transfer_flags = cursor.read_u32::<BigEndian>()?;
            let transfer_buffer_length = cursor.read_u32::<BigEndian>()?;
            let start_frame = cursor.read_u32::<BigEndian>()?;
            let number_of_packets = cursor.read_u32::<BigEndian>()?;
            let interval = cursor.read_u32::<BigEndian>()?;
            let mut setup = [0u8; 8];
            setup.copy_from_slice(&payload[36..44]);

            let buffer_len = transfer_buffer_length as usize;
            if buffer_len > max_buffer {
                return Err(ProtocolError::PayloadTooLarge {
                    size: buffer_len,
                    max: max_buffer,
                });
            }

            let data = match direction {
                Direction::Out => {
                    expect_payload(payload, SUBMIT_CMD_FIXED + buffer_len)?;
                    payload[SUBMIT_CMD_FIXED..SUBMIT_CMD_FIXED + buffer_len].to_vec()
                }
                Direction::In => {
                    expect_payload(payload, SUBMIT_CMD_FIXED)?;
                    Vec::new()
                }
            };

            Ok(Message::SubmitCmd(SubmitCmd {
                seqnum,
                devid,
                direction,
                ep,
                transfer_flags,
                transfer_buffer_length,
                start_frame,
                number_of_packets,
                interval,
                setup,
                data,
            }))
        }

        Command::RetSubmit => {
            if payload.len() < SUBMIT_REPLY_FIXED {
                return Err(ProtocolError::TruncatedPayload {
                    expected: SUBMIT_REPLY_FIXED,
                    actual: payload.len(),
                });
            }
            let mut cursor = Cursor::new(payload);
            let seqnum = cursor.read_u32::<BigEndian>()?;
            let devid = cursor.read_u32::<BigEndian>()?;
            let direction = Direction::from_wire(cursor.read_u32::<BigEndian>()?)?;
            let ep = cursor.read_u32::<BigEndian>()?;
            let actual_length = cursor.read_u32::<BigEndian>()?;
            let start_frame = cursor.read_u32::<BigEndian>()?;
            let number_of_packets = cursor.read_u32::<BigEndian>()?;
            let error_count = cursor.read_u32::<BigEndian>()?;

            let data = if direction == Direction::In && header.status == status::OK {
                let data_len = actual_length as usize;
                if data_len > max_buffer {
                    return Err(ProtocolError::PayloadTooLarge {
                        size: data_len,
                        max: max_buffer,
                    });
                }
                expect_payload(payload, SUBMIT_REPLY_FIXED + data_len)?;
                payload[SUBMIT_REPLY_FIXED..SUBMIT_REPLY_FIXED + data_len].to_vec()
            } else {
                expect_payload(payload, SUBMIT_REPLY_FIXED)?;
                Vec::new()
            };

            Ok(Message::SubmitReply(SubmitReply {
                seqnum,
                devid,
                direction,
                ep,
                status: header.status,
                actual_length,
                start_frame,
                number_of_packets,
                error_count,
                data,
            }))
        }

        Command::CmdUnlink => {
            expect_payload(payload, 12)?;
            let mut cursor = Cursor::new(payload);
            Ok(Message::UnlinkCmd(UnlinkCmd {
                seqnum: cursor.read_u32::<BigEndian>()?,
                devid: cursor.read_u32::<BigEndian>()?,
                unlink_seqnum: cursor.read_u32::<BigEndian>()?,
            }))
        }

        Command::RetUnlink => {
            expect_payload(payload, 8)?;
            let mut cursor = Cursor::new(payload);
            Ok(Message::UnlinkReply(UnlinkReply {
                seqnum: cursor.read_u32::<BigEndian>()?,
                devid: cursor.read_u32::<BigEndian>()?,
                status: header.status,
            }))
        }
    }
}

/// Check the payload is exactly the expected length
fn expect_payload(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ProtocolError::TruncatedPayload {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Async: read exactly one message from a stream
///
/// Reads the header, then the command-specific fixed payload, then any data
/// section whose length the fixed payload declares. Length bounds are
/// enforced before the data is read so a hostile peer cannot force an
/// oversized allocation.
#[cfg(feature = "async")]
pub async fn read_message<R>(reader: &mut R, max_buffer: usize) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut header_bytes = [0u8; Header::SIZE];
    reader.read_exact(&mut header_bytes).await?;

    let header = Header::read_from(&mut Cursor::new(&header_bytes[..]))?;
    validate_version(header.version)?;
    let command = Command::from_u16(header.command)?;

    let fixed_len = match command {
        Command::ReqDevlist => 0,
        Command::RepDevlist => 4,
        Command::ReqImport => BUS_ID_SIZE,
        Command::RepImport => {
            if header.status == status::OK {
                ExportedDevice::WIRE_SIZE
            } else {
                0
            }
        }
        Command::CmdSubmit => SUBMIT_CMD_FIXED,
        Command::RetSubmit => SUBMIT_REPLY_FIXED,
        Command::CmdUnlink => 12,
        Command::RetUnlink => 8,
    };

    let mut fixed = vec![0u8; fixed_len];
    reader.read_exact(&mut fixed).await?;

    let data_len = match command {
        Command::RepDevlist => {
            let count = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
            if count > MAX_DEVLIST_DEVICES {
                return Err(ProtocolError::PayloadTooLarge {
                    size: count * ExportedDevice::WIRE_SIZE,
                    max: MAX_DEVLIST_DEVICES * ExportedDevice::WIRE_SIZE,
                });
            }
            count * ExportedDevice::WIRE_SIZE
        }
        Command::CmdSubmit => {
            let direction = u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]);
            let buffer_len =
                u32::from_be_bytes([fixed[20], fixed[21], fixed[22], fixed[23]]) as usize;
            if buffer_len > max_buffer {
                return Err(ProtocolError::PayloadTooLarge {
                    size: buffer_len,
                    max: max_buffer,
                });
            }
            if direction == 0 { buffer_len } else { 0 }
        }
        Command::RetSubmit => {
            let direction = u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]);
            let actual_length =
                u32::from_be_bytes([fixed[16], fixed[17], fixed[18], fixed[19]]) as usize;
            if actual_length > max_buffer {
                return Err(ProtocolError::PayloadTooLarge {
                    size: actual_length,
                    max: max_buffer,
                });
            }
            if direction == 1 && header.status == status::OK {
                actual_length
            } else {
                0
            }
        }
        _ => 0,
    };

    let mut message_bytes = Vec::with_capacity(Header::SIZE + fixed_len + data_len);
    message_bytes.extend_from_slice(&header_bytes);
    message_bytes.extend_from_slice(&fixed);
    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await?;
        message_bytes.extend_from_slice(&data);
    }

    decode_message(&message_bytes, max_buffer)
}

/// Async: write one message to a stream
#[cfg(feature = "async")]
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let bytes = encode_message(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceSpeed;

    const MAX: usize = 1024 * 1024;

    fn sample_device(busnum: u32, devnum: u32) -> ExportedDevice {
        ExportedDevice {
            busid: BusId::from_bus_dev(busnum, devnum),
            busnum,
            devnum,
            speed: DeviceSpeed::High,
            vendor: 0x1234,
            product: 0x5678,
            bcd_device: 0x0100,
            class: 0x03,
            subclass: 0x01,
            protocol: 0x02,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }

    #[test]
    fn test_devlist_request_roundtrip() {
        let msg = Message::DevlistRequest;
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), Header::SIZE);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_devlist_reply_roundtrip() {
        let msg = Message::DevlistReply(DevlistReply::new(vec![
            sample_device(1, 1),
            sample_device(2, 5),
        ]));
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_empty_devlist_reply_roundtrip() {
        let msg = Message::DevlistReply(DevlistReply::new(Vec::new()));
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), Header::SIZE + 4);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_import_request_roundtrip() {
        let msg = Message::ImportRequest(ImportRequest {
            busid: BusId::new("1-1").unwrap(),
        });
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), Header::SIZE + BUS_ID_SIZE);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_import_reply_roundtrip() {
        let ok = Message::ImportReply(ImportReply::success(sample_device(1, 1)));
        let bytes = encode_message(&ok).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), ok);

        let err = Message::ImportReply(ImportReply::error(status::DEVICE_BUSY));
        let bytes = encode_message(&err).unwrap();
        assert_eq!(bytes.len(), Header::SIZE);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), err);
    }

    #[test]
    fn test_submit_out_roundtrip() {
        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 42,
            devid: (1 << 16) | 1,
            direction: Direction::Out,
            ep: 2,
            transfer_flags: 0,
            transfer_buffer_length: 4,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: vec![0xde, 0xad, 0xbe, 0xef],
        });
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_submit_in_roundtrip() {
        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 7,
            devid: (1 << 16) | 1,
            direction: Direction::In,
            ep: 1,
            transfer_flags: 0,
            transfer_buffer_length: 64,
            start_frame: 0,
            number_of_packets: 0,
            interval: 10,
            setup: [0u8; 8],
            data: Vec::new(),
        });
        let bytes = encode_message(&msg).unwrap();
        // IN submits carry no data section
        assert_eq!(bytes.len(), Header::SIZE + 44);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }

    #[test]
    fn test_control_submit_roundtrip() {
        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 1,
            devid: (1 << 16) | 1,
            direction: Direction::In,
            ep: 0,
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            data: Vec::new(),
        });
        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes, MAX).unwrap();
        assert_eq!(decoded, msg);
        let Message::SubmitCmd(cmd) = decoded else {
            panic!("expected SubmitCmd");
        };
        assert!(cmd.is_control());
    }

    #[test]
    fn test_submit_reply_roundtrip() {
        let ok = Message::SubmitReply(SubmitReply::success(
            42,
            (1 << 16) | 1,
            Direction::In,
            1,
            3,
            vec![1, 2, 3],
        ));
        let bytes = encode_message(&ok).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), ok);

        let err = Message::SubmitReply(SubmitReply::error(
            42,
            (1 << 16) | 1,
            Direction::In,
            1,
            status::TIMEOUT,
        ));
        let bytes = encode_message(&err).unwrap();
        assert_eq!(bytes.len(), Header::SIZE + SUBMIT_REPLY_FIXED);
        assert_eq!(decode_message(&bytes, MAX).unwrap(), err);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let cmd = Message::UnlinkCmd(UnlinkCmd {
            seqnum: 100,
            devid: (1 << 16) | 1,
            unlink_seqnum: 42,
        });
        let bytes = encode_message(&cmd).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), cmd);

        let reply = Message::UnlinkReply(UnlinkReply::not_found(100, (1 << 16) | 1));
        let bytes = encode_message(&reply).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), reply);
    }

    #[test]
    fn test_decode_short_header() {
        let result = decode_message(&[0x01, 0x11, 0x80], MAX);
        assert!(matches!(result, Err(ProtocolError::InvalidHeader { .. })));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut bytes = encode_message(&Message::DevlistRequest).unwrap();
        bytes[0] = 0x02;
        bytes[1] = 0x00;
        let result = decode_message(&bytes, MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedVersion {
                version: 0x0200,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut bytes = encode_message(&Message::DevlistRequest).unwrap();
        bytes[2] = 0x00;
        bytes[3] = 0xff;
        let result = decode_message(&bytes, MAX);
        assert!(matches!(result, Err(ProtocolError::UnknownCommand { .. })));
    }

    #[test]
    fn test_decode_truncated_submit() {
        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 1,
            devid: 1,
            direction: Direction::Out,
            ep: 1,
            transfer_flags: 0,
            transfer_buffer_length: 8,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: vec![0u8; 8],
        });
        let bytes = encode_message(&msg).unwrap();
        // Drop the last two data bytes
        let result = decode_message(&bytes[..bytes.len() - 2], MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_decode_trailing_bytes_rejected() {
        let mut bytes = encode_message(&Message::DevlistRequest).unwrap();
        bytes.push(0);
        let result = decode_message(&bytes, MAX);
        assert!(matches!(
            result,
            Err(ProtocolError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_decode_buffer_over_limit() {
        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 1,
            devid: 1,
            direction: Direction::In,
            ep: 1,
            transfer_flags: 0,
            transfer_buffer_length: 4096,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: Vec::new(),
        });
        let bytes = encode_message(&msg).unwrap();
        let result = decode_message(&bytes, 1024);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge {
                size: 4096,
                max: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_async_read_write_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 9,
            devid: (1 << 16) | 1,
            direction: Direction::Out,
            ep: 2,
            transfer_flags: 0,
            transfer_buffer_length: 3,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: vec![7, 8, 9],
        });

        write_message(&mut client, &msg).await.unwrap();
        let decoded = read_message(&mut server, MAX).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_async_read_rejects_oversized_submit() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = Message::SubmitCmd(SubmitCmd {
            seqnum: 9,
            devid: 1,
            direction: Direction::In,
            ep: 1,
            transfer_flags: 0,
            transfer_buffer_length: 2048,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: Vec::new(),
        });

        write_message(&mut client, &msg).await.unwrap();
        let result = read_message(&mut server, 512).await;
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }
}
