//! Wire-format conformance tests
//!
//! Pins exact byte layouts so the format stays interoperable with existing
//! usbip clients; the per-kind round-trip tests live next to the codec.

use protocol::{
    BusId, DevlistReply, Direction, Message, SubmitCmd, UnlinkCmd, UnlinkReply, USBIP_VERSION,
    decode_message, encode_message, status,
};

const MAX: usize = 1024 * 1024;

#[test]
fn devlist_request_exact_bytes() {
    let bytes = encode_message(&Message::DevlistRequest).unwrap();
    assert_eq!(bytes, vec![0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
}

#[test]
fn header_fields_are_big_endian() {
    let msg = Message::UnlinkReply(UnlinkReply {
        seqnum: 0x0102_0304,
        devid: 0x0005_0006,
        status: status::NOT_FOUND,
    });
    let bytes = encode_message(&msg).unwrap();

    assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), USBIP_VERSION);
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0x0002);
    assert_eq!(
        i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        status::NOT_FOUND
    );
    assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[12..16], &[0x00, 0x05, 0x00, 0x06]);
}

#[test]
fn import_request_busid_is_nul_padded() {
    let msg = Message::ImportRequest(protocol::ImportRequest {
        busid: BusId::new("1-1").unwrap(),
    });
    let bytes = encode_message(&msg).unwrap();
    assert_eq!(bytes.len(), 8 + 32);
    assert_eq!(&bytes[8..11], b"1-1");
    assert!(bytes[11..40].iter().all(|&b| b == 0));
}

#[test]
fn out_submit_carries_data_in_submit_carries_none() {
    let mut cmd = SubmitCmd {
        seqnum: 1,
        devid: (1 << 16) | 1,
        direction: Direction::Out,
        ep: 2,
        transfer_flags: 0,
        transfer_buffer_length: 5,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
        data: vec![1, 2, 3, 4, 5],
    };

    let out_bytes = encode_message(&Message::SubmitCmd(cmd.clone())).unwrap();
    assert_eq!(out_bytes.len(), 8 + 44 + 5);

    cmd.direction = Direction::In;
    cmd.data = Vec::new();
    let in_bytes = encode_message(&Message::SubmitCmd(cmd)).unwrap();
    assert_eq!(in_bytes.len(), 8 + 44);
}

#[test]
fn decode_is_inverse_of_encode_across_kinds() {
    let messages = vec![
        Message::DevlistRequest,
        Message::DevlistReply(DevlistReply::new(Vec::new())),
        Message::UnlinkCmd(UnlinkCmd {
            seqnum: 3,
            devid: (2 << 16) | 4,
            unlink_seqnum: 1,
        }),
        Message::UnlinkReply(UnlinkReply::cancelled(3, (2 << 16) | 4)),
    ];

    for msg in messages {
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes, MAX).unwrap(), msg);
    }
}
