//! Exhaustive positive space for message encoding.
//!
//! Input bytes pick one kind and serial edge; every reply serial edge and
//! payload size is then encoded and decoded. Each valid message must survive
//! a round trip unchanged, including when delivered one byte at a time.

#![no_main]

use busline_proto::{Message, MessageKind};
use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;

const ALL_KINDS: &[MessageKind] =
    &[MessageKind::MethodCall, MessageKind::MethodReturn, MessageKind::Error, MessageKind::Signal];

// Serial 0 is never valid on the wire
const SERIAL_EDGES: &[u32] = &[1, 2, 0x1000, u32::MAX / 2, u32::MAX - 1, u32::MAX];

const REPLY_SERIAL_EDGES: &[Option<u32>] = &[None, Some(1), Some(0x1000), Some(u32::MAX)];

const PAYLOAD_SIZES: &[usize] = &[0, 1, 15, 16, 17, 255, 1024];

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let kind = ALL_KINDS[data[0] as usize % ALL_KINDS.len()];
    let serial = SERIAL_EDGES[data[1] as usize % SERIAL_EDGES.len()];
    let source = &data[2..];

    for &reply_serial in REPLY_SERIAL_EDGES {
        for &size in PAYLOAD_SIZES {
            let body = if size <= source.len() { source[..size].to_vec() } else { vec![0u8; size] };
            let message = Message { kind, serial, reply_serial, body: Bytes::from(body) };

            let mut wire = BytesMut::new();
            message.encode(&mut wire).expect("valid message should encode");
            assert_eq!(wire.len(), Message::HEADER_SIZE + size);

            let mut whole = wire.clone();
            let decoded = Message::decode(&mut whole).expect("valid encoding should decode");
            assert_eq!(decoded.as_ref(), Some(&message), "round trip for {kind:?} serial={serial}");
            assert!(whole.is_empty());

            let mut trickle = BytesMut::new();
            let mut result = None;
            for &byte in wire.iter() {
                assert!(result.is_none(), "message decoded before its last byte");
                trickle.extend_from_slice(&[byte]);
                result = Message::decode(&mut trickle).expect("prefix of valid frame");
            }
            assert_eq!(result, Some(message));
        }
    }
});
