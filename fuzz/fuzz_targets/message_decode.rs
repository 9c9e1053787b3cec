//! Random bytes through the streaming frame decoder.
//!
//! The decoder must never panic, must consume nothing when it returns
//! `Ok(None)`, and every message it yields must re-encode to the exact bytes
//! it was decoded from.

#![no_main]

use busline_proto::Message;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    loop {
        let before = buf.clone();
        match Message::decode(&mut buf) {
            Ok(Some(message)) => {
                let consumed = before.len() - buf.len();
                let mut encoded = Vec::new();
                message.encode(&mut encoded).expect("decoded message should re-encode");

                // Flags byte is ignored on decode and written as 0
                assert_eq!(encoded[..2], before[..2]);
                assert_eq!(encoded[3..], before[3..consumed]);
            },
            Ok(None) => {
                assert_eq!(buf, before, "incomplete frame must not be consumed");
                break;
            },
            Err(_) => break,
        }
    }
});
