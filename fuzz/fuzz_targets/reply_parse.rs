//! Arbitrary handshake lines through the reply parser.
//!
//! Parsing is total: any line yields some reply, and the command it reports
//! is always the first word of the line once the line ending is stripped.

#![no_main]

use busline_proto::ServerReply;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let reply = ServerReply::parse(line);
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let first_word = trimmed.split(' ').next().unwrap_or("");
    assert_eq!(reply.command(), first_word);
});
