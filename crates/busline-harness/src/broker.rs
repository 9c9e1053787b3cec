//! Scripted broker peer.
//!
//! Plays the server side of a simulated link: answers handshake lines, then
//! switches to frame mode after `BEGIN` and answers method calls through a
//! [`FrameResponder`]. Everything it sees and says is written to the link
//! transcript:
//!
//! ```text
//! C: <NUL>
//! C: AUTH EXTERNAL 31303030
//! S: OK 0123abcd
//! C: BEGIN
//! C: method_call serial=1 body=ping
//! S: method_return serial=1 reply_serial=1 body=ping
//! ```

use std::collections::VecDeque;

use busline_proto::{Message, MessageKind};
use bytes::BytesMut;

use crate::sim_network::{Peer, PeerIo, describe};

/// Produces the broker's answers to one decoded client message.
///
/// Returned messages get broker serials assigned and are each delivered on
/// their own dispatch pass, in order.
pub type FrameResponder = Box<dyn FnMut(&Message) -> Vec<Message>>;

/// How handshake lines are answered.
enum Handshake {
    /// One canned reply per client line (except `BEGIN`)
    Replies(VecDeque<String>),
    /// Behave like a broker that supports `mechanisms`
    Rules { mechanisms: Vec<String>, guid: String, unix_fd: bool },
}

impl Handshake {
    fn respond(&mut self, line: &str) -> Option<String> {
        match self {
            Self::Replies(replies) => replies.pop_front(),
            Self::Rules { mechanisms, guid, unix_fd } => {
                let rejected = || format!("REJECTED {}", mechanisms.join(" "));
                let (command, argument) = line.split_once(' ').unwrap_or((line, ""));

                Some(match command {
                    "AUTH" => {
                        let (mechanism, response) =
                            argument.split_once(' ').unwrap_or((argument, ""));
                        if !mechanisms.iter().any(|m| m == mechanism) {
                            rejected()
                        } else if response.is_empty() {
                            "DATA".to_string()
                        } else {
                            format!("OK {guid}")
                        }
                    },
                    "DATA" => format!("OK {guid}"),
                    "CANCEL" | "ERROR" => rejected(),
                    "NEGOTIATE_UNIX_FD" if *unix_fd => "AGREE_UNIX_FD".to_string(),
                    "NEGOTIATE_UNIX_FD" => "ERROR unix fd passing unsupported".to_string(),
                    _ => "ERROR unknown command".to_string(),
                })
            },
        }
    }
}

/// Server side of a simulated link.
pub struct ScriptedBroker {
    handshake: Handshake,
    responder: FrameResponder,
    credentials_seen: bool,
    framing: bool,
    line: Vec<u8>,
    frames: BytesMut,
    next_serial: u32,
}

impl ScriptedBroker {
    /// Broker that answers each handshake line with the next canned reply.
    ///
    /// When the replies run out the broker goes silent, and the client's
    /// next blocking read fails.
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_handshake(Handshake::Replies(replies.into_iter().map(Into::into).collect()))
    }

    /// Broker that supports `mechanisms` and identifies itself with `guid`.
    ///
    /// A supported mechanism with an initial response is accepted at once;
    /// without one the broker sends an empty `DATA` challenge and accepts the
    /// answer. File-descriptor passing is agreed.
    pub fn accepting<I, S>(mechanisms: I, guid: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_handshake(Handshake::Rules {
            mechanisms: mechanisms.into_iter().map(Into::into).collect(),
            guid: guid.into(),
            unix_fd: true,
        })
    }

    fn with_handshake(handshake: Handshake) -> Self {
        Self {
            handshake,
            responder: echo(),
            credentials_seen: false,
            framing: false,
            line: Vec::new(),
            frames: BytesMut::new(),
            next_serial: 1,
        }
    }

    /// Refuse file-descriptor passing (rule-based brokers only)
    #[must_use]
    pub fn without_unix_fd(mut self) -> Self {
        if let Handshake::Rules { unix_fd, .. } = &mut self.handshake {
            *unix_fd = false;
        }
        self
    }

    /// Answer frames with `responder` instead of echoing method calls
    #[must_use]
    pub fn responding(mut self, responder: FrameResponder) -> Self {
        self.responder = responder;
        self
    }

    fn receive_line_bytes(&mut self, bytes: &[u8], io: &mut PeerIo) {
        let mut rest = bytes;

        while let Some((&byte, tail)) = rest.split_first() {
            rest = tail;

            if !self.credentials_seen {
                self.credentials_seen = true;
                if byte == 0 {
                    io.note("C: <NUL>");
                    continue;
                }
                io.note("C: <missing NUL>");
            }

            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }

            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\r');
            io.note(format!("C: {line}"));

            if line == "BEGIN" {
                self.framing = true;
                self.receive_frame_bytes(rest, io);
                return;
            }

            if let Some(reply) = self.handshake.respond(line) {
                io.note(format!("S: {reply}"));
                io.reply_now(format!("{reply}\r\n").as_bytes());
            }
        }
    }

    fn receive_frame_bytes(&mut self, bytes: &[u8], io: &mut PeerIo) {
        self.frames.extend_from_slice(bytes);

        loop {
            match Message::decode(&mut self.frames) {
                Ok(Some(message)) => {
                    io.note(format!("C: {}", describe(&message)));
                    for reply in (self.responder)(&message) {
                        self.send(reply, io);
                    }
                },
                Ok(None) => return,
                Err(error) => {
                    io.note(format!("C: <malformed frame: {error}>"));
                    io.close();
                    return;
                },
            }
        }
    }

    fn send(&mut self, message: Message, io: &mut PeerIo) {
        let message = message.with_serial(self.next_serial);
        self.next_serial = self.next_serial.checked_add(1).unwrap_or(1);

        let mut bytes = Vec::new();
        match message.encode(&mut bytes) {
            Ok(()) => {
                io.note(format!("S: {}", describe(&message)));
                io.send_in_flight(bytes);
            },
            Err(error) => io.note(format!("S: <unencodable reply: {error}>")),
        }
    }
}

impl Peer for ScriptedBroker {
    fn receive(&mut self, bytes: &[u8], io: &mut PeerIo) {
        if self.framing {
            self.receive_frame_bytes(bytes, io);
        } else {
            self.receive_line_bytes(bytes, io);
        }
    }
}

/// Reply to every method call with a method return carrying the same body.
pub fn echo() -> FrameResponder {
    Box::new(|message| match message.kind {
        MessageKind::MethodCall => {
            vec![Message::method_return(message.serial, message.body.clone())]
        },
        _ => Vec::new(),
    })
}

/// Never answer.
pub fn silent() -> FrameResponder {
    Box::new(|_| Vec::new())
}
