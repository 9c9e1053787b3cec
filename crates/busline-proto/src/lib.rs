//! # Busline Protocol: Wire Vocabulary
//!
//! This crate holds the two wire-level vocabularies spoken by a busline
//! client:
//!
//! - **Handshake lines**: the text commands the client issues before binary
//!   framing begins ([`ClientCommand`]) and the replies it classifies
//!   ([`ServerReply`]).
//! - **Message frames**: the binary unit exchanged once the handshake has
//!   finished ([`Message`]), with a streaming encoder/decoder.
//!
//! ## Implementation Notes
//!
//! - **No State**: Nothing in here remembers anything between calls. The
//!   handshake state machine and reply correlation live in `busline-core`.
//!
//! - **Streaming Decode**: [`Message::decode`] never consumes bytes from an
//!   incomplete frame. A partially received frame stays in the caller's buffer
//!   until the rest arrives.
//!
//! - **Serial Zero**: A serial of `0` means "no reply expected" and is never a
//!   valid message serial. The frame layout reuses it to encode an absent
//!   reply serial.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod command;
pub mod errors;
pub mod message;

pub use command::{ClientCommand, ServerReply};
pub use errors::{ProtocolError, Result};
pub use message::{Message, MessageKind};
