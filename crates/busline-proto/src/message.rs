//! Bus messages and their binary frame layout.
//!
//! Layout on the wire:
//!
//! ```text
//! ┌──────┬──────┬───────┬─────────┬──────────┬─────────┬──────────────┐
//! │ 'B'  │ kind │ flags │ version │ body_len │ serial  │ reply_serial │  body...
//! │ u8   │ u8   │ u8    │ u8      │ u32 BE   │ u32 BE  │ u32 BE       │
//! └──────┴──────┴───────┴─────────┴──────────┴─────────┴──────────────┘
//!  0      1      2       3         4          8         12             16
//! ```
//!
//! `reply_serial == 0` encodes "no reply serial"; serial 0 is never a valid
//! message serial, so the encoding is unambiguous.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Message kinds carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Request expecting a reply unless flagged otherwise
    MethodCall = 1,
    /// Successful reply to a method call
    MethodReturn = 2,
    /// Error reply to a method call
    Error = 3,
    /// Broadcast, never a reply
    Signal = 4,
}

impl MessageKind {
    /// Convert from the wire byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }

    /// Convert to the wire byte
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether messages of this kind can answer a method call.
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, Self::MethodReturn | Self::Error)
    }
}

/// One discrete unit of the binary wire protocol.
///
/// The body is opaque to this crate; marshalling of arguments happens above
/// the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Sender-assigned serial (non-zero on the wire)
    pub serial: u32,
    /// Serial of the method call this message answers
    pub reply_serial: Option<u32>,
    /// Opaque body bytes
    pub body: Bytes,
}

impl Message {
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 16;

    /// Endianness marker (big endian)
    pub const ENDIANNESS: u8 = b'B';

    /// Frame layout version
    pub const VERSION: u8 = 1;

    /// Largest body accepted on either side (128 MiB)
    pub const MAX_BODY_SIZE: usize = 128 * 1024 * 1024;

    /// Method call with serial unassigned (0).
    ///
    /// The connection assigns the serial just before sending.
    pub fn method_call(body: impl Into<Bytes>) -> Self {
        Self { kind: MessageKind::MethodCall, serial: 0, reply_serial: None, body: body.into() }
    }

    /// Successful reply to `reply_serial`.
    pub fn method_return(reply_serial: u32, body: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::MethodReturn,
            serial: 0,
            reply_serial: Some(reply_serial),
            body: body.into(),
        }
    }

    /// Error reply to `reply_serial`.
    pub fn error(reply_serial: u32, body: impl Into<Bytes>) -> Self {
        Self { kind: MessageKind::Error, serial: 0, reply_serial: Some(reply_serial), body: body.into() }
    }

    /// Signal with serial unassigned (0).
    pub fn signal(body: impl Into<Bytes>) -> Self {
        Self { kind: MessageKind::Signal, serial: 0, reply_serial: None, body: body.into() }
    }

    /// Set the serial, builder style.
    #[must_use]
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Whether this message answers the call with `serial`.
    ///
    /// Only method returns and errors correlate; a signal that happens to carry
    /// a reply serial never matches.
    #[must_use]
    pub fn is_reply_to(&self, serial: u32) -> bool {
        self.kind.is_reply() && self.reply_serial == Some(serial)
    }

    /// Encode the message into `dst`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ZeroSerial`] if no serial was assigned
    /// - [`ProtocolError::BodyTooLarge`] if the body exceeds
    ///   [`Message::MAX_BODY_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }

        if self.body.len() > Self::MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge {
                size: self.body.len(),
                max: Self::MAX_BODY_SIZE,
            });
        }

        dst.put_u8(Self::ENDIANNESS);
        dst.put_u8(self.kind.to_u8());
        dst.put_u8(0);
        dst.put_u8(Self::VERSION);
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(self.body.len() as u32);
        dst.put_u32(self.serial);
        dst.put_u32(self.reply_serial.unwrap_or(0));
        dst.put_slice(&self.body);

        Ok(())
    }

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the buffer does not
    /// yet hold a complete frame. On success exactly one frame is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed. Header validation happens
    /// before waiting for the body, so an oversized length is rejected without
    /// buffering it.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Self::HEADER_SIZE];
        let endianness = header.get_u8();
        let kind = header.get_u8();
        let _flags = header.get_u8();
        let version = header.get_u8();
        let body_len = header.get_u32() as usize;
        let serial = header.get_u32();
        let reply_serial = header.get_u32();

        if endianness != Self::ENDIANNESS {
            return Err(ProtocolError::InvalidEndianness(endianness));
        }

        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind = MessageKind::from_u8(kind).ok_or(ProtocolError::InvalidKind(kind))?;

        if serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }

        if body_len > Self::MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge { size: body_len, max: Self::MAX_BODY_SIZE });
        }

        if src.len() < Self::HEADER_SIZE + body_len {
            src.reserve(Self::HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let body = src.split_to(body_len).freeze();

        Ok(Some(Self {
            kind,
            serial,
            reply_serial: (reply_serial != 0).then_some(reply_serial),
            body,
        }))
    }
}
