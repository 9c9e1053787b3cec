//! Wire codec contract.
//!
//! The connection never looks at frame bytes itself. It asks a [`WireCodec`]
//! to turn outgoing messages into bytes and to pull complete messages out of
//! the transport's read buffer.

use busline_proto::{Message, ProtocolError};
use bytes::BytesMut;

use crate::{
    error::ConnectionError,
    transport::{Fill, Transport},
};

/// Encoder/decoder between [`Message`] values and the byte stream.
pub trait WireCodec {
    /// Serialize one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the message cannot be represented on the
    /// wire (e.g. serial 0 or an oversized body).
    fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError>;

    /// Take one complete message off the front of `buffer`.
    ///
    /// Returns `Ok(None)` without consuming anything when `buffer` holds only
    /// part of a frame.
    fn decode(&self, buffer: &mut BytesMut) -> Result<Option<Message>, ProtocolError>;

    /// Decode one message from the transport without blocking.
    ///
    /// Tries the buffered bytes first and reads from the transport only when
    /// they do not hold a full frame.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Protocol`] on a malformed frame
    /// - [`ConnectionError::Transport`] if the read fails
    /// - [`ConnectionError::PeerClosed`] if the stream ended, including in
    ///   the middle of a frame
    fn decode_nonblocking(
        &self,
        transport: &mut dyn Transport,
    ) -> Result<Option<Message>, ConnectionError> {
        loop {
            if let Some(message) = self.decode(transport.read_buffer())? {
                return Ok(Some(message));
            }

            match transport.fill()? {
                Fill::Read(_) => continue,
                Fill::WouldBlock => return Ok(None),
                Fill::Eof => return Err(ConnectionError::PeerClosed),
            }
        }
    }
}

/// Default codec: the [`busline_proto::message`] frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl WireCodec for FrameCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = Vec::with_capacity(Message::HEADER_SIZE + message.body.len());
        message.encode(&mut bytes)?;
        Ok(bytes)
    }

    fn decode(&self, buffer: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        Message::decode(buffer)
    }
}
