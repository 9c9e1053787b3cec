//! Transport abstraction for the connection's byte stream.
//!
//! A transport is used in two regimes that never overlap in time:
//!
//! - **Line mode** (handshake): blocking [`Transport::read_line`] and
//!   [`Transport::write_all`].
//! - **Frame mode** (after `BEGIN`): non-blocking [`Transport::fill`] into the
//!   transport's read buffer, from which the wire codec decodes messages.
//!
//! Both regimes share one read buffer, so bytes that arrive right behind the
//! last handshake line are not lost when framing starts.
//!
//! # Implementations
//!
//! - [`StreamTransport`]: any [`Socket`] (Unix or TCP stream in production, an
//!   in-memory socket in the simulation harness)

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
};

use bytes::BytesMut;

/// Longest handshake line accepted before giving up on the peer.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Key identifying a pollable transport to the event base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(pub u64);

/// Outcome of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// This many bytes were appended to the read buffer
    Read(usize),
    /// Nothing available right now
    WouldBlock,
    /// Peer closed the stream
    Eof,
}

/// Byte-stream handle owned by a connection.
pub trait Transport {
    /// Write every byte and flush.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the connection is unusable afterwards.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Block until one full line has arrived and return it without the line
    /// terminator.
    ///
    /// # Errors
    ///
    /// - `UnexpectedEof` if the peer closes mid-handshake
    /// - `InvalidData` if the line is not UTF-8 or exceeds
    ///   [`MAX_LINE_LENGTH`]
    fn read_line(&mut self) -> io::Result<String>;

    /// Switch the stream to non-blocking reads for frame mode.
    fn enter_frame_mode(&mut self) -> io::Result<()>;

    /// Read whatever is available into [`Transport::read_buffer`] without
    /// blocking.
    fn fill(&mut self) -> io::Result<Fill>;

    /// Bytes received but not yet consumed
    fn read_buffer(&mut self) -> &mut BytesMut;

    /// Key for registering with the event base
    fn descriptor(&self) -> Descriptor;

    /// Flush and shut the stream down.
    fn close(&mut self) -> io::Result<()>;

    /// Write one handshake line followed by `\r\n`.
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(busline_proto::command::LINE_ENDING.as_bytes());
        self.write_all(&bytes)
    }
}

/// Stream socket the [`StreamTransport`] can drive.
pub trait Socket: Read + Write {
    /// Toggle non-blocking reads
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Shut down both directions
    fn shutdown(&mut self) -> io::Result<()>;

    /// Key for registering with the event base
    fn descriptor(&self) -> Descriptor;
}

#[cfg(unix)]
impl Socket for std::os::unix::net::UnixStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn descriptor(&self) -> Descriptor {
        use std::os::fd::AsRawFd;
        Descriptor(self.as_raw_fd() as u64)
    }
}

impl Socket for TcpStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    #[cfg(unix)]
    fn descriptor(&self) -> Descriptor {
        use std::os::fd::AsRawFd;
        Descriptor(self.as_raw_fd() as u64)
    }

    #[cfg(windows)]
    fn descriptor(&self) -> Descriptor {
        use std::os::windows::io::AsRawSocket;
        Descriptor(self.as_raw_socket())
    }
}

/// [`Transport`] over a [`Socket`].
#[derive(Debug)]
pub struct StreamTransport<S> {
    socket: S,
    buffer: BytesMut,
    closed: bool,
}

impl<S: Socket> StreamTransport<S> {
    /// Wrap a connected socket. The socket must be in blocking mode.
    pub fn new(socket: S) -> Self {
        Self { socket, buffer: BytesMut::with_capacity(READ_CHUNK), closed: false }
    }

    /// Underlying socket
    pub fn socket(&self) -> &S {
        &self.socket
    }

    fn take_line(&mut self) -> io::Result<Option<String>> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_LINE_LENGTH {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "handshake line too long"));
            }
            return Ok(None);
        };

        let line = self.buffer.split_to(end + 1);
        let line = line.strip_suffix(b"\n").unwrap_or(&line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "handshake line is not UTF-8"))
    }

    fn read_chunk(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: Socket> Transport for StreamTransport<S> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.socket.write_all(bytes)?;
        self.socket.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }

            if self.read_chunk()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the stream during the handshake",
                ));
            }
        }
    }

    fn enter_frame_mode(&mut self) -> io::Result<()> {
        self.socket.set_nonblocking(true)
    }

    fn fill(&mut self) -> io::Result<Fill> {
        match self.read_chunk() {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => Ok(Fill::Read(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    fn descriptor(&self) -> Descriptor {
        self.socket.descriptor()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = self.socket.flush();
        match self.socket.shutdown() {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
            _ => {},
        }
        flushed
    }
}
