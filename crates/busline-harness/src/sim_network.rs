//! In-memory links between a client socket and a simulated peer.
//!
//! Each link has two ways for the peer's output to reach the client:
//!
//! - **Immediate**: bytes are readable right away. Used for handshake lines,
//!   which the client reads with blocking calls on the same thread.
//! - **In flight**: chunks wait in a queue and [`SimNetwork::deliver_pass`]
//!   moves one chunk per link into the readable buffer. This is what makes
//!   frame delivery observable one dispatch pass at a time.
//!
//! A blocking read on an empty link cannot wait for anything (there is no
//! other thread to produce data), so it fails with `TimedOut` instead of
//! hanging. A non-blocking read fails with `WouldBlock`.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    io::{self, Read, Write},
    rc::Rc,
};

use busline_core::transport::{Descriptor, Socket};
use busline_proto::{Message, MessageKind};

/// The far end of a simulated link.
pub trait Peer {
    /// React to bytes written by the client.
    fn receive(&mut self, bytes: &[u8], io: &mut PeerIo);
}

/// Buffers of one link, as seen by its [`Peer`].
#[derive(Debug, Default)]
pub struct PeerIo {
    readable: VecDeque<u8>,
    in_flight: VecDeque<Vec<u8>>,
    peer_closed: bool,
    client_shutdowns: u32,
    nonblocking: bool,
    written: Vec<u8>,
    transcript: Vec<String>,
}

impl PeerIo {
    /// Make `bytes` readable by the client immediately
    pub fn reply_now(&mut self, bytes: &[u8]) {
        self.readable.extend(bytes);
    }

    /// Queue `bytes` for delivery on a later dispatch pass
    pub fn send_in_flight(&mut self, bytes: Vec<u8>) {
        self.in_flight.push_back(bytes);
    }

    /// Close the peer side; the client sees end of stream once everything
    /// already sent has been read
    pub fn close(&mut self) {
        self.peer_closed = true;
    }

    /// Append a line to the link transcript
    pub fn note(&mut self, entry: impl Into<String>) {
        self.transcript.push(entry.into());
    }

    fn at_eof(&self) -> bool {
        self.peer_closed && self.readable.is_empty() && self.in_flight.is_empty()
    }
}

struct Link {
    peer: Box<dyn Peer>,
    io: PeerIo,
}

#[derive(Default)]
struct NetworkState {
    links: BTreeMap<Descriptor, Link>,
    next_descriptor: u64,
}

/// Shared registry of simulated links.
///
/// Cheap to clone; clones refer to the same network.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl SimNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a link to `peer` and return the client end
    pub fn connect(&self, peer: impl Peer + 'static) -> SimSocket {
        let mut state = self.state.borrow_mut();
        state.next_descriptor += 1;
        let descriptor = Descriptor(state.next_descriptor);

        state.links.insert(descriptor, Link { peer: Box::new(peer), io: PeerIo::default() });

        SimSocket { network: self.clone(), descriptor }
    }

    /// Move one in-flight chunk per link into its readable buffer.
    ///
    /// Returns true if anything moved.
    pub fn deliver_pass(&self) -> bool {
        let mut delivered = false;
        for link in self.state.borrow_mut().links.values_mut() {
            if let Some(chunk) = link.io.in_flight.pop_front() {
                link.io.readable.extend(chunk);
                delivered = true;
            }
        }
        delivered
    }

    /// Whether a read on `descriptor` would return data or end of stream
    pub fn is_readable(&self, descriptor: Descriptor) -> bool {
        self.with_io(descriptor, |io| !io.readable.is_empty() || io.at_eof()).unwrap_or(false)
    }

    /// Whether any link still has chunks in flight
    pub fn has_in_flight(&self) -> bool {
        self.state.borrow().links.values().any(|link| !link.io.in_flight.is_empty())
    }

    /// Queue an encoded message from the peer, delivered on a later pass
    pub fn inject(&self, descriptor: Descriptor, message: &Message) {
        let mut bytes = Vec::new();
        if message.encode(&mut bytes).is_ok() {
            self.with_io(descriptor, |io| {
                io.note(format!("S: {}", describe(message)));
                io.send_in_flight(bytes);
            });
        }
    }

    /// Queue raw bytes from the peer, delivered on a later pass
    pub fn inject_bytes(&self, descriptor: Descriptor, bytes: &[u8]) {
        self.with_io(descriptor, |io| {
            io.note(format!("S: <{} raw bytes>", bytes.len()));
            io.send_in_flight(bytes.to_vec());
        });
    }

    /// Close the peer side of `descriptor`
    pub fn close_peer(&self, descriptor: Descriptor) {
        self.with_io(descriptor, |io| {
            io.note("S: <close>");
            io.close();
        });
    }

    /// Everything recorded on the link so far
    pub fn transcript(&self, descriptor: Descriptor) -> Vec<String> {
        self.with_io(descriptor, |io| io.transcript.clone()).unwrap_or_default()
    }

    /// Every byte the client has written on the link
    pub fn written(&self, descriptor: Descriptor) -> Vec<u8> {
        self.with_io(descriptor, |io| io.written.clone()).unwrap_or_default()
    }

    /// How many times the client shut the link down
    pub fn client_shutdowns(&self, descriptor: Descriptor) -> u32 {
        self.with_io(descriptor, |io| io.client_shutdowns).unwrap_or(0)
    }

    fn with_io<T>(&self, descriptor: Descriptor, f: impl FnOnce(&mut PeerIo) -> T) -> Option<T> {
        self.state.borrow_mut().links.get_mut(&descriptor).map(|link| f(&mut link.io))
    }
}

/// Client end of a simulated link.
pub struct SimSocket {
    network: SimNetwork,
    descriptor: Descriptor,
}

impl SimSocket {
    /// Network this socket belongs to
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "simulated link does not exist")
}

impl Read for SimSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.network.state.borrow_mut();
        let link = state.links.get_mut(&self.descriptor).ok_or_else(not_connected)?;
        let buffers = &mut link.io;

        if !buffers.nonblocking {
            while let Some(chunk) = buffers.in_flight.pop_front() {
                buffers.readable.extend(chunk);
            }
        }

        if buffers.readable.is_empty() {
            if buffers.at_eof() {
                return Ok(0);
            }
            return Err(if buffers.nonblocking {
                io::Error::new(io::ErrorKind::WouldBlock, "nothing readable")
            } else {
                io::Error::new(io::ErrorKind::TimedOut, "peer sent nothing")
            });
        }

        let n = buf.len().min(buffers.readable.len());
        for (slot, byte) in buf.iter_mut().zip(buffers.readable.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.network.state.borrow_mut();
        let link = state.links.get_mut(&self.descriptor).ok_or_else(not_connected)?;

        if link.io.client_shutdowns > 0 || link.io.peer_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated link closed"));
        }

        link.io.written.extend_from_slice(buf);
        link.peer.receive(buf, &mut link.io);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for SimSocket {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.network
            .with_io(self.descriptor, |io| io.nonblocking = nonblocking)
            .ok_or_else(not_connected)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.network
            .with_io(self.descriptor, |io| {
                io.client_shutdowns += 1;
                io.note("C: <shutdown>");
            })
            .ok_or_else(not_connected)
    }

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }
}

/// One-line rendering of a message for transcripts
pub fn describe(message: &Message) -> String {
    let kind = match message.kind {
        MessageKind::MethodCall => "method_call",
        MessageKind::MethodReturn => "method_return",
        MessageKind::Error => "error",
        MessageKind::Signal => "signal",
    };

    let mut line = format!("{kind} serial={}", message.serial);
    if let Some(reply_serial) = message.reply_serial {
        line.push_str(&format!(" reply_serial={reply_serial}"));
    }
    if !message.body.is_empty() {
        line.push_str(&format!(" body={}", String::from_utf8_lossy(&message.body)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes every write back, in flight
    struct Echo;

    impl Peer for Echo {
        fn receive(&mut self, bytes: &[u8], io: &mut PeerIo) {
            io.send_in_flight(bytes.to_vec());
        }
    }

    #[test]
    fn blocking_read_pulls_in_flight_data() {
        let network = SimNetwork::new();
        let mut socket = network.connect(Echo);

        socket.write_all(b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        let err = socket.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn nonblocking_read_waits_for_delivery_pass() {
        let network = SimNetwork::new();
        let mut socket = network.connect(Echo);
        socket.set_nonblocking(true).unwrap();

        socket.write_all(b"a").unwrap();
        socket.write_all(b"b").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert!(!network.is_readable(socket.descriptor()));

        assert!(network.deliver_pass());
        assert!(network.is_readable(socket.descriptor()));
        assert_eq!(socket.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'a');

        assert!(network.deliver_pass());
        assert!(!network.deliver_pass());
    }

    #[test]
    fn peer_close_reads_as_eof_after_pending_data() {
        let network = SimNetwork::new();
        let mut socket = network.connect(Echo);
        socket.set_nonblocking(true).unwrap();
        let descriptor = socket.descriptor();

        network.inject_bytes(descriptor, b"xy");
        network.close_peer(descriptor);
        assert!(!network.is_readable(descriptor));

        network.deliver_pass();
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).unwrap(), 2);
        assert_eq!(socket.read(&mut buf).unwrap(), 0);
        assert!(socket.write_all(b"z").is_err());
    }

    #[test]
    fn shutdown_is_counted() {
        let network = SimNetwork::new();
        let mut socket = network.connect(Echo);

        socket.shutdown().unwrap();
        assert_eq!(network.client_shutdowns(socket.descriptor()), 1);
        assert_eq!(network.transcript(socket.descriptor()), ["C: <shutdown>"]);
    }

    #[test]
    fn describe_renders_kind_and_serials() {
        let message = Message::method_return(4, &b"pong"[..]).with_serial(9);
        assert_eq!(describe(&message), "method_return serial=9 reply_serial=4 body=pong");
        assert_eq!(describe(&Message::signal(&b""[..]).with_serial(1)), "signal serial=1");
    }
}
