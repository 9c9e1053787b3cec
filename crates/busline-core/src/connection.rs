//! Connection object: handshake driver, serials, and reply correlation.
//!
//! A [`Connection`] owns one transport and talks to a shared [`EventBase`]
//! through a non-owning handle.
//!
//! # Lifecycle
//!
//! ```text
//! ┌───────────┐  authenticate / handshake  ┌────────┐   close / drop   ┌────────┐
//! │ Handshake │───────────────────────────>│ Active │─────────────────>│ Closed │
//! └───────────┘   (line mode, blocking)    └────────┘   (frame mode)   └────────┘
//!       │                                                                  ↑
//!       └─────────────────── close / drop / failed handshake ──────────────┘
//! ```
//!
//! A handshake that fails after the first byte was written closes the
//! connection: the transport is mid-conversation and cannot be reused.
//!
//! In `Handshake` the transport is read and written one line at a time. On
//! success the connection switches the transport to frame mode and registers
//! a read handler with the event base ([`Connection::activate_io`]). From then
//! on the handler appends every decoded message to the pending queue, and
//! [`Connection::wait_for_reply`] claims replies from it.
//!
//! # Waiting
//!
//! `wait_for_reply` alternates between scanning the pending queue and running
//! exactly one [`EventBase::dispatch_once`] pass. Other handlers on the same
//! event base run during that pass, so waiting on one connection keeps every
//! other registered connection serviced. A second wait on the *same*
//! connection from inside a handler is not supported.

use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc, time::Duration};

use busline_proto::{ClientCommand, Message, ServerReply};

use crate::{
    address::ServerAddress,
    auth::{AuthAction, Authenticator, mechanisms_from_probe},
    codec::{FrameCodec, WireCodec},
    config::{ConnectionConfig, DuplicateUuidPolicy},
    env::Environment,
    error::{AuthError, ConnectionError, DuplicateServerUuid},
    event::{EventBase, ReadOutcome},
    mechanism::{Mechanism, MechanismRegistry},
    serial::SerialGenerator,
    transport::{Descriptor, Transport},
};

/// Byte written before the first handshake line.
pub const CREDENTIALS_BYTE: u8 = 0;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; transport in line mode
    Handshake,
    /// Authenticated with the read handler registered
    Active,
    /// Transport released
    Closed,
}

/// State shared with the read handler.
struct Channel {
    transport: Box<dyn Transport>,
    codec: Box<dyn WireCodec>,
    pending: VecDeque<Message>,
    failure: Option<ConnectionError>,
}

impl Channel {
    fn receive_no_hang(&mut self) -> Result<Option<Message>, ConnectionError> {
        self.codec.decode_nonblocking(self.transport.as_mut())
    }

    /// Move every immediately available message into the pending queue.
    fn pump(&mut self) -> ReadOutcome {
        if self.failure.is_some() {
            return ReadOutcome::Done;
        }

        let mut received = 0usize;
        loop {
            match self.receive_no_hang() {
                Ok(Some(message)) => {
                    tracing::trace!(
                        kind = ?message.kind,
                        serial = message.serial,
                        reply_serial = ?message.reply_serial,
                        "message queued"
                    );
                    self.pending.push_back(message);
                    received += 1;
                },
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, pending = self.pending.len(), "read handler failed");
                    self.failure = Some(error);
                    return ReadOutcome::Done;
                },
            }
        }

        if received == 0 { ReadOutcome::Idle } else { ReadOutcome::Progress }
    }

    fn take_reply(&mut self, serial: u32) -> Option<Message> {
        let index = self.pending.iter().position(|message| message.is_reply_to(serial))?;
        self.pending.remove(index)
    }
}

/// One logical channel to a message-bus broker.
///
/// Driven from a single execution context; see [`crate::handle`] for sharing
/// a connection with async callers.
pub struct Connection {
    server_address: ServerAddress,
    server_uuid: Option<String>,
    serials: SerialGenerator,
    unix_fd_passing: bool,
    state: ConnectionState,
    config: ConnectionConfig,
    credentials_sent: bool,
    authenticated: bool,
    descriptor: Descriptor,
    channel: Rc<RefCell<Channel>>,
    event_base: Rc<dyn EventBase>,
}

impl Connection {
    /// Wrap a freshly connected transport.
    ///
    /// If the address carries a `guid=` parameter, that value is recorded as
    /// the server UUID up front, so a server reporting a different one during
    /// the handshake is caught as a [`DuplicateServerUuid`].
    pub fn new(
        server_address: ServerAddress,
        transport: Box<dyn Transport>,
        event_base: Rc<dyn EventBase>,
    ) -> Self {
        let descriptor = transport.descriptor();
        let server_uuid = server_address.guid();

        Self {
            server_address,
            server_uuid,
            serials: SerialGenerator::new(),
            unix_fd_passing: false,
            state: ConnectionState::Handshake,
            config: ConnectionConfig::default(),
            credentials_sent: false,
            authenticated: false,
            descriptor,
            channel: Rc::new(RefCell::new(Channel {
                transport,
                codec: Box::new(FrameCodec),
                pending: VecDeque::new(),
                failure: None,
            })),
            event_base,
        }
    }

    /// Use `config` for the handshake
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`FrameCodec`]
    #[must_use]
    pub fn with_codec(self, codec: Box<dyn WireCodec>) -> Self {
        self.channel.borrow_mut().codec = codec;
        self
    }

    /// Address this connection was opened on
    pub fn server_address(&self) -> &ServerAddress {
        &self.server_address
    }

    /// GUID reported by the server, if known yet
    pub fn server_uuid(&self) -> Option<&str> {
        self.server_uuid.as_deref()
    }

    /// Whether the server agreed to file-descriptor passing
    pub fn unix_fd_passing_supported(&self) -> bool {
        self.unix_fd_passing
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Descriptor registered with the event base
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Handshake settings in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the current serial and advance, wrapping past `u32::MAX` to 1.
    pub fn next_serial(&mut self) -> u32 {
        self.serials.next_serial()
    }

    // -------------------------------------------------------------------------
    // Server UUID
    // -------------------------------------------------------------------------

    /// Record the server GUID.
    ///
    /// Assigning the value already recorded is a no-op.
    ///
    /// # Errors
    ///
    /// [`DuplicateServerUuid`] if a different value is already recorded. The
    /// stored value is left unchanged; call
    /// [`Connection::replace_server_uuid`] to continue with the new one.
    pub fn assign_server_uuid(&mut self, uuid: impl Into<String>) -> Result<(), DuplicateServerUuid> {
        let uuid = uuid.into();
        match &self.server_uuid {
            None => {
                self.server_uuid = Some(uuid);
                Ok(())
            },
            Some(previous) if *previous == uuid => Ok(()),
            Some(previous) => {
                Err(DuplicateServerUuid { previous: previous.clone(), proposed: uuid })
            },
        }
    }

    /// Overwrite the server GUID unconditionally
    pub fn replace_server_uuid(&mut self, uuid: impl Into<String>) {
        self.server_uuid = Some(uuid.into());
    }

    fn record_server_uuid(&mut self, uuid: String) -> Result<(), ConnectionError> {
        let Err(duplicate) = self.assign_server_uuid(uuid) else {
            return Ok(());
        };

        match self.config.on_duplicate_uuid {
            DuplicateUuidPolicy::Overwrite => {
                tracing::warn!(
                    previous = %duplicate.previous,
                    proposed = %duplicate.proposed,
                    "server uuid changed, keeping the new value"
                );
                self.replace_server_uuid(duplicate.proposed);
                Ok(())
            },
            DuplicateUuidPolicy::Reject => Err(AuthError::from(duplicate).into()),
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Run the whole handshake with the configured candidates.
    ///
    /// With an empty [`ConnectionConfig::mechanisms`] list the server is asked
    /// for its mechanisms first ([`Connection::discover_mechanisms`]).
    ///
    /// # Errors
    ///
    /// See [`Connection::authenticate`]; additionally
    /// [`ConnectionError::Config`] for an invalid configuration, which is
    /// reported before anything is written and leaves the connection open.
    pub fn handshake(&mut self, registry: &MechanismRegistry) -> Result<(), ConnectionError> {
        self.config.validate()?;

        let candidates = if self.config.mechanisms.is_empty() {
            self.discover_mechanisms(registry)?
        } else {
            registry.resolve(&self.config.mechanisms)
        };

        self.authenticate(candidates)
    }

    /// Ask the server which mechanisms it supports.
    ///
    /// Sends an `AUTH` line without a mechanism and wraps every name in the
    /// `REJECTED` reply, falling back to a pass-through mechanism for names
    /// the registry does not know.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Transport`] on I/O failure
    /// - [`AuthError::Authentication`] if the reply is not `REJECTED`
    ///
    /// Either failure closes the connection.
    pub fn discover_mechanisms(
        &mut self,
        registry: &MechanismRegistry,
    ) -> Result<Vec<Box<dyn Mechanism>>, ConnectionError> {
        self.ensure_handshake()?;
        let result = self.probe_mechanisms(registry);
        self.settle_handshake(result)
    }

    fn probe_mechanisms(
        &mut self,
        registry: &MechanismRegistry,
    ) -> Result<Vec<Box<dyn Mechanism>>, ConnectionError> {
        self.send_credentials_byte()?;
        self.write_command(&ClientCommand::probe())?;

        let reply = self.read_reply()?;
        Ok(mechanisms_from_probe(&reply, registry)?)
    }

    /// Authenticate with `candidates` tried in order, then activate I/O.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Transport`] on I/O failure
    /// - [`ConnectionError::Auth`] when the handshake fails
    /// - [`ConnectionError::AlreadyAuthenticated`] or
    ///   [`ConnectionError::Closed`] outside the handshake state
    ///
    /// Transport and authentication failures close the connection; a later
    /// attempt fails with [`ConnectionError::Closed`].
    pub fn authenticate(&mut self, candidates: Vec<Box<dyn Mechanism>>) -> Result<(), ConnectionError> {
        self.ensure_handshake()?;
        let result = self.run_authentication(candidates);
        self.settle_handshake(result)
    }

    fn run_authentication(&mut self, candidates: Vec<Box<dyn Mechanism>>) -> Result<(), ConnectionError> {
        self.send_credentials_byte()?;

        let mut auth = Authenticator::new(candidates, self.config.negotiate_unix_fd);
        let mut actions = auth.start()?;

        loop {
            for action in actions {
                self.execute(action)?;
            }

            if auth.is_authenticated() {
                break;
            }

            let reply = self.read_reply()?;
            actions = auth.handle_reply(reply)?;
        }

        tracing::info!(
            address = %self.server_address,
            server_uuid = self.server_uuid.as_deref().unwrap_or(""),
            unix_fd = self.unix_fd_passing,
            "connection authenticated"
        );

        self.authenticated = true;
        self.activate_io()
    }

    /// Close the connection if a handshake step failed.
    fn settle_handshake<T>(&mut self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        if let Err(error) = &result {
            tracing::warn!(address = %self.server_address, %error, "handshake failed");
            if let Err(close_error) = self.close() {
                tracing::debug!(error = %close_error, "close after failed handshake");
            }
        }
        result
    }

    fn execute(&mut self, action: AuthAction) -> Result<(), ConnectionError> {
        match action {
            AuthAction::Send(command) => self.write_command(&command),
            AuthAction::AssignServerUuid(uuid) => self.record_server_uuid(uuid),
            AuthAction::UnixFdNegotiated(agreed) => {
                self.unix_fd_passing = agreed;
                Ok(())
            },
            // Consumed inside the authenticator
            AuthAction::SelectMechanism | AuthAction::FeedChallenge(_) => Ok(()),
        }
    }

    fn send_credentials_byte(&mut self) -> Result<(), ConnectionError> {
        if !self.credentials_sent {
            self.channel.borrow_mut().transport.write_all(&[CREDENTIALS_BYTE])?;
            self.credentials_sent = true;
        }
        Ok(())
    }

    fn write_command(&mut self, command: &ClientCommand) -> Result<(), ConnectionError> {
        let line = command.to_line()?;
        tracing::debug!(command = command.name(), "handshake command");
        self.channel.borrow_mut().transport.write_line(&line)?;
        Ok(())
    }

    fn read_reply(&mut self) -> Result<ServerReply, ConnectionError> {
        let line = self.channel.borrow_mut().transport.read_line()?;
        Ok(ServerReply::parse(&line))
    }

    /// Switch the transport to frame mode and register the read handler.
    ///
    /// Called by [`Connection::authenticate`] once `BEGIN` is sent. Frames
    /// that arrived together with the last handshake line are queued
    /// immediately.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotActive`] before authentication completed
    /// - [`ConnectionError::AlreadyAuthenticated`] or
    ///   [`ConnectionError::Closed`] outside the handshake state
    /// - [`ConnectionError::Transport`] if the transport or event base refuses
    pub fn activate_io(&mut self) -> Result<(), ConnectionError> {
        self.ensure_handshake()?;
        if !self.authenticated {
            return Err(ConnectionError::NotActive);
        }
        self.channel.borrow_mut().transport.enter_frame_mode()?;

        let channel = Rc::downgrade(&self.channel);
        self.event_base.register_read_handler(
            self.descriptor,
            Box::new(move || {
                let Some(channel) = channel.upgrade() else {
                    return ReadOutcome::Done;
                };
                let Ok(mut channel) = channel.try_borrow_mut() else {
                    return ReadOutcome::Idle;
                };
                channel.pump()
            }),
        )?;
        self.state = ConnectionState::Active;

        self.channel.borrow_mut().pump();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Message exchange
    // -------------------------------------------------------------------------

    /// Write already encoded bytes and flush.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Transport`] if the write fails
    /// - [`ConnectionError::NotActive`] or [`ConnectionError::Closed`]
    ///   outside the active state
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_active()?;
        self.channel.borrow_mut().transport.write_all(bytes)?;
        Ok(())
    }

    /// Encode and send `message` as is.
    ///
    /// The message is not tracked; correlate its reply by the serial it
    /// carries.
    ///
    /// # Errors
    ///
    /// As [`Connection::send`], plus [`ConnectionError::Protocol`] if the
    /// message cannot be encoded (e.g. serial 0).
    pub fn send_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        self.ensure_active()?;
        let bytes = self.channel.borrow().codec.encode(message)?;
        self.send(&bytes)
    }

    /// Assign the next serial to `message`, send it, and return the serial.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_message`].
    pub fn send_request(&mut self, message: Message) -> Result<u32, ConnectionError> {
        self.ensure_active()?;
        let serial = self.next_serial();
        self.send_message(&message.with_serial(serial))?;
        Ok(serial)
    }

    /// Send `message` and block until its reply arrives.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`] and [`Connection::wait_for_reply`].
    pub fn call(&mut self, message: Message) -> Result<Message, ConnectionError> {
        let serial = self.send_request(message)?;
        self.wait_for_reply(serial)
    }

    /// Decode one message straight from the transport without blocking.
    ///
    /// Bypasses the pending queue.
    ///
    /// # Errors
    ///
    /// The read handler's recorded failure, or a fresh transport/protocol
    /// error.
    pub fn receive_no_hang(&mut self) -> Result<Option<Message>, ConnectionError> {
        self.ensure_active()?;
        let mut channel = self.channel.borrow_mut();
        if let Some(failure) = &channel.failure {
            return Err(failure.clone());
        }
        channel.receive_no_hang()
    }

    /// Block until the reply to `serial` arrives, remove it from the pending
    /// queue, and return it.
    ///
    /// Only method returns and errors match. Each unmatched scan is followed
    /// by exactly one dispatch pass. There is no deadline; see
    /// [`Connection::wait_for_reply_within`].
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidSerial`] for serial 0
    /// - the read handler's failure once the queue holds no match
    /// - [`ConnectionError::Transport`] if the event base fails
    pub fn wait_for_reply(&mut self, serial: u32) -> Result<Message, ConnectionError> {
        loop {
            if let Some(reply) = self.poll_reply(serial)? {
                return Ok(reply);
            }
            self.event_base.dispatch_once()?;
        }
    }

    /// [`Connection::wait_for_reply`] with a deadline checked between
    /// dispatch passes.
    ///
    /// A reply already queued is returned even with a zero timeout.
    ///
    /// # Errors
    ///
    /// As [`Connection::wait_for_reply`], plus
    /// [`ConnectionError::ReplyTimeout`] once `timeout` has elapsed.
    pub fn wait_for_reply_within<E: Environment>(
        &mut self,
        serial: u32,
        env: &E,
        timeout: Duration,
    ) -> Result<Message, ConnectionError> {
        let start = env.now();
        loop {
            if let Some(reply) = self.poll_reply(serial)? {
                return Ok(reply);
            }

            let elapsed = env.now() - start;
            if elapsed >= timeout {
                tracing::debug!(serial, ?elapsed, "reply deadline passed");
                return Err(ConnectionError::ReplyTimeout { serial, elapsed });
            }

            self.event_base.dispatch_once()?;
        }
    }

    fn poll_reply(&mut self, serial: u32) -> Result<Option<Message>, ConnectionError> {
        if serial == 0 {
            return Err(ConnectionError::InvalidSerial);
        }
        self.ensure_active()?;

        let mut channel = self.channel.borrow_mut();
        if let Some(reply) = channel.take_reply(serial) {
            return Ok(Some(reply));
        }

        match &channel.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(None),
        }
    }

    /// Remove and return every queued message in arrival order.
    pub fn drain_pending(&mut self) -> Vec<Message> {
        self.channel.borrow_mut().pending.drain(..).collect()
    }

    /// Number of queued messages
    pub fn pending_len(&self) -> usize {
        self.channel.borrow().pending.len()
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Deregister the read handler and release the transport.
    ///
    /// Safe to call more than once; only the first call touches the
    /// transport.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Transport`] if flushing or shutting the stream down
    /// fails. The connection is closed either way.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        if self.state == ConnectionState::Active {
            self.event_base.deregister(self.descriptor);
        }
        self.state = ConnectionState::Closed;

        tracing::debug!(address = %self.server_address, "closing connection");
        self.channel.borrow_mut().transport.close()?;
        Ok(())
    }

    fn ensure_handshake(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Handshake => Ok(()),
            ConnectionState::Active => Err(ConnectionError::AlreadyAuthenticated),
            ConnectionState::Closed => Err(ConnectionError::Closed),
        }
    }

    fn ensure_active(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Active => Ok(()),
            ConnectionState::Handshake => Err(ConnectionError::NotActive),
            ConnectionState::Closed => Err(ConnectionError::Closed),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::warn!(%error, "failed to close connection on drop");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server_address", &self.server_address)
            .field("server_uuid", &self.server_uuid)
            .field("state", &self.state)
            .field("next_serial", &self.serials.peek())
            .field("unix_fd_passing", &self.unix_fd_passing)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}
