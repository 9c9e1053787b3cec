//! Authentication handshake state machine.
//!
//! The handshake is a line-oriented, server-driven negotiation that runs
//! before binary framing starts. It is split in two layers:
//!
//! - [`transition`]: a pure function `(state, event) -> (state, actions)` that
//!   encodes the protocol table. No mechanism, no transport, no connection.
//! - [`Authenticator`]: a sans-IO driver that owns the candidate mechanisms,
//!   feeds mechanism outcomes back into [`transition`], and hands the caller
//!   only the actions that need the outside world.
//!
//! # State Machine
//!
//! ```text
//!                  ┌────────────────────────── REJECTED ─────────────────────────┐
//!                  ↓                                                             │
//! ┌──────────────────┐ continue ┌──────────────┐  ok (DATA)  ┌────────────┐      │
//! │ SelectMechanism  │─────────>│ AwaitingData │────────────>│ AwaitingOk │──────┤
//! └──────────────────┘          └──────────────┘             └────────────┘      │
//!   │   ↑  ok ─────────────────────────────────────────────────────↑             │
//!   │   └─ error (next candidate)     │ ERROR/other                │ DATA/ERROR  │
//!   │                                 ↓                            ↓ /other      │
//!   │ none left              ┌────────────────┐ <──────────────────┘             │
//!   ↓                        │ AwaitingReject │──────────────────────────────────┘
//!  NoMechanismsLeft          └────────────────┘
//!                                     │ anything but REJECTED
//!                                     ↓
//!                             AuthError::Authentication
//!
//! AwaitingData / AwaitingOk ── OK <guid> ──> AuthenticatedPending
//!   ──> AwaitingFdAgreement ── AGREE_UNIX_FD / ERROR ──> Authenticated (BEGIN)
//! ```
//!
//! Only two outcomes are fatal inside the table: running out of mechanisms,
//! and anything other than `REJECTED` while waiting to be rejected (plus a
//! broken capability negotiation). Every other failure cycles to the next
//! candidate.

use std::collections::VecDeque;

use busline_proto::{ClientCommand, ServerReply};

use crate::{
    error::AuthError,
    mechanism::{Mechanism, MechanismRegistry, MechanismStep, decode_argument, encode_argument},
};

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Next candidate mechanism must be chosen and evaluated
    SelectMechanism,
    /// `AUTH`/`DATA` sent, mechanism expects another challenge
    AwaitingData,
    /// Mechanism finished, waiting for the broker to accept
    AwaitingOk,
    /// `CANCEL` sent, waiting for `REJECTED`
    AwaitingReject,
    /// Broker accepted; capability negotiation not started yet
    AuthenticatedPending,
    /// `NEGOTIATE_UNIX_FD` sent
    AwaitingFdAgreement,
    /// `BEGIN` sent; binary framing may start
    Authenticated,
}

/// Inputs to [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// No untried candidate remains
    CandidatesExhausted,
    /// Initial evaluation of a freshly selected mechanism
    Initial {
        /// Mechanism name
        mechanism: String,
        /// Outcome with the response already encoded for the line
        step: MechanismStep<String>,
    },
    /// Mechanism's answer to the last `DATA` challenge
    Challenge(MechanismStep<String>),
    /// Line received from the broker
    Server(ServerReply),
    /// Leave [`AuthState::AuthenticatedPending`]
    Proceed {
        /// Whether to ask for file-descriptor passing
        negotiate_unix_fd: bool,
    },
}

impl AuthEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::CandidatesExhausted => "CandidatesExhausted",
            Self::Initial { .. } => "Initial",
            Self::Challenge(_) => "Challenge",
            Self::Server(_) => "Server",
            Self::Proceed { .. } => "Proceed",
        }
    }
}

/// Actions produced by [`transition`].
///
/// [`Authenticator`] consumes `SelectMechanism` and `FeedChallenge` itself;
/// the rest are returned to whoever owns the transport and the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Write this line to the broker
    Send(ClientCommand),
    /// Pick and evaluate the next candidate mechanism
    SelectMechanism,
    /// Feed this (still encoded) challenge to the current mechanism
    FeedChallenge(String),
    /// Record the server GUID on the connection
    AssignServerUuid(String),
    /// Record whether file-descriptor passing was agreed
    UnixFdNegotiated(bool),
}

/// Result of one [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event
    pub state: AuthState,
    /// Actions to execute, in order
    pub actions: Vec<AuthAction>,
}

impl Transition {
    fn to(state: AuthState, actions: Vec<AuthAction>) -> Self {
        Self { state, actions }
    }

    fn cancel() -> Self {
        Self::to(AuthState::AwaitingReject, vec![AuthAction::Send(ClientCommand::Cancel)])
    }

    fn next_mechanism() -> Self {
        Self::to(AuthState::SelectMechanism, vec![AuthAction::SelectMechanism])
    }

    fn accepted(guid: String) -> Self {
        Self::to(AuthState::AuthenticatedPending, vec![AuthAction::AssignServerUuid(guid)])
    }

    fn begin(unix_fd: bool) -> Self {
        Self::to(AuthState::Authenticated, vec![
            AuthAction::UnixFdNegotiated(unix_fd),
            AuthAction::Send(ClientCommand::Begin),
        ])
    }
}

fn non_empty(argument: String) -> Option<String> {
    (!argument.is_empty()).then_some(argument)
}

fn rejection(reply: &ServerReply) -> AuthError {
    AuthError::Authentication { command: reply.command().to_string(), argument: reply.argument() }
}

/// The handshake protocol table.
///
/// Pure: the same state and event always produce the same transition.
///
/// # Errors
///
/// - [`AuthError::NoMechanismsLeft`] when candidates run out
/// - [`AuthError::Authentication`] for anything but `REJECTED` in
///   [`AuthState::AwaitingReject`], and for anything but `AGREE_UNIX_FD` or
///   `ERROR` in [`AuthState::AwaitingFdAgreement`]
/// - [`AuthError::UnexpectedEvent`] when the event cannot occur in `state`
///   (a driver bug, never a broker behaviour)
pub fn transition(state: AuthState, event: AuthEvent) -> Result<Transition, AuthError> {
    use AuthState as S;
    use ServerReply as R;

    let transition = match (state, event) {
        (S::SelectMechanism, AuthEvent::CandidatesExhausted) => {
            return Err(AuthError::NoMechanismsLeft);
        },
        (S::SelectMechanism, AuthEvent::Initial { mechanism, step }) => {
            let (next, response) = match step {
                MechanismStep::Continue(response) => (S::AwaitingData, response),
                MechanismStep::Ok(response) => (S::AwaitingOk, response),
                MechanismStep::Error(_) => return Ok(Transition::next_mechanism()),
            };
            Transition::to(next, vec![AuthAction::Send(ClientCommand::Auth {
                mechanism: Some(mechanism),
                initial_response: non_empty(response),
            })])
        },

        (S::AwaitingData, AuthEvent::Server(R::Data(challenge))) => {
            Transition::to(S::AwaitingData, vec![AuthAction::FeedChallenge(challenge)])
        },
        (S::AwaitingData, AuthEvent::Challenge(step)) => match step {
            MechanismStep::Continue(response) => Transition::to(S::AwaitingData, vec![
                AuthAction::Send(ClientCommand::Data(non_empty(response))),
            ]),
            MechanismStep::Ok(response) => Transition::to(S::AwaitingOk, vec![AuthAction::Send(
                ClientCommand::Data(non_empty(response)),
            )]),
            MechanismStep::Error(message) => Transition::to(S::AwaitingData, vec![
                AuthAction::Send(ClientCommand::Error(non_empty(message))),
            ]),
        },
        (S::AwaitingData, AuthEvent::Server(R::Rejected { .. })) => Transition::next_mechanism(),
        (S::AwaitingData, AuthEvent::Server(R::Ok { guid })) => Transition::accepted(guid),
        (S::AwaitingData, AuthEvent::Server(_)) => Transition::cancel(),

        (S::AwaitingOk, AuthEvent::Server(R::Ok { guid })) => Transition::accepted(guid),
        (S::AwaitingOk, AuthEvent::Server(R::Rejected { .. })) => Transition::next_mechanism(),
        (S::AwaitingOk, AuthEvent::Server(_)) => Transition::cancel(),

        (S::AwaitingReject, AuthEvent::Server(R::Rejected { .. })) => Transition::next_mechanism(),
        (S::AwaitingReject, AuthEvent::Server(reply)) => return Err(rejection(&reply)),

        (S::AuthenticatedPending, AuthEvent::Proceed { negotiate_unix_fd: true }) => {
            Transition::to(S::AwaitingFdAgreement, vec![AuthAction::Send(
                ClientCommand::NegotiateUnixFd,
            )])
        },
        (S::AuthenticatedPending, AuthEvent::Proceed { negotiate_unix_fd: false }) => {
            Transition::begin(false)
        },

        (S::AwaitingFdAgreement, AuthEvent::Server(R::AgreeUnixFd)) => Transition::begin(true),
        (S::AwaitingFdAgreement, AuthEvent::Server(R::Error(_))) => Transition::begin(false),
        (S::AwaitingFdAgreement, AuthEvent::Server(reply)) => return Err(rejection(&reply)),

        (state, event) => {
            return Err(AuthError::UnexpectedEvent { state, event: event.name() });
        },
    };

    Ok(transition)
}

/// Sans-IO handshake driver.
///
/// Owns the untried candidates and the mechanism of the current attempt, and
/// runs [`transition`] until it needs a broker reply. The caller executes the
/// returned actions (write lines, record the GUID and capability flag), reads
/// the next line, and calls [`Authenticator::handle_reply`].
///
/// ```text
/// let actions = auth.start()?;
/// loop {
///     execute(actions);
///     if auth.is_authenticated() { break; }
///     actions = auth.handle_reply(ServerReply::parse(&read_line()?))?;
/// }
/// ```
#[derive(Debug)]
pub struct Authenticator {
    state: AuthState,
    candidates: VecDeque<Box<dyn Mechanism>>,
    current: Option<Box<dyn Mechanism>>,
    negotiate_unix_fd: bool,
}

impl Authenticator {
    /// Create a driver over an ordered candidate list.
    pub fn new(candidates: Vec<Box<dyn Mechanism>>, negotiate_unix_fd: bool) -> Self {
        Self {
            state: AuthState::SelectMechanism,
            candidates: candidates.into(),
            current: None,
            negotiate_unix_fd,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Whether `BEGIN` has been produced
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Name of the mechanism of the current attempt
    #[must_use]
    pub fn current_mechanism(&self) -> Option<&str> {
        self.current.as_deref().map(|mechanism| mechanism.name())
    }

    /// Select the first mechanism and produce its `AUTH` line.
    ///
    /// # Errors
    ///
    /// [`AuthError::NoMechanismsLeft`] if no candidate produces an initial
    /// response.
    pub fn start(&mut self) -> Result<Vec<AuthAction>, AuthError> {
        let event = self.select_next();
        self.run(event)
    }

    /// Feed one broker reply.
    ///
    /// # Errors
    ///
    /// See [`transition`].
    pub fn handle_reply(&mut self, reply: ServerReply) -> Result<Vec<AuthAction>, AuthError> {
        tracing::debug!(state = ?self.state, reply = reply.command(), "handshake reply");

        if let ServerReply::Rejected { mechanisms } = &reply {
            tracing::warn!(
                mechanism = self.current_mechanism().unwrap_or("<none>"),
                supported = ?mechanisms,
                "mechanism rejected"
            );
        }

        self.run(AuthEvent::Server(reply))
    }

    fn run(&mut self, first: AuthEvent) -> Result<Vec<AuthAction>, AuthError> {
        let mut events = VecDeque::from([first]);
        let mut outbound = Vec::new();

        while let Some(event) = events.pop_front() {
            let Transition { state, actions } = transition(self.state, event)?;
            self.state = state;

            for action in actions {
                match action {
                    AuthAction::SelectMechanism => events.push_back(self.select_next()),
                    AuthAction::FeedChallenge(challenge) => {
                        events.push_back(AuthEvent::Challenge(self.feed(&challenge)));
                    },
                    action => outbound.push(action),
                }
            }

            if events.is_empty() && self.state == AuthState::AuthenticatedPending {
                events.push_back(AuthEvent::Proceed { negotiate_unix_fd: self.negotiate_unix_fd });
            }
        }

        if self.is_authenticated() {
            self.current = None;
        }

        Ok(outbound)
    }

    fn select_next(&mut self) -> AuthEvent {
        self.current = None;

        let Some(mut mechanism) = self.candidates.pop_front() else {
            return AuthEvent::CandidatesExhausted;
        };

        let textual = mechanism.is_textual();
        let step = mechanism.initial_response().map(|response| encode_argument(textual, &response));
        let event = AuthEvent::Initial { mechanism: mechanism.name().to_string(), step };

        if let AuthEvent::Initial { step: MechanismStep::Error(reason), mechanism: name } = &event {
            tracing::debug!(mechanism = %name, %reason, "mechanism declined to start");
        }

        self.current = Some(mechanism);
        event
    }

    fn feed(&mut self, challenge: &str) -> MechanismStep<String> {
        let Some(mechanism) = self.current.as_mut() else {
            return MechanismStep::Error("no mechanism in progress".to_string());
        };

        let textual = mechanism.is_textual();
        match decode_argument(textual, challenge) {
            Some(data) => {
                mechanism.challenge(&data).map(|response| encode_argument(textual, &response))
            },
            None => MechanismStep::Error("malformed challenge".to_string()),
        }
    }
}

/// Turn the reply to a discovery probe ([`ClientCommand::probe`]) into
/// candidate mechanisms.
///
/// # Errors
///
/// [`AuthError::Authentication`] if the broker answered with anything other
/// than `REJECTED`.
pub fn mechanisms_from_probe(
    reply: &ServerReply,
    registry: &MechanismRegistry,
) -> Result<Vec<Box<dyn Mechanism>>, AuthError> {
    match reply {
        ServerReply::Rejected { mechanisms } => Ok(registry.resolve(mechanisms)),
        other => Err(rejection(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::{Anonymous, External, Generic};

    fn send(command: ClientCommand) -> AuthAction {
        AuthAction::Send(command)
    }

    fn auth(mechanism: &str, response: Option<&str>) -> ClientCommand {
        ClientCommand::Auth {
            mechanism: Some(mechanism.to_string()),
            initial_response: response.map(str::to_string),
        }
    }

    /// Mechanism whose every step is scripted
    struct Scripted {
        name: &'static str,
        textual: bool,
        initial: MechanismStep,
        challenges: VecDeque<MechanismStep>,
    }

    impl Scripted {
        fn new(name: &'static str, initial: MechanismStep) -> Self {
            Self { name, textual: false, initial, challenges: VecDeque::new() }
        }

        fn then(mut self, step: MechanismStep) -> Self {
            self.challenges.push_back(step);
            self
        }

        fn textual(mut self) -> Self {
            self.textual = true;
            self
        }
    }

    impl Mechanism for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn is_textual(&self) -> bool {
            self.textual
        }

        fn initial_response(&mut self) -> MechanismStep {
            self.initial.clone()
        }

        fn challenge(&mut self, _data: &[u8]) -> MechanismStep {
            self.challenges.pop_front().unwrap_or(MechanismStep::Error("unscripted".to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // transition()
    // -------------------------------------------------------------------------

    #[test]
    fn initial_continue_sends_auth_and_awaits_data() {
        let t = transition(AuthState::SelectMechanism, AuthEvent::Initial {
            mechanism: "EXTERNAL".into(),
            step: MechanismStep::Continue(String::new()),
        })
        .unwrap();

        assert_eq!(t.state, AuthState::AwaitingData);
        assert_eq!(t.actions, vec![send(auth("EXTERNAL", None))]);
    }

    #[test]
    fn initial_ok_sends_auth_and_awaits_ok() {
        let t = transition(AuthState::SelectMechanism, AuthEvent::Initial {
            mechanism: "EXTERNAL".into(),
            step: MechanismStep::Ok("31303030".into()),
        })
        .unwrap();

        assert_eq!(t.state, AuthState::AwaitingOk);
        assert_eq!(t.actions, vec![send(auth("EXTERNAL", Some("31303030")))]);
    }

    #[test]
    fn initial_error_selects_next_without_sending() {
        let t = transition(AuthState::SelectMechanism, AuthEvent::Initial {
            mechanism: "X".into(),
            step: MechanismStep::Error("no credentials".into()),
        })
        .unwrap();

        assert_eq!(t.state, AuthState::SelectMechanism);
        assert_eq!(t.actions, vec![AuthAction::SelectMechanism]);
    }

    #[test]
    fn exhausted_candidates_are_fatal() {
        let result = transition(AuthState::SelectMechanism, AuthEvent::CandidatesExhausted);
        assert_eq!(result, Err(AuthError::NoMechanismsLeft));
    }

    #[test]
    fn awaiting_data_branches() {
        let data = transition(
            AuthState::AwaitingData,
            AuthEvent::Server(ServerReply::Data("6869".into())),
        )
        .unwrap();
        assert_eq!(data.state, AuthState::AwaitingData);
        assert_eq!(data.actions, vec![AuthAction::FeedChallenge("6869".into())]);

        let cont = transition(
            AuthState::AwaitingData,
            AuthEvent::Challenge(MechanismStep::Continue("aa".into())),
        )
        .unwrap();
        assert_eq!(cont.state, AuthState::AwaitingData);
        assert_eq!(cont.actions, vec![send(ClientCommand::Data(Some("aa".into())))]);

        let ok = transition(
            AuthState::AwaitingData,
            AuthEvent::Challenge(MechanismStep::Ok("bb".into())),
        )
        .unwrap();
        assert_eq!(ok.state, AuthState::AwaitingOk);
        assert_eq!(ok.actions, vec![send(ClientCommand::Data(Some("bb".into())))]);

        let err = transition(
            AuthState::AwaitingData,
            AuthEvent::Challenge(MechanismStep::Error("bad".into())),
        )
        .unwrap();
        assert_eq!(err.state, AuthState::AwaitingData);
        assert_eq!(err.actions, vec![send(ClientCommand::Error(Some("bad".into())))]);

        let rejected = transition(
            AuthState::AwaitingData,
            AuthEvent::Server(ServerReply::Rejected { mechanisms: vec![] }),
        )
        .unwrap();
        assert_eq!(rejected.state, AuthState::SelectMechanism);

        let accepted = transition(
            AuthState::AwaitingData,
            AuthEvent::Server(ServerReply::Ok { guid: "g".into() }),
        )
        .unwrap();
        assert_eq!(accepted.state, AuthState::AuthenticatedPending);
        assert_eq!(accepted.actions, vec![AuthAction::AssignServerUuid("g".into())]);

        for reply in [
            ServerReply::Error(None),
            ServerReply::AgreeUnixFd,
            ServerReply::Unknown { command: "WAT".into(), argument: String::new() },
        ] {
            let t = transition(AuthState::AwaitingData, AuthEvent::Server(reply)).unwrap();
            assert_eq!(t.state, AuthState::AwaitingReject);
            assert_eq!(t.actions, vec![send(ClientCommand::Cancel)]);
        }
    }

    #[test]
    fn awaiting_ok_branches() {
        let accepted = transition(
            AuthState::AwaitingOk,
            AuthEvent::Server(ServerReply::Ok { guid: "g".into() }),
        )
        .unwrap();
        assert_eq!(accepted.state, AuthState::AuthenticatedPending);

        let rejected = transition(
            AuthState::AwaitingOk,
            AuthEvent::Server(ServerReply::Rejected { mechanisms: vec![] }),
        )
        .unwrap();
        assert_eq!(rejected.state, AuthState::SelectMechanism);

        for reply in [ServerReply::Data("00".into()), ServerReply::Error(Some("e".into()))] {
            let t = transition(AuthState::AwaitingOk, AuthEvent::Server(reply)).unwrap();
            assert_eq!(t.state, AuthState::AwaitingReject);
            assert_eq!(t.actions, vec![send(ClientCommand::Cancel)]);
        }
    }

    #[test]
    fn awaiting_reject_only_accepts_rejected() {
        let t = transition(
            AuthState::AwaitingReject,
            AuthEvent::Server(ServerReply::Rejected { mechanisms: vec!["EXTERNAL".into()] }),
        )
        .unwrap();
        assert_eq!(t.state, AuthState::SelectMechanism);

        let result =
            transition(AuthState::AwaitingReject, AuthEvent::Server(ServerReply::Data("x".into())));
        assert_eq!(
            result,
            Err(AuthError::Authentication { command: "DATA".into(), argument: "x".into() })
        );
    }

    #[test]
    fn capability_negotiation() {
        let negotiate = transition(AuthState::AuthenticatedPending, AuthEvent::Proceed {
            negotiate_unix_fd: true,
        })
        .unwrap();
        assert_eq!(negotiate.state, AuthState::AwaitingFdAgreement);
        assert_eq!(negotiate.actions, vec![send(ClientCommand::NegotiateUnixFd)]);

        let skip = transition(AuthState::AuthenticatedPending, AuthEvent::Proceed {
            negotiate_unix_fd: false,
        })
        .unwrap();
        assert_eq!(skip.state, AuthState::Authenticated);
        assert_eq!(skip.actions, vec![
            AuthAction::UnixFdNegotiated(false),
            send(ClientCommand::Begin)
        ]);

        let agreed =
            transition(AuthState::AwaitingFdAgreement, AuthEvent::Server(ServerReply::AgreeUnixFd))
                .unwrap();
        assert_eq!(agreed.actions, vec![
            AuthAction::UnixFdNegotiated(true),
            send(ClientCommand::Begin)
        ]);

        let refused =
            transition(AuthState::AwaitingFdAgreement, AuthEvent::Server(ServerReply::Error(None)))
                .unwrap();
        assert_eq!(refused.state, AuthState::Authenticated);
        assert_eq!(refused.actions[0], AuthAction::UnixFdNegotiated(false));

        let broken = transition(
            AuthState::AwaitingFdAgreement,
            AuthEvent::Server(ServerReply::Ok { guid: "g".into() }),
        );
        assert!(matches!(broken, Err(AuthError::Authentication { .. })));
    }

    #[test]
    fn misuse_is_reported_not_panicked() {
        let result = transition(AuthState::Authenticated, AuthEvent::Server(ServerReply::AgreeUnixFd));
        assert_eq!(
            result,
            Err(AuthError::UnexpectedEvent { state: AuthState::Authenticated, event: "Server" })
        );

        let result = transition(AuthState::AwaitingOk, AuthEvent::CandidatesExhausted);
        assert!(matches!(result, Err(AuthError::UnexpectedEvent { .. })));
    }

    // -------------------------------------------------------------------------
    // Authenticator
    // -------------------------------------------------------------------------

    fn sent(actions: &[AuthAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                AuthAction::Send(command) => Some(command.to_line().unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn rejected_mechanism_falls_through_to_next() {
        let mut auth = Authenticator::new(
            vec![
                Box::new(Scripted::new("MechA", MechanismStep::Ok(b"a".to_vec()))),
                Box::new(Scripted::new("MechB", MechanismStep::Ok(b"b".to_vec()))),
            ],
            true,
        );

        assert_eq!(sent(&auth.start().unwrap()), ["AUTH MechA 61"]);
        assert_eq!(auth.current_mechanism(), Some("MechA"));

        let actions = auth
            .handle_reply(ServerReply::Rejected { mechanisms: vec!["MechB".into()] })
            .unwrap();
        assert_eq!(sent(&actions), ["AUTH MechB 62"]);
        assert_eq!(auth.current_mechanism(), Some("MechB"));

        let actions = auth.handle_reply(ServerReply::Ok { guid: "uuid42".into() }).unwrap();
        assert_eq!(actions, vec![
            AuthAction::AssignServerUuid("uuid42".into()),
            send(ClientCommand::NegotiateUnixFd),
        ]);
        assert_eq!(auth.state(), AuthState::AwaitingFdAgreement);

        let actions = auth.handle_reply(ServerReply::Error(None)).unwrap();
        assert_eq!(actions, vec![
            AuthAction::UnixFdNegotiated(false),
            send(ClientCommand::Begin)
        ]);
        assert!(auth.is_authenticated());
        assert_eq!(auth.current_mechanism(), None);
    }

    #[test]
    fn single_failing_candidate_sends_nothing() {
        let mut auth = Authenticator::new(
            vec![Box::new(Scripted::new("MechA", MechanismStep::Error("no".into())))],
            true,
        );

        assert_eq!(auth.start(), Err(AuthError::NoMechanismsLeft));
    }

    #[test]
    fn empty_candidate_list_fails_immediately() {
        let mut auth = Authenticator::new(vec![], true);
        assert_eq!(auth.start(), Err(AuthError::NoMechanismsLeft));
    }

    #[test]
    fn failing_candidate_is_skipped() {
        let mut auth = Authenticator::new(
            vec![
                Box::new(Scripted::new("Broken", MechanismStep::Error("no".into()))),
                Box::new(Anonymous::new("t")),
            ],
            false,
        );

        assert_eq!(sent(&auth.start().unwrap()), ["AUTH ANONYMOUS 74"]);
    }

    #[test]
    fn data_exchange_reaches_ok() {
        let mechanism = Scripted::new("MULTI", MechanismStep::Continue(b"hi".to_vec()))
            .then(MechanismStep::Continue(b"one".to_vec()))
            .then(MechanismStep::Ok(b"two".to_vec()));
        let mut auth = Authenticator::new(vec![Box::new(mechanism)], false);

        assert_eq!(sent(&auth.start().unwrap()), ["AUTH MULTI 6869"]);

        let actions = auth.handle_reply(ServerReply::Data("01".into())).unwrap();
        assert_eq!(sent(&actions), ["DATA 6f6e65"]);
        assert_eq!(auth.state(), AuthState::AwaitingData);

        let actions = auth.handle_reply(ServerReply::Data("02".into())).unwrap();
        assert_eq!(sent(&actions), ["DATA 74776f"]);
        assert_eq!(auth.state(), AuthState::AwaitingOk);

        let actions = auth.handle_reply(ServerReply::Ok { guid: "g".into() }).unwrap();
        assert_eq!(actions, vec![
            AuthAction::AssignServerUuid("g".into()),
            AuthAction::UnixFdNegotiated(false),
            send(ClientCommand::Begin),
        ]);
        assert!(auth.is_authenticated());
    }

    #[test]
    fn textual_mechanism_skips_hex() {
        let mechanism = Scripted::new("TEXT", MechanismStep::Continue(b"hello".to_vec()))
            .then(MechanismStep::Ok(b"world".to_vec()))
            .textual();
        let mut auth = Authenticator::new(vec![Box::new(mechanism)], false);

        assert_eq!(sent(&auth.start().unwrap()), ["AUTH TEXT hello"]);
        let actions = auth.handle_reply(ServerReply::Data("challenge text".into())).unwrap();
        assert_eq!(sent(&actions), ["DATA world"]);
    }

    #[test]
    fn malformed_challenge_answers_error_and_stays() {
        let mut auth = Authenticator::new(vec![Box::new(External::new(None))], true);
        auth.start().unwrap();

        let actions = auth.handle_reply(ServerReply::Data("not hex".into())).unwrap();
        assert_eq!(sent(&actions), ["ERROR malformed challenge"]);
        assert_eq!(auth.state(), AuthState::AwaitingData);
    }

    #[test]
    fn server_error_cancels_then_rejection_moves_on() {
        let mut auth = Authenticator::new(
            vec![Box::new(External::new(None)), Box::new(Generic::new("OTHER"))],
            true,
        );
        auth.start().unwrap();

        let actions = auth.handle_reply(ServerReply::Error(Some("nope".into()))).unwrap();
        assert_eq!(sent(&actions), ["CANCEL"]);
        assert_eq!(auth.state(), AuthState::AwaitingReject);

        let actions = auth.handle_reply(ServerReply::Rejected { mechanisms: vec![] }).unwrap();
        assert_eq!(sent(&actions), ["AUTH OTHER"]);
    }

    #[test]
    fn data_while_awaiting_reject_is_fatal() {
        let mut auth = Authenticator::new(vec![Box::new(External::new(None))], true);
        auth.start().unwrap();
        auth.handle_reply(ServerReply::Error(None)).unwrap();

        let result = auth.handle_reply(ServerReply::Data("x".into()));
        assert_eq!(
            result,
            Err(AuthError::Authentication { command: "DATA".into(), argument: "x".into() })
        );
    }

    #[test]
    fn rejection_of_last_candidate_is_fatal() {
        let mut auth = Authenticator::new(vec![Box::new(External::new(Some("0".into())))], true);
        auth.start().unwrap();

        let result = auth.handle_reply(ServerReply::Rejected { mechanisms: vec![] });
        assert_eq!(result, Err(AuthError::NoMechanismsLeft));
    }

    #[test]
    fn probe_reply_resolves_mechanisms() {
        let registry = MechanismRegistry::default();
        let reply = ServerReply::Rejected {
            mechanisms: vec!["EXTERNAL".into(), "DBUS_COOKIE_SHA1".into()],
        };

        let names: Vec<String> = mechanisms_from_probe(&reply, &registry)
            .unwrap()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, ["EXTERNAL", "DBUS_COOKIE_SHA1"]);

        let result = mechanisms_from_probe(&ServerReply::Ok { guid: "g".into() }, &registry);
        assert!(matches!(result, Err(AuthError::Authentication { .. })));
    }
}
