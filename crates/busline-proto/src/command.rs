//! Handshake line commands.
//!
//! Before binary framing begins, client and broker exchange newline-terminated
//! text lines. The client sends [`ClientCommand`]s; everything the broker says
//! is classified into a [`ServerReply`].
//!
//! # Line Format
//!
//! ```text
//! COMMAND [argument...]\r\n
//! ```
//!
//! Commands are uppercase and separated from their argument by a single space.
//! Arguments are either plain text or lowercase hex, depending on the
//! authentication mechanism in use; encoding them is the caller's job.

use crate::errors::{ProtocolError, Result};

/// Line terminator expected by the broker.
pub const LINE_ENDING: &str = "\r\n";

/// Commands issued by the client during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `AUTH [mechanism [initial-response]]`
    ///
    /// With no mechanism this is the discovery probe: the broker answers with
    /// `REJECTED` and the list of mechanisms it supports.
    Auth {
        /// Mechanism name
        mechanism: Option<String>,
        /// Encoded initial response
        initial_response: Option<String>,
    },
    /// `DATA [argument]`
    Data(Option<String>),
    /// `CANCEL`
    Cancel,
    /// `BEGIN`
    Begin,
    /// `ERROR [message]`
    Error(Option<String>),
    /// `NEGOTIATE_UNIX_FD`
    NegotiateUnixFd,
}

impl ClientCommand {
    /// The discovery probe (`AUTH` with no mechanism).
    #[must_use]
    pub fn probe() -> Self {
        Self::Auth { mechanism: None, initial_response: None }
    }

    /// The command keyword, e.g. `"AUTH"`.
    ///
    /// Safe to log: it never includes the (possibly secret) argument.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "AUTH",
            Self::Data(_) => "DATA",
            Self::Cancel => "CANCEL",
            Self::Begin => "BEGIN",
            Self::Error(_) => "ERROR",
            Self::NegotiateUnixFd => "NEGOTIATE_UNIX_FD",
        }
    }

    /// Format the command as a single line, without the terminator.
    ///
    /// Empty arguments are omitted, so `Data(Some(""))` formats as `DATA`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidLine`] if any argument contains a
    /// carriage return or line feed, or if an initial response is given
    /// without a mechanism.
    pub fn to_line(&self) -> Result<String> {
        let mut line = String::from(self.name());

        match self {
            Self::Auth { mechanism, initial_response } => {
                match (mechanism.as_deref(), initial_response.as_deref()) {
                    (None, Some(response)) if !response.is_empty() => {
                        return Err(ProtocolError::InvalidLine(
                            "AUTH initial response without a mechanism".to_string(),
                        ));
                    },
                    (None, _) => {},
                    (Some(mechanism), response) => {
                        push_argument(&mut line, Some(mechanism))?;
                        push_argument(&mut line, response)?;
                    },
                }
            },
            Self::Data(argument) | Self::Error(argument) => {
                push_argument(&mut line, argument.as_deref())?;
            },
            Self::Cancel | Self::Begin | Self::NegotiateUnixFd => {},
        }

        Ok(line)
    }
}

fn push_argument(line: &mut String, argument: Option<&str>) -> Result<()> {
    let Some(argument) = argument.filter(|a| !a.is_empty()) else {
        return Ok(());
    };

    if argument.contains(['\r', '\n']) {
        return Err(ProtocolError::InvalidLine(format!(
            "{} argument contains a line break",
            line.split(' ').next().unwrap_or_default()
        )));
    }

    line.push(' ');
    line.push_str(argument);
    Ok(())
}

/// Classified broker reply.
///
/// Parsing never fails: anything that is not a well-formed known reply becomes
/// [`ServerReply::Unknown`], and the state machine decides what that means in
/// its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    /// `OK <guid>`: authentication accepted
    Ok {
        /// Server GUID
        guid: String,
    },
    /// `REJECTED [mechanisms...]`: current mechanism refused
    Rejected {
        /// Mechanisms the broker supports
        mechanisms: Vec<String>,
    },
    /// `DATA [argument]`: challenge for the current mechanism
    Data(String),
    /// `ERROR [message]`
    Error(Option<String>),
    /// `AGREE_UNIX_FD`
    AgreeUnixFd,
    /// Anything else, including a bare `OK`
    Unknown {
        /// Command keyword as received
        command: String,
        /// Remainder of the line
        argument: String,
    },
}

impl ServerReply {
    /// Classify one line received from the broker.
    ///
    /// Trailing `\r\n` or `\n` is stripped before parsing.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));

        match command {
            "OK" if !argument.trim().is_empty() => {
                Self::Ok { guid: argument.trim().to_string() }
            },
            "REJECTED" => Self::Rejected {
                mechanisms: argument.split_whitespace().map(str::to_string).collect(),
            },
            "DATA" => Self::Data(argument.to_string()),
            "ERROR" if argument.is_empty() => Self::Error(None),
            "ERROR" => Self::Error(Some(argument.to_string())),
            "AGREE_UNIX_FD" if argument.is_empty() => Self::AgreeUnixFd,
            _ => Self::Unknown { command: command.to_string(), argument: argument.to_string() },
        }
    }

    /// The command keyword, e.g. `"REJECTED"`.
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            Self::Ok { .. } => "OK",
            Self::Rejected { .. } => "REJECTED",
            Self::Data(_) => "DATA",
            Self::Error(_) => "ERROR",
            Self::AgreeUnixFd => "AGREE_UNIX_FD",
            Self::Unknown { command, .. } => command,
        }
    }

    /// The argument as it appeared on the line (empty when absent).
    #[must_use]
    pub fn argument(&self) -> String {
        match self {
            Self::Ok { guid } => guid.clone(),
            Self::Rejected { mechanisms } => mechanisms.join(" "),
            Self::Data(argument) => argument.clone(),
            Self::Error(message) => message.clone().unwrap_or_default(),
            Self::AgreeUnixFd => String::new(),
            Self::Unknown { argument, .. } => argument.clone(),
        }
    }
}
