//! Connection configuration.
//!
//! Deserializable from any serde format; every field has a default, so an
//! empty document yields [`ConnectionConfig::default`].

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, mechanism::MechanismRegistry};

/// What to do when the server reports a GUID different from the one already
/// recorded for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateUuidPolicy {
    /// Log a warning and keep the new value
    #[default]
    Overwrite,
    /// Fail the handshake
    Reject,
}

/// What [`open`](crate::open::open) returns when no address works.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Return [`ConnectionError::NoServerReachable`](crate::ConnectionError::NoServerReachable)
    #[default]
    Error,
    /// Return `Ok(None)`
    ReturnNone,
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectionConfig {
    /// Ordered candidate mechanism names. Empty means "ask the server".
    pub mechanisms: Vec<String>,

    /// Ask for file-descriptor passing after authentication
    pub negotiate_unix_fd: bool,

    /// Reaction to a changed server GUID
    pub on_duplicate_uuid: DuplicateUuidPolicy,

    /// Result of [`open`](crate::open::open) when every address fails
    pub on_failure: FailurePolicy,

    /// Identity asserted by the `EXTERNAL` mechanism
    pub external_identity: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mechanisms: Vec::new(),
            negotiate_unix_fd: true,
            on_duplicate_uuid: DuplicateUuidPolicy::default(),
            on_failure: FailurePolicy::default(),
            external_identity: None,
        }
    }
}

impl ConnectionConfig {
    /// Check the configuration for values the handshake cannot use.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyMechanismName`] if a candidate name is empty or
    /// only whitespace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mechanisms.iter().position(|name| name.trim().is_empty()) {
            Some(index) => Err(ConfigError::EmptyMechanismName { index }),
            None => Ok(()),
        }
    }

    /// Registry of built-in mechanisms, with `EXTERNAL` using
    /// [`ConnectionConfig::external_identity`]
    pub fn registry(&self) -> MechanismRegistry {
        MechanismRegistry::new(self.external_identity.clone())
    }
}
