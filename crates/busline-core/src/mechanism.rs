//! Authentication mechanisms.
//!
//! A mechanism turns broker challenges into responses. The handshake engine
//! only cares about the shape of each step ([`MechanismStep`]), never about
//! the credential content, so new mechanisms plug in through
//! [`MechanismRegistry::register`].
//!
//! # Argument Encoding
//!
//! Non-textual mechanisms exchange opaque bytes, sent on the line as lowercase
//! hex. Textual mechanisms exchange UTF-8 text sent as-is. [`encode_argument`]
//! and [`decode_argument`] apply whichever encoding the mechanism asks for.

use std::{collections::HashMap, fmt};

/// Outcome of one mechanism evaluation.
///
/// The payload type is raw bytes as produced by the mechanism; the handshake
/// driver maps it to the encoded line argument before feeding the state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismStep<T = Vec<u8>> {
    /// Send this response and expect another challenge
    Continue(T),
    /// Send this response and expect the broker to accept
    Ok(T),
    /// Mechanism cannot proceed
    Error(String),
}

impl<T> MechanismStep<T> {
    /// Map the response payload, leaving errors untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MechanismStep<U> {
        match self {
            Self::Continue(value) => MechanismStep::Continue(f(value)),
            Self::Ok(value) => MechanismStep::Ok(f(value)),
            Self::Error(message) => MechanismStep::Error(message),
        }
    }
}

/// A pluggable authentication method.
pub trait Mechanism: Send {
    /// Name as it appears on the `AUTH` line, e.g. `"EXTERNAL"`
    fn name(&self) -> &str;

    /// Whether responses and challenges are text rather than hex-encoded bytes
    fn is_textual(&self) -> bool {
        false
    }

    /// Evaluate the mechanism before any challenge (sent with `AUTH`)
    fn initial_response(&mut self) -> MechanismStep;

    /// Answer a `DATA` challenge from the broker
    fn challenge(&mut self, data: &[u8]) -> MechanismStep;
}

impl fmt::Debug for dyn Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanism")
            .field("name", &self.name())
            .field("textual", &self.is_textual())
            .finish()
    }
}

/// Encode a mechanism payload as a line argument.
#[must_use]
pub fn encode_argument(textual: bool, payload: &[u8]) -> String {
    if textual { String::from_utf8_lossy(payload).into_owned() } else { hex::encode(payload) }
}

/// Decode a line argument into a mechanism payload.
///
/// Returns `None` if the argument is not valid for the encoding.
#[must_use]
pub fn decode_argument(textual: bool, argument: &str) -> Option<Vec<u8>> {
    if textual { Some(argument.as_bytes().to_vec()) } else { hex::decode(argument).ok() }
}

/// `EXTERNAL`: identity established by the transport (e.g. peer credentials).
///
/// With an explicit identity the response is sent with `AUTH` and the broker
/// is expected to accept straight away. Without one the mechanism asks the
/// broker to use the credentials it already has: empty `AUTH`, then an empty
/// `DATA` answer to the broker's challenge.
#[derive(Clone, Default)]
pub struct External {
    identity: Option<String>,
}

impl External {
    /// Mechanism name
    pub const NAME: &'static str = "EXTERNAL";

    /// Create the mechanism, optionally asserting an identity (typically a uid)
    pub fn new(identity: Option<String>) -> Self {
        Self { identity }
    }
}

impl fmt::Debug for External {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("External")
            .field("identity", &self.identity.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Mechanism for External {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self) -> MechanismStep {
        match &self.identity {
            Some(identity) => MechanismStep::Ok(identity.as_bytes().to_vec()),
            None => MechanismStep::Continue(Vec::new()),
        }
    }

    fn challenge(&mut self, data: &[u8]) -> MechanismStep {
        if data.is_empty() {
            MechanismStep::Ok(Vec::new())
        } else {
            MechanismStep::Error("EXTERNAL expects an empty challenge".to_string())
        }
    }
}

/// `ANONYMOUS`: no credentials, just an optional trace string.
#[derive(Debug, Clone)]
pub struct Anonymous {
    trace: String,
}

impl Anonymous {
    /// Mechanism name
    pub const NAME: &'static str = "ANONYMOUS";

    /// Create the mechanism with a trace string the broker may log
    pub fn new(trace: impl Into<String>) -> Self {
        Self { trace: trace.into() }
    }
}

impl Default for Anonymous {
    fn default() -> Self {
        Self::new("busline")
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self) -> MechanismStep {
        MechanismStep::Ok(self.trace.as_bytes().to_vec())
    }

    fn challenge(&mut self, _data: &[u8]) -> MechanismStep {
        MechanismStep::Error("ANONYMOUS takes no challenge".to_string())
    }
}

/// Pass-through for mechanisms advertised by the broker that we have no
/// dedicated implementation for.
///
/// Sends an empty `AUTH`, then answers the first challenge with an empty
/// response and expects acceptance.
#[derive(Debug, Clone)]
pub struct Generic {
    name: String,
}

impl Generic {
    /// Create a pass-through mechanism with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Mechanism for Generic {
    fn name(&self) -> &str {
        &self.name
    }

    fn initial_response(&mut self) -> MechanismStep {
        MechanismStep::Continue(Vec::new())
    }

    fn challenge(&mut self, _data: &[u8]) -> MechanismStep {
        MechanismStep::Ok(Vec::new())
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Mechanism> + Send + Sync>;

/// Maps mechanism names to fresh mechanism instances.
///
/// Every lookup creates a new instance: an attempt owns its mechanism until it
/// is abandoned or succeeds.
pub struct MechanismRegistry {
    factories: HashMap<String, Factory>,
}

impl MechanismRegistry {
    /// Registry with the built-in mechanisms.
    ///
    /// `external_identity` is passed to every [`External`] instance.
    pub fn new(external_identity: Option<String>) -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register(External::NAME, move || Box::new(External::new(external_identity.clone())));
        registry.register(Anonymous::NAME, || Box::new(Anonymous::default()));
        registry
    }

    /// Register (or replace) the factory for `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Mechanism> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Whether `name` has a dedicated implementation
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate `name`, falling back to [`Generic`] for unknown names
    #[must_use]
    pub fn lookup(&self, name: &str) -> Box<dyn Mechanism> {
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => Box::new(Generic::new(name)),
        }
    }

    /// Instantiate every name in order
    pub fn resolve<I, S>(&self, names: I) -> Vec<Box<dyn Mechanism>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().map(|name| self.lookup(name.as_ref())).collect()
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("MechanismRegistry").field("mechanisms", &names).finish()
    }
}
