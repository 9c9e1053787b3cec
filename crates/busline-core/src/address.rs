//! Server addresses.
//!
//! An address names a transport and its parameters:
//!
//! ```text
//! unix:path=/run/bus/socket,guid=0123abcd
//! tcp:host=localhost,port=4000
//! ```
//!
//! A bus address string may list several addresses separated by `;`, tried in
//! order by [`open`](crate::open::open). Building the socket for an address is
//! the application's job (see [`Connector`](crate::open::Connector)); this
//! module only splits and reads the text.

use std::fmt;

/// One candidate server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress(String);

impl ServerAddress {
    /// Wrap a single address string
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    /// Split a `;`-separated address list, skipping empty entries
    pub fn parse_list(addresses: &str) -> Vec<Self> {
        addresses
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::new)
            .collect()
    }

    /// Full address text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transport name, the part before the first `:`
    pub fn transport(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(transport, _)| transport)
    }

    /// Value of parameter `key`, with `%xx` escapes decoded.
    ///
    /// Returns `None` if the parameter is absent or its escapes are malformed.
    pub fn value(&self, key: &str) -> Option<String> {
        let (_, params) = self.0.split_once(':')?;
        params
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == key)
            .and_then(|(_, value)| unescape(value))
    }

    /// Server GUID the address promises, if any
    pub fn guid(&self) -> Option<String> {
        self.value("guid")
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

fn unescape(value: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut rest = value.as_bytes();

    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let digits = tail.get(..2)?;
            bytes.extend(hex::decode(digits).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }

    String::from_utf8(bytes).ok()
}
