//! Message serial allocation.
//!
//! Serials are 32-bit and never 0: a zero serial means "no reply expected".
//! After `u32::MAX` the generator wraps to 1.

use std::num::NonZeroU32;

/// Wrapping, non-zero serial generator.
#[derive(Debug, Clone)]
pub struct SerialGenerator {
    next: NonZeroU32,
}

impl SerialGenerator {
    /// Create a generator whose first serial is 1
    pub fn new() -> Self {
        Self { next: NonZeroU32::MIN }
    }

    /// Create a generator whose first serial is `first`
    pub fn starting_at(first: NonZeroU32) -> Self {
        Self { next: first }
    }

    /// Return the current serial and advance.
    ///
    /// # Invariants
    ///
    /// - **Post**: the returned value is never 0
    /// - **Post**: `u32::MAX` is followed by 1
    pub fn next_serial(&mut self) -> u32 {
        let serial = self.next;
        self.next = serial.checked_add(1).unwrap_or(NonZeroU32::MIN);
        serial.get()
    }

    /// The serial the next call will return, without advancing
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.next.get()
    }
}

impl Default for SerialGenerator {
    fn default() -> Self {
        Self::new()
    }
}
