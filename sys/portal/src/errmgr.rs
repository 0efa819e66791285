// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portal error manager.
//!
//! Protocol errors are logged centrally for diagnosis and attached to
//! the offending session, and only that session: the next call on the
//! session observes the error, unrelated sessions never do. Timeouts do
//! not come through here at all; they are ordinary recoverable results.

use abi::PortalError;

/// Ring capacity. Old records are overwritten, never reallocated.
pub const ERROR_LOG_SLOTS: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErrorRecord {
    /// Portal the session belonged to.
    pub portal: &'static str,
    pub error: PortalError,
    /// Monotonic sequence number, for ordering across wraps.
    pub seq: u32,
}

/// One session's error attachment point. Sticky until read.
#[derive(Default)]
pub struct SessionError(Option<PortalError>);

impl SessionError {
    pub const fn new() -> Self {
        Self(None)
    }

    /// Consumes the pending error, if any.
    pub fn take(&mut self) -> Option<PortalError> {
        self.0.take()
    }

    pub fn peek(&self) -> Option<PortalError> {
        self.0
    }
}

pub struct ErrorManager {
    ring: [Option<ErrorRecord>; ERROR_LOG_SLOTS],
    next: usize,
    seq: u32,
}

impl ErrorManager {
    pub const fn new() -> Self {
        Self { ring: [None; ERROR_LOG_SLOTS], next: 0, seq: 0 }
    }

    /// Logs `error` and attaches it to `session`. An unread earlier
    /// error on the session is superseded; the log keeps both.
    pub fn report(
        &mut self,
        portal: &'static str,
        session: &mut SessionError,
        error: PortalError,
    ) {
        self.ring[self.next] = Some(ErrorRecord { portal, error, seq: self.seq });
        self.next = (self.next + 1) % ERROR_LOG_SLOTS;
        self.seq = self.seq.wrapping_add(1);
        session.0 = Some(error);
    }

    /// Records in arrival order, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &ErrorRecord> {
        let (tail, head) = self.ring.split_at(self.next);
        head.iter().chain(tail).flatten()
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new()
    }
}
