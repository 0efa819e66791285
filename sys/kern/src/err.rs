// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-internal error plumbing.

use abi::FaultInfo;

/// Outcome of a gate request made by unprivileged code, from the
/// kernel's point of view.
///
/// Errors split into two classes. `Recoverable` errors are reported back
/// to the caller as a return value and the partition keeps running.
/// `Unrecoverable` errors mean the caller did something that cannot be
/// expressed as a return value, such as passing a malformed request, and
/// the partition takes a fault instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    Recoverable(u32),
    Unrecoverable(FaultInfo),
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}
