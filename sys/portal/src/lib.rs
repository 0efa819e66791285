// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portals: sanctioned cross-partition communication.
//!
//! Partitions cannot see each other's memory, so all cooperation goes
//! through one of two protocols built on shared message buffers and the
//! kernel's dynamic regions:
//!
//! - the **free-message portal** (`fmp`), a request/reply protocol where
//!   the client composes a service header in a buffer from its private
//!   pool, hands it to the server's exchange, and gets the reply written
//!   back into the same buffer;
//!
//! - the **tunnel portal** (`tunnel`), a stateful streaming session that
//!   moves bulk data one buffer-sized chunk at a time, coordinated by a
//!   semaphore pair negotiated at open.
//!
//! The scheduler-owned primitives both protocols ride on (exchanges and
//! semaphores) are external; `sync` defines the traits this crate
//! consumes. Protocol errors land in the `errmgr` log and on the
//! offending session only; timeouts are a separate, recoverable
//! category throughout.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::undocumented_unsafe_blocks)]

pub mod errmgr;
pub mod fmp;
pub mod pool;
pub mod sync;
pub mod tunnel;
