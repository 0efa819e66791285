// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protection and portal ABI definitions, shared between the privileged
//! kernel and unprivileged partition code.
//!
//! Everything in here crosses the privilege boundary, so the layout of the
//! wire-format types is fixed (`repr(C)` plus zerocopy derives) and the
//! enums all have explicit, stable discriminants.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of hardware protection slots. Low slots are pinned at boot; the
/// remainder form the per-owner active window, reloaded on context switch.
pub const HW_SLOTS: usize = 8;

/// Number of pinned low slots (kernel code, kernel data, system common).
pub const STATIC_SLOTS: usize = 3;

/// Size of the reloadable active window, in slots. The last active slot is
/// reserved for the owner's stack region.
pub const ACTIVE_SLOTS: usize = HW_SLOTS - STATIC_SLOTS;

/// Distinguished "heap mutex held" result from gate operations that touch a
/// heap. Never a valid success value; success values of gate heap calls are
/// pointers or zero.
pub const BUSY: u32 = 0xFFFF_FFFE;

/// Names a particular incarnation of a partition owner (task or LSR).
///
/// An `OwnerId` combines an index (predictable at compile time) with a
/// generation number that increments when the owner is restarted. A handle
/// held across a partition restart thus stops matching, instead of silently
/// referring to the new incarnation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OwnerId(pub u16);

impl OwnerId {
    /// The all-ones `OwnerId` is reserved to represent the kernel itself.
    pub const KERNEL: Self = Self(!0);

    /// Number of bits used for the index; the rest hold the generation.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates an `OwnerId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        OwnerId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track owner generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << OwnerId::INDEX_BITS >> OwnerId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

bitflags::bitflags! {
    /// Flags describing what can be done with a protection region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by the partition that includes it.
        const READ = 1 << 0;
        /// Region can be written by the partition that includes it.
        const WRITE = 1 << 1;
        /// Region can contain executable code.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers. This affects cache
        /// behavior and discourages bulk copies into the region.
        const DEVICE = 1 << 3;
        /// Region is accessible to privileged code only; unprivileged
        /// accesses fault.
        const PRIVILEGED = 1 << 4;

        const RESERVED = !((1 << 5) - 1);
    }
}

/// How long a blocking operation is willing to wait.
///
/// Every suspension point in the subsystem takes one of these; `NoWait` and
/// `Forever` are first-class rather than magic tick values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Fail immediately rather than block.
    NoWait,
    /// Block for at most this many kernel ticks.
    Ticks(u32),
    /// Block until the condition is satisfied, however long that takes.
    Forever,
}

impl Timeout {
    /// Interprets a raw tick count from a trapped frame: 0 means no wait,
    /// all-ones means forever.
    pub fn from_raw(ticks: u32) -> Self {
        match ticks {
            0 => Timeout::NoWait,
            u32::MAX => Timeout::Forever,
            n => Timeout::Ticks(n),
        }
    }

    /// Checks whether this timeout permits blocking at all.
    pub fn can_block(&self) -> bool {
        !matches!(self, Timeout::NoWait)
    }
}

/// Enumeration of gate operation numbers.
///
/// The gate's jump table is indexed by these; the numeric values are ABI and
/// must not be reordered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Gatenum {
    HeapAlloc = 0,
    HeapFree = 1,
    RegionBuild = 2,
    TableCreate = 3,
    SlotSwap = 4,
    SlotMove = 5,
    PortalOpen = 6,
    PortalSend = 7,
    PortalReceive = 8,
    PortalClose = 9,
    TunnelOpen = 10,
    TunnelSend = 11,
    TunnelReceive = 12,
    TunnelClose = 13,
}

/// We're using an explicit `TryFrom` impl for `Gatenum` instead of a derive
/// because the kernel doesn't currently depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Gatenum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::HeapAlloc),
            1 => Ok(Self::HeapFree),
            2 => Ok(Self::RegionBuild),
            3 => Ok(Self::TableCreate),
            4 => Ok(Self::SlotSwap),
            5 => Ok(Self::SlotMove),
            6 => Ok(Self::PortalOpen),
            7 => Ok(Self::PortalSend),
            8 => Ok(Self::PortalReceive),
            9 => Ok(Self::PortalClose),
            10 => Ok(Self::TunnelOpen),
            11 => Ok(Self::TunnelSend),
            12 => Ok(Self::TunnelReceive),
            13 => Ok(Self::TunnelClose),
            _ => Err(()),
        }
    }
}

/// Shape of a gate call, as asserted by the calling stub.
///
/// The jump table carries the authoritative shape for each operation; the
/// trap handler checks the caller's tag against it and faults on mismatch,
/// rather than trusting the caller's marshaling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CallShape {
    /// Up to four parameters passed inline in registers.
    Inline = 0,
    /// More than four parameters, the rest passed on the caller's stack and
    /// copied across the boundary by the trap handler.
    Stacked = 1,
    /// The operation may block across scheduling rounds; the handler records
    /// the target for a secondary asynchronous dispatch instead of
    /// completing inline.
    Deferred = 2,
}

impl core::convert::TryFrom<u32> for CallShape {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Inline),
            1 => Ok(Self::Stacked),
            2 => Ok(Self::Deferred),
            _ => Err(()),
        }
    }
}

/// Service header at the front of every free-message portal buffer.
///
/// The payload, if any, follows immediately after this header in the same
/// buffer. The server writes its result into `ret` and replies in place.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct ServiceHeader {
    /// Function id the server should dispatch on.
    pub fid: u32,
    /// Up to four inline parameters.
    pub params: [u32; 4],
    /// Return value, written by the server.
    pub ret: u32,
    /// Caller return address, for debugging only. Never trusted.
    pub caller: u32,
}

impl ServiceHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Commands carried in a tunnel message header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TunnelCmd {
    Open = 0,
    Send = 1,
    Receive = 2,
    Close = 3,
    Control = 4,
}

impl core::convert::TryFrom<u8> for TunnelCmd {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Open),
            1 => Ok(Self::Send),
            2 => Ok(Self::Receive),
            3 => Ok(Self::Close),
            4 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Per-chunk flags in a tunnel header.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TunnelFlags: u8 {
        /// Set on the first chunk of a transfer, exactly once.
        const START_OF_DATA = 1 << 0;
        /// Set on the chunk that satisfies the original request, exactly
        /// once.
        const END_OF_DATA = 1 << 1;
    }
}

/// Message type discriminator for tunnel headers. There is currently one
/// type; the field exists so the wire format can grow without breaking.
pub const TUNNEL_MSG_TYPE: u8 = 1;

/// Header at the front of a tunnel portal buffer.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TunnelHeader {
    /// Message type; must be `TUNNEL_MSG_TYPE`.
    pub kind: u8,
    /// One of `TunnelCmd`, as a raw byte on the wire.
    pub cmd: u8,
    /// Start/end-of-data flag bits.
    pub flags: u8,
    /// One of `PortalError`, as a raw byte; 0 when no error is pending.
    pub error: u8,
    /// Number of payload bytes in this chunk.
    pub data_size: u32,
    /// Total bytes the initiator asked to move in this transfer.
    pub requested: u32,
    /// Cumulative bytes moved so far, including this chunk.
    pub completed: u32,
}

impl TunnelHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Extra payload carried by an OPEN-tagged tunnel message, immediately after
/// the `TunnelHeader`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TunnelOpenInfo {
    /// Handle of the semaphore the server signals to wake the client.
    pub client_sem: u32,
    /// Handle of the semaphore the client signals to wake the server.
    pub server_sem: u32,
    /// Total header size the client will prepend to each message buffer.
    pub header_size: u32,
    /// Size of each message buffer, header included.
    pub msg_size: u32,
}

impl TunnelOpenInfo {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Protocol-level portal errors, reported through the portal error manager
/// and attached to the offending session only.
///
/// Timeouts are deliberately *not* in this enum; they are a distinct,
/// recoverable category and must never be conflated with protocol errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PortalError {
    /// Message carried a command outside the tunnel command set.
    InvalidCommand = 1,
    /// Message type discriminator was not recognized.
    InvalidType = 2,
    /// Free-message function id had no registered handler.
    InvalidFunction = 3,
    /// Message named a server that does not exist or is not serving.
    InvalidServer = 4,
    /// Sender was not on the server's permitted-clients list.
    AccessViolation = 5,
    /// A tunnel chunk could not be fully consumed by the server.
    TransIncomplete = 6,
    /// The server stalled past its timeout and the session was force
    /// closed.
    ServerTimeout = 7,
    /// Operation attempted on a portal that is not open.
    NotOpen = 8,
}

impl PortalError {
    /// Decodes a wire byte; 0 is "no error".
    pub fn from_wire(x: u8) -> Option<Self> {
        match x {
            1 => Some(Self::InvalidCommand),
            2 => Some(Self::InvalidType),
            3 => Some(Self::InvalidFunction),
            4 => Some(Self::InvalidServer),
            5 => Some(Self::AccessViolation),
            6 => Some(Self::TransIncomplete),
            7 => Some(Self::ServerTimeout),
            8 => Some(Self::NotOpen),
            _ => None,
        }
    }
}

/// A record describing a fault charged to a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The partition violated memory access rules, either intercepted by
    /// the protection hardware (`source` `User`) or detected during
    /// checking of trap arguments (`source` `Kernel`).
    MemoryAccess {
        /// Problematic address, when the hardware reports one precisely.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// The partition ran its stack into the guard.
    StackOverflow { address: u32 },
    /// Arguments passed through the gate were invalid.
    GateUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::GateUsage(e)
    }
}

/// A kernel-defined fault, arising from how a partition used the gate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// Caller's asserted call shape disagreed with the jump table.
    ShapeMismatch,
    /// Caller claimed more stack-resident parameters than the boundary
    /// copy buffer can hold.
    TooManyParams,
    /// Caller named an owner index that is out of range.
    OwnerOutOfRange,
    /// Caller attempted an operation it does not have authority for.
    NotPermitted,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultSource {
    /// Partition code did something that was intercepted by the processor.
    User,
    /// Partition code asked the kernel to do something bad on its behalf.
    Kernel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_id_round_trips_index_and_generation() {
        let id = OwnerId::for_index_and_gen(7, Generation::from(3));
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), Generation::from(3));
    }

    #[test]
    fn generation_mismatch_changes_id() {
        let a = OwnerId::for_index_and_gen(7, Generation::ZERO);
        let b = OwnerId::for_index_and_gen(7, Generation::ZERO.next());
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn service_header_layout_is_stable() {
        // Seven u32 fields, no padding.
        assert_eq!(ServiceHeader::SIZE, 28);
    }

    #[test]
    fn tunnel_header_layout_is_stable() {
        assert_eq!(TunnelHeader::SIZE, 16);
        assert_eq!(TunnelOpenInfo::SIZE, 16);
    }

    #[test]
    fn gatenum_rejects_unknown() {
        use core::convert::TryFrom;
        assert!(Gatenum::try_from(14).is_err());
        assert_eq!(Gatenum::try_from(10), Ok(Gatenum::TunnelOpen));
    }

    #[test]
    fn timeout_raw_decoding() {
        assert_eq!(Timeout::from_raw(0), Timeout::NoWait);
        assert_eq!(Timeout::from_raw(u32::MAX), Timeout::Forever);
        assert_eq!(Timeout::from_raw(500), Timeout::Ticks(500));
    }
}
