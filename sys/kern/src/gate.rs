// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gate: the one path from unprivileged code into kernel services.
//!
//! Unprivileged code traps with an operation number, a shape tag, and
//! parameters; the handler looks the operation up in a jump table,
//! checks the caller's shape tag against the table's authoritative
//! shape, marshals parameters across the privilege boundary, and runs
//! the target. Every operation produces exactly one `u32` result.
//!
//! Three call shapes exist. *Inline* operations take up to four
//! register parameters and complete before the trap returns. *Stacked*
//! operations carry additional parameters on the caller's stack, which
//! the handler copies into kernel memory before the target sees them
//! (targets never dereference caller stacks). *Deferred* operations are
//! recorded against the calling partition and dispatched later from
//! kernel context, for work that may block across scheduling rounds.
//!
//! # Busy retry
//!
//! Targets that take the kernel heap mutex can fail transiently. When a
//! target reports [`GateResult::Busy`] and the caller supplied a
//! nonzero wait, the handler parks the caller on the mutex, re-issues
//! the call exactly once when it acquires, and gives up with
//! [`abi::BUSY`] if the second attempt is also unlucky. With no wait,
//! [`abi::BUSY`] comes back immediately; a timed-out wait yields a null
//! result. The single-retry rule keeps a hostile caller from pinning
//! the handler in a retry loop.
//!
//! # Hostility
//!
//! A shape tag that contradicts the jump table faults the caller: it
//! means the calling stub was not one of ours. An operation number
//! beyond the table halts the kernel outright, because the jump table
//! and the stub library are built from the same enumeration and a
//! mismatch means the system's images don't belong together.

use crate::err::UserError;
use crate::fail;
use crate::heap::{HeapBlock, HeapError, KernelHeap};
use crate::task::Task;
use abi::{CallShape, FaultInfo, Gatenum, OwnerId, Timeout, UsageError};

/// Parameters passed in registers.
pub const INLINE_PARAMS: usize = 4;
/// Parameters the handler will copy from the caller's stack, at most.
pub const MAX_STACK_PARAMS: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GateResult {
    Done(u32),
    /// The kernel heap mutex is held; the handler owns retry policy.
    Busy,
}

/// A gate operation's implementation. Parameters arrive already copied
/// into kernel memory.
pub type GateTarget = fn(&mut GateCtx<'_>, &[u32]) -> GateResult;

/// A recorded deferred operation, waiting for secondary dispatch.
#[derive(Copy, Clone)]
pub struct DeferredCall {
    pub target: GateTarget,
    pub args: [u32; INLINE_PARAMS],
}

pub struct GateEntry {
    pub num: Gatenum,
    pub shape: CallShape,
    pub target: GateTarget,
}

/// The jump table. Entry order must match the operation numbering so
/// lookup is a bounds-checked index, nothing more.
pub struct GateTable<'a> {
    entries: &'a [GateEntry],
}

impl<'a> GateTable<'a> {
    pub fn new(entries: &'a [GateEntry]) -> Self {
        for (i, e) in entries.iter().enumerate() {
            assert!(e.num as u32 == i as u32);
        }
        Self { entries }
    }

    fn lookup(&self, op: u32) -> Option<&GateEntry> {
        self.entries.get(op as usize)
    }
}

/// Kernel-side state a gate target may touch.
pub struct GateCtx<'a> {
    pub tasks: &'a mut [Task],
    /// Index of the trapping partition in `tasks`.
    pub caller: usize,
    pub heap: &'a mut dyn KernelHeap,
    pub hooks: &'a mut dyn GateHooks,
}

impl GateCtx<'_> {
    pub fn caller_id(&self) -> OwnerId {
        self.tasks[self.caller].current_id()
    }
}

/// Scheduler-side services the gate needs but does not implement.
pub trait GateHooks {
    /// Parks the caller until the kernel heap mutex is free or `timeout`
    /// expires. Returns whether the mutex was acquired.
    fn wait_heap_mutex(&mut self, timeout: Timeout) -> bool;
    /// Queues `owner`'s recorded deferred call for kernel-context
    /// dispatch.
    fn schedule_deferred(&mut self, owner: OwnerId);
}

/// What the trap stub captured, plus where the result goes.
pub struct TrapFrame<'a> {
    pub op: u32,
    /// Caller-asserted shape tag, raw.
    pub shape: u32,
    pub args: [u32; INLINE_PARAMS],
    /// Extra parameters, already read out of the caller's stack by the
    /// arch entry sequence.
    pub stack_args: &'a [u32],
    /// Raw wait argument for busy retry, decoded via
    /// [`Timeout::from_raw`].
    pub wait: u32,
    pub ret: u32,
}

/// Entry point from the trap stub. On `Err`, the caller takes the
/// returned fault instead of resuming.
pub fn handle(
    table: &GateTable<'_>,
    ctx: &mut GateCtx<'_>,
    frame: &mut TrapFrame<'_>,
) -> Result<(), FaultInfo> {
    match dispatch(table, ctx, frame) {
        Ok(v) | Err(UserError::Recoverable(v)) => {
            frame.ret = v;
            Ok(())
        }
        Err(UserError::Unrecoverable(f)) => Err(f),
    }
}

fn dispatch(
    table: &GateTable<'_>,
    ctx: &mut GateCtx<'_>,
    frame: &mut TrapFrame<'_>,
) -> Result<u32, UserError> {
    let Some(entry) = table.lookup(frame.op) else {
        klog!("gate: no such operation {}", frame.op);
        fail::die(format_args!("gate operation {} out of table", frame.op));
    };

    let shape = CallShape::try_from(frame.shape)
        .map_err(|()| FaultInfo::GateUsage(UsageError::ShapeMismatch))?;
    if shape != entry.shape {
        return Err(FaultInfo::GateUsage(UsageError::ShapeMismatch).into());
    }

    if entry.shape == CallShape::Deferred {
        ctx.tasks[ctx.caller].set_deferred(entry.target, frame.args);
        let id = ctx.caller_id();
        ctx.hooks.schedule_deferred(id);
        return Ok(0);
    }

    let mut params = [0u32; INLINE_PARAMS + MAX_STACK_PARAMS];
    params[..INLINE_PARAMS].copy_from_slice(&frame.args);
    let n = if entry.shape == CallShape::Stacked {
        let extra = frame.stack_args.len();
        if extra > MAX_STACK_PARAMS {
            return Err(FaultInfo::GateUsage(UsageError::TooManyParams).into());
        }
        params[INLINE_PARAMS..INLINE_PARAMS + extra]
            .copy_from_slice(frame.stack_args);
        INLINE_PARAMS + extra
    } else {
        INLINE_PARAMS
    };

    match (entry.target)(ctx, &params[..n]) {
        GateResult::Done(v) => Ok(v),
        GateResult::Busy => {
            let timeout = Timeout::from_raw(frame.wait);
            if !timeout.can_block() {
                return Ok(abi::BUSY);
            }
            if !ctx.hooks.wait_heap_mutex(timeout) {
                // Timed out; a null result, not an error.
                return Ok(0);
            }
            // One retry only.
            match (entry.target)(ctx, &params[..n]) {
                GateResult::Done(v) => Ok(v),
                GateResult::Busy => Ok(abi::BUSY),
            }
        }
    }
}

/// Runs the caller's recorded deferred call, if any. Invoked from
/// kernel context after [`GateHooks::schedule_deferred`] fires.
pub fn run_deferred(ctx: &mut GateCtx<'_>) -> Option<u32> {
    let call = ctx.tasks[ctx.caller].take_deferred()?;
    Some(match (call.target)(ctx, &call.args) {
        GateResult::Done(v) => v,
        GateResult::Busy => abi::BUSY,
    })
}

/// Heap allocation, as a gate target. `params[0]` is the size,
/// `params[1]` the alignment. Returns the block address, zero on
/// failure.
pub fn gate_heap_alloc(ctx: &mut GateCtx<'_>, params: &[u32]) -> GateResult {
    match ctx.heap.allocate(params[0] as usize, (params[1] as usize).max(1)) {
        Ok(block) => GateResult::Done(block.addr()),
        Err(HeapError::Busy) => GateResult::Busy,
        Err(_) => GateResult::Done(0),
    }
}

/// Heap release, as a gate target. `params[0]` is the block address,
/// `params[1]` its size. The heap implementation is responsible for
/// rejecting addresses it never handed out.
pub fn gate_heap_free(ctx: &mut GateCtx<'_>, params: &[u32]) -> GateResult {
    let Some(ptr) = core::ptr::NonNull::new(params[0] as usize as *mut u8) else {
        return GateResult::Done(0);
    };
    // Safety: ownership of the block travels with the (address, size)
    // pair; the heap validates it came from there.
    let block = unsafe { HeapBlock::from_raw(ptr, params[1] as usize) };
    ctx.heap.free(block);
    GateResult::Done(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::test_support::AddressHeap;
    use crate::region::{build_from_existing, Scheme};
    use abi::RegionAttributes;
    use std::cell::Cell;

    thread_local! {
        static CALLS: Cell<usize> = const { Cell::new(0) };
        static SEEN: Cell<[u32; 12]> = const { Cell::new([0; 12]) };
    }

    fn add_target(_ctx: &mut GateCtx<'_>, p: &[u32]) -> GateResult {
        CALLS.with(|c| c.set(c.get() + 1));
        GateResult::Done(p.iter().sum())
    }

    fn sum_all_target(_ctx: &mut GateCtx<'_>, p: &[u32]) -> GateResult {
        let mut seen = [0u32; 12];
        seen[..p.len()].copy_from_slice(p);
        SEEN.with(|s| s.set(seen));
        GateResult::Done(p.len() as u32)
    }

    fn busy_twice_target(_ctx: &mut GateCtx<'_>, p: &[u32]) -> GateResult {
        CALLS.with(|c| c.set(c.get() + 1));
        if CALLS.with(Cell::get) <= 2 {
            GateResult::Busy
        } else {
            GateResult::Done(p.iter().sum())
        }
    }

    fn busy_once_target(_ctx: &mut GateCtx<'_>, p: &[u32]) -> GateResult {
        CALLS.with(|c| c.set(c.get() + 1));
        if CALLS.with(Cell::get) <= 1 {
            GateResult::Busy
        } else {
            GateResult::Done(p.iter().sum())
        }
    }

    struct Hooks {
        acquire: bool,
        waits: usize,
        scheduled: Vec<OwnerId>,
    }

    impl Hooks {
        fn new(acquire: bool) -> Self {
            Self { acquire, waits: 0, scheduled: Vec::new() }
        }
    }

    impl GateHooks for Hooks {
        fn wait_heap_mutex(&mut self, _timeout: Timeout) -> bool {
            self.waits += 1;
            self.acquire
        }

        fn schedule_deferred(&mut self, owner: OwnerId) {
            self.scheduled.push(owner);
        }
    }

    fn stack() -> crate::region::RegionDesc {
        build_from_existing(
            0x2000_F000,
            1024,
            RegionAttributes::READ | RegionAttributes::WRITE,
            Scheme::PmsaV7,
            "stack",
        )
        .unwrap()
    }

    fn table_for(shape0: CallShape, target0: GateTarget) -> [GateEntry; 2] {
        [
            GateEntry { num: Gatenum::HeapAlloc, shape: shape0, target: target0 },
            GateEntry {
                num: Gatenum::HeapFree,
                shape: CallShape::Inline,
                target: gate_heap_free,
            },
        ]
    }

    fn frame(op: u32, shape: CallShape, args: [u32; 4], wait: u32) -> TrapFrame<'static> {
        TrapFrame { op, shape: shape as u32, args, stack_args: &[], wait, ret: 0 }
    }

    struct Rig {
        tasks: Vec<Task>,
        heap: AddressHeap,
        hooks: Hooks,
    }

    impl Rig {
        fn new(acquire: bool) -> Self {
            CALLS.with(|c| c.set(0));
            Self {
                tasks: vec![Task::new(0, false, false, stack())],
                heap: AddressHeap::new(0x2000_0000),
                hooks: Hooks::new(acquire),
            }
        }

        fn ctx(&mut self) -> GateCtx<'_> {
            GateCtx {
                tasks: &mut self.tasks,
                caller: 0,
                heap: &mut self.heap,
                hooks: &mut self.hooks,
            }
        }
    }

    #[test]
    fn inline_call_returns_one_word() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Inline, add_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Inline, [1, 2, 3, 4], 0);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, 10);
        assert_eq!(CALLS.with(Cell::get), 1);
    }

    #[test]
    #[should_panic(expected = "out of table")]
    fn unknown_operation_halts_the_kernel() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Inline, add_target);
        let table = GateTable::new(&entries);
        let mut f = frame(99, CallShape::Inline, [0; 4], 0);
        let _ = handle(&table, &mut rig.ctx(), &mut f);
    }

    #[test]
    fn lying_shape_tag_faults_the_caller() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Inline, add_target);
        let table = GateTable::new(&entries);

        let mut f = frame(0, CallShape::Stacked, [0; 4], 0);
        assert_eq!(
            handle(&table, &mut rig.ctx(), &mut f),
            Err(FaultInfo::GateUsage(UsageError::ShapeMismatch)),
        );
        // Target never ran.
        assert_eq!(CALLS.with(Cell::get), 0);

        // Garbage tag, same treatment.
        let mut f = frame(0, CallShape::Inline, [0; 4], 0);
        f.shape = 7;
        assert_eq!(
            handle(&table, &mut rig.ctx(), &mut f),
            Err(FaultInfo::GateUsage(UsageError::ShapeMismatch)),
        );
    }

    #[test]
    fn stacked_params_are_copied_across() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Stacked, sum_all_target);
        let table = GateTable::new(&entries);

        let extra = [5, 6, 7];
        let mut f = frame(0, CallShape::Stacked, [1, 2, 3, 4], 0);
        f.stack_args = &extra;
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, 7);
        let seen = SEEN.with(Cell::get);
        assert_eq!(&seen[..7], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn too_many_stacked_params_fault() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Stacked, sum_all_target);
        let table = GateTable::new(&entries);

        let extra = [0u32; MAX_STACK_PARAMS + 1];
        let mut f = frame(0, CallShape::Stacked, [0; 4], 0);
        f.stack_args = &extra;
        assert_eq!(
            handle(&table, &mut rig.ctx(), &mut f),
            Err(FaultInfo::GateUsage(UsageError::TooManyParams)),
        );
    }

    #[test]
    fn busy_without_wait_returns_sentinel() {
        let mut rig = Rig::new(true);
        let entries = table_for(CallShape::Inline, busy_once_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Inline, [0; 4], 0);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, abi::BUSY);
        assert_eq!(rig.hooks.waits, 0);
    }

    #[test]
    fn busy_with_wait_retries_exactly_once() {
        let mut rig = Rig::new(true);
        let entries = table_for(CallShape::Inline, busy_once_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Inline, [1, 1, 0, 0], 10);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, 2);
        assert_eq!(rig.hooks.waits, 1);
        assert_eq!(CALLS.with(Cell::get), 2);
    }

    #[test]
    fn still_busy_after_retry_gives_up() {
        let mut rig = Rig::new(true);
        let entries = table_for(CallShape::Inline, busy_twice_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Inline, [0; 4], u32::MAX);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, abi::BUSY);
        // Two calls, not an unbounded loop.
        assert_eq!(CALLS.with(Cell::get), 2);
        assert_eq!(rig.hooks.waits, 1);
    }

    #[test]
    fn mutex_timeout_yields_null_result() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Inline, busy_once_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Inline, [0; 4], 10);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_eq!(f.ret, 0);
        assert_eq!(CALLS.with(Cell::get), 1);
    }

    #[test]
    fn deferred_calls_run_later_from_kernel_context() {
        let mut rig = Rig::new(false);
        let entries = table_for(CallShape::Deferred, add_target);
        let table = GateTable::new(&entries);
        let mut f = frame(0, CallShape::Deferred, [2, 3, 0, 0], 0);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();

        // Not executed at trap time; recorded and scheduled.
        assert_eq!(CALLS.with(Cell::get), 0);
        let id = rig.tasks[0].current_id();
        assert_eq!(rig.hooks.scheduled, vec![id]);

        assert_eq!(run_deferred(&mut rig.ctx()), Some(5));
        assert_eq!(CALLS.with(Cell::get), 1);
        // Consumed; nothing left to run.
        assert_eq!(run_deferred(&mut rig.ctx()), None);
    }

    #[test]
    fn heap_targets_round_trip_and_report_busy() {
        let mut rig = Rig::new(true);
        rig.heap.busy_for = 1;
        let entries = table_for(CallShape::Inline, gate_heap_alloc);
        let table = GateTable::new(&entries);

        // First attempt hits the busy heap, retry lands.
        let mut f = frame(0, CallShape::Inline, [256, 4, 0, 0], 10);
        handle(&table, &mut rig.ctx(), &mut f).unwrap();
        assert_ne!(f.ret, abi::BUSY);
        assert_ne!(f.ret, 0);
        assert_eq!(rig.heap.live, 1);

        let mut f2 = frame(1, CallShape::Inline, [f.ret, 256, 0, 0], 0);
        handle(&table, &mut rig.ctx(), &mut f2).unwrap();
        assert_eq!(f2.ret, 1);
        assert_eq!(rig.heap.live, 0);
    }
}
