// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition bookkeeping.
//!
//! A [`Task`] is the kernel's record of one partition: its identity, its
//! privilege, its stack region, and the protection table currently
//! attached to it. The scheduler proper lives outside this crate; tasks
//! here carry only what the protection machinery needs.

use crate::gate::{DeferredCall, GateTarget, INLINE_PARAMS};
use crate::heap::KernelHeap;
use crate::region::RegionDesc;
use crate::table::ProtTable;
use abi::{Generation, OwnerId};

pub struct Task {
    index: usize,
    generation: Generation,
    privileged: bool,
    create_permission: bool,
    stack_desc: RegionDesc,
    stack_bottom: u32,
    table: Option<ProtTable>,
    deferred: Option<DeferredCall>,
}

impl Task {
    pub fn new(
        index: usize,
        privileged: bool,
        create_permission: bool,
        stack_desc: RegionDesc,
    ) -> Self {
        Self {
            index,
            generation: Generation::ZERO,
            privileged,
            create_permission,
            stack_desc,
            stack_bottom: stack_desc.base,
            table: None,
            deferred: None,
        }
    }

    /// Identity of the current incarnation of this partition. Stale ids
    /// from before a restart compare unequal to this.
    pub fn current_id(&self) -> OwnerId {
        OwnerId::for_index_and_gen(self.index, self.generation)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Whether this partition may create protection tables for others.
    pub fn may_create_tables(&self) -> bool {
        self.create_permission
    }

    pub fn stack_desc(&self) -> &RegionDesc {
        &self.stack_desc
    }

    pub fn set_stack_desc(&mut self, desc: RegionDesc) {
        self.stack_desc = desc;
        self.stack_bottom = desc.base;
    }

    /// Lowest valid stack address, for the hardware stack limit on
    /// ARMv8-M.
    pub fn stack_bottom(&self) -> u32 {
        self.stack_bottom
    }

    pub fn table(&self) -> Option<&ProtTable> {
        self.table.as_ref()
    }

    pub fn table_mut(&mut self) -> Option<&mut ProtTable> {
        self.table.as_mut()
    }

    /// Installs `table`, returning the previous one so the caller can
    /// release it.
    pub fn replace_table(&mut self, table: Option<ProtTable>) -> Option<ProtTable> {
        core::mem::replace(&mut self.table, table)
    }

    pub fn set_deferred(&mut self, target: GateTarget, args: [u32; INLINE_PARAMS]) {
        self.deferred = Some(DeferredCall { target, args });
    }

    pub fn take_deferred(&mut self) -> Option<DeferredCall> {
        self.deferred.take()
    }

    /// Resets this partition for restart: the generation advances so
    /// outstanding ids go stale, the protection table is returned to the
    /// heap, and any pending deferred call is dropped.
    pub fn reinitialize(&mut self, heap: &mut dyn KernelHeap) {
        self.generation = self.generation.next();
        if let Some(table) = self.table.take() {
            table.release(heap);
        }
        self.deferred = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::test_support::BackedHeap;
    use crate::region::{build_from_existing, Scheme};
    use abi::RegionAttributes;

    pub(crate) fn stack_desc() -> RegionDesc {
        build_from_existing(
            0x2000_0000,
            1024,
            RegionAttributes::READ | RegionAttributes::WRITE,
            Scheme::PmsaV7,
            "stack",
        )
        .unwrap()
    }

    #[test]
    fn restart_invalidates_ids() {
        let mut heap = BackedHeap::new();
        let mut t = Task::new(3, false, false, stack_desc());
        let before = t.current_id();
        t.reinitialize(&mut heap);
        assert_ne!(before, t.current_id());
        assert_eq!(before.index(), t.current_id().index());
    }
}
