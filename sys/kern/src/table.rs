// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protection tables.
//!
//! A protection table is a heap-allocated array of region descriptors,
//! one per reloadable MPU slot, owned by exactly one partition. The
//! hardware engine copies it into the active window whenever its owner
//! is dispatched.
//!
//! The last slot of every table is reserved for the owner's stack
//! region. Table creation enforces that reservation and re-creation
//! preserves whatever stack descriptor the old table carried, so a
//! partition can rebuild its data regions without losing stack guard
//! adjustments made since boot.

use crate::heap::{HeapBlock, HeapError, KernelHeap};
use crate::region::RegionDesc;
use crate::task::Task;
use crate::template::Template;
use abi::ACTIVE_SLOTS;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// Caller does not hold the table-creation capability.
    NotPermitted,
    /// Unprivileged partitions may not rebuild their own table while
    /// running on it.
    SelfModify,
    /// Owner index names no partition.
    BadOwner,
    /// Selection mask is zero.
    EmptySelection,
    /// More regions selected than the table holds, counting the
    /// reserved stack slot.
    TableTooSmall,
    /// Table larger than the reloadable window.
    TableTooBig,
    /// Selection mask has bits beyond the template's entries.
    SelectionOutOfRange,
    /// A dynamic template entry points outside the supplied region
    /// list.
    BadDynamicIndex,
    Heap(HeapError),
}

impl From<HeapError> for CreateError {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

/// An owned protection table. Releasing it requires the heap it came
/// from; dropping one without releasing leaks the block, which is why
/// owners go through [`Task::reinitialize`] or [`create`].
#[derive(Debug)]
pub struct ProtTable {
    block: HeapBlock,
    len: usize,
}

impl ProtTable {
    /// Allocates a table of `len` disabled slots.
    fn new_in(heap: &mut dyn KernelHeap, len: usize) -> Result<Self, HeapError> {
        let size = core::mem::size_of::<RegionDesc>() * len;
        let align = core::mem::align_of::<RegionDesc>();
        let block = heap.allocate(size, align)?;
        let base = block.as_ptr().cast::<RegionDesc>();
        for i in 0..len {
            // Safety: the block is `len` descriptors big, suitably
            // aligned, and freshly allocated so nothing aliases it.
            unsafe { base.add(i).write(RegionDesc::DISABLED) };
        }
        Ok(Self { block, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slots(&self) -> &[RegionDesc] {
        // Safety: block holds `len` initialized descriptors and is
        // exclusively owned by this table.
        unsafe {
            core::slice::from_raw_parts(self.block.as_ptr().cast::<RegionDesc>(), self.len)
        }
    }

    pub fn slots_mut(&mut self) -> &mut [RegionDesc] {
        // Safety: as above, and `&mut self` gives us exclusive access.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.block.as_ptr().cast::<RegionDesc>(),
                self.len,
            )
        }
    }

    /// The reserved stack slot, always the last.
    pub fn stack_slot(&self) -> &RegionDesc {
        &self.slots()[self.len - 1]
    }

    pub fn set_slot(&mut self, index: usize, desc: RegionDesc) {
        self.slots_mut()[index] = desc;
    }

    pub fn release(self, heap: &mut dyn KernelHeap) {
        heap.free(self.block);
    }
}

/// Builds and installs a protection table for `owner` from `template`.
///
/// `selection` picks template entries by bit index; selected regions
/// land in the new table in ascending bit order, unused slots between
/// them and the stack slot stay disabled, and the owner's current stack
/// descriptor goes in the last slot. Any previous table is returned to
/// the heap.
///
/// All validation happens before the old table is touched, so a
/// rejected call leaves the owner exactly as it was.
pub fn create(
    tasks: &mut [Task],
    caller: usize,
    owner: usize,
    template: &Template<'_>,
    selection: u32,
    table_size: usize,
    dyn_regions: &[RegionDesc],
    heap: &mut dyn KernelHeap,
) -> Result<(), CreateError> {
    if !tasks[caller].may_create_tables() {
        return Err(CreateError::NotPermitted);
    }
    if owner >= tasks.len() {
        return Err(CreateError::BadOwner);
    }
    if caller == owner && !tasks[caller].is_privileged() {
        return Err(CreateError::SelfModify);
    }
    if selection == 0 {
        return Err(CreateError::EmptySelection);
    }
    let picked = selection.count_ones() as usize;
    // The last slot is spoken for, so `table_size` selected regions
    // would already collide with the stack.
    if picked >= table_size {
        return Err(CreateError::TableTooSmall);
    }
    if table_size > ACTIVE_SLOTS {
        return Err(CreateError::TableTooBig);
    }
    if template.len() < 32 && selection >> template.len() != 0 {
        return Err(CreateError::SelectionOutOfRange);
    }

    // Resolve everything up front; a dangling dynamic entry must not
    // cost the owner its existing table.
    let mut resolved = [RegionDesc::DISABLED; ACTIVE_SLOTS];
    let mut n = 0;
    for bit in 0..32 {
        if selection & (1 << bit) != 0 {
            resolved[n] = template
                .resolve(bit, dyn_regions)
                .ok_or(CreateError::BadDynamicIndex)?;
            n += 1;
        }
    }

    let owner_task = &mut tasks[owner];

    // The stack descriptor survives re-creation, including any changes
    // made to the old table's stack slot since it was built.
    let stack = match owner_task.replace_table(None) {
        Some(old) => {
            let stack = *old.stack_slot();
            old.release(heap);
            stack
        }
        None => *owner_task.stack_desc(),
    };

    let mut table = ProtTable::new_in(heap, table_size)?;
    table.slots_mut()[..picked].copy_from_slice(&resolved[..picked]);
    table.set_slot(table_size - 1, stack);
    owner_task.replace_table(Some(table));
    Ok(())
}
