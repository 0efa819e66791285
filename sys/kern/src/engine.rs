// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware protection engine.
//!
//! Slot geometry: of the [`abi::HW_SLOTS`] hardware slots, the first
//! [`abi::STATIC_SLOTS`] are pinned: loaded at boot with the system-wide
//! regions (kernel image, shared flash, peripherals) and never touched
//! on a partition switch. The rest form the *active window*, reloaded
//! from the dispatched partition's protection table. The window's last
//! slot always carries the partition's stack region.
//!
//! `window_image` is the pure half of the switch path and carries the
//! tests; `load` is the thin impure half.

use crate::arch;
use crate::region::RegionDesc;
use crate::task::Task;
use abi::{ACTIVE_SLOTS, HW_SLOTS, STATIC_SLOTS};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotError {
    OutOfRange,
    /// Static-slot operation aimed at a slot inside the reloadable
    /// window.
    InsideWindow,
    /// Partition has no protection table.
    NoTable,
}

/// Computes the active-window contents for a partition.
///
/// Table slots map to the window in order, except the table's stack
/// slot, which always lands in the window's last position; any gap
/// between them stays disabled. A partition with no table gets a window
/// that grants only its stack.
pub fn window_image(task: &Task) -> [RegionDesc; ACTIVE_SLOTS] {
    let mut image = [RegionDesc::DISABLED; ACTIVE_SLOTS];
    match task.table() {
        Some(table) => {
            let n = table.len();
            image[..n - 1].copy_from_slice(&table.slots()[..n - 1]);
            image[ACTIVE_SLOTS - 1] = *table.stack_slot();
        }
        None => {
            image[ACTIVE_SLOTS - 1] = *task.stack_desc();
        }
    }
    image
}

/// Reloads the hardware window for `task`. Called on every dispatch of
/// a protected partition.
pub fn load(task: &Task) {
    arch::apply_protection(&window_image(task), task.stack_bottom());
}

/// Loads one pinned slot. Boot-time and privileged use only; refuses
/// slots inside the reloadable window, which belong to `load`.
pub fn static_slot_load(slot: usize, desc: &RegionDesc) -> Result<(), SlotError> {
    if slot >= STATIC_SLOTS {
        return Err(SlotError::InsideWindow);
    }
    arch::write_slot(slot, desc);
    Ok(())
}

/// Exchanges `desc` with the current contents of a hardware slot.
///
/// Privileged use only, and not safe against re-entrant interruption:
/// an interrupt handler that swaps the same slot between our read and
/// write wins and is then lost.
pub fn slot_swap(slot: usize, desc: &mut RegionDesc) -> Result<(), SlotError> {
    if slot >= HW_SLOTS {
        return Err(SlotError::OutOfRange);
    }
    let old = arch::read_slot(slot);
    arch::write_slot(slot, desc);
    *desc = old;
    Ok(())
}

/// Hardware slot backing table slot `index` of a table `len` slots
/// long, per the window mapping in [`window_image`].
fn hw_slot_for(index: usize, len: usize) -> usize {
    if index == len - 1 {
        HW_SLOTS - 1
    } else {
        STATIC_SLOTS + index
    }
}

/// Copies table slot `src` over table slot `dest` in `task`'s table.
///
/// If `loaded` (the task's window is currently in hardware), the
/// destination's hardware slot is updated too, so the change takes
/// effect without waiting for the next dispatch.
pub fn slot_move(
    task: &mut Task,
    dest: usize,
    src: usize,
    loaded: bool,
) -> Result<(), SlotError> {
    let table = task.table_mut().ok_or(SlotError::NoTable)?;
    let len = table.len();
    if dest >= len || src >= len {
        return Err(SlotError::OutOfRange);
    }
    let desc = table.slots()[src];
    table.set_slot(dest, desc);
    if loaded {
        arch::write_slot(hw_slot_for(dest, len), &desc);
    }
    Ok(())
}
