// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M / ARMv8-M MPU access.
//!
//! The kernel keeps a shadow copy of every hardware slot, because the
//! MPU's registers are write-mostly on some parts and because slot
//! exchange needs the old contents without a round trip through RNR
//! reads. The shadow is authoritative for reads; hardware is
//! authoritative for enforcement.

use crate::region::{Encoding, RegionDesc};
use abi::{ACTIVE_SLOTS, HW_SLOTS, STATIC_SLOTS};

const MPU_ENABLE: u32 = 1;
const MPU_PRIVDEFENA: u32 = 1 << 2;

static mut HW_SHADOW: [RegionDesc; HW_SLOTS] = [RegionDesc::DISABLED; HW_SLOTS];

/// Raw register words for one slot: (RBAR, RASR) on v7, (RBAR, RLAR) on
/// v8. Disabled slots are all zero on both.
fn slot_words(desc: &RegionDesc) -> (u32, u32) {
    match desc.encoding {
        Encoding::Disabled => (0, 0),
        Encoding::PmsaV7 { rbar, rasr } => (rbar, rasr),
        Encoding::PmsaV8 { rbar, rlar, .. } => (rbar, rlar),
    }
}

#[cfg(feature = "armv8m")]
fn mair_byte(desc: &RegionDesc) -> u8 {
    match desc.encoding {
        Encoding::PmsaV8 { mair, .. } => mair,
        _ => 0,
    }
}

/// Programs one hardware slot. Caller must hold off interrupts.
fn store_slot(slot: usize, desc: &RegionDesc) {
    // Safety: the MPU is owned by the kernel; unprivileged code cannot
    // reach it and interrupts are masked by our callers.
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };
    let (w0, w1) = slot_words(desc);

    // Safety: register writes with values computed by the region
    // builders; RNR selects the slot for the two data writes.
    unsafe {
        mpu.rnr.write(slot as u32);
        cfg_if::cfg_if! {
            if #[cfg(feature = "armv8m")] {
                mpu.rbar.write(w0);
                mpu.rlar.write(w1);
            } else {
                mpu.rbar.write(w0);
                mpu.rasr.write(w1);
            }
        }
    }

    // Safety: interrupts are masked, so the shadow cannot be observed
    // mid-update.
    unsafe {
        (*core::ptr::addr_of_mut!(HW_SHADOW))[slot] = *desc;
    }
}

#[cfg(feature = "armv8m")]
fn store_mair(shadow: &[RegionDesc; HW_SLOTS]) {
    let mut lo = 0u32;
    let mut hi = 0u32;
    for (i, desc) in shadow.iter().enumerate() {
        let b = mair_byte(desc) as u32;
        if i < 4 {
            lo |= b << (i * 8);
        } else {
            hi |= b << ((i - 4) * 8);
        }
    }
    // Safety: kernel-owned peripheral, interrupts masked by callers.
    unsafe {
        let mpu = &*cortex_m::peripheral::MPU::PTR;
        mpu.mair[0].write(lo);
        mpu.mair[1].write(hi);
    }
}

#[cfg(feature = "armv8m")]
fn set_stack_limit(stack_bottom: u32) {
    // Safety: writing PSPLIM only constrains the process stack pointer.
    unsafe {
        core::arch::asm!("msr PSPLIM, {}", in(reg) stack_bottom);
    }
}

#[cfg(not(feature = "armv8m"))]
fn set_stack_limit(_stack_bottom: u32) {
    // v7 has no hardware stack limit; the stack region's bounds do the
    // job through ordinary access faults.
}

/// Reloads the active window for a partition switch.
///
/// The MPU is disabled across the slot writes so an interrupt taken
/// mid-reload never runs against a half-old, half-new window, and
/// re-enabled with PRIVDEFENA so the kernel itself keeps the default
/// map.
pub fn apply_protection(window: &[RegionDesc; ACTIVE_SLOTS], stack_bottom: u32) {
    cortex_m::interrupt::free(|_| {
        // Safety: kernel-owned peripheral, interrupts masked.
        let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };
        // Safety: turning the MPU off cannot create an access the
        // kernel could not already make (PRIVDEFENA).
        unsafe { mpu.ctrl.write(0) };

        for (i, desc) in window.iter().enumerate() {
            store_slot(STATIC_SLOTS + i, desc);
        }

        #[cfg(feature = "armv8m")]
        {
            // Safety: interrupts masked; shared reference to the shadow
            // is sound while nothing mutates it.
            let shadow = unsafe { &*core::ptr::addr_of!(HW_SHADOW) };
            store_mair(shadow);
        }

        cortex_m::asm::dsb();
        // Safety: all slots in the window are now consistent.
        unsafe { mpu.ctrl.write(MPU_ENABLE | MPU_PRIVDEFENA) };
        cortex_m::asm::isb();

        set_stack_limit(stack_bottom);
    });
}

/// Writes one hardware slot directly, shadow included.
pub fn write_slot(slot: usize, desc: &RegionDesc) {
    cortex_m::interrupt::free(|_| store_slot(slot, desc));
}

/// Returns the shadow copy of one hardware slot.
pub fn read_slot(slot: usize) -> RegionDesc {
    cortex_m::interrupt::free(|_| {
        // Safety: interrupts masked, no writer can be mid-update.
        unsafe { (*core::ptr::addr_of!(HW_SHADOW))[slot] }
    })
}
