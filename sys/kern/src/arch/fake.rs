// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the MPU.
//!
//! Non-ARM builds get no-op register operations so the kernel still
//! compiles, and test builds additionally get an inspectable model of
//! the hardware: slot contents, enable state, stack limit, and a record
//! of the last reload's ordering, so tests can check not just what was
//! loaded but that it was loaded safely.

use crate::region::RegionDesc;
use abi::ACTIVE_SLOTS;

#[cfg(test)]
pub use state::*;

#[cfg(test)]
mod state {
    use super::*;
    use abi::HW_SLOTS;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Everything a test can observe about the modeled MPU.
    #[derive(Clone)]
    pub struct FakeMpu {
        pub slots: [RegionDesc; HW_SLOTS],
        pub enabled: bool,
        pub stack_limit: u32,
        pub last_reload: Option<ReloadRecord>,
    }

    /// How the most recent `apply_protection` behaved.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ReloadRecord {
        /// Every slot write happened while the MPU was disabled.
        pub writes_while_disabled: bool,
        pub slots_written: usize,
        pub reenabled: bool,
    }

    pub(super) static MPU: Mutex<FakeMpu> = Mutex::new(FakeMpu {
        slots: [RegionDesc::DISABLED; HW_SLOTS],
        enabled: false,
        stack_limit: 0,
        last_reload: None,
    });

    pub(super) fn mpu() -> MutexGuard<'static, FakeMpu> {
        MPU.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot for assertions.
    pub fn mpu_snapshot() -> FakeMpu {
        mpu().clone()
    }

    /// Serializes tests that drive the fake MPU and resets it.
    pub fn mpu_test_lock() -> MutexGuard<'static, ()> {
        static SERIAL: Mutex<()> = Mutex::new(());
        let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let mut m = mpu();
        m.slots = [RegionDesc::DISABLED; HW_SLOTS];
        m.enabled = false;
        m.stack_limit = 0;
        m.last_reload = None;
        guard
    }
}

pub fn apply_protection(window: &[RegionDesc; ACTIVE_SLOTS], stack_bottom: u32) {
    #[cfg(test)]
    {
        let mut m = state::mpu();
        m.enabled = false;
        let mut rec = ReloadRecord {
            writes_while_disabled: true,
            slots_written: 0,
            reenabled: false,
        };
        for (i, desc) in window.iter().enumerate() {
            rec.writes_while_disabled &= !m.enabled;
            m.slots[abi::STATIC_SLOTS + i] = *desc;
            rec.slots_written += 1;
        }
        m.enabled = true;
        rec.reenabled = true;
        m.stack_limit = stack_bottom;
        m.last_reload = Some(rec);
    }
    let _ = (window, stack_bottom);
}

pub fn write_slot(slot: usize, desc: &RegionDesc) {
    #[cfg(test)]
    {
        state::mpu().slots[slot] = *desc;
    }
    let _ = (slot, desc);
}

pub fn read_slot(slot: usize) -> RegionDesc {
    #[cfg(test)]
    {
        return state::mpu().slots[slot];
    }
    #[cfg(not(test))]
    {
        let _ = slot;
        RegionDesc::DISABLED
    }
}
