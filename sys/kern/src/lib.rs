// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition kernel for ARMv7-M and ARMv8-M microcontrollers.
//!
//! This crate implements the protected-mode core of the Keep kernel: MPU
//! region descriptors, per-partition protection tables, atomic hardware
//! window reloads, and the gate through which unprivileged code calls
//! privileged services.
//!
//! # Architecture
//!
//! The kernel divides the MPU's hardware slots into a *static* range,
//! loaded once at boot and shared by everything, and an *active window*
//! that is reloaded on every partition switch from the running
//! partition's protection table. The last active slot always carries the
//! partition's stack region, so stack overflows fault instead of
//! corrupting neighbors.
//!
//! Unprivileged code never touches any of this directly. It traps
//! through the gate (`gate` module), which validates the request, runs
//! the privileged target, and returns a single `u32`.
//!
//! # Testing
//!
//! Everything that computes (encodings, window images, dispatch) is kept
//! separate from everything that pokes hardware, so the bulk of the
//! kernel is tested on the host against the fake MPU in `arch::fake`.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::undocumented_unsafe_blocks)]

/// Kernel debug output, feature-gated so production images carry none of
/// the formatting machinery.
#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        // Safety: stim 0 is reserved for the kernel; unprivileged code
        // cannot reach the ITM through the MPU window.
        unsafe {
            let itm = &mut *cortex_m::peripheral::ITM::PTR.cast_mut();
            cortex_m::iprintln!(&mut itm.stim[0], $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        // Safety: see above.
        unsafe {
            let itm = &mut *cortex_m::peripheral::ITM::PTR.cast_mut();
            cortex_m::iprintln!(&mut itm.stim[0], $s, $($tt)*);
        }
    };
}

#[cfg(not(feature = "klog-itm"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {
        { let _ = format_args!($s, $($tt)*); }
    };
}

pub mod arch;
pub mod engine;
pub mod err;
pub mod fail;
pub mod gate;
pub mod heap;
pub mod region;
pub mod table;
pub mod task;
pub mod template;
