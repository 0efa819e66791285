// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel failure handling.
//!
//! When the kernel detects a condition it cannot attribute to a single
//! partition, such as a gate request for an operation that does not
//! exist, the whole system is compromised and the only safe move is to
//! stop. `die` records a short message in a fixed buffer where a
//! debugger (or a warm-boot handler) can find it, and halts.
//!
//! On the host, where tests run, `die` panics instead so that test
//! harnesses can observe it.

use core::fmt::Display;

/// Set to `true` before the kernel halts, so code inspecting a hung
/// system can distinguish a kernel failure from a wedged peripheral.
#[cfg(target_os = "none")]
static mut KERNEL_HAS_FAILED: bool = false;

/// Fixed buffer holding the failure message, NUL-padded.
#[cfg(target_os = "none")]
static mut KERNEL_EPITAPH: [u8; 128] = [0; 128];

/// Records `msg` and halts the system.
#[inline(never)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
fn die_impl(msg: &dyn Display) -> ! {
    use core::fmt::Write;

    cortex_m::interrupt::disable();

    // Safety: interrupts are off and this function never returns, so
    // nothing else can observe or race these statics while we write.
    let (failed, epitaph) = unsafe {
        (
            &mut *core::ptr::addr_of_mut!(KERNEL_HAS_FAILED),
            &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH),
        )
    };

    *failed = true;

    let mut w = Eulogist { buf: epitaph, pos: 0 };
    let _ = write!(w, "{msg}");

    loop {
        cortex_m::asm::bkpt();
    }
}

#[cfg(not(target_os = "none"))]
fn die_impl(msg: &dyn Display) -> ! {
    panic!("{msg}");
}

#[cfg(target_os = "none")]
struct Eulogist {
    buf: &'static mut [u8; 128],
    pos: usize,
}

#[cfg(target_os = "none")]
impl core::fmt::Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.pos;
        let n = s.len().min(room);
        self.buf[self.pos..self.pos + n].copy_from_slice(&s.as_bytes()[..n]);
        self.pos += n;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
