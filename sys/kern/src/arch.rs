// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support.
//!
//! The rest of the kernel computes; this module stores. Everything that
//! actually touches MPU registers lives behind this seam, with a fake
//! implementation for the host so the computing parts can be tested
//! without hardware.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
