// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MPU region descriptors and the builders that produce them.
//!
//! A [`RegionDesc`] pairs the logical description of a memory span (base,
//! size, access attributes) with the hardware words that program one MPU
//! slot. The words are precomputed here, once, so the partition switch
//! path never computes anything: it just stores.
//!
//! Two generations of the ARM protection architecture are supported:
//!
//! - **PMSAv7** (ARMv7-M): regions are power-of-two sized and naturally
//!   aligned. Regions of 256 bytes or more divide into eight subregions
//!   that can be disabled individually, which lets a descriptor cover
//!   5/8, 6/8, or 7/8 of its power-of-two envelope exactly. Sizes that
//!   hit none of those shapes round up to the next shape that fits.
//!
//! - **PMSAv8** (ARMv8-M): regions are base/limit pairs at 32-byte
//!   granularity, with attributes indirected through MAIR.
//!
//! Builders take memory from a kernel heap, from a fixed block pool, or
//! describe memory the caller already owns. All of them either return a
//! fully valid descriptor or an error; no partially initialized
//! descriptor ever escapes.

use crate::heap::{HeapBlock, HeapError, KernelHeap};
use abi::RegionAttributes;
use core::ptr::NonNull;

/// Smallest regionable size on either architecture, in bytes.
pub const MIN_REGION_SIZE: u32 = 32;

/// Largest regionable size, in bytes. The builders work in 32-bit
/// arithmetic; a larger span has no power-of-two envelope that fits,
/// so it is rejected up front instead of computed wrong.
pub const MAX_REGION_SIZE: u32 = 1 << 31;

/// Which encoding the MPU in this build understands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Scheme {
    PmsaV7,
    PmsaV8,
}

/// Scheme selected for the running image.
pub fn active_scheme() -> Scheme {
    if cfg!(feature = "armv8m") {
        Scheme::PmsaV8
    } else {
        Scheme::PmsaV7
    }
}

/// Precomputed MPU register contents for one slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// Slot is off. Loads as an all-zero register pair on either
    /// architecture.
    Disabled,
    /// ARMv7-M RBAR/RASR pair, enable bit set, SRD folded in.
    PmsaV7 { rbar: u32, rasr: u32 },
    /// ARMv8-M RBAR/RLAR pair plus the MAIR attribute byte for this
    /// slot's attribute index.
    PmsaV8 { rbar: u32, rlar: u32, mair: u8 },
}

/// One protection slot's worth of description.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    /// Lowest address covered.
    pub base: u32,
    /// Bytes actually granted, which may be less than the hardware
    /// envelope on PMSAv7 (disabled subregions make up the difference).
    pub size: u32,
    pub attributes: RegionAttributes,
    pub encoding: Encoding,
    /// Diagnostic label, not used by hardware.
    pub name: &'static str,
}

impl RegionDesc {
    /// The descriptor loaded into slots that grant nothing.
    pub const DISABLED: Self = Self {
        base: 0,
        size: 0,
        attributes: RegionAttributes::empty(),
        encoding: Encoding::Disabled,
        name: "",
    };

    pub fn is_enabled(&self) -> bool {
        self.encoding != Encoding::Disabled
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionError {
    /// Below [`MIN_REGION_SIZE`].
    Undersize,
    /// Above [`MAX_REGION_SIZE`].
    Oversize,
    /// Base not aligned as the encoding requires.
    Misaligned,
    /// The exact span cannot be expressed by the hardware, and the
    /// builder is not allowed to round it (pre-existing memory).
    Unrepresentable,
    Heap(HeapError),
}

impl From<HeapError> for RegionError {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

/// A fixed-block allocator whose blocks are power-of-two sized and
/// naturally aligned, so every block is regionable with no rounding.
pub trait BlockPool {
    /// Size of every block, in bytes. Power of two, at least
    /// [`MIN_REGION_SIZE`].
    fn block_size(&self) -> u32;
    fn acquire(&mut self) -> Option<NonNull<u8>>;
    fn release(&mut self, block: NonNull<u8>);
}

/// PMSAv7 shape for a requested size: the power-of-two envelope, the
/// bytes actually enabled, and the subregion-disable mask.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct V7Class {
    pub envelope: u32,
    pub span: u32,
    pub srd: u8,
}

/// Chooses the cheapest PMSAv7 shape covering `size` bytes.
pub(crate) fn v7_class(size: u32) -> Result<V7Class, RegionError> {
    if size < MIN_REGION_SIZE {
        return Err(RegionError::Undersize);
    }
    if size > MAX_REGION_SIZE {
        return Err(RegionError::Oversize);
    }
    let envelope = size.next_power_of_two();
    if envelope >= 256 {
        // Subregions exist; maybe we can disable the top few.
        let sub = envelope / 8;
        let k = size.div_ceil(sub);
        if k < 8 {
            return Ok(V7Class {
                envelope,
                span: k * sub,
                srd: !((1u16 << k) - 1) as u8,
            });
        }
    }
    Ok(V7Class { envelope, span: envelope, srd: 0 })
}

/// Exact-fit variant of [`v7_class`]: fails instead of rounding up,
/// for memory whose extent the builder must not exceed.
fn v7_class_exact(size: u32) -> Result<V7Class, RegionError> {
    let class = v7_class(size)?;
    if class.span != size {
        return Err(RegionError::Unrepresentable);
    }
    Ok(class)
}

fn encode_v7(base: u32, class: &V7Class, atts: RegionAttributes) -> Encoding {
    // Builders hand us aligned bases; anything else is a kernel bug.
    assert!(base % class.envelope == 0);

    let xn = !atts.contains(RegionAttributes::EXECUTE);
    let ap = if atts.contains(RegionAttributes::PRIVILEGED) {
        if atts.contains(RegionAttributes::WRITE) {
            0b001
        } else {
            0b101
        }
    } else if atts.contains(RegionAttributes::WRITE) {
        0b011
    } else if atts.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b000
    };
    let (tex, scb) = if atts.contains(RegionAttributes::DEVICE) {
        // Strongly ordered.
        (0b000, 0b001)
    } else {
        // Write-back, write-allocate, not shared.
        (0b001, 0b011)
    };
    // RASR.SIZE encodes region size 2**(SIZE + 1).
    let l2size = 30 - class.envelope.leading_zeros();

    let rasr = (xn as u32) << 28
        | ap << 24
        | tex << 19
        | scb << 16
        | (class.srd as u32) << 8
        | l2size << 1
        | 1;
    Encoding::PmsaV7 { rbar: base, rasr }
}

fn encode_v8(base: u32, span: u32, atts: RegionAttributes) -> Encoding {
    assert!(base % MIN_REGION_SIZE == 0);
    assert!(span % MIN_REGION_SIZE == 0 && span != 0);

    let xn = !atts.contains(RegionAttributes::EXECUTE);
    let ap = if atts.contains(RegionAttributes::PRIVILEGED) {
        if atts.contains(RegionAttributes::WRITE) {
            0b00
        } else {
            0b10
        }
    } else if atts.contains(RegionAttributes::WRITE) {
        0b01
    } else {
        0b11
    };
    let (mair, sh) = if atts.contains(RegionAttributes::DEVICE) {
        // Device, nGnRnE.
        (0b0000_0000, 0b10)
    } else {
        // Normal, write-back, read/write-allocate, not shared.
        (0b1111_1111, 0b00)
    };
    let rbar = base | sh << 3 | ap << 1 | xn as u32;
    let rlar = (base + span - 32) | 1;
    Encoding::PmsaV8 { rbar, rlar, mair }
}

fn round_up_32(size: u32) -> u32 {
    (size + 31) & !31
}

/// Builds a region over fresh heap memory.
///
/// The allocation is sized and aligned so that the hardware span and the
/// allocation coincide exactly: on PMSAv7 the block is `span` bytes
/// aligned to the power-of-two envelope, on PMSAv8 it is the size
/// rounded to 32 bytes. On success the caller owns both the block and
/// the descriptor over it; on failure the heap is untouched beyond the
/// failed allocation.
pub fn build_from_heap(
    heap: &mut dyn KernelHeap,
    size: u32,
    attributes: RegionAttributes,
    scheme: Scheme,
    name: &'static str,
) -> Result<(HeapBlock, RegionDesc), RegionError> {
    match scheme {
        Scheme::PmsaV7 => {
            let class = v7_class(size)?;
            let block = heap.allocate(class.span as usize, class.envelope as usize)?;
            let encoding = encode_v7(block.addr(), &class, attributes);
            let desc = RegionDesc {
                base: block.addr(),
                size: class.span,
                attributes,
                encoding,
                name,
            };
            Ok((block, desc))
        }
        Scheme::PmsaV8 => {
            if size < MIN_REGION_SIZE {
                return Err(RegionError::Undersize);
            }
            if size > MAX_REGION_SIZE {
                return Err(RegionError::Oversize);
            }
            let span = round_up_32(size);
            let block = heap.allocate(span as usize, MIN_REGION_SIZE as usize)?;
            let encoding = encode_v8(block.addr(), span, attributes);
            let desc = RegionDesc {
                base: block.addr(),
                size: span,
                attributes,
                encoding,
                name,
            };
            Ok((block, desc))
        }
    }
}

/// Builds a region over one block from a fixed pool.
///
/// The pool contract (power-of-two block size, natural alignment) means
/// no size arithmetic is needed, making this the cheap path for
/// message-buffer style regions.
pub fn build_from_pool(
    pool: &mut dyn BlockPool,
    attributes: RegionAttributes,
    scheme: Scheme,
    name: &'static str,
) -> Result<(NonNull<u8>, RegionDesc), RegionError> {
    let size = pool.block_size();
    if size < MIN_REGION_SIZE {
        return Err(RegionError::Undersize);
    }
    if !size.is_power_of_two() {
        return Err(RegionError::Unrepresentable);
    }
    let ptr = pool
        .acquire()
        .ok_or(RegionError::Heap(HeapError::Exhausted))?;
    let base = ptr.as_ptr() as usize as u32;
    if base % size != 0 {
        pool.release(ptr);
        return Err(RegionError::Misaligned);
    }
    let encoding = match scheme {
        Scheme::PmsaV7 => encode_v7(base, &V7Class { envelope: size, span: size, srd: 0 }, attributes),
        Scheme::PmsaV8 => encode_v8(base, size, attributes),
    };
    let desc = RegionDesc { base, size, attributes, encoding, name };
    Ok((ptr, desc))
}

/// Builds a region over memory the caller already owns.
///
/// Because the memory's extent is fixed, nothing may be rounded: the
/// span must be exactly expressible and the base exactly aligned, or the
/// request is rejected and no descriptor is produced. This is the only
/// builder that can fail on shape alone.
pub fn build_from_existing(
    base: u32,
    size: u32,
    attributes: RegionAttributes,
    scheme: Scheme,
    name: &'static str,
) -> Result<RegionDesc, RegionError> {
    if size < MIN_REGION_SIZE {
        return Err(RegionError::Undersize);
    }
    if size > MAX_REGION_SIZE {
        return Err(RegionError::Oversize);
    }
    let encoding = match scheme {
        Scheme::PmsaV7 => {
            let class = v7_class_exact(size)?;
            if base % class.envelope != 0 {
                return Err(RegionError::Misaligned);
            }
            encode_v7(base, &class, attributes)
        }
        Scheme::PmsaV8 => {
            if size % MIN_REGION_SIZE != 0 {
                return Err(RegionError::Unrepresentable);
            }
            if base % MIN_REGION_SIZE != 0 {
                return Err(RegionError::Misaligned);
            }
            encode_v8(base, size, attributes)
        }
    };
    Ok(RegionDesc { base, size, attributes, encoding, name })
}
