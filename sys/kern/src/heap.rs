// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel heap interface.
//!
//! The kernel does not implement its own allocator. Region backing
//! stores and protection tables come from a heap supplied by the
//! integration, reached through the `KernelHeap` trait. The trait is
//! deliberately narrow: sized, aligned blocks in and out, nothing else.
//!
//! Heaps are shared with interrupt-time users behind a mutex, so an
//! allocation can fail transiently with `Busy`; the gate layer owns the
//! retry policy for that case.

use core::ptr::NonNull;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// The heap mutex is held; the operation may succeed if retried.
    Busy,
    /// No block of the requested size is available.
    Exhausted,
    /// The requested size or alignment is one the heap cannot serve,
    /// and never will.
    BadLayout,
}

/// An owned allocation. Not `Copy` and not `Clone`: the block is
/// returned to its heap by passing it to [`KernelHeap::free`], and
/// holding the `HeapBlock` is what entitles you to the memory.
#[derive(Debug)]
pub struct HeapBlock {
    ptr: NonNull<u8>,
    size: usize,
}

impl HeapBlock {
    /// Reassembles a block from its raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a live allocation previously
    /// released into raw form, and no other `HeapBlock` for it may
    /// exist.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Base address as the hardware sees it. Region hardware addresses
    /// are 32 bits.
    pub fn addr(&self) -> u32 {
        self.ptr.as_ptr() as usize as u32
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// The allocator the kernel draws from. `align` is always a power of
/// two and `size` a multiple of it by the time calls arrive here.
pub trait KernelHeap {
    fn allocate(&mut self, size: usize, align: usize) -> Result<HeapBlock, HeapError>;
    fn free(&mut self, block: HeapBlock);
}
