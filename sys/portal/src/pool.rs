// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Private message-buffer pools.
//!
//! A free-message client carves the dynamic region it allocated at open
//! into equal message buffers and draws from them for every call. The
//! pool is private: nothing outside the owning client ever allocates
//! from it, so a partition's messaging can never be starved by a
//! neighbor.

use core::ptr::NonNull;

/// Bitmap allocator over one contiguous range of equal blocks.
pub struct BufferPool {
    base: NonNull<u8>,
    block_size: usize,
    count: usize,
    /// Bit set = block in use.
    busy: u32,
}

/// Upper bound imposed by the bitmap word.
pub const MAX_POOL_BLOCKS: usize = 32;

impl BufferPool {
    /// Carves `count` blocks of `block_size` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to `count * block_size` bytes that the caller
    /// exclusively owns for the life of the pool; the pool becomes the
    /// sole authority over that range.
    pub unsafe fn new(base: NonNull<u8>, block_size: usize, count: usize) -> Self {
        assert!(count <= MAX_POOL_BLOCKS && count > 0);
        assert!(block_size > 0);
        Self { base, block_size, count, busy: 0 }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.count - self.busy.count_ones() as usize
    }

    pub fn acquire(&mut self) -> Option<&'static mut [u8]> {
        let free = (!self.busy).trailing_zeros() as usize;
        if free >= self.count {
            return None;
        }
        self.busy |= 1 << free;
        // Safety: the range belongs to the pool (see `new`), the block
        // was marked free so no other slice over it exists, and it is
        // in bounds because free < count.
        Some(unsafe {
            core::slice::from_raw_parts_mut(
                self.base.as_ptr().add(free * self.block_size),
                self.block_size,
            )
        })
    }

    /// Returns a block to the pool. Panics if `buf` is not one of this
    /// pool's blocks; that is a caller bug, not an input error.
    pub fn release(&mut self, buf: &'static mut [u8]) {
        let offset = (buf.as_ptr() as usize)
            .checked_sub(self.base.as_ptr() as usize)
            .filter(|o| o % self.block_size == 0)
            .map(|o| o / self.block_size)
            .filter(|i| *i < self.count);
        let Some(index) = offset else {
            panic!("foreign buffer released into pool");
        };
        assert!(self.busy & (1 << index) != 0, "double release");
        self.busy &= !(1 << index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_over(len: usize, block: usize, count: usize) -> BufferPool {
        let mem = Box::leak(vec![0u8; len].into_boxed_slice());
        let base = NonNull::new(mem.as_mut_ptr()).unwrap();
        // Safety: `mem` is leaked and used for nothing else.
        unsafe { BufferPool::new(base, block, count) }
    }

    #[test]
    fn blocks_are_distinct_and_recycled() {
        let mut pool = pool_over(256, 64, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.len(), 64);
        assert_eq!(pool.free_blocks(), 2);

        let a_ptr = a.as_ptr();
        pool.release(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.as_ptr(), a_ptr);
    }

    #[test]
    fn exhaustion_is_reported_not_invented() {
        let mut pool = pool_over(128, 64, 2);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    #[should_panic(expected = "foreign buffer")]
    fn foreign_release_is_a_bug() {
        let mut pool = pool_over(128, 64, 2);
        pool.release(Box::leak(vec![0u8; 64].into_boxed_slice()));
    }
}
