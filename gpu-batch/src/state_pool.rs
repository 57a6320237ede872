// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The surface state pool.
//!
//! The pool is one BO that grows in both directions from a *center*. Surface states live after
//! the center and binding tables before it, both addressed relative to the center. Growing moves
//! the contents to a larger BO behind the pool's wrapper. Relocations against the pool assume a
//! center of zero and are shifted at submission.

use crate::{
    memory::{BoCreateInfo, BoFlags, BoTable, BufferObject},
    DeviceSize, OomError,
};
use log::debug;
use std::sync::Arc;

const PAGE_SIZE: u32 = 4096;

/// A block allocated from a [`StatePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolState {
    /// Offset relative to the center of the pool. Negative for blocks before the center.
    pub offset: i32,
    pub size: u32,
}

/// A pool of GPU state that grows in both directions.
#[derive(Debug)]
pub struct StatePool {
    wrapper: Arc<BufferObject>,
    flags: BoFlags,
    center: u32,
    front: u32,
    back: u32,
}

impl StatePool {
    /// Creates a pool backed by a BO of `size` bytes.
    ///
    /// The center starts at the beginning of the BO, or in its middle if the BO is pinned, since
    /// a pinned pool can never grow.
    pub fn new(table: &BoTable, size: u32, flags: BoFlags) -> Result<Self, OomError> {
        let bo = table.allocate(&BoCreateInfo {
            size: DeviceSize::from(size),
            flags,
            ..Default::default()
        })?;

        Ok(StatePool {
            wrapper: BufferObject::new_wrapper(bo),
            flags,
            center: if flags.pinned { size / 2 } else { 0 },
            front: 0,
            back: 0,
        })
    }

    /// Returns the wrapper BO. Relocations against the pool must target this rather than the
    /// backing BO.
    #[inline]
    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.wrapper
    }

    /// Returns the offset of the center within the backing BO.
    #[inline]
    pub fn center_bo_offset(&self) -> u32 {
        self.center
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.wrapper.size() as u32
    }

    /// Returns the offset of `state` within the backing BO.
    #[inline]
    pub fn bo_offset(&self, state: PoolState) -> DeviceSize {
        (i64::from(self.center) + i64::from(state.offset)) as DeviceSize
    }

    /// Allocates a block after the center.
    pub fn alloc(
        &mut self,
        table: &BoTable,
        size: u32,
        alignment: u32,
    ) -> Result<PoolState, OomError> {
        assert!(alignment.is_power_of_two() && alignment <= PAGE_SIZE);

        let start = self.front.next_multiple_of(alignment);
        let front = start + size;

        if self.center + front > self.size() {
            self.grow(table, front, self.back)?;
        }

        self.front = front;

        Ok(PoolState {
            offset: start as i32,
            size,
        })
    }

    /// Allocates a block before the center.
    pub fn alloc_back(
        &mut self,
        table: &BoTable,
        size: u32,
        alignment: u32,
    ) -> Result<PoolState, OomError> {
        assert!(alignment.is_power_of_two() && alignment <= PAGE_SIZE);

        let back = (self.back + size).next_multiple_of(alignment);

        if back > self.center {
            self.grow(table, self.front, back)?;
        }

        self.back = back;

        Ok(PoolState {
            offset: -(back as i32),
            size,
        })
    }

    fn grow(&mut self, table: &BoTable, front: u32, back: u32) -> Result<(), OomError> {
        // A pinned pool cannot move without invalidating the addresses written with it.
        if self.flags.pinned {
            return Err(OomError::OutOfDeviceMemory);
        }

        let old_size = self.size();
        let mut new_size = old_size.checked_mul(2).ok_or(OomError::OutOfDeviceMemory)?;

        let new_center = loop {
            if let Some(slack) = new_size.checked_sub(front + back) {
                let center = (back + slack / 2)
                    .next_multiple_of(PAGE_SIZE)
                    .max(self.center);

                if center >= back && center + front <= new_size {
                    break center;
                }
            }

            new_size = new_size.checked_mul(2).ok_or(OomError::OutOfDeviceMemory)?;
        };

        let new_bo = table.allocate(&BoCreateInfo {
            size: DeviceSize::from(new_size),
            flags: self.flags,
            ..Default::default()
        })?;
        let old_bo = self.wrapper.resolve();
        let used = (self.back + self.front) as usize;

        // SAFETY: the pool is borrowed mutably, so nothing else writes into it.
        unsafe {
            new_bo.copy_from(
                DeviceSize::from(new_center - self.back),
                &old_bo,
                DeviceSize::from(self.center - self.back),
                used,
            )
        };

        debug!(
            "grew surface state pool from {} to {} bytes, center {} -> {}",
            old_size, new_size, self.center, new_center,
        );

        self.wrapper.replace_target(new_bo);
        self.center = new_center;

        Ok(())
    }

    /// Writes `data` at `offset` relative to the center.
    ///
    /// # Safety
    ///
    /// - The GPU must not be accessing the range.
    pub unsafe fn write(&self, offset: i32, data: &[u8]) {
        let bo_offset = i64::from(self.center) + i64::from(offset);
        assert!(bo_offset >= 0);

        unsafe { self.wrapper.resolve().write(bo_offset as DeviceSize, data) };
    }

    /// Reads into `data` from `offset` relative to the center.
    ///
    /// # Safety
    ///
    /// - The GPU must not be writing the range.
    pub unsafe fn read(&self, offset: i32, data: &mut [u8]) {
        let bo_offset = i64::from(self.center) + i64::from(offset);
        assert!(bo_offset >= 0);

        unsafe { self.wrapper.resolve().read(bo_offset as DeviceSize, data) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBoAllocator;

    fn pool(flags: BoFlags) -> (BoTable, StatePool) {
        let table = BoTable::new(Arc::new(HostBoAllocator::new()), false);
        let pool = StatePool::new(&table, 4096, flags).unwrap();

        (table, pool)
    }

    #[test]
    fn front_allocations() {
        let (table, mut pool) = pool(BoFlags::default());

        let a = pool.alloc(&table, 40, 64).unwrap();
        let b = pool.alloc(&table, 64, 64).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 64);
        assert_eq!(pool.center_bo_offset(), 0);
    }

    #[test]
    fn back_allocation_moves_center() {
        let (table, mut pool) = pool(BoFlags::default());

        let surface = pool.alloc(&table, 64, 64).unwrap();
        unsafe { pool.write(surface.offset, &0xfeed_f00d_u32.to_le_bytes()) };
        let first_bo = pool.bo().resolve();

        let table_state = pool.alloc_back(&table, 32, 32).unwrap();
        assert_eq!(table_state.offset, -32);
        assert!(pool.center_bo_offset() >= 4096);
        assert!(!Arc::ptr_eq(&pool.bo().resolve(), &first_bo));
        assert!(pool.size() >= 8192);

        let mut bytes = [0; 4];
        unsafe { pool.read(surface.offset, &mut bytes) };
        assert_eq!(u32::from_le_bytes(bytes), 0xfeed_f00d);
        assert_eq!(
            pool.bo_offset(table_state),
            DeviceSize::from(pool.center_bo_offset() - 32),
        );
    }

    #[test]
    fn center_never_moves_back() {
        let (table, mut pool) = pool(BoFlags::default());

        pool.alloc_back(&table, 1024, 64).unwrap();
        let center = pool.center_bo_offset();

        pool.alloc(&table, 8192, 64).unwrap();
        assert!(pool.center_bo_offset() >= center);
        assert!(DeviceSize::from(pool.center_bo_offset() + 8192) <= pool.bo().size());
    }

    #[test]
    fn pinned_pool_is_fixed() {
        let (table, mut pool) = pool(BoFlags {
            pinned: true,
            ..Default::default()
        });

        assert_eq!(pool.center_bo_offset(), 2048);
        pool.alloc(&table, 2048, 64).unwrap();
        pool.alloc_back(&table, 2048, 64).unwrap();
        assert_eq!(
            pool.alloc(&table, 64, 64).unwrap_err(),
            OomError::OutOfDeviceMemory,
        );
        assert_eq!(
            pool.alloc_back(&table, 64, 64).unwrap_err(),
            OomError::OutOfDeviceMemory,
        );
    }
}
