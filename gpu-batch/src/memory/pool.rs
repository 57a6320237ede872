// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{BoCreateInfo, BoFlags, BoTable, BufferObject};
use crate::{DeviceSize, OomError};
use crossbeam_queue::SegQueue;
use std::sync::Arc;

const MIN_SIZE_LOG2: u32 = 12;
const BUCKET_COUNT: usize = 16;

/// Recycles batch BOs by power-of-two size class.
///
/// Sizes are rounded up to the next power of two, starting at 4 KiB. Requests larger than the
/// biggest size class fail with [`OomError::OutOfDeviceMemory`].
#[derive(Debug)]
pub struct BatchBoPool {
    flags: BoFlags,
    // Each bucket holds BOs of size `1 << (MIN_SIZE_LOG2 + index)`.
    buckets: [SegQueue<Arc<BufferObject>>; BUCKET_COUNT],
}

impl BatchBoPool {
    /// Creates a pool whose BOs are allocated with `flags`.
    pub fn new(flags: BoFlags) -> Self {
        BatchBoPool {
            flags,
            buckets: std::array::from_fn(|_| SegQueue::new()),
        }
    }

    /// Returns the size class a request of `size` bytes falls into.
    pub fn size_class(size: DeviceSize) -> DeviceSize {
        size.max(1 << MIN_SIZE_LOG2).next_power_of_two()
    }

    fn bucket(size: DeviceSize) -> Option<usize> {
        if !size.is_power_of_two() {
            return None;
        }

        let index = size.trailing_zeros().checked_sub(MIN_SIZE_LOG2)? as usize;

        (index < BUCKET_COUNT).then_some(index)
    }

    /// Returns a BO of at least `size` bytes, reusing a free one when possible.
    pub fn alloc(&self, table: &BoTable, size: DeviceSize) -> Result<Arc<BufferObject>, OomError> {
        let size = Self::size_class(size);
        let bucket = Self::bucket(size).ok_or(OomError::OutOfDeviceMemory)?;

        if let Some(bo) = self.buckets[bucket].pop() {
            return Ok(bo);
        }

        table.allocate(&BoCreateInfo {
            size,
            flags: self.flags,
            ..Default::default()
        })
    }

    /// Gives a BO back to the pool.
    ///
    /// BOs that are still referenced elsewhere, or that don't match a size class, are simply
    /// dropped.
    pub fn free(&self, bo: Arc<BufferObject>) {
        if Arc::strong_count(&bo) != 1 || bo.flags() != self.flags {
            return;
        }

        if let Some(bucket) = Self::bucket(bo.size()) {
            self.buckets[bucket].push(bo);
        }
    }

    /// Returns the number of BOs waiting to be reused.
    pub fn free_count(&self) -> usize {
        self.buckets.iter().map(SegQueue::len).sum()
    }
}
