// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! One link of a batch chain.

use crate::{
    batch::Batch,
    device::Device,
    instructions::{is_batch_buffer_start, JUMP_ADDRESS_OFFSET, JUMP_SIZE},
    memory::{non_canonical_address, BufferObject},
    reloc::RelocationList,
    DeviceSize, OomError,
};
use log::debug;
use parking_lot::Mutex;
use std::{mem::ManuallyDrop, sync::Arc};

/// A batch BO shared between the chain that recorded it and the primaries that execute it.
pub type SharedBatchBo = Arc<Mutex<BatchBo>>;

/// A batch BO together with its written length and relocations.
///
/// While a [`Batch`] is writing into the BO, the relocations live in the batch. They are handed
/// back by [`finish`](Self::finish).
///
/// The BO returns to the device's batch BO pool when this is dropped.
#[derive(Debug)]
pub struct BatchBo {
    device: Arc<Device>,
    bo: ManuallyDrop<Arc<BufferObject>>,
    length: u32,
    chained: bool,
    relocs: RelocationList,
}

impl BatchBo {
    /// Allocates a batch BO of at least `size` bytes.
    pub fn new(device: Arc<Device>, size: u32) -> Result<Self, OomError> {
        let bo = device.alloc_batch_bo(DeviceSize::from(size))?;

        Ok(BatchBo {
            device,
            bo: ManuallyDrop::new(bo),
            length: 0,
            chained: false,
            relocs: RelocationList::new(),
        })
    }

    /// Returns a copy with a new BO of the same size, holding the same bytes and relocations.
    pub fn try_clone(&self) -> Result<Self, OomError> {
        let mut clone = BatchBo {
            device: self.device.clone(),
            bo: ManuallyDrop::new(self.device.alloc_batch_bo(self.bo.size())?),
            length: self.length,
            chained: self.chained,
            relocs: RelocationList::new(),
        };
        clone.relocs = self.relocs.try_clone()?;

        // SAFETY: the source is finished, and the clone isn't visible to anyone yet.
        unsafe { clone.bo.copy_from(0, &self.bo, 0, self.length as usize) };

        Ok(clone)
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    /// Returns the number of bytes written, as of the last [`finish`](Self::finish).
    #[inline]
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Returns whether the BO ends with a jump to another batch rather than a batch end.
    #[inline]
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    #[inline]
    pub(crate) fn set_chained(&mut self, chained: bool) {
        self.chained = chained;
    }

    /// Returns the relocations of the BO. Empty while a batch is writing into it.
    #[inline]
    pub fn relocs(&self) -> &RelocationList {
        &self.relocs
    }

    #[inline]
    pub(crate) fn relocs_mut(&mut self) -> &mut RelocationList {
        &mut self.relocs
    }

    fn capacity(&self, reserve: u32) -> u32 {
        self.bo.size() as u32 - reserve
    }

    /// Points `batch` at the start of the BO, keeping `reserve` bytes free at the end, and
    /// clears the relocations.
    pub(crate) fn start(&mut self, batch: &mut Batch, reserve: u32) {
        batch.bind(&self.bo, self.capacity(reserve), 0);
        self.length = 0;

        let mut relocs = self.relocs.take();
        relocs.clear();
        batch.set_relocs(relocs);
    }

    /// Points `batch` after the last written byte of the BO.
    pub(crate) fn resume(&mut self, batch: &mut Batch, reserve: u32) {
        batch.bind(&self.bo, self.capacity(reserve), self.length);
        batch.set_relocs(self.relocs.take());
    }

    /// Takes the written length and the relocations back from `batch`.
    pub(crate) fn finish(&mut self, batch: &mut Batch) {
        assert!(
            batch.bo().is_some_and(|bo| Arc::ptr_eq(bo, &self.bo)),
            "the batch is not writing into this BO",
        );

        self.length = batch.len();
        self.relocs = batch.take_relocs();
    }

    /// Makes sure `batch` has room for `additional` more bytes plus `reserve`, moving the
    /// contents to a BO twice as large as many times as needed.
    pub(crate) fn grow(
        &mut self,
        batch: &mut Batch,
        additional: u32,
        reserve: u32,
    ) -> Result<(), OomError> {
        assert!(batch.bo().is_some_and(|bo| Arc::ptr_eq(bo, &self.bo)));

        let used = batch.len();
        let required = used
            .checked_add(additional)
            .and_then(|required| required.checked_add(reserve))
            .map(DeviceSize::from)
            .ok_or(OomError::OutOfDeviceMemory)?;
        let mut new_size = self.bo.size();

        if required <= new_size {
            return Ok(());
        }

        while new_size <= required {
            new_size *= 2;
        }

        let new_bo = self.device.alloc_batch_bo(new_size)?;

        // SAFETY: the batch is the only writer, and it's borrowed here.
        unsafe { new_bo.copy_from(0, &self.bo, 0, used as usize) };

        debug!(
            "grew batch BO {} to {} bytes as BO {}",
            self.bo.handle(),
            new_bo.size(),
            new_bo.handle(),
        );

        let old_bo = std::mem::replace(&mut *self.bo, new_bo);
        batch.bind(&self.bo, self.capacity(reserve), used);
        self.device.free_batch_bo(old_bo);

        Ok(())
    }

    /// Rewrites the jump at the end of the BO so that it continues at `next_offset` in `next`.
    pub(crate) fn link(&mut self, next: &Arc<BufferObject>, next_offset: u32) {
        assert!(self.length >= JUMP_SIZE);

        let jump_offset = self.length - JUMP_SIZE;

        // SAFETY: the BO is finished, and the caller holds the lock on it.
        let header = unsafe { self.bo.read_u32(DeviceSize::from(jump_offset)) };
        assert!(
            is_batch_buffer_start(header),
            "the batch BO does not end with a jump",
        );

        let field = DeviceSize::from(jump_offset + JUMP_ADDRESS_OFFSET);
        let resolved = next.resolve();

        if resolved.is_pinned() {
            let address = non_canonical_address(resolved.offset() + DeviceSize::from(next_offset));

            // SAFETY: same as above.
            unsafe { self.bo.write_u64(field, address) };
        } else {
            let last = self.relocs.len().checked_sub(1);
            let Some(last) = last.filter(|&last| self.relocs.entries()[last].offset == field) else {
                panic!("the jump at the end of the batch BO has no relocation");
            };

            self.relocs.retarget(last, next.clone(), next_offset);
        }
    }
}

impl Drop for BatchBo {
    fn drop(&mut self) {
        // SAFETY: `self.bo` is not used after this.
        let bo = unsafe { ManuallyDrop::take(&mut self.bo) };
        self.device.free_batch_bo(bo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::NoExtend,
        instructions::{Jump, MI_NOOP},
        memory::Address,
        reloc::UNKNOWN_PRESUMED_OFFSET,
    };

    #[test]
    fn start_finish_resume() {
        let (device, _transport, _allocator) = test_device!();
        let mut bbo = BatchBo::new(device, 4096).unwrap();
        let mut batch = Batch::new();

        bbo.start(&mut batch, JUMP_SIZE);
        assert_eq!(batch.capacity(), 4096 - 16);
        batch.emit_dwords(&mut NoExtend, 10).unwrap();
        bbo.finish(&mut batch);
        assert_eq!(bbo.len(), 40);

        bbo.resume(&mut batch, JUMP_SIZE);
        assert_eq!(batch.len(), 40);
        batch.emit_dwords(&mut NoExtend, 2).unwrap();
        bbo.finish(&mut batch);
        assert_eq!(bbo.len(), 48);
    }

    #[test]
    fn drop_returns_bo_to_pool() {
        let (device, _transport, _allocator) = test_device!();
        let bbo = BatchBo::new(device.clone(), 8192).unwrap();
        let handle = bbo.bo().handle();

        drop(bbo);
        assert_eq!(device.batch_bo_pool().free_count(), 1);
        let bbo = BatchBo::new(device.clone(), 8192).unwrap();
        assert_eq!(bbo.bo().handle(), handle);
    }

    #[test]
    fn grow_keeps_contents() {
        let (device, _transport, _allocator) = test_device!(can_chain_batches: false);
        let mut bbo = BatchBo::new(device, 4096).unwrap();
        let mut batch = Batch::new();
        bbo.start(&mut batch, JUMP_SIZE);

        batch
            .emit_dwords(&mut NoExtend, 1000)
            .unwrap()
            .iter_mut()
            .enumerate()
            .for_each(|(i, dw)| *dw = i as u32);

        bbo.grow(&mut batch, 4000, JUMP_SIZE).unwrap();
        assert_eq!(bbo.bo().size(), 8192);
        assert_eq!(batch.len(), 4000);
        assert_eq!(batch.capacity(), 8192 - 16);
        assert_eq!(unsafe { bbo.bo().read_u32(4 * 999) }, 999);

        // Already large enough.
        let handle = bbo.bo().handle();
        bbo.grow(&mut batch, 100, JUMP_SIZE).unwrap();
        assert_eq!(bbo.bo().handle(), handle);

        assert_eq!(
            bbo.grow(&mut batch, u32::MAX - 100, JUMP_SIZE),
            Err(OomError::OutOfDeviceMemory),
        );
        assert_eq!(bbo.bo().handle(), handle);
        assert_eq!(batch.len(), 4000);
    }

    #[test]
    fn clone_copies_bytes_and_relocs() {
        let (device, _transport, _allocator) = test_device!(use_softpin: false);
        let target = device.bo_table().allocate(&Default::default()).unwrap();

        let mut bbo = BatchBo::new(device, 4096).unwrap();
        let mut batch = Batch::new();
        bbo.start(&mut batch, JUMP_SIZE);
        batch.emit_dwords(&mut NoExtend, 1).unwrap()[0] = 0xabcd;
        batch
            .emit(&mut NoExtend, &Jump(Address::new(target, 0)))
            .unwrap();
        bbo.finish(&mut batch);

        let clone = bbo.try_clone().unwrap();
        assert_ne!(clone.bo().handle(), bbo.bo().handle());
        assert_eq!(clone.len(), 20);
        assert_eq!(clone.relocs().len(), 1);
        assert_eq!(unsafe { clone.bo().read_u32(0) }, 0xabcd);
    }

    #[test]
    fn link_rewrites_relocation() {
        let (device, _transport, _allocator) = test_device!(use_softpin: false);
        let mut bbo = BatchBo::new(device.clone(), 4096).unwrap();
        let next = BatchBo::new(device, 4096).unwrap();

        let mut batch = Batch::new();
        bbo.start(&mut batch, JUMP_SIZE);
        let self_address = Address::new(bbo.bo().clone(), 0);
        batch.emit(&mut NoExtend, &Jump(self_address)).unwrap();
        bbo.finish(&mut batch);

        bbo.link(next.bo(), 64);
        let entry = bbo.relocs().entries()[0];
        assert_eq!(entry.offset, 4);
        assert_eq!(entry.delta, 64);
        assert_eq!(entry.presumed_offset, UNKNOWN_PRESUMED_OFFSET);
        assert!(Arc::ptr_eq(&bbo.relocs().targets()[0], next.bo()));
    }

    #[test]
    fn link_writes_pinned_address() {
        let (device, _transport, _allocator) = test_device!();
        let mut bbo = BatchBo::new(device.clone(), 4096).unwrap();
        let next = BatchBo::new(device, 4096).unwrap();

        let mut batch = Batch::new();
        bbo.start(&mut batch, JUMP_SIZE);
        batch.emit_dwords(&mut NoExtend, 2).unwrap().fill(MI_NOOP);
        let self_address = Address::new(bbo.bo().clone(), 0);
        batch.emit(&mut NoExtend, &Jump(self_address)).unwrap();
        bbo.finish(&mut batch);

        bbo.link(next.bo(), 32);
        assert_eq!(
            unsafe { bbo.bo().read_u64(12) },
            next.bo().offset() + 32,
        );
    }

    #[test]
    fn link_requires_trailing_jump() {
        let (device, _transport, _allocator) = test_device!();
        let mut bbo = BatchBo::new(device.clone(), 4096).unwrap();
        let next = BatchBo::new(device, 4096).unwrap();

        let mut batch = Batch::new();
        bbo.start(&mut batch, JUMP_SIZE);
        batch.emit_dwords(&mut NoExtend, 4).unwrap().fill(MI_NOOP);
        bbo.finish(&mut batch);

        assert_should_panic!("does not end with a jump", {
            bbo.link(next.bo(), 0);
        });
    }
}
