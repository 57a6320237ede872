// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A write cursor over the mapping of one batch BO.
//!
//! When the room runs out, a [`Batch`] asks its [`BatchExtend`] to make more, which may rebind
//! it to another BO. Allocation failures are sticky: later emissions return `None`.

use crate::{
    instructions::Instruction,
    memory::{Address, BufferObject},
    reloc::RelocationList,
    DeviceSize, OomError,
};
use smallvec::{smallvec, SmallVec};
use std::{ptr::NonNull, slice, sync::Arc};

/// Makes room in a batch that is running out of space.
pub trait BatchExtend {
    /// Called when `batch` has fewer than `required` bytes left. On success the batch must have
    /// at least `required` bytes of room.
    fn extend(&mut self, batch: &mut Batch, required: u32) -> Result<(), OomError>;
}

/// Extender for batches whose room was reserved up front.
pub(crate) struct NoExtend;

impl BatchExtend for NoExtend {
    fn extend(&mut self, batch: &mut Batch, required: u32) -> Result<(), OomError> {
        panic!(
            "batch overflowed its reserved space ({} bytes left, {} required)",
            batch.remaining(),
            required,
        )
    }
}

/// A write cursor over a batch BO.
#[derive(Debug)]
pub struct Batch {
    start: Address,
    map: Option<NonNull<u8>>,
    end: u32,
    next: u32,
    relocs: RelocationList,
    status: Result<(), OomError>,
}

// The mapping is only accessed through `&mut self`.
unsafe impl Send for Batch {}
unsafe impl Sync for Batch {}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    /// Creates a batch that isn't bound to any BO yet.
    pub fn new() -> Self {
        Batch {
            start: Address::NULL,
            map: None,
            end: 0,
            next: 0,
            relocs: RelocationList::new(),
            status: Ok(()),
        }
    }

    /// Makes the batch write into `bo`, with `capacity` usable bytes and the cursor at `next`.
    pub(crate) fn bind(&mut self, bo: &Arc<BufferObject>, capacity: u32, next: u32) {
        assert!(DeviceSize::from(capacity) <= bo.size());
        assert!(next <= capacity);

        let Some(map) = bo.mapped_ptr() else {
            panic!("batch BOs must be mapped");
        };
        assert_eq!(map.as_ptr() as usize % 4, 0);

        self.start = Address::new(bo.clone(), 0);
        self.map = Some(map);
        self.end = capacity;
        self.next = next;
    }

    /// Returns the BO the batch currently writes into.
    #[inline]
    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        self.start.bo.as_ref()
    }

    /// Returns the address of the start of the current BO.
    #[inline]
    pub fn start_address(&self) -> &Address {
        &self.start
    }

    /// Returns the number of bytes written to the current BO.
    #[inline]
    pub fn len(&self) -> u32 {
        self.next
    }

    /// Returns the number of usable bytes of the current BO.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.end
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.end - self.next
    }

    /// Returns the relocations of the current BO.
    #[inline]
    pub fn relocs(&self) -> &RelocationList {
        &self.relocs
    }

    pub(crate) fn take_relocs(&mut self) -> RelocationList {
        self.relocs.take()
    }

    pub(crate) fn set_relocs(&mut self, relocs: RelocationList) {
        self.relocs = relocs;
    }

    /// Returns the first error the batch ran into.
    #[inline]
    pub fn status(&self) -> Result<(), OomError> {
        self.status
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.status.is_err()
    }

    /// Records an error. Only the first one is kept.
    pub fn set_error(&mut self, err: OomError) {
        if self.status.is_ok() {
            self.status = Err(err);
        }
    }

    pub(crate) fn clear_error(&mut self) {
        self.status = Ok(());
    }

    /// Gives `bytes` of the space reserved at the end of the BO back to the cursor.
    pub(crate) fn release_reserve(&mut self, bytes: u32) {
        self.end += bytes;

        if let Some(bo) = self.bo() {
            assert!(DeviceSize::from(self.end) <= bo.size());
        }
    }

    fn reserve<E>(&mut self, ext: &mut E, bytes: u32) -> Option<u32>
    where
        E: BatchExtend + ?Sized,
    {
        if self.has_error() {
            return None;
        }

        if self.remaining() < bytes {
            if let Err(err) = ext.extend(self, bytes) {
                self.set_error(err);
                return None;
            }

            assert!(self.remaining() >= bytes);
        }

        let offset = self.next;
        self.next += bytes;

        Some(offset)
    }

    fn dwords_mut(&mut self, offset: u32, count: usize) -> &mut [u32] {
        let Some(map) = self.map else {
            panic!("the batch is not bound to a BO");
        };
        debug_assert!(offset as usize + count * 4 <= self.end as usize);

        // SAFETY: `bind` checked that the range is within the mapping and aligned, and the
        // batch is the only writer of its unwritten range.
        unsafe { slice::from_raw_parts_mut(map.as_ptr().add(offset as usize).cast(), count) }
    }

    /// Returns `count` dwords of room, or `None` if the batch has an error.
    ///
    /// The contents of the returned slice are unspecified.
    pub fn emit_dwords<E>(&mut self, ext: &mut E, count: usize) -> Option<&mut [u32]>
    where
        E: BatchExtend + ?Sized,
    {
        let Some(bytes) = count
            .checked_mul(4)
            .and_then(|bytes| u32::try_from(bytes).ok())
        else {
            self.set_error(OomError::OutOfHostMemory);
            return None;
        };
        let offset = self.reserve(ext, bytes)?;

        Some(self.dwords_mut(offset, count))
    }

    /// Packs `instruction` into the batch and returns its byte offset in the current BO.
    pub fn emit<E, I>(&mut self, ext: &mut E, instruction: &I) -> Option<u32>
    where
        E: BatchExtend + ?Sized,
        I: Instruction,
    {
        let offset = self.reserve(ext, (I::LENGTH * 4) as u32)?;

        let mut dw: SmallVec<[u32; 8]> = smallvec![0; I::LENGTH];
        instruction.pack(
            &mut Packer {
                batch: self,
                offset,
            },
            &mut dw,
        );
        self.dwords_mut(offset, I::LENGTH).copy_from_slice(&dw);

        Some(offset)
    }

    /// Copies the first `len` bytes of `src` into the batch, with their relocations.
    ///
    /// Returns the offset of the copy in the current BO.
    pub fn emit_batch<E>(
        &mut self,
        ext: &mut E,
        src: &BufferObject,
        len: u32,
        relocs: &RelocationList,
    ) -> Option<u32>
    where
        E: BatchExtend + ?Sized,
    {
        assert_eq!(len % 4, 0);

        let offset = self.reserve(ext, len)?;

        let dst: &mut [u8] = bytemuck::cast_slice_mut(self.dwords_mut(offset, len as usize / 4));

        // SAFETY: `src` is a finished batch that nothing writes anymore.
        unsafe { src.read(0, dst) };

        if let Err(err) = self.relocs.append(relocs, DeviceSize::from(offset)) {
            self.set_error(err);
            return None;
        }

        Some(offset)
    }

    /// Returns the address of `offset` in the current BO. An offset equal to
    /// [`len`](Self::len) is allowed, so that a jump can target the next instruction.
    pub fn address(&self, offset: u32) -> Address {
        assert!(offset > 0, "address of the start of the batch requested");
        assert!(offset <= self.next, "address past the end of the batch requested");

        self.start.add(DeviceSize::from(offset))
    }

    /// Records that `bo` plus `delta` is written at `location` in the current BO, and returns
    /// the value to write. On allocation failure the error is recorded and `0` is returned.
    pub fn emit_reloc(&mut self, location: u32, bo: &Arc<BufferObject>, delta: u32) -> u64 {
        match self.relocs.add(DeviceSize::from(location), bo, delta) {
            Ok(value) => value,
            Err(err) => {
                self.set_error(err);
                0
            }
        }
    }

    /// Returns the value of `address` to be written at `location` in the current BO.
    pub fn combine_address(&mut self, location: u32, address: &Address) -> u64 {
        match &address.bo {
            None => address.offset,
            Some(bo) => {
                assert!(
                    address.offset <= i32::MAX as DeviceSize,
                    "address offset does not fit a relocation delta",
                );

                self.emit_reloc(location, bo, address.offset as u32)
            }
        }
    }
}

/// Passed to [`Instruction::pack`] to resolve address fields.
pub struct Packer<'a> {
    batch: &'a mut Batch,
    offset: u32,
}

impl Packer<'_> {
    /// Returns the value of `address` for the field that starts at dword `dword` of the
    /// instruction.
    #[inline]
    pub fn address(&mut self, dword: usize, address: &Address) -> u64 {
        let location = self.offset + dword as u32 * 4;

        self.batch.combine_address(location, address)
    }
}
