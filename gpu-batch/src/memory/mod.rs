// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffer objects and their allocation.
//!
//! A [`BufferObject`] is a kernel memory region named by a GEM handle. A *pinned* BO has a fixed
//! GPU address; any other BO only has the address the kernel last reported for it. A *wrapper*
//! stands in for a replaceable backing BO and must be [resolved](BufferObject::resolve) first.

pub use self::{pool::BatchBoPool, table::BoTable};
use crate::{DeviceSize, OomError, ValidationError};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

mod pool;
mod table;

/// The kernel's name for a BO. Zero is never a valid handle.
pub type GemHandle = u32;

/// Value of [`BufferObject::offset`] when the BO has never been placed in the GPU address space.
pub const UNASSIGNED_OFFSET: DeviceSize = DeviceSize::MAX;

const EXEC_OBJECT_NEEDS_FENCE: u64 = 1 << 0;
const EXEC_OBJECT_NEEDS_GTT: u64 = 1 << 1;
const EXEC_OBJECT_WRITE: u64 = 1 << 2;
const EXEC_OBJECT_SUPPORTS_48B_ADDRESS: u64 = 1 << 3;
const EXEC_OBJECT_PINNED: u64 = 1 << 4;
const EXEC_OBJECT_PAD_TO_SIZE: u64 = 1 << 5;
const EXEC_OBJECT_ASYNC: u64 = 1 << 6;
const EXEC_OBJECT_CAPTURE: u64 = 1 << 7;
const EXEC_OBJECT_UNKNOWN_FLAGS: u64 = !((1 << 8) - 1);

/// Per-BO flags forwarded to the kernel in the submission's object list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoFlags {
    /// The BO lives at a fixed GPU address chosen by userspace.
    pub pinned: bool,

    /// The GPU may write to the BO.
    pub write: bool,

    /// The BO may be placed above 4 GiB.
    pub supports_48bit_address: bool,

    /// The kernel doesn't need to order this BO against other submissions.
    pub async_: bool,

    /// The BO is included in GPU error captures.
    pub capture: bool,
}

impl BoFlags {
    /// Converts raw exec object flags, rejecting bits this crate doesn't manage.
    pub fn from_exec_flags(raw: u64) -> Result<Self, Box<ValidationError>> {
        if raw & EXEC_OBJECT_UNKNOWN_FLAGS != 0 {
            return Err(Box::new(ValidationError {
                context: "flags".into(),
                problem: format!("contains unknown bits {:#x}", raw & EXEC_OBJECT_UNKNOWN_FLAGS)
                    .into(),
            }));
        }

        if raw & (EXEC_OBJECT_NEEDS_FENCE | EXEC_OBJECT_NEEDS_GTT | EXEC_OBJECT_PAD_TO_SIZE) != 0 {
            return Err(Box::new(ValidationError {
                context: "flags".into(),
                problem: "contains fence, GTT or pad-to-size placement bits, which are reserved"
                    .into(),
            }));
        }

        Ok(BoFlags {
            pinned: raw & EXEC_OBJECT_PINNED != 0,
            write: raw & EXEC_OBJECT_WRITE != 0,
            supports_48bit_address: raw & EXEC_OBJECT_SUPPORTS_48B_ADDRESS != 0,
            async_: raw & EXEC_OBJECT_ASYNC != 0,
            capture: raw & EXEC_OBJECT_CAPTURE != 0,
        })
    }

    /// Returns the raw exec object flags.
    pub fn to_exec_flags(self) -> u64 {
        let mut raw = 0;

        if self.pinned {
            raw |= EXEC_OBJECT_PINNED;
        }
        if self.write {
            raw |= EXEC_OBJECT_WRITE;
        }
        if self.supports_48bit_address {
            raw |= EXEC_OBJECT_SUPPORTS_48B_ADDRESS;
        }
        if self.async_ {
            raw |= EXEC_OBJECT_ASYNC;
        }
        if self.capture {
            raw |= EXEC_OBJECT_CAPTURE;
        }

        raw
    }
}

/// Sign-extends a GPU virtual address from bit 47, the form the hardware expects for 64-bit
/// address fields.
#[inline]
pub const fn canonical_address(address: u64) -> u64 {
    (((address << 16) as i64) >> 16) as u64
}

/// Strips the sign extension of a canonical address.
#[inline]
pub const fn non_canonical_address(address: u64) -> u64 {
    address & ((1 << 48) - 1)
}

enum Backing {
    // Allocated by `HostBoAllocator`, freed on drop.
    Host(NonNull<[u64]>),
    Wrapper(RwLock<Arc<BufferObject>>),
}

/// A buffer object.
pub struct BufferObject {
    handle: GemHandle,
    size: DeviceSize,
    flags: BoFlags,
    map: Option<NonNull<u8>>,
    offset: AtomicU64,
    // Generation in the high half, object index in the low half.
    exec_slot: AtomicU64,
    backing: Backing,
}

// The mapping is only written through the unsafe accessors, whose callers synchronize.
unsafe impl Send for BufferObject {}
unsafe impl Sync for BufferObject {}

impl BufferObject {
    fn new_host(
        handle: GemHandle,
        memory: Box<[u64]>,
        flags: BoFlags,
        offset: DeviceSize,
    ) -> Self {
        let size = (memory.len() * 8) as DeviceSize;
        let memory = NonNull::from(Box::leak(memory));

        BufferObject {
            handle,
            size,
            flags,
            map: Some(memory.cast()),
            offset: AtomicU64::new(offset),
            exec_slot: AtomicU64::new(0),
            backing: Backing::Host(memory),
        }
    }

    /// Creates a wrapper around `target`.
    pub fn new_wrapper(target: Arc<BufferObject>) -> Arc<Self> {
        assert!(!target.is_wrapper(), "wrappers cannot be nested");

        Arc::new(BufferObject {
            handle: 0,
            size: 0,
            flags: target.flags,
            map: None,
            offset: AtomicU64::new(UNASSIGNED_OFFSET),
            exec_slot: AtomicU64::new(0),
            backing: Backing::Wrapper(RwLock::new(target)),
        })
    }

    /// Returns the backing BO of a wrapper, or the BO itself.
    #[inline]
    pub fn resolve(self: &Arc<Self>) -> Arc<BufferObject> {
        match &self.backing {
            Backing::Wrapper(target) => target.read().clone(),
            _ => self.clone(),
        }
    }

    /// Replaces the backing BO of a wrapper and returns the previous one.
    pub(crate) fn replace_target(&self, new_target: Arc<BufferObject>) -> Arc<BufferObject> {
        assert!(!new_target.is_wrapper());

        match &self.backing {
            Backing::Wrapper(target) => std::mem::replace(&mut *target.write(), new_target),
            _ => panic!("only wrappers have a replaceable backing BO"),
        }
    }

    #[inline]
    pub fn is_wrapper(&self) -> bool {
        matches!(self.backing, Backing::Wrapper(_))
    }

    /// Returns the GEM handle. Wrappers have no handle of their own.
    #[inline]
    pub fn handle(&self) -> GemHandle {
        assert!(!self.is_wrapper(), "wrappers must be resolved first");
        self.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        match &self.backing {
            Backing::Wrapper(target) => target.read().size,
            _ => self.size,
        }
    }

    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags.pinned
    }

    /// Returns the GPU address of the BO, or [`UNASSIGNED_OFFSET`].
    ///
    /// For pinned BOs this is fixed. Otherwise it's the address the kernel reported after the
    /// last submission that used the BO.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        assert!(!self.is_wrapper(), "wrappers must be resolved first");
        self.offset.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_offset(&self) -> bool {
        self.offset() != UNASSIGNED_OFFSET
    }

    pub(crate) fn set_offset(&self, offset: DeviceSize) {
        assert!(
            !self.is_pinned() || offset == self.offset(),
            "pinned BOs cannot move",
        );
        self.offset.store(offset, Ordering::Release);
    }

    /// Returns the host mapping of the BO, if it has one.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.map
    }

    /// Returns the index of the BO in the submission with the given `generation`, if it was
    /// added to it.
    pub(crate) fn exec_index(&self, generation: u32) -> Option<u32> {
        let slot = self.exec_slot.load(Ordering::Relaxed);

        ((slot >> 32) as u32 == generation).then_some(slot as u32)
    }

    pub(crate) fn set_exec_index(&self, generation: u32, index: u32) {
        self.exec_slot.store(
            (u64::from(generation) << 32) | u64::from(index),
            Ordering::Relaxed,
        );
    }

    fn mapped_range(&self, offset: DeviceSize, len: usize) -> NonNull<u8> {
        let Some(map) = self.map else {
            panic!("the BO is not mapped");
        };
        assert!(
            offset
                .checked_add(len as DeviceSize)
                .is_some_and(|end| end <= self.size),
            "access of {} bytes at offset {} is out of the bounds of a {}-byte BO",
            len,
            offset,
            self.size,
        );

        // SAFETY: the range was checked to be within the mapping.
        unsafe { NonNull::new_unchecked(map.as_ptr().add(offset as usize)) }
    }

    /// Writes `data` into the mapping at `offset`.
    ///
    /// # Safety
    ///
    /// - Nothing may be reading or writing the same range concurrently, on the host or the GPU.
    pub unsafe fn write(&self, offset: DeviceSize, data: &[u8]) {
        let dst = self.mapped_range(offset, data.len());

        // SAFETY: the range is in bounds, and the caller guarantees exclusive access.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
    }

    /// Reads the mapping at `offset` into `data`.
    ///
    /// # Safety
    ///
    /// - Nothing may be writing the same range concurrently, on the host or the GPU.
    pub unsafe fn read(&self, offset: DeviceSize, data: &mut [u8]) {
        let src = self.mapped_range(offset, data.len());

        // SAFETY: the range is in bounds, and the caller guarantees there's no writer.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), data.as_mut_ptr(), data.len()) };
    }

    /// # Safety
    ///
    /// Same as [`read`](Self::read).
    pub unsafe fn read_u32(&self, offset: DeviceSize) -> u32 {
        let mut bytes = [0; 4];
        unsafe { self.read(offset, &mut bytes) };

        u32::from_le_bytes(bytes)
    }

    /// # Safety
    ///
    /// Same as [`read`](Self::read).
    pub unsafe fn read_u64(&self, offset: DeviceSize) -> u64 {
        let mut bytes = [0; 8];
        unsafe { self.read(offset, &mut bytes) };

        u64::from_le_bytes(bytes)
    }

    /// # Safety
    ///
    /// Same as [`write`](Self::write).
    pub unsafe fn write_u32(&self, offset: DeviceSize, value: u32) {
        unsafe { self.write(offset, &value.to_le_bytes()) };
    }

    /// # Safety
    ///
    /// Same as [`write`](Self::write).
    pub unsafe fn write_u64(&self, offset: DeviceSize, value: u64) {
        unsafe { self.write(offset, &value.to_le_bytes()) };
    }

    /// Copies `len` bytes from the start of `src` to `offset` in `self`.
    ///
    /// # Safety
    ///
    /// - Nothing may be writing the source range, or accessing the destination range,
    ///   concurrently.
    pub unsafe fn copy_from(
        &self,
        offset: DeviceSize,
        src: &BufferObject,
        src_offset: DeviceSize,
        len: usize,
    ) {
        assert!(!ptr::eq(self, src), "source and destination must be different BOs");
        let dst = self.mapped_range(offset, len);
        let src = src.mapped_range(src_offset, len);

        // SAFETY: both ranges are in bounds and belong to different allocations.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if let Backing::Host(memory) = self.backing {
            // SAFETY: the memory was leaked from a box in `new_host`, and the mapping dies with
            // `self`.
            drop(unsafe { Box::from_raw(memory.as_ptr()) });
        }
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backing {
            Backing::Wrapper(target) => f
                .debug_struct("BufferObject")
                .field("wrapping", &target.read().handle)
                .finish(),
            _ => f
                .debug_struct("BufferObject")
                .field("handle", &self.handle)
                .field("size", &self.size)
                .field("flags", &self.flags)
                .field("offset", &self.offset.load(Ordering::Relaxed))
                .finish_non_exhaustive(),
        }
    }
}

/// A location in the GPU address space: a BO plus an offset, or an absolute address when there
/// is no BO.
#[derive(Clone, Debug, Default)]
pub struct Address {
    pub bo: Option<Arc<BufferObject>>,
    pub offset: DeviceSize,
}

impl Address {
    pub const NULL: Address = Address {
        bo: None,
        offset: 0,
    };

    #[inline]
    pub fn new(bo: Arc<BufferObject>, offset: DeviceSize) -> Self {
        Address {
            bo: Some(bo),
            offset,
        }
    }

    #[inline]
    pub fn add(&self, delta: DeviceSize) -> Address {
        Address {
            bo: self.bo.clone(),
            offset: self.offset + delta,
        }
    }
}

/// Parameters to allocate a new BO.
#[derive(Clone, Debug)]
pub struct BoCreateInfo {
    /// The size in bytes. It is rounded up to the allocator's granularity.
    ///
    /// The default value is `4096`.
    pub size: DeviceSize,

    /// The default value is [`BoFlags::default()`].
    pub flags: BoFlags,

    pub _ne: crate::NonExhaustive,
}

impl Default for BoCreateInfo {
    #[inline]
    fn default() -> Self {
        BoCreateInfo {
            size: 4096,
            flags: BoFlags::default(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Allocates BOs on behalf of a [`Device`](crate::device::Device).
///
/// Pinned BOs must come back with their fixed address assigned.
pub trait BoAllocator: Send + Sync {
    fn allocate(&self, create_info: &BoCreateInfo) -> Result<BufferObject, OomError>;
}

const HOST_HEAP_BASE: DeviceSize = 1 << 20;
const HOST_HEAP_END: DeviceSize = 1 << 48;
const HOST_PAGE_SIZE: DeviceSize = 4096;

/// A [`BoAllocator`] backed by host memory, with a bump allocator standing in for the GPU
/// virtual address space of pinned BOs.
///
/// BOs that aren't pinned start without an address, like freshly created kernel BOs.
#[derive(Debug)]
pub struct HostBoAllocator {
    next_handle: AtomicU32,
    next_address: Mutex<DeviceSize>,
    remaining_allocations: AtomicUsize,
}

impl Default for HostBoAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBoAllocator {
    pub fn new() -> Self {
        HostBoAllocator {
            next_handle: AtomicU32::new(1),
            next_address: Mutex::new(HOST_HEAP_BASE),
            remaining_allocations: AtomicUsize::new(usize::MAX),
        }
    }

    /// Makes every allocation after the next `limit` ones fail with
    /// [`OomError::OutOfDeviceMemory`]. `None` removes the limit.
    pub fn set_allocation_limit(&self, limit: Option<usize>) {
        self.remaining_allocations
            .store(limit.unwrap_or(usize::MAX), Ordering::Relaxed);
    }

    fn take_allocation(&self) -> bool {
        self.remaining_allocations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                match remaining {
                    usize::MAX => Some(usize::MAX),
                    0 => None,
                    _ => Some(remaining - 1),
                }
            })
            .is_ok()
    }
}

impl BoAllocator for HostBoAllocator {
    fn allocate(&self, create_info: &BoCreateInfo) -> Result<BufferObject, OomError> {
        let &BoCreateInfo {
            size,
            flags,
            _ne: _,
        } = create_info;

        assert_ne!(size, 0);

        if !self.take_allocation() {
            return Err(OomError::OutOfDeviceMemory);
        }

        let size = size
            .checked_next_multiple_of(HOST_PAGE_SIZE)
            .ok_or(OomError::OutOfDeviceMemory)?;
        let words = usize::try_from(size / 8).map_err(|_| OomError::OutOfHostMemory)?;

        let mut memory = Vec::new();
        memory.try_reserve_exact(words)?;
        memory.resize(words, 0u64);

        let offset = if flags.pinned {
            let mut next_address = self.next_address.lock();
            let offset = *next_address;
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= HOST_HEAP_END)
                .ok_or(OomError::OutOfDeviceMemory)?;
            *next_address = end;

            offset
        } else {
            UNASSIGNED_OFFSET
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);

        Ok(BufferObject::new_host(
            handle,
            memory.into_boxed_slice(),
            flags,
            offset,
        ))
    }
}
