// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device: BO allocation, kernel capabilities and device-wide state.
//!
//! The capabilities in [`DeviceCreateInfo`] decide how batches are built:
//!
//! - `use_softpin` pins every BO the device allocates at a fixed GPU address.
//! - `can_chain_batches` continues a full batch BO in a new one. Otherwise it grows in place.
//! - `use_call_secondary` makes primaries call secondaries, which jump back.

use crate::{
    memory::{BatchBoPool, BoAllocator, BoFlags, BoTable, BufferObject},
    queue::ExecTransport,
    state_pool::{PoolState, StatePool},
    DeviceSize, OomError, Validated, ValidationError,
};
use log::error;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// Whether BOs are pinned at fixed GPU addresses chosen by userspace.
    ///
    /// The default value is `true`.
    pub use_softpin: bool,

    /// Whether a batch can jump into another batch BO.
    ///
    /// The default value is `true`.
    pub can_chain_batches: bool,

    /// Whether secondary command buffers are executed as calls that return to the primary.
    /// Requires `use_softpin` and `can_chain_batches`.
    ///
    /// The default value is `false`.
    pub use_call_secondary: bool,

    /// The number of bytes the command streamer may prefetch past the current instruction.
    /// Called secondaries are padded to at least this size. Must be a multiple of 4.
    ///
    /// The default value is `512`.
    pub cs_prefetch_size: u32,

    /// The initial size of the surface state pool. Must be a power of two of at least 4096.
    ///
    /// The default value is `65536`.
    pub surface_state_pool_size: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            use_softpin: true,
            can_chain_batches: true,
            use_call_secondary: false,
            cs_prefetch_size: 512,
            surface_state_pool_size: 65536,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl DeviceCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            use_softpin,
            can_chain_batches,
            use_call_secondary,
            cs_prefetch_size,
            surface_state_pool_size,
            _ne: _,
        } = self;

        if use_call_secondary && !(use_softpin && can_chain_batches) {
            return Err(Box::new(ValidationError {
                context: "use_call_secondary".into(),
                problem: "is `true`, but `use_softpin` or `can_chain_batches` is `false`".into(),
            }));
        }

        if cs_prefetch_size % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "cs_prefetch_size".into(),
                problem: "is not a multiple of 4".into(),
            }));
        }

        if !surface_state_pool_size.is_power_of_two() || surface_state_pool_size < 4096 {
            return Err(Box::new(ValidationError {
                context: "surface_state_pool_size".into(),
                problem: "is not a power of two of at least 4096".into(),
            }));
        }

        Ok(())
    }
}

/// State shared by every command buffer and queue of a device, behind the device lock.
#[derive(Debug)]
pub struct DeviceState {
    surface_state_pool: StatePool,
    exec_generation: u32,
}

impl DeviceState {
    #[inline]
    pub fn surface_state_pool(&self) -> &StatePool {
        &self.surface_state_pool
    }

    #[inline]
    pub(crate) fn exec_generation(&self) -> u32 {
        self.exec_generation
    }

    /// Returns a new generation for a submission being built. Never zero.
    pub(crate) fn next_exec_generation(&mut self) -> u32 {
        self.exec_generation = self.exec_generation.wrapping_add(1).max(1);
        self.exec_generation
    }
}

/// An open channel to the kernel driver.
pub struct Device {
    use_softpin: bool,
    can_chain_batches: bool,
    use_call_secondary: bool,
    cs_prefetch_size: u32,
    bo_table: BoTable,
    batch_bo_pool: BatchBoPool,
    transport: Arc<dyn ExecTransport>,
    state: Mutex<DeviceState>,
    lost: AtomicBool,
}

impl Device {
    /// Creates a new `Device`. BOs come from `allocator`, and submissions go to `transport`.
    pub fn new(
        allocator: Arc<dyn BoAllocator>,
        transport: Arc<dyn ExecTransport>,
        create_info: DeviceCreateInfo,
    ) -> Result<Arc<Device>, Validated<OomError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let DeviceCreateInfo {
            use_softpin,
            can_chain_batches,
            use_call_secondary,
            cs_prefetch_size,
            surface_state_pool_size,
            _ne: _,
        } = create_info;

        let flags = BoFlags {
            pinned: use_softpin,
            supports_48bit_address: true,
            ..Default::default()
        };
        let bo_table = BoTable::new(allocator, use_softpin);
        let surface_state_pool = StatePool::new(&bo_table, surface_state_pool_size, flags)
            .map_err(Validated::Error)?;

        Ok(Arc::new(Device {
            use_softpin,
            can_chain_batches,
            use_call_secondary,
            cs_prefetch_size,
            bo_table,
            batch_bo_pool: BatchBoPool::new(flags),
            transport,
            state: Mutex::new(DeviceState {
                surface_state_pool,
                exec_generation: 0,
            }),
            lost: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn use_softpin(&self) -> bool {
        self.use_softpin
    }

    #[inline]
    pub fn can_chain_batches(&self) -> bool {
        self.can_chain_batches
    }

    #[inline]
    pub fn use_call_secondary(&self) -> bool {
        self.use_call_secondary
    }

    #[inline]
    pub fn cs_prefetch_size(&self) -> u32 {
        self.cs_prefetch_size
    }

    /// Returns the table of every BO allocated through the device.
    #[inline]
    pub fn bo_table(&self) -> &BoTable {
        &self.bo_table
    }

    #[inline]
    pub fn batch_bo_pool(&self) -> &BatchBoPool {
        &self.batch_bo_pool
    }

    #[inline]
    pub(crate) fn transport(&self) -> &dyn ExecTransport {
        &*self.transport
    }

    pub(crate) fn alloc_batch_bo(&self, size: DeviceSize) -> Result<Arc<BufferObject>, OomError> {
        self.batch_bo_pool.alloc(&self.bo_table, size)
    }

    pub(crate) fn free_batch_bo(&self, bo: Arc<BufferObject>) {
        self.batch_bo_pool.free(bo);
    }

    /// Locks the device-wide state.
    ///
    /// Submission holds this lock while it builds and hands over a submission.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Allocates a surface state of `size` bytes from the surface state pool.
    pub fn alloc_surface_state(&self, size: u32, alignment: u32) -> Result<PoolState, OomError> {
        let mut state = self.lock();

        state
            .surface_state_pool
            .alloc(&self.bo_table, size, alignment)
    }

    /// Allocates a binding table of `size` bytes from the surface state pool.
    pub fn alloc_binding_table(&self, size: u32, alignment: u32) -> Result<PoolState, OomError> {
        let mut state = self.lock();

        state
            .surface_state_pool
            .alloc_back(&self.bo_table, size, alignment)
    }

    /// Returns whether a submission failed in the kernel. This never goes back to `false`.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self, reason: fmt::Arguments<'_>) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!("device lost: {}", reason);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("use_softpin", &self.use_softpin)
            .field("can_chain_batches", &self.can_chain_batches)
            .field("use_call_secondary", &self.use_call_secondary)
            .field("cs_prefetch_size", &self.cs_prefetch_size)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}
