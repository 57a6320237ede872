// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording of command buffers.
//!
//! A command buffer records into a [`BatchChain`]. Allocation failures while recording don't
//! fail the recording call; they are remembered and reported by [`CommandBuffer::end`], after
//! which the command buffer can't be submitted until it is reset.
//!
//! Secondary command buffers are executed from primaries with
//! [`execute_commands`](CommandBuffer::execute_commands). How they are merged depends on the
//! [`ExecMode`] picked when the secondary ended.

use crate::{
    batch_bo::{BatchBo, SharedBatchBo},
    chain::{self, BatchChain, BatchChainCreateInfo, ExecMode},
    device::Device,
    instructions::{Instruction, Jump, StoreDataImm, STORE_DATA_IMM_DATA_OFFSET},
    memory::{non_canonical_address, Address, BufferObject},
    reloc::RelocationList,
    state_pool::PoolState,
    DeviceSize, OomError, Validated, ValidationError,
};
use log::warn;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Whether a command buffer is submitted directly or executed from another one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    #[default]
    Primary,
    Secondary,
}

/// How a command buffer is going to be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandBufferUsage {
    /// The command buffer is submitted once, then reset or dropped.
    OneTimeSubmit,

    /// The command buffer may be submitted several times, but never while it is still pending.
    #[default]
    MultipleSubmit,

    /// The command buffer may be pending several times at once, or executed from several
    /// primaries at once.
    SimultaneousUse,
}

/// The recording state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Recording,
    Executable,

    /// Recording ran out of memory. The command buffer must be reset.
    Invalid,
}

/// Parameters to create a new `CommandBuffer`.
#[derive(Clone, Debug)]
pub struct CommandBufferCreateInfo {
    /// The default value is [`CommandBufferLevel::Primary`].
    pub level: CommandBufferLevel,

    /// The default value is [`CommandBufferUsage::MultipleSubmit`].
    pub usage: CommandBufferUsage,

    /// Parameters of the batch chain the command buffer records into.
    pub batch: BatchChainCreateInfo,

    pub _ne: crate::NonExhaustive,
}

impl Default for CommandBufferCreateInfo {
    #[inline]
    fn default() -> Self {
        CommandBufferCreateInfo {
            level: CommandBufferLevel::Primary,
            usage: CommandBufferUsage::MultipleSubmit,
            batch: BatchChainCreateInfo::default(),
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// Relocations written into surface state on behalf of a command buffer.
///
/// Offsets are relative to the center of the surface state pool as it was at
/// `last_pool_center`.
#[derive(Debug, Default)]
pub(crate) struct SurfaceRelocs {
    pub(crate) relocs: RelocationList,
    pub(crate) last_pool_center: u32,
}

/// A command buffer being recorded, or ready to be submitted.
#[derive(Debug)]
pub struct CommandBuffer {
    device: Arc<Device>,
    level: CommandBufferLevel,
    usage: CommandBufferUsage,
    chain: BatchChain,
    surface: Mutex<SurfaceRelocs>,
    surface_pool_bo: Arc<BufferObject>,
    state: CommandBufferState,
}

impl CommandBuffer {
    /// Creates a command buffer in the recording state.
    pub fn new(
        device: Arc<Device>,
        create_info: CommandBufferCreateInfo,
    ) -> Result<Self, Validated<OomError>> {
        let CommandBufferCreateInfo {
            level,
            usage,
            batch,
            _ne: _,
        } = create_info;

        batch
            .validate()
            .map_err(|err| err.add_context("create_info.batch"))?;

        let chain = BatchChain::new(device.clone(), batch)?;
        let surface_pool_bo = device.lock().surface_state_pool().bo().clone();

        Ok(CommandBuffer {
            device,
            level,
            usage,
            chain,
            surface: Mutex::new(SurfaceRelocs::default()),
            surface_pool_bo,
            state: CommandBufferState::Recording,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Returns the first error recording ran into.
    #[inline]
    pub fn status(&self) -> Result<(), OomError> {
        self.chain.batch().status()
    }

    #[inline]
    pub fn chain(&self) -> &BatchChain {
        &self.chain
    }

    /// Returns the BO execution of the command buffer starts in.
    #[inline]
    pub fn first_bo(&self) -> Arc<BufferObject> {
        self.chain.first_bo()
    }

    /// Returns whether the command buffer can be chained to other primaries in one
    /// submission.
    pub fn is_chainable(&self) -> bool {
        self.level == CommandBufferLevel::Primary && chain::is_chainable(&self.device, self.usage)
    }

    #[inline]
    pub(crate) fn surface_relocs(&self) -> MutexGuard<'_, SurfaceRelocs> {
        self.surface.lock()
    }

    #[inline]
    pub(crate) fn surface_pool_bo(&self) -> &Arc<BufferObject> {
        &self.surface_pool_bo
    }

    fn assert_recording(&self) {
        assert_eq!(
            self.state,
            CommandBufferState::Recording,
            "the command buffer is not recording",
        );
    }

    /// Returns `count` dwords of room in the batch, or `None` if recording failed.
    pub fn emit_dwords(&mut self, count: usize) -> Option<&mut [u32]> {
        self.assert_recording();

        self.chain.emit_dwords(count)
    }

    /// Packs `instruction` into the batch and returns its offset in the current batch BO.
    pub fn emit<I: Instruction>(&mut self, instruction: &I) -> Option<u32> {
        self.assert_recording();

        self.chain.emit(instruction)
    }

    /// Returns the address binding table offsets are relative to: the center of the surface
    /// state pool.
    pub fn surface_base_address(&self) -> Address {
        let state = self.device.lock();
        let pool = state.surface_state_pool();

        // An unpinned pool's center is only known at submission, when the relocation is shifted.
        let offset = if self.surface_pool_bo.resolve().is_pinned() {
            pool.center_bo_offset()
        } else {
            0
        };

        Address::new(self.surface_pool_bo.clone(), DeviceSize::from(offset))
    }

    /// Writes the address of `target` into the surface state `state`, at `offset` bytes from its
    /// start, and records the relocation.
    ///
    /// The error is also recorded, and reported again by [`end`](Self::end).
    pub fn write_surface_address(
        &mut self,
        state: PoolState,
        offset: u32,
        target: &Address,
    ) -> Result<(), OomError> {
        self.assert_recording();
        assert!(state.offset >= 0, "binding tables cannot hold addresses");
        assert!(offset + 8 <= state.size);

        let location = state.offset as u32 + offset;
        let surface = self.surface.get_mut();

        let value = match &target.bo {
            None => Ok(target.offset),
            Some(bo) => {
                assert!(target.offset <= i32::MAX as DeviceSize);

                surface
                    .relocs
                    .add(DeviceSize::from(location), bo, target.offset as u32)
            }
        };

        match value {
            Ok(value) => {
                let pool_state = self.device.lock();

                // SAFETY: the surface state belongs to this command buffer, which isn't pending
                // while it records.
                unsafe {
                    pool_state
                        .surface_state_pool()
                        .write(location as i32, &value.to_le_bytes())
                };

                Ok(())
            }
            Err(err) => {
                self.chain.batch_mut().set_error(err);

                Err(err)
            }
        }
    }

    /// Records the execution of `secondaries`, in order.
    ///
    /// Allocation failures are reported by [`end`](Self::end).
    pub fn execute_commands<'a>(
        &mut self,
        secondaries: impl IntoIterator<Item = &'a CommandBuffer>,
    ) -> Result<(), Box<ValidationError>> {
        if self.state != CommandBufferState::Recording {
            return Err(Box::new(ValidationError {
                context: "self".into(),
                problem: "is not in the recording state".into(),
            }));
        }

        if self.level != CommandBufferLevel::Primary {
            return Err(Box::new(ValidationError {
                context: "self".into(),
                problem: "is not a primary command buffer".into(),
            }));
        }

        for (index, secondary) in secondaries.into_iter().enumerate() {
            if !Arc::ptr_eq(&secondary.device, &self.device) {
                return Err(Box::new(ValidationError {
                    context: format!("secondaries[{}]", index).into(),
                    problem: "was not created from the same device as `self`".into(),
                }));
            }

            if secondary.level != CommandBufferLevel::Secondary {
                return Err(Box::new(ValidationError {
                    context: format!("secondaries[{}]", index).into(),
                    problem: "is not a secondary command buffer".into(),
                }));
            }

            if secondary.state != CommandBufferState::Executable {
                return Err(Box::new(ValidationError {
                    context: format!("secondaries[{}]", index).into(),
                    problem: "is not in the executable state".into(),
                }));
            }

            if let Err(err) = self.add_secondary(secondary) {
                self.chain.batch_mut().set_error(err);
            }
        }

        Ok(())
    }

    fn add_secondary(&mut self, secondary: &CommandBuffer) -> Result<(), OomError> {
        if self.chain.batch().has_error() {
            return Ok(());
        }

        let Some(exec_mode) = secondary.chain.exec_mode() else {
            unreachable!("executable command buffers have an execution mode");
        };
        let secondary_bbos = secondary.chain.bbos();

        match exec_mode {
            ExecMode::Emit | ExecMode::GrowAndEmit => {
                let bbo = secondary_bbos[0].lock();

                if exec_mode == ExecMode::GrowAndEmit {
                    self.chain.grow_current(bbo.len())?;
                }

                self.chain.emit_batch(bbo.bo(), bbo.len(), bbo.relocs());
            }
            ExecMode::Chain => {
                let first_bo = secondary.first_bo();
                if self.chain.emit(&Jump(Address::new(first_bo, 0))).is_none() {
                    return Ok(());
                }

                // Return right after the jump.
                let current_bo = self.chain.current_bo();
                let return_offset = self.chain.batch().len();
                secondary_bbos[secondary_bbos.len() - 1]
                    .lock()
                    .link(&current_bo, return_offset);

                self.chain.add_seen(secondary_bbos)?;
            }
            ExecMode::CopyAndChain => {
                let mut copies: Vec<BatchBo> = Vec::new();
                copies.try_reserve_exact(secondary_bbos.len())?;

                for bbo in secondary_bbos {
                    copies.push(bbo.lock().try_clone()?);
                }

                for index in 1..copies.len() {
                    let next = copies[index].bo().clone();
                    copies[index - 1].link(&next, 0);
                }

                let mut shared: Vec<SharedBatchBo> = Vec::new();
                shared.try_reserve_exact(copies.len())?;
                shared.extend(copies.into_iter().map(|copy| Arc::new(Mutex::new(copy))));

                self.chain.add_seen(&shared)?;
                self.chain.splice(shared)?;
            }
            ExecMode::CallAndReturn => {
                let return_address = secondary.chain.return_address().clone();
                let Some(store_offset) = self.chain.emit(&StoreDataImm {
                    address: return_address,
                    data: 0,
                }) else {
                    return Ok(());
                };
                let store_bo = self.chain.current_bo();

                let first_bo = secondary.first_bo();
                if self.chain.emit(&Jump(Address::new(first_bo, 0))).is_none() {
                    return Ok(());
                }

                // The secondary jumps back to right after the call.
                let return_bo = self.chain.current_bo();
                let return_to =
                    non_canonical_address(return_bo.offset() + DeviceSize::from(self.chain.batch().len()));

                // SAFETY: the store was just emitted, and nothing reads the batch while it records.
                unsafe {
                    store_bo.write_u64(
                        DeviceSize::from(store_offset + STORE_DATA_IMM_DATA_OFFSET),
                        return_to,
                    )
                };

                self.chain.add_seen(secondary_bbos)?;
            }
            ExecMode::Primary => unreachable!("secondaries are never ended as primaries"),
        }

        self.surface
            .get_mut()
            .relocs
            .append(&secondary.surface.lock().relocs, 0)
    }

    /// Ends recording.
    ///
    /// On success the command buffer becomes executable. If recording ran out of memory, the
    /// command buffer becomes invalid and the error is returned.
    pub fn end(&mut self) -> Result<(), OomError> {
        self.assert_recording();

        self.chain.end(self.level, self.usage);

        match self.chain.batch().status() {
            Ok(()) => {
                self.state = CommandBufferState::Executable;

                Ok(())
            }
            Err(err) => {
                warn!(
                    "recording of a {:?} command buffer failed: {}",
                    self.level, err,
                );
                self.state = CommandBufferState::Invalid;

                Err(err)
            }
        }
    }

    /// Drops everything that was recorded and goes back to the recording state.
    ///
    /// The command buffer must not be pending, and no primary may still execute it.
    pub fn reset(&mut self) {
        self.chain.reset();

        let surface = self.surface.get_mut();
        surface.relocs.clear();
        surface.last_pool_center = 0;

        self.state = CommandBufferState::Recording;
    }
}
