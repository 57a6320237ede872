// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The list of batch BOs a command buffer records into.
//!
//! A full batch BO is either followed by a new BO it jumps to ([`ExtendPolicy::Chain`]) or moved
//! into a BO twice as large ([`ExtendPolicy::Grow`]). Every batch BO keeps [`JUMP_SIZE`] bytes
//! free at its end for that jump. A new BO is as large as all the previous ones together, up to
//! the chain's maximum size.

use crate::{
    batch::{Batch, BatchExtend, NoExtend},
    batch_bo::{BatchBo, SharedBatchBo},
    command_buffer::{CommandBufferLevel, CommandBufferUsage},
    device::Device,
    instructions::{BatchBufferEnd, Instruction, Jump, Noop, JUMP_ADDRESS_OFFSET, JUMP_SIZE},
    memory::{Address, BufferObject},
    reloc::RelocationList,
    DeviceSize, OomError, Validated, ValidationError,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;

/// The smallest batch BO a chain allocates.
pub const MIN_BATCH_SIZE: u32 = 8192;

/// The largest batch BO a chain allocates when it overflows.
pub const MAX_BATCH_SIZE: u32 = 16 * 1024 * 1024;

/// How a chain makes room when its current batch BO is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtendPolicy {
    /// Jump to a newly allocated batch BO.
    Chain,

    /// Copy the batch into a BO twice as large.
    Grow,
}

/// How an ended command buffer is executed.
///
/// For secondaries, this decides how they are merged into the primaries that execute them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// A primary command buffer.
    Primary,

    /// The secondary is small and is copied into the primary.
    Emit,

    /// The primary's batch BO is grown, and the secondary is copied into it. Used when batch
    /// BOs cannot be chained.
    GrowAndEmit,

    /// The primary jumps into the secondary, and the secondary's last batch BO is patched to
    /// jump back. The secondary can be in only one primary at a time.
    Chain,

    /// The secondary's batch BOs are copied and the copies are spliced into the primary's
    /// chain. Used for secondaries that may be executed by several primaries at once.
    CopyAndChain,

    /// The primary stores its return address into the secondary's last jump, then jumps into
    /// the secondary.
    CallAndReturn,
}

/// Parameters of a [`BatchChain`].
#[derive(Clone, Debug)]
pub struct BatchChainCreateInfo {
    /// The size of the first batch BO. Must be a power of two of at least 4096.
    ///
    /// The default value is [`MIN_BATCH_SIZE`].
    pub initial_size: u32,

    /// The size new batch BOs are capped at. Must be a power of two of at least
    /// `initial_size`.
    ///
    /// The default value is [`MAX_BATCH_SIZE`].
    pub max_size: u32,

    pub _ne: crate::NonExhaustive,
}

impl Default for BatchChainCreateInfo {
    #[inline]
    fn default() -> Self {
        BatchChainCreateInfo {
            initial_size: MIN_BATCH_SIZE,
            max_size: MAX_BATCH_SIZE,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl BatchChainCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            initial_size,
            max_size,
            _ne: _,
        } = self;

        if !initial_size.is_power_of_two() || initial_size < 4096 {
            return Err(Box::new(ValidationError {
                context: "initial_size".into(),
                problem: "is not a power of two of at least 4096".into(),
            }));
        }

        if !max_size.is_power_of_two() || max_size < initial_size {
            return Err(Box::new(ValidationError {
                context: "max_size".into(),
                problem: "is not a power of two of at least `initial_size`".into(),
            }));
        }

        Ok(())
    }
}

/// Returns whether a primary recorded with `usage` can be chained to other primaries at
/// submission.
pub(crate) fn is_chainable(device: &Device, usage: CommandBufferUsage) -> bool {
    device.use_softpin() && device.can_chain_batches() && usage != CommandBufferUsage::SimultaneousUse
}

/// Emits a jump to `next` at the end of `current`, and finishes `current`.
fn chain_to(batch: &mut Batch, current: &mut BatchBo, next: &Arc<BufferObject>, next_offset: u32) {
    batch.release_reserve(JUMP_SIZE);
    debug_assert_eq!(DeviceSize::from(batch.capacity()), current.bo().size());

    batch.emit(
        &mut NoExtend,
        &Jump(Address::new(next.clone(), DeviceSize::from(next_offset))),
    );
    current.finish(batch);
}

// The part of the chain that the batch calls back into when it overflows.
#[derive(Debug)]
struct ChainLinks {
    device: Arc<Device>,
    policy: ExtendPolicy,
    max_size: u32,
    total_size: u32,
    bbos: Vec<SharedBatchBo>,
    seen: Vec<SharedBatchBo>,
}

impl ChainLinks {
    fn current(&self) -> &SharedBatchBo {
        &self.bbos[self.bbos.len() - 1]
    }

    fn chain_new(&mut self, batch: &mut Batch, required: u32) -> Result<(), OomError> {
        let alloc_size = required
            .checked_add(JUMP_SIZE)
            .ok_or(OomError::OutOfDeviceMemory)?
            .max(self.total_size.min(self.max_size));

        // Everything that can fail happens before the chain is touched.
        self.bbos.try_reserve(1)?;
        self.seen.try_reserve(1)?;
        let new_bbo = BatchBo::new(self.device.clone(), alloc_size)?;
        self.total_size = self
            .total_size
            .saturating_add(new_bbo.bo().size() as u32);

        let new_bo = new_bbo.bo().clone();
        chain_to(batch, &mut self.current().lock(), &new_bo, 0);

        let new_bbo = Arc::new(Mutex::new(new_bbo));
        new_bbo.lock().start(batch, JUMP_SIZE);

        debug!(
            "chained batch BO {} ({} bytes), {} BOs in the chain",
            new_bo.handle(),
            new_bo.size(),
            self.bbos.len() + 1,
        );

        self.bbos.push(new_bbo.clone());
        self.seen.push(new_bbo);

        Ok(())
    }
}

impl BatchExtend for ChainLinks {
    fn extend(&mut self, batch: &mut Batch, required: u32) -> Result<(), OomError> {
        match self.policy {
            ExtendPolicy::Chain => self.chain_new(batch, required),
            ExtendPolicy::Grow => self.current().lock().grow(batch, required, JUMP_SIZE),
        }
    }
}

/// A growable list of batch BOs and the cursor writing into the last one.
#[derive(Debug)]
pub struct BatchChain {
    batch: Batch,
    links: ChainLinks,
    initial_size: u32,
    exec_mode: Option<ExecMode>,
    batch_end: u32,
    return_address: Address,
}

impl BatchChain {
    /// Creates a chain with one batch BO of `create_info.initial_size` bytes.
    ///
    /// The extension policy follows [`Device::can_chain_batches`].
    pub fn new(
        device: Arc<Device>,
        create_info: BatchChainCreateInfo,
    ) -> Result<Self, Validated<OomError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let BatchChainCreateInfo {
            initial_size,
            max_size,
            _ne: _,
        } = create_info;

        let policy = if device.can_chain_batches() {
            ExtendPolicy::Chain
        } else {
            ExtendPolicy::Grow
        };

        let mut first = BatchBo::new(device.clone(), initial_size).map_err(Validated::Error)?;
        let mut batch = Batch::new();
        first.start(&mut batch, JUMP_SIZE);

        let first = Arc::new(Mutex::new(first));

        Ok(BatchChain {
            batch,
            links: ChainLinks {
                device,
                policy,
                max_size,
                total_size: initial_size,
                bbos: vec![first.clone()],
                seen: vec![first],
            },
            initial_size,
            exec_mode: None,
            batch_end: 0,
            return_address: Address::NULL,
        })
    }

    /// Returns the cursor writing into the current batch BO.
    #[inline]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    #[inline]
    pub(crate) fn batch_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }

    /// Returns the batch BOs this chain owns, in execution order.
    #[inline]
    pub fn bbos(&self) -> &[SharedBatchBo] {
        &self.links.bbos
    }

    /// Returns every batch BO that must be resident to execute this chain, including the ones
    /// of executed secondaries.
    #[inline]
    pub fn seen_bbos(&self) -> &[SharedBatchBo] {
        &self.links.seen
    }

    /// Returns the batch BO currently written into.
    #[inline]
    pub fn current_bbo(&self) -> &SharedBatchBo {
        self.links.current()
    }

    /// Returns the BO currently written into.
    pub fn current_bo(&self) -> Arc<BufferObject> {
        match self.batch.bo() {
            Some(bo) => bo.clone(),
            None => unreachable!("a chain's batch is always bound"),
        }
    }

    /// Returns the BO execution starts in.
    pub fn first_bo(&self) -> Arc<BufferObject> {
        self.links.bbos[0].lock().bo().clone()
    }

    /// Returns how the chain is executed, once it has ended.
    #[inline]
    pub fn exec_mode(&self) -> Option<ExecMode> {
        self.exec_mode
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.exec_mode.is_some()
    }

    /// Returns the offset of the end-of-batch instruction of an ended primary, in its last
    /// batch BO.
    #[inline]
    pub fn batch_end(&self) -> u32 {
        self.batch_end
    }

    /// Returns the address of the return jump of a secondary ended in
    /// [`ExecMode::CallAndReturn`].
    #[inline]
    pub fn return_address(&self) -> &Address {
        &self.return_address
    }

    /// Returns `count` dwords of room, or `None` if the chain has an error.
    pub fn emit_dwords(&mut self, count: usize) -> Option<&mut [u32]> {
        assert!(!self.is_ended(), "the chain has ended");

        self.batch.emit_dwords(&mut self.links, count)
    }

    /// Packs `instruction` into the chain and returns its offset in the current batch BO.
    pub fn emit<I: Instruction>(&mut self, instruction: &I) -> Option<u32> {
        assert!(!self.is_ended(), "the chain has ended");

        self.batch.emit(&mut self.links, instruction)
    }

    /// Copies `len` bytes of `src` and their relocations into the chain.
    pub fn emit_batch(
        &mut self,
        src: &BufferObject,
        len: u32,
        relocs: &RelocationList,
    ) -> Option<u32> {
        assert!(!self.is_ended(), "the chain has ended");

        self.batch.emit_batch(&mut self.links, src, len, relocs)
    }

    /// Grows the current batch BO so that `additional` bytes fit.
    pub(crate) fn grow_current(&mut self, additional: u32) -> Result<(), OomError> {
        self.links
            .current()
            .lock()
            .grow(&mut self.batch, additional, JUMP_SIZE)
    }

    /// Adds batch BOs that execution of this chain reaches.
    pub(crate) fn add_seen(&mut self, bbos: &[SharedBatchBo]) -> Result<(), OomError> {
        self.links.seen.try_reserve(bbos.len())?;
        self.links.seen.extend_from_slice(bbos);

        Ok(())
    }

    /// Jumps from the current batch BO into the first of `bbos`, and continues recording after
    /// the end of the last one. The BOs must end with a jump each, except the last one.
    pub(crate) fn splice(&mut self, bbos: Vec<SharedBatchBo>) -> Result<(), OomError> {
        assert!(!bbos.is_empty());

        self.links.bbos.try_reserve(bbos.len())?;

        let first_bo = bbos[0].lock().bo().clone();
        chain_to(&mut self.batch, &mut self.links.current().lock(), &first_bo, 0);

        let last = bbos[bbos.len() - 1].clone();
        self.links.bbos.extend(bbos);
        last.lock().resume(&mut self.batch, JUMP_SIZE);

        Ok(())
    }

    /// Ends recording and picks the execution mode.
    ///
    /// Errors are recorded in the batch.
    pub(crate) fn end(&mut self, level: CommandBufferLevel, usage: CommandBufferUsage) {
        assert!(!self.is_ended(), "the chain has already ended");

        let device = self.links.device.clone();

        let exec_mode = match level {
            CommandBufferLevel::Primary => {
                // The batch length must be an even number of dwords.
                while self.batch.len() % 8 != 0 {
                    if self.batch.emit(&mut self.links, &Noop).is_none() {
                        break;
                    }
                }

                // The end goes into the current BO, in the space reserved for a jump.
                self.batch.release_reserve(JUMP_SIZE);
                self.batch_end = self.batch.len();

                if is_chainable(&device, usage) {
                    // Replaced at submission by a jump to the next primary, or a batch end.
                    let own_bo = Address::new(self.current_bo(), 0);
                    self.batch.emit(&mut NoExtend, &Jump(own_bo));
                } else {
                    self.batch.emit(&mut NoExtend, &BatchBufferEnd);
                    self.batch.emit(&mut NoExtend, &Noop);
                }

                ExecMode::Primary
            }
            CommandBufferLevel::Secondary => {
                let length = self.batch.len();

                if !device.can_chain_batches() {
                    ExecMode::GrowAndEmit
                } else if device.use_call_secondary() {
                    if self.links.bbos.len() == 1 {
                        // Make sure the command streamer doesn't prefetch past the end.
                        let mut padded = length;
                        while padded < device.cs_prefetch_size() {
                            self.batch.emit(&mut self.links, &Noop);
                            padded += 4;
                        }
                    }

                    // The primary stores its return address into this jump.
                    if let Some(offset) = self.batch.emit(&mut self.links, &Jump(Address::NULL)) {
                        self.return_address = self
                            .batch
                            .start_address()
                            .add(DeviceSize::from(offset + JUMP_ADDRESS_OFFSET));
                    }

                    ExecMode::CallAndReturn
                } else if self.links.bbos.len() == 1 && length < self.initial_size / 2 {
                    ExecMode::Emit
                } else if usage != CommandBufferUsage::SimultaneousUse {
                    // Patched to jump back into the primary that executes this.
                    self.batch.release_reserve(JUMP_SIZE);
                    let own_bo = Address::new(self.current_bo(), 0);
                    self.batch.emit(&mut NoExtend, &Jump(own_bo));

                    ExecMode::Chain
                } else {
                    ExecMode::CopyAndChain
                }
            }
        };

        let current = self.links.current().clone();
        let mut current = current.lock();
        current.finish(&mut self.batch);

        if level == CommandBufferLevel::Primary {
            current.set_chained(is_chainable(&device, usage));
        }

        trace!(
            "ended {:?} chain of {} batch BOs as {:?}",
            level,
            self.links.bbos.len(),
            exec_mode,
        );

        self.exec_mode = Some(exec_mode);
    }

    /// Drops every batch BO but the first, and starts over at its beginning.
    pub fn reset(&mut self) {
        if !self.is_ended() {
            let current = self.links.current().clone();
            current.lock().finish(&mut self.batch);
        }

        self.links.bbos.truncate(1);

        let first = self.links.bbos[0].clone();
        first.lock().start(&mut self.batch, JUMP_SIZE);

        self.links.seen.clear();
        self.links.total_size = first.lock().bo().size() as u32;
        self.links.seen.push(first);

        self.batch.clear_error();
        self.exec_mode = None;
        self.batch_end = 0;
        self.return_address = Address::NULL;
    }
}
