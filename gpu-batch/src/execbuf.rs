// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Building the execbuffer descriptor of a submission.
//!
//! Every BO the submitted command buffers reach is added once to a flat object list, with the
//! BO holding the first instruction last. Relocations are patched on the host when every object
//! already has a GPU address, and left to the kernel otherwise.

use crate::{
    batch::{Batch, NoExtend},
    batch_bo::SharedBatchBo,
    command_buffer::CommandBuffer,
    device::{Device, DeviceState},
    instructions::{Jump, MI_BATCH_BUFFER_END},
    memory::{Address, BufferObject},
    reloc::{RelocationEntry, RelocationList},
    DeviceSize, OomError,
};
use bytemuck::{Pod, Zeroable};
use log::trace;
use std::sync::Arc;

/// The kernel may skip relocation if no object moved.
pub const EXEC_NO_RELOC: u64 = 1 << 11;

/// Relocation targets are indices in the object list rather than GEM handles.
pub const EXEC_HANDLE_LUT: u64 = 1 << 12;

const MIN_OBJECT_CAPACITY: usize = 64;

/// One entry of the object list, laid out the way the kernel reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ExecObject {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,

    /// The address the BO is presumed to be at. Updated by the kernel.
    pub offset: u64,

    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

/// Who patches the relocations of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocationMode {
    /// Relocations were applied on the host. The kernel trusts the presumed addresses.
    Skip,

    /// The kernel patches every relocation whose presumed address is wrong.
    KernelPatch,
}

/// A built submission, ready for an [`ExecTransport`](crate::queue::ExecTransport).
#[derive(Debug)]
pub struct ExecBuffer {
    objects: Vec<ExecObject>,
    bos: Vec<Arc<BufferObject>>,
    relocations: Vec<Vec<RelocationEntry>>,
    batch_start_offset: u32,
    batch_len: u32,
    relocation_mode: RelocationMode,
    software_relocations: usize,
}

impl ExecBuffer {
    /// Returns the object list. The last object contains the first instruction to execute.
    #[inline]
    pub fn objects(&self) -> &[ExecObject] {
        &self.objects
    }

    /// Returns the object list, for the transport to store the final addresses in.
    #[inline]
    pub fn objects_mut(&mut self) -> &mut [ExecObject] {
        &mut self.objects
    }

    /// Returns the BO of each object.
    #[inline]
    pub fn bos(&self) -> &[Arc<BufferObject>] {
        &self.bos
    }

    /// Returns the relocations of each object. `relocs_ptr` of each object points here.
    #[inline]
    pub fn relocations(&self) -> &[Vec<RelocationEntry>] {
        &self.relocations
    }

    #[inline]
    pub fn batch_start_offset(&self) -> u32 {
        self.batch_start_offset
    }

    /// Returns the length of the batch, or zero if the kernel finds the end itself.
    #[inline]
    pub fn batch_len(&self) -> u32 {
        self.batch_len
    }

    #[inline]
    pub fn relocation_mode(&self) -> RelocationMode {
        self.relocation_mode
    }

    /// Returns the number of addresses written on the host while building.
    #[inline]
    pub fn software_relocations(&self) -> usize {
        self.software_relocations
    }

    /// Returns the execbuffer flags.
    pub fn flags(&self) -> u64 {
        match self.relocation_mode {
            RelocationMode::Skip => EXEC_HANDLE_LUT | EXEC_NO_RELOC,
            RelocationMode::KernelPatch => EXEC_HANDLE_LUT,
        }
    }

    /// Copies the addresses the kernel picked back into the BOs.
    pub(crate) fn write_back_offsets(&self) {
        for (object, bo) in self.objects.iter().zip(&self.bos) {
            if !bo.is_pinned() && object.offset != bo.offset() {
                bo.set_offset(object.offset);
            }
        }
    }
}

// Where the relocations of an object come from.
#[derive(Clone)]
enum RelocSource {
    BatchBo(SharedBatchBo),
    // The surface relocations of every command buffer of the submission. They all patch the
    // surface state pool.
    Surface,
}

impl RelocSource {
    fn is_same(&self, other: &RelocSource) -> bool {
        match (self, other) {
            (Self::BatchBo(a), Self::BatchBo(b)) => Arc::ptr_eq(a, b),
            (Self::Surface, Self::Surface) => true,
            _ => false,
        }
    }
}

struct ExecBuilder<'a> {
    device: &'a Device,
    command_buffers: &'a [&'a CommandBuffer],
    generation: u32,
    objects: Vec<ExecObject>,
    bos: Vec<Arc<BufferObject>>,
    sources: Vec<Option<RelocSource>>,
    has_relocs: bool,
}

impl ExecBuilder<'_> {
    // Calls `f` with each relocation list of `source` and the BO the list patches.
    fn for_each_list(&self, source: &RelocSource, mut f: impl FnMut(&mut RelocationList, &BufferObject)) {
        match source {
            RelocSource::BatchBo(bbo) => {
                let mut bbo = bbo.lock();
                let bo = bbo.bo().clone();

                f(bbo.relocs_mut(), &bo);
            }
            RelocSource::Surface => {
                for command_buffer in self.command_buffers {
                    let bo = command_buffer.surface_pool_bo().resolve();

                    f(&mut command_buffer.surface_relocs().relocs, &bo);
                }
            }
        }
    }

    fn add_bo(&mut self, bo: &Arc<BufferObject>, source: Option<RelocSource>) -> Result<(), OomError> {
        let bo = bo.resolve();

        let existing = bo
            .exec_index(self.generation)
            .filter(|&index| {
                self.bos
                    .get(index as usize)
                    .is_some_and(|other| Arc::ptr_eq(other, &bo))
            });

        let index = match existing {
            Some(index) => index as usize,
            None => {
                if self.objects.len() == self.objects.capacity() {
                    let additional = self.objects.capacity().max(MIN_OBJECT_CAPACITY);
                    self.objects.try_reserve_exact(additional)?;
                    self.bos.try_reserve_exact(additional)?;
                    self.sources.try_reserve_exact(additional)?;
                }

                let index = self.objects.len();
                self.objects.push(ExecObject {
                    handle: bo.handle(),
                    offset: bo.offset(),
                    flags: bo.flags().to_exec_flags(),
                    ..Default::default()
                });
                bo.set_exec_index(self.generation, index as u32);
                self.bos.push(bo);
                self.sources.push(None);

                index
            }
        };

        let Some(source) = source else {
            return Ok(());
        };

        match &self.sources[index] {
            Some(existing) if existing.is_same(&source) => return Ok(()),
            Some(_) => panic!("relocations attached twice to BO {}", self.bos[index].handle()),
            None => {}
        }

        let mut targets = Vec::new();
        let mut dependencies = Vec::new();
        let mut reserved = Ok(());
        self.for_each_list(&source, |relocs, _| {
            if reserved.is_ok() {
                reserved = targets.try_reserve(relocs.targets().len());
                targets.extend_from_slice(relocs.targets());
                dependencies.extend(relocs.dependencies());
            }
        });
        reserved?;

        self.has_relocs |= !targets.is_empty();
        self.sources[index] = Some(source);

        for target in &targets {
            self.add_bo(target, None)?;
        }

        for handle in dependencies {
            let Some(dependency) = self.device.bo_table().get(handle) else {
                panic!("BO {} is a dependency but is not alive", handle);
            };

            self.add_bo(&dependency, None)?;
        }

        Ok(())
    }

    fn move_to_end(&mut self, bo: &Arc<BufferObject>) {
        let Some(index) = bo.exec_index(self.generation) else {
            panic!("the first batch BO is not part of the submission");
        };
        let index = index as usize;
        let last = self.objects.len() - 1;

        if index == last {
            return;
        }

        self.objects.swap(index, last);
        self.bos.swap(index, last);
        self.sources.swap(index, last);
        self.bos[index].set_exec_index(self.generation, index as u32);
        self.bos[last].set_exec_index(self.generation, last as u32);
    }

    fn set_target_indices(&self) {
        let generation = self.generation;

        for source in self.sources.iter().flatten() {
            self.for_each_list(source, |relocs, _| relocs.set_target_indices(generation));
        }
    }

    // Applies every relocation on the host, unless some BO was never placed.
    fn relocate(&mut self) -> Option<usize> {
        if self.bos.iter().any(|bo| !bo.has_offset()) {
            // Surface state is shared, so what the pool holds is unknown.
            for command_buffer in self.command_buffers {
                command_buffer
                    .surface_relocs()
                    .relocs
                    .invalidate_presumed_offsets();
            }

            return None;
        }

        let mut written = 0;

        for source in self.sources.iter().flatten() {
            let always = matches!(source, RelocSource::Surface);

            // SAFETY: the device lock is held, so no other submission is patching the same
            // BOs, and the relocations were recorded within these BOs.
            self.for_each_list(source, |relocs, bo| written += unsafe { relocs.apply(bo, always) });
        }

        for (object, bo) in self.objects.iter_mut().zip(&self.bos) {
            object.offset = bo.offset();
        }

        Some(written)
    }
}

// Shifts relocations against the surface state pool by how far its center moved since the
// command buffer was last submitted.
fn adjust_surface_relocations(command_buffer: &CommandBuffer, state: &DeviceState) {
    let pool = state.surface_state_pool();
    let center = pool.center_bo_offset();
    let mut surface = command_buffer.surface_relocs();

    assert!(surface.last_pool_center <= center);
    let delta = center - surface.last_pool_center;

    if delta != 0 {
        surface.relocs.shift_offsets(DeviceSize::from(delta));

        for bbo in command_buffer.chain().seen_bbos() {
            let mut bbo = bbo.lock();
            let bo = bbo.bo().clone();

            // SAFETY: the batch BO is finished, and the device lock is held.
            unsafe { bbo.relocs_mut().shift_deltas(pool.bo(), delta, &bo) };
        }
    }

    surface.last_pool_center = center;
}

// Rewrites the end of each primary into a jump to the next one, and the end of the last one
// into a batch end.
fn chain_command_buffers(command_buffers: &[&CommandBuffer]) {
    if !command_buffers[0].is_chainable() {
        assert_eq!(command_buffers.len(), 1, "the command buffers cannot be chained");
        return;
    }

    for pair in command_buffers.windows(2) {
        let next_bo = pair[1].first_bo();
        let mut bbo = pair[0].chain().current_bbo().lock();
        let bo = bbo.bo().clone();

        let mut batch = Batch::new();
        batch.bind(&bo, bo.size() as u32, pair[0].chain().batch_end());
        batch.set_relocs(bbo.relocs_mut().take());
        batch.emit(&mut NoExtend, &Jump(Address::new(next_bo, 0)));
        *bbo.relocs_mut() = batch.take_relocs();
        bbo.set_chained(true);
    }

    let last = command_buffers[command_buffers.len() - 1];
    let mut bbo = last.chain().current_bbo().lock();

    // SAFETY: the batch BO is finished, and the device lock is held.
    unsafe {
        bbo.bo()
            .write_u32(DeviceSize::from(last.chain().batch_end()), MI_BATCH_BUFFER_END)
    };
    bbo.set_chained(false);
}

/// Builds the submission of `command_buffers`, which must be executable primaries of `device`
/// and chainable if there is more than one.
///
/// Running out of memory leaves nothing to submit, but relocations may have been updated.
pub(crate) fn build_exec_buffer(
    device: &Device,
    state: &mut DeviceState,
    command_buffers: &[&CommandBuffer],
) -> Result<ExecBuffer, OomError> {
    assert!(!command_buffers.is_empty());

    let generation = state.next_exec_generation();
    for command_buffer in command_buffers {
        adjust_surface_relocations(command_buffer, state);
    }

    let mut builder = ExecBuilder {
        device,
        command_buffers,
        generation,
        objects: Vec::new(),
        bos: Vec::new(),
        sources: Vec::new(),
        has_relocs: false,
    };

    builder.add_bo(state.surface_state_pool().bo(), Some(RelocSource::Surface))?;

    for command_buffer in command_buffers {
        for bbo in command_buffer.chain().seen_bbos() {
            let bo = bbo.lock().bo().clone();
            builder.add_bo(&bo, Some(RelocSource::BatchBo(bbo.clone())))?;
        }
    }

    builder.move_to_end(&command_buffers[0].first_bo());

    let mut relocation_mode = RelocationMode::Skip;
    let mut software_relocations = 0;

    if builder.has_relocs {
        builder.set_target_indices();

        match builder.relocate() {
            Some(written) => software_relocations = written,
            None => relocation_mode = RelocationMode::KernelPatch,
        }
    }

    trace!(
        "built submission of {} command buffers: {} objects, {:?}, {} host relocations",
        command_buffers.len(),
        builder.objects.len(),
        relocation_mode,
        software_relocations,
    );

    chain_command_buffers(command_buffers);

    let mut relocations = Vec::new();
    relocations.try_reserve_exact(builder.objects.len())?;

    for source in &builder.sources {
        let mut entries = Vec::new();
        let mut reserved = Ok(());

        if let Some(source) = source {
            builder.for_each_list(source, |relocs, _| {
                if reserved.is_ok() {
                    reserved = entries.try_reserve(relocs.len());
                    entries.extend_from_slice(relocs.entries());
                }
            });
        }
        reserved?;

        relocations.push(entries);
    }

    let ExecBuilder { mut objects, bos, .. } = builder;

    for (object, entries) in objects.iter_mut().zip(&relocations) {
        object.relocation_count = entries.len() as u32;
        object.relocs_ptr = entries.as_ptr() as u64;
    }

    let batch_len = if device.can_chain_batches() {
        0
    } else {
        command_buffers[0].chain().bbos()[0].lock().len()
    };

    Ok(ExecBuffer {
        objects,
        bos,
        relocations,
        batch_start_offset: 0,
        batch_len,
        relocation_mode,
        software_relocations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_buffer::{CommandBufferCreateInfo, CommandBufferLevel, CommandBufferUsage},
        instructions::{is_batch_buffer_start, StoreDataImm},
        reloc::INVALID_TARGET,
    };
    use std::collections::HashSet;

    fn build(device: &Arc<Device>, command_buffers: &[&CommandBuffer]) -> ExecBuffer {
        let mut state = device.lock();

        build_exec_buffer(device, &mut state, command_buffers).unwrap()
    }

    fn small_primary(device: &Arc<Device>) -> CommandBuffer {
        CommandBuffer::new(
            device.clone(),
            CommandBufferCreateInfo {
                batch: crate::chain::BatchChainCreateInfo {
                    initial_size: 4096,
                    max_size: 4096,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn objects_are_deduplicated() {
        let (device, _transport, _allocator) = test_device!(use_softpin: false);
        let target = device.bo_table().allocate(&Default::default()).unwrap();
        let mut cb = small_primary(&device);

        // The target is referenced from two batch BOs and from surface state.
        cb.emit(&StoreDataImm {
            address: Address::new(target.clone(), 0),
            data: 0,
        })
        .unwrap();
        cb.emit_dwords(1015).unwrap();
        cb.emit(&StoreDataImm {
            address: Address::new(target.clone(), 8),
            data: 0,
        })
        .unwrap();
        let surface = device.alloc_surface_state(64, 64).unwrap();
        cb.write_surface_address(surface, 0, &Address::new(target.clone(), 0))
            .unwrap();
        cb.end().unwrap();
        assert_eq!(cb.chain().bbos().len(), 2);

        let execbuf = build(&device, &[&cb]);

        let handles: HashSet<_> = execbuf.objects().iter().map(|object| object.handle).collect();
        assert_eq!(handles.len(), execbuf.objects().len());
        assert_eq!(execbuf.objects().len(), 4);
        assert!(handles.contains(&target.handle()));
    }

    #[test]
    fn first_batch_bo_is_last() {
        let (device, _transport, _allocator) = test_device!();
        let mut a = small_primary(&device);
        let mut b = small_primary(&device);
        a.emit_dwords(2000).unwrap();
        b.emit_dwords(10).unwrap();
        a.end().unwrap();
        b.end().unwrap();

        let execbuf = build(&device, &[&a, &b]);

        let last = execbuf.objects().len() - 1;
        assert_eq!(execbuf.objects()[last].handle, a.first_bo().handle());
        assert_eq!(a.first_bo().exec_index(device.lock().exec_generation()), Some(last as u32));
        assert_eq!(execbuf.relocation_mode(), RelocationMode::Skip);
        assert_eq!(execbuf.software_relocations(), 0);
    }

    #[test]
    fn primaries_are_chained() {
        let (device, _transport, _allocator) = test_device!();
        let mut a = small_primary(&device);
        let mut b = small_primary(&device);
        a.emit_dwords(2).unwrap();
        b.emit_dwords(2).unwrap();
        a.end().unwrap();
        b.end().unwrap();

        build(&device, &[&a, &b]);

        let b_first = b.first_bo();
        let a_bbo = a.chain().current_bbo().lock();
        let b_bbo = b.chain().current_bbo().lock();
        let a_end = DeviceSize::from(a.chain().batch_end());
        unsafe {
            assert!(is_batch_buffer_start(a_bbo.bo().read_u32(a_end)));
            assert_eq!(a_bbo.bo().read_u64(a_end + 4), b_first.offset());
            assert_eq!(
                b_bbo.bo().read_u32(DeviceSize::from(b.chain().batch_end())),
                MI_BATCH_BUFFER_END,
            );
        }
        assert!(a_bbo.is_chained());
        assert!(!b_bbo.is_chained());
    }

    #[test]
    fn kernel_patch_indices_follow_reordering() {
        let (device, _transport, _allocator) = test_device!(use_softpin: false);
        let target = device.bo_table().allocate(&Default::default()).unwrap();
        let mut cb = small_primary(&device);
        cb.emit(&StoreDataImm {
            address: Address::new(target.clone(), 0),
            data: 0,
        })
        .unwrap();
        cb.end().unwrap();

        let execbuf = build(&device, &[&cb]);
        assert_eq!(execbuf.relocation_mode(), RelocationMode::KernelPatch);
        assert_eq!(execbuf.flags() & EXEC_NO_RELOC, 0);
        assert_eq!(execbuf.batch_len(), 0);

        let last = execbuf.objects().len() - 1;
        let relocs = &execbuf.relocations()[last];
        assert_eq!(relocs.len(), 1);
        assert_ne!(relocs[0].target_handle, INVALID_TARGET);
        assert_eq!(
            execbuf.objects()[relocs[0].target_handle as usize].handle,
            target.handle(),
        );
        assert_eq!(execbuf.objects()[last].relocation_count, 1);
        assert_eq!(execbuf.objects()[last].relocs_ptr, relocs.as_ptr() as u64);
    }

    #[test]
    fn batch_len_without_chaining() {
        let (device, _transport, _allocator) = test_device!(use_softpin: false, can_chain_batches: false);
        let mut cb = small_primary(&device);
        cb.emit_dwords(2000).unwrap();
        cb.end().unwrap();

        let execbuf = build(&device, &[&cb]);
        assert_eq!(execbuf.batch_len(), 8008);
        assert_eq!(execbuf.objects().len(), 2);
    }

    #[test]
    fn surface_pool_center_moves() {
        let (device, _transport, _allocator) = test_device!(
            use_softpin: false,
            surface_state_pool_size: 4096,
        );
        let target = device.bo_table().allocate(&Default::default()).unwrap();
        let mut cb = small_primary(&device);

        let surface = device.alloc_surface_state(64, 64).unwrap();
        cb.write_surface_address(surface, 8, &Address::new(target.clone(), 0x40))
            .unwrap();
        cb.emit(&StoreDataImm {
            address: cb.surface_base_address(),
            data: 0,
        })
        .unwrap();
        cb.end().unwrap();

        // Growing the back of the pool moves the center.
        device.alloc_binding_table(32, 32).unwrap();
        let center = device.lock().surface_state_pool().center_bo_offset();
        assert_eq!(center, 4096);

        let execbuf = build(&device, &[&cb]);

        let pool_bo = device.lock().surface_state_pool().bo().resolve();
        let pool_index = pool_bo.exec_index(device.lock().exec_generation()).unwrap() as usize;
        assert_eq!(execbuf.relocations()[pool_index][0].offset, 4096 + 8);

        let bbo = cb.chain().current_bbo().lock();
        assert_eq!(bbo.relocs().entries()[0].delta, 4096);

        // Submitting again doesn't shift anything twice.
        drop(bbo);
        let execbuf = build(&device, &[&cb]);
        let pool_index = pool_bo.exec_index(device.lock().exec_generation()).unwrap() as usize;
        assert_eq!(execbuf.relocations()[pool_index][0].offset, 4096 + 8);
        assert_eq!(cb.chain().current_bbo().lock().relocs().entries()[0].delta, 4096);
    }

    #[test]
    fn secondary_batch_bos_are_included() {
        let (device, _transport, _allocator) = test_device!();
        let mut secondary = CommandBuffer::new(
            device.clone(),
            CommandBufferCreateInfo {
                level: CommandBufferLevel::Secondary,
                usage: CommandBufferUsage::MultipleSubmit,
                ..Default::default()
            },
        )
        .unwrap();
        secondary.emit_dwords(3000).unwrap();
        secondary.end().unwrap();

        let mut primary = small_primary(&device);
        primary.execute_commands([&secondary]).unwrap();
        primary.end().unwrap();

        let execbuf = build(&device, &[&primary]);
        let handles: Vec<_> = execbuf.objects().iter().map(|object| object.handle).collect();
        assert!(handles.contains(&secondary.first_bo().handle()));
    }
}
