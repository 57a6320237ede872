// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Relocation lists.
//!
//! A relocation records that a 64-bit GPU address of some target BO was written at an offset of
//! a source BO. When the target moves, the value must be rewritten, either on the host before
//! submission or by the kernel.
//!
//! Pinned targets never move, so for them the list only remembers that the target must be
//! resident, in a bitset indexed by GEM handle.

use crate::{
    memory::{canonical_address, BufferObject, GemHandle},
    DeviceSize, OomError,
};
use bytemuck::{Pod, Zeroable};
use log::trace;
use std::{mem, sync::Arc};

/// [`RelocationEntry::target_handle`] before the submission index of the target is known.
pub const INVALID_TARGET: u32 = u32::MAX;

/// [`RelocationEntry::presumed_offset`] that forces the kernel to patch the relocation.
pub const UNKNOWN_PRESUMED_OFFSET: u64 = u64::MAX;

const INITIAL_CAPACITY: usize = 16;

/// One relocation, laid out the way the kernel reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RelocationEntry {
    /// Index of the target in the submission's object list, once known.
    pub target_handle: u32,

    /// Added to the target's address. Interpreted as signed.
    pub delta: u32,

    /// Byte offset of the 64-bit address field within the source BO.
    pub offset: u64,

    /// The target address the written value was computed from.
    pub presumed_offset: u64,

    pub read_domains: u32,
    pub write_domain: u32,
}

/// Returns the value a relocation against a target at `target_offset` must write.
#[inline]
pub fn relocated_value(target_offset: DeviceSize, delta: u32) -> u64 {
    canonical_address(target_offset.wrapping_add(delta as i32 as u64))
}

/// A growable set of relocations plus a set of dependency BOs.
#[derive(Debug, Default)]
pub struct RelocationList {
    relocs: Vec<RelocationEntry>,
    // Kept unresolved so that wrappers pick up their current backing BO at submission.
    targets: Vec<Arc<BufferObject>>,
    deps: Vec<u32>,
}

impl RelocationList {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a list with the same relocations and dependencies.
    pub fn try_clone(&self) -> Result<Self, OomError> {
        let mut relocs = Vec::new();
        relocs.try_reserve_exact(self.relocs.len())?;
        relocs.extend_from_slice(&self.relocs);

        let mut targets = Vec::new();
        targets.try_reserve_exact(self.targets.len())?;
        targets.extend_from_slice(&self.targets);

        let mut deps = Vec::new();
        deps.try_reserve_exact(self.deps.len())?;
        deps.extend_from_slice(&self.deps);

        Ok(RelocationList {
            relocs,
            targets,
            deps,
        })
    }

    /// Returns the number of relocations. Dependencies are not counted.
    #[inline]
    pub fn len(&self) -> usize {
        self.relocs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.relocs.is_empty() && self.deps.iter().all(|&word| word == 0)
    }

    #[inline]
    pub fn entries(&self) -> &[RelocationEntry] {
        &self.relocs
    }

    /// Returns the target of each relocation, in the same order as [`entries`](Self::entries).
    #[inline]
    pub fn targets(&self) -> &[Arc<BufferObject>] {
        &self.targets
    }

    /// Replaces the target of the relocation at `index`.
    pub(crate) fn retarget(&mut self, index: usize, target: Arc<BufferObject>, delta: u32) {
        self.targets[index] = target;
        self.relocs[index].delta = delta;
        self.relocs[index].presumed_offset = UNKNOWN_PRESUMED_OFFSET;
    }

    /// Points every relocation at the submission index its target got in `generation`.
    pub(crate) fn set_target_indices(&mut self, generation: u32) {
        for (entry, target) in self.relocs.iter_mut().zip(&self.targets) {
            let Some(index) = target.resolve().exec_index(generation) else {
                panic!("relocation target is not part of the submission");
            };

            entry.target_handle = index;
        }
    }

    /// Makes the kernel patch every relocation of the list.
    pub(crate) fn invalidate_presumed_offsets(&mut self) {
        for entry in &mut self.relocs {
            entry.presumed_offset = UNKNOWN_PRESUMED_OFFSET;
        }
    }

    /// Returns whether `handle` is in the dependency set.
    #[inline]
    pub fn has_dependency(&self, handle: GemHandle) -> bool {
        let word = (handle / 32) as usize;

        self.deps
            .get(word)
            .is_some_and(|&bits| bits & (1 << (handle % 32)) != 0)
    }

    /// Returns the GEM handles in the dependency set, in increasing order.
    pub fn dependencies(&self) -> impl Iterator<Item = GemHandle> + '_ {
        self.deps.iter().enumerate().flat_map(|(word, &bits)| {
            (0..32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| word as u32 * 32 + bit)
        })
    }

    fn grow(&mut self, additional: usize) -> Result<(), OomError> {
        let needed = self.relocs.len() + additional;

        if needed > self.relocs.capacity() {
            let mut new_capacity = self.relocs.capacity().max(INITIAL_CAPACITY);
            while new_capacity < needed {
                new_capacity *= 2;
            }

            self.relocs
                .try_reserve_exact(new_capacity - self.relocs.len())?;
        }

        if needed > self.targets.capacity() {
            self.targets
                .try_reserve_exact(self.relocs.capacity() - self.targets.len())?;
        }

        Ok(())
    }

    fn grow_deps(&mut self, min_words: usize) -> Result<(), OomError> {
        if self.deps.len() >= min_words {
            return Ok(());
        }

        let mut new_len = self.deps.len().max(1);
        while new_len < min_words {
            new_len *= 2;
        }

        self.deps.try_reserve_exact(new_len - self.deps.len())?;
        self.deps.resize(new_len, 0);

        Ok(())
    }

    /// Records that `bo` must be resident whenever the source is executed.
    pub fn add_bo(&mut self, bo: &Arc<BufferObject>) -> Result<(), OomError> {
        let handle = bo.resolve().handle();
        let word = (handle / 32) as usize;

        self.grow_deps(word + 1)?;
        self.deps[word] |= 1 << (handle % 32);

        Ok(())
    }

    /// Records that the address of `target` plus `delta` is written at `offset`, and returns the
    /// value to write there.
    ///
    /// Pinned targets only become dependencies.
    pub fn add(
        &mut self,
        offset: DeviceSize,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<u64, OomError> {
        let resolved = target.resolve();

        if resolved.is_pinned() {
            self.add_bo(target)?;

            return Ok(relocated_value(resolved.offset(), delta));
        }

        self.grow(1)?;

        let target_offset = resolved.offset();
        self.relocs.push(RelocationEntry {
            target_handle: INVALID_TARGET,
            delta,
            offset,
            presumed_offset: target_offset,
            read_domains: 0,
            write_domain: 0,
        });
        self.targets.push(target.clone());

        Ok(relocated_value(target_offset, delta))
    }

    /// Removes every relocation and dependency, keeping the allocations.
    pub fn clear(&mut self) {
        self.relocs.clear();
        self.targets.clear();
        self.deps.fill(0);
    }

    /// Appends the contents of `other`, shifting its relocation offsets by `offset`.
    ///
    /// On allocation failure the list may hold some of `other`'s dependencies but none of its
    /// relocations.
    pub fn append(&mut self, other: &RelocationList, offset: DeviceSize) -> Result<(), OomError> {
        self.grow(other.relocs.len())?;

        self.grow_deps(other.deps.len())?;
        for (dst, &src) in self.deps.iter_mut().zip(&other.deps) {
            *dst |= src;
        }

        self.relocs.extend(other.relocs.iter().map(|entry| RelocationEntry {
            offset: entry.offset + offset,
            ..*entry
        }));
        self.targets.extend_from_slice(&other.targets);

        Ok(())
    }

    /// Adds `delta` to the offset of every relocation.
    pub(crate) fn shift_offsets(&mut self, delta: DeviceSize) {
        for entry in &mut self.relocs {
            entry.offset += delta;
        }
    }

    /// Adds `delta` to the delta of every relocation against `target`, and rewrites their values
    /// into the mapping of `bo` from the presumed offsets.
    ///
    /// # Safety
    ///
    /// - Same as [`apply`](Self::apply).
    pub(crate) unsafe fn shift_deltas(
        &mut self,
        target: &Arc<BufferObject>,
        delta: u32,
        bo: &BufferObject,
    ) {
        for (entry, _) in self
            .relocs
            .iter_mut()
            .zip(&self.targets)
            .filter(|(_, other)| Arc::ptr_eq(other, target))
        {
            // Negative deltas wrap around to the right value.
            entry.delta = entry.delta.wrapping_add(delta);
            unsafe {
                bo.write_u64(
                    entry.offset,
                    relocated_value(entry.presumed_offset, entry.delta),
                )
            };
        }
    }

    /// Rewrites the address of every relocation whose target moved since it was written, into
    /// the mapping of `bo`. With `always`, every relocation is rewritten.
    ///
    /// Returns how many values were written.
    ///
    /// # Safety
    ///
    /// - Every relocation offset of the list must be a location of `bo` that nothing else is
    ///   accessing, on the host or the GPU.
    pub(crate) unsafe fn apply(&mut self, bo: &BufferObject, always: bool) -> usize {
        let mut written = 0;

        for (entry, target) in self.relocs.iter_mut().zip(&self.targets) {
            let target_offset = target.resolve().offset();

            if !always && entry.presumed_offset == target_offset {
                continue;
            }

            let value = relocated_value(target_offset, entry.delta);
            unsafe { bo.write_u64(entry.offset, value) };
            entry.presumed_offset = target_offset;
            written += 1;
        }

        trace!(
            "applied {} of {} relocations in BO {}",
            written,
            self.relocs.len(),
            bo.handle(),
        );

        written
    }

    /// Moves the contents out, leaving an empty list that keeps no allocation.
    pub(crate) fn take(&mut self) -> Self {
        mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BoCreateInfo, BoFlags, BoTable, HostBoAllocator};

    fn bos() -> (BoTable, Arc<BufferObject>, Arc<BufferObject>) {
        let table = BoTable::new(Arc::new(HostBoAllocator::new()), false);
        let unpinned = table.allocate(&BoCreateInfo::default()).unwrap();
        let pinned = table
            .allocate(&BoCreateInfo {
                flags: BoFlags {
                    pinned: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        (table, unpinned, pinned)
    }

    #[test]
    fn pinned_targets_become_dependencies() {
        let (_table, _unpinned, pinned) = bos();
        let mut list = RelocationList::new();

        let value = list.add(64, &pinned, 16).unwrap();
        assert_eq!(value, pinned.offset() + 16);
        assert_eq!(list.len(), 0);
        assert!(list.has_dependency(pinned.handle()));
        assert_eq!(list.dependencies().collect::<Vec<_>>(), [pinned.handle()]);
    }

    #[test]
    fn unpinned_targets_are_recorded() {
        let (_table, unpinned, _pinned) = bos();
        let mut list = RelocationList::new();

        unpinned.set_offset(0x10_0000);
        let value = list.add(8, &unpinned, 4).unwrap();
        assert_eq!(value, 0x10_0004);

        let entry = list.entries()[0];
        assert_eq!(entry.offset, 8);
        assert_eq!(entry.delta, 4);
        assert_eq!(entry.presumed_offset, 0x10_0000);
        assert_eq!(entry.target_handle, INVALID_TARGET);
        assert!(Arc::ptr_eq(&list.targets()[0], &unpinned));
    }

    #[test]
    fn negative_delta() {
        assert_eq!(relocated_value(0x2000, -16i32 as u32), 0x1ff0);
    }

    #[test]
    fn append_shifts_offsets() {
        let (table, unpinned, pinned) = bos();
        let other_pinned = table
            .allocate(&BoCreateInfo {
                flags: BoFlags {
                    pinned: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let mut a = RelocationList::new();
        a.add(0, &unpinned, 0).unwrap();
        a.add_bo(&pinned).unwrap();

        let mut b = RelocationList::new();
        b.add(16, &unpinned, 8).unwrap();
        b.add_bo(&other_pinned).unwrap();

        a.append(&b, 1000).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.entries()[1].offset, 1016);
        assert_eq!(a.entries()[1].delta, 8);
        assert!(a.has_dependency(pinned.handle()));
        assert!(a.has_dependency(other_pinned.handle()));
    }

    #[test]
    fn clear_and_clone() {
        let (_table, unpinned, pinned) = bos();
        let mut list = RelocationList::new();
        list.add(0, &unpinned, 0).unwrap();
        list.add_bo(&pinned).unwrap();

        let copy = list.try_clone().unwrap();
        list.clear();
        assert!(list.is_empty());
        assert_eq!(copy.len(), 1);
        assert!(copy.has_dependency(pinned.handle()));
    }

    #[test]
    fn apply_stale_only() {
        let (table, target, _pinned) = bos();
        let source = table.allocate(&BoCreateInfo::default()).unwrap();
        let other = table.allocate(&BoCreateInfo::default()).unwrap();

        target.set_offset(0x1000);
        other.set_offset(0x8000);

        let mut list = RelocationList::new();
        let value = list.add(0, &target, 0).unwrap();
        unsafe { source.write_u64(0, value) };
        let value = list.add(8, &other, 0x10).unwrap();
        unsafe { source.write_u64(8, value) };

        target.set_offset(0x3000);

        let written = unsafe { list.apply(&source, false) };
        assert_eq!(written, 1);
        assert_eq!(unsafe { source.read_u64(0) }, 0x3000);
        assert_eq!(unsafe { source.read_u64(8) }, 0x8010);
        assert_eq!(list.entries()[0].presumed_offset, 0x3000);

        let written = unsafe { list.apply(&source, true) };
        assert_eq!(written, 2);
    }

    #[test]
    fn shift_deltas_of_one_target() {
        let (table, target, _pinned) = bos();
        let source = table.allocate(&BoCreateInfo::default()).unwrap();
        let other = table.allocate(&BoCreateInfo::default()).unwrap();
        target.set_offset(0x1_0000);
        other.set_offset(0x8000);

        let mut list = RelocationList::new();
        list.add(0, &target, -64i32 as u32).unwrap();
        list.add(8, &other, 0).unwrap();

        unsafe { list.shift_deltas(&target, 4096, &source) };
        assert_eq!(list.entries()[0].delta, 4096 - 64);
        assert_eq!(list.entries()[1].delta, 0);
        assert_eq!(unsafe { source.read_u64(0) }, 0x1_0000 + 4096 - 64);
    }

    #[test]
    fn target_indices() {
        let (_table, target, _pinned) = bos();
        let mut list = RelocationList::new();
        list.add(0, &target, 0).unwrap();

        target.set_exec_index(7, 3);
        list.set_target_indices(7);
        assert_eq!(list.entries()[0].target_handle, 3);

        list.invalidate_presumed_offsets();
        assert_eq!(list.entries()[0].presumed_offset, UNKNOWN_PRESUMED_OFFSET);

        assert_should_panic!("not part of the submission", {
            list.set_target_indices(8);
        });
    }
}
