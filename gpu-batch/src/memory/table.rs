// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{BoAllocator, BoCreateInfo, BufferObject, GemHandle};
use crate::OomError;
use foldhash::HashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Every BO a device allocated, keyed by GEM handle.
///
/// The table stores weak references. If the weak reference cannot be upgraded, the BO was freed
/// and the handle acts as if it was never allocated. Relocation lists record dependencies by
/// handle, and this is how they are turned back into BOs when a submission is built.
pub struct BoTable {
    allocator: Arc<dyn BoAllocator>,
    pin_all: bool,
    inner: RwLock<HashMap<GemHandle, Weak<BufferObject>>>,
}

impl BoTable {
    /// Creates an empty table. With `pin_all`, every BO is allocated pinned, whatever its
    /// create info asks for.
    pub fn new(allocator: Arc<dyn BoAllocator>, pin_all: bool) -> Self {
        BoTable {
            allocator,
            pin_all,
            inner: RwLock::new(HashMap::default()),
        }
    }

    /// Allocates a new BO and registers its handle.
    pub fn allocate(&self, create_info: &BoCreateInfo) -> Result<Arc<BufferObject>, OomError> {
        let bo = if self.pin_all && !create_info.flags.pinned {
            let mut create_info = create_info.clone();
            create_info.flags.pinned = true;

            self.allocator.allocate(&create_info)?
        } else {
            self.allocator.allocate(create_info)?
        };
        let bo = Arc::new(bo);

        let mut inner = self.inner.write();

        // Kernels reuse handles, so stale entries are dropped as they are found.
        inner.retain(|_, weak| weak.strong_count() != 0);
        inner.insert(bo.handle(), Arc::downgrade(&bo));
        drop(inner);

        Ok(bo)
    }

    /// Returns the BO with the given handle, if it's still alive.
    pub fn get(&self, handle: GemHandle) -> Option<Arc<BufferObject>> {
        self.inner.read().get(&handle).and_then(Weak::upgrade)
    }

    /// Returns the number of live BOs.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|weak| weak.strong_count() != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBoAllocator;

    #[test]
    fn lookup_by_handle() {
        let table = BoTable::new(Arc::new(HostBoAllocator::new()), false);

        let a = table.allocate(&BoCreateInfo::default()).unwrap();
        let b = table.allocate(&BoCreateInfo::default()).unwrap();

        assert!(Arc::ptr_eq(&table.get(a.handle()).unwrap(), &a));
        assert!(Arc::ptr_eq(&table.get(b.handle()).unwrap(), &b));
        assert_eq!(table.len(), 2);

        let handle = a.handle();
        drop(a);
        assert!(table.get(handle).is_none());
        assert_eq!(table.len(), 1);
        assert!(!b.is_pinned());
    }

    #[test]
    fn pin_all_overrides_flags() {
        let table = BoTable::new(Arc::new(HostBoAllocator::new()), true);

        let bo = table.allocate(&BoCreateInfo::default()).unwrap();
        assert!(bo.is_pinned());
        assert!(bo.has_offset());
    }
}
