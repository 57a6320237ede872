// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

use crate::{
    execbuf::{ExecBuffer, RelocationMode},
    memory::{GemHandle, UNASSIGNED_OFFSET},
    queue::{ExecTransport, TransportError},
    reloc::{relocated_value, RelocationEntry},
    DeviceSize, OomError, ValidationError,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Creates a device backed by host memory and a [`MockTransport`].
///
/// Fields of `DeviceCreateInfo` can be overridden: `test_device!(use_softpin: false)`.
/// Returns the device, the transport and the allocator.
macro_rules! test_device {
    ($($field:ident: $value:expr),* $(,)?) => {{
        use ::std::sync::Arc;

        let _ = ::env_logger::builder().is_test(true).try_init();

        let transport = Arc::new($crate::tests::MockTransport::new());
        let allocator = Arc::new($crate::memory::HostBoAllocator::new());
        let device = $crate::device::Device::new(
            allocator.clone(),
            transport.clone(),
            $crate::device::DeviceCreateInfo {
                $($field: $value,)*
                ..Default::default()
            },
        )
        .unwrap();

        (device, transport, allocator)
    }};
}

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg));
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg));
                } else {
                    panic!("Couldn't decipher the panic message of the test")
                }
            }
        }
    }};

    ($code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(_) => {}
        }
    }};
}

const MOCK_HEAP_BASE: DeviceSize = 1 << 32;

/// What a [`MockTransport`] was handed.
#[derive(Clone, Debug)]
pub(crate) struct Submission {
    pub handles: Vec<GemHandle>,
    pub flags: u64,
    pub relocation_mode: RelocationMode,
    pub batch_len: u32,
    pub software_relocations: usize,
    pub relocations: Vec<Vec<RelocationEntry>>,
}

/// A transport that behaves like the kernel without running anything.
///
/// Unpinned BOs are placed the first time they are seen, and only move when told to with
/// [`move_bo`](Self::move_bo). BOs that already have an address keep it. Relocations are patched when asked for, or when the
/// presumed address of an object was wrong.
pub(crate) struct MockTransport {
    submissions: Mutex<Vec<Submission>>,
    placements: Mutex<HashMap<GemHandle, DeviceSize>>,
    next_address: AtomicU64,
    fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            submissions: Mutex::new(Vec::new()),
            placements: Mutex::new(HashMap::default()),
            next_address: AtomicU64::new(MOCK_HEAP_BASE),
            fail: AtomicBool::new(false),
        }
    }

    /// Places `handle` at `offset` from now on, as if the kernel moved it.
    pub fn move_bo(&self, handle: GemHandle, offset: DeviceSize) {
        self.placements.lock().insert(handle, offset);
    }

    /// Makes every following call fail with `EIO`.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }
}

impl ExecTransport for MockTransport {
    fn execbuffer(&self, execbuf: &mut ExecBuffer) -> Result<(), TransportError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(TransportError { errno: 5 });
        }

        let mut placements = self.placements.lock();
        let mut moved = false;

        for index in 0..execbuf.objects().len() {
            let bo = execbuf.bos()[index].clone();

            if bo.is_pinned() {
                continue;
            }

            let presumed = execbuf.objects()[index].offset;
            let offset = *placements.entry(bo.handle()).or_insert_with(|| {
                if presumed != UNASSIGNED_OFFSET {
                    presumed
                } else {
                    let size = bo.size().next_multiple_of(4096);
                    self.next_address.fetch_add(size, Ordering::Relaxed)
                }
            });

            moved |= offset != presumed;
            execbuf.objects_mut()[index].offset = offset;
        }

        if execbuf.relocation_mode() == RelocationMode::KernelPatch || moved {
            for (index, relocs) in execbuf.relocations().iter().enumerate() {
                for entry in relocs {
                    let target_offset = execbuf.objects()[entry.target_handle as usize].offset;

                    if entry.presumed_offset != target_offset {
                        let value = relocated_value(target_offset, entry.delta);
                        unsafe { execbuf.bos()[index].write_u64(entry.offset, value) };
                    }
                }
            }
        }

        self.submissions.lock().push(Submission {
            handles: execbuf.objects().iter().map(|object| object.handle).collect(),
            flags: execbuf.flags(),
            relocation_mode: execbuf.relocation_mode(),
            batch_len: execbuf.batch_len(),
            software_relocations: execbuf.software_relocations(),
            relocations: execbuf.relocations().to_vec(),
        });

        Ok(())
    }
}

#[test]
fn validation_error_context() {
    let err = Box::new(ValidationError {
        context: "initial_size".into(),
        problem: "is not a power of two".into(),
    })
    .add_context("create_info");
    assert_eq!(err.context, "create_info.initial_size");
    assert_eq!(
        err.to_string(),
        "create_info.initial_size: is not a power of two",
    );
}

#[test]
fn oom_to_vk_result() {
    assert_eq!(
        ash::vk::Result::from(OomError::OutOfDeviceMemory),
        ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
    );
}
