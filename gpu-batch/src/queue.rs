// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Submission of command buffers to the kernel.

use crate::{
    command_buffer::{CommandBuffer, CommandBufferLevel, CommandBufferState},
    device::Device,
    execbuf::{build_exec_buffer, ExecBuffer},
    OomError,
};
use log::trace;
use smallvec::SmallVec;
use std::{error::Error, fmt, sync::Arc};

/// The kernel's execbuffer entry point.
pub trait ExecTransport: Send + Sync {
    /// Submits `execbuf` for execution.
    ///
    /// On success, the offset of every object of `execbuf` holds the GPU address the BO was
    /// executed at.
    fn execbuffer(&self, execbuf: &mut ExecBuffer) -> Result<(), TransportError>;
}

/// Error returned by an [`ExecTransport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportError {
    /// The errno the kernel returned.
    pub errno: i32,
}

impl Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the execbuffer call failed with errno {}", self.errno)
    }
}

/// Error that can happen when submitting command buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// Building a submission ran out of memory. That submission and the ones after it were not
    /// handed to the kernel.
    OomError(OomError),

    /// The device was lost, either by this submission or by an earlier one.
    DeviceLost,

    /// A command buffer is not an executable primary command buffer.
    NotExecutable,

    /// A command buffer failed to record.
    RecordingFailed(OomError),
}

impl Error for SubmitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::OomError(err) | Self::RecordingFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OomError(_) => write!(f, "not enough memory available"),
            Self::DeviceLost => write!(f, "the device was lost"),
            Self::NotExecutable => write!(
                f,
                "a command buffer is not a primary command buffer in the executable state",
            ),
            Self::RecordingFailed(_) => write!(f, "a command buffer failed to record"),
        }
    }
}

impl From<OomError> for SubmitError {
    #[inline]
    fn from(err: OomError) -> Self {
        Self::OomError(err)
    }
}

impl From<SubmitError> for ash::vk::Result {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::OomError(err) | SubmitError::RecordingFailed(err) => err.into(),
            SubmitError::DeviceLost => ash::vk::Result::ERROR_DEVICE_LOST,
            SubmitError::NotExecutable => ash::vk::Result::ERROR_VALIDATION_FAILED_EXT,
        }
    }
}

/// Submits command buffers of one device.
#[derive(Debug)]
pub struct Queue {
    device: Arc<Device>,
}

impl Queue {
    #[inline]
    pub fn new(device: Arc<Device>) -> Self {
        Queue { device }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Submits `command_buffers` for execution, in order.
    ///
    /// When every command buffer can be chained, they are submitted as one batch. Otherwise
    /// every command buffer gets its own submission, built only after the addresses the kernel
    /// picked for the previous one were written back.
    ///
    /// A kernel failure marks the device as lost, and every later submission fails.
    pub fn submit(&self, command_buffers: &[&CommandBuffer]) -> Result<(), SubmitError> {
        if self.device.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        for command_buffer in command_buffers {
            assert!(
                Arc::ptr_eq(command_buffer.device(), &self.device),
                "the command buffer and the queue do not belong to the same device",
            );

            if command_buffer.level() != CommandBufferLevel::Primary {
                return Err(SubmitError::NotExecutable);
            }

            match command_buffer.state() {
                CommandBufferState::Executable => {}
                CommandBufferState::Recording => return Err(SubmitError::NotExecutable),
                CommandBufferState::Invalid => {
                    let err = command_buffer
                        .status()
                        .err()
                        .unwrap_or(OomError::OutOfHostMemory);

                    return Err(SubmitError::RecordingFailed(err));
                }
            }
        }

        if command_buffers.is_empty() {
            return Ok(());
        }

        let mut state = self.device.lock();

        let groups: SmallVec<[&[&CommandBuffer]; 4]> = if command_buffers
            .iter()
            .all(|command_buffer| command_buffer.is_chainable())
        {
            SmallVec::from_elem(command_buffers, 1)
        } else {
            command_buffers.chunks(1).collect()
        };

        for group in groups {
            let mut execbuf = build_exec_buffer(&self.device, &mut state, group)?;

            trace!(
                "submitting {} objects, relocation mode {:?}",
                execbuf.objects().len(),
                execbuf.relocation_mode(),
            );

            if let Err(err) = self.device.transport().execbuffer(&mut execbuf) {
                self.device.mark_lost(format_args!("{}", err));

                return Err(SubmitError::DeviceLost);
            }

            execbuf.write_back_offsets();
        }

        Ok(())
    }
}
