// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Command batch recording, relocation and submission for GEM-style GPU kernels.
//!
//! # Brief summary
//!
//! - A [`Device`](crate::device::Device) owns the buffer objects (BOs), the batch BO pool, the
//!   surface state pool and the kernel transport.
//! - A [`CommandBuffer`](crate::command_buffer::CommandBuffer) records into a
//!   [`BatchChain`](crate::chain::BatchChain) of batch BOs. Addresses written into a batch are
//!   tracked in a [`RelocationList`](crate::reloc::RelocationList).
//! - Secondaries are merged into primaries by their [`ExecMode`](crate::chain::ExecMode).
//! - A [`Queue`](crate::queue::Queue) builds an [`ExecBuffer`](crate::execbuf::ExecBuffer)
//!   descriptor per submission and hands it to the kernel.
//!

pub use ash::vk::DeviceSize;
use std::{borrow::Cow, error::Error, fmt};

#[macro_use]
mod tests;
pub mod batch;
pub mod batch_bo;
pub mod chain;
pub mod command_buffer;
pub mod device;
pub mod execbuf;
pub mod instructions;
pub mod memory;
pub mod queue;
pub mod reloc;
pub mod state_pool;

/// Error returned when an allocation fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the graphical device",
            }
        )
    }
}

impl From<std::collections::TryReserveError> for OomError {
    #[inline]
    fn from(_: std::collections::TryReserveError) -> Self {
        OomError::OutOfHostMemory
    }
}

impl From<OomError> for ash::vk::Result {
    #[inline]
    fn from(err: OomError) -> Self {
        match err {
            OomError::OutOfHostMemory => ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            OomError::OutOfDeviceMemory => ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        }
    }
}

/// Error returned when a create info or a set of flags breaks a usage rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationError {
    /// The context in which the problem exists, usually the name of a field.
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,
}

impl ValidationError {
    /// Prepends `context` to the existing context, separated by a dot.
    pub fn add_context(mut self: Box<Self>, context: impl Into<Cow<'static, str>>) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }
}

impl Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)
        } else {
            write!(f, "{}: {}", self.context, self.problem)
        }
    }
}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> fmt::Display for Validated<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
