// Copyright (c) 2024 The gpu-batch developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The MI instructions the batch machinery emits on its own.
//!
//! Everything else is emitted by users through [`Instruction`] implementations of their own, or
//! as raw dwords.

use crate::{batch::Packer, memory::Address};

/// An instruction that can be packed into a batch.
pub trait Instruction {
    /// The length of the packed instruction, in dwords.
    const LENGTH: usize;

    /// Packs the instruction into `dw`, which is `LENGTH` dwords long. Address fields go through
    /// `packer` so that they get relocated.
    fn pack(&self, packer: &mut Packer<'_>, dw: &mut [u32]);
}

const fn mi_header(opcode: u32, length: usize) -> u32 {
    // Command type 0 (MI) in bits 31:29. The length field excludes the first two dwords.
    (opcode << 23) | (length as u32).saturating_sub(2)
}

const MI_NOOP_OPCODE: u32 = 0x00;
const MI_BATCH_BUFFER_END_OPCODE: u32 = 0x0a;
const MI_STORE_DATA_IMM_OPCODE: u32 = 0x20;
const MI_BATCH_BUFFER_START_OPCODE: u32 = 0x31;

const BATCH_BUFFER_START_SECOND_LEVEL: u32 = 1 << 22;
const BATCH_BUFFER_START_PPGTT: u32 = 1 << 8;
const STORE_DATA_IMM_STORE_QWORD: u32 = 1 << 21;

const ADDRESS_MASK_48: u64 = ((1 << 48) - 1) & !0b11;

pub const MI_NOOP: u32 = mi_header(MI_NOOP_OPCODE, 0);
pub const MI_BATCH_BUFFER_END: u32 = mi_header(MI_BATCH_BUFFER_END_OPCODE, 0);

/// The size of [`Jump`] in bytes. Every batch keeps this much room at its end so that it can
/// always be chained to another one.
pub const JUMP_SIZE: u32 = (Jump::LENGTH * 4) as u32;

/// Byte offset of the address field within [`Jump`] and [`BatchBufferStart`].
pub const JUMP_ADDRESS_OFFSET: u32 = 4;

/// Byte offset of the data field within [`StoreDataImm`].
pub const STORE_DATA_IMM_DATA_OFFSET: u32 = 12;

/// Returns whether `dw` is the header of an `MI_BATCH_BUFFER_START`.
#[inline]
pub fn is_batch_buffer_start(dw: u32) -> bool {
    dw >> 29 == 0 && (dw >> 23) & 0x3f == MI_BATCH_BUFFER_START_OPCODE
}

/// `MI_NOOP`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Noop;

impl Instruction for Noop {
    const LENGTH: usize = 1;

    fn pack(&self, _packer: &mut Packer<'_>, dw: &mut [u32]) {
        dw[0] = MI_NOOP;
    }
}

/// `MI_BATCH_BUFFER_END`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchBufferEnd;

impl Instruction for BatchBufferEnd {
    const LENGTH: usize = 1;

    fn pack(&self, _packer: &mut Packer<'_>, dw: &mut [u32]) {
        dw[0] = MI_BATCH_BUFFER_END;
    }
}

/// `MI_BATCH_BUFFER_START`: continues execution at `address`.
#[derive(Clone, Debug, Default)]
pub struct BatchBufferStart {
    pub address: Address,

    /// Whether execution returns to the caller at the next `MI_BATCH_BUFFER_END`.
    pub second_level: bool,
}

impl Instruction for BatchBufferStart {
    const LENGTH: usize = 3;

    fn pack(&self, packer: &mut Packer<'_>, dw: &mut [u32]) {
        dw[0] = mi_header(MI_BATCH_BUFFER_START_OPCODE, Self::LENGTH) | BATCH_BUFFER_START_PPGTT;
        if self.second_level {
            dw[0] |= BATCH_BUFFER_START_SECOND_LEVEL;
        }

        let address = packer.address(1, &self.address) & ADDRESS_MASK_48;
        dw[1] = address as u32;
        dw[2] = (address >> 32) as u32;
    }
}

/// A first-level `MI_BATCH_BUFFER_START` padded with an `MI_NOOP` to 16 bytes.
///
/// This is how one batch BO is chained to the next, and how a primary calls a secondary.
#[derive(Clone, Debug, Default)]
pub struct Jump(pub Address);

impl Instruction for Jump {
    const LENGTH: usize = BatchBufferStart::LENGTH + 1;

    fn pack(&self, packer: &mut Packer<'_>, dw: &mut [u32]) {
        BatchBufferStart {
            address: self.0.clone(),
            second_level: false,
        }
        .pack(packer, &mut dw[..BatchBufferStart::LENGTH]);
        dw[BatchBufferStart::LENGTH] = MI_NOOP;
    }
}

/// `MI_STORE_DATA_IMM` with a 64-bit payload.
#[derive(Clone, Debug, Default)]
pub struct StoreDataImm {
    pub address: Address,
    pub data: u64,
}

impl Instruction for StoreDataImm {
    const LENGTH: usize = 5;

    fn pack(&self, packer: &mut Packer<'_>, dw: &mut [u32]) {
        dw[0] = mi_header(MI_STORE_DATA_IMM_OPCODE, Self::LENGTH) | STORE_DATA_IMM_STORE_QWORD;

        let address = packer.address(1, &self.address) & ADDRESS_MASK_48;
        dw[1] = address as u32;
        dw[2] = (address >> 32) as u32;
        dw[3] = self.data as u32;
        dw[4] = (self.data >> 32) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers() {
        assert_eq!(MI_NOOP, 0);
        assert_eq!(MI_BATCH_BUFFER_END, 0x0500_0000);
        assert_eq!(JUMP_SIZE, 16);

        let bbs = mi_header(MI_BATCH_BUFFER_START_OPCODE, BatchBufferStart::LENGTH)
            | BATCH_BUFFER_START_PPGTT;
        assert_eq!(bbs, 0x1880_0101);
        assert!(is_batch_buffer_start(bbs));
        assert!(!is_batch_buffer_start(MI_BATCH_BUFFER_END));
        assert!(!is_batch_buffer_start(MI_NOOP));
    }
}
