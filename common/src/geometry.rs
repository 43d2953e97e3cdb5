// Copyright 2026 Oxide Computer Company
use serde::{Deserialize, Serialize};

use super::*;

/*
 * Block sizes are powers of two.  Anything smaller than a sector is not
 * something a device will address, anything larger than 64 KiB makes the
 * generated content the bottleneck.
 */
pub const MIN_SHIFT: u32 = 9;
pub const MAX_SHIFT: u32 = 16;

pub const MIN_BLOCK_SIZE: u64 = 1 << MIN_SHIFT;
pub const MAX_BLOCK_SIZE: u64 = 1 << MAX_SHIFT;

pub fn validate_block_size(block_size: u64) -> Result<(), VerifyError> {
    if !block_size.is_power_of_two() {
        verify_bail!(
            InvalidConfig,
            "block size must be a power of two, not {}",
            block_size
        );
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        verify_bail!(
            InvalidConfig,
            "block size must be between {} and {} bytes, not {}",
            MIN_BLOCK_SIZE,
            MAX_BLOCK_SIZE,
            block_size
        );
    }
    Ok(())
}

/// The addressable shape of the device under test.
///
/// Bytes past the last whole block are never touched.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceGeometry {
    dev_size: u64,
    block_size: u64,
    n_blocks: u64,
}

impl DeviceGeometry {
    pub fn new(
        dev_size: u64,
        block_size: u64,
    ) -> Result<DeviceGeometry, VerifyError> {
        validate_block_size(block_size)?;
        let n_blocks = dev_size / block_size;
        if n_blocks == 0 {
            verify_bail!(
                SetupError,
                "device of {} bytes holds no {} byte block",
                dev_size,
                block_size
            );
        }
        Ok(DeviceGeometry {
            dev_size,
            block_size,
            n_blocks,
        })
    }

    pub fn dev_size(&self) -> u64 {
        self.dev_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    /// Bytes at the end of the device that do not fill a block.
    pub fn remainder(&self) -> u64 {
        self.dev_size % self.block_size
    }

    pub fn byte_offset(&self, block: u64) -> u64 {
        block * self.block_size
    }

    /// Round a byte offset down to the start of its block, returning the
    /// block index.
    pub fn block_of(&self, byte_offset: u64) -> u64 {
        (byte_offset & !(self.block_size - 1)) / self.block_size
    }

    pub fn range_bytes(&self, range: &BlockRange) -> (u64, usize) {
        (
            self.byte_offset(range.start()),
            (range.len() * self.block_size) as usize,
        )
    }
}
