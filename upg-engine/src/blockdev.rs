// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Storage collaborator trait.
//!
//! The engine never talks to eMMC/NAND/NOR drivers directly; it issues
//! block-granular reads, writes and erases through [`BlockDevice`] and
//! resolves burn targets through the partition lookup. Addresses are
//! absolute device block offsets.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError {
    /// Driver-level read/write/erase failure.
    Io,
    /// Access past the end of the device.
    OutOfRange,
}

/// One named partition, in device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    pub start_blk: u32,
    pub blk_cnt: u32,
}

pub trait BlockDevice {
    /// Block size in bytes. Must be a multiple of 4.
    fn block_size(&self) -> usize;

    /// Erase granularity in blocks. Erased blocks read back as zero.
    fn erase_group(&self) -> u32 {
        1024
    }

    fn partition(&self, name: &str) -> Option<Partition>;

    /// `buf.len()` must be a multiple of the block size.
    fn read(&mut self, blk: u32, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// `data.len()` must be a multiple of the block size.
    fn write(&mut self, blk: u32, data: &[u8]) -> Result<(), DeviceError>;

    fn erase(&mut self, blk: u32, blocks: u32) -> Result<(), DeviceError>;
}
