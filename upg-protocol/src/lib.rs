// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire formats for the device-side firmware upgrade protocol.
//!
//! The host tool talks to the device over USB bulk endpoints or a UART
//! link. Whatever the transport, the unit of exchange is a command
//! packet (a 20-byte header plus payload) answered by a response packet
//! of the same shape. This crate defines the byte-exact codecs for
//! every structure that crosses the wire:
//!
//! - [`command`]: command/response headers ("UPGC"/"UPGR")
//! - [`usb`]: Command Block Wrapper / Command Status Wrapper framing
//! - [`frame`]: UART short/long frames with CRC16
//! - [`sparse`]: the sparse-image container (RAW/FILL/DONT_CARE/CRC32
//!   chunks)
//! - [`image`]: the 2048-byte firmware image header and the per-component
//!   metadata record
//!
//! All codecs are explicit about field offsets and endianness (always
//! little-endian); nothing here relies on struct layout matching the
//! wire. Everything is stateless, `no_std` and allocation-free.

#![no_std]

pub mod command;
pub mod frame;
pub mod image;
pub mod sparse;
pub mod usb;

pub use command::{Command, CommandHeader, HeaderError, ResponseHeader, Status};
pub use frame::{FrameError, FramePayload};
pub use image::{FirmwareImageHeader, FwcMeta};
pub use sparse::{ChunkHeader, ChunkType, SparseHeader};
pub use usb::{Cbw, Csw, CswStatus};

pub(crate) fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Length of a zero-terminated string field, capped at the field size.
pub(crate) fn strfield_len(field: &[u8]) -> usize {
    field.iter().position(|&b| b == 0).unwrap_or(field.len())
}
