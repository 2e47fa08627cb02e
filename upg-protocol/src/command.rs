// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command and response headers.
//!
//! Every exchange starts with a 20-byte command header sent by the host
//! and ends with a 20-byte response header sent by the device. The
//! response always echoes the request's command code so the host can
//! pair them up on a stream transport.
//!
//! Layout (all little-endian):
//!
//! ```text
//! [0..4)   magic       "UPGC" (command) / "UPGR" (response)
//! [4]      protocol    1
//! [5]      version     1
//! [6]      command     command code (echoed in the response)
//! [7]      reserved    0 (command) / status (response)
//! [8..12)  data_length payload bytes following the header
//! [12..16) reserved    0
//! [16..20) checksum    byte-wise sum of bytes [0..16)
//! ```

use crate::{put_u32, u32_at};

/// Magic of a host-to-device command header, "UPGC" on the wire.
pub const COMMAND_MAGIC: u32 = u32::from_le_bytes(*b"UPGC");

/// Magic of a device-to-host response header, "UPGR" on the wire.
pub const RESPONSE_MAGIC: u32 = u32::from_le_bytes(*b"UPGR");

/// Protocol identifier carried in byte 4.
pub const PROTOCOL: u8 = 1;

/// Protocol version carried in byte 5.
pub const VERSION: u8 = 1;

/// Size of both header kinds on the wire.
pub const HEADER_SIZE: usize = 20;

/// Command codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// Select the upgrade mode for this session.
    SetUpgCfg = 0x01,
    /// Report the currently selected upgrade mode.
    GetUpgCfg = 0x02,
    /// Select the destination firmware component (partition + metadata).
    SetFwcMeta = 0x03,
    /// Stream firmware component data to the active writer.
    SendFwcData = 0x04,
    /// Report the running CRC over the component written so far.
    GetFwcCrc = 0x05,
    /// Report the final outcome of the component burn.
    GetFwcBurnResult = 0x06,
    /// Close the upgrade session.
    SetUpgEnd = 0x07,
}

impl Command {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::SetUpgCfg,
            0x02 => Self::GetUpgCfg,
            0x03 => Self::SetFwcMeta,
            0x04 => Self::SendFwcData,
            0x05 => Self::GetFwcCrc,
            0x06 => Self::GetFwcBurnResult,
            0x07 => Self::SetUpgEnd,
            _ => return None,
        })
    }
}

/// Response status byte. Zero is success; everything else names the
/// failure so the host can decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Generic device-side failure (storage write/erase error).
    Failed = 1,
    /// Command code not recognized.
    InvalidCommand = 2,
    /// Header checksum mismatch; the command was not dispatched.
    BadChecksum = 3,
    /// Named partition not present in the partition table.
    NoPartition = 4,
    /// Write would run past the end of the target partition.
    OutOfBounds = 5,
    /// A writer session is already open.
    Busy = 6,
    /// Requested mode is not acceptable in this session.
    NotAllowed = 7,
    /// Payload length does not match what the command requires.
    LengthMismatch = 8,
}

/// Header decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderError {
    /// Buffer shorter than [`HEADER_SIZE`].
    Truncated,
    /// Magic is neither "UPGC" nor "UPGR" as required by context.
    BadMagic,
    /// Checksum over the first 16 bytes does not match.
    BadChecksum,
}

/// Header checksum: unsigned byte-wise sum, wrapping at 32 bits.
pub fn header_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

/// Host-to-device command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandHeader {
    pub protocol: u8,
    pub version: u8,
    /// Raw command code; the dispatcher maps it through
    /// [`Command::from_u8`] so unknown codes can be answered instead of
    /// dropped.
    pub command: u8,
    pub data_length: u32,
}

impl CommandHeader {
    pub fn new(command: Command, data_length: u32) -> Self {
        Self {
            protocol: PROTOCOL,
            version: VERSION,
            command: command as u8,
            data_length,
        }
    }

    /// Decode and validate a command header.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        if u32_at(buf, 0) != COMMAND_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        if u32_at(buf, 16) != header_checksum(&buf[..16]) {
            return Err(HeaderError::BadChecksum);
        }
        Ok(Self {
            protocol: buf[4],
            version: buf[5],
            command: buf[6],
            data_length: u32_at(buf, 8),
        })
    }

    /// Encode into exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf.fill(0);
        put_u32(buf, 0, COMMAND_MAGIC);
        buf[4] = self.protocol;
        buf[5] = self.version;
        buf[6] = self.command;
        put_u32(buf, 8, self.data_length);
        let sum = header_checksum(&buf[..16]);
        put_u32(buf, 16, sum);
    }
}

/// Device-to-host response header. `command` always echoes the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseHeader {
    pub protocol: u8,
    pub version: u8,
    pub command: u8,
    pub status: Status,
    pub data_length: u32,
}

impl ResponseHeader {
    pub fn new(command: u8, status: Status, data_length: u32) -> Self {
        Self {
            protocol: PROTOCOL,
            version: VERSION,
            command,
            status,
            data_length,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        if u32_at(buf, 0) != RESPONSE_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        if u32_at(buf, 16) != header_checksum(&buf[..16]) {
            return Err(HeaderError::BadChecksum);
        }
        let status = match buf[7] {
            0 => Status::Ok,
            1 => Status::Failed,
            2 => Status::InvalidCommand,
            3 => Status::BadChecksum,
            4 => Status::NoPartition,
            5 => Status::OutOfBounds,
            6 => Status::Busy,
            7 => Status::NotAllowed,
            8 => Status::LengthMismatch,
            _ => Status::Failed,
        };
        Ok(Self {
            protocol: buf[4],
            version: buf[5],
            command: buf[6],
            status,
            data_length: u32_at(buf, 8),
        })
    }

    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf.fill(0);
        put_u32(buf, 0, RESPONSE_MAGIC);
        buf[4] = self.protocol;
        buf[5] = self.version;
        buf[6] = self.command;
        buf[7] = self.status as u8;
        put_u32(buf, 8, self.data_length);
        let sum = header_checksum(&buf[..16]);
        put_u32(buf, 16, sum);
    }
}
