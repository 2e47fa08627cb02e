// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command Block Wrapper / Command Status Wrapper codecs.
//!
//! The USB transport reuses the bulk-only mass-storage framing for a
//! vendor protocol: every exchange is a 31-byte CBW from the host,
//! an optional data phase, then a 13-byte CSW from the device echoing
//! the CBW tag. Fields are decoded explicitly, little-endian, rather
//! than by reinterpreting the packet buffer as a packed struct.

use crate::{put_u32, u32_at};

/// "USBC", little-endian, at the start of every CBW.
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS", little-endian, at the start of every CSW.
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

pub const CBW_SIZE: usize = 31;
pub const CSW_SIZE: usize = 13;

/// Direction bit in the CBW flags byte: set means device-to-host.
pub const CBW_FLAG_DIR_IN: u8 = 0x80;

/// Command byte: host pushes a command packet to the device.
pub const TRANS_CMD_WRITE: u8 = 0x01;
/// Command byte: host pulls the staged response from the device.
pub const TRANS_CMD_READ: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbwError {
    Truncated,
    BadSignature,
}

/// Decoded Command Block Wrapper.
///
/// ```text
/// [0..4)   signature  "USBC"
/// [4..8)   tag        echoed in the CSW
/// [8..12)  data transfer length
/// [12]     flags      bit7 = device-to-host
/// [13]     lun
/// [14]     cb length
/// [15]     command byte, 15 reserved bytes follow
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub command: u8,
}

impl Cbw {
    pub fn parse(buf: &[u8]) -> Result<Self, CbwError> {
        if buf.len() < CBW_SIZE {
            return Err(CbwError::Truncated);
        }
        if u32_at(buf, 0) != CBW_SIGNATURE {
            return Err(CbwError::BadSignature);
        }
        Ok(Self {
            tag: u32_at(buf, 4),
            data_transfer_length: u32_at(buf, 8),
            flags: buf[12],
            lun: buf[13],
            cb_length: buf[14],
            command: buf[15],
        })
    }

    pub fn encode(&self, buf: &mut [u8; CBW_SIZE]) {
        buf.fill(0);
        put_u32(buf, 0, CBW_SIGNATURE);
        put_u32(buf, 4, self.tag);
        put_u32(buf, 8, self.data_transfer_length);
        buf[12] = self.flags;
        buf[13] = self.lun;
        buf[14] = self.cb_length;
        buf[15] = self.command;
    }

    /// Whether the data phase (if any) runs device-to-host.
    pub fn is_dir_in(&self) -> bool {
        self.flags & CBW_FLAG_DIR_IN != 0
    }
}

/// CSW status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    /// Host and device disagree about the transfer length; the host
    /// must reset the transport before continuing.
    PhaseError = 2,
}

/// Decoded Command Status Wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    pub fn parse(buf: &[u8]) -> Result<Self, CbwError> {
        if buf.len() < CSW_SIZE {
            return Err(CbwError::Truncated);
        }
        if u32_at(buf, 0) != CSW_SIGNATURE {
            return Err(CbwError::BadSignature);
        }
        let status = match buf[12] {
            0 => CswStatus::Passed,
            2 => CswStatus::PhaseError,
            _ => CswStatus::Failed,
        };
        Ok(Self {
            tag: u32_at(buf, 4),
            data_residue: u32_at(buf, 8),
            status,
        })
    }

    pub fn encode(&self, buf: &mut [u8; CSW_SIZE]) {
        buf.fill(0);
        put_u32(buf, 0, CSW_SIGNATURE);
        put_u32(buf, 4, self.tag);
        put_u32(buf, 8, self.data_residue);
        buf[12] = self.status as u8;
    }
}
