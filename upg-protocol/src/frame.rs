// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! UART frame codec.
//!
//! The serial protocol moves data in XMODEM-style frames. A short frame
//! carries up to [`SHORT_DATA_MAX`] bytes and announces its own length;
//! a long frame always carries exactly [`LONG_DATA_LEN`] bytes:
//!
//! ```text
//! short: SOH blk 255-blk len data[len]  crc16_hi crc16_lo
//! long:  STX blk 255-blk     data[1024] crc16_hi crc16_lo
//! ```
//!
//! The CRC16 (XMODEM polynomial, zero init) covers the payload only.
//! Packing and unpacking are pure functions; block-number continuity
//! and duplicate detection belong to the protocol engine, which owns
//! the counters.

use crc::{Crc, CRC_16_XMODEM};

/// Start of a short frame.
pub const SOH: u8 = 0x01;
/// Start of a long frame.
pub const STX: u8 = 0x02;
/// Frame accepted.
pub const ACK: u8 = 0x06;
/// Frame rejected, sender must replay.
pub const NAK: u8 = 0x15;
/// Cancel, flushes host-side framing state.
pub const CAN: u8 = 0x18;
/// Handshake ping from the host, answered with ACK.
pub const SIG_C: u8 = 0x43;
/// Host announces it is about to send data.
pub const DC1_SEND: u8 = 0x11;
/// Host announces it wants to receive data.
pub const DC2_RECV: u8 = 0x12;

/// Maximum payload of a short frame.
pub const SHORT_DATA_MAX: usize = 61;
/// Fixed payload of a long frame.
pub const LONG_DATA_LEN: usize = 1024;
/// Short frame overhead: SOH, blk, ~blk, len, crc16.
pub const SHORT_OVERHEAD: usize = 6;
/// Long frame overhead: STX, blk, ~blk, crc16.
pub const LONG_OVERHEAD: usize = 5;
/// Largest frame that can appear on the wire.
pub const MAX_FRAME_LEN: usize = LONG_DATA_LEN + LONG_OVERHEAD;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC16 over a frame payload.
pub fn payload_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Payload length fits neither frame kind (between 62 and 1023).
    BadLength,
    /// First byte is neither SOH nor STX.
    UnknownType,
    /// Fewer bytes than the frame declares.
    Truncated,
    /// Second block byte is not the complement of the first.
    BadBlockComplement,
    /// CRC16 mismatch over the payload.
    BadCrc,
}

/// A decoded frame: the block number and a view into its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct FramePayload<'a> {
    pub block: u8,
    pub data: &'a [u8],
}

/// Total on-wire length of a frame, knowing its first byte and (for
/// short frames) the length byte. Used by the receive engine to learn
/// how many more bytes it still owes the current frame.
pub fn frame_len(kind: u8, len_byte: u8) -> Option<usize> {
    match kind {
        SOH => Some(len_byte as usize + SHORT_OVERHEAD),
        STX => Some(LONG_DATA_LEN + LONG_OVERHEAD),
        _ => None,
    }
}

/// Pack `data` into `frame` as a short or long frame.
///
/// Exactly [`LONG_DATA_LEN`] bytes become a long frame; up to
/// [`SHORT_DATA_MAX`] bytes become a short frame; anything else is an
/// error (the sender slices its buffer so intermediate lengths never
/// occur). Returns the number of frame bytes written.
pub fn pack_frame(block: u8, data: &[u8], frame: &mut [u8]) -> Result<usize, FrameError> {
    let crc = payload_crc(data);
    if data.len() == LONG_DATA_LEN {
        frame[0] = STX;
        frame[1] = block;
        frame[2] = 255 - block;
        frame[3..3 + LONG_DATA_LEN].copy_from_slice(data);
        frame[LONG_DATA_LEN + 3] = (crc >> 8) as u8;
        frame[LONG_DATA_LEN + 4] = (crc & 0xFF) as u8;
        Ok(LONG_DATA_LEN + LONG_OVERHEAD)
    } else if data.len() <= SHORT_DATA_MAX {
        frame[0] = SOH;
        frame[1] = block;
        frame[2] = 255 - block;
        frame[3] = data.len() as u8;
        frame[4..4 + data.len()].copy_from_slice(data);
        frame[data.len() + 4] = (crc >> 8) as u8;
        frame[data.len() + 5] = (crc & 0xFF) as u8;
        Ok(data.len() + SHORT_OVERHEAD)
    } else {
        Err(FrameError::BadLength)
    }
}

/// Unpack a complete frame, verifying the block complement and CRC.
pub fn read_frame_data(frame: &[u8]) -> Result<FramePayload<'_>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Truncated);
    }
    let (data_off, data_len) = match frame[0] {
        SOH => {
            if frame.len() < 4 {
                return Err(FrameError::Truncated);
            }
            (4usize, frame[3] as usize)
        }
        STX => (3usize, LONG_DATA_LEN),
        _ => return Err(FrameError::UnknownType),
    };
    if frame.len() < data_off + data_len + 2 {
        return Err(FrameError::Truncated);
    }

    let block = frame[1];
    if block != 255 - frame[2] {
        return Err(FrameError::BadBlockComplement);
    }

    let data = &frame[data_off..data_off + data_len];
    let wire_crc =
        (frame[data_off + data_len] as u16) << 8 | frame[data_off + data_len + 1] as u16;
    if payload_crc(data) != wire_crc {
        return Err(FrameError::BadCrc);
    }

    Ok(FramePayload { block, data })
}
