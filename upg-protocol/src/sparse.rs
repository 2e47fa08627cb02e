// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sparse-image container headers.
//!
//! A sparse image compresses a block-device image into typed chunks: a
//! 28-byte file header followed by `total_chunks` chunks, each with a
//! 12-byte header. RAW chunks carry `chunk_sz * blk_sz` payload bytes,
//! FILL chunks carry a single 4-byte fill word, DONT_CARE chunks carry
//! nothing (the region is skipped), and a CRC32 chunk is a trailer
//! marker with no payload.

use crate::{put_u16, put_u32, u16_at, u32_at};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_MAJOR: u16 = 1;

pub const SPARSE_HEADER_SIZE: usize = 28;
pub const CHUNK_HEADER_SIZE: usize = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SparseError {
    Truncated,
    BadMagic,
    /// Major version newer than this decoder understands.
    UnsupportedVersion,
    /// Header sizes or block size are inconsistent.
    BadGeometry,
    /// Chunk type is none of RAW/FILL/DONT_CARE/CRC32. Treated as a
    /// hard decode error: re-using the previous chunk header would mask
    /// a corrupted container.
    UnknownChunkType(u16),
    /// `total_sz` does not match what the chunk type requires.
    BadChunkSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

/// Sparse file header.
///
/// ```text
/// [0..4)   magic          0xED26FF3A
/// [4..6)   major_version
/// [6..8)   minor_version
/// [8..10)  file_hdr_sz
/// [10..12) chunk_hdr_sz
/// [12..16) blk_sz         multiple of 4
/// [16..20) total_blks
/// [20..24) total_chunks
/// [24..28) image_checksum
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

/// Peek at the stream start: does this look like a sparse image?
pub fn is_sparse_image(buf: &[u8]) -> bool {
    buf.len() >= 4 && u32_at(buf, 0) == SPARSE_MAGIC
}

impl SparseHeader {
    pub fn new(blk_sz: u32, total_blks: u32, total_chunks: u32) -> Self {
        Self {
            major_version: SPARSE_MAJOR,
            minor_version: 0,
            file_hdr_sz: SPARSE_HEADER_SIZE as u16,
            chunk_hdr_sz: CHUNK_HEADER_SIZE as u16,
            blk_sz,
            total_blks,
            total_chunks,
            image_checksum: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SparseError> {
        if buf.len() < SPARSE_HEADER_SIZE {
            return Err(SparseError::Truncated);
        }
        if u32_at(buf, 0) != SPARSE_MAGIC {
            return Err(SparseError::BadMagic);
        }
        let hdr = Self {
            major_version: u16_at(buf, 4),
            minor_version: u16_at(buf, 6),
            file_hdr_sz: u16_at(buf, 8),
            chunk_hdr_sz: u16_at(buf, 10),
            blk_sz: u32_at(buf, 12),
            total_blks: u32_at(buf, 16),
            total_chunks: u32_at(buf, 20),
            image_checksum: u32_at(buf, 24),
        };
        if hdr.major_version > SPARSE_MAJOR {
            return Err(SparseError::UnsupportedVersion);
        }
        if (hdr.file_hdr_sz as usize) < SPARSE_HEADER_SIZE
            || (hdr.chunk_hdr_sz as usize) < CHUNK_HEADER_SIZE
            || hdr.blk_sz == 0
            || hdr.blk_sz % 4 != 0
        {
            return Err(SparseError::BadGeometry);
        }
        Ok(hdr)
    }

    pub fn encode(&self, buf: &mut [u8; SPARSE_HEADER_SIZE]) {
        put_u32(buf, 0, SPARSE_MAGIC);
        put_u16(buf, 4, self.major_version);
        put_u16(buf, 6, self.minor_version);
        put_u16(buf, 8, self.file_hdr_sz);
        put_u16(buf, 10, self.chunk_hdr_sz);
        put_u32(buf, 12, self.blk_sz);
        put_u32(buf, 16, self.total_blks);
        put_u32(buf, 20, self.total_chunks);
        put_u32(buf, 24, self.image_checksum);
    }
}

/// Per-chunk header.
///
/// ```text
/// [0..2)   chunk_type
/// [2..4)   reserved
/// [4..8)   chunk_sz   in blk_sz units
/// [8..12)  total_sz   bytes including this header
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub chunk_sz: u32,
    pub total_sz: u32,
}

impl ChunkHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, SparseError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(SparseError::Truncated);
        }
        let raw_type = u16_at(buf, 0);
        let chunk_type = match raw_type {
            CHUNK_TYPE_RAW => ChunkType::Raw,
            CHUNK_TYPE_FILL => ChunkType::Fill,
            CHUNK_TYPE_DONT_CARE => ChunkType::DontCare,
            CHUNK_TYPE_CRC32 => ChunkType::Crc32,
            other => return Err(SparseError::UnknownChunkType(other)),
        };
        Ok(Self {
            chunk_type,
            chunk_sz: u32_at(buf, 4),
            total_sz: u32_at(buf, 8),
        })
    }

    pub fn encode(&self, buf: &mut [u8; CHUNK_HEADER_SIZE]) {
        buf.fill(0);
        let raw_type = match self.chunk_type {
            ChunkType::Raw => CHUNK_TYPE_RAW,
            ChunkType::Fill => CHUNK_TYPE_FILL,
            ChunkType::DontCare => CHUNK_TYPE_DONT_CARE,
            ChunkType::Crc32 => CHUNK_TYPE_CRC32,
        };
        put_u16(buf, 0, raw_type);
        put_u32(buf, 4, self.chunk_sz);
        put_u32(buf, 8, self.total_sz);
    }

    /// Region covered on the target device, in bytes.
    pub fn data_len(&self, sparse: &SparseHeader) -> u64 {
        self.chunk_sz as u64 * sparse.blk_sz as u64
    }

    /// Payload bytes that follow this header in the stream.
    pub fn payload_len(&self, sparse: &SparseHeader) -> u64 {
        self.total_sz as u64 - sparse.chunk_hdr_sz as u64
    }

    /// Check `total_sz` consistency for the chunk type.
    pub fn validate(&self, sparse: &SparseHeader) -> Result<(), SparseError> {
        let hdr = sparse.chunk_hdr_sz as u64;
        let ok = match self.chunk_type {
            ChunkType::Raw => self.total_sz as u64 == hdr + self.data_len(sparse),
            ChunkType::Fill => self.total_sz as u64 == hdr + 4,
            ChunkType::DontCare | ChunkType::Crc32 => self.total_sz as u64 == hdr,
        };
        if ok {
            Ok(())
        } else {
            Err(SparseError::BadChunkSize)
        }
    }
}
