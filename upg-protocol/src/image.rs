// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware image header and component metadata records.
//!
//! A packed firmware image starts with a fixed 2048-byte header that
//! identifies the platform and points at a table of firmware component
//! (FWC) metadata records. Each record names one component, the
//! partition it burns to and the expected CRC32 of the written data.
//!
//! String fields are fixed-size, zero-padded ASCII/UTF-8. Accessors
//! return the slice up to the first NUL.

use crate::{put_u32, strfield_len, u32_at};

pub const IMAGE_MAGIC: &[u8; 8] = b"AIC.FW\0\0";
pub const IMAGE_HEADER_SIZE: usize = 2048;

pub const FWC_META_SIZE: usize = 144;

const STR_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    Truncated,
    BadMagic,
    /// A string field is not valid UTF-8 up to its NUL terminator.
    BadString,
}

/// The image header at offset 0 of a packed firmware file.
///
/// ```text
/// [0..8)       magic "AIC.FW"
/// [8..72)      platform
/// [72..136)    product
/// [136..200)   version
/// [200..264)   media_type
/// [264..268)   media_dev_id
/// [268..272)   meta_offset   FWC metadata table, from file start
/// [272..276)   meta_size
/// [276..280)   file_offset   component data area, from file start
/// [280..284)   file_size
/// [284..2048)  reserved, zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImageHeader {
    pub platform: [u8; STR_LEN],
    pub product: [u8; STR_LEN],
    pub version: [u8; STR_LEN],
    pub media_type: [u8; STR_LEN],
    pub media_dev_id: u32,
    pub meta_offset: u32,
    pub meta_size: u32,
    pub file_offset: u32,
    pub file_size: u32,
}

impl FirmwareImageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ImageError> {
        if buf.len() < IMAGE_HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        // Match on the terminated name only; the trailing pad byte is
        // unspecified in older packers.
        if &buf[..7] != &IMAGE_MAGIC[..7] {
            return Err(ImageError::BadMagic);
        }
        let hdr = Self {
            platform: strfield(buf, 8),
            product: strfield(buf, 72),
            version: strfield(buf, 136),
            media_type: strfield(buf, 200),
            media_dev_id: u32_at(buf, 264),
            meta_offset: u32_at(buf, 268),
            meta_size: u32_at(buf, 272),
            file_offset: u32_at(buf, 276),
            file_size: u32_at(buf, 280),
        };
        for field in [&hdr.platform, &hdr.product, &hdr.version, &hdr.media_type] {
            if core::str::from_utf8(&field[..strfield_len(field)]).is_err() {
                return Err(ImageError::BadString);
            }
        }
        Ok(hdr)
    }

    pub fn encode(&self, buf: &mut [u8; IMAGE_HEADER_SIZE]) {
        buf.fill(0);
        buf[..8].copy_from_slice(IMAGE_MAGIC);
        buf[8..8 + STR_LEN].copy_from_slice(&self.platform);
        buf[72..72 + STR_LEN].copy_from_slice(&self.product);
        buf[136..136 + STR_LEN].copy_from_slice(&self.version);
        buf[200..200 + STR_LEN].copy_from_slice(&self.media_type);
        put_u32(buf, 264, self.media_dev_id);
        put_u32(buf, 268, self.meta_offset);
        put_u32(buf, 272, self.meta_size);
        put_u32(buf, 276, self.file_offset);
        put_u32(buf, 280, self.file_size);
    }

    pub fn platform(&self) -> &str {
        str_value(&self.platform)
    }

    pub fn product(&self) -> &str {
        str_value(&self.product)
    }

    pub fn version(&self) -> &str {
        str_value(&self.version)
    }

    pub fn media_type(&self) -> &str {
        str_value(&self.media_type)
    }

    /// Number of FWC metadata records the header points at.
    pub fn meta_count(&self) -> u32 {
        self.meta_size / FWC_META_SIZE as u32
    }
}

/// One firmware component metadata record.
///
/// ```text
/// [0..64)     name
/// [64..128)   partition
/// [128..132)  offset   component data offset in the image file
/// [132..136)  size     component data length in bytes
/// [136..140)  crc      CRC32 of the written partition data
/// [140..144)  ram      load address for RAM components, 0 otherwise
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwcMeta {
    pub name: [u8; STR_LEN],
    pub partition: [u8; STR_LEN],
    pub offset: u32,
    pub size: u32,
    pub crc: u32,
    pub ram: u32,
}

impl FwcMeta {
    pub fn parse(buf: &[u8]) -> Result<Self, ImageError> {
        if buf.len() < FWC_META_SIZE {
            return Err(ImageError::Truncated);
        }
        let meta = Self {
            name: strfield(buf, 0),
            partition: strfield(buf, 64),
            offset: u32_at(buf, 128),
            size: u32_at(buf, 132),
            crc: u32_at(buf, 136),
            ram: u32_at(buf, 140),
        };
        for field in [&meta.name, &meta.partition] {
            if core::str::from_utf8(&field[..strfield_len(field)]).is_err() {
                return Err(ImageError::BadString);
            }
        }
        Ok(meta)
    }

    pub fn encode(&self, buf: &mut [u8; FWC_META_SIZE]) {
        buf.fill(0);
        buf[..STR_LEN].copy_from_slice(&self.name);
        buf[64..64 + STR_LEN].copy_from_slice(&self.partition);
        put_u32(buf, 128, self.offset);
        put_u32(buf, 132, self.size);
        put_u32(buf, 136, self.crc);
        put_u32(buf, 140, self.ram);
    }

    pub fn name(&self) -> &str {
        str_value(&self.name)
    }

    pub fn partition(&self) -> &str {
        str_value(&self.partition)
    }
}

/// Build a zero-padded string field. Panics if `s` does not fit, which
/// is fine for the host-side packers and tests that use it.
pub fn str_field(s: &str) -> [u8; STR_LEN] {
    let mut field = [0u8; STR_LEN];
    field[..s.len()].copy_from_slice(s.as_bytes());
    field
}

fn strfield(buf: &[u8], off: usize) -> [u8; STR_LEN] {
    let mut field = [0u8; STR_LEN];
    field.copy_from_slice(&buf[off..off + STR_LEN]);
    field
}

fn str_value(field: &[u8; STR_LEN]) -> &str {
    // Validated in parse; fields built via str_field are always UTF-8.
    core::str::from_utf8(&field[..strfield_len(field)]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FirmwareImageHeader {
        FirmwareImageHeader {
            platform: str_field("d211"),
            product: str_field("demo88_nand"),
            version: str_field("1.0.3"),
            media_type: str_field("spi-nand"),
            media_dev_id: 0,
            meta_offset: 2048,
            meta_size: 2 * FWC_META_SIZE as u32,
            file_offset: 4096,
            file_size: 0x0010_0000,
        }
    }

    #[test]
    fn image_header_round_trip() {
        let hdr = sample_header();
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        hdr.encode(&mut buf);
        let parsed = FirmwareImageHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.platform(), "d211");
        assert_eq!(parsed.media_type(), "spi-nand");
        assert_eq!(parsed.meta_count(), 2);
    }

    #[test]
    fn image_header_bad_magic() {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        sample_header().encode(&mut buf);
        buf[0] = b'X';
        assert_eq!(FirmwareImageHeader::parse(&buf), Err(ImageError::BadMagic));
    }

    #[test]
    fn image_header_truncated() {
        let buf = [0u8; IMAGE_HEADER_SIZE - 1];
        assert_eq!(FirmwareImageHeader::parse(&buf), Err(ImageError::Truncated));
    }

    #[test]
    fn fwc_meta_round_trip() {
        let meta = FwcMeta {
            name: str_field("image:target:kernel"),
            partition: str_field("kernel"),
            offset: 4096,
            size: 0x8_0000,
            crc: 0xDEAD_BEEF,
            ram: 0,
        };
        let mut buf = [0u8; FWC_META_SIZE];
        meta.encode(&mut buf);
        let parsed = FwcMeta::parse(&buf).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.partition(), "kernel");
    }

    #[test]
    fn fwc_meta_bad_utf8() {
        let mut buf = [0u8; FWC_META_SIZE];
        FwcMeta {
            name: str_field("x"),
            partition: str_field("p"),
            offset: 0,
            size: 0,
            crc: 0,
            ram: 0,
        }
        .encode(&mut buf);
        buf[0] = 0xFF;
        assert_eq!(FwcMeta::parse(&buf), Err(ImageError::BadString));
    }
}
