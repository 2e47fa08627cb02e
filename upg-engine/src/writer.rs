// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Streaming firmware container decoder and storage writer.
//!
//! A [`WriterSession`] turns the arbitrarily chunked byte stream of
//! SEND_FWC_DATA commands into aligned block writes, erases and fills
//! on one target partition. The stream is probed once at the start:
//! sparse containers are decoded chunk by chunk, anything else is
//! burned as a raw pass-through image with write-verify.
//!
//! No logical unit is assumed to arrive whole. Headers, fill words and
//! chunk payloads may straddle any number of `write` calls; bytes that
//! cannot be consumed yet (less than one block, or a partial header)
//! carry over in the session's leftover buffer.

use crate::blockdev::{BlockDevice, DeviceError, Partition};
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use upg_protocol::image::FwcMeta;
use upg_protocol::sparse::{
    self, ChunkHeader, ChunkType, SparseError, SparseHeader, CHUNK_HEADER_SIZE,
    SPARSE_HEADER_SIZE,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Largest device block the leftover carry buffer can hold.
pub const MAX_BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteError {
    /// The metadata names a partition the device does not have.
    NoPartition,
    /// Write would exceed the target partition.
    OutOfBounds,
    /// Device block size is zero, not a multiple of 4, or larger than
    /// [`MAX_BLOCK_SIZE`].
    UnsupportedBlockSize,
    /// Data arrived after the container's final chunk.
    TrailingData,
    Device(DeviceError),
    Container(SparseError),
}

impl From<DeviceError> for WriteError {
    fn from(e: DeviceError) -> Self {
        WriteError::Device(e)
    }
}

impl From<SparseError> for WriteError {
    fn from(e: SparseError) -> Self {
        WriteError::Container(e)
    }
}

/// Final accounting of one burned component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BurnResult {
    /// Stream bytes consumed, including container headers.
    pub trans_size: u32,
    /// CRC32 of the data as stored (raw path: read back from the
    /// device; sparse path: mirrors the transmitted component CRC,
    /// since DONT_CARE regions make a readback CRC meaningless).
    pub partition_crc: u32,
    /// CRC32 of the data as transmitted (raw path only).
    pub trans_crc: u32,
}

#[derive(Clone, Copy)]
enum Path {
    Probe,
    Raw,
    Sparse(SparseHeader),
}

#[derive(Clone, Copy)]
enum Pending {
    /// RAW chunk with this many payload bytes still owed.
    Raw { remain: u64 },
    /// FILL chunk header seen, 4-byte fill word not yet arrived.
    FillWord { blocks: u32 },
}

pub struct WriterSession {
    meta: FwcMeta,
    part: Partition,
    blk_size: usize,
    path: Path,
    pending: Option<Pending>,
    chunks_done: u32,
    /// Write cursor in blocks, relative to the partition start.
    cursor: u32,
    trans_size: u32,
    leftover: [u8; MAX_BLOCK_SIZE],
    leftover_len: usize,
    partition_crc: Digest<'static, u32>,
    trans_crc: Digest<'static, u32>,
}

/// Read cursor over the previous call's leftover followed by the new
/// buffer, so consumers never see the seam.
struct Feed<'a> {
    head: &'a [u8],
    tail: &'a [u8],
    pos: usize,
}

impl<'a> Feed<'a> {
    fn new(head: &'a [u8], tail: &'a [u8]) -> Self {
        Self { head, tail, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.head.len() + self.tail.len() - self.pos
    }

    fn at(&self, idx: usize) -> u8 {
        if idx < self.head.len() {
            self.head[idx]
        } else {
            self.tail[idx - self.head.len()]
        }
    }

    fn peek(&self, out: &mut [u8]) -> bool {
        if self.remaining() < out.len() {
            return false;
        }
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.at(self.pos + i);
        }
        true
    }

    fn take(&mut self, out: &mut [u8]) -> bool {
        if !self.peek(out) {
            return false;
        }
        self.pos += out.len();
        true
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    /// Longest contiguous slice at the cursor.
    fn contiguous(&self) -> &'a [u8] {
        if self.pos < self.head.len() {
            &self.head[self.pos..]
        } else {
            &self.tail[self.pos - self.head.len()..]
        }
    }
}

impl WriterSession {
    pub fn new<D: BlockDevice>(dev: &D, meta: FwcMeta) -> Result<Self, WriteError> {
        let blk_size = dev.block_size();
        if blk_size == 0 || blk_size % 4 != 0 || blk_size > MAX_BLOCK_SIZE {
            return Err(WriteError::UnsupportedBlockSize);
        }
        let part = dev
            .partition(meta.partition())
            .ok_or(WriteError::NoPartition)?;
        info!(
            "burn start: component len {} -> partition blocks {}..+{}",
            meta.size, part.start_blk, part.blk_cnt
        );
        Ok(Self {
            meta,
            part,
            blk_size,
            path: Path::Probe,
            pending: None,
            chunks_done: 0,
            cursor: 0,
            trans_size: 0,
            leftover: [0; MAX_BLOCK_SIZE],
            leftover_len: 0,
            partition_crc: CRC32.digest(),
            trans_crc: CRC32.digest(),
        })
    }

    /// Stream bytes consumed so far (headers included; stashed leftover
    /// bytes are counted once consumed).
    pub fn trans_size(&self) -> u32 {
        self.trans_size
    }

    /// Push the next slice of the component stream. Zero length is a
    /// no-op.
    pub fn write<D: BlockDevice>(&mut self, dev: &mut D, buf: &[u8]) -> Result<(), WriteError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut head = [0u8; MAX_BLOCK_SIZE];
        let head_len = self.leftover_len;
        head[..head_len].copy_from_slice(&self.leftover[..head_len]);
        self.leftover_len = 0;

        let mut feed = Feed::new(&head[..head_len], buf);
        let fed = feed.remaining();
        self.process(dev, &mut feed)?;

        let rest = feed.remaining();
        debug_assert!(rest <= MAX_BLOCK_SIZE);
        self.trans_size += (fed - rest) as u32;
        feed.take(&mut self.leftover[..rest]);
        self.leftover_len = rest;
        Ok(())
    }

    /// Close the session: flush the raw path's trailing partial block
    /// (zero padded) and produce the final accounting.
    pub fn end<D: BlockDevice>(mut self, dev: &mut D) -> Result<BurnResult, WriteError> {
        if matches!(self.path, Path::Probe) {
            self.path = Path::Raw;
        }
        match self.path {
            Path::Sparse(header) => {
                if self.pending.is_some()
                    || self.leftover_len > 0
                    || self.chunks_done < header.total_chunks
                {
                    return Err(WriteError::Container(SparseError::Truncated));
                }
                Ok(BurnResult {
                    trans_size: self.trans_size,
                    partition_crc: self.meta.crc,
                    trans_crc: self.meta.crc,
                })
            }
            _ => {
                if self.leftover_len > 0 {
                    let real = self.leftover_len;
                    let mut tmp = [0u8; MAX_BLOCK_SIZE];
                    tmp[..real].copy_from_slice(&self.leftover[..real]);
                    self.leftover_len = 0;
                    let blk = self.blk_size;
                    self.write_verified(dev, &tmp[..blk], real)?;
                    self.trans_size += real as u32;
                }
                Ok(BurnResult {
                    trans_size: self.trans_size,
                    partition_crc: self.partition_crc.finalize(),
                    trans_crc: self.trans_crc.finalize(),
                })
            }
        }
    }

    fn process<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        feed: &mut Feed<'_>,
    ) -> Result<(), WriteError> {
        loop {
            match self.path {
                Path::Probe => {
                    if self.meta.size as usize >= SPARSE_HEADER_SIZE {
                        let mut magic = [0u8; 4];
                        if !feed.peek(&mut magic) {
                            return Ok(());
                        }
                        if sparse::is_sparse_image(&magic) {
                            let mut hdr = [0u8; SPARSE_HEADER_SIZE];
                            if !feed.take(&mut hdr) {
                                return Ok(());
                            }
                            let header = SparseHeader::parse(&hdr)?;
                            debug!(
                                "sparse image: blk_sz {} chunks {}",
                                header.blk_sz, header.total_chunks
                            );
                            self.path = Path::Sparse(header);
                            continue;
                        }
                    }
                    debug!("raw image stream");
                    self.path = Path::Raw;
                }
                Path::Raw => return self.process_raw(dev, feed),
                Path::Sparse(_) => {
                    if !self.sparse_step(dev, feed)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn process_raw<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        feed: &mut Feed<'_>,
    ) -> Result<(), WriteError> {
        let blk = self.blk_size;
        loop {
            if feed.remaining() < blk {
                return Ok(());
            }
            let c = feed.contiguous();
            if c.len() >= blk {
                let nbytes = c.len() - c.len() % blk;
                self.write_verified(dev, &c[..nbytes], nbytes)?;
                feed.advance(nbytes);
            } else {
                // block straddles the leftover/new-buffer seam
                let mut tmp = [0u8; MAX_BLOCK_SIZE];
                feed.take(&mut tmp[..blk]);
                self.write_verified(dev, &tmp[..blk], blk)?;
            }
        }
    }

    /// One unit of sparse progress: resume the pending chunk or consume
    /// the next chunk header. Returns false when more bytes are needed.
    fn sparse_step<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        feed: &mut Feed<'_>,
    ) -> Result<bool, WriteError> {
        let header = match self.path {
            Path::Sparse(h) => h,
            _ => return Ok(false),
        };

        if let Some(pending) = self.pending {
            match pending {
                Pending::Raw { remain } => return self.burn_raw_chunk(dev, feed, remain),
                Pending::FillWord { blocks } => {
                    let mut word = [0u8; 4];
                    if !feed.take(&mut word) {
                        return Ok(false);
                    }
                    self.pending = None;
                    self.burn_fill(dev, blocks, u32::from_le_bytes(word))?;
                    self.chunks_done += 1;
                    return Ok(true);
                }
            }
        }

        if self.chunks_done >= header.total_chunks {
            if feed.remaining() > 0 {
                return Err(WriteError::TrailingData);
            }
            return Ok(false);
        }

        let mut hdr = [0u8; CHUNK_HEADER_SIZE];
        if !feed.take(&mut hdr) {
            return Ok(false);
        }
        let chunk = ChunkHeader::parse(&hdr)?;
        chunk.validate(&header)?;

        let data_len = chunk.data_len(&header);
        let blk = self.blk_size as u64;
        // Region size stays 64-bit: chunk_sz * blk_sz can exceed u32.
        let region_blocks = (data_len + blk - 1) / blk;
        // Whole-chunk bound check up front, before anything is written.
        self.check_room(region_blocks)?;
        debug!("chunk {}: {} device blocks", self.chunks_done, region_blocks);

        match chunk.chunk_type {
            ChunkType::Raw => {
                self.burn_raw_chunk(dev, feed, data_len)?;
                Ok(true)
            }
            ChunkType::Fill => {
                // fits in u32 once check_room has passed
                self.pending = Some(Pending::FillWord {
                    blocks: region_blocks as u32,
                });
                Ok(true)
            }
            ChunkType::DontCare => {
                self.cursor += region_blocks as u32;
                self.chunks_done += 1;
                Ok(true)
            }
            ChunkType::Crc32 => {
                self.chunks_done += 1;
                Ok(true)
            }
        }
    }

    fn burn_raw_chunk<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        feed: &mut Feed<'_>,
        mut remain: u64,
    ) -> Result<bool, WriteError> {
        let blk = self.blk_size;
        let mut progressed = false;
        loop {
            if remain == 0 {
                self.pending = None;
                self.chunks_done += 1;
                return Ok(true);
            }
            let avail = feed.remaining();
            if (remain as usize) < blk {
                // chunk tail shorter than one device block
                if avail < remain as usize {
                    break;
                }
                let mut tmp = [0u8; MAX_BLOCK_SIZE];
                feed.take(&mut tmp[..remain as usize]);
                self.write_blocks(dev, &tmp[..blk])?;
                remain = 0;
                progressed = true;
                continue;
            }
            if avail < blk {
                break;
            }
            let c = feed.contiguous();
            if c.len() >= blk {
                let full = remain - remain % blk as u64;
                let mut nbytes = c.len() - c.len() % blk;
                if nbytes as u64 > full {
                    nbytes = full as usize;
                }
                self.write_blocks(dev, &c[..nbytes])?;
                feed.advance(nbytes);
                remain -= nbytes as u64;
            } else {
                let mut tmp = [0u8; MAX_BLOCK_SIZE];
                feed.take(&mut tmp[..blk]);
                self.write_blocks(dev, &tmp[..blk])?;
                remain -= blk as u64;
            }
            progressed = true;
        }
        self.pending = Some(Pending::Raw { remain });
        Ok(progressed)
    }

    fn burn_fill<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        blocks: u32,
        value: u32,
    ) -> Result<(), WriteError> {
        let eg = dev.erase_group();
        if value == 0 && eg > 0 && blocks >= eg {
            // Zero fill of at least one erase group: erasing the
            // aligned middle beats writing it, fill only the
            // misaligned edges.
            let abs = self.abs_blk();
            let head = match abs % eg {
                0 => 0,
                r => eg - r,
            };
            self.fill_blocks(dev, head, value)?;
            let groups = (blocks - head) / eg;
            if groups > 0 {
                self.check_room(u64::from(groups * eg))?;
                dev.erase(self.abs_blk(), groups * eg)?;
                self.cursor += groups * eg;
            }
            self.fill_blocks(dev, blocks - head - groups * eg, value)?;
        } else {
            self.fill_blocks(dev, blocks, value)?;
        }
        Ok(())
    }

    fn fill_blocks<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        blocks: u32,
        value: u32,
    ) -> Result<(), WriteError> {
        if blocks == 0 {
            return Ok(());
        }
        let blk = self.blk_size;
        let mut tmp = [0u8; MAX_BLOCK_SIZE];
        for c in tmp[..blk].chunks_exact_mut(4) {
            c.copy_from_slice(&value.to_le_bytes());
        }
        for _ in 0..blocks {
            self.write_blocks(dev, &tmp[..blk])?;
        }
        Ok(())
    }

    /// Write whole blocks at the cursor (sparse path, no verify).
    fn write_blocks<D: BlockDevice>(&mut self, dev: &mut D, data: &[u8]) -> Result<(), WriteError> {
        let blocks = (data.len() / self.blk_size) as u32;
        self.check_room(u64::from(blocks))?;
        dev.write(self.abs_blk(), data)?;
        self.cursor += blocks;
        Ok(())
    }

    /// Raw-path write: fold the transmitted bytes into the trans CRC,
    /// write, then read the blocks back so the partition CRC reflects
    /// what storage actually holds. `real_len` caps the CRC to the
    /// meaningful bytes of a zero-padded final block.
    fn write_verified<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        data: &[u8],
        real_len: usize,
    ) -> Result<(), WriteError> {
        let blk = self.blk_size;
        let blocks = (data.len() / blk) as u32;
        self.check_room(u64::from(blocks))?;
        self.trans_crc.update(&data[..real_len]);
        dev.write(self.abs_blk(), data)?;
        let mut tmp = [0u8; MAX_BLOCK_SIZE];
        let mut off = 0usize;
        for i in 0..blocks {
            dev.read(self.abs_blk() + i, &mut tmp[..blk])?;
            let take = core::cmp::min(blk, real_len - off);
            self.partition_crc.update(&tmp[..take]);
            off += take;
        }
        self.cursor += blocks;
        Ok(())
    }

    fn abs_blk(&self) -> u32 {
        self.part.start_blk + self.cursor
    }

    fn check_room(&self, blocks: u64) -> Result<(), WriteError> {
        if u64::from(self.cursor) + blocks > u64::from(self.part.blk_cnt) {
            error!("write would exceed partition size");
            return Err(WriteError::OutOfBounds);
        }
        Ok(())
    }
}
