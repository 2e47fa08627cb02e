// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Full in-memory upgrade over the UART protocol.
//!
//! Plays both sides of the link: a scripted host that frames commands
//! the way the real flashing tool does, and a device session writing a
//! sparse image into a RAM-backed block device.
//!
//! Run with `cargo run --example uart_upgrade`.

use std::collections::VecDeque;

use crc::{Crc, CRC_32_ISO_HDLC};
use upg_engine::{
    BlockDevice, ByteIo, DeviceError, InitMode, ModeTimeouts, Partition, SessionEvent,
    UartSession, UpgInit,
};
use upg_protocol::command::{Command, CommandHeader, ResponseHeader, Status, HEADER_SIZE};
use upg_protocol::frame::{self, ACK, DC1_SEND, DC2_RECV, MAX_FRAME_LEN, SHORT_DATA_MAX};
use upg_protocol::image::{str_field, FwcMeta, FWC_META_SIZE};
use upg_protocol::sparse::{
    ChunkHeader, ChunkType, SparseHeader, CHUNK_HEADER_SIZE, SPARSE_HEADER_SIZE,
};

const BLK: usize = 512;
const ENGINE_BUF: usize = 1100;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// RAM-backed block device with a single partition table entry.
struct RamDisk {
    data: Vec<u8>,
    parts: Vec<(String, Partition)>,
}

impl RamDisk {
    fn new(blocks: u32) -> Self {
        Self {
            data: vec![0xA5; blocks as usize * BLK],
            parts: Vec::new(),
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        BLK
    }

    fn partition(&self, name: &str) -> Option<Partition> {
        self.parts.iter().find(|(n, _)| n == name).map(|(_, p)| *p)
    }

    fn read(&mut self, blk: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let start = blk as usize * BLK;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, blk: u32, data: &[u8]) -> Result<(), DeviceError> {
        let start = blk as usize * BLK;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, blk: u32, blocks: u32) -> Result<(), DeviceError> {
        let start = blk as usize * BLK;
        self.data[start..start + blocks as usize * BLK].fill(0);
        Ok(())
    }
}

/// The two byte queues of the serial link, seen from the device side.
struct Wire {
    host_to_dev: VecDeque<u8>,
    dev_to_host: Vec<u8>,
}

impl ByteIo for Wire {
    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.host_to_dev.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn send(&mut self, buf: &[u8]) -> usize {
        self.dev_to_host.extend_from_slice(buf);
        buf.len()
    }
}

/// Scripted host side of the link.
struct Host {
    wire: Wire,
    blk: u8,
    now: u64,
}

impl Host {
    fn send_frame(&mut self, data: &[u8]) {
        self.blk = self.blk.wrapping_add(1);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame::pack_frame(self.blk, data, &mut buf).unwrap();
        self.wire.host_to_dev.extend(&buf[..n]);
    }

    /// Deliver one command and collect the device's response.
    fn exchange(
        &mut self,
        session: &mut UartSession<ENGINE_BUF>,
        dev: &mut RamDisk,
        command: &[u8],
    ) -> (ResponseHeader, Vec<u8>) {
        self.wire.host_to_dev.push_back(DC1_SEND);
        self.send_frame(&command[..HEADER_SIZE]);
        for read_chunk in command[HEADER_SIZE..].chunks(ENGINE_BUF) {
            for data in read_chunk.chunks(SHORT_DATA_MAX) {
                self.send_frame(data);
            }
        }
        for _ in 0..64 {
            self.now += 1000;
            session.poll(&mut self.wire, dev, self.now);
        }

        self.wire.dev_to_host.clear();
        self.wire.host_to_dev.push_back(DC2_RECV);
        self.now += 1000;
        session.poll(&mut self.wire, dev, self.now);
        assert_eq!(self.wire.dev_to_host[0], ACK);
        let bytes = frame::read_frame_data(&self.wire.dev_to_host[1..])
            .unwrap()
            .data
            .to_vec();

        self.wire.host_to_dev.push_back(ACK);
        self.now += 1000;
        let evt = session.poll(&mut self.wire, dev, self.now);
        assert_eq!(evt, Some(SessionEvent::ResponseSent));

        let hdr = ResponseHeader::parse(&bytes).unwrap();
        (hdr, bytes[HEADER_SIZE..].to_vec())
    }
}

fn command_bytes(code: u8, payload: &[u8]) -> Vec<u8> {
    let hdr = CommandHeader {
        protocol: 1,
        version: 1,
        command: code,
        data_length: payload.len() as u32,
    };
    let mut buf = [0u8; HEADER_SIZE];
    hdr.encode(&mut buf);
    let mut out = buf.to_vec();
    out.extend_from_slice(payload);
    out
}

/// Sparse image: skip 8 blocks, 4 raw blocks, 16 zero-fill blocks,
/// CRC trailer. Returns the container bytes and the expanded content.
fn build_sparse_image() -> (Vec<u8>, Vec<u8>) {
    let raw: Vec<u8> = (0..4 * BLK).map(|i| (i % 251) as u8).collect();

    let mut expanded = vec![0u8; 28 * BLK];
    expanded[8 * BLK..12 * BLK].copy_from_slice(&raw);

    let mut image = Vec::new();
    let header = SparseHeader::new(BLK as u32, 28, 4);
    let mut buf = [0u8; SPARSE_HEADER_SIZE];
    header.encode(&mut buf);
    image.extend_from_slice(&buf);

    let chunks = [
        (ChunkType::DontCare, 8u32, CHUNK_HEADER_SIZE as u32, &[][..]),
        (
            ChunkType::Raw,
            4,
            (CHUNK_HEADER_SIZE + raw.len()) as u32,
            &raw[..],
        ),
        (
            ChunkType::Fill,
            16,
            (CHUNK_HEADER_SIZE + 4) as u32,
            &[0u8; 4][..],
        ),
        (ChunkType::Crc32, 0, CHUNK_HEADER_SIZE as u32, &[][..]),
    ];
    for (chunk_type, chunk_sz, total_sz, payload) in chunks {
        let mut hdr = [0u8; CHUNK_HEADER_SIZE];
        ChunkHeader {
            chunk_type,
            chunk_sz,
            total_sz,
        }
        .encode(&mut hdr);
        image.extend_from_slice(&hdr);
        image.extend_from_slice(payload);
    }

    (image, expanded)
}

fn print_progress(percent: u8) {
    println!("  burn progress: {percent}%");
}

fn main() {
    let mut dev = RamDisk::new(64);
    dev.parts
        .push(("os".into(), Partition { start_blk: 4, blk_cnt: 32 }));

    let mut host = Host {
        wire: Wire {
            host_to_dev: VecDeque::new(),
            dev_to_host: Vec::new(),
        },
        blk: 0,
        now: 0,
    };

    let init = UpgInit {
        accept: InitMode::PARTITION,
        timeouts: ModeTimeouts::default(),
    };
    let mut session: UartSession<ENGINE_BUF> =
        UartSession::new(&mut host.wire, init, 0).unwrap();
    session.dispatcher_mut().set_progress(print_progress);

    let (image, expanded) = build_sparse_image();
    let content_crc = CRC32.checksum(&expanded);

    let meta = FwcMeta {
        name: str_field("os"),
        partition: str_field("os"),
        offset: 0,
        size: image.len() as u32,
        crc: content_crc,
        ram: 0,
    };
    let mut meta_buf = [0u8; FWC_META_SIZE];
    meta.encode(&mut meta_buf);

    println!("selecting component ({} container bytes)", image.len());
    let (hdr, _) = host.exchange(
        &mut session,
        &mut dev,
        &command_bytes(Command::SetFwcMeta as u8, &meta_buf),
    );
    assert_eq!(hdr.status, Status::Ok);

    println!("streaming image");
    let (hdr, _) = host.exchange(
        &mut session,
        &mut dev,
        &command_bytes(Command::SendFwcData as u8, &image),
    );
    assert_eq!(hdr.status, Status::Ok);

    let (hdr, result) = host.exchange(
        &mut session,
        &mut dev,
        &command_bytes(Command::GetFwcBurnResult as u8, &[]),
    );
    assert_eq!(hdr.status, Status::Ok);
    let trans_size = u32::from_le_bytes(result[..4].try_into().unwrap());
    let partition_crc = u32::from_le_bytes(result[4..8].try_into().unwrap());
    println!("burn result: {trans_size} bytes consumed, crc {partition_crc:#010x}");

    let (hdr, _) = host.exchange(
        &mut session,
        &mut dev,
        &command_bytes(Command::SetUpgEnd as u8, &[]),
    );
    assert_eq!(hdr.status, Status::Ok);

    // cross-check the stored bytes against the expanded image,
    // skipping the DONT_CARE region
    let start = 4 * BLK;
    assert_eq!(
        &dev.data[start + 8 * BLK..start + 28 * BLK],
        &expanded[8 * BLK..]
    );
    println!("partition content verified, crc {content_crc:#010x}");
}
