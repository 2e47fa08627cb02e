// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport-agnostic command dispatcher.
//!
//! Both transports deliver command bytes through the same pair of
//! calls: [`CommandDispatcher::data_packet_write`] feeds inbound bytes
//! (header first, payload after) and [`CommandDispatcher::data_packet_read`]
//! drains the staged response. The dispatcher accumulates exactly one
//! 20-byte command header, then the declared payload, executes, and
//! stages one response. `SEND_FWC_DATA` payload is never buffered
//! whole; it streams straight into the open [`WriterSession`] in
//! whatever slices the transport happens to deliver.
//!
//! The dispatcher is also the single owner of the session's upgrade
//! mode. Sessions that require an explicit mode selection by the host
//! (user-id burn, forced image burn) poll [`CommandDispatcher::check_upg_mode`]
//! until the host either sets an acceptable mode or the window runs
//! out.

use bitflags::bitflags;
use heapless::Vec;
use upg_protocol::command::{
    Command, CommandHeader, HeaderError, ResponseHeader, Status, HEADER_SIZE,
};
use upg_protocol::image::{FwcMeta, FWC_META_SIZE};

use crate::blockdev::BlockDevice;
use crate::usb::DataPort;
use crate::writer::{BurnResult, WriteError, WriterSession};

/// Staged response capacity: one header plus the largest response
/// payload (burn result).
const RESPONSE_MAX: usize = HEADER_SIZE + 12;

/// Upgrade mode selected by the host for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UpgradeMode {
    FullDiskUpgrade = 0,
    PartitionUpgrade = 1,
    BurnUserId = 2,
    DumpPartition = 3,
    BurnImgForce = 4,
    BurnFrozen = 5,
    Invalid = 0xFF,
}

impl UpgradeMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::FullDiskUpgrade,
            1 => Self::PartitionUpgrade,
            2 => Self::BurnUserId,
            3 => Self::DumpPartition,
            4 => Self::BurnImgForce,
            5 => Self::BurnFrozen,
            _ => return None,
        })
    }

    /// The acceptance bit corresponding to this mode.
    pub fn mask(self) -> InitMode {
        match self {
            Self::FullDiskUpgrade => InitMode::FULL_DISK,
            Self::PartitionUpgrade => InitMode::PARTITION,
            Self::BurnUserId => InitMode::BURN_USER_ID,
            Self::DumpPartition => InitMode::DUMP_PARTITION,
            Self::BurnImgForce => InitMode::BURN_IMG_FORCE,
            Self::BurnFrozen => InitMode::BURN_FROZEN,
            Self::Invalid => InitMode::empty(),
        }
    }
}

bitflags! {
    /// Modes acceptable during the current session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitMode: u32 {
        const FULL_DISK = 1 << 0;
        const PARTITION = 1 << 1;
        const BURN_USER_ID = 1 << 2;
        const DUMP_PARTITION = 1 << 3;
        const BURN_IMG_FORCE = 1 << 4;
        const BURN_FROZEN = 1 << 5;
    }
}

/// How long the host gets to select each gated mode.
#[derive(Debug, Clone, Copy)]
pub struct ModeTimeouts {
    pub burn_user_id_us: u64,
    pub burn_img_force_us: u64,
}

impl Default for ModeTimeouts {
    fn default() -> Self {
        Self {
            burn_user_id_us: 2_000_000,
            burn_img_force_us: 4_000_000,
        }
    }
}

/// Session construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct UpgInit {
    pub accept: InitMode,
    pub timeouts: ModeTimeouts,
}

/// Outcome of one mode-window poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeCheck {
    /// Window still open, no acceptable mode selected yet.
    Waiting,
    /// Host selected an acceptable mode; the window has been re-armed.
    Ok,
    /// Window elapsed; exit the upgrade and resume normal boot.
    Timeout,
}

enum RecvState {
    Header,
    Payload,
}

pub struct CommandDispatcher {
    init: UpgInit,
    mode: UpgradeMode,
    /// Set by SET_UPG_CFG, consumed by `check_upg_mode`.
    mode_fresh: bool,
    mode_deadline: u64,

    state: RecvState,
    hdr_buf: [u8; HEADER_SIZE],
    hdr_fill: usize,
    /// Command being received, None for a payload that is drained and
    /// dropped (unknown code, oversized payload).
    cmd: Option<Command>,
    cmd_code: u8,
    payload_need: usize,
    payload_got: usize,
    payload: [u8; FWC_META_SIZE],

    writer: Option<WriterSession>,
    fwc_size: u32,
    result: Option<BurnResult>,
    /// First failure seen while streaming SEND_FWC_DATA payload;
    /// reported when the payload completes.
    stream_error: Option<Status>,

    response: Vec<u8, RESPONSE_MAX>,
    response_pos: usize,

    progress: Option<fn(u8)>,
}

impl CommandDispatcher {
    pub fn new(init: UpgInit, now_us: u64) -> Self {
        let mut disp = Self {
            init,
            mode: UpgradeMode::Invalid,
            mode_fresh: false,
            mode_deadline: 0,
            state: RecvState::Header,
            hdr_buf: [0; HEADER_SIZE],
            hdr_fill: 0,
            cmd: None,
            cmd_code: 0,
            payload_need: 0,
            payload_got: 0,
            payload: [0; FWC_META_SIZE],
            writer: None,
            fwc_size: 0,
            result: None,
            stream_error: None,
            response: Vec::new(),
            response_pos: 0,
            progress: None,
        };
        if let Some(window) = disp.mode_window() {
            disp.mode_deadline = now_us + window;
        }
        disp
    }

    /// Register a percentage callback fired as component data is
    /// consumed.
    pub fn set_progress(&mut self, cb: fn(u8)) {
        self.progress = Some(cb);
    }

    pub fn mode(&self) -> UpgradeMode {
        self.mode
    }

    /// Shortest window among the gated modes this session accepts.
    fn mode_window(&self) -> Option<u64> {
        let mut window = None;
        if self.init.accept.contains(InitMode::BURN_USER_ID) {
            window = Some(self.init.timeouts.burn_user_id_us);
        }
        if self.init.accept.contains(InitMode::BURN_IMG_FORCE) {
            let t = self.init.timeouts.burn_img_force_us;
            window = Some(match window {
                Some(w) if w < t => w,
                _ => t,
            });
        }
        window
    }

    /// Poll the mode-selection window. Sessions without a gated mode
    /// always report Ok. A successful check re-arms the window so a
    /// long-running session is not aborted mid-burn.
    pub fn check_upg_mode(&mut self, now_us: u64) -> ModeCheck {
        let Some(window) = self.mode_window() else {
            return ModeCheck::Ok;
        };
        if self.mode_fresh {
            self.mode_fresh = false;
            self.mode_deadline = now_us + window;
            return ModeCheck::Ok;
        }
        if now_us > self.mode_deadline {
            warn!("no upgrade mode set within the window");
            ModeCheck::Timeout
        } else {
            ModeCheck::Waiting
        }
    }

    /// Feed inbound command bytes in arbitrary slices. Consumes the
    /// whole slice; a complete command stages its response for
    /// [`Self::data_packet_read`].
    pub fn data_packet_write<D: BlockDevice>(&mut self, dev: &mut D, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match self.state {
                RecvState::Header => {
                    let n = core::cmp::min(HEADER_SIZE - self.hdr_fill, bytes.len());
                    self.hdr_buf[self.hdr_fill..self.hdr_fill + n].copy_from_slice(&bytes[..n]);
                    self.hdr_fill += n;
                    bytes = &bytes[n..];
                    if self.hdr_fill == HEADER_SIZE {
                        self.hdr_fill = 0;
                        self.begin_command();
                        self.state = RecvState::Payload;
                        if self.payload_got == self.payload_need {
                            self.finish_command(dev);
                        }
                    }
                }
                RecvState::Payload => {
                    let n = core::cmp::min(self.payload_need - self.payload_got, bytes.len());
                    self.feed_payload(dev, &bytes[..n]);
                    bytes = &bytes[n..];
                    if self.payload_got == self.payload_need {
                        self.finish_command(dev);
                    }
                }
            }
        }
    }

    /// Drain the staged response. Returns the number of bytes copied;
    /// zero when nothing is staged.
    pub fn data_packet_read(&mut self, buf: &mut [u8]) -> usize {
        let rest = self.response.len() - self.response_pos;
        let n = core::cmp::min(rest, buf.len());
        buf[..n].copy_from_slice(&self.response[self.response_pos..self.response_pos + n]);
        self.response_pos += n;
        if self.response_pos == self.response.len() {
            self.response.clear();
            self.response_pos = 0;
        }
        n
    }

    /// A full header is in `hdr_buf`; validate it and set up the
    /// payload phase.
    fn begin_command(&mut self) {
        self.cmd = None;
        self.cmd_code = self.hdr_buf[6];
        self.payload_got = 0;
        self.stream_error = None;

        let hdr = match CommandHeader::parse(&self.hdr_buf) {
            Ok(hdr) => hdr,
            Err(err) => {
                // A checksum miss still carries a usable length field;
                // honor it so the declared payload drains instead of
                // being re-parsed as headers. A bad magic means the
                // stream is not a command at all, so nothing follows.
                warn!("command header rejected");
                self.payload_need = if matches!(err, HeaderError::BadChecksum) {
                    let mut len = [0u8; 4];
                    len.copy_from_slice(&self.hdr_buf[8..12]);
                    u32::from_le_bytes(len) as usize
                } else {
                    0
                };
                self.stream_error = Some(match err {
                    HeaderError::BadChecksum => Status::BadChecksum,
                    _ => Status::Failed,
                });
                return;
            }
        };

        self.payload_need = hdr.data_length as usize;
        match Command::from_u8(hdr.command) {
            Some(cmd) => {
                // only the data stream may exceed the scratch buffer
                if cmd != Command::SendFwcData && self.payload_need > self.payload.len() {
                    self.stream_error = Some(Status::LengthMismatch);
                } else {
                    self.cmd = Some(cmd);
                }
            }
            None => {
                warn!("unknown command {:#04x}", hdr.command);
                self.stream_error = Some(Status::InvalidCommand);
            }
        }
    }

    fn feed_payload<D: BlockDevice>(&mut self, dev: &mut D, bytes: &[u8]) {
        match self.cmd {
            Some(Command::SendFwcData) => {
                if self.stream_error.is_none() {
                    self.write_fwc_data(dev, bytes);
                }
            }
            Some(_) => {
                self.payload[self.payload_got..self.payload_got + bytes.len()]
                    .copy_from_slice(bytes);
            }
            // drained and dropped
            None => {}
        }
        self.payload_got += bytes.len();
    }

    /// Stream a slice of SEND_FWC_DATA payload into the open writer,
    /// finalizing the component once all declared bytes have arrived.
    fn write_fwc_data<D: BlockDevice>(&mut self, dev: &mut D, bytes: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            self.stream_error = Some(Status::NotAllowed);
            return;
        };
        if let Err(err) = writer.write(dev, bytes) {
            error!("component write failed");
            self.stream_error = Some(write_status(err));
            return;
        }
        let done = writer.trans_size();
        if self.fwc_size != 0 {
            if let Some(cb) = self.progress {
                cb((u64::from(done) * 100 / u64::from(self.fwc_size)).min(100) as u8);
            }
        }
        if done >= self.fwc_size {
            self.end_component(dev);
        }
    }

    /// Close the open writer and keep its outcome for the CRC and
    /// burn-result queries.
    fn end_component<D: BlockDevice>(&mut self, dev: &mut D) {
        if let Some(writer) = self.writer.take() {
            match writer.end(dev) {
                Ok(result) => {
                    info!(
                        "component burned: {} bytes, crc {:#010x}",
                        result.trans_size, result.partition_crc
                    );
                    self.result = Some(result);
                }
                Err(err) => {
                    error!("component finalize failed");
                    self.stream_error = Some(write_status(err));
                }
            }
        }
    }

    /// Payload complete (possibly zero-length): execute and stage the
    /// response. Commands that need storage go through `finish_command`.
    fn finish_command_nodev(&mut self) {
        self.state = RecvState::Header;
        let code = self.cmd_code;
        if let Some(status) = self.stream_error.take() {
            self.stage_response(code, status, &[]);
            return;
        }
        match self.cmd {
            Some(Command::SetUpgCfg) => self.exec_set_upg_cfg(),
            Some(Command::GetUpgCfg) => {
                let mode = self.mode as u8;
                self.stage_response(code, Status::Ok, &u32::from(mode).to_le_bytes());
            }
            Some(Command::GetFwcCrc) => match self.result {
                Some(res) => {
                    self.stage_response(code, Status::Ok, &res.trans_crc.to_le_bytes());
                }
                None => self.stage_response(code, Status::Failed, &[]),
            },
            Some(Command::GetFwcBurnResult) => match self.result {
                Some(res) => {
                    let mut out = [0u8; 12];
                    out[..4].copy_from_slice(&res.trans_size.to_le_bytes());
                    out[4..8].copy_from_slice(&res.partition_crc.to_le_bytes());
                    out[8..].copy_from_slice(&res.trans_crc.to_le_bytes());
                    self.stage_response(code, Status::Ok, &out);
                }
                None => self.stage_response(code, Status::Failed, &[]),
            },
            Some(Command::SendFwcData) => {
                self.stage_response(code, Status::Ok, &[]);
            }
            // SET_FWC_META and SET_UPG_END are handled with the device
            Some(Command::SetFwcMeta) | Some(Command::SetUpgEnd) | None => {
                self.stage_response(code, Status::Failed, &[]);
            }
        }
    }

    fn finish_command(&mut self, dev: &mut impl BlockDevice) {
        match self.cmd {
            Some(Command::SetFwcMeta) if self.stream_error.is_none() => {
                self.state = RecvState::Header;
                self.exec_set_fwc_meta(dev);
            }
            Some(Command::SetUpgEnd) if self.stream_error.is_none() => {
                self.state = RecvState::Header;
                self.exec_set_upg_end(dev);
            }
            _ => self.finish_command_nodev(),
        }
    }

    fn exec_set_upg_cfg(&mut self) {
        let code = self.cmd_code;
        if self.payload_got != 4 {
            self.stage_response(code, Status::LengthMismatch, &[]);
            return;
        }
        let raw = u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        let mode = u8::try_from(raw).ok().and_then(UpgradeMode::from_u8);
        match mode {
            Some(mode) if self.init.accept.contains(mode.mask()) => {
                info!("upgrade mode set: {}", mode as u8);
                self.mode = mode;
                self.mode_fresh = true;
                self.stage_response(code, Status::Ok, &[]);
            }
            _ => {
                warn!("mode {} not acceptable this session", raw);
                self.stage_response(code, Status::NotAllowed, &[]);
            }
        }
    }

    fn exec_set_fwc_meta(&mut self, dev: &mut impl BlockDevice) {
        let code = self.cmd_code;
        if self.payload_got != FWC_META_SIZE {
            self.stage_response(code, Status::LengthMismatch, &[]);
            return;
        }
        if self.writer.is_some() {
            warn!("component already open");
            self.stage_response(code, Status::Busy, &[]);
            return;
        }
        let meta = match FwcMeta::parse(&self.payload[..FWC_META_SIZE]) {
            Ok(meta) => meta,
            Err(_) => {
                self.stage_response(code, Status::Failed, &[]);
                return;
            }
        };
        match WriterSession::new(dev, meta) {
            Ok(writer) => {
                self.fwc_size = meta.size;
                self.result = None;
                self.writer = Some(writer);
                self.stage_response(code, Status::Ok, &[]);
            }
            Err(err) => {
                error!("component meta rejected");
                self.stage_response(code, write_status(err), &[]);
            }
        }
    }

    fn exec_set_upg_end(&mut self, dev: &mut impl BlockDevice) {
        let code = self.cmd_code;
        // flush a component the host closed short
        self.end_component(dev);
        let status = self.stream_error.take().unwrap_or(Status::Ok);
        self.mode = UpgradeMode::Invalid;
        self.stage_response(code, status, &[]);
    }

    fn stage_response(&mut self, command: u8, status: Status, payload: &[u8]) {
        if !self.response.is_empty() {
            warn!("staged response overwritten");
            self.response.clear();
            self.response_pos = 0;
        }
        let hdr = ResponseHeader::new(command, status, payload.len() as u32);
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        // capacity covers header + largest payload
        let _ = self.response.extend_from_slice(&buf);
        let _ = self.response.extend_from_slice(payload);
    }
}

fn write_status(err: WriteError) -> Status {
    match err {
        WriteError::NoPartition => Status::NoPartition,
        WriteError::OutOfBounds => Status::OutOfBounds,
        _ => Status::Failed,
    }
}

/// Adapter binding a dispatcher and its block device to the USB
/// transport's data port.
pub struct UsbPort<'a, D: BlockDevice> {
    pub dispatcher: &'a mut CommandDispatcher,
    pub dev: &'a mut D,
}

impl<D: BlockDevice> DataPort for UsbPort<'_, D> {
    fn packet_write(&mut self, data: &[u8]) -> usize {
        self.dispatcher.data_packet_write(self.dev, data);
        data.len()
    }

    fn packet_read(&mut self, buf: &mut [u8]) -> usize {
        self.dispatcher.data_packet_read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::testdev::{MemDevice, BLK};
    use crc::{Crc, CRC_32_ISO_HDLC};
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::vec::Vec as StdVec;
    use upg_protocol::image::str_field;

    const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    fn open_init() -> UpgInit {
        UpgInit {
            accept: InitMode::FULL_DISK | InitMode::PARTITION,
            timeouts: ModeTimeouts::default(),
        }
    }

    fn command_bytes(code: u8, payload: &[u8]) -> StdVec<u8> {
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

    fn meta_bytes(partition: &str, size: u32, crc: u32) -> StdVec<u8> {
        let meta = FwcMeta {
            name: str_field("os"),
            partition: str_field(partition),
            offset: 0,
            size,
            crc,
            ram: 0,
        };
        let mut buf = [0u8; FWC_META_SIZE];
        meta.encode(&mut buf);
        buf.to_vec()
    }

    fn response(disp: &mut CommandDispatcher) -> (ResponseHeader, StdVec<u8>) {
        let mut buf = [0u8; 64];
        let n = disp.data_packet_read(&mut buf);
        assert!(n >= HEADER_SIZE, "no response staged");
        let hdr = ResponseHeader::parse(&buf[..n]).unwrap();
        assert_eq!(n, HEADER_SIZE + hdr.data_length as usize);
        (hdr, buf[HEADER_SIZE..n].to_vec())
    }

    static LAST_PERCENT: AtomicU8 = AtomicU8::new(0);

    fn record_percent(p: u8) {
        LAST_PERCENT.store(p, Ordering::Relaxed);
    }

    #[test]
    fn full_component_exchange() {
        let mut dev = MemDevice::new(64).with_partition("os", 0, 32);
        let mut disp = CommandDispatcher::new(open_init(), 0);
        disp.set_progress(record_percent);

        let mut data = vec![0u8; 3 * BLK + 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 241) as u8;
        }
        let crc = CRC32.checksum(&data);

        disp.data_packet_write(
            &mut dev,
            &command_bytes(Command::SetFwcMeta as u8, &meta_bytes("os", data.len() as u32, crc)),
        );
        let (hdr, _) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(hdr.command, Command::SetFwcMeta as u8);

        disp.data_packet_write(&mut dev, &command_bytes(Command::SendFwcData as u8, &data));
        let (hdr, _) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(LAST_PERCENT.load(Ordering::Relaxed), 100);

        // stored content is the data zero-padded to a block boundary
        assert_eq!(&dev.blocks(0, 3)[..], &data[..3 * BLK]);
        assert_eq!(&dev.blocks(3, 1)[..100], &data[3 * BLK..]);
        assert!(dev.blocks(3, 1)[100..].iter().all(|&b| b == 0));

        disp.data_packet_write(&mut dev, &command_bytes(Command::GetFwcCrc as u8, &[]));
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(payload, crc.to_le_bytes());

        disp.data_packet_write(&mut dev, &command_bytes(Command::GetFwcBurnResult as u8, &[]));
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(payload[..4], (data.len() as u32).to_le_bytes()[..]);
        assert_eq!(payload[4..8], crc.to_le_bytes()[..]);
        assert_eq!(payload[8..], crc.to_le_bytes()[..]);

        disp.data_packet_write(&mut dev, &command_bytes(Command::SetUpgEnd as u8, &[]));
        let (hdr, _) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
    }

    #[test]
    fn byte_at_a_time_stream_is_equivalent() {
        let mut data = vec![0u8; BLK + 37];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 199) as u8;
        }
        let crc = CRC32.checksum(&data);

        let mut stream = StdVec::new();
        stream.extend(command_bytes(
            Command::SetFwcMeta as u8,
            &meta_bytes("os", data.len() as u32, crc),
        ));
        stream.extend(command_bytes(Command::SendFwcData as u8, &data));

        let mut whole_dev = MemDevice::new(16).with_partition("os", 0, 8);
        let mut whole = CommandDispatcher::new(open_init(), 0);
        whole.data_packet_write(&mut whole_dev, &stream);

        let mut split_dev = MemDevice::new(16).with_partition("os", 0, 8);
        let mut split = CommandDispatcher::new(open_init(), 0);
        for b in &stream {
            split.data_packet_write(&mut split_dev, core::slice::from_ref(b));
        }

        assert_eq!(whole_dev.blocks(0, 8), split_dev.blocks(0, 8));
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        // both dispatchers staged the SEND_FWC_DATA response last
        let na = whole.data_packet_read(&mut a);
        let nb = split.data_packet_read(&mut b);
        assert_eq!(a[..na], b[..nb]);
    }

    #[test]
    fn second_meta_while_component_open_is_busy() {
        let mut dev = MemDevice::new(64).with_partition("os", 0, 32);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        let meta = meta_bytes("os", 4 * BLK as u32, 0);
        disp.data_packet_write(&mut dev, &command_bytes(Command::SetFwcMeta as u8, &meta));
        assert_eq!(response(&mut disp).0.status, Status::Ok);

        // component still short of its declared size
        disp.data_packet_write(
            &mut dev,
            &command_bytes(Command::SendFwcData as u8, &[0xAB; BLK]),
        );
        assert_eq!(response(&mut disp).0.status, Status::Ok);

        disp.data_packet_write(&mut dev, &command_bytes(Command::SetFwcMeta as u8, &meta));
        assert_eq!(response(&mut disp).0.status, Status::Busy);
    }

    #[test]
    fn unknown_command_is_answered_not_dropped() {
        let mut dev = MemDevice::new(8);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        disp.data_packet_write(&mut dev, &command_bytes(0x55, b"junk"));
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.command, 0x55);
        assert_eq!(hdr.status, Status::InvalidCommand);
        assert!(payload.is_empty());

        // stream stays in sync for the next command
        disp.data_packet_write(&mut dev, &command_bytes(Command::GetUpgCfg as u8, &[]));
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(payload, 0xFFu32.to_le_bytes());
    }

    #[test]
    fn corrupt_header_checksum_is_rejected() {
        let mut dev = MemDevice::new(8);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        let mut bytes = command_bytes(Command::GetUpgCfg as u8, &[]);
        bytes[16] ^= 0x01;
        disp.data_packet_write(&mut dev, &bytes);
        let (hdr, _) = response(&mut disp);
        assert_eq!(hdr.status, Status::BadChecksum);

        disp.data_packet_write(&mut dev, &command_bytes(Command::GetUpgCfg as u8, &[]));
        assert_eq!(response(&mut disp).0.status, Status::Ok);
    }

    #[test]
    fn corrupt_header_payload_is_drained() {
        // header and payload arrive in one slice, as a USB data phase
        // delivers them; the payload bytes must not be read as headers
        let mut dev = MemDevice::new(64).with_partition("os", 0, 32);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        let mut bytes =
            command_bytes(Command::SetFwcMeta as u8, &meta_bytes("os", 4096, 0));
        bytes[16] ^= 0x01;
        disp.data_packet_write(&mut dev, &bytes);
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.status, Status::BadChecksum);
        assert!(payload.is_empty());

        // no half-drained state left behind
        disp.data_packet_write(&mut dev, &command_bytes(Command::GetUpgCfg as u8, &[]));
        assert_eq!(response(&mut disp).0.status, Status::Ok);
    }

    #[test]
    fn no_partition_reported_on_meta() {
        let mut dev = MemDevice::new(8);
        let mut disp = CommandDispatcher::new(open_init(), 0);
        disp.data_packet_write(
            &mut dev,
            &command_bytes(Command::SetFwcMeta as u8, &meta_bytes("missing", 512, 0)),
        );
        assert_eq!(response(&mut disp).0.status, Status::NoPartition);
    }

    #[test]
    fn zero_length_data_is_a_no_op() {
        let mut dev = MemDevice::new(8).with_partition("os", 0, 4);
        let mut disp = CommandDispatcher::new(open_init(), 0);
        disp.data_packet_write(&mut dev, &command_bytes(Command::SendFwcData as u8, &[]));
        assert_eq!(response(&mut disp).0.status, Status::Ok);
        assert!(dev.ops.is_empty());
    }

    #[test]
    fn mode_window_times_out_and_rearms() {
        let init = UpgInit {
            accept: InitMode::BURN_USER_ID,
            timeouts: ModeTimeouts {
                burn_user_id_us: 2_000_000,
                burn_img_force_us: 4_000_000,
            },
        };
        let mut dev = MemDevice::new(8);
        let mut disp = CommandDispatcher::new(init, 0);

        assert_eq!(disp.check_upg_mode(1_000_000), ModeCheck::Waiting);

        let mode = (UpgradeMode::BurnUserId as u32).to_le_bytes();
        disp.data_packet_write(&mut dev, &command_bytes(Command::SetUpgCfg as u8, &mode));
        assert_eq!(response(&mut disp).0.status, Status::Ok);
        assert_eq!(disp.mode(), UpgradeMode::BurnUserId);

        // the window restarts from the successful check
        assert_eq!(disp.check_upg_mode(1_500_000), ModeCheck::Ok);
        assert_eq!(disp.check_upg_mode(3_000_000), ModeCheck::Waiting);
        assert_eq!(disp.check_upg_mode(4_000_000), ModeCheck::Timeout);
    }

    #[test]
    fn unacceptable_mode_is_refused() {
        let mut dev = MemDevice::new(8);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        let mode = (UpgradeMode::BurnUserId as u32).to_le_bytes();
        disp.data_packet_write(&mut dev, &command_bytes(Command::SetUpgCfg as u8, &mode));
        assert_eq!(response(&mut disp).0.status, Status::NotAllowed);
        assert_eq!(disp.mode(), UpgradeMode::Invalid);
    }

    #[test]
    fn upg_end_flushes_short_component() {
        let mut dev = MemDevice::new(8).with_partition("os", 0, 4);
        let mut disp = CommandDispatcher::new(open_init(), 0);

        disp.data_packet_write(
            &mut dev,
            &command_bytes(Command::SetFwcMeta as u8, &meta_bytes("os", 1000, 0)),
        );
        assert_eq!(response(&mut disp).0.status, Status::Ok);

        let data = [0x5Au8; 700];
        disp.data_packet_write(&mut dev, &command_bytes(Command::SendFwcData as u8, &data));
        assert_eq!(response(&mut disp).0.status, Status::Ok);

        disp.data_packet_write(&mut dev, &command_bytes(Command::SetUpgEnd as u8, &[]));
        assert_eq!(response(&mut disp).0.status, Status::Ok);

        // partial tail flushed zero-padded
        assert_eq!(&dev.blocks(1, 1)[..188], &data[..188]);
        assert!(dev.blocks(1, 1)[188..].iter().all(|&b| b == 0));

        disp.data_packet_write(&mut dev, &command_bytes(Command::GetFwcBurnResult as u8, &[]));
        let (hdr, payload) = response(&mut disp);
        assert_eq!(hdr.status, Status::Ok);
        assert_eq!(payload[..4], 700u32.to_le_bytes()[..]);
    }
}
