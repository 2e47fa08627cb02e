// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! USB bulk transport state machine.
//!
//! Mass-storage style framing on a vendor bulk endpoint pair: a
//! 31-byte CBW opens every exchange, an optional data phase follows in
//! the direction the CBW names, and a 13-byte CSW echoing the CBW tag
//! closes it. The machine is poll-driven and resumable; a CBW or data
//! phase split across many endpoint reads is accumulated across polls.
//!
//! Data phases larger than the staging buffer are moved in staging
//! sized chunks, each forwarded to the [`DataPort`] as it completes,
//! so the transport never needs a buffer sized for the whole transfer.

use upg_protocol::usb::{
    Cbw, Csw, CswStatus, CBW_SIZE, CSW_SIZE, TRANS_CMD_READ, TRANS_CMD_WRITE,
};

/// Bulk endpoint pair supplied by the USB device driver. Both calls
/// are non-blocking; `read` drains the OUT endpoint, `write` queues on
/// the IN endpoint.
pub trait UsbChannel {
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn write(&mut self, buf: &[u8]) -> usize;
}

/// Consumer of the transport's data phases, normally the command
/// dispatcher. `packet_read` returning fewer bytes than `buf` holds
/// means the device has nothing more to say for this exchange.
pub trait DataPort {
    fn packet_write(&mut self, data: &[u8]) -> usize;
    fn packet_read(&mut self, buf: &mut [u8]) -> usize;
}

/// There are no separate buffer-fill and buffer-flush stages: each
/// data stage loops endpoint to staging buffer to port (or back) one
/// chunk at a time until `remaining` hits zero, then moves to the CSW.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    ReadCbw,
    DataOut,
    DataIn,
    SendCsw,
}

/// `P` sizes the staging buffer, the largest single chunk moved per
/// poll step.
pub struct UsbTransport<const P: usize> {
    stage: Stage,
    buf: [u8; P],
    cbw_buf: [u8; CBW_SIZE],
    cbw_fill: usize,
    tag: u32,
    remaining: usize,
    residue: u32,
    status: CswStatus,
}

impl<const P: usize> Default for UsbTransport<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const P: usize> UsbTransport<P> {
    pub fn new() -> Self {
        Self {
            stage: Stage::ReadCbw,
            buf: [0; P],
            cbw_buf: [0; CBW_SIZE],
            cbw_fill: 0,
            tag: 0,
            remaining: 0,
            residue: 0,
            status: CswStatus::Passed,
        }
    }

    /// Drive the transport; call whenever endpoint activity is
    /// possible.
    pub fn poll<C: UsbChannel, D: DataPort>(&mut self, chan: &mut C, port: &mut D) {
        while self.step(chan, port) {}
    }

    /// One unit of progress; false when blocked on the endpoints.
    fn step<C: UsbChannel, D: DataPort>(&mut self, chan: &mut C, port: &mut D) -> bool {
        match self.stage {
            Stage::ReadCbw => self.read_cbw(chan),
            Stage::DataOut => self.data_out(chan, port),
            Stage::DataIn => self.data_in(chan, port),
            Stage::SendCsw => self.send_csw(chan),
        }
    }

    fn read_cbw<C: UsbChannel>(&mut self, chan: &mut C) -> bool {
        let got = chan.read(&mut self.cbw_buf[self.cbw_fill..]);
        if got == 0 {
            return false;
        }
        self.cbw_fill += got;
        if self.cbw_fill < CBW_SIZE {
            return false;
        }
        self.cbw_fill = 0;

        let cbw = match Cbw::parse(&self.cbw_buf) {
            Ok(cbw) => cbw,
            Err(_) => {
                // host and device are out of step; answer with a phase
                // error so the host resets the transport
                error!("bad CBW signature");
                self.tag = u32::from_le_bytes([
                    self.cbw_buf[4],
                    self.cbw_buf[5],
                    self.cbw_buf[6],
                    self.cbw_buf[7],
                ]);
                self.residue = 0;
                self.status = CswStatus::PhaseError;
                self.stage = Stage::SendCsw;
                return true;
            }
        };

        self.tag = cbw.tag;
        self.remaining = cbw.data_transfer_length as usize;
        self.residue = cbw.data_transfer_length;
        self.status = CswStatus::Passed;

        let write_ok = !cbw.is_dir_in() && cbw.cb_length != 0 && cbw.command == TRANS_CMD_WRITE;
        let read_ok = cbw.is_dir_in() && cbw.command == TRANS_CMD_READ;
        if !write_ok && !read_ok {
            warn!("unsupported CBW: cmd {} flags {}", cbw.command, cbw.flags);
            self.status = CswStatus::Failed;
            self.stage = Stage::SendCsw;
            return true;
        }

        if self.remaining == 0 {
            self.stage = Stage::SendCsw;
        } else if cbw.is_dir_in() {
            self.stage = Stage::DataIn;
        } else {
            self.stage = Stage::DataOut;
        }
        true
    }

    fn data_out<C: UsbChannel, D: DataPort>(&mut self, chan: &mut C, port: &mut D) -> bool {
        let chunk = core::cmp::min(self.remaining, P);
        let got = chan.read(&mut self.buf[..chunk]);
        if got == 0 {
            return false;
        }
        port.packet_write(&self.buf[..got]);
        self.remaining -= got;
        self.residue -= got as u32;
        if self.remaining == 0 {
            self.stage = Stage::SendCsw;
        }
        true
    }

    fn data_in<C: UsbChannel, D: DataPort>(&mut self, chan: &mut C, port: &mut D) -> bool {
        let chunk = core::cmp::min(self.remaining, P);
        let got = port.packet_read(&mut self.buf[..chunk]);
        if got > 0 {
            chan.write(&self.buf[..got]);
            self.remaining -= got;
            self.residue -= got as u32;
        }
        if got < chunk {
            // device has less than the host asked for; truncate the
            // phase and report the mismatch
            warn!("IN phase under-run, {} bytes short", self.remaining);
            self.status = CswStatus::PhaseError;
            self.remaining = 0;
        }
        if self.remaining == 0 {
            self.stage = Stage::SendCsw;
        }
        true
    }

    fn send_csw<C: UsbChannel>(&mut self, chan: &mut C) -> bool {
        let csw = Csw {
            tag: self.tag,
            data_residue: self.residue,
            status: self.status,
        };
        let mut out = [0u8; CSW_SIZE];
        csw.encode(&mut out);
        chan.write(&out);
        self.stage = Stage::ReadCbw;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;
    use upg_protocol::usb::CBW_FLAG_DIR_IN;

    struct MockChannel {
        out_ep: VecDeque<u8>,
        in_ep: Vec<u8>,
    }

    impl MockChannel {
        fn new() -> Self {
            Self { out_ep: VecDeque::new(), in_ep: Vec::new() }
        }

        fn host_sends(&mut self, bytes: &[u8]) {
            self.out_ep.extend(bytes);
        }

        fn host_cbw(&mut self, tag: u32, len: u32, flags: u8, command: u8) {
            let cbw = Cbw {
                tag,
                data_transfer_length: len,
                flags,
                lun: 0,
                cb_length: 1,
                command,
            };
            let mut buf = [0u8; CBW_SIZE];
            cbw.encode(&mut buf);
            self.host_sends(&buf);
        }

        /// CSW at the tail of the IN endpoint stream.
        fn last_csw(&self) -> Csw {
            Csw::parse(&self.in_ep[self.in_ep.len() - CSW_SIZE..]).unwrap()
        }
    }

    impl UsbChannel for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let mut n = 0;
            while n < buf.len() {
                match self.out_ep.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        }

        fn write(&mut self, buf: &[u8]) -> usize {
            self.in_ep.extend_from_slice(buf);
            buf.len()
        }
    }

    struct MockPort {
        written: Vec<u8>,
        writes: usize,
        to_send: Vec<u8>,
        sent: usize,
    }

    impl MockPort {
        fn new() -> Self {
            Self { written: Vec::new(), writes: 0, to_send: Vec::new(), sent: 0 }
        }
    }

    impl DataPort for MockPort {
        fn packet_write(&mut self, data: &[u8]) -> usize {
            self.written.extend_from_slice(data);
            self.writes += 1;
            data.len()
        }

        fn packet_read(&mut self, buf: &mut [u8]) -> usize {
            let avail = self.to_send.len() - self.sent;
            let n = core::cmp::min(avail, buf.len());
            buf[..n].copy_from_slice(&self.to_send[self.sent..self.sent + n]);
            self.sent += n;
            n
        }
    }

    #[test]
    fn write_exchange_passes() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        chan.host_cbw(0xAABB_CCDD, 8, 0, TRANS_CMD_WRITE);
        chan.host_sends(b"\x01\x02\x03\x04\x05\x06\x07\x08");
        usb.poll(&mut chan, &mut port);

        assert_eq!(port.written, b"\x01\x02\x03\x04\x05\x06\x07\x08");
        let csw = chan.last_csw();
        assert_eq!(csw.tag, 0xAABB_CCDD);
        assert_eq!(csw.data_residue, 0);
        assert_eq!(csw.status, CswStatus::Passed);
    }

    #[test]
    fn large_write_moves_in_staging_chunks() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<16> = UsbTransport::new();

        let data: Vec<u8> = (0..40u8).collect();
        chan.host_cbw(7, 40, 0, TRANS_CMD_WRITE);
        chan.host_sends(&data);
        usb.poll(&mut chan, &mut port);

        assert_eq!(port.written, data);
        assert_eq!(port.writes, 3);
        assert_eq!(chan.last_csw().status, CswStatus::Passed);
    }

    #[test]
    fn zero_length_exchange_answers_directly() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        chan.host_cbw(42, 0, 0, TRANS_CMD_WRITE);
        usb.poll(&mut chan, &mut port);

        assert!(port.written.is_empty());
        let csw = chan.last_csw();
        assert_eq!(csw.tag, 42);
        assert_eq!(csw.status, CswStatus::Passed);
    }

    #[test]
    fn read_exchange_returns_staged_data() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        port.to_send = (0..40u8).collect();
        chan.host_cbw(9, 40, CBW_FLAG_DIR_IN, TRANS_CMD_READ);
        usb.poll(&mut chan, &mut port);

        assert_eq!(&chan.in_ep[..40], &port.to_send[..]);
        let csw = chan.last_csw();
        assert_eq!(csw.data_residue, 0);
        assert_eq!(csw.status, CswStatus::Passed);
    }

    #[test]
    fn read_under_run_truncates_with_phase_error() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        port.to_send = (0..40u8).collect();
        chan.host_cbw(3, 100, CBW_FLAG_DIR_IN, TRANS_CMD_READ);
        usb.poll(&mut chan, &mut port);

        assert_eq!(&chan.in_ep[..40], &port.to_send[..]);
        let csw = chan.last_csw();
        assert_eq!(csw.tag, 3);
        assert_eq!(csw.data_residue, 60);
        assert_eq!(csw.status, CswStatus::PhaseError);
    }

    #[test]
    fn bad_signature_answers_phase_error() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        let mut buf = [0u8; CBW_SIZE];
        Cbw {
            tag: 0x1111_2222,
            data_transfer_length: 64,
            flags: 0,
            lun: 0,
            cb_length: 1,
            command: TRANS_CMD_WRITE,
        }
        .encode(&mut buf);
        buf[0] = b'X';
        chan.host_sends(&buf);
        usb.poll(&mut chan, &mut port);

        let csw = chan.last_csw();
        assert_eq!(csw.tag, 0x1111_2222);
        assert_eq!(csw.status, CswStatus::PhaseError);
    }

    #[test]
    fn split_cbw_is_accumulated() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        let cbw = Cbw {
            tag: 5,
            data_transfer_length: 4,
            flags: 0,
            lun: 0,
            cb_length: 1,
            command: TRANS_CMD_WRITE,
        };
        let mut buf = [0u8; CBW_SIZE];
        cbw.encode(&mut buf);

        chan.host_sends(&buf[..10]);
        usb.poll(&mut chan, &mut port);
        assert!(chan.in_ep.is_empty());

        chan.host_sends(&buf[10..]);
        chan.host_sends(b"abcd");
        usb.poll(&mut chan, &mut port);
        assert_eq!(port.written, b"abcd");
        assert_eq!(chan.last_csw().status, CswStatus::Passed);
    }

    #[test]
    fn unknown_command_fails_exchange() {
        let mut chan = MockChannel::new();
        let mut port = MockPort::new();
        let mut usb: UsbTransport<64> = UsbTransport::new();

        chan.host_cbw(11, 0, 0, 0x77);
        usb.poll(&mut chan, &mut port);
        let csw = chan.last_csw();
        assert_eq!(csw.tag, 11);
        assert_eq!(csw.status, CswStatus::Failed);
    }
}
