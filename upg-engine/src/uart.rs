// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! UART protocol engine.
//!
//! Reliable framed exchange over a raw serial link. The engine is
//! driven from interrupt or timer context through [`UartEngine::poll`];
//! it never blocks, and a frame that arrives split across many polls is
//! accumulated byte by byte in the engine's partial-frame state.
//!
//! One task is active at a time: either the host sends data to the
//! device (`start_read`) or the device sends data to the host
//! (`start_write`). Completion is signaled through the event queue so
//! nothing heavy runs in the interrupt path.
//!
//! Outside of a frame, single control bytes steer the link: SIG_C is a
//! handshake ping (answered with ACK), DC1 announces the host will
//! send, DC2 announces the host wants to receive. On engine start a CAN
//! byte is transmitted to flush any framing state the host may have
//! kept across a device reset.

use heapless::Deque;
use upg_protocol::frame::{
    self, FramePayload, ACK, CAN, DC1_SEND, DC2_RECV, LONG_DATA_LEN, MAX_FRAME_LEN, NAK,
    SHORT_DATA_MAX, SIG_C, SOH, STX,
};

/// Mid-frame silence before the frame is abandoned and NAKed.
const FRAME_WATCHDOG_US: u64 = 1_000_000;
/// Silence while waiting for ACK/NAK before the frame is replayed.
const ACK_TIMEOUT_US: u64 = 20_000;
/// Total host silence that aborts the session. The only fatal UART
/// condition; everything else is recoverable by retransmission.
const SESSION_TIMEOUT_US: u64 = 30_000_000;

/// Byte-level serial collaborator supplied by the UART driver. Both
/// calls are non-blocking and return how many bytes actually moved.
pub trait ByteIo {
    fn recv(&mut self, buf: &mut [u8]) -> usize;
    fn send(&mut self, buf: &[u8]) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartError {
    /// A task is already active.
    Busy,
    /// Requested transfer does not fit the engine's data buffer.
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartEvent {
    /// `start_read` satisfied; the bytes are in [`UartEngine::data`].
    RecvDone,
    /// `start_write` fully acknowledged by the host.
    SendDone,
    /// Host went silent; abort the upgrade and resume normal boot.
    SessionTimeout,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Host sends, device receives.
    HostSend,
    /// Host receives, device sends.
    HostRecv,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Between frames, interpreting single control bytes.
    CmdRecv,
    /// Accumulating one inbound frame.
    DataRecv,
    /// Emitting the next outbound frame slice.
    DataSend,
}

struct UartTask {
    dir: Direction,
    phase: Phase,
    len: usize,
    xfer: usize,
    /// Payload bytes of the frame in flight (send side), credited on
    /// ACK.
    slice: usize,
}

/// `N` sizes the task data buffer, the largest single `start_read` /
/// `start_write` transfer.
pub struct UartEngine<const N: usize> {
    task: Option<UartTask>,
    data: [u8; N],
    done_len: usize,
    frame: [u8; MAX_FRAME_LEN],
    /// Bytes of the current frame accumulated so far.
    frame_fill: usize,
    /// Total on-wire length of the current frame, 0 until learned from
    /// the header.
    frame_need: usize,
    recv_blk: u8,
    send_blk: u8,
    /// Set until the first accepted frame; any block number is accepted
    /// right after (re)connection.
    first_connect: bool,
    last_recv_us: u64,
    events: Deque<UartEvent, 4>,
    timed_out: bool,
}

impl<const N: usize> UartEngine<N> {
    pub fn new<IO: ByteIo>(io: &mut IO, now_us: u64) -> Self {
        // flush host-side framing state left over from a reset
        io.send(&[CAN]);
        Self {
            task: None,
            data: [0; N],
            done_len: 0,
            frame: [0; MAX_FRAME_LEN],
            frame_fill: 0,
            frame_need: 0,
            recv_blk: 0,
            send_blk: 1,
            first_connect: true,
            last_recv_us: now_us,
            events: Deque::new(),
            timed_out: false,
        }
    }

    /// Enqueue a receive of exactly `len` bytes from the host.
    pub fn start_read(&mut self, len: usize) -> Result<(), UartError> {
        if self.task.is_some() {
            return Err(UartError::Busy);
        }
        if len > N {
            return Err(UartError::TooLong);
        }
        self.timed_out = false;
        self.task = Some(UartTask {
            dir: Direction::HostSend,
            phase: Phase::CmdRecv,
            len,
            xfer: 0,
            slice: 0,
        });
        Ok(())
    }

    /// Enqueue a send of `data` to the host.
    pub fn start_write(&mut self, data: &[u8]) -> Result<(), UartError> {
        if self.task.is_some() {
            return Err(UartError::Busy);
        }
        if data.len() > N {
            return Err(UartError::TooLong);
        }
        self.data[..data.len()].copy_from_slice(data);
        self.timed_out = false;
        self.task = Some(UartTask {
            dir: Direction::HostRecv,
            phase: Phase::CmdRecv,
            len: data.len(),
            xfer: 0,
            slice: 0,
        });
        Ok(())
    }

    /// Bytes of the last completed `start_read`.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.done_len]
    }

    pub fn idle(&self) -> bool {
        self.task.is_none()
    }

    pub fn take_event(&mut self) -> Option<UartEvent> {
        self.events.pop_front()
    }

    /// Drive the engine. Call at a fixed short interval and whenever
    /// bytes may be available; `now_us` feeds the retransmission and
    /// watchdog timers.
    pub fn poll<IO: ByteIo>(&mut self, io: &mut IO, now_us: u64) {
        while self.step(io, now_us) {}

        if self.task.is_some()
            && !self.timed_out
            && now_us.saturating_sub(self.last_recv_us) > SESSION_TIMEOUT_US
        {
            error!("uart session timed out");
            self.timed_out = true;
            self.task = None;
            let _ = self.events.push_back(UartEvent::SessionTimeout);
        }
    }

    /// One unit of progress; false when blocked on I/O.
    fn step<IO: ByteIo>(&mut self, io: &mut IO, now_us: u64) -> bool {
        let (dir, phase) = match &self.task {
            Some(t) => (t.dir, t.phase),
            None => return false,
        };
        match (dir, phase) {
            (_, Phase::CmdRecv) => self.cmd_step(io, dir, now_us),
            (Direction::HostSend, Phase::DataRecv) => self.recv_step(io, now_us),
            (Direction::HostRecv, Phase::DataSend) => self.send_step(io),
            // direction switched mid-phase; fall back to command state
            _ => {
                if let Some(t) = self.task.as_mut() {
                    t.phase = Phase::CmdRecv;
                }
                true
            }
        }
    }

    /// Single control bytes between frames.
    fn cmd_step<IO: ByteIo>(&mut self, io: &mut IO, dir: Direction, now_us: u64) -> bool {
        let mut b = [0u8; 1];
        if io.recv(&mut b) == 0 {
            // send side: replay the frame if the ACK never came
            if dir == Direction::HostRecv
                && now_us.saturating_sub(self.last_recv_us) > ACK_TIMEOUT_US
            {
                debug!("ack timeout, replaying frame");
                self.last_recv_us = now_us;
                if let Some(t) = self.task.as_mut() {
                    t.phase = Phase::DataSend;
                }
                return true;
            }
            return false;
        }
        self.last_recv_us = now_us;

        match b[0] {
            SOH | STX if dir == Direction::HostSend => {
                self.frame[0] = b[0];
                self.frame_fill = 1;
                self.frame_need = 0;
                if let Some(t) = self.task.as_mut() {
                    t.phase = Phase::DataRecv;
                }
            }
            SIG_C => {
                io.send(&[ACK]);
                debug!("ack handshake ping");
            }
            DC1_SEND => {
                io.send(&[ACK]);
                self.reset_frame();
                if let Some(t) = self.task.as_mut() {
                    t.dir = Direction::HostSend;
                    t.phase = Phase::DataRecv;
                }
                debug!("host switched to send mode");
            }
            DC2_RECV => {
                io.send(&[ACK]);
                if let Some(t) = self.task.as_mut() {
                    t.dir = Direction::HostRecv;
                    t.phase = Phase::DataSend;
                }
                debug!("host switched to recv mode");
            }
            NAK if dir == Direction::HostRecv => {
                if let Some(t) = self.task.as_mut() {
                    t.phase = Phase::DataSend;
                }
            }
            ACK if dir == Direction::HostRecv => {
                let mut done = false;
                if let Some(t) = self.task.as_mut() {
                    t.xfer += t.slice;
                    t.phase = Phase::DataSend;
                    done = t.xfer >= t.len;
                }
                self.send_blk = self.send_blk.wrapping_add(1);
                if done {
                    self.task = None;
                    let _ = self.events.push_back(UartEvent::SendDone);
                }
            }
            _ => {}
        }
        true
    }

    /// Accumulate and finish one inbound frame.
    fn recv_step<IO: ByteIo>(&mut self, io: &mut IO, now_us: u64) -> bool {
        // learn the header one byte at a time
        while self.frame_fill < 4 {
            let mut b = [0u8; 1];
            if io.recv(&mut b) == 0 {
                return false;
            }
            self.last_recv_us = now_us;
            if self.frame_fill == 0 && b[0] != SOH && b[0] != STX {
                // noise between frames
                return true;
            }
            self.frame[self.frame_fill] = b[0];
            self.frame_fill += 1;
        }
        if self.frame_need == 0 {
            match frame::frame_len(self.frame[0], self.frame[3]) {
                Some(n) => self.frame_need = n,
                None => {
                    self.reset_frame();
                    return true;
                }
            }
        }

        let got = io.recv(&mut self.frame[self.frame_fill..self.frame_need]);
        if got > 0 {
            self.last_recv_us = now_us;
            self.frame_fill += got;
        }
        if self.frame_fill < self.frame_need {
            if now_us.saturating_sub(self.last_recv_us) > FRAME_WATCHDOG_US {
                warn!("long time no data, restarting frame");
                self.last_recv_us = now_us;
                self.reset_frame();
                io.send(&[NAK]);
            }
            return false;
        }

        match frame::read_frame_data(&self.frame[..self.frame_need]) {
            Ok(FramePayload { block, data }) => {
                let next = self.recv_blk.wrapping_add(1);
                if block != 1 && block != next && !self.first_connect {
                    warn!("block discontinuity: wanted {}, got {}", next, block);
                    self.reset_frame();
                    io.send(&[NAK]);
                    return true;
                }
                if block == self.recv_blk {
                    // retransmission of a frame already stored; ACK it
                    // without advancing anything
                    warn!("repeat frame {}", block);
                    self.reset_frame();
                    io.send(&[ACK]);
                    return true;
                }

                let mut done = false;
                if let Some(t) = self.task.as_mut() {
                    let n = core::cmp::min(data.len(), t.len - t.xfer);
                    self.data[t.xfer..t.xfer + n].copy_from_slice(&data[..n]);
                    t.xfer += n;
                    done = t.xfer >= t.len;
                }
                self.recv_blk = block;
                self.first_connect = false;
                self.reset_frame();
                io.send(&[ACK]);
                if done {
                    if let Some(t) = self.task.take() {
                        self.done_len = t.len;
                    }
                    let _ = self.events.push_back(UartEvent::RecvDone);
                }
            }
            Err(_) => {
                self.reset_frame();
                io.send(&[NAK]);
            }
        }
        true
    }

    /// Emit the next outbound frame slice, then wait for ACK/NAK.
    fn send_step<IO: ByteIo>(&mut self, io: &mut IO) -> bool {
        let (xfer, len) = match &self.task {
            Some(t) => (t.xfer, t.len),
            None => return false,
        };
        let rest = len - xfer;
        if rest > 0 {
            let slice = if rest > LONG_DATA_LEN {
                LONG_DATA_LEN
            } else if rest > SHORT_DATA_MAX {
                SHORT_DATA_MAX
            } else {
                rest
            };
            let flen = match frame::pack_frame(
                self.send_blk,
                &self.data[xfer..xfer + slice],
                &mut self.frame,
            ) {
                Ok(n) => n,
                Err(_) => return false,
            };
            io.send(&self.frame[..flen]);
            if let Some(t) = self.task.as_mut() {
                t.slice = slice;
            }
        }
        if let Some(t) = self.task.as_mut() {
            t.phase = Phase::CmdRecv;
        }
        true
    }

    fn reset_frame(&mut self) {
        self.frame_fill = 0;
        self.frame_need = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    struct MockIo {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl MockIo {
        fn new() -> Self {
            Self { rx: VecDeque::new(), tx: Vec::new() }
        }

        fn host_sends(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }

        fn host_frame(&mut self, block: u8, data: &[u8]) {
            let mut buf = [0u8; MAX_FRAME_LEN];
            let n = frame::pack_frame(block, data, &mut buf).unwrap();
            self.host_sends(&buf[..n]);
        }

        fn count(&self, byte: u8) -> usize {
            self.tx.iter().filter(|&&b| b == byte).count()
        }
    }

    impl ByteIo for MockIo {
        fn recv(&mut self, buf: &mut [u8]) -> usize {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
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
            self.tx.extend_from_slice(buf);
            buf.len()
        }
    }

    #[test]
    fn can_flushes_host_on_start() {
        let mut io = MockIo::new();
        let _eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        assert_eq!(io.tx, [CAN]);
    }

    #[test]
    fn handshake_ping_is_acked() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(4).unwrap();
        io.host_sends(&[SIG_C]);
        eng.poll(&mut io, 10);
        assert_eq!(io.tx, [CAN, ACK]);
        assert!(eng.take_event().is_none());
    }

    #[test]
    fn receives_transfer_split_over_frames() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<128> = UartEngine::new(&mut io, 0);
        eng.start_read(100).unwrap();

        let mut payload = [0u8; 100];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = i as u8;
        }

        io.host_sends(&[DC1_SEND]);
        io.host_frame(1, &payload[..61]);
        io.host_frame(2, &payload[61..]);
        eng.poll(&mut io, 100);

        assert_eq!(eng.take_event(), Some(UartEvent::RecvDone));
        assert_eq!(eng.data(), &payload);
        // DC1 plus both frames acknowledged
        assert_eq!(io.count(ACK), 3);
        assert!(eng.idle());
    }

    #[test]
    fn noise_between_frames_is_skipped() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(4).unwrap();
        io.host_sends(&[DC1_SEND, 0x00, 0xFF]);
        io.host_frame(1, b"abcd");
        eng.poll(&mut io, 100);
        assert_eq!(eng.take_event(), Some(UartEvent::RecvDone));
        assert_eq!(eng.data(), b"abcd");
    }

    #[test]
    fn repeat_frame_is_acked_but_not_stored() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(8).unwrap();

        io.host_sends(&[DC1_SEND]);
        io.host_frame(1, b"AAAA");
        eng.poll(&mut io, 100);
        // host missed the ACK and retransmits block 1
        io.host_frame(1, b"AAAA");
        io.host_frame(2, b"BBBB");
        eng.poll(&mut io, 200);

        assert_eq!(eng.take_event(), Some(UartEvent::RecvDone));
        assert_eq!(eng.data(), b"AAAABBBB");
        // DC1 + original + repeat + block 2
        assert_eq!(io.count(ACK), 4);
    }

    #[test]
    fn corrupt_frame_naks_then_recovers() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(4).unwrap();

        io.host_sends(&[DC1_SEND]);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame::pack_frame(1, b"abcd", &mut buf).unwrap();
        buf[5] ^= 0x40;
        io.host_sends(&buf[..n]);
        eng.poll(&mut io, 100);
        assert_eq!(io.count(NAK), 1);
        assert!(eng.take_event().is_none());

        io.host_frame(1, b"abcd");
        eng.poll(&mut io, 200);
        assert_eq!(eng.take_event(), Some(UartEvent::RecvDone));
        assert_eq!(eng.data(), b"abcd");
    }

    #[test]
    fn stalled_frame_is_naked_after_watchdog() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(4).unwrap();

        io.host_sends(&[DC1_SEND]);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame::pack_frame(1, b"abcd", &mut buf).unwrap();
        io.host_sends(&buf[..n - 3]);
        eng.poll(&mut io, 100);
        assert_eq!(io.count(NAK), 0);

        // silence past the watchdog abandons the partial frame
        eng.poll(&mut io, 100 + 1_100_000);
        assert_eq!(io.count(NAK), 1);

        io.host_frame(1, b"abcd");
        eng.poll(&mut io, 100 + 1_200_000);
        assert_eq!(eng.take_event(), Some(UartEvent::RecvDone));
        assert_eq!(eng.data(), b"abcd");
    }

    #[test]
    fn send_path_slices_and_advances_on_ack() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<2048> = UartEngine::new(&mut io, 0);

        let mut payload = [0u8; 1044];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        eng.start_write(&payload).unwrap();

        io.host_sends(&[DC2_RECV]);
        eng.poll(&mut io, 100);
        // ACK for DC2, then the first long frame
        assert_eq!(io.tx[1], ACK);
        let first = io.tx[2..].to_vec();
        let got = frame::read_frame_data(&first).unwrap();
        assert_eq!(got.block, 1);
        assert_eq!(got.data, &payload[..1024]);

        // NAK replays the very same frame
        io.tx.clear();
        io.host_sends(&[NAK]);
        eng.poll(&mut io, 200);
        assert_eq!(io.tx, first);

        // ACK credits the slice and moves to the tail
        io.tx.clear();
        io.host_sends(&[ACK]);
        eng.poll(&mut io, 300);
        let got = frame::read_frame_data(&io.tx).unwrap();
        assert_eq!(got.block, 2);
        assert_eq!(got.data, &payload[1024..]);

        io.host_sends(&[ACK]);
        eng.poll(&mut io, 400);
        assert_eq!(eng.take_event(), Some(UartEvent::SendDone));
        assert!(eng.idle());
    }

    #[test]
    fn missing_ack_replays_frame() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_write(b"hello").unwrap();

        io.host_sends(&[DC2_RECV]);
        eng.poll(&mut io, 100);
        let first = io.tx[2..].to_vec();
        assert!(!first.is_empty());

        // host stays silent past the ACK window
        io.tx.clear();
        eng.poll(&mut io, 100 + 25_000);
        assert_eq!(io.tx, first);
    }

    #[test]
    fn host_silence_aborts_session() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(16).unwrap();

        eng.poll(&mut io, 31_000_000);
        assert_eq!(eng.take_event(), Some(UartEvent::SessionTimeout));
        assert!(eng.idle());
    }

    #[test]
    fn second_task_is_rejected_while_busy() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<64> = UartEngine::new(&mut io, 0);
        eng.start_read(16).unwrap();
        assert_eq!(eng.start_read(4), Err(UartError::Busy));
        assert_eq!(eng.start_write(b"x"), Err(UartError::Busy));
    }

    #[test]
    fn oversized_transfer_is_rejected() {
        let mut io = MockIo::new();
        let mut eng: UartEngine<8> = UartEngine::new(&mut io, 0);
        assert_eq!(eng.start_read(9), Err(UartError::TooLong));
    }
}
