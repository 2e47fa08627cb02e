// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! UART command exchange loop.
//!
//! Glue between the framed UART engine and the dispatcher: read one
//! 20-byte command header, read the declared payload in engine-buffer
//! sized slices, then send back whatever response the dispatcher
//! staged. Payload slices are handed to the dispatcher as they arrive,
//! so a component data stream larger than the engine buffer never
//! needs to be assembled in one place.

use upg_protocol::command::{CommandHeader, HEADER_SIZE};

use crate::blockdev::BlockDevice;
use crate::dispatcher::{CommandDispatcher, UpgInit};
use crate::uart::{ByteIo, UartEngine, UartError, UartEvent};

/// Largest staged response: header plus burn-result payload.
const RESPONSE_MAX: usize = HEADER_SIZE + 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEvent {
    /// One command executed and its response fully acknowledged.
    ResponseSent,
    /// Host went silent; abort the upgrade and resume normal boot.
    Timeout,
}

enum SessionState {
    RecvHeader,
    RecvPayload { remain: usize },
    SendResponse,
}

/// `N` sizes the UART engine buffer and therefore the largest payload
/// slice read at once; it must hold at least one command header.
pub struct UartSession<const N: usize> {
    engine: UartEngine<N>,
    dispatcher: CommandDispatcher,
    state: SessionState,
}

impl<const N: usize> UartSession<N> {
    pub fn new<IO: ByteIo>(io: &mut IO, init: UpgInit, now_us: u64) -> Result<Self, UartError> {
        let mut engine = UartEngine::new(io, now_us);
        engine.start_read(HEADER_SIZE)?;
        Ok(Self {
            engine,
            dispatcher: CommandDispatcher::new(init, now_us),
            state: SessionState::RecvHeader,
        })
    }

    /// Mode-window and progress hooks live on the dispatcher.
    pub fn dispatcher_mut(&mut self) -> &mut CommandDispatcher {
        &mut self.dispatcher
    }

    /// Drive the exchange loop; call at a fixed short interval.
    pub fn poll<IO: ByteIo, D: BlockDevice>(
        &mut self,
        io: &mut IO,
        dev: &mut D,
        now_us: u64,
    ) -> Option<SessionEvent> {
        self.engine.poll(io, now_us);
        match self.engine.take_event()? {
            UartEvent::SessionTimeout => Some(SessionEvent::Timeout),
            UartEvent::RecvDone => {
                self.on_recv_done(dev);
                None
            }
            UartEvent::SendDone => {
                self.read_next_header();
                Some(SessionEvent::ResponseSent)
            }
        }
    }

    fn on_recv_done<D: BlockDevice>(&mut self, dev: &mut D) {
        match self.state {
            SessionState::RecvHeader => {
                // the dispatcher validates; we only need the declared
                // length to plan the payload reads
                let remain = CommandHeader::parse(self.engine.data())
                    .map(|hdr| hdr.data_length as usize)
                    .unwrap_or(0);
                self.dispatcher.data_packet_write(dev, self.engine.data());
                if remain > 0 {
                    self.read_payload(remain);
                } else {
                    self.respond();
                }
            }
            SessionState::RecvPayload { remain } => {
                self.dispatcher.data_packet_write(dev, self.engine.data());
                let remain = remain - self.engine.data().len();
                if remain > 0 {
                    self.read_payload(remain);
                } else {
                    self.respond();
                }
            }
            SessionState::SendResponse => {}
        }
    }

    fn read_payload(&mut self, remain: usize) {
        self.state = SessionState::RecvPayload { remain };
        // the engine is idle after a completion event
        let _ = self.engine.start_read(core::cmp::min(remain, N));
    }

    fn read_next_header(&mut self) {
        self.state = SessionState::RecvHeader;
        let _ = self.engine.start_read(HEADER_SIZE);
    }

    /// Send the staged response, or fall straight back to the next
    /// header when nothing was staged.
    fn respond(&mut self) {
        let mut buf = [0u8; RESPONSE_MAX];
        let n = self.dispatcher.data_packet_read(&mut buf);
        if n > 0 {
            self.state = SessionState::SendResponse;
            let _ = self.engine.start_write(&buf[..n]);
        } else {
            self.read_next_header();
        }
    }
}
