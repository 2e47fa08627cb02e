// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device-side firmware upgrade engine.
//!
//! Everything here is a resumable state machine: bytes arrive in
//! arbitrary slices from interrupt or poll context, and every "wait"
//! is expressed by returning to the caller and being re-entered later.
//! Nothing blocks, nothing allocates on the hot path, and time is
//! passed in as a `now_us` microsecond timestamp so no timer dependency
//! leaks into the engine.
//!
//! Layering, leaf to root:
//!
//! - [`uart`]: framed byte protocol over a raw serial link (block
//!   sequencing, ACK/NAK retransmission, handshake control bytes)
//! - [`usb`]: CBW/CSW transport stage machine over a bulk endpoint pair
//! - [`dispatcher`]: transport-agnostic command decode/execute/respond,
//!   plus the upgrade-mode gate
//! - [`writer`]: streaming sparse/raw image decoder issuing block
//!   writes, erases and fills to a [`blockdev::BlockDevice`]
//! - [`session`]: the UART-side command exchange loop tying the above
//!   together
//!
//! The physical link drivers and the storage primitives are
//! collaborator traits ([`uart::ByteIo`], [`usb::UsbChannel`],
//! [`blockdev::BlockDevice`]); tests drive the engines with in-memory
//! implementations.

#![cfg_attr(not(test), no_std)]

// This must go first so the other modules see its macros.
mod fmt;

pub mod blockdev;
pub mod dispatcher;
pub mod session;
pub mod uart;
pub mod usb;
pub mod writer;

pub use blockdev::{BlockDevice, DeviceError, Partition};
pub use dispatcher::{
    CommandDispatcher, InitMode, ModeCheck, ModeTimeouts, UpgInit, UpgradeMode,
};
pub use session::{SessionEvent, UartSession};
pub use uart::{ByteIo, UartEngine, UartError, UartEvent};
pub use usb::{DataPort, UsbChannel, UsbTransport};
pub use writer::{BurnResult, WriteError, WriterSession};
