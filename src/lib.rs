// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core firmware-flashing library for the acoustic-monitoring USB device:
//! CRC engines, the serial and USB-HID transports, device probing, the two
//! flasher protocol state machines, and the dispatch controller that ties
//! them together.

pub mod crc;
pub mod dispatch;
pub mod error;
pub mod flasher;
pub mod image;
pub mod probe;
pub mod session;
pub mod timer;
pub mod transport;
