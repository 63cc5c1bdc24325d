// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transports: the serial line and the HID packet channel.
//!
//! Both are narrowed behind traits ([`SerialTransport`], [`HidTransport`]) so
//! the flasher state machines can run against fakes in tests without any
//! hardware attached.

pub mod hid;
pub mod serial;

use std::time::Duration;

use crate::error::Result;

/// USB vendor/product identifiers the device can enumerate under.
pub mod ids
{
    /// Vendor IDs the device uses, in either mode.
    pub const VENDOR_IDS: [u16; 2] = [0x10C4, 0x2544];
    /// Product ID while running firmware with the HID bootloader channel available.
    pub const PRODUCT_ID_RUNNING: u16 = 0x0002;
    /// Product ID while sat in the serial bootloader.
    pub const PRODUCT_ID_SERIAL_BOOTLOADER: u16 = 0x0003;
}

/// A byte-oriented line with per-operation timeouts, matching §4.2's serial line.
pub trait SerialTransport
{
    /// Returns only when the bytes have been handed to the OS.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Accumulates bytes until at least `expected_len` have arrived, then
    /// matches the accumulated buffer against `pattern`.
    fn await_response(&mut self, expected_len: usize, pattern: &regex::Regex, timeout: Duration) -> Result<Vec<u8>>;

    /// Flushes any buffered output, used on a write error before reattempting
    /// the same block.
    fn flush(&mut self) -> Result<()>
    {
        Ok(())
    }

    /// Releases OS resources backing this transport. Idempotent.
    fn close(&mut self);
}

/// A request/response packet channel to the device's bootloader, matching
/// §4.2's HID packet channel.
pub trait HidTransport
{
    /// Sends one packet and returns the device's response packet.
    fn send_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>>;

    /// Sends several packets as a single host-side transaction, returning the
    /// response to the last one (used for SRAM-streaming batches, where only
    /// completion of the batch is observed).
    fn send_multiple(&mut self, packets: &[Vec<u8>]) -> Result<Vec<u8>>;
}
