// SPDX-License-Identifier: MIT OR Apache-2.0
//! The USB-HID packet channel to the device's bootloader.
//!
//! Grounded on the HF2-over-HID request/response shape: one command byte,
//! one response packet, device opened by exact vendor/product identifiers.

use std::thread;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use rand::Rng;

use crate::error::{ErrorKind, Result};
use crate::transport::HidTransport;

/// Base retry delay for the HID attempt loop (§4.2).
pub const RETRY_BASE: Duration = Duration::from_millis(100);
/// Maximum attempts per HID operation before surfacing `DeviceUnreachable`.
pub const MAX_ATTEMPTS: u32 = 10;

/// Per-packet read/write timeout.
const PACKET_TIMEOUT_MS: i32 = 1000;
/// Packet size the device's HID reports use.
const PACKET_SIZE: usize = 64;

/// A live connection to the device's HID bootloader endpoint.
pub struct HidChannel
{
    device: HidDevice,
}

impl HidChannel
{
    /// Opens the device by USB vendor/product identifiers `{0x10C4|0x2544, 0x0002}`.
    pub fn open() -> Result<Self>
    {
        let api = HidApi::new().map_err(|e| ErrorKind::External(crate::error::ErrorSource::Hid(e)).error())?;
        for vid in crate::transport::ids::VENDOR_IDS {
            if let Ok(device) = api.open(vid, crate::transport::ids::PRODUCT_ID_RUNNING) {
                return Ok(Self { device });
            }
        }
        Err(ErrorKind::DeviceUnreachable.error())
    }
}

impl HidTransport for HidChannel
{
    fn send_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>>
    {
        let mut buf = [0u8; PACKET_SIZE];
        let len = packet.len().min(PACKET_SIZE);
        buf[..len].copy_from_slice(&packet[..len]);
        self.device.write(&buf)?;

        let mut response = [0u8; PACKET_SIZE];
        let n = self.device.read_timeout(&mut response, PACKET_TIMEOUT_MS)?;
        if n == 0 {
            return Err(ErrorKind::DeviceUnreachable.error());
        }
        Ok(response[..n].to_vec())
    }

    fn send_multiple(&mut self, packets: &[Vec<u8>]) -> Result<Vec<u8>>
    {
        let mut last = Vec::new();
        for packet in packets {
            last = self.send_packet(packet)?;
        }
        Ok(last)
    }
}

/// Runs `attempt` up to [`MAX_ATTEMPTS`] times, sleeping a jittered backoff
/// between failures: `RETRY_BASE/2 + RETRY_BASE/2 * rand()`. The last
/// failure's error is discarded in favor of [`ErrorKind::DeviceUnreachable`],
/// matching "a call that never produces a usable response... fails with
/// `DeviceUnreachable`".
pub fn with_attempt_loop<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T>
{
    for n in 0..MAX_ATTEMPTS {
        if let Ok(value) = attempt() {
            return Ok(value);
        }
        if n + 1 < MAX_ATTEMPTS {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
            let half = RETRY_BASE / 2;
            let sleep_for = half + half.mul_f64(jitter);
            thread::sleep(sleep_for);
        }
    }
    Err(ErrorKind::DeviceUnreachable.error())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::cell::Cell;

    #[test]
    fn attempt_loop_returns_first_success()
    {
        let calls = Cell::new(0);
        let result = with_attempt_loop(|| {
            calls.set(calls.get() + 1);
            if calls.get() == 3 {
                Ok(42)
            } else {
                Err(ErrorKind::DeviceUnreachable.error())
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn attempt_loop_exhausts_to_device_unreachable()
    {
        let calls = Cell::new(0);
        let result: Result<()> = with_attempt_loop(|| {
            calls.set(calls.get() + 1);
            Err(ErrorKind::PortUnavailable.error())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), MAX_ATTEMPTS);
        assert!(matches!(result.unwrap_err().kind, ErrorKind::DeviceUnreachable));
    }
}
