// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device probe: classifies which of five situations the device is in.

use crate::transport::hid::{with_attempt_loop, HidChannel};
use crate::transport::serial;
use crate::transport::HidTransport;

/// Command bytes for the probe-only HID queries (distinct from the flasher's
/// command set in [`crate::flasher::usbhid`]).
mod command
{
    pub const QUERY_USBHID_BOOTLOADER: u8 = 0x10;
    pub const QUERY_BOOTLOADER: u8 = 0x11;
    pub const GET_FIRMWARE_VERSION: u8 = 0x12;
    pub const GET_FIRMWARE_DESCRIPTION: u8 = 0x13;
}

/// The device's current situation, as classified by [`probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus
{
    /// No matching serial port or HID device found.
    Absent,
    /// A matching serial port exists; the device is sat in its XMODEM bootloader.
    InSerialBootloader,
    /// Running firmware that supports both automatic mode-switch and USB-HID flashing.
    RunningAutoSwitch { usbhid: bool, fw_version: String, fw_description: String },
    /// Running firmware that supports mode-switch only (no USB-HID flashing).
    RunningManual { fw_version: String, fw_description: String },
}

impl DeviceStatus
{
    /// Whether this status reports `usbhid=true` (the only case where the HID
    /// flash path is selectable).
    pub fn usbhid_capable(&self) -> bool
    {
        matches!(self, DeviceStatus::RunningAutoSwitch { usbhid: true, .. })
    }
}

fn query_running_firmware() -> Option<DeviceStatus>
{
    let mut channel = HidChannel::open().ok()?;

    let usbhid_bootloader = with_attempt_loop(|| channel.send_packet(&[command::QUERY_USBHID_BOOTLOADER])).ok()?;
    let bootloader_flag = with_attempt_loop(|| channel.send_packet(&[command::QUERY_BOOTLOADER])).ok()?;
    let version = with_attempt_loop(|| channel.send_packet(&[command::GET_FIRMWARE_VERSION])).ok()?;
    let description = with_attempt_loop(|| channel.send_packet(&[command::GET_FIRMWARE_DESCRIPTION])).ok()?;

    let usbhid = usbhid_bootloader.get(2).copied().unwrap_or(0) == 0x01;
    let auto_switch = bootloader_flag.get(2).copied().unwrap_or(0) == 0x01;
    let fw_version = decode_text(&version);
    let fw_description = decode_text(&description);

    Some(if auto_switch {
        DeviceStatus::RunningAutoSwitch { usbhid, fw_version, fw_description }
    } else {
        DeviceStatus::RunningManual { fw_version, fw_description }
    })
}

fn decode_text(packet: &[u8]) -> String
{
    let payload = packet.get(2..).unwrap_or(&[]);
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Produces a [`DeviceStatus`] in bounded time, per §4.3:
/// 1. A matching serial port wins outright (`InSerialBootloader`).
/// 2. Otherwise, the HID channel is queried; any failure collapses to `Absent`.
pub fn probe() -> DeviceStatus
{
    match serial::find_bootloader_port() {
        Ok(Some(_)) => return DeviceStatus::InSerialBootloader,
        Ok(None) => {},
        Err(_) => {},
    }

    query_running_firmware().unwrap_or(DeviceStatus::Absent)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn decode_text_stops_at_first_nul()
    {
        let packet = [0x00, 0x12, b'v', b'1', b'.', b'2', 0x00, 0xAA];
        assert_eq!(decode_text(&packet), "v1.2");
    }

    #[test]
    fn decode_text_handles_empty_payload()
    {
        let packet = [0x00, 0x12];
        assert_eq!(decode_text(&packet), "");
    }

    #[test]
    fn usbhid_capable_only_for_auto_switch_with_usbhid_true()
    {
        let status = DeviceStatus::RunningAutoSwitch { usbhid: true, fw_version: "v1".into(), fw_description: "d".into() };
        assert!(status.usbhid_capable());

        let status = DeviceStatus::RunningAutoSwitch { usbhid: false, fw_version: "v1".into(), fw_description: "d".into() };
        assert!(!status.usbhid_capable());

        let status = DeviceStatus::RunningManual { fw_version: "v1".into(), fw_description: "d".into() };
        assert!(!status.usbhid_capable());

        assert!(!DeviceStatus::Absent.usbhid_capable());
    }
}
