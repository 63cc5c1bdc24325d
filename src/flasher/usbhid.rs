// SPDX-License-Identifier: MIT OR Apache-2.0
//! The USB-HID SRAM-staged flasher. Uses the packet channel only; no serial
//! port is ever opened for this path.

use std::thread;
use std::time::Duration;

use crate::crc::image_crc16;
use crate::error::{ErrorKind, Result};
use crate::flasher::{FlashOptions, FlashOutcome, ProgressEvent, ProgressSink};
use crate::image::FirmwareImage;
use crate::transport::hid::with_attempt_loop;
use crate::transport::HidTransport;

/// Command bytes, first byte of each request; the response echoes the
/// command at byte `[1]`.
mod command
{
    pub const INIT_SRAM: u8 = 0x02;
    pub const CLEAR_USER_DATA: u8 = 0x03;
    pub const SET_SRAM_FW_PACKET: u8 = 0x04;
    pub const CALC_SRAM_CRC: u8 = 0x05;
    pub const CALC_FLASH_CRC: u8 = 0x06;
    pub const GET_FW_CRC: u8 = 0x07;
    pub const FLASH_FW: u8 = 0x08;
}

/// Packets per SRAM-streaming batch on non-Windows hosts.
const BATCH_SIZE_DEFAULT: usize = 60;
/// Packets per SRAM-streaming batch on Windows, reflecting a host-side
/// buffering quirk on that platform.
const BATCH_SIZE_WINDOWS: usize = 30;
/// Maximum payload bytes per SRAM packet.
const PACKET_PAYLOAD_MAX: usize = 56;
/// Delay between SRAM-streaming batches.
const BATCH_DELAY: Duration = Duration::from_millis(10);
/// CRC poll attempts and spacing.
const CRC_POLL_ATTEMPTS: u32 = 10;
const CRC_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Best-effort wait for the post-flash reboot; no explicit confirmation exists.
const REBOOT_WAIT: Duration = Duration::from_millis(7500);

fn batch_size() -> usize
{
    if cfg!(windows) {
        BATCH_SIZE_WINDOWS
    } else {
        BATCH_SIZE_DEFAULT
    }
}

fn success(response: &[u8]) -> bool
{
    response.get(2).copied() == Some(0x01)
}

/// The USB-HID SRAM flasher.
pub struct HidFlasher;

impl HidFlasher
{
    pub fn new() -> Self
    {
        Self
    }

    /// Runs the full USB-HID SRAM-staged flash, per §4.5.
    pub fn run(
        &mut self,
        transport: &mut impl HidTransport,
        image: &FirmwareImage,
        options: &FlashOptions,
        progress: &dyn ProgressSink,
    ) -> Result<FlashOutcome>
    {
        if options.destructive {
            return Err(ErrorKind::InvalidImage("the USB-HID path cannot overwrite the bootloader region".into()).error());
        }

        let init = with_attempt_loop(|| transport.send_packet(&[command::INIT_SRAM]))?;
        if !success(&init) {
            return Err(ErrorKind::DeviceUnreachable.error());
        }

        self.stream_image(transport, image.bytes(), progress)?;

        let expected_crc = match &options.expected_crc {
            Some(crc) => crc.clone(),
            None => format!("{:04X}", image_crc16(image.bytes())),
        };

        with_attempt_loop(|| transport.send_packet(&[command::CALC_SRAM_CRC]))?;

        let mut computed_crc = None;
        for _ in 0..CRC_POLL_ATTEMPTS {
            let response = transport.send_packet(&[command::GET_FW_CRC])?;
            if success(&response) {
                let lo = *response.get(3).unwrap_or(&0);
                let hi = *response.get(4).unwrap_or(&0);
                computed_crc = Some(format!("{:04X}", u16::from_le_bytes([lo, hi])));
                break;
            }
            thread::sleep(CRC_POLL_INTERVAL);
        }
        let computed_crc = computed_crc.ok_or_else(|| ErrorKind::CRCTimeout.error())?;

        if !expected_crc.eq_ignore_ascii_case(&computed_crc) {
            return Err(ErrorKind::CRCMismatch { expected: expected_crc, actual: computed_crc }.error());
        }

        if options.clear_user_data {
            let response = with_attempt_loop(|| transport.send_packet(&[command::CLEAR_USER_DATA]))?;
            if !success(&response) {
                return Err(ErrorKind::UserDataClearFailed.error());
            }
        }

        let response = with_attempt_loop(|| transport.send_packet(&[command::FLASH_FW]))?;
        if !success(&response) {
            return Err(ErrorKind::DeviceUnreachable.error());
        }

        progress.on_progress(ProgressEvent::Restarting { timeout: REBOOT_WAIT });
        thread::sleep(REBOOT_WAIT);
        progress.on_progress(ProgressEvent::Completed);

        Ok(FlashOutcome { reported_crc: Some(computed_crc) })
    }

    fn stream_image(&mut self, transport: &mut impl HidTransport, image: &[u8], progress: &dyn ProgressSink) -> Result<()>
    {
        let batch = batch_size();
        let total = image.len();
        let mut offset = 0usize;

        while offset < total {
            let mut packets = Vec::with_capacity(batch);
            for _ in 0..batch {
                if offset >= total {
                    break;
                }
                let chunk_len = PACKET_PAYLOAD_MAX.min(total - offset);
                let mut packet = Vec::with_capacity(1 + 4 + 1 + chunk_len);
                packet.push(command::SET_SRAM_FW_PACKET);
                packet.extend_from_slice(&(offset as u32).to_le_bytes());
                packet.push(chunk_len as u8);
                packet.extend_from_slice(&image[offset..offset + chunk_len]);
                packets.push(packet);
                offset += chunk_len;
            }

            with_attempt_loop(|| transport.send_multiple(&packets))?;
            progress.on_progress(ProgressEvent::Flashing { total, current: offset });
            thread::sleep(BATCH_DELAY);
        }

        Ok(())
    }
}

impl Default for HidFlasher
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::flasher::NoProgress;

    /// A fake HID channel that accepts everything and reports the CRC it was
    /// told the host computed, to exercise the full happy-path flow.
    struct FakeHid
    {
        received_bytes: usize,
    }

    impl HidTransport for FakeHid
    {
        fn send_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>>
        {
            match packet.first().copied() {
                Some(command::GET_FW_CRC) => {
                    let crc = image_crc16(&vec![0xAAu8; self.received_bytes]);
                    let bytes = crc.to_le_bytes();
                    Ok(vec![0x00, command::GET_FW_CRC, 0x01, bytes[0], bytes[1]])
                },
                Some(cmd) => Ok(vec![0x00, cmd, 0x01]),
                None => Ok(vec![0x00, 0x00, 0x01]),
            }
        }

        fn send_multiple(&mut self, packets: &[Vec<u8>]) -> Result<Vec<u8>>
        {
            for packet in packets {
                self.received_bytes += packet.len().saturating_sub(6);
            }
            Ok(vec![0x00, command::SET_SRAM_FW_PACKET, 0x01])
        }
    }

    #[test]
    fn destructive_is_rejected_outright()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 64]);
        let mut hid = FakeHid { received_bytes: 0 };
        let options = FlashOptions { destructive: true, ..Default::default() };
        let err = HidFlasher::new().run(&mut hid, &image, &options, &NoProgress).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidImage(_)));
    }

    #[test]
    fn happy_path_computes_and_matches_crc()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 64]);
        let mut hid = FakeHid { received_bytes: 0 };
        let options = FlashOptions::default();
        let outcome = HidFlasher::new().run(&mut hid, &image, &options, &NoProgress).expect("flash should succeed");
        assert!(outcome.reported_crc.is_some());
    }

    #[test]
    fn explicit_expected_crc_mismatch_is_reported()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 64]);
        let mut hid = FakeHid { received_bytes: 0 };
        let options = FlashOptions { expected_crc: Some("0000".to_string()), ..Default::default() };
        let err = HidFlasher::new().run(&mut hid, &image, &options, &NoProgress).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CRCMismatch { .. }));
    }

    #[test]
    fn batch_size_matches_platform_constant()
    {
        let expected = if cfg!(windows) { BATCH_SIZE_WINDOWS } else { BATCH_SIZE_DEFAULT };
        assert_eq!(batch_size(), expected);
    }
}
