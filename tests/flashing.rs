#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use audiomoth_flash::crc::image_crc16;
    use audiomoth_flash::error::{ErrorKind, Result};
    use audiomoth_flash::flasher::usbhid::HidFlasher;
    use audiomoth_flash::flasher::xmodem::XmodemFlasher;
    use audiomoth_flash::flasher::{FlashOptions, NoProgress};
    use audiomoth_flash::image::FirmwareImage;
    use audiomoth_flash::transport::{HidTransport, SerialTransport};
    use color_eyre::eyre::Result as EyreResult;
    use regex::Regex;

    struct ScriptedSerial {
        responses: VecDeque<Vec<u8>>,
    }

    impl SerialTransport for ScriptedSerial {
        fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        fn await_response(&mut self, _expected_len: usize, pattern: &Regex, _timeout: Duration) -> Result<Vec<u8>> {
            let raw = self.responses.pop_front().ok_or_else(|| ErrorKind::Timeout("scripted").error())?;
            if pattern.as_str().is_empty() || pattern.is_match(&String::from_utf8_lossy(&raw)) {
                Ok(raw)
            } else {
                Err(ErrorKind::UnexpectedResponse(raw).error())
            }
        }

        fn close(&mut self) {}
    }

    /// End-to-end scenario 1 (spec.md §8): an 81,920 byte image (640 blocks),
    /// every ACK arrives first try, expected CRC matches.
    #[test]
    fn happy_path_serial_640_blocks() -> EyreResult<()> {
        let n_blocks = 640;
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 128 * n_blocks]);

        let mut responses = VecDeque::new();
        responses.push_back(b"Ready\0\0\0\0\0\0".to_vec());
        responses.push_back("BOOTLOADER version 2.00, Chip ID 0123456789ABCDEF".to_string().into_bytes());
        for _ in 0..n_blocks {
            responses.push_back(vec![0x06]); // ACK
        }
        responses.push_back(vec![0x06]); // EOF ack
        responses.push_back(b"CRC: 00000A1B".to_vec());
        responses.push_back(b"r".to_vec());

        let mut transport = ScriptedSerial { responses };
        let options = FlashOptions { expected_crc: Some("0A1B".to_string()), ..Default::default() };

        let outcome = XmodemFlasher::new().run(&mut transport, &image, &options, &NoProgress, None)?;
        assert_eq!(outcome.reported_crc.as_deref(), Some("0A1B"));
        Ok(())
    }

    struct ScriptedHid {
        received: usize,
    }

    impl HidTransport for ScriptedHid {
        fn send_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
            match packet.first().copied() {
                Some(0x07) => {
                    // GET_FW_CRC: report the CRC of everything streamed so far.
                    let crc = image_crc16(&vec![0xBBu8; self.received]);
                    let bytes = crc.to_le_bytes();
                    Ok(vec![0x00, 0x07, 0x01, bytes[0], bytes[1]])
                },
                Some(cmd) => Ok(vec![0x00, cmd, 0x01]),
                None => Ok(vec![0x00, 0x00, 0x01]),
            }
        }

        fn send_multiple(&mut self, packets: &[Vec<u8>]) -> Result<Vec<u8>> {
            for packet in packets {
                self.received += packet.len().saturating_sub(6);
            }
            Ok(vec![0x00, 0x04, 0x01])
        }
    }

    /// End-to-end scenario 2 (spec.md §8): a 120 KiB image over the USB-HID
    /// SRAM path, device-reported CRC matches the host-computed one.
    #[test]
    fn happy_path_usbhid_120kib() -> EyreResult<()> {
        let image = FirmwareImage::from_bytes(vec![0xBBu8; 120 * 1024]);
        let mut transport = ScriptedHid { received: 0 };
        let options = FlashOptions::default();

        let outcome = HidFlasher::new().run(&mut transport, &image, &options, &NoProgress)?;
        assert!(outcome.reported_crc.is_some());
        Ok(())
    }
}
