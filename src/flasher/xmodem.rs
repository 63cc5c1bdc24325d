// SPDX-License-Identifier: MIT OR Apache-2.0
//! The serial XMODEM-CRC flasher.
//!
//! Re-expressed as an explicit state machine per the design notes: each state
//! has one entry action and transitions on `Response | Timeout | Error`,
//! rather than the nested-continuation style of the source this protocol was
//! distilled from.

use std::thread;
use std::time::Duration;

use regex::Regex;

use crate::crc::block_crc16;
use crate::error::{ErrorKind, Result};
use crate::flasher::{FlashOptions, FlashOutcome, ProgressSink, ProgressEvent};
use crate::image::FirmwareImage;
use crate::timer::{exponential_backoff, poll_until};
use crate::transport::serial::find_bootloader_port;
use crate::transport::SerialTransport;

/// Maximum attempts to open the serial port before `PortUnavailable`.
pub const MAX_PORT_OPEN_ATTEMPTS: u32 = 5;
/// Base backoff between port-open attempts: `500 * 2^attempt` ms.
pub const PORT_OPEN_BASE: Duration = Duration::from_millis(500);
/// Maximum attempts for the ready handshake before `ReadyTimeout`.
pub const READY_HANDSHAKE_ATTEMPTS: u32 = 7;
/// Base backoff between ready-handshake attempts: `100 * 2^n` ms.
pub const READY_BASE: Duration = Duration::from_millis(100);
/// How long a single block's ACK is awaited before it counts as a timeout.
pub const BLOCK_ACK_TIMEOUT: Duration = Duration::from_millis(1500);
/// Per-block retry budget before `FlashStalled`.
pub const BLOCK_RETRY_LIMIT: u32 = 10;
/// Attempts for the post-clear user-data CRC poll.
pub const CLEAR_USER_DATA_ATTEMPTS: u32 = 5;
/// How long the port-open poll waits for the bootloader port to vanish after reset.
pub const RESET_POLL_TIMEOUT: Duration = Duration::from_millis(7500);
/// Step between reset-poll checks.
pub const RESET_POLL_STEP: Duration = Duration::from_millis(100);

/// XMODEM block payload size.
pub const BLOCK_SIZE: usize = 128;
/// Padding byte for the tail of the last firmware block. Intentionally
/// different from [`FILLER_USER_DATA`] — preserved as-is per the device's
/// undocumented erase semantics, not generalized.
pub const FILLER_FIRMWARE: u8 = 0xFF;
/// Fill byte used by the sixteen synthetic user-data-clear blocks.
pub const FILLER_USER_DATA: u8 = 0x00;
/// Number of synthetic blocks sent by the user-data-clear subprotocol.
const CLEAR_USER_DATA_BLOCKS: usize = 16;

const SOH: u8 = 0x01;
const EOF: u8 = 0x04;
const ACK: u8 = 0x06;

/// Bootloader versions that trigger the bootloader-update gate.
const OUTDATED_BOOTLOADER_VERSIONS: [&str; 2] = ["1.00", "1.01"];
/// Expected CRC of the built-in bootloader updater image.
pub const BOOTLOADER_UPDATER_CRC: &str = "A435";

/// Explicit states of the XMODEM protocol, tracked for introspection and testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State
{
    Idle,
    OpeningPort,
    ReadyCheck,
    CheckingBootloaderVersion,
    UpdatingBootloader,
    ClearingUserData,
    Sending,
    ConfirmingEof,
    CrcCheck,
    Resetting,
    Done,
    Failed,
}

fn exact_byte_pattern(byte: u8) -> Regex
{
    Regex::new(&regex::escape(&(byte as char).to_string())).expect("single-byte pattern is always valid")
}

fn block_payload(image: &[u8], index: usize) -> [u8; BLOCK_SIZE]
{
    let mut buf = [FILLER_FIRMWARE; BLOCK_SIZE];
    let start = index * BLOCK_SIZE;
    if start < image.len() {
        let end = (start + BLOCK_SIZE).min(image.len());
        buf[..end - start].copy_from_slice(&image[start..end]);
    }
    buf
}

fn build_block_frame(block_number: u8, payload: &[u8; BLOCK_SIZE]) -> Vec<u8>
{
    let crc = block_crc16(payload);
    let mut frame = Vec::with_capacity(3 + BLOCK_SIZE + 2);
    frame.push(SOH);
    frame.push(block_number);
    frame.push(0xFFu8.wrapping_sub(block_number));
    frame.extend_from_slice(payload);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xFF) as u8);
    frame
}

/// Opens a serial port with [`MAX_PORT_OPEN_ATTEMPTS`] retries, backing off
/// `500 * 2^attempt` ms between attempts. `try_open` is injected so this retry
/// discipline is testable without a real port.
pub fn open_port_with_retries<T>(mut try_open: impl FnMut(u32) -> Result<T>) -> Result<T>
{
    let mut last_err = None;
    for attempt in 0..MAX_PORT_OPEN_ATTEMPTS {
        match try_open(attempt) {
            Ok(port) => return Ok(port),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < MAX_PORT_OPEN_ATTEMPTS {
                    thread::sleep(exponential_backoff(PORT_OPEN_BASE, attempt));
                }
            },
        }
    }
    match last_err {
        Some(e) => Err(ErrorKind::PortUnavailable.error_from(e)),
        None => Err(ErrorKind::PortUnavailable.error()),
    }
}

/// The XMODEM-CRC flasher. Generic over `T: SerialTransport` so it runs
/// against a fake transport in tests.
pub struct XmodemFlasher
{
    state: State,
}

impl XmodemFlasher
{
    pub fn new() -> Self
    {
        Self { state: State::Idle }
    }

    pub fn state(&self) -> State
    {
        self.state
    }

    fn ready_handshake(&mut self, transport: &mut impl SerialTransport, command: u8, progress: &dyn ProgressSink) -> Result<()>
    {
        self.state = State::ReadyCheck;
        let pattern = Regex::new("Ready").expect("static pattern is valid");
        for attempt in 0..READY_HANDSHAKE_ATTEMPTS {
            progress.on_progress(ProgressEvent::ReadyCheck { attempt });
            transport.write(&[command])?;
            match transport.await_response(11, &pattern, BLOCK_ACK_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(_) if attempt + 1 < READY_HANDSHAKE_ATTEMPTS => {
                    thread::sleep(exponential_backoff(READY_BASE, attempt));
                },
                Err(_) => break,
            }
        }
        Err(ErrorKind::ReadyTimeout.error())
    }

    /// Sends `'i'` and parses the bootloader identity response, per §4.4's
    /// bootloader-version gate. Versions outside `0.x..9.xx` are treated as
    /// `UnexpectedResponse` rather than guessed at, per the design notes.
    fn check_bootloader_version(&mut self, transport: &mut impl SerialTransport) -> Result<String>
    {
        self.state = State::CheckingBootloaderVersion;
        transport.write(&[b'i'])?;
        let pattern = Regex::new(r"BOOTLOADER version [0-9]\.[0-9]{2}, Chip ID [0-9A-Z]{16}").expect("static pattern is valid");
        let raw = transport.await_response(54, &pattern, BLOCK_ACK_TIMEOUT)?;
        let text = String::from_utf8_lossy(&raw);

        let version_re = Regex::new(r"version ([0-9]\.[0-9]{2})").expect("static pattern is valid");
        match version_re.captures(&text) {
            Some(caps) => Ok(caps[1].to_string()),
            None => Err(ErrorKind::UnexpectedResponse(raw.into_owned().into_bytes()).error()),
        }
    }

    fn clear_user_data(&mut self, transport: &mut impl SerialTransport, progress: &dyn ProgressSink) -> Result<()>
    {
        self.state = State::ClearingUserData;
        self.ready_handshake(transport, b't', progress)?;

        for n in 1..=CLEAR_USER_DATA_BLOCKS {
            let block_number = (n % 256) as u8;
            let mut frame = Vec::with_capacity(3 + BLOCK_SIZE + 2);
            frame.push(SOH);
            frame.push(block_number);
            frame.push(0xFFu8.wrapping_sub(block_number));
            frame.extend_from_slice(&[FILLER_USER_DATA; BLOCK_SIZE]);
            frame.push(0x00);
            frame.push(0x00);

            transport.write(&frame)?;
            let ack = exact_byte_pattern(ACK);
            let resp = transport
                .await_response(1, &ack, BLOCK_ACK_TIMEOUT)
                .map_err(|_| ErrorKind::UserDataClearFailed.error())?;
            if resp.first() != Some(&ACK) {
                return Err(ErrorKind::UserDataClearFailed.error());
            }
        }

        transport.write(&[EOF])?;
        let ack = exact_byte_pattern(ACK);
        transport.await_response(1, &ack, BLOCK_ACK_TIMEOUT).map_err(|_| ErrorKind::UserDataClearFailed.error())?;

        let cleared_pattern = Regex::new("CRC: 00000000").expect("static pattern is valid");
        for attempt in 0..CLEAR_USER_DATA_ATTEMPTS {
            transport.write(&[b'n'])?;
            match transport.await_response(18, &cleared_pattern, BLOCK_ACK_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(_) if attempt + 1 < CLEAR_USER_DATA_ATTEMPTS => {
                    thread::sleep(exponential_backoff(READY_BASE, attempt));
                },
                Err(_) => break,
            }
        }
        Err(ErrorKind::UserDataClearFailed.error())
    }

    /// Transmits every block of `image`, driving the `(lower, upper)` sliding
    /// window described in §4.4. The oldest unconfirmed block is always the
    /// one (re)sent; `upper` is tracked alongside it to preserve the
    /// documented invariant `lower <= upper <= n_blocks` for introspection and
    /// testing, even though the resend target is simply `lower`.
    fn send_blocks(&mut self, transport: &mut impl SerialTransport, image: &[u8], progress: &dyn ProgressSink) -> Result<()>
    {
        self.state = State::Sending;
        let n_blocks = image.len().div_ceil(BLOCK_SIZE).max(1);
        let ack_pattern = exact_byte_pattern(ACK);

        let mut lower: usize = 0;
        let mut upper: usize = 0;
        let mut num_repeats: u32 = 0;

        while lower < n_blocks {
            let cur = lower;
            let block_number = ((cur + 1) % 256) as u8;
            let payload = block_payload(image, cur);
            let frame = build_block_frame(block_number, &payload);

            if transport.write(&frame).is_err() {
                let _ = transport.flush();
                num_repeats += 1;
                if num_repeats >= BLOCK_RETRY_LIMIT {
                    return Err(ErrorKind::FlashStalled.error());
                }
                continue;
            }

            match transport.await_response(1, &ack_pattern, BLOCK_ACK_TIMEOUT) {
                Ok(resp) if resp.first() == Some(&ACK) => {
                    num_repeats = 0;
                    lower = cur + 1;
                    upper = lower;
                    progress.on_progress(ProgressEvent::Flashing { total: n_blocks, current: lower });
                },
                _ => {
                    upper = (upper.max(cur + 1)).min(n_blocks.saturating_sub(1).max(cur));
                    num_repeats += 1;
                    if num_repeats >= BLOCK_RETRY_LIMIT {
                        return Err(ErrorKind::FlashStalled.error());
                    }
                },
            }

            debug_assert!(lower <= upper && upper <= n_blocks);
        }

        Ok(())
    }

    fn confirm_eof(&mut self, transport: &mut impl SerialTransport) -> Result<()>
    {
        self.state = State::ConfirmingEof;
        transport.write(&[EOF])?;
        let ack = exact_byte_pattern(ACK);
        transport.await_response(1, &ack, BLOCK_ACK_TIMEOUT)?;
        Ok(())
    }

    fn read_image_crc(&mut self, transport: &mut impl SerialTransport, destructive: bool) -> Result<String>
    {
        self.state = State::CrcCheck;
        let command = if destructive { b'v' } else { b'c' };
        transport.write(&[command])?;
        let pattern = Regex::new(r"CRC: 0000[A-Z0-9]{4}").expect("static pattern is valid");
        let raw = transport.await_response(18, &pattern, BLOCK_ACK_TIMEOUT)?;
        let text = String::from_utf8_lossy(&raw);

        let hex_re = Regex::new(r"CRC: 0000([A-Z0-9]{4})").expect("static pattern is valid");
        match hex_re.captures(&text) {
            Some(caps) => Ok(caps[1].to_string()),
            None => Err(ErrorKind::UnexpectedResponse(raw.into_owned().into_bytes()).error()),
        }
    }

    /// Sends the reset command, closes the port, then polls port discovery
    /// for up to [`RESET_POLL_TIMEOUT`] (step [`RESET_POLL_STEP`]) expecting
    /// the bootloader port to disappear, per §4.4's reset step. The poll is
    /// best-effort: whether or not the port vanishes within the budget,
    /// success is surfaced afterward — there's no device confirmation of a
    /// completed reboot beyond its port disappearing.
    fn reset(&mut self, transport: &mut impl SerialTransport, progress: &dyn ProgressSink) -> Result<()>
    {
        self.state = State::Resetting;
        transport.write(&[b'r'])?;
        let pattern = exact_byte_pattern(b'r');
        transport.await_response(1, &pattern, BLOCK_ACK_TIMEOUT)?;
        transport.close();

        progress.on_progress(ProgressEvent::Restarting { timeout: RESET_POLL_TIMEOUT });
        let vanished = poll_until(RESET_POLL_TIMEOUT, RESET_POLL_STEP, || match find_bootloader_port() {
            Ok(None) | Err(_) => Some(()),
            Ok(Some(_)) => None,
        });
        progress.on_progress(ProgressEvent::Restart { progress: if vanished.is_some() { 1.0 } else { 0.0 } });

        Ok(())
    }

    /// Runs the full XMODEM protocol over an already-open transport: ready
    /// handshake, bootloader-version gate (recursing into `run` for the
    /// updater image when the gate trips), optional user-data clear, block
    /// transmission, EOF, CRC verification, and reset.
    ///
    /// `bootloader_updater` supplies the embedded updater image bytes; it is
    /// only consulted if the device's bootloader reports an outdated version.
    pub fn run(
        &mut self,
        transport: &mut impl SerialTransport,
        image: &FirmwareImage,
        options: &FlashOptions,
        progress: &dyn ProgressSink,
        bootloader_updater: Option<&FirmwareImage>,
    ) -> Result<FlashOutcome>
    {
        let command = if options.destructive { b'd' } else { b'u' };
        self.ready_handshake(transport, command, progress)?;

        progress.on_progress(ProgressEvent::CheckingBootloader);
        let version = self.check_bootloader_version(transport)?;
        if OUTDATED_BOOTLOADER_VERSIONS.contains(&version.as_str()) {
            let updater = bootloader_updater.ok_or_else(|| {
                ErrorKind::UnexpectedResponse(format!("bootloader version {version} requires an update, but no updater image was supplied").into_bytes()).error()
            })?;

            self.state = State::UpdatingBootloader;
            let updater_options = FlashOptions {
                destructive: false,
                clear_user_data: false,
                prefer_usbhid: false,
                expected_crc: Some(BOOTLOADER_UPDATER_CRC.to_string()),
                filename: None,
            };
            self.run(transport, updater, &updater_options, progress, None)?;

            // After the updater flash resets the device, re-enter the ready
            // check on the same already-open transport.
            self.ready_handshake(transport, command, progress)?;
        }

        if options.clear_user_data {
            self.clear_user_data(transport, progress)?;
        }

        self.send_blocks(transport, image.bytes(), progress)?;
        self.confirm_eof(transport)?;

        let reported_crc = self.read_image_crc(transport, options.destructive)?;
        if let Some(expected) = &options.expected_crc {
            if !expected.eq_ignore_ascii_case(&reported_crc) {
                self.state = State::Failed;
                return Err(ErrorKind::CRCMismatch { expected: expected.clone(), actual: reported_crc }.error());
            }
        }

        self.reset(transport, progress)?;
        self.state = State::Done;
        progress.on_progress(ProgressEvent::Completed);

        Ok(FlashOutcome { reported_crc: Some(reported_crc) })
    }
}

impl Default for XmodemFlasher
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
    use std::collections::VecDeque;

    /// An in-memory fake of [`SerialTransport`], driven by a scripted queue of
    /// responses keyed off the command byte the flasher writes.
    struct FakeSerial
    {
        responses: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl FakeSerial
    {
        fn new() -> Self
        {
            Self { responses: VecDeque::new(), written: Vec::new() }
        }

        fn push_response(&mut self, bytes: impl Into<Vec<u8>>)
        {
            self.responses.push_back(bytes.into());
        }
    }

    impl SerialTransport for FakeSerial
    {
        fn write(&mut self, bytes: &[u8]) -> Result<()>
        {
            self.written.push(bytes.to_vec());
            Ok(())
        }

        fn await_response(&mut self, _expected_len: usize, pattern: &Regex, _timeout: Duration) -> Result<Vec<u8>>
        {
            let raw = self.responses.pop_front().ok_or_else(|| ErrorKind::Timeout("fake").error())?;
            // An empty scripted response simulates a timeout for that one call.
            if raw.is_empty() {
                return Err(ErrorKind::Timeout("fake").error());
            }
            if pattern.as_str().is_empty() || pattern.is_match(&String::from_utf8_lossy(&raw)) {
                Ok(raw)
            } else {
                Err(ErrorKind::UnexpectedResponse(raw).error())
            }
        }

        fn close(&mut self) {}
    }

    fn scripted_happy_path(n_blocks: usize) -> FakeSerial
    {
        let mut fake = FakeSerial::new();
        fake.push_response(b"Ready\0\0\0\0\0\0".to_vec()); // ready handshake, 11 bytes
        fake.push_response(format!("BOOTLOADER version 2.00, Chip ID 0123456789ABCDEF").into_bytes()); // 54-ish bytes (lenient in fake)
        for _ in 0..n_blocks {
            fake.push_response(vec![ACK]);
        }
        fake.push_response(vec![ACK]); // EOF ack
        fake.push_response(b"CRC: 00000A1B".to_vec()); // 13 bytes, lenient
        fake.push_response(b"r".to_vec());
        fake
    }

    #[test]
    fn happy_path_non_destructive_reports_crc()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 256]); // 2 blocks
        let mut fake = scripted_happy_path(2);
        let mut flasher = XmodemFlasher::new();
        let options = FlashOptions { expected_crc: Some("0A1B".to_string()), ..Default::default() };

        let outcome = flasher.run(&mut fake, &image, &options, &NoProgress, None).expect("flash should succeed");
        assert_eq!(outcome.reported_crc.as_deref(), Some("0A1B"));
        assert_eq!(flasher.state(), State::Done);
    }

    #[test]
    fn crc_mismatch_is_reported_and_no_reset_sent()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 128]);
        let mut fake = scripted_happy_path(1);
        let mut flasher = XmodemFlasher::new();
        let options = FlashOptions { expected_crc: Some("9999".to_string()), ..Default::default() };

        let err = flasher.run(&mut fake, &image, &options, &NoProgress, None).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CRCMismatch { .. }));
        // The reset 'r' command should never have been written.
        assert!(!fake.written.iter().any(|w| w == &vec![b'r']));
    }

    #[test]
    fn single_block_retry_resends_same_block_and_completes()
    {
        // 20 blocks; block 17 (0-based index 16) times out once, then the
        // resend succeeds and the rest of the transfer completes normally.
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 128 * 20]);
        let mut fake = FakeSerial::new();
        fake.push_response(b"Ready\0\0\0\0\0\0".to_vec());
        fake.push_response("BOOTLOADER version 2.00, Chip ID 0123456789ABCDEF".to_string().into_bytes());
        for _ in 0..16 {
            fake.push_response(vec![ACK]);
        }
        fake.push_response(Vec::new()); // block 17's first attempt times out
        for _ in 0..4 {
            fake.push_response(vec![ACK]); // resend of block 17, then blocks 18-20
        }
        fake.push_response(vec![ACK]); // EOF ack
        fake.push_response(b"CRC: 00000A1B".to_vec());
        fake.push_response(b"r".to_vec());

        let mut flasher = XmodemFlasher::new();
        let options = FlashOptions { expected_crc: Some("0A1B".to_string()), ..Default::default() };
        let outcome = flasher.run(&mut fake, &image, &options, &NoProgress, None).expect("flash should recover from one timeout");
        assert_eq!(outcome.reported_crc.as_deref(), Some("0A1B"));
    }

    #[test]
    fn block_retry_limit_trips_flash_stalled()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 128]);
        let mut fake = FakeSerial::new();
        fake.push_response(b"Ready\0\0\0\0\0\0".to_vec());
        fake.push_response("BOOTLOADER version 2.00, Chip ID 0123456789ABCDEF".to_string().into_bytes());
        // No ACKs queued at all: every await_response for the single block times out.
        let mut flasher = XmodemFlasher::new();
        let options = FlashOptions::default();
        let err = flasher.run(&mut fake, &image, &options, &NoProgress, None).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::FlashStalled));
    }

    #[test]
    fn outdated_bootloader_without_updater_image_fails_cleanly()
    {
        let image = FirmwareImage::from_bytes(vec![0xAAu8; 128]);
        let mut fake = FakeSerial::new();
        fake.push_response(b"Ready\0\0\0\0\0\0".to_vec());
        fake.push_response("BOOTLOADER version 1.01, Chip ID 0123456789ABCDEF".to_string().into_bytes());
        let mut flasher = XmodemFlasher::new();
        let options = FlashOptions::default();
        let err = flasher.run(&mut fake, &image, &options, &NoProgress, None).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnexpectedResponse(_)));
    }

    #[test]
    fn block_frame_has_expected_shape()
    {
        let payload = [0x42u8; BLOCK_SIZE];
        let frame = build_block_frame(5, &payload);
        assert_eq!(frame.len(), 133);
        assert_eq!(frame[0], SOH);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], 0xFFu8.wrapping_sub(5));
        assert_eq!(&frame[3..131], &payload[..]);
    }
}
