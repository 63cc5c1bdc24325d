// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatch controller: probe -> (optional) bootloader update -> choice
//! of flasher -> completion/failure reporting. Exposes the single public
//! operation [`Dispatcher::flash`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{ErrorKind, Result};
use crate::flasher::usbhid::HidFlasher;
use crate::flasher::xmodem::XmodemFlasher;
use crate::flasher::{Confirmer, FlashOptions, FlashOutcome, ProgressEvent, ProgressSink};
use crate::image::FirmwareImage;
use crate::probe::{probe, DeviceStatus};
use crate::session::Session;
use crate::timer::poll_until;
use crate::transport::hid::HidChannel;
use crate::transport::serial::{self, SerialLine};

/// How long the dispatcher waits for the device to re-enumerate as a serial
/// bootloader after requesting a mode switch via HID.
const BOOTLOADER_SWITCH_TIMEOUT: Duration = Duration::from_secs(10);
const BOOTLOADER_SWITCH_STEP: Duration = Duration::from_millis(100);

/// Orchestrates exactly one flash job at a time (§4.6 concurrency guard).
pub struct Dispatcher
{
    busy: AtomicBool,
}

impl Dispatcher
{
    pub fn new() -> Self
    {
        Self { busy: AtomicBool::new(false) }
    }

    /// True while a job is in flight; the probe cadence should be suspended
    /// while this holds.
    pub fn is_busy(&self) -> bool
    {
        self.busy.load(Ordering::Acquire)
    }

    /// The single public operation: probes the device, applies the
    /// selection policy, and runs the chosen flasher to completion.
    pub fn flash(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        confirm: &dyn Confirmer,
        progress: &dyn ProgressSink,
    ) -> Result<FlashOutcome>
    {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(ErrorKind::Busy.error());
        }
        let result = self.flash_inner(image, options, confirm, progress);
        self.busy.store(false, Ordering::Release);

        if let Err(err) = &result {
            progress.on_progress(ProgressEvent::Aborted { reason: err.to_string() });
        }
        result
    }

    fn flash_inner(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        confirm: &dyn Confirmer,
        progress: &dyn ProgressSink,
    ) -> Result<FlashOutcome>
    {
        image.validate_pointer()?;
        // Strategy-independent bound, checked before any device interaction
        // (§4.6 "reject before starting"); the USB-HID-specific bound is
        // re-checked below once the flash strategy is known.
        image.validate_size(options.destructive, false)?;

        let status = probe();

        if options.destructive {
            if !matches!(status, DeviceStatus::Absent | DeviceStatus::InSerialBootloader) {
                let is_release_name = options
                    .filename
                    .as_deref()
                    .map(crate::image::is_released_firmware_name)
                    .unwrap_or(false);
                if is_release_name {
                    return Err(ErrorKind::InvalidImage(
                        "this image matches the released-firmware naming pattern and is meant to be installed alongside a bootloader"
                            .into(),
                    )
                    .error());
                }
                if !confirm.confirm("This will overwrite the device's bootloader. Continue?") {
                    return Err(ErrorKind::UserAborted.error());
                }
            }
        }

        let use_hid = options.prefer_usbhid && !options.destructive && status.usbhid_capable() && status != DeviceStatus::InSerialBootloader;

        image.validate_size(options.destructive, use_hid)?;

        let mut session = Session::new();

        let outcome = if use_hid {
            progress.on_progress(ProgressEvent::Opening { attempt: 0 });
            let hid = HidChannel::open()?;
            session.attach_hid(hid);
            let hid = session.hid_mut().expect("just attached");
            HidFlasher::new().run(hid, image, options, progress)
        } else {
            if matches!(status, DeviceStatus::RunningAutoSwitch { .. }) {
                self.switch_to_bootloader_and_wait()?;
            }

            let line = self.open_serial_with_progress(progress)?;
            session.attach_serial(line);
            let line = session.serial_mut().expect("just attached");
            XmodemFlasher::new().run(line, image, options, progress, None)
        };

        session.release();
        outcome
    }

    fn switch_to_bootloader_and_wait(&self) -> Result<()>
    {
        let mut hid = HidChannel::open()?;
        crate::transport::hid::with_attempt_loop(|| {
            use crate::transport::HidTransport;
            hid.send_packet(&[0x01]) // SWITCH_TO_BOOTLOADER, distinct from the flasher's own command set
        })?;

        let found = poll_until(BOOTLOADER_SWITCH_TIMEOUT, BOOTLOADER_SWITCH_STEP, || serial::find_bootloader_port().ok().flatten());
        if found.is_none() {
            return Err(ErrorKind::BootloaderSwitchFailed.error());
        }
        Ok(())
    }

    fn open_serial_with_progress(&self, progress: &dyn ProgressSink) -> Result<SerialLine>
    {
        crate::flasher::xmodem::open_port_with_retries(|attempt| {
            progress.on_progress(ProgressEvent::Opening { attempt });
            let path = serial::find_bootloader_port()?.ok_or_else(|| ErrorKind::PortUnavailable.error())?;
            SerialLine::open(&path)
        })
    }
}

impl Default for Dispatcher
{
    fn default() -> Self
    {
        Self::new()
    }
}
