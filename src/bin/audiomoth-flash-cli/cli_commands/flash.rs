// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use audiomoth_flash::dispatch::Dispatcher;
use audiomoth_flash::flasher::{Confirmer, FlashOptions, ProgressEvent, ProgressSink};
use audiomoth_flash::image::FirmwareImage;
use clap::Parser;
use color_eyre::eyre::Result;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

#[derive(Parser)]
pub struct FlashArguments
{
    /// Path to the firmware image to flash
    pub firmware: PathBuf,

    /// Also overwrite the bootloader region (normally refused for released firmware)
    #[arg(long)]
    pub destructive: bool,

    /// Erase the device's onboard user-data area before flashing
    #[arg(long)]
    pub clear_user_data: bool,

    /// Prefer the USB-HID SRAM path over the serial bootloader when both are available
    #[arg(long)]
    pub prefer_usb_hid: bool,

    /// Expect this four-digit hex CRC once the device reports its own; mismatch fails the job
    #[arg(long)]
    pub expected_crc: Option<String>,

    /// Answer yes to any confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

struct CliConfirmer
{
    assume_yes: bool,
}

impl Confirmer for CliConfirmer
{
    fn confirm(&self, question: &str) -> bool
    {
        if self.assume_yes {
            return true;
        }
        Confirm::new().with_prompt(question).default(false).interact().unwrap_or(false)
    }
}

struct CliProgress
{
    bar: ProgressBar,
}

impl ProgressSink for CliProgress
{
    fn on_progress(&self, event: ProgressEvent)
    {
        match event {
            ProgressEvent::Opening { attempt } => self.bar.set_message(format!("opening port (attempt {attempt})")),
            ProgressEvent::CheckingBootloader => self.bar.set_message("checking bootloader version"),
            ProgressEvent::ReadyCheck { attempt } => self.bar.set_message(format!("waiting for device ready (attempt {attempt})")),
            ProgressEvent::Flashing { total, current } => {
                if self.bar.length() != Some(total as u64) {
                    self.bar.set_length(total as u64);
                }
                self.bar.set_position(current as u64);
                self.bar.set_message("flashing");
            },
            ProgressEvent::Restarting { timeout } => self.bar.set_message(format!("restarting device (up to {timeout:?})")),
            ProgressEvent::Restart { progress } => self.bar.set_message(format!("restarting ({:.0}%)", progress * 100.0)),
            ProgressEvent::Completed => self.bar.finish_with_message("done"),
            ProgressEvent::Aborted { reason } => self.bar.abandon_with_message(format!("aborted: {reason}")),
        }
    }
}

impl FlashArguments
{
    pub fn run(&self, _port: Option<&str>) -> Result<()>
    {
        let image = FirmwareImage::load(&self.firmware)?;
        let filename = self.firmware.file_name().and_then(|f| f.to_str()).map(String::from);

        let options = FlashOptions {
            destructive: self.destructive,
            clear_user_data: self.clear_user_data,
            prefer_usbhid: self.prefer_usb_hid,
            expected_crc: self.expected_crc.clone(),
            filename,
        };

        let bar = ProgressBar::new(image.block_count() as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("static template is valid")
                .progress_chars("#>-"),
        );
        let progress = CliProgress { bar };
        let confirm = CliConfirmer { assume_yes: self.yes };

        let dispatcher = Dispatcher::new();
        let outcome = dispatcher.flash(&image, &options, &confirm, &progress)?;

        if let Some(crc) = outcome.reported_crc {
            println!("{} (device reported CRC {crc})", "flash complete".green());
        } else {
            println!("{}", "flash complete".green());
        }
        Ok(())
    }
}
