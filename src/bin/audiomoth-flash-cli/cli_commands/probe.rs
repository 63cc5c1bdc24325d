// SPDX-License-Identifier: MIT OR Apache-2.0

use audiomoth_flash::probe::{self, DeviceStatus};
use clap::Parser;
use color_eyre::eyre::Result;
use owo_colors::OwoColorize;

#[derive(Parser)]
pub struct ProbeArguments {}

impl ProbeArguments
{
    pub fn run(&self) -> Result<()>
    {
        match probe::probe() {
            DeviceStatus::Absent => println!("{}", "no device found".red()),
            DeviceStatus::InSerialBootloader => println!("{}", "device present, sat in the serial bootloader".green()),
            DeviceStatus::RunningAutoSwitch { usbhid, fw_version, fw_description } => {
                println!("{}", "device present, running firmware".green());
                println!("  firmware version:     {fw_version}");
                println!("  firmware description: {fw_description}");
                println!("  auto mode-switch:     yes");
                println!("  USB-HID flashing:     {}", if usbhid { "yes" } else { "no" });
            },
            DeviceStatus::RunningManual { fw_version, fw_description } => {
                println!("{}", "device present, running firmware".green());
                println!("  firmware version:     {fw_version}");
                println!("  firmware description: {fw_description}");
                println!("  auto mode-switch:     no (use the device's button/switch to enter the bootloader)");
            },
        }
        Ok(())
    }
}
