// SPDX-License-Identifier: MIT OR Apache-2.0

use audiomoth_flash::error::ErrorKind;
use audiomoth_flash::transport::serial::{find_bootloader_port, SerialLine};
use audiomoth_flash::transport::SerialTransport;
use clap::Parser;
use color_eyre::eyre::Result;
use owo_colors::OwoColorize;
use regex::Regex;
use std::time::Duration;

#[derive(Parser)]
pub struct ResetArguments {}

impl ResetArguments
{
    pub fn run(&self, port: Option<&str>) -> Result<()>
    {
        let path = match port {
            Some(path) => path.to_string(),
            None => find_bootloader_port()?.ok_or_else(|| ErrorKind::PortUnavailable.error())?,
        };

        let mut line = SerialLine::open(&path)?;
        line.write(&[b'r'])?;
        let pattern = Regex::new("r").expect("static pattern is valid");
        line.await_response(1, &pattern, Duration::from_millis(1500))?;
        line.close();

        println!("{}", "device reset".green());
        Ok(())
    }
}
