// SPDX-License-Identifier: MIT OR Apache-2.0

mod cli_commands;

use clap::builder::styling::Styles;
use clap::{Parser, Subcommand, crate_description, crate_version};
use color_eyre::config::HookBuilder;
use color_eyre::eyre::{EyreHandler, InstallError, Result};
use owo_colors::OwoColorize;

use crate::cli_commands::flash::FlashArguments;
use crate::cli_commands::probe::ProbeArguments;
use crate::cli_commands::reset::ResetArguments;

#[derive(Parser)]
#[command(
    version,
    about = format!("{} v{}", crate_description!(), crate_version!()),
    styles(style()),
    disable_colored_help(false),
    arg_required_else_help(true)
)]
struct CliArguments
{
    #[arg(global = true, short = 'p', long = "port")]
    /// Use the device on the given serial port rather than auto-discovering it
    port: Option<String>,

    #[command(subcommand)]
    pub subcommand: ToplevelCommands,
}

#[derive(Subcommand)]
enum ToplevelCommands
{
    /// Report the device's current status
    Probe(ProbeArguments),
    /// Flash a firmware image to the device
    Flash(FlashArguments),
    /// Reset a device already sat in its bootloader
    Reset(ResetArguments),
}

type EyreHookFunc = Box<dyn Fn(&(dyn std::error::Error + 'static)) -> Box<dyn EyreHandler> + Send + Sync + 'static>;
type PanicHookFunc = Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Send + Sync + 'static>;

struct AudiomothFlashHook
{
    inner_hook: EyreHookFunc,
}

struct AudiomothFlashPanic
{
    inner_hook: PanicHookFunc,
}

struct AudiomothFlashHandler
{
    inner_handler: Box<dyn EyreHandler>,
}

impl AudiomothFlashHook
{
    fn build_handler(&self, error: &(dyn std::error::Error + 'static)) -> AudiomothFlashHandler
    {
        AudiomothFlashHandler { inner_handler: (*self.inner_hook)(error) }
    }

    pub fn install(self) -> Result<(), InstallError>
    {
        color_eyre::eyre::set_hook(self.into_eyre_hook())
    }

    pub fn into_eyre_hook(self) -> EyreHookFunc
    {
        Box::new(move |err| Box::new(self.build_handler(err)))
    }
}

impl AudiomothFlashPanic
{
    pub fn install(self)
    {
        std::panic::set_hook(self.into_panic_hook());
    }

    pub fn into_panic_hook(self) -> PanicHookFunc
    {
        Box::new(move |panic_info| {
            self.print_header();
            (*self.inner_hook)(panic_info);
            self.print_footer();
        })
    }

    fn print_header(&self)
    {
        eprintln!("------------[ cut here ]------------");
        eprintln!("Unhandled crash in audiomoth-flash-cli v{}", crate_version!());
        eprintln!();
    }

    fn print_footer(&self)
    {
        eprintln!();
        eprintln!("{}", "Please include everything above this line when reporting the issue,".yellow());
        eprintln!("{}", "along with what device and command you were running.".yellow());
    }
}

impl EyreHandler for AudiomothFlashHandler
{
    fn debug(&self, error: &(dyn std::error::Error + 'static), fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result
    {
        writeln!(fmt, "------------[ cut here ]------------")?;
        write!(fmt, "Unhandled crash in audiomoth-flash-cli v{}", crate_version!())?;
        self.inner_handler.debug(error, fmt)?;
        writeln!(fmt)?;
        writeln!(fmt)?;
        writeln!(fmt, "{}", "Please include everything above this line when reporting the issue.".yellow())
    }

    fn track_caller(&mut self, location: &'static std::panic::Location<'static>)
    {
        self.inner_handler.track_caller(location);
    }
}

fn install_error_handler() -> Result<()>
{
    let default_handler = HookBuilder::default();
    let (panic_hook, eyre_hook) = default_handler.try_into_hooks()?;

    AudiomothFlashPanic { inner_hook: panic_hook.into_panic_hook() }.install();
    AudiomothFlashHook { inner_hook: eyre_hook.into_eyre_hook() }.install()?;
    Ok(())
}

/// Clap v3 style (approximate). See https://stackoverflow.com/a/75343828
fn style() -> clap::builder::Styles
{
    Styles::styled()
        .usage(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))).bold())
        .header(anstyle::Style::new().bold().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))))
        .literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))))
}

fn main() -> Result<()>
{
    install_error_handler()?;
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).parse_default_env().init();

    let cli_args = CliArguments::parse();

    match &cli_args.subcommand {
        ToplevelCommands::Probe(args) => args.run(),
        ToplevelCommands::Flash(args) => args.run(cli_args.port.as_deref()),
        ToplevelCommands::Reset(args) => args.run(cli_args.port.as_deref()),
    }
}
