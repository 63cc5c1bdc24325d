// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two flasher protocol state machines and the types shared between them
//! and the dispatch controller.

pub mod usbhid;
pub mod xmodem;

use std::time::Duration;

/// Immutable inputs to one flash job (§3 "Flash job").
#[derive(Debug, Clone)]
pub struct FlashOptions
{
    pub destructive: bool,
    pub clear_user_data: bool,
    pub prefer_usbhid: bool,
    pub expected_crc: Option<String>,
    /// Source filename, used only for the destructive-image guard's pattern match.
    pub filename: Option<String>,
}

impl Default for FlashOptions
{
    fn default() -> Self
    {
        Self { destructive: false, clear_user_data: false, prefer_usbhid: false, expected_crc: None, filename: None }
    }
}

/// Progress events the dispatcher emits to the embedding UI, monotonically
/// per job (§4.6 "Progress reporting").
#[derive(Debug, Clone)]
pub enum ProgressEvent
{
    Opening { attempt: u32 },
    CheckingBootloader,
    ReadyCheck { attempt: u32 },
    Flashing { total: usize, current: usize },
    Restarting { timeout: Duration },
    Restart { progress: f32 },
    Completed,
    Aborted { reason: String },
}

/// Callback the core uses to ask the embedding UI a yes/no question (the
/// destructive-image guard). Implemented by the CLI with `dialoguer::Confirm`.
pub trait Confirmer
{
    fn confirm(&self, question: &str) -> bool;
}

/// A `Confirmer` that always answers yes; used in non-interactive contexts
/// (e.g. scripted CI invocations with `--yes`).
pub struct AlwaysConfirm;

impl Confirmer for AlwaysConfirm
{
    fn confirm(&self, _question: &str) -> bool
    {
        true
    }
}

/// Callback the core uses to report [`ProgressEvent`]s as they occur.
pub trait ProgressSink
{
    fn on_progress(&self, event: ProgressEvent);
}

impl<F: Fn(ProgressEvent)> ProgressSink for F
{
    fn on_progress(&self, event: ProgressEvent)
    {
        self(event)
    }
}

/// A no-op progress sink, for callers that don't care.
pub struct NoProgress;

impl ProgressSink for NoProgress
{
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Outcome of a completed flash job.
#[derive(Debug, Clone)]
pub struct FlashOutcome
{
    /// CRC the device reported after flashing, as four uppercase hex digits.
    pub reported_crc: Option<String>,
}
