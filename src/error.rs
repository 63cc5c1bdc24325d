// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module for error handling code.

use std::fmt::{Display, Formatter};
#[cfg(feature = "backtrace")]
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;

use thiserror::Error;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`,
/// which shows up in a few signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of errors for [Error]. Use [ErrorKind::error] and [ErrorKind::error_from] to generate the
/// [Error] value for this ErrorKind.
#[derive(Debug)]
pub enum ErrorKind
{
    /// HID channel produced no valid response within its attempt budget.
    DeviceUnreachable,

    /// Serial port could not be opened after its retry budget.
    PortUnavailable,

    /// Serial port was lost mid-transfer.
    PortClosed,

    /// Bytes were received but did not match the expected pattern.
    UnexpectedResponse(/** raw bytes **/ Vec<u8>),

    /// A per-operation timer elapsed.
    Timeout(/** operation name **/ &'static str),

    /// Device never replied `Ready` to a ready-handshake.
    ReadyTimeout,

    /// A mode switch was requested but the device did not re-enumerate.
    BootloaderSwitchFailed,

    /// A single block exceeded its retry budget.
    FlashStalled,

    /// The device-reported image CRC did not match the expected value.
    CRCMismatch { expected: String, actual: String },

    /// The device did not finish computing the image CRC in time.
    CRCTimeout,

    /// The user-data clear subprotocol failed after its retries.
    UserDataClearFailed,

    /// Image failed a size gate or the stack-pointer heuristic.
    InvalidImage(/** reason **/ String),

    /// Another job is already in flight.
    Busy,

    /// A confirmation prompt was declined by the user.
    UserAborted,

    /// Unhandled external error.
    External(ErrorSource),
}

impl ErrorKind
{
    /// Creates a new [Error] from this error kind.
    #[inline(always)]
    pub fn error(self) -> Error
    {
        Error::new(self, None)
    }

    /// Creates a new [Error] from this error kind, with the passed error as the source.
    #[inline(always)]
    pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
    {
        Error::new(self, Some(Box::new(source)))
    }
}

/// Constructs an [Error] for this [ErrorKind].
impl From<ErrorKind> for Error
{
    fn from(other: ErrorKind) -> Self
    {
        other.error()
    }
}

impl Display for ErrorKind
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        use ErrorKind::*;
        match self {
            DeviceUnreachable => write!(f, "device did not respond over HID within its retry budget")?,
            PortUnavailable => write!(f, "serial port could not be opened")?,
            PortClosed => write!(f, "serial port was closed mid-transfer")?,
            UnexpectedResponse(raw) => write!(f, "unexpected response ({} bytes): {:02x?}", raw.len(), raw)?,
            Timeout(op) => write!(f, "timed out waiting for {op}")?,
            ReadyTimeout => write!(f, "device never replied Ready")?,
            BootloaderSwitchFailed => write!(f, "device did not re-enumerate after a bootloader switch request")?,
            FlashStalled => write!(f, "a block exceeded its retry budget")?,
            CRCMismatch { expected, actual } => write!(f, "CRC mismatch: expected {expected}, got {actual}")?,
            CRCTimeout => write!(f, "device did not finish computing the image CRC in time")?,
            UserDataClearFailed => write!(f, "user-data clear failed after its retries")?,
            InvalidImage(reason) => write!(f, "invalid firmware image: {reason}")?,
            Busy => write!(f, "another flash job is already in progress")?,
            UserAborted => write!(f, "operation was cancelled by the user")?,
            External(source) => {
                use ErrorSource::*;
                match source {
                    StdIo(e) => write!(f, "unhandled std::io::Error: {}", e)?,
                    Hid(e) => write!(f, "unhandled HID error: {}", e)?,
                    Serial(e) => write!(f, "unhandled serial port error: {}", e)?,
                };
            },
        };

        Ok(())
    }
}

#[derive(Debug)]
/// Error type for firmware flashing operations. Easily constructed from [ErrorKind].
pub struct Error
{
    pub kind: ErrorKind,
    pub source: Option<BoxedError>,

    /// Stores the backtrace for this error.
    #[cfg(feature = "backtrace")]
    pub backtrace: Box<Backtrace>,

    /// Additional context about what was being attempted when this error occurred.
    ///
    /// Example: "opening the bootloader serial port".
    pub context: Option<String>,
}

impl Error
{
    #[inline(always)]
    pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
    {
        Self {
            kind,
            source,
            context: None,
            #[cfg(feature = "backtrace")]
            backtrace: Box::new(Backtrace::capture()),
        }
    }

    #[allow(dead_code)]
    /// Add additional context about what was being attempted when this error occurred.
    pub fn with_ctx(mut self, ctx: &str) -> Self
    {
        self.context = Some(ctx.to_string());
        self
    }

    #[allow(dead_code)]
    /// Removes previously added context.
    pub fn without_ctx(mut self) -> Self
    {
        self.context = None;
        self
    }

    #[cfg(feature = "backtrace")]
    #[allow(dead_code)]
    fn backtrace(&self) -> Option<&Backtrace>
    {
        Some(&self.backtrace)
    }
}

impl Display for Error
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        if let Some(ctx) = &self.context {
            write!(f, "(while {}): {}", ctx, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }

        #[cfg(feature = "backtrace")]
        {
            if self.backtrace.status() == BacktraceStatus::Captured {
                write!(f, "\nBacktrace:\n{}", self.backtrace)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f, "\nCaused by: {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        self.source.as_deref().map(|e| e as &dyn StdError)
    }
}

impl From<std::io::Error> for Error
{
    fn from(other: std::io::Error) -> Self
    {
        ErrorKind::External(ErrorSource::StdIo(other)).error()
    }
}

impl From<hidapi::HidError> for Error
{
    fn from(other: hidapi::HidError) -> Self
    {
        ErrorKind::DeviceUnreachable.error_from(other)
    }
}

impl From<serialport::Error> for Error
{
    fn from(other: serialport::Error) -> Self
    {
        ErrorKind::PortUnavailable.error_from(other)
    }
}

/// Sources of external error in this library.
#[derive(Debug, Error)]
pub enum ErrorSource
{
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error(transparent)]
    Hid(#[from] hidapi::HidError),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

/// Extension trait to enable getting the error kind from a Result<T, Error> with one method.
pub trait ResErrorKind<T>
{
    type Kind;
    fn err_kind(&self) -> std::result::Result<&T, &Self::Kind>;
}

impl<T> ResErrorKind<T> for std::result::Result<T, Error>
{
    type Kind = ErrorKind;

    fn err_kind(&self) -> std::result::Result<&T, &Self::Kind>
    {
        self.as_ref().map_err(|e| &e.kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! log_and_return
{
    ($err:expr) => {
        let err = $err;
        log::error!("{}", err);
        return Err(err);
    }
}
