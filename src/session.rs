// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatcher-scoped session: the live transport handle for one job,
//! with a scoped-acquisition discipline — release is guaranteed on every
//! exit path via `Drop`, never left to the caller to remember.

use crate::transport::hid::HidChannel;
use crate::transport::serial::SerialLine;

/// Which transport, if any, this session currently owns.
enum ActiveTransport
{
    None,
    Serial(SerialLine),
    Hid(HidChannel),
}

/// A job-scoped owner of the transport handle in use for that job.
///
/// Exactly one [`Session`] is live per job; the transport it holds is
/// released (dropped) when the session itself is dropped, whether the job
/// succeeded, failed, or was cancelled.
pub struct Session
{
    transport: ActiveTransport,
}

impl Session
{
    pub fn new() -> Self
    {
        Self { transport: ActiveTransport::None }
    }

    pub fn attach_serial(&mut self, line: SerialLine)
    {
        self.transport = ActiveTransport::Serial(line);
    }

    pub fn attach_hid(&mut self, hid: HidChannel)
    {
        self.transport = ActiveTransport::Hid(hid);
    }

    pub fn serial_mut(&mut self) -> Option<&mut SerialLine>
    {
        match &mut self.transport {
            ActiveTransport::Serial(line) => Some(line),
            _ => None,
        }
    }

    pub fn hid_mut(&mut self) -> Option<&mut HidChannel>
    {
        match &mut self.transport {
            ActiveTransport::Hid(hid) => Some(hid),
            _ => None,
        }
    }

    /// Explicitly releases the transport before the session itself goes out
    /// of scope, e.g. right before a reset so a reopened port doesn't race
    /// against the one this session still held.
    pub fn release(&mut self)
    {
        self.transport = ActiveTransport::None;
    }
}

impl Default for Session
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

    #[test]
    fn new_session_has_no_transport()
    {
        let mut session = Session::new();
        assert!(session.serial_mut().is_none());
        assert!(session.hid_mut().is_none());
    }

    #[test]
    fn release_clears_the_transport_slot()
    {
        let mut session = Session::new();
        session.release();
        assert!(session.serial_mut().is_none());
    }
}
