// SPDX-License-Identifier: MIT OR Apache-2.0
//! Firmware image data model: bytes, size gates, and the stack-pointer validity heuristic.

use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

/// Total image size ceiling: `256 KiB`.
pub const MAX_IMAGE_SIZE: usize = 256 * 1024;

/// Size gate for a non-destructive flash (firmware region only): `256 KiB - 16 KiB`.
pub const MAX_NON_DESTRUCTIVE: usize = MAX_IMAGE_SIZE - 16 * 1024;

/// Size gate for a destructive flash (firmware + bootloader region): `256 KiB`.
pub const MAX_DESTRUCTIVE: usize = MAX_IMAGE_SIZE;

/// Size gate for the USB-HID path: `0x34000 = 208 KiB`.
pub const MAX_USBHID: usize = 0x34000;

/// Valid reset-stack-pointer window (SRAM), little-endian u32 at image offset 0.
const SRAM_WINDOW: std::ops::RangeInclusive<u32> = 0x2000_0000..=0x2000_8000;

/// An opaque firmware image loaded into memory for the duration of one flash job.
#[derive(Debug, Clone)]
pub struct FirmwareImage
{
    bytes: Vec<u8>,
}

impl FirmwareImage
{
    /// Wraps raw bytes as a firmware image without any validation.
    ///
    /// Callers that accept images from the filesystem or network should prefer
    /// [`FirmwareImage::load`] or run [`FirmwareImage::validate`] themselves.
    pub fn from_bytes(bytes: Vec<u8>) -> Self
    {
        Self { bytes }
    }

    /// Reads a firmware image from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self>
    {
        let bytes = fs::read(path)?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn len(&self) -> usize
    {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.bytes.is_empty()
    }

    /// Number of 128-byte XMODEM blocks this image spans, rounding up.
    pub fn block_count(&self) -> usize
    {
        self.len().div_ceil(128)
    }

    /// The image-validity probe from the data model: the first 32-bit
    /// little-endian word (reset-stack-pointer) must lie in the SRAM window
    /// `[0x20000000, 0x20008000]`.
    pub fn has_plausible_stack_pointer(&self) -> bool
    {
        if self.bytes.len() < 4 {
            return false;
        }
        let word = u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
        SRAM_WINDOW.contains(&word)
    }

    /// Runs the non-size validity checks (stack-pointer heuristic only; size
    /// gates depend on the chosen flash strategy and are enforced by the
    /// dispatcher).
    pub fn validate_pointer(&self) -> Result<()>
    {
        if !self.has_plausible_stack_pointer() {
            return Err(ErrorKind::InvalidImage("reset-stack-pointer word is outside the SRAM window".into()).error());
        }
        Ok(())
    }

    /// Checks this image's size against the size gate implied by the chosen
    /// flashing strategy.
    pub fn validate_size(&self, destructive: bool, usbhid: bool) -> Result<()>
    {
        let limit = if usbhid {
            MAX_USBHID
        } else if destructive {
            MAX_DESTRUCTIVE
        } else {
            MAX_NON_DESTRUCTIVE
        };

        if self.len() > limit {
            return Err(ErrorKind::InvalidImage(format!(
                "image is {} bytes, which exceeds the {} byte limit for this flash strategy",
                self.len(),
                limit
            ))
            .error());
        }
        Ok(())
    }
}

/// Firmware images released alongside an official bootloader use this filename
/// pattern; a destructive flash of one of these is refused rather than
/// confirmed, since they're meant to be installed next to a bootloader already.
pub fn is_released_firmware_name(filename: &str) -> bool
{
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(audiomoth-firmware-basic|audiomoth-usb-microphone|audiomoth-gps-sync)-\d+\.\d+\.\d+\.bin$")
            .expect("static regex is valid")
    });
    pattern.is_match(filename)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn rejects_short_image()
    {
        let image = FirmwareImage::from_bytes(vec![0; 3]);
        assert!(!image.has_plausible_stack_pointer());
    }

    #[test]
    fn rejects_all_zero_stack_pointer()
    {
        let image = FirmwareImage::from_bytes(vec![0x00, 0x00, 0x00, 0x00]);
        assert!(!image.has_plausible_stack_pointer());
    }

    #[test]
    fn accepts_stack_pointer_at_window_start()
    {
        let mut bytes = 0x2000_0000u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let image = FirmwareImage::from_bytes(bytes);
        assert!(image.has_plausible_stack_pointer());
    }

    #[test]
    fn rejects_stack_pointer_past_window_end()
    {
        let mut bytes = (0x2000_8000u32 + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let image = FirmwareImage::from_bytes(bytes);
        assert!(!image.has_plausible_stack_pointer());
    }

    #[test]
    fn size_gate_rejects_over_limit_non_destructive()
    {
        let image = FirmwareImage::from_bytes(vec![0xFF; MAX_NON_DESTRUCTIVE + 1]);
        let err = image.validate_size(false, false).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidImage(_)));
    }

    #[test]
    fn size_gate_accepts_at_limit_destructive()
    {
        let image = FirmwareImage::from_bytes(vec![0xFF; MAX_DESTRUCTIVE]);
        assert!(image.validate_size(true, false).is_ok());
    }

    #[test]
    fn size_gate_usbhid_uses_usbhid_limit()
    {
        let image = FirmwareImage::from_bytes(vec![0xFF; MAX_USBHID + 1]);
        assert!(image.validate_size(false, true).is_err());
    }

    #[test]
    fn released_firmware_name_matches_pattern()
    {
        assert!(is_released_firmware_name("audiomoth-firmware-basic-1.9.2.bin"));
        assert!(is_released_firmware_name("audiomoth-usb-microphone-1.0.0.bin"));
        assert!(!is_released_firmware_name("my-custom-build.bin"));
    }
}
