//! Device-independent video/streaming I/O framework.
//!
//! This library provides the buffer and queue plumbing of an embedded camera
//! subsystem, split in three levels of abstraction:
//!
//! * The `buffer`, `sync` and `device` modules implement the core: fixed
//!   pools of frame-sized buffer elements, per-stream queued/done lists with
//!   a counting ready signal, and device lifecycle management (open
//!   reference counting, format negotiation, streaming on/off, and
//!   memory-to-memory pairing for transform devices).
//!
//! * The `driver` module defines the operation table that hardware-facing
//!   collaborators (sensor drivers, software codecs) implement in order to
//!   plug into the core. Drivers produce completed buffers from interrupt
//!   or task context through the done-path of `device`.
//!
//! * The `ioctl` and `node` modules expose the core over a fixed,
//!   V4L2-style numeric command surface: `ioctl` translates commands and
//!   typed argument structs into core operations, `node` maps device-node
//!   handles (open/close/ioctl/mmap) 1:1 onto it.
//!
pub mod buffer;
pub mod device;
pub mod driver;
pub mod ioctl;
pub mod memory;
pub mod node;
pub mod registry;
pub mod sync;

#[cfg(test)]
mod testutil;

use std::fmt;
use std::fmt::{Debug, Display};

use bitflags::bitflags;
use enumn::N;
use thiserror::Error;

/// Failure kinds shared by all layers of the framework.
///
/// The core layers return these unmodified; only the control dispatcher
/// translates them into stable external result codes.
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("no such device or entry")]
    NotFound,
    #[error("operation not supported by the driver")]
    Unsupported,
    #[error("out of memory")]
    OutOfMemory,
    #[error("wait timed out")]
    Timeout,
    #[error("stream stopped")]
    Stopped,
    #[error("driver error: {0}")]
    Driver(anyhow::Error),
}

/// Driver hooks propagate whatever error type they carry as an opaque
/// `Driver` failure.
impl From<anyhow::Error> for VideoError {
    fn from(err: anyhow::Error) -> Self {
        VideoError::Driver(err)
    }
}

pub type Result<T> = std::result::Result<T, VideoError>;

/// Possible directions for a stream. `Output` carries data into the device,
/// `Capture` carries data out of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamDirection {
    Output,
    Capture,
}

/// Types of streams supported by this library. The discriminants are the
/// V4L2 buffer type values, which the control surface exchanges verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum StreamType {
    VideoCapture = 1,
    VideoOutput = 2,
    MetaCapture = 13,
}

impl StreamType {
    /// Returns the direction of the stream type (Output or Capture).
    pub fn direction(&self) -> StreamDirection {
        match self {
            StreamType::VideoOutput => StreamDirection::Output,
            StreamType::VideoCapture | StreamType::MetaCapture => StreamDirection::Capture,
        }
    }
}

impl Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

bitflags! {
    /// Device capability bits, exchanged verbatim in the `QUERYCAP`
    /// capability descriptor. The values are the V4L2 ones.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE = 0x0000_0001;
        const VIDEO_OUTPUT = 0x0000_0002;
        const VIDEO_M2M = 0x0000_8000;
        const META_CAPTURE = 0x0080_0000;
        const READWRITE = 0x0100_0000;
        const STREAMING = 0x0400_0000;
        const DEVICE_CAPS = 0x8000_0000;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const SBGGR8: PixelFormat = PixelFormat::from_fourcc(b"BA81");
    pub const RGB565: PixelFormat = PixelFormat::from_fourcc(b"RGBP");
    pub const RGB24: PixelFormat = PixelFormat::from_fourcc(b"RGB3");
    pub const YUV420: PixelFormat = PixelFormat::from_fourcc(b"YU12");
    pub const YUV422P: PixelFormat = PixelFormat::from_fourcc(b"422P");
    pub const JPEG: PixelFormat = PixelFormat::from_fourcc(b"JPEG");
    pub const GREY: PixelFormat = PixelFormat::from_fourcc(b"GREY");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the description string reported by `ENUM_FMT` for the known
    /// pixel formats.
    pub fn description(self) -> Option<&'static str> {
        match self {
            PixelFormat::SBGGR8 => Some("RAW8 BGGR"),
            PixelFormat::RGB565 => Some("RGB 5-6-5"),
            PixelFormat::RGB24 => Some("RGB 8-8-8"),
            PixelFormat::YUV420 => Some("YUV 4:2:0"),
            PixelFormat::YUV422P => Some("YVU 4:2:2 planar"),
            PixelFormat::JPEG => Some("JPEG"),
            PixelFormat::GREY => Some("Grey 8"),
            _ => None,
        }
    }
}

impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"GREY") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use vidq::PixelFormat;
/// let grey = b"GREY";
/// let f = PixelFormat::from(grey);
/// assert_eq!(&<[u8; 4]>::from(f), grey);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Negotiated frame format of one stream.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixelformat: PixelFormat,
}

/// Quickly build a usable `Format` from a pixel format and resolution.
///
/// # Examples
///
/// ```
/// # use vidq::Format;
/// let f = Format::from((b"GREY", (640, 480)));
/// assert_eq!(f.width, 640);
/// assert_eq!(f.height, 480);
/// assert_eq!(f.pixelformat.to_string(), "GREY");
/// ```
impl<T: Into<PixelFormat>> From<(T, (usize, usize))> for Format {
    fn from((pixel_format, (width, height)): (T, (usize, usize))) -> Self {
        Format {
            width: width as u32,
            height: height as u32,
            pixelformat: pixel_format.into(),
        }
    }
}

/// Framework version packed the way `QUERYCAP` reports it:
/// `(major << 16) | (minor << 8) | patch`.
pub fn version() -> u32 {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch: u32 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    (major << 16) | (minor << 8) | patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_fourcc() {
        let grey = PixelFormat::from(b"GREY");
        assert_eq!(grey, PixelFormat::GREY);
        assert_eq!(grey.to_string(), "GREY");
        assert_eq!(u32::from(grey), u32::from_le(0x59455247));
        assert_eq!(format!("{:?}", grey), "0x59455247 (GREY)");
    }

    #[test]
    fn test_format_descriptions() {
        assert_eq!(PixelFormat::RGB565.description(), Some("RGB 5-6-5"));
        assert_eq!(PixelFormat::JPEG.description(), Some("JPEG"));
        assert_eq!(PixelFormat::from(b"ZZZZ").description(), None);
    }

    #[test]
    fn test_stream_type_direction() {
        assert_eq!(StreamType::VideoCapture.direction(), StreamDirection::Capture);
        assert_eq!(StreamType::VideoOutput.direction(), StreamDirection::Output);
        assert_eq!(StreamType::MetaCapture.direction(), StreamDirection::Capture);
        assert_eq!(StreamType::n(2u32), Some(StreamType::VideoOutput));
        assert_eq!(StreamType::n(7u32), None);
    }
}
