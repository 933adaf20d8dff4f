//! Control dispatcher: the fixed numeric command surface of a device.
//!
//! [`dispatch`] validates that the typed argument matches the command,
//! translates the pair into device/stream/pool operations, and is the only
//! layer that converts [`VideoError`] kinds into the stable external result
//! codes (`Errno`). It performs no I/O of its own.
//!
//! Mapped buffers are addressed by an opaque offset packing the stream type
//! and the element index; [`buf_offset`] and [`buf_offset_decode`] are the
//! encode/decode pair shared by `QUERYBUF` and `MMAP`.

use std::ptr::NonNull;

use bitflags::bitflags;
use enumn::N;
use log::debug;
use nix::errno::Errno;

use crate::device::Device;
use crate::driver::{ExtControls, QueryExtCtrl, QueryMenu, SensorFormat};
use crate::memory::MemoryType;
use crate::sync::Wait;
use crate::{Capabilities, Format, PixelFormat, Result, StreamType, VideoError};

/// Numeric commands of the control surface. The values are the V4L2 ioctl
/// numbers; the commands without a V4L2 counterpart live in the private
/// range starting at 192.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Ioctl {
    QueryCap = 0,
    EnumFmt = 2,
    GFmt = 4,
    SFmt = 5,
    Reqbufs = 8,
    QueryBuf = 9,
    QBuf = 15,
    DqBuf = 17,
    StreamOn = 18,
    StreamOff = 19,
    QueryMenu = 37,
    GExtCtrls = 71,
    SExtCtrls = 72,
    QueryExtCtrl = 103,
    Mmap = 192,
    SSensorFmt = 193,
    GSensorFmt = 194,
}

bitflags! {
    /// Buffer result flags reported by `DQBUF`. The values are the V4L2
    /// ones.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const MAPPED = 0x1;
        const QUEUED = 0x2;
        const DONE = 0x4;
        const ERROR = 0x40;
    }
}

/// Capability descriptor returned by `QUERYCAP`.
#[derive(Clone, Debug)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: Capabilities,
    /// Capabilities of this particular node, reported only when
    /// `capabilities` contains `DEVICE_CAPS`.
    pub device_caps: Option<Capabilities>,
}

impl Default for Capability {
    fn default() -> Self {
        Capability {
            driver: String::new(),
            card: String::new(),
            bus_info: String::new(),
            version: 0,
            capabilities: Capabilities::empty(),
            device_caps: None,
        }
    }
}

/// Format enumeration entry exchanged by `ENUM_FMT`: `stream` and `index`
/// are the inputs, the rest is filled on return.
#[derive(Clone, Debug)]
pub struct FmtDesc {
    pub stream: StreamType,
    pub index: u32,
    pub pixelformat: PixelFormat,
    pub description: String,
}

impl FmtDesc {
    pub fn new(stream: StreamType, index: u32) -> Self {
        FmtDesc {
            stream,
            index,
            pixelformat: PixelFormat::default(),
            description: String::new(),
        }
    }
}

/// Format descriptor exchanged by `G_FMT`/`S_FMT`.
#[derive(Clone, Debug)]
pub struct StreamFormat {
    pub stream: StreamType,
    pub format: Format,
}

/// Arguments of `REQBUFS`.
#[derive(Clone, Copy, Debug)]
pub struct RequestBuffers {
    pub stream: StreamType,
    pub memory: MemoryType,
    pub count: u32,
}

/// Buffer descriptor exchanged by `QUERYBUF`, `QBUF` and `DQBUF`.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub stream: StreamType,
    pub index: u32,
    pub memory: MemoryType,
    pub flags: BufferFlags,
    /// Bytes of valid data, set by `DQBUF`.
    pub bytesused: u32,
    /// Buffer length: set by `QUERYBUF` for mapped pools, supplied by the
    /// caller for user-pointer `QBUF`.
    pub length: u32,
    /// Opaque mapped-buffer address, set by `QUERYBUF` and consumed by
    /// `MMAP`.
    pub offset: u32,
    /// User pointer: supplied by the caller for user-pointer `QBUF`, set to
    /// the payload address by `DQBUF` for mapped buffers.
    pub userptr: usize,
}

impl BufferDesc {
    pub fn new(stream: StreamType, memory: MemoryType) -> Self {
        BufferDesc {
            stream,
            index: 0,
            memory,
            flags: BufferFlags::empty(),
            bytesused: 0,
            length: 0,
            offset: 0,
            userptr: 0,
        }
    }
}

/// Arguments of `MMAP`: resolves a `QUERYBUF` offset to a payload pointer.
#[derive(Clone, Copy, Debug)]
pub struct MmapRequest {
    pub offset: u32,
    pub length: u32,
    /// Resolved payload pointer, set on return.
    pub ptr: Option<NonNull<u8>>,
}

/// Typed argument of one command. [`dispatch`] rejects a command whose
/// argument is of the wrong shape.
#[derive(Debug)]
pub enum IoctlArg {
    QueryCap(Capability),
    EnumFmt(FmtDesc),
    GFmt(StreamFormat),
    SFmt(StreamFormat),
    Reqbufs(RequestBuffers),
    QueryBuf(BufferDesc),
    QBuf(BufferDesc),
    DqBuf(BufferDesc),
    StreamOn(StreamType),
    StreamOff(StreamType),
    Mmap(MmapRequest),
    GExtCtrls(ExtControls),
    SExtCtrls(ExtControls),
    QueryExtCtrl(QueryExtCtrl),
    QueryMenu(QueryMenu),
    SSensorFmt(SensorFormat),
    GSensorFmt(SensorFormat),
}

/// Pack a (stream type, element index) pair into the opaque offset handed
/// out by `QUERYBUF`: stream type in the high byte, index in the low 24
/// bits.
pub const fn buf_offset(stream: StreamType, index: u32) -> u32 {
    ((stream as u32) << 24) | (index & 0x00ff_ffff)
}

/// Decode an offset produced by [`buf_offset`].
pub fn buf_offset_decode(offset: u32) -> Result<(StreamType, u32)> {
    let stream = StreamType::n(offset >> 24)
        .ok_or(VideoError::InvalidArgument("offset stream type is invalid"))?;
    Ok((stream, offset & 0x00ff_ffff))
}

/// Stable external result codes of the control surface. This conversion is
/// the only place internal error kinds are translated.
impl From<&VideoError> for Errno {
    fn from(err: &VideoError) -> Self {
        match err {
            VideoError::InvalidArgument(_) => Errno::EINVAL,
            VideoError::InvalidState(_) => Errno::EBUSY,
            VideoError::NotFound => Errno::ENODEV,
            VideoError::Unsupported => Errno::ENOTTY,
            VideoError::OutOfMemory => Errno::ENOMEM,
            VideoError::Timeout => Errno::EAGAIN,
            VideoError::Stopped => Errno::ECANCELED,
            VideoError::Driver(_) => Errno::EIO,
        }
    }
}

impl From<VideoError> for Errno {
    fn from(err: VideoError) -> Self {
        Errno::from(&err)
    }
}

/// Decode `cmd`, check `arg` against it and run the matching device
/// operation. `wait` bounds a `DQBUF`'s wait for a completed buffer and is
/// ignored by every other command.
pub fn dispatch(device: &Device, cmd: u32, arg: &mut IoctlArg, wait: Wait) -> Result<()> {
    let cmd = Ioctl::n(cmd).ok_or(VideoError::InvalidArgument("unknown command"))?;

    match (cmd, arg) {
        (Ioctl::QueryCap, IoctlArg::QueryCap(cap)) => querycap(device, cap),
        (Ioctl::EnumFmt, IoctlArg::EnumFmt(desc)) => enum_fmt(device, desc),
        (Ioctl::GFmt, IoctlArg::GFmt(fmt)) => {
            fmt.format = device.format(fmt.stream)?;
            Ok(())
        }
        (Ioctl::SFmt, IoctlArg::SFmt(fmt)) => device.set_format(fmt.stream, &fmt.format),
        (Ioctl::Reqbufs, IoctlArg::Reqbufs(req)) => reqbufs(device, req),
        (Ioctl::QueryBuf, IoctlArg::QueryBuf(desc)) => querybuf(device, desc),
        (Ioctl::QBuf, IoctlArg::QBuf(desc)) => qbuf(device, desc),
        (Ioctl::DqBuf, IoctlArg::DqBuf(desc)) => dqbuf(device, desc, wait),
        (Ioctl::StreamOn, IoctlArg::StreamOn(stream)) => device.start_capture(*stream),
        (Ioctl::StreamOff, IoctlArg::StreamOff(stream)) => device.stop_capture(*stream),
        (Ioctl::Mmap, IoctlArg::Mmap(req)) => mmap(device, req),
        (Ioctl::GExtCtrls, IoctlArg::GExtCtrls(ctrls)) => device.get_ext_controls(ctrls),
        (Ioctl::SExtCtrls, IoctlArg::SExtCtrls(ctrls)) => device.set_ext_controls(ctrls),
        (Ioctl::QueryExtCtrl, IoctlArg::QueryExtCtrl(query)) => device.query_ext_control(query),
        (Ioctl::QueryMenu, IoctlArg::QueryMenu(query)) => device.query_menu(query),
        (Ioctl::SSensorFmt, IoctlArg::SSensorFmt(format)) => device.set_sensor_format(format),
        (Ioctl::GSensorFmt, IoctlArg::GSensorFmt(format)) => device.get_sensor_format(format),
        (cmd, _) => {
            debug!("{}: argument shape does not match {:?}", device.name(), cmd);
            Err(VideoError::InvalidArgument(
                "argument does not match command",
            ))
        }
    }
}

fn querycap(device: &Device, cap: &mut Capability) -> Result<()> {
    cap.driver = device.name().to_owned();
    cap.card = device.name().to_owned();
    cap.bus_info = format!("{}:{}", std::env::consts::ARCH, device.name());
    cap.version = crate::version();
    cap.capabilities = device.physical_caps();
    cap.device_caps = device
        .physical_caps()
        .contains(Capabilities::DEVICE_CAPS)
        .then(|| device.device_caps());
    Ok(())
}

fn enum_fmt(device: &Device, desc: &mut FmtDesc) -> Result<()> {
    let (pixelformat, description) = device.enum_format(desc.stream, desc.index as usize)?;
    desc.pixelformat = pixelformat;
    desc.description = description.to_owned();
    Ok(())
}

fn reqbufs(device: &Device, req: &RequestBuffers) -> Result<()> {
    if req.count == 0 {
        return Err(VideoError::InvalidArgument("buffer count is zero"));
    }
    device.request_buffers(req.stream, req.memory, req.count)
}

fn querybuf(device: &Device, desc: &mut BufferDesc) -> Result<()> {
    let config = device.buffer_config(desc.stream)?;
    if desc.memory != config.memory || desc.index >= config.count {
        return Err(VideoError::InvalidArgument(
            "buffer memory mode or index mismatch",
        ));
    }
    desc.length = config.size;
    if desc.memory == MemoryType::Mmap {
        desc.offset = buf_offset(desc.stream, desc.index);
    }
    Ok(())
}

fn mmap(device: &Device, req: &mut MmapRequest) -> Result<()> {
    let (stream, index) = buf_offset_decode(req.offset)?;
    let config = device.buffer_config(stream)?;
    if config.memory != MemoryType::Mmap || req.length > config.size || index >= config.count {
        return Err(VideoError::InvalidArgument("mapping request out of range"));
    }
    req.ptr = Some(device.element_payload(stream, index as usize)?);
    Ok(())
}

fn qbuf(device: &Device, desc: &BufferDesc) -> Result<()> {
    let config = device.buffer_config(desc.stream)?;
    if desc.memory != config.memory || desc.index >= config.count {
        return Err(VideoError::InvalidArgument(
            "buffer memory mode or index mismatch",
        ));
    }
    match config.memory {
        MemoryType::Mmap => device.queue_index(desc.stream, desc.index as usize),
        MemoryType::UserPtr => device.queue_user_ptr(
            desc.stream,
            desc.index as usize,
            desc.userptr as *mut u8,
            desc.length,
        ),
    }
}

fn dqbuf(device: &Device, desc: &mut BufferDesc, wait: Wait) -> Result<()> {
    let config = device.buffer_config(desc.stream)?;
    if desc.memory != config.memory {
        return Err(VideoError::InvalidArgument("buffer memory mode mismatch"));
    }

    let slot = device.recv_element(desc.stream, wait)?;

    desc.flags = BufferFlags::empty();
    desc.index = slot.index;
    desc.bytesused = slot.valid_size;
    desc.flags |= if slot.valid_size == 0 {
        BufferFlags::ERROR
    } else {
        BufferFlags::DONE
    };
    if desc.memory != MemoryType::UserPtr {
        if let Some(payload) = slot.payload {
            desc.userptr = payload.as_ptr() as usize;
            desc.flags |= BufferFlags::MAPPED;
        }
    }
    Ok(())
}
