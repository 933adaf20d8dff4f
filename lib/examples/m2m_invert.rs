//! This example program registers a software memory-to-memory "negative
//! filter" device and drives it through the device-node ABI: buffers are
//! negotiated with REQBUFS, filled through MMAP, exchanged with QBUF/DQBUF,
//! and the transform runs on the driver's M2M trigger.

use clap::{App, Arg};

use vidq::device::{BufferRequirements, Device};
use vidq::driver::{DriverEvent, VideoDriver};
use vidq::ioctl::{BufferDesc, Capability, FmtDesc, Ioctl, IoctlArg, RequestBuffers};
use vidq::memory::{MemoryCaps, MemoryType};
use vidq::node::{NodeConfig, VideoNode};
use vidq::registry::{DeviceRegistration, Registry};
use vidq::{Capabilities, Format, PixelFormat, Result, StreamType, VideoError};

const WIDTH: usize = 64;
const HEIGHT: usize = 64;

/// Software codec inverting every payload byte.
struct InverterDriver;

impl VideoDriver for InverterDriver {
    fn init(&self, device: &Device) -> Result<()> {
        for ty in [StreamType::VideoCapture, StreamType::VideoOutput] {
            device.set_stream_format(ty, Format::from((b"GREY", (WIDTH, HEIGHT))))?;
            device.set_buffer_requirements(
                ty,
                BufferRequirements {
                    size: (WIDTH * HEIGHT) as u32,
                    align: 64,
                    caps: MemoryCaps::INTERNAL | MemoryCaps::DMA,
                },
            )?;
        }
        Ok(())
    }

    fn start(&self, _device: &Device, _stream: StreamType) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _device: &Device, _stream: StreamType) -> Result<()> {
        Ok(())
    }

    fn enum_format(
        &self,
        _device: &Device,
        _stream: StreamType,
        index: usize,
    ) -> Option<PixelFormat> {
        (index == 0).then_some(PixelFormat::GREY)
    }

    fn set_format(&self, device: &Device, stream: StreamType, format: &Format) -> Result<()> {
        device.set_buffer_requirements(
            stream,
            BufferRequirements {
                size: format.width * format.height,
                align: 64,
                caps: MemoryCaps::INTERNAL | MemoryCaps::DMA,
            },
        )
    }

    fn notify(&self, device: &Device, event: DriverEvent) -> Result<()> {
        if let DriverEvent::M2mTrigger(StreamType::VideoCapture) = event {
            let res = device.run_transform(
                StreamType::VideoOutput,
                StreamType::VideoCapture,
                |src, dst| {
                    for (d, s) in dst.iter_mut().zip(src.iter()) {
                        *d = !*s;
                    }
                    Ok(src.len().min(dst.len()))
                },
            );
            // A trigger with nothing queued yet is not an error.
            if !matches!(res, Err(VideoError::NotFound)) {
                res?;
            }
        }
        Ok(())
    }
}

fn ioctl(node: &VideoNode, cmd: Ioctl, arg: &mut IoctlArg) {
    node.ioctl(cmd as u32, arg)
        .unwrap_or_else(|e| panic!("{:?} failed: {}", cmd, e));
}

fn map_buffer(node: &VideoNode, stream: StreamType, index: u32) -> &'static mut [u8] {
    let mut arg = IoctlArg::QueryBuf(BufferDesc {
        index,
        ..BufferDesc::new(stream, MemoryType::Mmap)
    });
    ioctl(node, Ioctl::QueryBuf, &mut arg);
    let IoctlArg::QueryBuf(desc) = arg else {
        unreachable!()
    };
    let ptr = node.mmap(desc.offset, desc.length).expect("mmap failed");
    // The mapping stays valid as long as the pool exists, i.e. for the whole
    // streaming session below.
    unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), desc.length as usize) }
}

fn main() {
    env_logger::init();

    let matches = App::new("m2m_invert example")
        .arg(
            Arg::with_name("num_frames")
                .long("frames")
                .takes_value(true)
                .default_value("4")
                .help("Number of frames to push through the transform"),
        )
        .arg(
            Arg::with_name("num_buffers")
                .long("buffers")
                .takes_value(true)
                .default_value("2")
                .help("Number of buffers to allocate per queue"),
        )
        .get_matches();

    let num_frames: usize = matches
        .value_of("num_frames")
        .unwrap()
        .parse()
        .expect("invalid --frames");
    let num_buffers: u32 = matches
        .value_of("num_buffers")
        .unwrap()
        .parse()
        .expect("invalid --buffers");

    let registry = Registry::global();
    registry
        .register(DeviceRegistration {
            name: "inverter".into(),
            id: 0,
            caps: Capabilities::VIDEO_M2M | Capabilities::STREAMING | Capabilities::DEVICE_CAPS,
            device_caps: Capabilities::VIDEO_M2M | Capabilities::STREAMING,
            driver: Box::new(InverterDriver),
        })
        .expect("registration failed");

    let node = VideoNode::open(registry, "inverter", NodeConfig::new()).expect("open failed");

    let mut arg = IoctlArg::QueryCap(Capability::default());
    ioctl(&node, Ioctl::QueryCap, &mut arg);
    if let IoctlArg::QueryCap(cap) = &arg {
        println!(
            "{} ({}) version {:#x}: {}",
            cap.driver, cap.bus_info, cap.version, cap.capabilities
        );
    }

    let mut arg = IoctlArg::EnumFmt(FmtDesc::new(StreamType::VideoCapture, 0));
    ioctl(&node, Ioctl::EnumFmt, &mut arg);
    if let IoctlArg::EnumFmt(desc) = &arg {
        println!("capture format 0: {} ({})", desc.pixelformat, desc.description);
    }

    for stream in [StreamType::VideoOutput, StreamType::VideoCapture] {
        let mut arg = IoctlArg::Reqbufs(RequestBuffers {
            stream,
            memory: MemoryType::Mmap,
            count: num_buffers,
        });
        ioctl(&node, Ioctl::Reqbufs, &mut arg);
        let mut arg = IoctlArg::StreamOn(stream);
        ioctl(&node, Ioctl::StreamOn, &mut arg);
    }

    for frame in 0..num_frames {
        let index = (frame as u32) % num_buffers;

        let src = map_buffer(&node, StreamType::VideoOutput, index);
        src.fill(frame as u8);

        for stream in [StreamType::VideoOutput, StreamType::VideoCapture] {
            let mut arg = IoctlArg::QBuf(BufferDesc {
                index,
                ..BufferDesc::new(stream, MemoryType::Mmap)
            });
            ioctl(&node, Ioctl::QBuf, &mut arg);
        }

        let mut arg = IoctlArg::DqBuf(BufferDesc::new(StreamType::VideoCapture, MemoryType::Mmap));
        ioctl(&node, Ioctl::DqBuf, &mut arg);
        let IoctlArg::DqBuf(desc) = arg else {
            unreachable!()
        };
        let dst = map_buffer(&node, StreamType::VideoCapture, desc.index);
        println!(
            "frame {}: buffer {} done, {} bytes, first byte {:#04x}",
            frame, desc.index, desc.bytesused, dst[0]
        );
        assert_eq!(dst[0], !(frame as u8));

        // Recycle the source buffer.
        let mut arg = IoctlArg::DqBuf(BufferDesc::new(StreamType::VideoOutput, MemoryType::Mmap));
        ioctl(&node, Ioctl::DqBuf, &mut arg);
    }

    for stream in [StreamType::VideoOutput, StreamType::VideoCapture] {
        let mut arg = IoctlArg::StreamOff(stream);
        ioctl(&node, Ioctl::StreamOff, &mut arg);
    }

    node.close().expect("close failed");
    registry.unregister("inverter").expect("unregister failed");
    println!("{} frames transformed", num_frames);
}
