//! Fake drivers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::device::{BufferRequirements, Device};
use crate::driver::{DriverEvent, VideoDriver};
use crate::memory::MemoryCaps;
use crate::registry::{DeviceRegistration, Registry};
use crate::{Capabilities, Format, PixelFormat, Result, StreamType};

pub(crate) const TEST_BUF_SIZE: u32 = 4096;
pub(crate) const TEST_ALIGN: u32 = 64;

fn test_requirements() -> BufferRequirements {
    BufferRequirements {
        size: TEST_BUF_SIZE,
        align: TEST_ALIGN,
        caps: MemoryCaps::INTERNAL | MemoryCaps::DMA,
    }
}

/// Single-stream capture driver counting its init/deinit invocations.
pub(crate) struct FakeCapture {
    pub inits: Arc<AtomicUsize>,
    pub deinits: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn new() -> Self {
        FakeCapture {
            inits: Arc::new(AtomicUsize::new(0)),
            deinits: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl VideoDriver for FakeCapture {
    fn init(&self, device: &Device) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        device.set_stream_format(StreamType::VideoCapture, Format::from((b"GREY", (64, 64))))?;
        device.set_buffer_requirements(StreamType::VideoCapture, test_requirements())
    }

    fn deinit(&self, _device: &Device) -> Result<()> {
        self.deinits.fetch_add(1, Ordering::SeqCst);
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
        [PixelFormat::GREY, PixelFormat::RGB565].get(index).copied()
    }

    fn set_format(&self, device: &Device, stream: StreamType, format: &Format) -> Result<()> {
        device.set_buffer_requirements(
            stream,
            BufferRequirements {
                size: format.width * format.height,
                ..test_requirements()
            },
        )
    }
}

/// M2M driver inverting every payload byte on the transform trigger, wired
/// the way the hardware codec devices are: the trigger on the capture side
/// runs one transform, triggers on the output side do nothing.
pub(crate) struct FakeInverter;

impl VideoDriver for FakeInverter {
    fn init(&self, device: &Device) -> Result<()> {
        for ty in [StreamType::VideoCapture, StreamType::VideoOutput] {
            device.set_stream_format(ty, Format::from((b"GREY", (64, 64))))?;
            device.set_buffer_requirements(ty, test_requirements())?;
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

    fn set_format(&self, _device: &Device, _stream: StreamType, _format: &Format) -> Result<()> {
        Ok(())
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
            // A trigger with no queued pair is a no-op.
            if !matches!(res, Err(crate::VideoError::NotFound)) {
                res?;
            }
        }
        Ok(())
    }
}

pub(crate) fn capture_device() -> Arc<Device> {
    let registry = Registry::new();
    let device = registry
        .register(DeviceRegistration {
            name: "cam0".into(),
            id: 0,
            caps: Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
            device_caps: Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
            driver: Box::new(FakeCapture::new()),
        })
        .unwrap();
    registry.open("cam0").unwrap();
    device
}

pub(crate) fn m2m_device() -> Arc<Device> {
    let registry = Registry::new();
    let device = registry
        .register(DeviceRegistration {
            name: "codec0".into(),
            id: 10,
            caps: Capabilities::VIDEO_M2M | Capabilities::STREAMING | Capabilities::DEVICE_CAPS,
            device_caps: Capabilities::VIDEO_M2M | Capabilities::STREAMING,
            driver: Box::new(FakeInverter),
        })
        .unwrap();
    registry.open("codec0").unwrap();
    device
}
