//! Operation table implemented by hardware-facing collaborators.
//!
//! A [`VideoDriver`] is the seam between this core and a concrete sensor,
//! capture engine or software codec. The core calls hooks from task context
//! only; drivers hand completed buffers back through the device's done-path,
//! which is the one entry point safe to call from completion (interrupt)
//! context.
//!
//! `set_format` is the only mandatory hook. `init` must, as a side effect,
//! populate each stream's format and buffer requirements on the device (see
//! [`crate::device::Device::set_stream_format`] and
//! [`crate::device::Device::set_buffer_requirements`]), since the element
//! size of a pool is derived from them.

use crate::device::Device;
use crate::{Format, PixelFormat, Result, StreamType, VideoError};

/// Event raised by the core towards the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverEvent {
    /// A buffer was queued on the given stream and can be picked up.
    BufferAvailable(StreamType),
    /// A consumer is waiting on an M2M device; run or kick the transform.
    M2mTrigger(StreamType),
}

/// One control id/value pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtControl {
    pub id: u32,
    pub value: i64,
}

/// A batch of controls applied or read as one unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtControls {
    pub class: u32,
    pub controls: Vec<ExtControl>,
}

/// Description of one control, filled by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryExtCtrl {
    pub id: u32,
    pub name: String,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
}

/// Entry of a menu control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MenuEntry {
    Name(String),
    Value(i64),
}

/// Menu item query, `entry` filled by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryMenu {
    pub id: u32,
    pub index: u32,
    pub entry: Option<MenuEntry>,
}

/// Sensor-level format, passed through to the sensor hooks untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SensorFormat {
    pub name: String,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Driver operation table.
///
/// Optional hooks default to `Unsupported`, except `init`/`deinit`/`notify`
/// which default to doing nothing, matching drivers that need no hardware
/// bring-up or notification handling.
pub trait VideoDriver: Send + Sync {
    /// Initialize hardware; runs on the 0→1 open transition. Must populate
    /// every stream's format and buffer requirements.
    fn init(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// De-initialize hardware; runs on the 1→0 close transition.
    fn deinit(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Start producing/consuming data on the given stream.
    fn start(&self, _device: &Device, _stream: StreamType) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    /// Stop the given stream. The core abandons all in-flight elements once
    /// this returns; the driver must not touch the stream afterwards.
    fn stop(&self, _device: &Device, _stream: StreamType) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    /// Return the `index`th pixel format supported on `stream`, or `None`
    /// past the end of the list.
    fn enum_format(
        &self,
        _device: &Device,
        _stream: StreamType,
        _index: usize,
    ) -> Option<PixelFormat> {
        None
    }

    /// Apply `format` on `stream`, adjusting hardware state and the
    /// stream's buffer requirements.
    fn set_format(&self, device: &Device, stream: StreamType, format: &Format) -> Result<()>;

    /// Event notification from the core.
    fn notify(&self, _device: &Device, _event: DriverEvent) -> Result<()> {
        Ok(())
    }

    fn set_ext_ctrls(&self, _device: &Device, _ctrls: &ExtControls) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    fn get_ext_ctrls(&self, _device: &Device, _ctrls: &mut ExtControls) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    fn query_ext_ctrl(&self, _device: &Device, _query: &mut QueryExtCtrl) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    fn set_sensor_format(&self, _device: &Device, _format: &SensorFormat) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    fn get_sensor_format(&self, _device: &Device, _format: &mut SensorFormat) -> Result<()> {
        Err(VideoError::Unsupported)
    }

    fn query_menu(&self, _device: &Device, _query: &mut QueryMenu) -> Result<()> {
        Err(VideoError::Unsupported)
    }
}
