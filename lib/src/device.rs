//! Video device objects: lifecycle, format negotiation and the buffer
//! exchange protocol between consumers and drivers.
//!
//! A [`Device`] is a named, capability-tagged endpoint bound to a
//! driver-supplied operation table. Capture-only, output-only and
//! meta-capture devices own one stream; memory-to-memory devices own a
//! capture and an output stream acting as a single transform unit (see the
//! `m2m` submodule).
//!
//! Hardware `init` runs only on the 0→1 open transition and `deinit` only
//! on 1→0, serialized by the device's lifecycle lock. All queue and pool
//! state of the device lives under one [`CriticalSection`], shared with the
//! driver's completion path; the ready signal of each stream is counted
//! outside of it so the done-path stays callable from completion context.

mod m2m;
mod stream;

pub use stream::BufferRequirements;

use std::ptr::NonNull;
use std::sync::Mutex;

use log::{debug, error};

use crate::buffer::{BufferConfig, BufferPool, Element};
use crate::driver::{
    DriverEvent, ExtControls, QueryExtCtrl, QueryMenu, SensorFormat, VideoDriver,
};
use crate::memory::MemoryType;
use crate::sync::{CriticalSection, Wait};
use crate::{Capabilities, Format, PixelFormat, Result, StreamDirection, StreamType, VideoError};

use stream::{Stream, StreamQueue};

/// Snapshot of one buffer element, exchanged with drivers and consumers.
///
/// Driver side: obtained from `take_queued`/`take_queued_pair`, the payload
/// is exclusively owned by the driver until the element is handed back
/// through the done-path. Consumer side: returned by `recv_element` for a
/// completed buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferSlot {
    /// Element index in its pool.
    pub index: u32,
    /// Payload pointer, `None` for a user-pointer element with no memory
    /// bound.
    pub payload: Option<NonNull<u8>>,
    /// Total capacity of the payload in bytes.
    pub capacity: u32,
    /// Bytes of valid data in the payload.
    pub valid_size: u32,
}

// The payload pointer targets pool storage that outlives the exchange (or
// caller-owned memory for user pointers); exclusivity is enforced by the
// element state machine, not by the slot itself.
unsafe impl Send for BufferSlot {}
unsafe impl Sync for BufferSlot {}

impl BufferSlot {
    fn from_element(element: &Element) -> Self {
        BufferSlot {
            index: element.index() as u32,
            payload: element.payload_ptr(),
            capacity: element.capacity(),
            valid_size: element.valid_size(),
        }
    }
}

/// A named, capability-tagged video device.
pub struct Device {
    name: String,
    id: u8,
    caps: Capabilities,
    device_caps: Capabilities,
    driver: Box<dyn VideoDriver>,
    /// Open reference count; also serializes init/deinit/start/stop. Never
    /// held across a blocking dequeue.
    lifecycle: Mutex<u8>,
    streams: Vec<Stream>,
    /// All queue/pool state, shared with the driver's completion path.
    queues: CriticalSection<Vec<StreamQueue>>,
}

impl Device {
    pub(crate) fn new(
        name: &str,
        id: u8,
        caps: Capabilities,
        device_caps: Capabilities,
        driver: Box<dyn VideoDriver>,
    ) -> Result<Device> {
        if name.is_empty() {
            return Err(VideoError::InvalidArgument("device name is empty"));
        }

        let stream_types: &[StreamType] = if caps.contains(Capabilities::VIDEO_CAPTURE) {
            &[StreamType::VideoCapture]
        } else if caps.contains(Capabilities::VIDEO_OUTPUT) {
            &[StreamType::VideoOutput]
        } else if caps.contains(Capabilities::VIDEO_M2M) {
            &[StreamType::VideoCapture, StreamType::VideoOutput]
        } else if caps.contains(Capabilities::META_CAPTURE) {
            &[StreamType::MetaCapture]
        } else {
            return Err(VideoError::InvalidArgument(
                "capabilities select no stream",
            ));
        };

        Ok(Device {
            name: name.to_owned(),
            id,
            caps,
            device_caps,
            driver,
            lifecycle: Mutex::new(0),
            streams: stream_types.iter().map(|ty| Stream::new(*ty)).collect(),
            queues: CriticalSection::new(
                stream_types.iter().map(|_| StreamQueue::default()).collect(),
            ),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Name of the external device node, derived from the numeric id.
    pub fn node_name(&self) -> String {
        format!("video{}", self.id)
    }

    pub fn physical_caps(&self) -> Capabilities {
        self.caps
    }

    pub fn device_caps(&self) -> Capabilities {
        self.device_caps
    }

    pub fn open_count(&self) -> u8 {
        *self.lifecycle.lock().unwrap()
    }

    fn stream_index(&self, ty: StreamType) -> Option<usize> {
        self.streams.iter().position(|s| s.ty == ty)
    }

    fn stream(&self, ty: StreamType) -> Result<(usize, &Stream)> {
        self.stream_index(ty)
            .map(|i| (i, &self.streams[i]))
            .ok_or(VideoError::InvalidArgument("no such stream on this device"))
    }

    /// Map a dataflow direction onto the stream type carrying it for this
    /// device. M2M devices route `Output` to their output stream and
    /// `Capture` to their capture stream; single-stream devices accept only
    /// their own direction.
    pub fn buf_type(&self, direction: StreamDirection) -> Result<StreamType> {
        if self.caps.contains(Capabilities::VIDEO_CAPTURE) {
            match direction {
                StreamDirection::Capture => Ok(StreamType::VideoCapture),
                StreamDirection::Output => Err(VideoError::InvalidArgument(
                    "capture device has no output stream",
                )),
            }
        } else if self.caps.contains(Capabilities::VIDEO_OUTPUT) {
            match direction {
                StreamDirection::Output => Ok(StreamType::VideoOutput),
                StreamDirection::Capture => Err(VideoError::InvalidArgument(
                    "output device has no capture stream",
                )),
            }
        } else if self.caps.contains(Capabilities::VIDEO_M2M) {
            Ok(match direction {
                StreamDirection::Output => StreamType::VideoOutput,
                StreamDirection::Capture => StreamType::VideoCapture,
            })
        } else if self.caps.contains(Capabilities::META_CAPTURE) {
            match direction {
                StreamDirection::Capture => Ok(StreamType::MetaCapture),
                StreamDirection::Output => Err(VideoError::InvalidArgument(
                    "meta device has no output stream",
                )),
            }
        } else {
            Err(VideoError::InvalidArgument("device carries no stream"))
        }
    }

    /// Bit set of the stream types this device supports, each type's
    /// numeric value used as the bit position.
    pub fn buffer_type_bits(&self) -> u32 {
        self.streams
            .iter()
            .fold(0, |bits, s| bits | (1 << (s.ty as u32)))
    }

    /// Increment the open reference count; on the 0→1 transition run the
    /// driver's `init` hook and bring every stream's list/signal state to
    /// its initial value. A failing `init` rolls the count back to zero.
    pub(crate) fn open_ref(&self) -> Result<()> {
        let mut refcount = self.lifecycle.lock().unwrap();
        *refcount = refcount
            .checked_add(1)
            .ok_or(VideoError::InvalidState("open reference count overflow"))?;
        if *refcount == 1 {
            if let Err(e) = self.driver.init(self) {
                error!("{}: driver init failed: {}", self.name, e);
                *refcount = 0;
                return Err(e);
            }
            for stream in &self.streams {
                stream.ready.reset();
            }
            self.queues.with(|queues| {
                for queue in queues.iter_mut() {
                    queue.pool = None;
                    queue.queued.clear();
                    queue.done.clear();
                }
            });
        }
        Ok(())
    }

    /// Decrement the open reference count; on the 1→0 transition run the
    /// driver's `deinit` hook and release every stream's ready signal and
    /// buffer pool.
    pub fn close(&self) -> Result<()> {
        let mut refcount = self.lifecycle.lock().unwrap();
        if *refcount == 0 {
            return Err(VideoError::InvalidState("device is not open"));
        }
        *refcount -= 1;
        if *refcount == 0 {
            if let Err(e) = self.driver.deinit(self) {
                error!("{}: driver deinit failed: {}", self.name, e);
                return Err(e);
            }
            for stream in &self.streams {
                stream.ready.reset();
                stream.config.lock().unwrap().started = false;
            }
            self.queues.with(|queues| {
                for queue in queues.iter_mut() {
                    queue.pool = None;
                    queue.queued.clear();
                    queue.done.clear();
                }
            });
        }
        Ok(())
    }

    /// Start capturing/processing on `ty`.
    pub fn start_capture(&self, ty: StreamType) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let (_, stream) = self.stream(ty)?;
        let mut config = stream.config.lock().unwrap();
        if config.started {
            return Err(VideoError::InvalidState("stream is already started"));
        }
        if let Err(e) = self.driver.start(self, ty) {
            error!("{}: driver start failed: {}", self.name, e);
            return Err(e);
        }
        stream.ready.resume();
        config.started = true;
        debug!("{}: {} streaming on", self.name, ty);
        Ok(())
    }

    /// Stop capturing/processing on `ty`: the stream's ready signal is
    /// drained (unblocking any waiter with a stopped result), both lists are
    /// cleared and the pool returns to all-free. Elements in flight with the
    /// driver are abandoned.
    pub fn stop_capture(&self, ty: StreamType) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let (index, stream) = self.stream(ty)?;
        let mut config = stream.config.lock().unwrap();
        if !config.started {
            return Err(VideoError::InvalidState("stream is not started"));
        }
        if let Err(e) = self.driver.stop(self, ty) {
            error!("{}: driver stop failed: {}", self.name, e);
            return Err(e);
        }
        stream.ready.stop();
        self.queues.with(|queues| queues[index].flush());
        config.started = false;
        debug!("{}: {} streaming off", self.name, ty);
        Ok(())
    }

    /// Return the `index`th supported pixel format of `ty` together with
    /// its description string.
    pub fn enum_format(&self, ty: StreamType, index: usize) -> Result<(PixelFormat, &'static str)> {
        self.stream(ty)?;
        let pixelformat = self
            .driver
            .enum_format(self, ty, index)
            .ok_or(VideoError::InvalidArgument("format index out of range"))?;
        let description = pixelformat.description().ok_or_else(|| {
            error!("{}: no description for format {}", self.name, pixelformat);
            VideoError::InvalidArgument("unknown pixel format")
        })?;
        Ok((pixelformat, description))
    }

    /// Currently negotiated format of `ty`.
    pub fn format(&self, ty: StreamType) -> Result<Format> {
        let (_, stream) = self.stream(ty)?;
        let config = stream.config.lock().unwrap();
        Ok(config.format.clone().unwrap_or_default())
    }

    /// Negotiate `format` on `ty` through the driver and record the result.
    pub fn set_format(&self, ty: StreamType, format: &Format) -> Result<()> {
        self.stream(ty)?;
        if let Err(e) = self.driver.set_format(self, ty, format) {
            error!("{}: driver set_format failed: {}", self.name, e);
            return Err(e);
        }
        self.set_stream_format(ty, format.clone())
    }

    /// Record `format` as the negotiated format of `ty` without consulting
    /// the driver. Drivers call this from their `init`/`set_format` hooks.
    pub fn set_stream_format(&self, ty: StreamType, format: Format) -> Result<()> {
        let (_, stream) = self.stream(ty)?;
        stream.config.lock().unwrap().format = Some(format);
        Ok(())
    }

    /// Record the buffer geometry `ty` requires. Drivers call this from
    /// their `init`/`set_format` hooks; pools cannot be requested before.
    pub fn set_buffer_requirements(
        &self,
        ty: StreamType,
        requirements: BufferRequirements,
    ) -> Result<()> {
        let (_, stream) = self.stream(ty)?;
        stream.config.lock().unwrap().requirements = Some(requirements);
        Ok(())
    }

    pub fn buffer_requirements(&self, ty: StreamType) -> Result<Option<BufferRequirements>> {
        let (_, stream) = self.stream(ty)?;
        Ok(stream.config.lock().unwrap().requirements)
    }

    /// Create the buffer pool of `ty`: `count` elements sized per the
    /// stream's requirements, in the given memory mode. Any previous pool is
    /// destroyed and the ready signal returns to its initial state.
    pub fn request_buffers(&self, ty: StreamType, memory: MemoryType, count: u32) -> Result<()> {
        let (index, stream) = self.stream(ty)?;
        let requirements = stream
            .config
            .lock()
            .unwrap()
            .requirements
            .ok_or(VideoError::InvalidState("buffer requirements not set"))?;

        let pool = BufferPool::new(BufferConfig {
            count,
            size: requirements.size,
            align: requirements.align,
            caps: requirements.caps,
            memory,
        })?;

        stream.ready.reset();
        self.queues.with(|queues| {
            let queue = &mut queues[index];
            queue.queued.clear();
            queue.done.clear();
            queue.pool = Some(pool);
        });

        debug!("{}: {} buffers requested on {} queue", self.name, count, ty);
        Ok(())
    }

    /// Geometry of the current pool of `ty`.
    pub fn buffer_config(&self, ty: StreamType) -> Result<BufferConfig> {
        let (index, _) = self.stream(ty)?;
        self.queues.with(|queues| {
            queues[index]
                .pool
                .as_ref()
                .map(|pool| *pool.config())
                .ok_or(VideoError::InvalidState("buffers have not been requested"))
        })
    }

    /// Hand element `index` of `ty` to the driver side. Fails with
    /// `InvalidArgument` if the element is not free (double-queue guard).
    pub fn queue_index(&self, ty: StreamType, index: usize) -> Result<()> {
        let (stream_index, _) = self.stream(ty)?;
        self.queues
            .with(|queues| queues[stream_index].queue_index(index))?;
        let _ = self.driver.notify(self, DriverEvent::BufferAvailable(ty));
        Ok(())
    }

    /// Bind caller memory to element `index` of a user-pointer pool and
    /// queue it. The pointer must be non-null, aligned per the pool config
    /// and at least one element large.
    pub fn queue_user_ptr(
        &self,
        ty: StreamType,
        index: usize,
        ptr: *mut u8,
        len: u32,
    ) -> Result<()> {
        let (stream_index, _) = self.stream(ty)?;
        self.queues.with(|queues| {
            let queue = &mut queues[stream_index];
            let config = *queue
                .pool
                .as_ref()
                .ok_or(VideoError::InvalidState("buffers have not been requested"))?
                .config();
            if config.memory != MemoryType::UserPtr {
                return Err(VideoError::InvalidArgument(
                    "pool does not use user-pointer memory",
                ));
            }
            let ptr =
                NonNull::new(ptr).ok_or(VideoError::InvalidArgument("user pointer is null"))?;
            if (ptr.as_ptr() as usize) % config.align as usize != 0 {
                return Err(VideoError::InvalidArgument("user pointer is misaligned"));
            }
            if len < config.size {
                return Err(VideoError::InvalidArgument("user buffer is too small"));
            }
            queue
                .pool
                .as_mut()
                .unwrap()
                .bind_user_ptr(index, ptr, len)?;
            queue.queue_index(index)
        })?;
        let _ = self.driver.notify(self, DriverEvent::BufferAvailable(ty));
        Ok(())
    }

    /// Driver side: take the oldest queued element of `ty` for filling. The
    /// element must come back through `done_index`/`done_buffer` before it
    /// can be queued again.
    pub fn take_queued(&self, ty: StreamType) -> Option<BufferSlot> {
        let stream_index = self.stream_index(ty)?;
        self.queues.with(|queues| {
            let queue = &mut queues[stream_index];
            let index = queue.take_queued()?;
            queue
                .pool
                .as_ref()
                .and_then(|pool| pool.element(index))
                .map(BufferSlot::from_element)
        })
    }

    /// Driver side: element `index` of `ty` was filled with `valid_size`
    /// bytes; list it as done and signal one waiting consumer. Safe to call
    /// from completion (interrupt) context.
    pub fn done_index(&self, ty: StreamType, index: usize, valid_size: u32) -> Result<()> {
        let (stream_index, stream) = self.stream(ty)?;
        self.queues
            .with(|queues| queues[stream_index].done_index(index, valid_size))?;
        stream.ready.signal();
        Ok(())
    }

    /// Driver side: complete the element whose payload starts at `ptr`.
    /// Safe to call from completion (interrupt) context.
    pub fn done_buffer(&self, ty: StreamType, ptr: *const u8, valid_size: u32) -> Result<()> {
        let (stream_index, stream) = self.stream(ty)?;
        self.queues.with(|queues| {
            let queue = &mut queues[stream_index];
            let index = queue
                .pool
                .as_ref()
                .ok_or(VideoError::InvalidState("buffers have not been requested"))?
                .lookup_by_pointer(ptr)
                .ok_or(VideoError::InvalidArgument("no element matches pointer"))?;
            queue.done_index(index, valid_size)
        })?;
        stream.ready.signal();
        Ok(())
    }

    /// Consumer side: wait up to `wait` for a completed element of `ty` and
    /// remove it from the done list. This is the sole suspension point of
    /// the consumer path; `stop_capture` unblocks it with `Stopped`.
    ///
    /// On an M2M device the driver's transform trigger is raised first, so
    /// software codecs convert on demand.
    pub fn recv_element(&self, ty: StreamType, wait: Wait) -> Result<BufferSlot> {
        let (stream_index, stream) = self.stream(ty)?;

        if self.device_caps.contains(Capabilities::VIDEO_M2M) {
            self.driver.notify(self, DriverEvent::M2mTrigger(ty))?;
        }

        stream.ready.acquire(wait)?;
        self.queues.with(|queues| {
            let queue = &mut queues[stream_index];
            // A concurrent stop may have flushed the list between the signal
            // and this section.
            let index = queue.take_done().ok_or(VideoError::Stopped)?;
            queue
                .pool
                .as_ref()
                .and_then(|pool| pool.element(index))
                .map(BufferSlot::from_element)
                .ok_or(VideoError::Stopped)
        })
    }

    /// Resolve element `index` of `ty` to its payload pointer, for zero-copy
    /// access by the consumer.
    pub fn element_payload(&self, ty: StreamType, index: usize) -> Result<NonNull<u8>> {
        let (stream_index, _) = self.stream(ty)?;
        self.queues.with(|queues| {
            queues[stream_index]
                .pool
                .as_ref()
                .ok_or(VideoError::InvalidState("buffers have not been requested"))?
                .element(index)
                .ok_or(VideoError::InvalidArgument("element index out of range"))?
                .payload_ptr()
                .ok_or(VideoError::InvalidState("element has no bound memory"))
        })
    }

    /// Apply a batch of driver controls.
    pub fn set_ext_controls(&self, ctrls: &ExtControls) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        if let Err(e) = self.driver.set_ext_ctrls(self, ctrls) {
            error!("{}: driver set_ext_ctrls failed: {}", self.name, e);
            return Err(e);
        }
        Ok(())
    }

    /// Read back a batch of driver controls.
    pub fn get_ext_controls(&self, ctrls: &mut ExtControls) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        if let Err(e) = self.driver.get_ext_ctrls(self, ctrls) {
            error!("{}: driver get_ext_ctrls failed: {}", self.name, e);
            return Err(e);
        }
        Ok(())
    }

    pub fn query_ext_control(&self, query: &mut QueryExtCtrl) -> Result<()> {
        self.driver.query_ext_ctrl(self, query)
    }

    pub fn query_menu(&self, query: &mut QueryMenu) -> Result<()> {
        self.driver.query_menu(self, query)
    }

    pub fn set_sensor_format(&self, format: &SensorFormat) -> Result<()> {
        self.driver.set_sensor_format(self, format)
    }

    pub fn get_sensor_format(&self, format: &mut SensorFormat) -> Result<()> {
        self.driver.get_sensor_format(self, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capture_device, FakeCapture};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    fn ready_count(device: &Device, ty: StreamType) -> usize {
        let (_, stream) = device.stream(ty).unwrap();
        stream.ready.count()
    }

    fn done_len(device: &Device, ty: StreamType) -> usize {
        let index = device.stream_index(ty).unwrap();
        device.queues.with(|queues| queues[index].done.len())
    }

    #[test]
    fn test_ready_signal_tracks_done_list() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.request_buffers(ty, MemoryType::Mmap, 3).unwrap();

        for i in 0..3 {
            device.queue_index(ty, i).unwrap();
            assert_eq!(ready_count(&device, ty), done_len(&device, ty));
        }
        for _ in 0..3 {
            let slot = device.take_queued(ty).unwrap();
            device.done_index(ty, slot.index as usize, 16).unwrap();
            assert_eq!(ready_count(&device, ty), done_len(&device, ty));
        }
        for _ in 0..3 {
            device.recv_element(ty, Wait::None).unwrap();
            assert_eq!(ready_count(&device, ty), done_len(&device, ty));
        }
    }

    #[test]
    fn test_pool_round_trip_order() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.request_buffers(ty, MemoryType::Mmap, 4).unwrap();

        // Two full cycles; every element comes back exactly once per cycle,
        // in completion order.
        for cycle in 0..2 {
            for i in 0..4 {
                device.queue_index(ty, i).unwrap();
            }
            for i in 0..4 {
                let slot = device.take_queued(ty).unwrap();
                assert_eq!(slot.index as usize, i);
                device
                    .done_index(ty, slot.index as usize, 100 + cycle)
                    .unwrap();
            }
            for i in 0..4 {
                let slot = device.recv_element(ty, Wait::None).unwrap();
                assert_eq!(slot.index as usize, i);
                assert_eq!(slot.valid_size, 100 + cycle);
            }
        }
    }

    #[test]
    fn test_double_queue_leaves_lists_unchanged() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.request_buffers(ty, MemoryType::Mmap, 2).unwrap();

        device.queue_index(ty, 0).unwrap();
        assert!(matches!(
            device.queue_index(ty, 0),
            Err(VideoError::InvalidArgument(_))
        ));
        let index = device.stream_index(ty).unwrap();
        device
            .queues
            .with(|queues| assert_eq!(queues[index].queued.len(), 1));
    }

    #[test]
    fn test_stop_drains_and_unblocks() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.request_buffers(ty, MemoryType::Mmap, 2).unwrap();
        device.start_capture(ty).unwrap();
        device.queue_index(ty, 0).unwrap();

        let waiter = {
            let device = Arc::clone(&device);
            thread::spawn(move || device.recv_element(ty, Wait::Forever))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        device.stop_capture(ty).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(VideoError::Stopped)));

        // Stopping again without a start is an error, but the stream state
        // itself is already clean.
        assert!(matches!(
            device.stop_capture(ty),
            Err(VideoError::InvalidState(_))
        ));
        assert_eq!(ready_count(&device, ty), 0);
        assert_eq!(done_len(&device, ty), 0);

        // Restart clears the stopped latch and a new cycle works.
        device.start_capture(ty).unwrap();
        device.queue_index(ty, 0).unwrap();
        let slot = device.take_queued(ty).unwrap();
        device.done_index(ty, slot.index as usize, 8).unwrap();
        assert_eq!(device.recv_element(ty, Wait::None).unwrap().index, 0);
    }

    #[test]
    fn test_start_twice_rejected() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.start_capture(ty).unwrap();
        assert!(matches!(
            device.start_capture(ty),
            Err(VideoError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reference_counting_init_once() {
        const OPENS: usize = 8;
        let driver = FakeCapture::new();
        let inits = Arc::clone(&driver.inits);
        let deinits = Arc::clone(&driver.deinits);
        let device = Arc::new(
            Device::new(
                "cam1",
                1,
                Capabilities::VIDEO_CAPTURE,
                Capabilities::VIDEO_CAPTURE,
                Box::new(driver),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..OPENS)
            .map(|_| {
                let device = Arc::clone(&device);
                thread::spawn(move || device.open_ref().unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(device.open_count() as usize, OPENS);
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        let handles: Vec<_> = (0..OPENS)
            .map(|_| {
                let device = Arc::clone(&device);
                thread::spawn(move || device.close().unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(device.open_count(), 0);
        assert_eq!(deinits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            device.close(),
            Err(VideoError::InvalidState(_))
        ));
    }

    #[test]
    fn test_user_pointer_validation() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        device.request_buffers(ty, MemoryType::UserPtr, 2).unwrap();

        let mut backing = vec![0u8; 8192];
        let base = backing.as_mut_ptr();
        let aligned = unsafe { base.add(base.align_offset(64)) };

        assert!(matches!(
            device.queue_user_ptr(ty, 0, std::ptr::null_mut(), 4096),
            Err(VideoError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.queue_user_ptr(ty, 0, unsafe { aligned.add(1) }, 4096),
            Err(VideoError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.queue_user_ptr(ty, 0, aligned, 100),
            Err(VideoError::InvalidArgument(_))
        ));
        device.queue_user_ptr(ty, 0, aligned, 4096).unwrap();

        let slot = device.take_queued(ty).unwrap();
        assert_eq!(slot.payload.unwrap().as_ptr(), aligned);
        assert_eq!(slot.capacity, 4096);
    }

    #[test]
    fn test_enum_format_and_descriptions() {
        let device = capture_device();
        let ty = StreamType::VideoCapture;
        assert_eq!(
            device.enum_format(ty, 0).unwrap(),
            (PixelFormat::GREY, "Grey 8")
        );
        assert_eq!(
            device.enum_format(ty, 1).unwrap(),
            (PixelFormat::RGB565, "RGB 5-6-5")
        );
        assert!(matches!(
            device.enum_format(ty, 2),
            Err(VideoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_buf_type_mapping() {
        let device = capture_device();
        assert_eq!(
            device.buf_type(StreamDirection::Capture).unwrap(),
            StreamType::VideoCapture
        );
        assert!(device.buf_type(StreamDirection::Output).is_err());
        assert_eq!(device.buffer_type_bits(), 1 << 1);
    }
}
