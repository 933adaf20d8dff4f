//! Per-stream state: negotiated configuration and the queued/done lists.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::buffer::BufferPool;
use crate::memory::MemoryCaps;
use crate::sync::ReadySignal;
use crate::{Format, Result, StreamType, VideoError};

/// Buffer geometry a driver requires for one stream, derived from the
/// negotiated format. Must be populated before buffers can be requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    /// Size of one element in bytes.
    pub size: u32,
    /// Required alignment, a power of two.
    pub align: u32,
    /// Placement requirements of the backing memory.
    pub caps: MemoryCaps,
}

#[derive(Default)]
pub(crate) struct StreamConfig {
    pub(crate) started: bool,
    pub(crate) format: Option<Format>,
    pub(crate) requirements: Option<BufferRequirements>,
}

/// One data direction of a device. The queue state lives separately in
/// [`StreamQueue`], under the device-wide critical section.
pub(crate) struct Stream {
    pub(crate) ty: StreamType,
    pub(crate) config: Mutex<StreamConfig>,
    pub(crate) ready: ReadySignal,
}

impl Stream {
    pub(crate) fn new(ty: StreamType) -> Self {
        Stream {
            ty,
            config: Mutex::new(StreamConfig::default()),
            ready: ReadySignal::new(),
        }
    }
}

/// Queued/done lists and buffer pool of one stream. Only ever mutated under
/// the owning device's critical section; the lists hold pool indices.
///
/// Both lists are FIFO: elements are served to the driver in queue order and
/// to consumers in completion order.
#[derive(Default)]
pub(crate) struct StreamQueue {
    pub(crate) pool: Option<BufferPool>,
    pub(crate) queued: VecDeque<usize>,
    pub(crate) done: VecDeque<usize>,
}

impl StreamQueue {
    fn pool_mut(&mut self) -> Result<&mut BufferPool> {
        self.pool
            .as_mut()
            .ok_or(VideoError::InvalidState("buffers have not been requested"))
    }

    /// Hand element `index` to the driver side: free → queued.
    pub(crate) fn queue_index(&mut self, index: usize) -> Result<()> {
        let element = self
            .pool_mut()?
            .element_mut(index)
            .ok_or(VideoError::InvalidArgument("element index out of range"))?;
        if !element.is_free() {
            return Err(VideoError::InvalidArgument("element is already queued"));
        }
        element.set_allocated();
        self.queued.push_back(index);
        Ok(())
    }

    /// Driver takes the oldest queued element for filling. The element
    /// leaves the lists (ownership transfers to the driver context) and must
    /// come back through `done_index`.
    pub(crate) fn take_queued(&mut self) -> Option<usize> {
        let index = self.queued.pop_front()?;
        if let Some(element) = self.pool.as_mut().and_then(|p| p.element_mut(index)) {
            element.set_free();
        }
        Some(index)
    }

    /// Driver completed element `index` with `valid_size` bytes of payload:
    /// free → done.
    pub(crate) fn done_index(&mut self, index: usize, valid_size: u32) -> Result<()> {
        let element = self
            .pool_mut()?
            .element_mut(index)
            .ok_or(VideoError::InvalidArgument("element index out of range"))?;
        if !element.is_free() {
            return Err(VideoError::InvalidArgument("element is already listed"));
        }
        element.set_valid_size(valid_size);
        element.set_allocated();
        self.done.push_back(index);
        Ok(())
    }

    /// Consumer takes the oldest completed element: done → free.
    pub(crate) fn take_done(&mut self) -> Option<usize> {
        let index = self.done.pop_front()?;
        if let Some(element) = self.pool.as_mut().and_then(|p| p.element_mut(index)) {
            element.set_free();
        }
        Some(index)
    }

    /// Abandon all in-flight elements and return the pool to all-free.
    /// Idempotent: flushing an already-flushed queue does nothing.
    pub(crate) fn flush(&mut self) {
        self.queued.clear();
        self.done.clear();
        if let Some(pool) = self.pool.as_mut() {
            pool.reset();
        }
    }
}
