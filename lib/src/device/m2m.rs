//! Memory-to-memory pairing: a transform device moves data from an
//! output-side element into a capture-side element, and the two halves of a
//! pair always change lists together. No operation here ever applies to one
//! side only; a partial pair is a failure, not a partial success.

use log::debug;

use crate::device::{BufferSlot, Device};
use crate::sync::Wait;
use crate::{Result, StreamType, VideoError};

use super::stream::StreamQueue;

/// Split borrow of two distinct stream queues.
fn pair_mut(
    queues: &mut [StreamQueue],
    src: usize,
    dst: usize,
) -> (&mut StreamQueue, &mut StreamQueue) {
    if src < dst {
        let (head, tail) = queues.split_at_mut(dst);
        (&mut head[src], &mut tail[0])
    } else {
        let (head, tail) = queues.split_at_mut(src);
        (&mut tail[0], &mut head[dst])
    }
}

impl Device {
    fn stream_pair(&self, src_ty: StreamType, dst_ty: StreamType) -> Result<(usize, usize)> {
        let (src, _) = self.stream(src_ty)?;
        let (dst, _) = self.stream(dst_ty)?;
        if src == dst {
            return Err(VideoError::InvalidArgument(
                "source and destination streams are the same",
            ));
        }
        Ok((src, dst))
    }

    /// Queue `src_index`/`dst_index` as one transform pair. Both elements
    /// must be free; otherwise nothing is queued and `InvalidState` is
    /// returned.
    pub fn queue_pair(
        &self,
        src_ty: StreamType,
        src_index: usize,
        dst_ty: StreamType,
        dst_index: usize,
    ) -> Result<()> {
        let (src, dst) = self.stream_pair(src_ty, dst_ty)?;
        self.queues.with(|queues| {
            let (src_q, dst_q) = pair_mut(queues, src, dst);
            if !(element_is_free(src_q, src_index)? && element_is_free(dst_q, dst_index)?) {
                return Err(VideoError::InvalidState("pair element is not free"));
            }
            src_q.queue_index(src_index)?;
            dst_q.queue_index(dst_index)
        })
    }

    /// Take the oldest queued pair for processing. Fails with `NotFound`
    /// unless both queued lists are non-empty, so a transform never runs
    /// with a missing side.
    pub fn take_queued_pair(
        &self,
        src_ty: StreamType,
        dst_ty: StreamType,
    ) -> Result<(BufferSlot, BufferSlot)> {
        let (src, dst) = self.stream_pair(src_ty, dst_ty)?;
        self.queues.with(|queues| {
            let (src_q, dst_q) = pair_mut(queues, src, dst);
            if src_q.queued.is_empty() || dst_q.queued.is_empty() {
                return Err(VideoError::NotFound);
            }
            let src_slot = take_queued_slot(src_q);
            let dst_slot = take_queued_slot(dst_q);
            Ok((src_slot?, dst_slot?))
        })
    }

    /// Complete a transform pair: both elements move to their done lists
    /// under one critical section, then both ready signals are raised, so a
    /// waiter on either side never observes half a pair.
    pub fn done_pair(
        &self,
        src_ty: StreamType,
        src: &BufferSlot,
        dst_ty: StreamType,
        dst: &BufferSlot,
    ) -> Result<()> {
        let (src_i, dst_i) = self.stream_pair(src_ty, dst_ty)?;
        self.queues.with(|queues| {
            let (src_q, dst_q) = pair_mut(queues, src_i, dst_i);
            if !(element_is_free(src_q, src.index as usize)?
                && element_is_free(dst_q, dst.index as usize)?)
            {
                return Err(VideoError::InvalidState("pair element is not free"));
            }
            src_q.done_index(src.index as usize, src.valid_size)?;
            dst_q.done_index(dst.index as usize, dst.valid_size)
        })?;
        self.streams[src_i].ready.signal();
        self.streams[dst_i].ready.signal();
        Ok(())
    }

    /// Run one transform: pop a queued pair, feed it to `transform`, and
    /// push both halves done. On transform failure the destination's
    /// valid size is zero, which consumers observe as an error-flagged
    /// buffer; the pair still completes.
    ///
    /// The transform receives the full source element capacity and returns
    /// the number of bytes produced into the destination.
    pub fn run_transform<F>(&self, src_ty: StreamType, dst_ty: StreamType, transform: F) -> Result<()>
    where
        F: FnOnce(&[u8], &mut [u8]) -> Result<usize>,
    {
        let (src, mut dst) = self.take_queued_pair(src_ty, dst_ty)?;

        let produced = match (src.payload, dst.payload) {
            (Some(src_ptr), Some(dst_ptr)) => {
                // Safe: both elements are owned by this context between
                // take_queued_pair and done_pair, and the backing storage is
                // stable for the lifetime of the pools.
                let src_bytes =
                    unsafe { std::slice::from_raw_parts(src_ptr.as_ptr(), src.capacity as usize) };
                let dst_bytes = unsafe {
                    std::slice::from_raw_parts_mut(dst_ptr.as_ptr(), dst.capacity as usize)
                };
                match transform(src_bytes, dst_bytes) {
                    Ok(n) => (n as u32).min(dst.capacity),
                    Err(e) => {
                        debug!("{}: transform failed: {}", self.name(), e);
                        0
                    }
                }
            }
            _ => 0,
        };

        dst.valid_size = produced;
        self.done_pair(src_ty, &src, dst_ty, &dst)
    }

    /// Consumer-side convenience for M2M devices: queue a pair by index and
    /// wait for the transformed destination element.
    pub fn process_pair(
        &self,
        src_ty: StreamType,
        src_index: usize,
        dst_ty: StreamType,
        dst_index: usize,
        wait: Wait,
    ) -> Result<BufferSlot> {
        self.queue_pair(src_ty, src_index, dst_ty, dst_index)?;
        self.recv_element(dst_ty, wait)
    }
}

fn element_is_free(queue: &StreamQueue, index: usize) -> Result<bool> {
    Ok(queue
        .pool
        .as_ref()
        .ok_or(VideoError::InvalidState("buffers have not been requested"))?
        .element(index)
        .ok_or(VideoError::InvalidArgument("element index out of range"))?
        .is_free())
}

fn take_queued_slot(queue: &mut StreamQueue) -> Result<BufferSlot> {
    let index = queue
        .take_queued()
        .ok_or(VideoError::NotFound)?;
    queue
        .pool
        .as_ref()
        .and_then(|pool| pool.element(index))
        .map(BufferSlot::from_element)
        .ok_or(VideoError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;
    use crate::testutil::m2m_device;
    use anyhow::anyhow;

    const SRC: StreamType = StreamType::VideoOutput;
    const DST: StreamType = StreamType::VideoCapture;

    #[test]
    fn test_queue_pair_all_or_nothing() {
        let device = m2m_device();
        device.request_buffers(SRC, MemoryType::Mmap, 2).unwrap();
        device.request_buffers(DST, MemoryType::Mmap, 2).unwrap();

        // Occupy the destination element, then try to pair with it.
        device.queue_index(DST, 0).unwrap();
        assert!(matches!(
            device.queue_pair(SRC, 0, DST, 0),
            Err(VideoError::InvalidState(_))
        ));
        // Neither queued list changed length.
        assert!(device.take_queued(SRC).is_none());
        assert_eq!(device.take_queued(DST).unwrap().index, 0);
    }

    #[test]
    fn test_dequeue_pair_needs_both_sides() {
        let device = m2m_device();
        device.request_buffers(SRC, MemoryType::Mmap, 2).unwrap();
        device.request_buffers(DST, MemoryType::Mmap, 2).unwrap();

        device.queue_index(SRC, 0).unwrap();
        assert!(matches!(
            device.take_queued_pair(SRC, DST),
            Err(VideoError::NotFound)
        ));
        // The source element is still queued.
        device.queue_index(DST, 0).unwrap();
        let (src, dst) = device.take_queued_pair(SRC, DST).unwrap();
        assert_eq!(src.index, 0);
        assert_eq!(dst.index, 0);
    }

    #[test]
    fn test_transform_inverts_payload() {
        let device = m2m_device();
        device.request_buffers(SRC, MemoryType::Mmap, 1).unwrap();
        device.request_buffers(DST, MemoryType::Mmap, 1).unwrap();

        let src_ptr = device.element_payload(SRC, 0).unwrap();
        unsafe { std::ptr::write_bytes(src_ptr.as_ptr(), 0x5a, 16) };

        device.queue_pair(SRC, 0, DST, 0).unwrap();
        // The FakeInverter driver transforms on the capture-side trigger
        // raised by recv_element.
        let dst = device.recv_element(DST, Wait::None).unwrap();
        assert_eq!(dst.valid_size, dst.capacity);
        let dst_ptr = dst.payload.unwrap();
        let transformed = unsafe { std::slice::from_raw_parts(dst_ptr.as_ptr(), 16) };
        assert!(transformed.iter().all(|&b| b == 0xa5));

        // The source side completed as part of the same pair.
        let src = device.recv_element(SRC, Wait::None).unwrap();
        assert_eq!(src.index, 0);
    }

    #[test]
    fn test_failed_transform_reports_empty_buffer() {
        let device = m2m_device();
        device.request_buffers(SRC, MemoryType::Mmap, 1).unwrap();
        device.request_buffers(DST, MemoryType::Mmap, 1).unwrap();

        device.queue_pair(SRC, 0, DST, 0).unwrap();
        device
            .run_transform(SRC, DST, |_, _| Err(VideoError::Driver(anyhow!("codec fault"))))
            .unwrap();

        let dst = device.recv_element(DST, Wait::None).unwrap();
        assert_eq!(dst.valid_size, 0);
    }

    #[test]
    fn test_transform_without_pair_fails() {
        let device = m2m_device();
        device.request_buffers(SRC, MemoryType::Mmap, 1).unwrap();
        device.request_buffers(DST, MemoryType::Mmap, 1).unwrap();
        assert!(matches!(
            device.run_transform(SRC, DST, |_, _| Ok(0)),
            Err(VideoError::NotFound)
        ));
    }
}
