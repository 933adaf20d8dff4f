//! Fixed-size pools of frame buffer elements.
//!
//! A [`BufferPool`] owns `count` identically-sized [`Element`]s. Elements do
//! not move for the lifetime of the pool and are addressed by their index;
//! the stream queues store indices rather than pointers. Every element is in
//! exactly one of the free set, the queued list or the done list at any
//! time, tracked by its `free` flag: the flag is clear exactly while the
//! element is linked into one of the lists.
//!
//! For `Mmap` pools the element storage is allocated eagerly at pool
//! creation; creation is all-or-nothing and fails with `OutOfMemory` if any
//! single allocation fails. For `UserPtr` pools elements start without
//! backing memory and a caller pointer is bound to them at queue time.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::memory::{MemoryCaps, MemoryType};
use crate::{Result, VideoError};

/// Shared geometry of every element in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of elements in the pool.
    pub count: u32,
    /// Usable size of each element in bytes.
    pub size: u32,
    /// Required alignment of the backing memory, a power of two.
    pub align: u32,
    /// Placement requirements of the backing memory.
    pub caps: MemoryCaps,
    /// Memory mode of the pool.
    pub memory: MemoryType,
}

impl BufferConfig {
    fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(VideoError::InvalidArgument("buffer count is zero"));
        }
        if self.size == 0 {
            return Err(VideoError::InvalidArgument("buffer size is zero"));
        }
        if !self.align.is_power_of_two() {
            return Err(VideoError::InvalidArgument(
                "buffer alignment is not a power of two",
            ));
        }
        Ok(())
    }

    /// Element size rounded up to the pool alignment, the actual length of
    /// pool-owned allocations.
    fn aligned_size(&self) -> usize {
        let align = self.align as usize;
        ((self.size as usize) + align - 1) & !(align - 1)
    }
}

/// One aligned, pool-owned allocation.
struct OwnedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl OwnedBlock {
    fn new(layout: Layout) -> Result<Self> {
        // Safe because the layout has been validated to have a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(OwnedBlock { ptr, layout }),
            None => Err(VideoError::OutOfMemory),
        }
    }
}

impl Drop for OwnedBlock {
    fn drop(&mut self) {
        // Safe because the pointer was obtained from `alloc_zeroed` with the
        // same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Backing storage of one element.
enum Storage {
    /// Pool-owned aligned allocation, lives as long as the pool.
    Owned(OwnedBlock),
    /// Caller-supplied pointer bound by the most recent queue operation.
    User { ptr: NonNull<u8>, len: u32 },
    /// User-pointer pool element with no pointer bound yet.
    Unbound,
}

/// One frame-sized storage unit plus its lifecycle state.
pub struct Element {
    index: usize,
    storage: Storage,
    valid_size: u32,
    free: bool,
}

impl Element {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Amount of data actually produced into this element.
    pub fn valid_size(&self) -> u32 {
        self.valid_size
    }

    pub(crate) fn set_valid_size(&mut self, valid_size: u32) {
        self.valid_size = valid_size;
    }

    /// Whether the element is in the free set, i.e. linked into neither the
    /// queued nor the done list.
    pub fn is_free(&self) -> bool {
        self.free
    }

    pub(crate) fn set_free(&mut self) {
        self.free = true;
    }

    pub(crate) fn set_allocated(&mut self) {
        self.free = false;
    }

    /// Pointer to the element payload, `None` for a user-pointer element
    /// with no memory bound.
    pub fn payload_ptr(&self) -> Option<NonNull<u8>> {
        match &self.storage {
            Storage::Owned(block) => Some(block.ptr),
            Storage::User { ptr, .. } => Some(*ptr),
            Storage::Unbound => None,
        }
    }

    /// Total capacity of the bound storage in bytes.
    pub fn capacity(&self) -> u32 {
        match &self.storage {
            Storage::Owned(block) => block.layout.size() as u32,
            Storage::User { len, .. } => *len,
            Storage::Unbound => 0,
        }
    }
}

/// Pool of identically-sized buffer elements.
///
/// The pool is immutable once created: changing count, size or memory mode
/// requires destroying it and creating a new one. All element state flips
/// happen under the owning device's critical section.
pub struct BufferPool {
    config: BufferConfig,
    elements: Vec<Element>,
}

// The pool is only ever accessed under the owning device's critical section,
// and pool-owned storage is freed exclusively by the pool's own Drop.
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Allocate a pool for `config`. For `Mmap` pools every element's
    /// storage is allocated eagerly; if any allocation fails, everything
    /// allocated so far is released and `OutOfMemory` is returned.
    pub fn new(config: BufferConfig) -> Result<Self> {
        config.validate()?;

        let layout = Layout::from_size_align(config.aligned_size(), config.align as usize)
            .map_err(|_| VideoError::InvalidArgument("invalid buffer layout"))?;

        let mut elements = Vec::with_capacity(config.count as usize);
        for index in 0..config.count as usize {
            let storage = match config.memory {
                // A failed allocation drops `elements`, releasing the blocks
                // created so far.
                MemoryType::Mmap => Storage::Owned(OwnedBlock::new(layout)?),
                MemoryType::UserPtr => Storage::Unbound,
            };
            elements.push(Element {
                index,
                storage,
                valid_size: 0,
                free: true,
            });
        }

        Ok(BufferPool { config, elements })
    }

    /// Create a fresh pool with the same geometry as this one. Element
    /// contents are not copied.
    pub fn clone_config(&self) -> Result<Self> {
        Self::new(self.config)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn count(&self) -> usize {
        self.elements.len()
    }

    pub fn element(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    pub(crate) fn element_mut(&mut self, index: usize) -> Option<&mut Element> {
        self.elements.get_mut(index)
    }

    /// Mark every element free and forget produced sizes. Does not touch
    /// pool-owned allocations; user-pointer bindings are dropped so stale
    /// caller memory cannot be reached after a stream stop.
    pub fn reset(&mut self) {
        for element in &mut self.elements {
            element.free = true;
            element.valid_size = 0;
            if let Storage::User { .. } = element.storage {
                element.storage = Storage::Unbound;
            }
        }
    }

    /// Find the element whose payload starts at `ptr`. The external ABI
    /// addresses buffers by pointer as well as by index, and drivers
    /// complete DMA transfers by payload address.
    pub fn lookup_by_pointer(&self, ptr: *const u8) -> Option<usize> {
        self.elements
            .iter()
            .find(|e| e.payload_ptr().map(|p| p.as_ptr() as *const u8) == Some(ptr))
            .map(|e| e.index)
    }

    /// Bind caller-supplied memory to element `index` of a user-pointer
    /// pool. The pointer has already been validated against the pool config.
    pub(crate) fn bind_user_ptr(&mut self, index: usize, ptr: NonNull<u8>, len: u32) -> Result<()> {
        if self.config.memory != MemoryType::UserPtr {
            return Err(VideoError::InvalidArgument(
                "pool does not use user-pointer memory",
            ));
        }
        let element = self
            .elements
            .get_mut(index)
            .ok_or(VideoError::InvalidArgument("element index out of range"))?;
        element.storage = Storage::User { ptr, len };
        element.valid_size = len;
        Ok(())
    }
}
