//! Memory modes and placement tags for buffer pools.
//!
//! A pool's backing memory is either provided by the framework itself
//! (`Mmap`, exposed to consumers through an offset-resolution step) or
//! imported from the caller at queue time (`UserPtr`). All elements of a
//! pool share one memory mode, decided by `REQBUFS` and immutable until the
//! pool is recreated.
//!
//! `MemoryCaps` carries the placement class the hardware requires of the
//! backing memory (DMA reachability, internal vs. external RAM). Pool-owned
//! allocations honor it at creation time; for user pointers it is exported
//! so platform ports can reject unreachable memory.

use std::fmt;

use bitflags::bitflags;
use enumn::N;

/// Supported memory modes. The discriminants are the V4L2 memory values
/// exchanged by the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MemoryType {
    Mmap = 1,
    UserPtr = 2,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Placement requirements of a pool's backing memory.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryCaps: u32 {
        /// Memory must be reachable by the capture/transform DMA engine.
        const DMA = 1 << 0;
        /// Memory must live in internal RAM.
        const INTERNAL = 1 << 1;
        /// Memory may live in external RAM.
        const EXTERNAL = 1 << 2;
        /// Allocations must be cache-line aligned.
        const CACHE_ALIGNED = 1 << 3;
    }
}

impl fmt::Display for MemoryCaps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
