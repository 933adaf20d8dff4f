//! Device-node adapter: maps handle operations (open/close/ioctl/mmap) 1:1
//! onto the core.
//!
//! A [`VideoNode`] owns one open reference on its device: opening a node
//! increments the device's reference count, dropping (or explicitly
//! closing) it decrements. `ioctl` forwards to [`crate::ioctl::dispatch`]
//! and `mmap` resolves a `QUERYBUF` offset to a payload pointer. Errors
//! leave this layer as the stable `Errno` codes.

use std::ptr::NonNull;
use std::sync::Arc;

use log::error;
use nix::errno::Errno;

use crate::device::Device;
use crate::ioctl::{self, IoctlArg, MmapRequest};
use crate::registry::Registry;
use crate::sync::Wait;

/// Open-time configuration of a node handle.
#[derive(Default, Clone, Copy)]
pub struct NodeConfig {
    non_blocking_dqbuf: bool,
}

impl NodeConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Make `DQBUF` poll instead of blocking until a buffer completes.
    pub fn non_blocking_dqbuf(self) -> Self {
        NodeConfig {
            non_blocking_dqbuf: true,
        }
    }
}

/// An open handle on a registered device.
pub struct VideoNode {
    device: Option<Arc<Device>>,
    config: NodeConfig,
}

impl VideoNode {
    /// Open the device registered under `name`.
    pub fn open(
        registry: &Registry,
        name: &str,
        config: NodeConfig,
    ) -> std::result::Result<Self, Errno> {
        let device = registry.open(name).map_err(Errno::from)?;
        Ok(VideoNode {
            device: Some(device),
            config,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        // The option is only vacated by `close`, which consumes the node.
        self.device.as_ref().unwrap()
    }

    /// Issue command `cmd` with `arg` on the device.
    pub fn ioctl(&self, cmd: u32, arg: &mut IoctlArg) -> std::result::Result<(), Errno> {
        let wait = if self.config.non_blocking_dqbuf {
            Wait::None
        } else {
            Wait::Forever
        };
        ioctl::dispatch(self.device(), cmd, arg, wait).map_err(Errno::from)
    }

    /// Resolve a mapped-buffer `offset` to a payload pointer for zero-copy
    /// access.
    pub fn mmap(&self, offset: u32, length: u32) -> std::result::Result<NonNull<u8>, Errno> {
        let mut arg = IoctlArg::Mmap(MmapRequest {
            offset,
            length,
            ptr: None,
        });
        self.ioctl(ioctl::Ioctl::Mmap as u32, &mut arg)?;
        match arg {
            IoctlArg::Mmap(MmapRequest { ptr: Some(ptr), .. }) => Ok(ptr),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Release the handle, dropping its device reference.
    pub fn close(mut self) -> std::result::Result<(), Errno> {
        self.release().map_err(Errno::from)
    }

    fn release(&mut self) -> crate::Result<()> {
        match self.device.take() {
            Some(device) => device.close(),
            None => Ok(()),
        }
    }
}

impl Drop for VideoNode {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("error while closing video node: {}", e);
        }
    }
}
