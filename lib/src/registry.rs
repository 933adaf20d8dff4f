//! Process-wide list of live video devices.
//!
//! Drivers register devices at bring-up time under a name and a numeric id,
//! both unique; consumers open devices by name. The registry's own lock only
//! guards the maps: hardware init on the first open runs under the device's
//! lifecycle lock instead, so a slow `init` does not block unrelated
//! lookups.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;

use crate::device::Device;
use crate::driver::VideoDriver;
use crate::{Capabilities, Result, VideoError};

/// Parameters a driver supplies when registering a device.
pub struct DeviceRegistration {
    /// Name consumers open the device by.
    pub name: String,
    /// Numeric id; drives the external node name (`video<id>`).
    pub id: u8,
    /// Physical device capabilities.
    pub caps: Capabilities,
    /// Software device capabilities, reported by `QUERYCAP` when `caps`
    /// contains `DEVICE_CAPS`.
    pub device_caps: Capabilities,
    pub driver: Box<dyn VideoDriver>,
}

#[derive(Default)]
struct RegistryInner {
    devices: BTreeMap<u8, Arc<Device>>,
    by_name: HashMap<String, u8>,
}

/// Name/id-keyed arena of live devices.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// The process-wide registry drivers register into at bring-up.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    /// Create a device and add it to the registry. Fails if the name or id
    /// is already taken.
    pub fn register(&self, registration: DeviceRegistration) -> Result<Arc<Device>> {
        let device = Arc::new(Device::new(
            &registration.name,
            registration.id,
            registration.caps,
            registration.device_caps,
            registration.driver,
        )?);

        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(&registration.name)
            || inner.devices.contains_key(&registration.id)
        {
            return Err(VideoError::InvalidArgument(
                "device name or id is already registered",
            ));
        }
        inner.by_name.insert(registration.name, registration.id);
        inner.devices.insert(registration.id, Arc::clone(&device));
        debug!("registered {} as {}", device.name(), device.node_name());
        Ok(device)
    }

    /// Remove a device from the registry. A device that is still open
    /// cannot be destroyed.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = *inner.by_name.get(name).ok_or(VideoError::NotFound)?;
        if inner.devices[&id].open_count() > 0 {
            return Err(VideoError::InvalidState("device is still open"));
        }
        inner.by_name.remove(name);
        inner.devices.remove(&id);
        debug!("unregistered {}", name);
        Ok(())
    }

    /// Look up a device without touching its reference count.
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        let inner = self.inner.lock().unwrap();
        let id = inner.by_name.get(name)?;
        inner.devices.get(id).cloned()
    }

    /// Open a device by name: increment its reference count, running the
    /// driver's `init` hook on the 0→1 transition. The registry lock is not
    /// held while `init` runs.
    pub fn open(&self, name: &str) -> Result<Arc<Device>> {
        let device = self.get(name).ok_or(VideoError::NotFound)?;
        device.open_ref()?;
        Ok(device)
    }
}
