use crate::bus::ContactEvent;
use crate::core::{Document, EntityKey, TenantId};
use crate::presence::ConnectionHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One terminal a contact is signed in from.
///
/// Two devices are the same device when their name and platform match; the
/// connection handle is node-local and never part of a snapshot.
#[derive(Clone, Serialize, Deserialize)]
pub struct Device {
    /// Device name, e.g. `"Chrome"`.
    pub name: String,
    /// Platform tag, e.g. `"Web"`.
    pub platform: String,
    #[serde(skip)]
    handle: Option<Arc<dyn ConnectionHandle>>,
}

impl Device {
    /// Creates a device without a connection handle.
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            handle: None,
        }
    }

    /// Attaches the live connection this device is reachable on.
    pub fn with_handle(mut self, handle: Arc<dyn ConnectionHandle>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Returns the connection handle, if this node owns one.
    pub fn handle(&self) -> Option<&Arc<dyn ConnectionHandle>> {
        self.handle.as_ref()
    }

    /// Returns `true` if the device has a handle and it reports invalid.
    pub fn is_dead(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_valid())
    }

    /// Pushes an event over the handle. Returns `false` if there is no live
    /// handle or the send failed.
    pub fn push(&self, event: &ContactEvent) -> bool {
        match &self.handle {
            Some(h) if h.is_valid() => h.send(event),
            _ => false,
        }
    }

    /// Copy of this device without its handle, as stored in snapshots.
    pub fn detached(&self) -> Self {
        Self::new(self.name.clone(), self.platform.clone())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.platform == other.platform
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("attached", &self.handle.is_some())
            .finish()
    }
}

/// A contact and the devices it is currently signed in from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Tenant-qualified identity.
    pub key: EntityKey,
    /// Display name.
    pub name: String,
    /// Opaque structured context.
    pub context: Option<Document>,
    /// Ordered set of devices, unique by name and platform.
    pub devices: Vec<Device>,
    /// Last activity, milliseconds since the epoch.
    pub timestamp: u64,
}

impl Contact {
    /// Creates a contact with no devices.
    pub fn new(key: EntityKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            context: None,
            devices: Vec::new(),
            timestamp: crate::core::now_ms(),
        }
    }

    /// Sets the context document.
    pub fn with_context(mut self, context: Document) -> Self {
        self.context = Some(context);
        self
    }

    /// Looks up a device by identity.
    pub fn device(&self, device: &Device) -> Option<&Device> {
        self.devices.iter().find(|d| *d == device)
    }

    /// Adds a device, or replaces the stored one when it is already present so
    /// that a reconnect picks up the new handle. Returns `true` if it was new.
    pub fn upsert_device(&mut self, device: Device) -> bool {
        match self.devices.iter_mut().find(|d| **d == device) {
            Some(slot) => {
                *slot = device;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    /// Removes a device by identity.
    pub fn remove_device(&mut self, device: &Device) -> Option<Device> {
        let idx = self.devices.iter().position(|d| d == device)?;
        Some(self.devices.remove(idx))
    }

    /// Appends every device of `other` this contact does not have yet.
    pub fn absorb_devices(&mut self, other: &Contact) {
        for device in &other.devices {
            if self.device(device).is_none() {
                self.devices.push(device.clone());
            }
        }
    }

    /// Removes every device whose handle reports invalid.
    pub fn strip_dead_devices(&mut self) -> Vec<Device> {
        let (dead, live) = std::mem::take(&mut self.devices)
            .into_iter()
            .partition(Device::is_dead);
        self.devices = live;
        dead
    }

    /// Copy of this contact with every device detached from its handle.
    pub fn detached(&self) -> Self {
        Self {
            devices: self.devices.iter().map(Device::detached).collect(),
            ..self.clone()
        }
    }
}

/// A session token as presented by a connecting device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken {
    /// Opaque token code.
    pub code: String,
    /// Tenant the token was issued for.
    pub tenant: TenantId,
}

impl SessionToken {
    /// Creates a token.
    pub fn new(code: impl Into<String>, tenant: impl Into<TenantId>) -> Self {
        Self {
            code: code.into(),
            tenant: tenant.into(),
        }
    }
}

/// Binding of a session token to one (contact, device) pair.
#[derive(Debug, Clone)]
pub struct TokenDevice {
    /// The bound token.
    pub token: SessionToken,
    /// The contact it authenticates.
    pub contact: EntityKey,
    /// The device the session runs on.
    pub device: Device,
}
