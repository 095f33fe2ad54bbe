use crate::bus::ContactEvent;
use crate::core::{Document, EntityKey, TenantId};
use crate::entity::{Contact, Device};
use dashmap::DashMap;

/// Outcome of one [`LocalPresenceTable::sweep`].
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Devices stripped because their handle went invalid.
    pub stripped: Vec<(EntityKey, Device)>,
    /// Contacts evicted for being idle without devices.
    pub evicted: Vec<EntityKey>,
}

/// Contacts with sessions terminated on this node.
///
/// Only devices connected to this node are listed, each with its handle. A
/// contact whose last device left stays in the table until the reaper finds
/// it idle.
#[derive(Default)]
pub struct LocalPresenceTable {
    contacts: DashMap<EntityKey, Contact>,
}

impl LocalPresenceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `device` as connected for `contact`, refreshing the profile
    /// fields from `contact`.
    pub fn attach(&self, contact: &Contact, device: Device, now: u64) -> Contact {
        let mut entry = self.contacts.entry(contact.key.clone()).or_insert_with(|| Contact {
            devices: Vec::new(),
            ..contact.detached()
        });
        entry.name = contact.name.clone();
        entry.context = contact.context.clone();
        entry.upsert_device(device);
        entry.timestamp = now;
        entry.clone()
    }

    /// Removes `device`. Returns how many local devices remain, or `None` if
    /// the contact is not local.
    pub fn detach(&self, key: &EntityKey, device: &Device, now: u64) -> Option<usize> {
        let mut entry = self.contacts.get_mut(key)?;
        entry.remove_device(device);
        entry.timestamp = now;
        Some(entry.devices.len())
    }

    /// Refreshes a contact's activity time.
    pub fn touch(&self, key: &EntityKey, now: u64) -> Option<Contact> {
        let mut entry = self.contacts.get_mut(key)?;
        entry.timestamp = now;
        Some(entry.clone())
    }

    /// Replaces profile fields of a local contact.
    pub fn update_profile(&self, key: &EntityKey, name: Option<&str>, context: Option<&Document>) {
        if let Some(mut entry) = self.contacts.get_mut(key) {
            if let Some(name) = name {
                entry.name = name.to_string();
            }
            if let Some(context) = context {
                entry.context = Some(context.clone());
            }
        }
    }

    /// Returns a local contact.
    pub fn get(&self, key: &EntityKey) -> Option<Contact> {
        self.contacts.get(key).map(|c| c.clone())
    }

    /// Drops a contact.
    pub fn remove(&self, key: &EntityKey) -> Option<Contact> {
        self.contacts.remove(key).map(|(_, c)| c)
    }

    /// Local contacts of one tenant.
    pub fn contacts_in_tenant(&self, tenant: &TenantId) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| c.key.tenant == *tenant)
            .map(|c| c.clone())
            .collect()
    }

    /// Contacts holding at least one device.
    pub fn online_count(&self) -> usize {
        self.contacts.iter().filter(|c| !c.devices.is_empty()).count()
    }

    /// Number of local contacts, with or without devices.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Returns `true` if no contacts are local.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Pushes `event` to every live device of a local contact. Returns the
    /// number of devices reached.
    pub fn deliver(&self, key: &EntityKey, event: &ContactEvent) -> usize {
        let Some(contact) = self.contacts.get(key) else {
            return 0;
        };
        contact.devices.iter().filter(|d| d.push(event)).count()
    }

    /// Strips dead devices, then evicts contacts with no devices whose last
    /// activity is older than `idle_ms`.
    pub fn sweep(&self, now: u64, idle_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        self.contacts.retain(|key, contact| {
            if !contact.devices.is_empty() {
                for device in contact.strip_dead_devices() {
                    report.stripped.push((key.clone(), device));
                }
            }
            let keep = !contact.devices.is_empty() || now.saturating_sub(contact.timestamp) <= idle_ms;
            if !keep {
                report.evicted.push(key.clone());
            }
            keep
        });
        report
    }
}
