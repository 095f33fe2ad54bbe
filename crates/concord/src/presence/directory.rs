use super::{AppendixCache, GroupRegistry, LocalPresenceTable, SweepReport};
use crate::bus::{ContactEvent, Envelope, EventBus, EventName, EventPayload, Inbox};
use crate::cache::ClusterCache;
use crate::config::DirectoryConfig;
use crate::core::{now_ms, CacheKey, Document, EntityKey, TenantId};
use crate::entity::{
    Appendix, AppendixOwner, Contact, Device, Group, GroupBundle, GroupChanges, GroupState, NewGroup, SessionToken,
    TokenDevice,
};
use crate::error::PresenceError;
use crate::storage::{PersistentStore, StoreWriter};
use dashmap::{DashMap, DashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

struct Inner {
    config: DirectoryConfig,
    table: LocalPresenceTable,
    tokens: DashMap<String, TokenDevice>,
    groups: GroupRegistry,
    cache: Arc<dyn ClusterCache>,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn PersistentStore>,
    writer: StoreWriter,
    contact_appendices: AppendixCache,
    group_appendices: AppendixCache,
    subscriptions: DashSet<EntityKey>,
    permits: Semaphore,
}

/// Entry point for session and group operations on one node.
///
/// Cheap to clone; clones share state.
///
/// Results follow one rule: a missing entity or a tenant mismatch yields
/// `None`, everything else (lock timeouts, rejected mutations, store
/// failures) is logged and the operation completes on the best state
/// available.
#[derive(Clone)]
pub struct PresenceDirectory {
    inner: Arc<Inner>,
}

impl PresenceDirectory {
    /// Creates a directory and spawns its store writer on the current runtime.
    pub fn new(
        config: DirectoryConfig,
        cache: Arc<dyn ClusterCache>,
        bus: Arc<dyn EventBus>,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        let writer = StoreWriter::spawn(Arc::clone(&store));
        let groups = GroupRegistry::new(Arc::clone(&cache), Arc::clone(&store), writer.clone());
        let permits = Semaphore::new(config.max_concurrent_ops.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                table: LocalPresenceTable::new(),
                tokens: DashMap::new(),
                groups,
                cache,
                bus,
                store,
                writer,
                contact_appendices: AppendixCache::new(),
                group_appendices: AppendixCache::new(),
                subscriptions: DashSet::new(),
                permits,
            }),
        }
    }

    /// The directory's config.
    pub fn config(&self) -> &DirectoryConfig {
        &self.inner.config
    }

    /// Contacts with sessions on this node.
    pub fn table(&self) -> &LocalPresenceTable {
        &self.inner.table
    }

    /// This node's group registry.
    pub fn groups(&self) -> &GroupRegistry {
        &self.inner.groups
    }

    /// Waits until every store write queued so far has been attempted.
    pub async fn flush(&self) {
        self.inner.writer.flush().await;
    }

    /// Number of failed store writes.
    pub fn store_failures(&self) -> u64 {
        self.inner.writer.failures()
    }

    /// Returns `true` if this node is subscribed to the contact's topic.
    pub fn is_subscribed(&self, key: &EntityKey) -> bool {
        self.inner.subscriptions.contains(key)
    }

    fn cache(&self) -> &dyn ClusterCache {
        &*self.inner.cache
    }

    fn lock_timeout(&self) -> Duration {
        self.inner.config.lock_timeout_duration()
    }

    async fn permit(&self) -> Option<SemaphorePermit<'_>> {
        self.inner.permits.acquire().await.ok()
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Signs a device in.
    ///
    /// The device is merged into the cluster snapshot of the contact under
    /// the contact's lock: the result lists every device of the contact
    /// across the cluster, with name and context taken from `contact`. This
    /// node then subscribes to the contact's topic and binds `token` to the
    /// device.
    ///
    /// Returns `None` if the token was issued for another tenant.
    pub async fn sign_in(&self, contact: Contact, token: &SessionToken, device: Device) -> Option<Contact> {
        if token.tenant != contact.key.tenant {
            let err = PresenceError::DomainMismatch {
                token: token.tenant.clone(),
                contact: contact.key.tenant.clone(),
            };
            tracing::warn!(contact = %contact.key, error = %err, "Sign-in rejected");
            return None;
        }

        let _permit = self.permit().await;
        let now = now_ms();
        let key = contact.key.clone();

        let mut incoming = contact.detached();
        incoming.upsert_device(device.detached());
        incoming.timestamp = now;
        let fallback = incoming.clone();

        let merged = self
            .cache()
            .apply(&CacheKey::contact(&key), self.lock_timeout(), move |entry| {
                let mut merged = incoming;
                if let Some(existing) = entry.decode::<Contact>()? {
                    merged.absorb_devices(&existing);
                }
                entry.put_value(&merged)?;
                Ok::<_, PresenceError>(merged)
            })
            .await
            .and_then(|r| r);

        let merged = match merged {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(contact = %key, error = %e, "Device merge fell back to local state");
                let mut local = fallback;
                if let Some(current) = self.inner.table.get(&key) {
                    local.absorb_devices(&current.detached());
                }
                local
            }
        };

        self.inner.writer.contact(&merged, Some(&device));
        if self.inner.subscriptions.insert(key.clone()) {
            self.inner.bus.subscribe(&key.topic()).await;
        }
        self.inner.table.attach(&merged, device.clone(), now);
        self.inner.tokens.insert(
            token.code.clone(),
            TokenDevice {
                token: token.clone(),
                contact: key.clone(),
                device: device.detached(),
            },
        );

        tracing::debug!(
            contact = %key,
            device = %device.name,
            devices = merged.devices.len(),
            "Signed in"
        );
        Some(merged)
    }

    /// Signs a device in with a token bound earlier on this node, resolving
    /// the contact through [`get_contact`](Self::get_contact).
    ///
    /// Returns `None` if the token is unknown here.
    pub async fn sign_in_with_token(&self, code: &str, device: Device) -> Option<Contact> {
        let Some((token, key)) = self
            .inner
            .tokens
            .get(code)
            .map(|bound| (bound.token.clone(), bound.contact.clone()))
        else {
            tracing::warn!(token = code, "Sign-in with unknown token");
            return None;
        };
        let mut contact = self.get_contact(&key.tenant, key.id).await;
        contact.devices.clear();
        self.sign_in(contact, &token, device).await
    }

    /// Signs a device out.
    ///
    /// The device leaves the cluster snapshot (which is deleted once no
    /// device remains), the token is unbound, and this node unsubscribes from
    /// the contact's topic when it no longer holds any of its devices.
    /// Returns the contact as left in the cluster.
    pub async fn sign_out(&self, contact: &Contact, token: &SessionToken, device: &Device) -> Contact {
        let _permit = self.permit().await;
        self.inner.tokens.remove(&token.code);
        let remaining = self.detach_device(contact, device).await;
        tracing::debug!(
            contact = %contact.key,
            device = %device.name,
            devices = remaining.devices.len(),
            "Signed out"
        );
        remaining
    }

    /// Resumes a session after a transient disconnect.
    ///
    /// Returns the local contact with a refreshed activity time if `token`
    /// is still bound to it, without touching the cluster cache.
    pub async fn comeback(&self, contact: &Contact, token: &SessionToken) -> Option<Contact> {
        let matches = self
            .inner
            .tokens
            .get(&token.code)
            .is_some_and(|bound| bound.contact == contact.key && bound.token.tenant == token.tenant);
        if !matches {
            tracing::debug!(contact = %contact.key, "Comeback with unbound token");
            return None;
        }
        self.inner.table.touch(&contact.key, now_ms())
    }

    /// Tells every node holding a session of `contact` that one of its
    /// devices lost its connection.
    pub async fn report_disconnect(&self, contact: &Contact) {
        let event = ContactEvent {
            name: EventName::Disconnect,
            payload: EventPayload::Contact(contact.detached()),
        };
        self.inner.bus.publish(&contact.key.topic(), &event).await;
        tracing::debug!(contact = %contact.key, "Disconnect reported");
    }

    /// The local contact a token is bound to.
    pub fn contact_for_token(&self, code: &str) -> Option<Contact> {
        let key = self.inner.tokens.get(code)?.contact.clone();
        self.inner.table.get(&key)
    }

    /// The device a token is bound to, with its handle if still connected.
    pub fn device_for_token(&self, code: &str) -> Option<Device> {
        let (key, device) = {
            let bound = self.inner.tokens.get(code)?;
            (bound.contact.clone(), bound.device.clone())
        };
        let live = self
            .inner
            .table
            .get(&key)
            .and_then(|c| c.device(&device).cloned());
        Some(live.unwrap_or(device))
    }

    /// A contact with a session on this node.
    pub fn online_contact(&self, key: &EntityKey) -> Option<Contact> {
        self.inner.table.get(key).filter(|c| !c.devices.is_empty())
    }

    /// Contacts of a tenant with at least one device on this node.
    pub fn online_contacts(&self, tenant: &TenantId) -> Vec<Contact> {
        self.inner
            .table
            .contacts_in_tenant(tenant)
            .into_iter()
            .filter(|c| !c.devices.is_empty())
            .collect()
    }

    /// Number of contacts with at least one device on this node.
    pub fn online_count(&self) -> usize {
        self.inner.table.online_count()
    }

    // Removes a device from the cluster snapshot and the local table, and
    // drops the topic subscription once no local device is left.
    async fn detach_device(&self, contact: &Contact, device: &Device) -> Contact {
        let key = &contact.key;
        let now = now_ms();
        let target = device.detached();

        let result = self
            .cache()
            .apply(&CacheKey::contact(key), self.lock_timeout(), move |entry| {
                let Some(mut cached) = entry.decode::<Contact>()? else {
                    return Ok(None);
                };
                cached.remove_device(&target);
                if cached.devices.is_empty() {
                    entry.remove();
                } else {
                    entry.put_value(&cached)?;
                }
                Ok::<_, PresenceError>(Some(cached))
            })
            .await
            .and_then(|r| r);

        let mut remaining = match result {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                let mut local = contact.detached();
                local.remove_device(device);
                local
            }
            Err(e) => {
                tracing::warn!(contact = %key, error = %e, "Device removal fell back to local state");
                let mut local = contact.detached();
                local.remove_device(device);
                local
            }
        };
        remaining.timestamp = now;

        let local = self.inner.table.detach(key, device, now).unwrap_or(0);
        if local == 0 {
            self.unsubscribe(key).await;
        }
        remaining
    }

    async fn unsubscribe(&self, key: &EntityKey) {
        if self.inner.subscriptions.remove(key).is_some() {
            self.inner.bus.unsubscribe(&key.topic()).await;
        }
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    /// Looks a contact up in the cluster cache, then the store.
    ///
    /// Never fails: an unknown contact comes back as a placeholder named
    /// after the configured prefix and its id.
    pub async fn get_contact(&self, tenant: &TenantId, id: u64) -> Contact {
        let key = EntityKey::new(tenant.clone(), id);
        match self.cache().get_value::<Contact>(&CacheKey::contact(&key)).await {
            Ok(Some(contact)) => return contact,
            Ok(None) => {}
            Err(e) => tracing::warn!(contact = %key, error = %e, "Ignoring undecodable contact snapshot"),
        }

        match self.inner.store.read_contact(&key).await {
            Ok(Some(contact)) => return contact,
            Ok(None) => {}
            Err(e) => tracing::warn!(contact = %key, error = %e, "Contact read failed"),
        }

        tracing::trace!(contact = %key, "Synthesizing shadow contact");
        let name = format!("{}{}", self.inner.config.shadow_name_prefix, id);
        Contact::new(key, name)
    }

    /// Creates or overwrites a contact's profile. Devices already in the
    /// cluster snapshot are kept.
    pub async fn create_contact(&self, key: EntityKey, name: impl Into<String>, context: Option<Document>) -> Contact {
        let _permit = self.permit().await;
        let mut contact = Contact::new(key, name);
        contact.context = context;
        let name = contact.name.clone();
        let context = contact.context.clone();

        let cached = self
            .update_cached_contact(&contact.key, move |cached| {
                cached.name = name;
                cached.context = context;
            })
            .await;
        if let Ok(Some(cached)) = cached {
            contact.devices = cached.devices;
        }

        self.inner.writer.contact(&contact, None);
        contact
    }

    /// Changes a contact's name and/or context.
    ///
    /// Returns `None` if the contact is neither cached nor stored.
    pub async fn modify_contact(
        &self,
        key: &EntityKey,
        name: Option<String>,
        context: Option<Document>,
    ) -> Option<Contact> {
        let _permit = self.permit().await;
        let (n, c) = (name.clone(), context.clone());
        let cached = self
            .update_cached_contact(key, move |contact| {
                if let Some(name) = n {
                    contact.name = name;
                }
                if let Some(context) = c {
                    contact.context = Some(context);
                }
            })
            .await;

        let contact = match cached {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                let mut stored = match self.inner.store.read_contact(key).await {
                    Ok(Some(stored)) => stored,
                    Ok(None) => return None,
                    Err(e) => {
                        tracing::warn!(contact = %key, error = %e, "Contact read failed");
                        return None;
                    }
                };
                if let Some(name) = name.clone() {
                    stored.name = name;
                }
                if let Some(context) = context.clone() {
                    stored.context = Some(context);
                }
                stored
            }
            Err(e) => {
                tracing::warn!(contact = %key, error = %e, "Contact update skipped");
                return None;
            }
        };

        self.inner.writer.contact(&contact, None);
        self.inner
            .table
            .update_profile(key, name.as_deref(), context.as_ref());
        Some(contact)
    }

    /// Drops a device of a local contact, e.g. after a connection timeout.
    pub async fn remove_contact_device(&self, key: &EntityKey, device: &Device) -> Option<Contact> {
        let _permit = self.permit().await;
        let local = self.inner.table.get(key)?;
        self.inner
            .tokens
            .retain(|_, bound| !(bound.contact == *key && bound.device == *device));
        Some(self.detach_device(&local, device).await)
    }

    // Applies `f` to the cached snapshot under its lock. `Ok(None)` if the
    // contact is not cached.
    async fn update_cached_contact<F>(&self, key: &EntityKey, f: F) -> Result<Option<Contact>, PresenceError>
    where
        F: FnOnce(&mut Contact) + Send,
    {
        self.cache()
            .apply(&CacheKey::contact(key), self.lock_timeout(), move |entry| {
                let Some(mut contact) = entry.decode::<Contact>()? else {
                    return Ok(None);
                };
                f(&mut contact);
                entry.put_value(&contact)?;
                Ok::<_, PresenceError>(Some(contact))
            })
            .await?
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Returns the latest state of a group.
    pub async fn get_group(&self, key: &EntityKey) -> Option<Group> {
        match self.inner.groups.refresh(key).await {
            Ok(group) => Some(group),
            Err(e) => {
                log_failure(key, "get_group", &e);
                None
            }
        }
    }

    /// Creates a group and tells every member but the owner about it.
    pub async fn create_group(&self, new: NewGroup) -> Option<Group> {
        let _permit = self.permit().await;
        let group = match self.inner.groups.create(new).await {
            Ok(group) => group,
            Err(e) => {
                tracing::warn!(error = %e, "Group creation failed");
                return None;
            }
        };

        let bundle = GroupBundle {
            group: group.clone(),
            members: group.member_ids(),
            operator: group.owner,
        };
        let recipients = except(group.member_ids(), Some(group.owner));
        self.notify(&group.key, recipients, ContactEvent::group(EventName::CreateGroup, bundle))
            .await;
        Some(group)
    }

    /// Dismisses a group. Members are told, except the operator when the
    /// operator is the owner.
    pub async fn dissolve_group(&self, key: &EntityKey, operator: u64) -> Option<Group> {
        let _permit = self.permit().await;
        let group = match self.inner.groups.dissolve(key, operator).await {
            Ok(group) => group,
            Err(e) => return self.settle_group(key, "dissolve_group", e),
        };

        let bundle = GroupBundle {
            group: group.clone(),
            members: group.member_ids(),
            operator,
        };
        let skip = (operator == group.owner).then_some(operator);
        let recipients = except(group.member_ids(), skip);
        self.notify(key, recipients, ContactEvent::group(EventName::DissolveGroup, bundle))
            .await;
        Some(group)
    }

    /// Adds members. The bundle lists only the members that were new; when
    /// it is empty nothing was written or announced.
    pub async fn add_group_members(&self, key: &EntityKey, ids: &[u64], operator: u64) -> Option<GroupBundle> {
        let _permit = self.permit().await;
        let bundle = match self.inner.groups.add_members(key, ids, operator).await {
            Ok(bundle) => bundle,
            Err(e) => return self.settle_bundle(key, operator, "add_group_members", e),
        };

        if !bundle.is_empty() {
            self.inner.groups.touch_active(key, now_ms());
            let recipients = bundle.group.member_ids();
            self.notify(key, recipients, ContactEvent::group(EventName::AddGroupMember, bundle.clone()))
                .await;
        }
        Some(bundle)
    }

    /// Removes members. The owner is never removed. Everyone who was a member
    /// before the removal is told, so removed members learn about it too.
    pub async fn remove_group_members(&self, key: &EntityKey, ids: &[u64], operator: u64) -> Option<GroupBundle> {
        let _permit = self.permit().await;
        let (bundle, before) = match self.inner.groups.remove_members(key, ids, operator).await {
            Ok(result) => result,
            Err(e) => return self.settle_bundle(key, operator, "remove_group_members", e),
        };

        if !bundle.is_empty() {
            self.inner.groups.touch_active(key, now_ms());
            self.notify(key, before, ContactEvent::group(EventName::RemoveGroupMember, bundle.clone()))
                .await;
        }
        Some(bundle)
    }

    /// Changes group fields.
    pub async fn modify_group(&self, key: &EntityKey, changes: GroupChanges, operator: u64) -> Option<Group> {
        let _permit = self.permit().await;
        let (group, changed) = match self.inner.groups.modify(key, changes, operator).await {
            Ok(result) => result,
            Err(e) => return self.settle_group(key, "modify_group", e),
        };

        if changed {
            let bundle = GroupBundle {
                group: group.clone(),
                members: Vec::new(),
                operator,
            };
            self.notify(key, group.member_ids(), ContactEvent::group(EventName::ModifyGroup, bundle))
                .await;
        }
        Some(group)
    }

    /// Replaces one member's per-group context.
    pub async fn modify_group_member(
        &self,
        key: &EntityKey,
        member: u64,
        context: Document,
        operator: u64,
    ) -> Option<GroupBundle> {
        let _permit = self.permit().await;
        let bundle = match self.inner.groups.modify_member(key, member, context, operator).await {
            Ok(bundle) => bundle,
            Err(e) => return self.settle_bundle(key, operator, "modify_group_member", e),
        };

        if !bundle.is_empty() {
            let recipients = bundle.group.member_ids();
            self.notify(key, recipients, ContactEvent::group(EventName::ModifyGroupMember, bundle.clone()))
                .await;
        }
        Some(bundle)
    }

    /// Groups in `state` that `member` belongs to, with last activity in
    /// `active`, most recently active first. Reads the store, so changes
    /// still queued for writing are not reflected.
    pub async fn list_groups_with_member(
        &self,
        tenant: &TenantId,
        member: u64,
        active: Range<u64>,
        state: GroupState,
    ) -> Vec<Group> {
        match self
            .inner
            .store
            .read_groups_with_member(tenant, member, active, state)
            .await
        {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!(tenant = %tenant, member, error = %e, "Group listing failed");
                Vec::new()
            }
        }
    }

    /// Records activity in a group; written out by the reaper.
    pub fn touch_group(&self, key: &EntityKey, timestamp: u64) {
        self.inner.groups.touch_active(key, timestamp);
    }

    async fn notify(&self, group: &EntityKey, recipients: Vec<u64>, event: ContactEvent) {
        for id in recipients {
            self.inner.bus.publish(&group.sibling(id).topic(), &event).await;
        }
        tracing::debug!(group = %group, event = %event.name, "Group event published");
    }

    fn settle_group(&self, key: &EntityKey, op: &'static str, e: PresenceError) -> Option<Group> {
        log_failure(key, op, &e);
        match e {
            PresenceError::EntityNotFound(_) => None,
            _ => self.inner.groups.cached(key),
        }
    }

    fn settle_bundle(&self, key: &EntityKey, operator: u64, op: &'static str, e: PresenceError) -> Option<GroupBundle> {
        self.settle_group(key, op, e).map(|group| GroupBundle {
            group,
            members: Vec::new(),
            operator,
        })
    }

    // =========================================================================
    // Appendices
    // =========================================================================

    /// A contact's appendix; empty if none was ever written.
    pub async fn get_contact_appendix(&self, key: &EntityKey) -> Appendix {
        let now = now_ms();
        if let Some(appendix) = self.inner.contact_appendices.get(key, now) {
            return appendix;
        }

        let owner = AppendixOwner::Contact(key.clone());
        match self.inner.store.read_appendix(&owner).await {
            Ok(found) => {
                let appendix = found.unwrap_or_else(|| Appendix::empty(owner));
                self.inner.contact_appendices.put(appendix.clone(), now);
                appendix
            }
            Err(e) => {
                tracing::warn!(contact = %key, error = %e, "Appendix read failed");
                Appendix::empty(owner)
            }
        }
    }

    /// Rewrites a contact's appendix and refreshes the contact's activity time.
    pub async fn update_contact_appendix(&self, key: &EntityKey, data: Document) -> Appendix {
        let _permit = self.permit().await;
        let now = now_ms();
        let appendix = Appendix {
            owner: AppendixOwner::Contact(key.clone()),
            data,
            timestamp: now,
        };
        self.inner.contact_appendices.put(appendix.clone(), now);
        self.inner.writer.appendix(&appendix);

        if let Err(e) = self
            .update_cached_contact(key, move |contact| contact.timestamp = now)
            .await
        {
            tracing::warn!(contact = %key, error = %e, "Contact activity not refreshed");
        }
        self.inner.table.touch(key, now);
        appendix
    }

    /// A group's appendix, or `None` if the group does not exist.
    pub async fn get_group_appendix(&self, key: &EntityKey) -> Option<Appendix> {
        let now = now_ms();
        if let Some(appendix) = self.inner.group_appendices.get(key, now) {
            return Some(appendix);
        }

        let slot = CacheKey::group_appendix(key);
        match self.cache().get_value::<Appendix>(&slot).await {
            Ok(Some(appendix)) => {
                self.inner.group_appendices.put(appendix.clone(), now);
                return Some(appendix);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(group = %key, error = %e, "Ignoring undecodable appendix snapshot"),
        }

        if let Err(e) = self.inner.groups.refresh(key).await {
            log_failure(key, "get_group_appendix", &e);
            return None;
        }

        let owner = AppendixOwner::Group(key.clone());
        let appendix = match self.inner.store.read_appendix(&owner).await {
            Ok(found) => found.unwrap_or_else(|| Appendix::empty(owner)),
            Err(e) => {
                tracing::warn!(group = %key, error = %e, "Appendix read failed");
                return Some(Appendix::empty(owner));
            }
        };
        if let Err(e) = self.cache().put_value(&slot, &appendix).await {
            tracing::warn!(group = %key, error = %e, "Appendix not cached");
        }
        self.inner.group_appendices.put(appendix.clone(), now);
        Some(appendix)
    }

    /// Rewrites a group's appendix; with `broadcast`, every member is sent
    /// a `GroupAppendixUpdated` event.
    pub async fn update_group_appendix(&self, key: &EntityKey, data: Document, broadcast: bool) -> Option<Appendix> {
        let _permit = self.permit().await;
        let group = match self.inner.groups.refresh(key).await {
            Ok(group) => group,
            Err(e) => {
                log_failure(key, "update_group_appendix", &e);
                return None;
            }
        };

        let now = now_ms();
        let appendix = Appendix {
            owner: AppendixOwner::Group(key.clone()),
            data,
            timestamp: now,
        };
        if let Err(e) = self.cache().put_value(&CacheKey::group_appendix(key), &appendix).await {
            tracing::warn!(group = %key, error = %e, "Appendix not cached");
        }
        self.inner.group_appendices.put(appendix.clone(), now);
        self.inner.writer.appendix(&appendix);
        self.inner.groups.touch_active(key, now);

        if broadcast {
            let event = ContactEvent {
                name: EventName::GroupAppendixUpdated,
                payload: EventPayload::Appendix(appendix.clone()),
            };
            self.notify(key, group.member_ids(), event).await;
        }
        Some(appendix)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Delivers one bus envelope to the local devices of its contact.
    /// Returns the number of devices reached; events for contacts not on
    /// this node are dropped.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        match envelope.open() {
            Ok((topic, event)) => {
                let reached = self.inner.table.deliver(topic.key(), &event);
                if reached == 0 {
                    tracing::trace!(topic = %topic, event = %event.name, "No local device; event dropped");
                }
                reached
            }
            Err(e) => {
                tracing::warn!(topic = %envelope.topic, error = %e, "Undecodable event dropped");
                0
            }
        }
    }

    /// Spawns the task that feeds this node's inbox into [`dispatch`](Self::dispatch).
    pub fn spawn_event_loop(&self, mut inbox: Inbox) -> JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                directory.dispatch(&envelope);
            }
            tracing::debug!("Event loop stopped");
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Strips dead devices and evicts idle contacts without devices.
    pub async fn sweep_contacts(&self, now: u64) -> SweepReport {
        let report = self
            .inner
            .table
            .sweep(now, self.inner.config.reaper.contact_idle_ms);

        for (key, device) in &report.stripped {
            self.inner
                .tokens
                .retain(|_, bound| !(bound.contact == *key && bound.device == *device));
            let contact = self
                .inner
                .table
                .get(key)
                .unwrap_or_else(|| Contact::new(key.clone(), String::new()));
            self.detach_device(&contact, device).await;
        }
        for key in &report.evicted {
            self.unsubscribe(key).await;
        }

        if !report.stripped.is_empty() || !report.evicted.is_empty() {
            tracing::debug!(
                stripped = report.stripped.len(),
                evicted = report.evicted.len(),
                "Contact sweep"
            );
        }
        report
    }

    /// Writes pending group active times.
    pub async fn flush_group_activity(&self) -> usize {
        self.inner.groups.flush_active().await
    }

    /// Evicts idle cached appendices.
    pub fn sweep_appendices(&self, now: u64) -> usize {
        let idle = self.inner.config.reaper.appendix_idle_ms;
        self.inner.contact_appendices.sweep(now, idle) + self.inner.group_appendices.sweep(now, idle)
    }
}

fn except(ids: Vec<u64>, skip: Option<u64>) -> Vec<u64> {
    ids.into_iter().filter(|id| Some(*id) != skip).collect()
}

fn log_failure(key: &EntityKey, op: &'static str, e: &PresenceError) {
    match e {
        PresenceError::EntityNotFound(_) => tracing::debug!(entity = %key, op, error = %e, "Operation aborted"),
        _ => tracing::warn!(entity = %key, op, error = %e, "Operation incomplete"),
    }
}
