use super::{PersistentStore, StoreError};
use crate::core::{now_ms, EntityKey, TenantId};
use crate::entity::{Appendix, AppendixOwner, Contact, Device, Group, GroupMember, GroupState};
use async_trait::async_trait;
use dashmap::DashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipRow {
    /// Member contact id.
    pub member: u64,
    /// Join time.
    pub joined_at: u64,
    /// Per-group member context.
    pub context: Option<crate::core::Document>,
    /// Who added the member.
    pub adding_operator: u64,
    /// Set when the membership was removed.
    pub removing_time: Option<u64>,
    /// Who removed the member.
    pub removing_operator: Option<u64>,
}

impl MembershipRow {
    /// Returns `true` unless the row was soft-deleted.
    pub fn is_active(&self) -> bool {
        self.removing_time.is_none()
    }
}

/// In-process [`PersistentStore`].
///
/// Keeps the same table layout as a relational backend, including
/// soft-deleted membership rows, and can be told to fail writes.
#[derive(Default)]
pub struct MemoryStore {
    contacts: DashMap<EntityKey, Contact>,
    devices: DashMap<EntityKey, Vec<Device>>,
    groups: DashMap<EntityKey, Group>,
    memberships: DashMap<EntityKey, Vec<MembershipRow>>,
    appendices: DashMap<AppendixOwner, Appendix>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// All membership rows of a group, including removed ones.
    pub fn membership_rows(&self, group: &EntityKey) -> Vec<MembershipRow> {
        self.memberships.get(group).map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Devices ever recorded for a contact.
    pub fn device_history(&self, contact: &EntityKey) -> Vec<Device> {
        self.devices.get(contact).map(|d| d.clone()).unwrap_or_default()
    }

    fn begin_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from("read rejected")));
        }
        Ok(())
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from("write rejected")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    // A write derived from an older revision than the stored row.
    fn is_stale(&self, group: &Group) -> bool {
        self.groups
            .get(&group.key)
            .is_some_and(|row| row.revision > group.revision)
    }

    fn assemble_group(&self, key: &EntityKey) -> Option<Group> {
        let row = self.groups.get(key).map(|g| g.clone())?;
        let members = self
            .memberships
            .get(key)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.is_active())
                    .map(|r| GroupMember {
                        id: r.member,
                        joined_at: r.joined_at,
                        context: r.context.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Group { members, ..row })
    }

    fn upsert_member(rows: &mut Vec<MembershipRow>, member: &GroupMember, operator: u64) {
        match rows.iter_mut().find(|r| r.member == member.id) {
            Some(row) if row.is_active() => {
                row.context = member.context.clone();
            }
            Some(row) => {
                row.joined_at = member.joined_at;
                row.context = member.context.clone();
                row.adding_operator = operator;
                row.removing_time = None;
                row.removing_operator = None;
            }
            None => rows.push(MembershipRow {
                member: member.id,
                joined_at: member.joined_at,
                context: member.context.clone(),
                adding_operator: operator,
                removing_time: None,
                removing_operator: None,
            }),
        }
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn read_contact(&self, key: &EntityKey) -> Result<Option<Contact>, StoreError> {
        self.begin_read()?;
        Ok(self.contacts.get(key).map(|c| c.clone()))
    }

    async fn write_contact(&self, contact: &Contact, device: Option<&Device>) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut row = contact.detached();
        row.devices.clear();
        self.contacts.insert(contact.key.clone(), row);

        if let Some(device) = device {
            let mut history = self.devices.entry(contact.key.clone()).or_default();
            if !history.contains(device) {
                history.push(device.detached());
            }
        }
        Ok(())
    }

    async fn read_group(&self, key: &EntityKey) -> Result<Option<Group>, StoreError> {
        self.begin_read()?;
        Ok(self.assemble_group(key))
    }

    async fn read_groups_with_member(
        &self,
        tenant: &TenantId,
        member: u64,
        active: Range<u64>,
        state: GroupState,
    ) -> Result<Vec<Group>, StoreError> {
        self.begin_read()?;
        let keys: Vec<EntityKey> = self
            .memberships
            .iter()
            .filter(|rows| rows.key().tenant == *tenant)
            .filter(|rows| rows.iter().any(|r| r.member == member && r.is_active()))
            .map(|rows| rows.key().clone())
            .collect();

        let mut groups: Vec<Group> = keys
            .iter()
            .filter_map(|key| self.assemble_group(key))
            .filter(|g| g.state == state && active.contains(&g.last_active))
            .collect();
        groups.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(groups)
    }

    async fn write_group(&self, group: &Group) -> Result<(), StoreError> {
        self.begin_write()?;
        if self.is_stale(group) {
            return Ok(());
        }
        self.groups.insert(
            group.key.clone(),
            Group {
                members: Vec::new(),
                ..group.clone()
            },
        );
        let mut rows = self.memberships.entry(group.key.clone()).or_default();
        for member in &group.members {
            Self::upsert_member(&mut rows, member, group.owner);
        }
        let now = now_ms();
        for row in rows.iter_mut().filter(|r| r.is_active() && !group.is_member(r.member)) {
            row.removing_time = Some(now);
            row.removing_operator = Some(group.owner);
        }
        Ok(())
    }

    async fn add_members(&self, group: &Group, members: &[GroupMember], operator: u64) -> Result<(), StoreError> {
        self.begin_write()?;
        if !self.groups.contains_key(&group.key) {
            return Err(StoreError::MissingRow(group.key.to_string()));
        }
        if self.is_stale(group) {
            return Ok(());
        }
        let mut rows = self.memberships.entry(group.key.clone()).or_default();
        for member in members {
            Self::upsert_member(&mut rows, member, operator);
        }
        Ok(())
    }

    async fn remove_members(&self, group: &Group, ids: &[u64], operator: u64) -> Result<(), StoreError> {
        self.begin_write()?;
        if self.is_stale(group) {
            return Ok(());
        }
        let Some(mut rows) = self.memberships.get_mut(&group.key) else {
            return Err(StoreError::MissingRow(group.key.to_string()));
        };
        let now = now_ms();
        for row in rows.iter_mut().filter(|r| r.is_active() && ids.contains(&r.member)) {
            row.removing_time = Some(now);
            row.removing_operator = Some(operator);
        }
        Ok(())
    }

    async fn read_appendix(&self, owner: &AppendixOwner) -> Result<Option<Appendix>, StoreError> {
        self.begin_read()?;
        Ok(self.appendices.get(owner).map(|a| a.clone()))
    }

    async fn write_appendix(&self, appendix: &Appendix) -> Result<(), StoreError> {
        self.begin_write()?;
        self.appendices.insert(appendix.owner.clone(), appendix.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(members: &[u64]) -> Group {
        Group {
            key: EntityKey::new("acme", 100),
            name: "team".into(),
            tag: "public".into(),
            owner: members[0],
            creation: 1,
            last_active: 1,
            state: GroupState::Normal,
            members: members.iter().map(|id| GroupMember::new(*id, 1)).collect(),
            context: None,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn test_contact_row_has_no_devices() {
        let store = MemoryStore::new();
        let mut contact = Contact::new(EntityKey::new("acme", 1), "A");
        let device = Device::new("phone", "iOS");
        contact.upsert_device(device.clone());

        store.write_contact(&contact, Some(&device)).await.unwrap();
        store.write_contact(&contact, Some(&device)).await.unwrap();

        let read = store.read_contact(&contact.key).await.unwrap().unwrap();
        assert!(read.devices.is_empty());
        assert_eq!(store.device_history(&contact.key).len(), 1);
    }

    #[tokio::test]
    async fn test_membership_soft_delete_and_revive() {
        let store = MemoryStore::new();
        let mut g = group(&[1, 2]);
        store.write_group(&g).await.unwrap();

        g.revision = 1;
        store.remove_members(&g, &[2], 1).await.unwrap();
        let read = store.read_group(&g.key).await.unwrap().unwrap();
        assert_eq!(read.member_ids(), vec![1]);
        let rows = store.membership_rows(&g.key);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].removing_operator, Some(1));

        g.revision = 2;
        store.add_members(&g, &[GroupMember::new(2, 5)], 1).await.unwrap();
        let rows = store.membership_rows(&g.key);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(MembershipRow::is_active));
    }

    #[tokio::test]
    async fn test_add_members_is_idempotent() {
        let store = MemoryStore::new();
        let mut g = group(&[1]);
        store.write_group(&g).await.unwrap();
        let m = [GroupMember::new(3, 2)];
        store.add_members(&g, &m, 1).await.unwrap();
        store.add_members(&g, &m, 1).await.unwrap();
        g.members.push(m[0].clone());
        store.write_group(&g).await.unwrap();
        assert_eq!(store.membership_rows(&g.key).len(), 2);
        assert_eq!(store.read_group(&g.key).await.unwrap().unwrap().member_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_write_group_soft_deletes_departed_members() {
        let store = MemoryStore::new();
        let mut g = group(&[1, 2, 3]);
        store.write_group(&g).await.unwrap();

        g.members.retain(|m| m.id != 3);
        g.revision = 1;
        store.write_group(&g).await.unwrap();

        let rows = store.membership_rows(&g.key);
        let departed = rows.iter().find(|r| r.member == 3).unwrap();
        assert!(!departed.is_active());
        assert_eq!(departed.removing_operator, Some(1));
        assert_eq!(store.read_group(&g.key).await.unwrap().unwrap().member_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stale_revision_is_ignored() {
        let store = MemoryStore::new();
        let mut newer = group(&[1, 2, 6]);
        newer.revision = 2;
        store.write_group(&newer).await.unwrap();

        let mut older = group(&[1, 2]);
        older.revision = 1;
        older.name = "old".into();
        store.write_group(&older).await.unwrap();
        store.remove_members(&older, &[6], 1).await.unwrap();

        let read = store.read_group(&newer.key).await.unwrap().unwrap();
        assert_eq!(read.name, "team");
        assert_eq!(read.member_ids(), vec![1, 2, 6]);
    }

    #[tokio::test]
    async fn test_groups_with_member_filters_and_sorts() {
        let store = MemoryStore::new();
        let mut a = group(&[1, 2]);
        a.last_active = 10;
        let mut b = group(&[3, 2]);
        b.key = EntityKey::new("acme", 101);
        b.last_active = 20;
        let mut gone = group(&[4, 2]);
        gone.key = EntityKey::new("acme", 102);
        gone.last_active = 15;
        gone.state = GroupState::Dismissed;
        let mut left = group(&[5, 2]);
        left.key = EntityKey::new("acme", 103);
        left.last_active = 12;
        let mut elsewhere = group(&[6, 2]);
        elsewhere.key = EntityKey::new("other", 104);
        for g in [&a, &b, &gone, &left, &elsewhere] {
            store.write_group(g).await.unwrap();
        }
        left.members.retain(|m| m.id != 2);
        left.revision = 1;
        store.write_group(&left).await.unwrap();

        let tenant = TenantId::new("acme");
        let found = store
            .read_groups_with_member(&tenant, 2, 0..u64::MAX, GroupState::Normal)
            .await
            .unwrap();
        let keys: Vec<u64> = found.iter().map(|g| g.key.id).collect();
        assert_eq!(keys, vec![101, 100]);

        let window = store
            .read_groups_with_member(&tenant, 2, 10..20, GroupState::Normal)
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].key.id, 100);

        let dismissed = store
            .read_groups_with_member(&tenant, 2, 0..u64::MAX, GroupState::Dismissed)
            .await
            .unwrap();
        assert_eq!(dismissed[0].key.id, 102);
    }

    #[tokio::test]
    async fn test_add_members_requires_group() {
        let store = MemoryStore::new();
        let err = store
            .add_members(&group(&[1]), &[GroupMember::new(1, 1)], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingRow(_)));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.write_group(&group(&[1])).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.write_count(), 0);
        assert!(store.read_group(&EntityKey::new("acme", 100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_reads() {
        let store = MemoryStore::new();
        store.write_group(&group(&[1])).await.unwrap();
        store.set_fail_reads(true);
        assert!(store.read_group(&EntityKey::new("acme", 100)).await.is_err());
        store.set_fail_reads(false);
        assert!(store.read_group(&EntityKey::new("acme", 100)).await.unwrap().is_some());
    }
}
