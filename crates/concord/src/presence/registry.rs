//! Node-local group cache implementing refresh-then-mutate.
//!
//! Group state can change on any node at any time, and the cache has no
//! multi-key transactions, so every mutation here:
//!
//! 1. **refreshes** the group from the cluster cache, falling back to the
//!    store (and re-populating the cache). A group missing from both is
//!    evicted locally and reported as [`PresenceError::EntityNotFound`].
//! 2. **mutates** the refreshed copy, rejecting changes to dismissed groups
//!    and skipping owner removal.
//! 3. **commits** only when something changed: cache put, queued store
//!    write, local update.

use crate::cache::ClusterCache;
use crate::core::{now_ms, CacheKey, Document, EntityKey};
use crate::entity::{Group, GroupBundle, GroupChanges, GroupMember, GroupState, NewGroup};
use crate::error::{PresenceError, Violation};
use crate::storage::{PersistentStore, StoreWriter};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static GROUP_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Time-seeded, strictly increasing group id.
fn next_group_id() -> u64 {
    GROUP_SERIAL.fetch_max(now_ms() * 1_000, Ordering::Relaxed);
    GROUP_SERIAL.fetch_add(1, Ordering::Relaxed) + 1
}

enum Commit {
    Unchanged,
    Group,
    Added(Vec<GroupMember>),
    Removed(Vec<u64>),
}

/// Recently used groups of one node, kept consistent with the cluster.
pub struct GroupRegistry {
    groups: DashMap<EntityKey, Group>,
    active: DashMap<EntityKey, u64>,
    cache: Arc<dyn ClusterCache>,
    store: Arc<dyn PersistentStore>,
    writer: StoreWriter,
}

impl GroupRegistry {
    /// Creates an empty registry over the given collaborators.
    pub fn new(cache: Arc<dyn ClusterCache>, store: Arc<dyn PersistentStore>, writer: StoreWriter) -> Self {
        Self {
            groups: DashMap::new(),
            active: DashMap::new(),
            cache,
            store,
            writer,
        }
    }

    /// Fetches the canonical group and updates the local copy.
    pub async fn refresh(&self, key: &EntityKey) -> Result<Group, PresenceError> {
        let cache_key = CacheKey::group(key);
        match self.cache.get_value::<Group>(&cache_key).await {
            Ok(Some(group)) => {
                self.groups.insert(key.clone(), group.clone());
                return Ok(group);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(group = %key, error = %e, "Ignoring undecodable group snapshot"),
        }

        match self.store.read_group(key).await? {
            Some(group) => {
                self.cache.put_value(&cache_key, &group).await?;
                self.groups.insert(key.clone(), group.clone());
                Ok(group)
            }
            None => {
                self.groups.remove(key);
                Err(PresenceError::EntityNotFound(key.clone()))
            }
        }
    }

    /// Local copy, without refreshing.
    pub fn cached(&self, key: &EntityKey) -> Option<Group> {
        self.groups.get(key).map(|g| g.clone())
    }

    /// Number of locally cached groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns `true` if no groups are cached locally.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    async fn mutate<F>(&self, key: &EntityKey, operator: u64, f: F) -> Result<(Group, Commit), PresenceError>
    where
        F: FnOnce(&mut Group) -> Result<Commit, PresenceError>,
    {
        let mut group = self.refresh(key).await?;
        if group.is_dismissed() {
            return Err(PresenceError::violation(key, Violation::Dismissed));
        }

        let commit = f(&mut group)?;
        if matches!(commit, Commit::Unchanged) {
            return Ok((group, commit));
        }

        group.last_active = group.last_active.max(now_ms());
        group.revision += 1;
        self.cache.put_value(&CacheKey::group(key), &group).await?;
        match &commit {
            Commit::Added(members) => self.writer.add_members(&group, members.clone(), operator),
            Commit::Removed(ids) => self.writer.remove_members(&group, ids.clone(), operator),
            Commit::Group | Commit::Unchanged => {}
        }
        self.writer.group(&group);
        self.groups.insert(key.clone(), group.clone());
        Ok((group, commit))
    }

    /// Creates a group; the owner becomes its first member.
    pub async fn create(&self, new: NewGroup) -> Result<Group, PresenceError> {
        let now = now_ms();
        let mut members = vec![GroupMember::new(new.owner, now)];
        for id in new.members {
            if !members.iter().any(|m| m.id == id) {
                members.push(GroupMember::new(id, now));
            }
        }

        let group = Group {
            key: EntityKey::new(new.tenant, next_group_id()),
            name: new.name,
            tag: new.tag,
            owner: new.owner,
            creation: now,
            last_active: now,
            state: GroupState::Normal,
            members,
            context: new.context,
            revision: 0,
        };

        self.cache.put_value(&CacheKey::group(&group.key), &group).await?;
        self.writer.group(&group);
        self.groups.insert(group.key.clone(), group.clone());
        tracing::debug!(group = %group.key, owner = group.owner, members = group.members.len(), "Group created");
        Ok(group)
    }

    /// Adds members, skipping ones already present. The bundle lists only
    /// the members actually added.
    pub async fn add_members(&self, key: &EntityKey, ids: &[u64], operator: u64) -> Result<GroupBundle, PresenceError> {
        let now = now_ms();
        let (group, commit) = self
            .mutate(key, operator, |group| {
                let mut added = Vec::new();
                for &id in ids {
                    if group.is_member(id) {
                        continue;
                    }
                    let member = GroupMember::new(id, now);
                    group.members.push(member.clone());
                    added.push(member);
                }
                Ok(if added.is_empty() {
                    Commit::Unchanged
                } else {
                    Commit::Added(added)
                })
            })
            .await?;

        let members = match commit {
            Commit::Added(added) => added.into_iter().map(|m| m.id).collect(),
            _ => Vec::new(),
        };
        Ok(GroupBundle {
            group,
            members,
            operator,
        })
    }

    /// Removes members, skipping the owner and non-members. Also returns the
    /// member ids as they were before the removal.
    pub async fn remove_members(
        &self,
        key: &EntityKey,
        ids: &[u64],
        operator: u64,
    ) -> Result<(GroupBundle, Vec<u64>), PresenceError> {
        let mut before = Vec::new();
        let (group, commit) = self
            .mutate(key, operator, |group| {
                before = group.member_ids();
                let mut removed = Vec::new();
                for &id in ids {
                    if id == group.owner {
                        let err = PresenceError::violation(key, Violation::OwnerRemoval(id));
                        tracing::warn!(error = %err, "Skipping member removal");
                        continue;
                    }
                    let Some(idx) = group.members.iter().position(|m| m.id == id) else {
                        continue;
                    };
                    group.members.remove(idx);
                    removed.push(id);
                }
                Ok(if removed.is_empty() {
                    Commit::Unchanged
                } else {
                    Commit::Removed(removed)
                })
            })
            .await?;

        let members = match commit {
            Commit::Removed(removed) => removed,
            _ => Vec::new(),
        };
        let bundle = GroupBundle {
            group,
            members,
            operator,
        };
        Ok((bundle, before))
    }

    /// Applies field changes. A new owner must already be a member.
    pub async fn modify(&self, key: &EntityKey, changes: GroupChanges, operator: u64) -> Result<(Group, bool), PresenceError> {
        let (group, commit) = self
            .mutate(key, operator, |group| {
                let mut changed = false;
                if let Some(owner) = changes.owner.filter(|o| *o != group.owner) {
                    if !group.is_member(owner) {
                        return Err(PresenceError::violation(&group.key, Violation::OwnerNotMember(owner)));
                    }
                    group.owner = owner;
                    changed = true;
                }
                if let Some(name) = changes.name.filter(|n| *n != group.name) {
                    group.name = name;
                    changed = true;
                }
                if let Some(tag) = changes.tag.filter(|t| *t != group.tag) {
                    group.tag = tag;
                    changed = true;
                }
                if let Some(context) = changes.context.filter(|c| group.context.as_ref() != Some(c)) {
                    group.context = Some(context);
                    changed = true;
                }
                Ok(if changed { Commit::Group } else { Commit::Unchanged })
            })
            .await?;
        let changed = !matches!(commit, Commit::Unchanged);
        Ok((group, changed))
    }

    /// Replaces one member's per-group context.
    pub async fn modify_member(
        &self,
        key: &EntityKey,
        member: u64,
        context: Document,
        operator: u64,
    ) -> Result<GroupBundle, PresenceError> {
        let (group, commit) = self
            .mutate(key, operator, |group| {
                let group_key = group.key.clone();
                let slot = group
                    .member_mut(member)
                    .ok_or_else(|| PresenceError::violation(&group_key, Violation::NotMember(member)))?;
                if slot.context.as_ref() == Some(&context) {
                    return Ok(Commit::Unchanged);
                }
                slot.context = Some(context);
                Ok(Commit::Group)
            })
            .await?;

        let members = match commit {
            Commit::Unchanged => Vec::new(),
            _ => vec![member],
        };
        Ok(GroupBundle {
            group,
            members,
            operator,
        })
    }

    /// Moves the group to [`GroupState::Dismissed`].
    pub async fn dissolve(&self, key: &EntityKey, operator: u64) -> Result<Group, PresenceError> {
        let (group, _) = self
            .mutate(key, operator, |group| {
                group.state = GroupState::Dismissed;
                Ok(Commit::Group)
            })
            .await?;
        self.active.remove(key);
        tracing::debug!(group = %key, operator, "Group dismissed");
        Ok(group)
    }

    /// Records activity in a group, to be written by [`flush_active`](Self::flush_active).
    pub fn touch_active(&self, key: &EntityKey, timestamp: u64) {
        self.active
            .entry(key.clone())
            .and_modify(|t| *t = (*t).max(timestamp))
            .or_insert(timestamp);
    }

    /// Writes pending active times newer than the canonical ones. Returns the
    /// number of groups updated.
    pub async fn flush_active(&self) -> usize {
        let pending: Vec<(EntityKey, u64)> = self
            .active
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut flushed = 0;
        for (key, timestamp) in pending {
            let mut group = match self.refresh(&key).await {
                Ok(group) => group,
                Err(PresenceError::EntityNotFound(_)) => {
                    self.active.remove(&key);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(group = %key, error = %e, "Failed to refresh group for active time");
                    continue;
                }
            };
            if timestamp > group.last_active {
                group.last_active = timestamp;
                group.revision += 1;
                if let Err(e) = self.cache.put_value(&CacheKey::group(&key), &group).await {
                    tracing::warn!(group = %key, error = %e, "Failed to cache active time");
                    continue;
                }
                self.writer.group(&group);
                self.groups.insert(key.clone(), group);
                flushed += 1;
            }
            self.active.remove_if(&key, |_, t| *t == timestamp);
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::MemoryStore;

    struct Fixture {
        cache: Arc<MemoryCache>,
        store: Arc<MemoryStore>,
        writer: StoreWriter,
        registry: GroupRegistry,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let writer = StoreWriter::spawn(store.clone());
        let registry = GroupRegistry::new(cache.clone(), store.clone(), writer.clone());
        Fixture {
            cache,
            store,
            writer,
            registry,
        }
    }

    #[tokio::test]
    async fn test_create_puts_owner_first_and_dedups() {
        let f = fixture();
        let group = f
            .registry
            .create(NewGroup::new("acme", "team", 1).members([2, 1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(group.member_ids(), vec![1, 2, 3]);
        assert!(f.cache.contains(&CacheKey::group(&group.key)));

        f.writer.flush().await;
        let stored = f.store.read_group(&group.key).await.unwrap().unwrap();
        assert_eq!(stored.member_ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_group_ids_are_unique() {
        let a = next_group_id();
        let b = next_group_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_refresh_repopulates_cache_from_store() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();
        f.writer.flush().await;

        let cache: Arc<dyn ClusterCache> = f.cache.clone();
        cache.remove(&CacheKey::group(&group.key)).await;
        let refreshed = f.registry.refresh(&group.key).await.unwrap();
        assert_eq!(refreshed.key, group.key);
        assert!(f.cache.contains(&CacheKey::group(&group.key)));
    }

    #[tokio::test]
    async fn test_refresh_miss_evicts_local_copy() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();
        // Never reached the store; now gone from the cache too.
        let cache: Arc<dyn ClusterCache> = f.cache.clone();
        f.store.set_fail_writes(true);
        f.writer.flush().await;
        cache.remove(&CacheKey::group(&group.key)).await;

        assert!(f.registry.cached(&group.key).is_some());
        let err = f.registry.refresh(&group.key).await.unwrap_err();
        assert!(matches!(err, PresenceError::EntityNotFound(_)));
        assert!(f.registry.cached(&group.key).is_none());
    }

    #[tokio::test]
    async fn test_remove_members_skips_owner() {
        let f = fixture();
        let group = f
            .registry
            .create(NewGroup::new("acme", "team", 1).members([2, 3]))
            .await
            .unwrap();

        let (bundle, before) = f.registry.remove_members(&group.key, &[1, 2, 9], 1).await.unwrap();
        assert_eq!(bundle.members, vec![2]);
        assert_eq!(bundle.group.member_ids(), vec![1, 3]);
        assert_eq!(before, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unchanged_mutation_writes_nothing() {
        let f = fixture();
        let group = f
            .registry
            .create(NewGroup::new("acme", "team", 1).members([2]))
            .await
            .unwrap();
        f.writer.flush().await;
        let writes = f.store.write_count();

        let bundle = f.registry.add_members(&group.key, &[2], 1).await.unwrap();
        assert!(bundle.is_empty());
        let (_, changed) = f.registry.modify(&group.key, GroupChanges::new().name("team"), 1).await.unwrap();
        assert!(!changed);

        f.writer.flush().await;
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_modify_owner_must_be_member() {
        let f = fixture();
        let group = f
            .registry
            .create(NewGroup::new("acme", "team", 1).members([2]))
            .await
            .unwrap();

        let err = f
            .registry
            .modify(&group.key, GroupChanges::new().owner(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PresenceError::InvariantViolation {
                violation: Violation::OwnerNotMember(5),
                ..
            }
        ));

        let (group, changed) = f
            .registry
            .modify(&group.key, GroupChanges::new().owner(2).name("renamed"), 1)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(group.owner, 2);
        assert_eq!(group.name, "renamed");
    }

    #[tokio::test]
    async fn test_modify_member_context() {
        let f = fixture();
        let group = f
            .registry
            .create(NewGroup::new("acme", "team", 1).members([2]))
            .await
            .unwrap();
        let ctx = Document::new().with("nick", "bee");

        let bundle = f.registry.modify_member(&group.key, 2, ctx.clone(), 1).await.unwrap();
        assert_eq!(bundle.members, vec![2]);
        assert_eq!(bundle.group.member(2).unwrap().context, Some(ctx.clone()));

        let again = f.registry.modify_member(&group.key, 2, ctx, 1).await.unwrap();
        assert!(again.is_empty());

        let err = f
            .registry
            .modify_member(&group.key, 7, Document::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PresenceError::InvariantViolation {
                violation: Violation::NotMember(7),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dismissed_group_rejects_mutation() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();
        let dissolved = f.registry.dissolve(&group.key, 1).await.unwrap();
        assert!(dissolved.is_dismissed());

        let err = f.registry.add_members(&group.key, &[2], 1).await.unwrap_err();
        assert!(matches!(
            err,
            PresenceError::InvariantViolation {
                violation: Violation::Dismissed,
                ..
            }
        ));
        assert!(f.registry.dissolve(&group.key, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_active_only_moves_forward() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();

        f.registry.touch_active(&group.key, group.last_active + 500);
        f.registry.touch_active(&group.key, group.last_active + 100);
        f.registry.touch_active(&EntityKey::new("acme", 1), 99);
        assert_eq!(f.registry.flush_active().await, 1);

        let refreshed = f.registry.refresh(&group.key).await.unwrap();
        assert_eq!(refreshed.last_active, group.last_active + 500);

        f.registry.touch_active(&group.key, group.last_active);
        assert_eq!(f.registry.flush_active().await, 0);
    }

    #[tokio::test]
    async fn test_flush_active_keeps_pending_time_on_read_failure() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();
        f.writer.flush().await;
        let cache: Arc<dyn ClusterCache> = f.cache.clone();
        cache.remove(&CacheKey::group(&group.key)).await;

        f.store.set_fail_reads(true);
        f.registry.touch_active(&group.key, group.last_active + 500);
        assert_eq!(f.registry.flush_active().await, 0);
        assert!(f.registry.active.contains_key(&group.key));

        f.store.set_fail_reads(false);
        assert_eq!(f.registry.flush_active().await, 1);
        assert!(f.registry.active.is_empty());
        let refreshed = f.registry.refresh(&group.key).await.unwrap();
        assert_eq!(refreshed.last_active, group.last_active + 500);
    }

    #[tokio::test]
    async fn test_commits_bump_revision() {
        let f = fixture();
        let group = f.registry.create(NewGroup::new("acme", "team", 1)).await.unwrap();
        assert_eq!(group.revision, 0);

        let bundle = f.registry.add_members(&group.key, &[2], 1).await.unwrap();
        assert_eq!(bundle.group.revision, 1);
        let unchanged = f.registry.add_members(&group.key, &[2], 1).await.unwrap();
        assert_eq!(unchanged.group.revision, 1);
        let (modified, _) = f.registry.modify(&group.key, GroupChanges::new().name("x"), 1).await.unwrap();
        assert_eq!(modified.revision, 2);
    }
}
