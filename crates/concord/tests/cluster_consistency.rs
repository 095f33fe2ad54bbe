//! Consistency of presence and group state across nodes sharing one cache,
//! store and event bus.

use concord::cache::ClusterCache;
use concord::core::CacheKey;
use concord::{
    ChannelHandle, Contact, ContactEvent, Device, DirectoryConfig, Document, EntityKey, EventName, MemoryCache,
    MemoryHub, MemoryStore, NewGroup, PersistentStore, PresenceDirectory, Reaper, ReaperConfig, SessionToken,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Cluster {
    cache: Arc<MemoryCache>,
    store: Arc<MemoryStore>,
    nodes: Vec<PresenceDirectory>,
}

fn cluster_with(size: usize, config: DirectoryConfig) -> Cluster {
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    let hub = MemoryHub::new();
    let nodes = (0..size)
        .map(|i| {
            let (bus, inbox) = hub.attach(format!("node-{i}").as_str());
            let directory = PresenceDirectory::new(config.clone(), cache.clone(), Arc::new(bus), store.clone());
            directory.spawn_event_loop(inbox);
            directory
        })
        .collect();
    Cluster { cache, store, nodes }
}

fn cluster(size: usize) -> Cluster {
    cluster_with(size, DirectoryConfig::default())
}

impl Cluster {
    async fn flush(&self) {
        for node in &self.nodes {
            node.flush().await;
        }
    }

    fn shared_cache(&self) -> Arc<dyn ClusterCache> {
        self.cache.clone()
    }
}

fn contact(id: u64) -> Contact {
    Contact::new(EntityKey::new("acme", id), format!("user-{id}"))
}

fn token(id: u64, device: &str) -> SessionToken {
    SessionToken::new(format!("{id}-{device}"), "acme")
}

/// Signs `id` in on `node` with a live device and returns its event receiver.
async fn connect(node: &PresenceDirectory, id: u64, device: &str) -> UnboundedReceiver<ContactEvent> {
    let (handle, rx) = ChannelHandle::new();
    node.sign_in(contact(id), &token(id, device), Device::new(device, "Web").with_handle(handle))
        .await
        .expect("same tenant");
    rx
}

async fn next_event(rx: &mut UnboundedReceiver<ContactEvent>) -> ContactEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("handle open")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<ContactEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected event");
}

#[tokio::test]
async fn test_device_merge_is_union_in_either_order() {
    for order in [[0, 1], [1, 0]] {
        let c = cluster(2);
        let phone = Device::new("phone", "iOS");
        let laptop = Device::new("laptop", "Web");

        c.nodes[order[0]]
            .sign_in(contact(1), &token(1, "phone"), phone.clone())
            .await
            .unwrap();
        let merged = c.nodes[order[1]]
            .sign_in(contact(1), &token(1, "laptop"), laptop.clone())
            .await
            .unwrap();

        assert_eq!(merged.devices.len(), 2);
        assert!(merged.device(&phone).is_some());
        assert!(merged.device(&laptop).is_some());

        let cached: Contact = c
            .shared_cache()
            .get_value(&CacheKey::contact(&contact(1).key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.devices.len(), 2);
    }
}

#[tokio::test]
async fn test_sign_in_prefers_incoming_profile() {
    let c = cluster(2);
    c.nodes[0]
        .sign_in(contact(1), &token(1, "a"), Device::new("a", "Web"))
        .await
        .unwrap();

    let renamed = Contact::new(EntityKey::new("acme", 1), "Renamed").with_context(Document::new().with("x", 1));
    let merged = c.nodes[1]
        .sign_in(renamed, &token(1, "b"), Device::new("b", "Web"))
        .await
        .unwrap();
    assert_eq!(merged.name, "Renamed");
    assert!(merged.context.is_some());
    assert_eq!(merged.devices.len(), 2);
}

#[tokio::test]
async fn test_last_device_sign_out_clears_cache() {
    let c = cluster(2);
    let key = contact(1).key;
    let phone = Device::new("phone", "iOS");
    let laptop = Device::new("laptop", "Web");
    c.nodes[0].sign_in(contact(1), &token(1, "phone"), phone.clone()).await.unwrap();
    c.nodes[1].sign_in(contact(1), &token(1, "laptop"), laptop.clone()).await.unwrap();

    let left = c.nodes[0].sign_out(&contact(1), &token(1, "phone"), &phone).await;
    assert_eq!(left.devices, vec![laptop.clone()]);
    assert!(c.cache.contains(&CacheKey::contact(&key)));
    assert!(!c.nodes[0].is_subscribed(&key));
    assert!(c.nodes[1].is_subscribed(&key));

    let left = c.nodes[1].sign_out(&contact(1), &token(1, "laptop"), &laptop).await;
    assert!(left.devices.is_empty());
    assert!(!c.cache.contains(&CacheKey::contact(&key)));
    assert!(!c.nodes[1].is_subscribed(&key));

    c.flush().await;
    let fetched = c.nodes[0].get_contact(&key.tenant, key.id).await;
    assert_eq!(fetched.name, "user-1");
    assert!(fetched.devices.is_empty());
    let stored = c.store.read_contact(&key).await.unwrap().unwrap();
    assert_eq!(fetched, stored);
}

#[tokio::test]
async fn test_sign_out_under_held_lock_still_unbinds() {
    let c = cluster_with(1, DirectoryConfig::default().lock_timeout(Duration::from_millis(20)));
    let node = &c.nodes[0];
    let phone = Device::new("phone", "iOS");
    node.sign_in(contact(1), &token(1, "phone"), phone.clone()).await.unwrap();

    let shared = c.shared_cache();
    let held = shared.lock(&CacheKey::contact(&contact(1).key)).await;
    let left = node.sign_out(&contact(1), &token(1, "phone"), &phone).await;
    drop(held);

    assert!(left.devices.is_empty());
    assert!(node.contact_for_token(&token(1, "phone").code).is_none());
    assert!(!node.is_subscribed(&contact(1).key));
    // The snapshot was not reachable, so it still lists the device.
    assert!(c.cache.contains(&CacheKey::contact(&contact(1).key)));
}

#[tokio::test]
async fn test_owner_removal_is_rejected() {
    let c = cluster(1);
    let node = &c.nodes[0];
    let group = node
        .create_group(NewGroup::new("acme", "team", 1).members([2, 3]))
        .await
        .unwrap();

    let bundle = node.remove_group_members(&group.key, &[1, 2], 1).await.unwrap();
    assert_eq!(bundle.members, vec![2]);
    assert_eq!(bundle.group.owner, 1);
    assert_eq!(bundle.group.member_ids(), vec![1, 3]);

    let only_owner = node.remove_group_members(&group.key, &[1], 1).await.unwrap();
    assert!(only_owner.is_empty());
    assert!(only_owner.group.is_member(1));
}

#[tokio::test]
async fn test_idempotent_add() {
    let c = cluster(1);
    let node = &c.nodes[0];
    let group = node.create_group(NewGroup::new("acme", "team", 1)).await.unwrap();

    let first = node.add_group_members(&group.key, &[4], 1).await.unwrap();
    assert_eq!(first.members, vec![4]);
    let second = node.add_group_members(&group.key, &[4], 1).await.unwrap();
    assert!(second.is_empty());

    c.flush().await;
    let rows = c.store.membership_rows(&group.key);
    assert_eq!(rows.iter().filter(|r| r.member == 4).count(), 1);
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_refresh_then_mutate_across_nodes() {
    let c = cluster(2);
    let group = c.nodes[0]
        .create_group(NewGroup::new("acme", "team", 1).members([2]))
        .await
        .unwrap();

    // Node B has never seen the group; node A's local copy goes stale.
    let on_b = c.nodes[1].add_group_members(&group.key, &[5], 2).await.unwrap();
    assert_eq!(on_b.members, vec![5]);
    assert_eq!(c.nodes[0].groups().cached(&group.key).unwrap().member_ids(), vec![1, 2]);

    let on_a = c.nodes[0].add_group_members(&group.key, &[6], 1).await.unwrap();
    assert_eq!(on_a.members, vec![6]);
    assert_eq!(on_a.group.member_ids(), vec![1, 2, 5, 6]);

    let seen_by_b = c.nodes[1].get_group(&group.key).await.unwrap();
    assert_eq!(seen_by_b.member_ids(), vec![1, 2, 5, 6]);

    c.flush().await;
    // Each node drains its own write queue, so row order is not fixed.
    let mut stored = c.store.read_group(&group.key).await.unwrap().unwrap().member_ids();
    stored.sort_unstable();
    assert_eq!(stored, vec![1, 2, 5, 6]);
}

#[tokio::test]
async fn test_group_missing_everywhere_is_evicted() {
    let c = cluster(1);
    let node = &c.nodes[0];
    c.store.set_fail_writes(true);
    let group = node.create_group(NewGroup::new("acme", "team", 1)).await.unwrap();
    c.flush().await;

    c.shared_cache().remove(&CacheKey::group(&group.key)).await;
    assert!(node.add_group_members(&group.key, &[2], 1).await.is_none());
    assert!(node.groups().cached(&group.key).is_none());
}

#[tokio::test]
async fn test_failed_store_write_repaired_by_next_mutation() {
    let c = cluster(1);
    let node = &c.nodes[0];
    c.store.set_fail_writes(true);
    let group = node
        .create_group(NewGroup::new("acme", "team", 1).members([2]))
        .await
        .unwrap();
    c.flush().await;
    assert!(node.store_failures() >= 1);
    assert!(c.store.read_group(&group.key).await.unwrap().is_none());

    // The cache is still authoritative for interactive reads.
    assert_eq!(node.get_group(&group.key).await.unwrap().member_ids(), vec![1, 2]);

    c.store.set_fail_writes(false);
    node.add_group_members(&group.key, &[3], 1).await.unwrap();
    c.flush().await;
    let stored = c.store.read_group(&group.key).await.unwrap().unwrap();
    assert_eq!(stored.member_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_failed_member_removal_repaired_by_next_mutation() {
    let c = cluster(1);
    let node = &c.nodes[0];
    let group = node
        .create_group(NewGroup::new("acme", "team", 1).members([2, 3]))
        .await
        .unwrap();
    c.flush().await;

    c.store.set_fail_writes(true);
    node.remove_group_members(&group.key, &[3], 1).await.unwrap();
    c.flush().await;
    assert_eq!(c.store.read_group(&group.key).await.unwrap().unwrap().member_ids(), vec![1, 2, 3]);

    c.store.set_fail_writes(false);
    node.add_group_members(&group.key, &[4], 1).await.unwrap();
    c.flush().await;
    assert_eq!(c.store.read_group(&group.key).await.unwrap().unwrap().member_ids(), vec![1, 2, 4]);

    c.shared_cache().remove(&CacheKey::group(&group.key)).await;
    assert_eq!(node.get_group(&group.key).await.unwrap().member_ids(), vec![1, 2, 4]);
}

#[tokio::test]
async fn test_contact_and_group_sharing_an_id_stay_apart() {
    let c = cluster(2);
    let group = c.nodes[0]
        .create_group(NewGroup::new("acme", "team", 1).members([2]))
        .await
        .unwrap();

    let twin = Contact::new(group.key.clone(), "Carol");
    let merged = c.nodes[1]
        .sign_in(twin.clone(), &SessionToken::new("carol", "acme"), Device::new("phone", "iOS"))
        .await
        .unwrap();
    assert_eq!(merged.devices.len(), 1);

    let fetched = c.nodes[0].get_contact(&group.key.tenant, group.key.id).await;
    assert_eq!(fetched.name, "Carol");
    assert_eq!(fetched.devices.len(), 1);

    let latest = c.nodes[1].get_group(&group.key).await.unwrap();
    assert_eq!(latest.name, "team");
    assert_eq!(latest.member_ids(), vec![1, 2]);
    assert!(c.cache.contains(&CacheKey::contact(&group.key)));
    assert!(c.cache.contains(&CacheKey::group(&group.key)));
}

#[tokio::test]
async fn test_group_events_reach_members_on_other_nodes() {
    let c = cluster(2);
    let mut owner = connect(&c.nodes[0], 1, "a").await;
    let mut member = connect(&c.nodes[1], 2, "b").await;
    let mut leaver = connect(&c.nodes[1], 3, "c").await;

    let group = c.nodes[0]
        .create_group(NewGroup::new("acme", "team", 1).members([2, 3]))
        .await
        .unwrap();

    let created = next_event(&mut member).await;
    assert_eq!(created.name, EventName::CreateGroup);
    assert_eq!(created.bundle().unwrap().group.key, group.key);
    assert_eq!(next_event(&mut leaver).await.name, EventName::CreateGroup);
    assert_quiet(&mut owner).await;

    c.nodes[1].remove_group_members(&group.key, &[3], 1).await.unwrap();
    for rx in [&mut owner, &mut member, &mut leaver] {
        let event = next_event(rx).await;
        assert_eq!(event.name, EventName::RemoveGroupMember);
        assert_eq!(event.bundle().unwrap().members, vec![3]);
    }

    c.nodes[0]
        .update_group_appendix(&group.key, Document::new().with("notice", "hello"), true)
        .await
        .unwrap();
    assert_eq!(next_event(&mut owner).await.name, EventName::GroupAppendixUpdated);
    assert_eq!(next_event(&mut member).await.name, EventName::GroupAppendixUpdated);
    assert_quiet(&mut leaver).await;

    c.nodes[0].dissolve_group(&group.key, 1).await.unwrap();
    assert_eq!(next_event(&mut member).await.name, EventName::DissolveGroup);
    assert_quiet(&mut owner).await;
}

#[tokio::test]
async fn test_events_for_signed_out_contact_are_dropped() {
    let c = cluster(2);
    let mut rx = connect(&c.nodes[1], 2, "b").await;
    c.nodes[1]
        .sign_out(&contact(2), &token(2, "b"), &Device::new("b", "Web"))
        .await;

    c.nodes[0]
        .create_group(NewGroup::new("acme", "team", 1).members([2]))
        .await
        .unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_idle_reap() {
    let reaper_config = ReaperConfig::new()
        .cadence(1, 1, 1)
        .contact_idle(Duration::from_millis(200));
    let c = cluster_with(1, DirectoryConfig::default().reaper(reaper_config));
    let node = &c.nodes[0];

    for id in [1, 2] {
        let device = Device::new("d", "Web");
        node.sign_in(contact(id), &token(id, "d"), device.clone()).await.unwrap();
        node.sign_out(&contact(id), &token(id, "d"), &device).await;
        if id == 1 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }
    assert_eq!(node.table().len(), 2);

    let mut reaper = Reaper::new(node.clone());
    let report = reaper.tick().await;
    assert_eq!(report.contacts, Some((1, 0)));
    assert!(node.table().get(&contact(1).key).is_none());
    assert!(node.table().get(&contact(2).key).is_some());
}

#[tokio::test]
async fn test_reaper_strips_dead_devices_cluster_wide() {
    let reaper_config = ReaperConfig::new().cadence(1, 1, 1);
    let c = cluster_with(2, DirectoryConfig::default().reaper(reaper_config));

    let (dead, _rx) = ChannelHandle::new();
    c.nodes[0]
        .sign_in(contact(1), &token(1, "a"), Device::new("a", "Web").with_handle(dead.clone()))
        .await
        .unwrap();
    c.nodes[1]
        .sign_in(contact(1), &token(1, "b"), Device::new("b", "Web"))
        .await
        .unwrap();
    dead.close();

    let report = Reaper::new(c.nodes[0].clone()).tick().await;
    assert_eq!(report.contacts, Some((0, 1)));
    assert!(!c.nodes[0].is_subscribed(&contact(1).key));

    let cached: Contact = c
        .shared_cache()
        .get_value(&CacheKey::contact(&contact(1).key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.devices, vec![Device::new("b", "Web")]);
}

#[tokio::test]
async fn test_group_activity_flushed_by_reaper() {
    let reaper_config = ReaperConfig::new().cadence(1, 1, 1);
    let c = cluster_with(1, DirectoryConfig::default().reaper(reaper_config));
    let node = &c.nodes[0];
    let group = node.create_group(NewGroup::new("acme", "team", 1)).await.unwrap();

    let later = group.last_active + 60_000;
    node.touch_group(&group.key, later);
    let report = Reaper::new(node.clone()).tick().await;
    assert_eq!(report.groups, Some(1));

    c.flush().await;
    let stored = c.store.read_group(&group.key).await.unwrap().unwrap();
    assert_eq!(stored.last_active, later);
}
