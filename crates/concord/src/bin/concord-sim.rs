//! Concord cluster simulator
//!
//! Runs several directories in one process, sharing an in-memory cache,
//! store and event bus, and drives them through sign-in, group churn and
//! sign-out while counting the events each device receives.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=concord=debug cargo run --bin concord-sim -- --nodes 3 --contacts 4
//! ```

use clap::Parser;
use concord::{
    ChannelHandle, Contact, ContactEvent, Device, DirectoryConfig, EntityKey, GroupChanges, MemoryCache, MemoryHub,
    MemoryStore, NewGroup, PresenceDirectory, Reaper, SessionToken,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "concord-sim", about = "In-process presence cluster simulation")]
struct Cli {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Contacts signed in on each node
    #[arg(long, default_value = "4")]
    contacts: u64,

    /// Tenant every contact belongs to
    #[arg(long, default_value = "demo")]
    tenant: String,

    /// Directory config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

struct Session {
    contact: Contact,
    token: SessionToken,
    device: Device,
    node: usize,
    events: UnboundedReceiver<ContactEvent>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DirectoryConfig::from_path(path)?,
        None => DirectoryConfig::default(),
    };
    let nodes = cli.nodes.max(1);

    tracing::info!(nodes, contacts = cli.contacts, tenant = %cli.tenant, "Starting cluster");

    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryStore::new());
    let hub = MemoryHub::new();

    let mut directories = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let (bus, inbox) = hub.attach(format!("node-{i}").as_str());
        let directory = PresenceDirectory::new(config.clone(), cache.clone(), Arc::new(bus), store.clone());
        directory.spawn_event_loop(inbox);
        Reaper::new(directory.clone()).spawn();
        directories.push(directory);
    }

    // Sign everyone in, spreading contacts over the nodes.
    let mut sessions = Vec::new();
    for node in 0..nodes {
        for n in 0..cli.contacts {
            let id = node as u64 * cli.contacts + n + 1;
            let contact = Contact::new(EntityKey::new(cli.tenant.as_str(), id), format!("user-{id}"));
            let token = SessionToken::new(format!("token-{id}"), cli.tenant.as_str());
            let (handle, events) = ChannelHandle::new();
            let device = Device::new(format!("device-{id}"), "Sim");
            directories[node]
                .sign_in(contact.clone(), &token, device.clone().with_handle(handle))
                .await;
            sessions.push(Session {
                contact,
                token,
                device,
                node,
                events,
            });
        }
    }

    // One group per node, owned by that node's first contact, with everyone
    // from the next node as members.
    let mut groups = Vec::new();
    for node in 0..nodes {
        let owner = node as u64 * cli.contacts + 1;
        let next = (node + 1) % nodes;
        let members = (0..cli.contacts).map(|n| next as u64 * cli.contacts + n + 1);
        let request = NewGroup::new(cli.tenant.as_str(), format!("group-{node}"), owner).members(members);
        if let Some(group) = directories[node].create_group(request).await {
            groups.push((node, group));
        }
    }

    // Churn: every other node adds its own contacts, removes one, renames.
    for (node, group) in &groups {
        let actor = &directories[(node + 1) % nodes];
        let joiners: Vec<u64> = (0..cli.contacts).map(|n| *node as u64 * cli.contacts + n + 1).collect();
        actor.add_group_members(&group.key, &joiners, group.owner).await;
        if let Some(&leaver) = joiners.last() {
            actor.remove_group_members(&group.key, &[leaver, group.owner], group.owner).await;
        }
        actor
            .modify_group(&group.key, GroupChanges::new().name(format!("{}-renamed", group.name)), group.owner)
            .await;
    }

    for directory in &directories {
        directory.flush().await;
    }
    tokio::task::yield_now().await;

    for (_, group) in &groups {
        if let Some(latest) = directories[0].get_group(&group.key).await {
            tracing::info!(
                group = %latest.key,
                name = %latest.name,
                members = latest.members.len(),
                "Group state"
            );
        }
    }

    let mut received = 0;
    for session in &mut sessions {
        while session.events.try_recv().is_ok() {
            received += 1;
        }
    }
    tracing::info!(received, "Events delivered to devices");

    for session in &sessions {
        directories[session.node]
            .sign_out(&session.contact, &session.token, &session.device)
            .await;
    }
    for directory in &directories {
        directory.flush().await;
    }

    tracing::info!(
        cached = cache.len(),
        store_failures = directories.iter().map(|d| d.store_failures()).sum::<u64>(),
        "Cluster drained"
    );
    Ok(())
}
