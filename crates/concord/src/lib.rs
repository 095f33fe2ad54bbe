//! # Concord
//!
//! Presence and group-membership consistency for a clustered, multi-tenant
//! collaboration service.
//!
//! Each node of the cluster runs one [`PresenceDirectory`]. Together they
//! track which contacts are connected from which devices, keep group
//! membership consistent while any node may mutate it, and push membership
//! events to every node terminating an affected contact's sessions.
//!
//! ## Layers
//!
//! - [`cache`]: cluster-wide snapshot cache with a per-key lock primitive
//! - [`bus`]: at-most-once publish/subscribe over per-contact topics
//! - [`storage`]: durable tables behind a write-behind queue
//! - [`presence`]: the local presence table, group registry and directory
//! - [`reaper`]: periodic eviction of idle state
//!
//! Transports are traits ([`ClusterCache`], [`EventBus`], [`PersistentStore`],
//! [`ConnectionHandle`]); in-memory implementations are included so several
//! directories in one process can form a cluster.
//!
//! ## Quick Start
//!
//! ```ignore
//! use concord::{DirectoryConfig, MemoryCache, MemoryHub, MemoryStore, PresenceDirectory, Reaper};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(MemoryCache::new());
//! let store = Arc::new(MemoryStore::new());
//! let hub = MemoryHub::new();
//!
//! let (bus, inbox) = hub.attach("node-a");
//! let directory = PresenceDirectory::new(DirectoryConfig::default(), cache, Arc::new(bus), store);
//! directory.spawn_event_loop(inbox);
//! Reaper::new(directory.clone()).spawn();
//! ```

#![warn(missing_docs)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod core;
pub mod entity;
pub mod error;
pub mod presence;
pub mod reaper;
pub mod storage;

pub use bus::{ContactEvent, EventBus, EventName, EventPayload, MemoryHub};
pub use cache::{ClusterCache, MemoryCache};
pub use config::{ConfigError, DirectoryConfig, ReaperConfig};
pub use crate::core::{Document, DocValue, EntityKey, TenantId, Topic};
pub use entity::{
    Appendix, AppendixOwner, Contact, Device, Group, GroupBundle, GroupChanges, GroupMember, GroupState, NewGroup,
    SessionToken,
};
pub use error::{PresenceError, Violation};
pub use presence::{ChannelHandle, ConnectionHandle, PresenceDirectory};
pub use reaper::Reaper;
pub use storage::{MemoryStore, PersistentStore, StoreError};
