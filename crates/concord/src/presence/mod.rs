//! Presence tracking and group membership for one node of a cluster.
//!
//! # Architecture
//!
//! Three sources of truth are kept in line:
//!
//! - **[`LocalPresenceTable`]**: contacts with a session on this node, with
//!   their live connection handles
//! - **[`ClusterCache`](crate::cache::ClusterCache)**: the canonical hot
//!   snapshot of every online contact and active group, shared cluster-wide
//! - **[`PersistentStore`](crate::storage::PersistentStore)**: durable rows,
//!   written behind through a [`StoreWriter`](crate::storage::StoreWriter)
//!
//! Device lists are merged under the cache's per-key lock. Group mutations
//! go through the [`GroupRegistry`]'s refresh-then-mutate protocol and are
//! announced on the [`EventBus`](crate::bus::EventBus) to every member's
//! topic; each node pushes those events to the devices it terminates.
//!
//! # Example
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let (bus, inbox) = hub.attach("node-a");
//! let directory = PresenceDirectory::new(config, cache, Arc::new(bus), store);
//! directory.spawn_event_loop(inbox);
//!
//! let contact = Contact::new(EntityKey::new("acme", 1), "Ada");
//! let token = SessionToken::new("t-1", "acme");
//! let device = Device::new("Chrome", "Web").with_handle(handle);
//! let merged = directory.sign_in(contact, &token, device).await;
//! ```

mod appendix;
mod connection;
mod directory;
mod registry;
mod table;

pub use appendix::AppendixCache;
pub use connection::{ChannelHandle, ConnectionHandle};
pub use directory::PresenceDirectory;
pub use registry::GroupRegistry;
pub use table::{LocalPresenceTable, SweepReport};
