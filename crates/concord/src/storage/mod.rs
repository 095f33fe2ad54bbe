//! Durable storage seam and write-behind queue.
//!
//! The store is the source of truth across restarts, but not for
//! interactive reads: the directory writes to it asynchronously through a
//! [`StoreWriter`] and only reads from it on cache misses.
//!
//! Every write is an idempotent upsert keyed by tenant and id, so a write
//! that failed is repaired by the next write of the same entity.

mod memory;
mod writer;

pub use memory::{MembershipRow, MemoryStore};
pub use writer::StoreWriter;

use crate::core::{EntityKey, TenantId};
use crate::entity::{Appendix, AppendixOwner, Contact, Device, Group, GroupMember, GroupState};
use async_trait::async_trait;
use std::ops::Range;
use thiserror::Error;

/// Errors reported by a [`PersistentStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The write referenced a row that does not exist.
    #[error("missing row: {0}")]
    MissingRow(String),
}

/// Durable per-tenant tables for contacts, groups, memberships and
/// appendices.
#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    /// Reads a contact. Stored contacts carry no devices.
    async fn read_contact(&self, key: &EntityKey) -> Result<Option<Contact>, StoreError>;

    /// Upserts a contact, and records `device` in its device history.
    async fn write_contact(&self, contact: &Contact, device: Option<&Device>) -> Result<(), StoreError>;

    /// Reads a group with its current (not removed) members.
    async fn read_group(&self, key: &EntityKey) -> Result<Option<Group>, StoreError>;

    /// Upserts a group row and its members' membership rows. Active rows of
    /// members no longer in the group are soft-deleted. A group older than
    /// the stored row (by [`Group::revision`]) is ignored.
    async fn write_group(&self, group: &Group) -> Result<(), StoreError>;

    /// Groups in `state` that `member` currently belongs to, with last
    /// activity in `active`.
    async fn read_groups_with_member(
        &self,
        tenant: &TenantId,
        member: u64,
        active: Range<u64>,
        state: GroupState,
    ) -> Result<Vec<Group>, StoreError>;

    /// Adds membership rows, reviving soft-deleted ones. `group` is the
    /// state after the addition; stale revisions are ignored.
    async fn add_members(&self, group: &Group, members: &[GroupMember], operator: u64) -> Result<(), StoreError>;

    /// Soft-deletes membership rows. `group` is the state after the
    /// removal; stale revisions are ignored.
    async fn remove_members(&self, group: &Group, ids: &[u64], operator: u64) -> Result<(), StoreError>;

    /// Reads an appendix.
    async fn read_appendix(&self, owner: &AppendixOwner) -> Result<Option<Appendix>, StoreError>;

    /// Upserts an appendix.
    async fn write_appendix(&self, appendix: &Appendix) -> Result<(), StoreError>;
}
