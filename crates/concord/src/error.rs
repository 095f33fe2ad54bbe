//! Error types for the presence core.

use crate::core::{CodecError, EntityKey, TenantId};
use crate::storage::StoreError;
use thiserror::Error;

/// Errors raised inside the presence core.
///
/// Only [`DomainMismatch`](Self::DomainMismatch) and
/// [`EntityNotFound`](Self::EntityNotFound) are visible to callers of
/// [`PresenceDirectory`](crate::PresenceDirectory), as an empty result; the
/// rest are logged where they happen.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Token and contact belong to different tenants.
    #[error("token tenant {token} does not match contact tenant {contact}")]
    DomainMismatch {
        /// Tenant of the session token.
        token: TenantId,
        /// Tenant of the contact.
        contact: TenantId,
    },

    /// Entity absent from both the cluster cache and the store.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityKey),

    /// A mutation would break a group invariant.
    #[error("invariant violated on {key}: {violation}")]
    InvariantViolation {
        /// Group the mutation targeted.
        key: EntityKey,
        /// What was rejected.
        violation: Violation,
    },

    /// The cluster lock was not acquired in time.
    #[error("lock on {key} not acquired within {timeout_ms} ms")]
    LockTimeout {
        /// Rendered cache key.
        key: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// The durable store rejected a read or write.
    #[error("store failure: {0}")]
    StoreFailure(#[from] StoreError),

    /// A snapshot or bus frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Group invariants a mutation can violate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Removing the owner from the member set.
    #[error("owner {0} cannot be removed")]
    OwnerRemoval(u64),

    /// Mutating a dismissed group.
    #[error("group is dismissed")]
    Dismissed,

    /// The contact is not a member.
    #[error("{0} is not a member")]
    NotMember(u64),

    /// Ownership handed to a non-member.
    #[error("new owner {0} is not a member")]
    OwnerNotMember(u64),
}

impl PresenceError {
    pub(crate) fn violation(key: &EntityKey, violation: Violation) -> Self {
        Self::InvariantViolation {
            key: key.clone(),
            violation,
        }
    }
}
