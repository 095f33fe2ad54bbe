use crate::core::{Document, EntityKey};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupState {
    /// Accepts membership changes.
    #[default]
    Normal,
    /// Retired; read-only from then on.
    Dismissed,
}

/// One membership of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Member contact id, in the group's tenant.
    pub id: u64,
    /// When the member joined.
    pub joined_at: u64,
    /// Per-group context for this member (nickname, role, ...).
    pub context: Option<Document>,
}

impl GroupMember {
    /// Creates a membership without context.
    pub fn new(id: u64, joined_at: u64) -> Self {
        Self {
            id,
            joined_at,
            context: None,
        }
    }
}

/// A group and its member set.
///
/// The owner is always a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Identity.
    pub key: EntityKey,
    /// Display name.
    pub name: String,
    /// Routing tag, opaque to this crate.
    pub tag: String,
    /// Owner contact id.
    pub owner: u64,
    /// Creation time.
    pub creation: u64,
    /// Last time anything happened in the group.
    pub last_active: u64,
    /// Lifecycle state.
    pub state: GroupState,
    /// Members, in join order.
    pub members: Vec<GroupMember>,
    /// Optional context document.
    pub context: Option<Document>,
    /// Bumped on every committed change. Store writes carrying an older
    /// revision than the stored row are ignored.
    pub revision: u64,
}

impl Group {
    /// Returns `true` if `id` is a member.
    pub fn is_member(&self, id: u64) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Looks up a membership.
    pub fn member(&self, id: u64) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Mutable lookup of a membership.
    pub fn member_mut(&mut self, id: u64) -> Option<&mut GroupMember> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    /// Member ids in join order.
    pub fn member_ids(&self) -> Vec<u64> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Returns `true` once the group has been dismissed.
    pub fn is_dismissed(&self) -> bool {
        self.state == GroupState::Dismissed
    }
}

/// Request to create a group.
#[derive(Debug, Clone)]
pub struct NewGroup {
    /// Tenant the group lives in.
    pub tenant: crate::core::TenantId,
    /// Display name.
    pub name: String,
    /// Routing tag.
    pub tag: String,
    /// Owner contact id; always added as the first member.
    pub owner: u64,
    /// Initial members besides the owner.
    pub members: Vec<u64>,
    /// Optional context.
    pub context: Option<Document>,
}

impl NewGroup {
    /// Creates a request for a group owned by `owner`.
    pub fn new(tenant: impl Into<crate::core::TenantId>, name: impl Into<String>, owner: u64) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            tag: String::from("public"),
            owner,
            members: Vec::new(),
            context: None,
        }
    }

    /// Sets the initial members.
    pub fn members(mut self, members: impl IntoIterator<Item = u64>) -> Self {
        self.members = members.into_iter().collect();
        self
    }

    /// Sets the routing tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the context document.
    pub fn context(mut self, context: Document) -> Self {
        self.context = Some(context);
        self
    }
}

/// Field changes for a group. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    /// New display name.
    pub name: Option<String>,
    /// New routing tag.
    pub tag: Option<String>,
    /// New owner; must already be a member.
    pub owner: Option<u64>,
    /// Replacement context.
    pub context: Option<Document>,
}

impl GroupChanges {
    /// Empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renames the group.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Changes the routing tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Transfers ownership.
    pub fn owner(mut self, owner: u64) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Replaces the context.
    pub fn context(mut self, context: Document) -> Self {
        self.context = Some(context);
        self
    }
}

/// Result of a group mutation, as carried by group events. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBundle {
    /// The group after the mutation.
    pub group: Group,
    /// Members added, removed or modified; empty when nothing changed.
    pub members: Vec<u64>,
    /// Contact id that performed the mutation.
    pub operator: u64,
}

impl GroupBundle {
    /// Returns `true` if the mutation changed no membership.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
