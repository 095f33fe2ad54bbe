//! Cluster event bus over per-contact topics.
//!
//! # Architecture
//!
//! Each contact has one [`Topic`]. A node subscribes to the topic of every
//! contact it terminates a session for; group operations publish a
//! [`ContactEvent`] to each member's topic and the bus fans it out to every
//! subscribed node as an [`Envelope`]. The receiving directory resolves the
//! topic to a locally connected contact and pushes the event to its devices.
//!
//! Delivery is at-most-once: nothing is queued for nodes that are not
//! subscribed at publish time, and transport failures are dropped silently.

mod memory;

pub use memory::{Inbox, MemoryHub, NodeBus, NodeId};

use crate::core::{decode, encode, CodecError, Topic};
use crate::entity::{Appendix, Contact, GroupBundle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of the events pushed to contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    /// The contact was added to a new group.
    CreateGroup,
    /// A group the contact belongs to was dismissed.
    DissolveGroup,
    /// Members joined a group.
    AddGroupMember,
    /// Members left a group.
    RemoveGroupMember,
    /// Group fields changed.
    ModifyGroup,
    /// A member's per-group context changed.
    ModifyGroupMember,
    /// A group appendix was rewritten.
    GroupAppendixUpdated,
    /// One of the contact's devices lost its connection.
    Disconnect,
}

impl EventName {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateGroup => "CreateGroup",
            Self::DissolveGroup => "DissolveGroup",
            Self::AddGroupMember => "AddGroupMember",
            Self::RemoveGroupMember => "RemoveGroupMember",
            Self::ModifyGroup => "ModifyGroup",
            Self::ModifyGroupMember => "ModifyGroupMember",
            Self::GroupAppendixUpdated => "GroupAppendixUpdated",
            Self::Disconnect => "Disconnect",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// Outcome of a group operation.
    Group(GroupBundle),
    /// A group appendix.
    Appendix(Appendix),
    /// A contact profile, without device handles.
    Contact(Contact),
}

/// A named event addressed to one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEvent {
    /// Event name.
    pub name: EventName,
    /// Event body.
    pub payload: EventPayload,
}

impl ContactEvent {
    /// Event carrying a group bundle.
    pub fn group(name: EventName, bundle: GroupBundle) -> Self {
        Self {
            name,
            payload: EventPayload::Group(bundle),
        }
    }

    /// Returns the bundle, if this is a group event.
    pub fn bundle(&self) -> Option<&GroupBundle> {
        match &self.payload {
            EventPayload::Group(bundle) => Some(bundle),
            _ => None,
        }
    }
}

/// An event in transit, as handed to subscribed nodes.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Wire form of the destination topic.
    pub topic: String,
    /// Postcard-encoded [`ContactEvent`].
    pub frame: Vec<u8>,
}

impl Envelope {
    /// Encodes an event for `topic`.
    pub fn seal(topic: &Topic, event: &ContactEvent) -> Result<Self, CodecError> {
        Ok(Self {
            topic: topic.to_wire(),
            frame: encode(event)?,
        })
    }

    /// Decodes the topic and event.
    pub fn open(&self) -> Result<(Topic, ContactEvent), CodecError> {
        let topic = Topic::from_wire(&self.topic)
            .ok_or_else(|| CodecError::from(format!("malformed topic {:?}", self.topic)))?;
        Ok((topic, decode(&self.frame)?))
    }
}

/// Transport seam for the event bus. All methods are best-effort.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Starts receiving events published to `topic` on this node.
    async fn subscribe(&self, topic: &Topic);

    /// Stops receiving events for `topic`.
    async fn unsubscribe(&self, topic: &Topic);

    /// Publishes `event` to every node subscribed to `topic`.
    async fn publish(&self, topic: &Topic, event: &ContactEvent);
}
