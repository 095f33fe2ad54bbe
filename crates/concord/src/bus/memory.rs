use super::{ContactEvent, Envelope, EventBus};
use crate::core::Topic;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Name of a node attached to a [`MemoryHub`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Creates a node id.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Receiving end of a node's bus traffic.
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

#[derive(Default)]
struct HubInner {
    topics: DashMap<String, DashSet<NodeId>>,
    nodes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
}

/// In-process event bus connecting several nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Creates a hub with no nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node, returning its bus handle and inbox. Re-attaching a
    /// node replaces its inbox.
    pub fn attach(&self, node: impl Into<NodeId>) -> (NodeBus, Inbox) {
        let node = node.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.nodes.insert(node.clone(), tx);
        let bus = NodeBus {
            node,
            hub: Arc::clone(&self.inner),
        };
        (bus, rx)
    }

    /// Detaches a node and drops its subscriptions. Events published while
    /// it is away are lost.
    pub fn detach(&self, node: &NodeId) {
        self.inner.nodes.remove(node);
        for topic in self.inner.topics.iter() {
            topic.value().remove(node);
        }
        self.inner.topics.retain(|_, nodes| !nodes.is_empty());
    }

    /// Nodes currently subscribed to `topic`.
    pub fn subscribers(&self, topic: &Topic) -> Vec<NodeId> {
        self.inner
            .topics
            .get(&topic.to_wire())
            .map(|nodes| nodes.iter().map(|n| n.key().clone()).collect())
            .unwrap_or_default()
    }
}

/// One node's view of a [`MemoryHub`].
#[derive(Clone)]
pub struct NodeBus {
    node: NodeId,
    hub: Arc<HubInner>,
}

impl NodeBus {
    /// The node this handle publishes and subscribes as.
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

#[async_trait]
impl EventBus for NodeBus {
    async fn subscribe(&self, topic: &Topic) {
        self.hub
            .topics
            .entry(topic.to_wire())
            .or_default()
            .insert(self.node.clone());
    }

    async fn unsubscribe(&self, topic: &Topic) {
        let wire = topic.to_wire();
        if let Some(nodes) = self.hub.topics.get(&wire) {
            nodes.remove(&self.node);
        }
        self.hub.topics.remove_if(&wire, |_, nodes| nodes.is_empty());
    }

    async fn publish(&self, topic: &Topic, event: &ContactEvent) {
        let envelope = match Envelope::seal(topic, event) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Failed to encode event");
                return;
            }
        };

        let targets: Vec<NodeId> = match self.hub.topics.get(&envelope.topic) {
            Some(nodes) => nodes.iter().map(|n| n.key().clone()).collect(),
            None => return,
        };

        for node in targets {
            let delivered = self
                .hub
                .nodes
                .get(&node)
                .is_some_and(|tx| tx.send(envelope.clone()).is_ok());
            if !delivered {
                tracing::trace!(topic = %topic, node = %node, event = %event.name, "Event not delivered");
            }
        }
    }
}
