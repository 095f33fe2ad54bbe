use super::PersistentStore;
use crate::entity::{Appendix, Contact, Device, Group, GroupMember};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum WriteOp {
    Contact(Contact, Option<Device>),
    Group(Group),
    AddMembers(Group, Vec<GroupMember>, u64),
    RemoveMembers(Group, Vec<u64>, u64),
    Appendix(Appendix),
    Flush(oneshot::Sender<()>),
}

/// Write-behind queue in front of a [`PersistentStore`].
///
/// Writes are applied in submission order by a single task. Failures are
/// logged and counted, never returned: the next write of the same entity
/// carries its full state and repairs the row.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    failures: Arc<AtomicU64>,
}

impl StoreWriter {
    /// Spawns the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn PersistentStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU64::new(0));
        tokio::spawn(run(store, rx, Arc::clone(&failures)));
        Self { tx, failures }
    }

    /// Queues a contact upsert.
    pub fn contact(&self, contact: &Contact, device: Option<&Device>) {
        self.submit(WriteOp::Contact(contact.detached(), device.map(Device::detached)));
    }

    /// Queues a group upsert.
    pub fn group(&self, group: &Group) {
        self.submit(WriteOp::Group(group.clone()));
    }

    /// Queues membership additions; `group` is the state after them.
    pub fn add_members(&self, group: &Group, members: Vec<GroupMember>, operator: u64) {
        self.submit(WriteOp::AddMembers(group.clone(), members, operator));
    }

    /// Queues membership removals; `group` is the state after them.
    pub fn remove_members(&self, group: &Group, ids: Vec<u64>, operator: u64) {
        self.submit(WriteOp::RemoveMembers(group.clone(), ids, operator));
    }

    /// Queues an appendix upsert.
    pub fn appendix(&self, appendix: &Appendix) {
        self.submit(WriteOp::Appendix(appendix.clone()));
    }

    /// Waits until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Number of writes that failed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn submit(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Store writer stopped; write dropped");
        }
    }
}

async fn run(store: Arc<dyn PersistentStore>, mut rx: mpsc::UnboundedReceiver<WriteOp>, failures: Arc<AtomicU64>) {
    while let Some(op) = rx.recv().await {
        let (entity, result) = match op {
            WriteOp::Contact(contact, device) => {
                let result = store.write_contact(&contact, device.as_ref()).await;
                (contact.key, result)
            }
            WriteOp::Group(group) => {
                let result = store.write_group(&group).await;
                (group.key, result)
            }
            WriteOp::AddMembers(group, members, operator) => {
                let result = store.add_members(&group, &members, operator).await;
                (group.key, result)
            }
            WriteOp::RemoveMembers(group, ids, operator) => {
                let result = store.remove_members(&group, &ids, operator).await;
                (group.key, result)
            }
            WriteOp::Appendix(appendix) => {
                let result = store.write_appendix(&appendix).await;
                (appendix.owner.key().clone(), result)
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if let Err(e) = result {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(entity = %entity, error = %e, "Store write failed");
        }
    }
    tracing::debug!("Store writer stopped");
}
