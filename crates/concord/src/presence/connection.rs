use crate::bus::ContactEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A device's live connection, owned by the transport layer.
pub trait ConnectionHandle: Send + Sync + 'static {
    /// Returns `false` once the connection is gone.
    fn is_valid(&self) -> bool;

    /// Pushes an event to the device. Returns `false` if it was not sent.
    fn send(&self, event: &ContactEvent) -> bool;
}

/// [`ConnectionHandle`] backed by an unbounded channel.
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ContactEvent>,
    closed: AtomicBool,
}

impl ChannelHandle {
    /// Creates a handle and the receiver its events arrive on.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ContactEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        });
        (handle, rx)
    }

    /// Marks the connection as gone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl ConnectionHandle for ChannelHandle {
    fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&self, event: &ContactEvent) -> bool {
        self.is_valid() && self.tx.send(event.clone()).is_ok()
    }
}
