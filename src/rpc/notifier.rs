use anyhow::{anyhow, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::tasks::types::TaskRow;

/// Completion-channel capacity per connection.
pub const NOTIFY_BUFFER: usize = 1024;

/// Process-wide registry mapping a connection id to the channel its
/// completion demultiplexer drains. Registering an id twice fails, which is
/// how duplicate session ids are detected. Notification is non-blocking:
/// when a channel is full the completion is dropped, the task row stays in
/// the store and can still be recovered by reconnecting and re-querying.
pub struct SessionNotifier {
    channels: DashMap<String, mpsc::Sender<TaskRow>>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn register(&self, conn_id: &str) -> Result<mpsc::Receiver<TaskRow>> {
        match self.channels.entry(conn_id.to_string()) {
            Entry::Occupied(_) => Err(anyhow!("session id {} already registered", conn_id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn unregister(&self, conn_id: &str) {
        self.channels.remove(conn_id);
    }

    /// Pushes a completed task toward the connection that originated it.
    /// Returns false when no such session is registered here or its channel
    /// overflowed.
    pub fn notify(&self, conn_id: &str, task: TaskRow) -> bool {
        match self.channels.get(conn_id) {
            Some(tx) => match tx.try_send(task) {
                Ok(()) => true,
                Err(_) => {
                    tracing::warn!("completion channel for {} overflowed, dropping", conn_id);
                    false
                }
            },
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for SessionNotifier {
    fn default() -> Self {
        Self::new()
    }
}
