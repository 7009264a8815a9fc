use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::rpc::notifier::SessionNotifier;
use crate::store::memory::MemStore;

/// Default per-connection watchdog threshold in seconds.
pub const DEFAULT_WATCHDOG_SECS: i64 = 90;

/// Process-wide state threaded through every subsystem: the node identity,
/// the shared store handle, the session notifier, the root cancellation
/// scope and the two cluster atomics (connection count, master flag).
pub struct NodeContext {
    pub node_id: String,
    pub version: String,
    pub store: Arc<MemStore>,
    pub notifier: SessionNotifier,
    pub root: CancellationToken,
    pub numconn: AtomicI64,
    pub watchdog_secs: i64,
    master: AtomicBool,
}

impl NodeContext {
    pub fn new(node_id: String, store: Arc<MemStore>, watchdog_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
            notifier: SessionNotifier::new(),
            root: CancellationToken::new(),
            numconn: AtomicI64::new(0),
            watchdog_secs,
            master: AtomicBool::new(false),
        })
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }
}
