//! # Pending-Call Table
//!
//! Outbound calls (and callback invocations) waiting for their `Response`.
//!
//! ## Invariants
//! - **Single Delivery**: An entry is removed before its result is delivered, so a
//!   duplicate or late response finds nothing and is reported as stale.
//! - **Closed Means Dropped**: Closing the table drops every sender; waiters observe
//!   the dropped channel as `ConnectionClosed`.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use duorpc::Failure;
use duorpc::Value;
use tokio::sync::oneshot;

/// What the remote side answered.
pub(crate) type Reply = std::result::Result<Value, Failure>;

pub(crate) struct PendingCalls {
    slots: DashMap<u64, oneshot::Sender<Reply>>,
    seq_gen: AtomicU64,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
            seq_gen: AtomicU64::new(1),
        }
    }

    /// Allocates an id without a slot, for calls that expect no response.
    pub(crate) fn next_id(&self) -> u64 {
        self.seq_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates an id and the slot its response will be delivered to.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        (id, rx)
    }

    /// Delivers a response. Returns `false` if no call is waiting on `id`.
    pub(crate) fn resolve(&self, id: u64, reply: Reply) -> bool {
        let Some((_, tx)) = self.slots.remove(&id) else {
            return false;
        };
        // the caller may have given up between the removal and the send
        tx.send(reply).is_ok()
    }

    pub(crate) fn remove(&self, id: u64) {
        self.slots.remove(&id);
    }

    pub(crate) fn close_all(&self) {
        self.slots.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
