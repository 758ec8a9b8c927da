//! # Callback Registry
//!
//! Local functions exported to the remote side of one connection, by id.
//!
//! A function keeps one id for as long as it is registered, however many
//! times it is sent. Entries stay invokable until they are released or the
//! connection is torn down; the remote side may call the same reference any
//! number of times.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use duorpc::Function;

/// Result of exporting a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Export {
    pub id: u64,
    /// False when the function was already registered under `id`.
    pub fresh: bool,
}

pub(crate) struct CallbackRegistry {
    entries: DashMap<u64, Function>,
    ids: DashMap<usize, u64>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            ids: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the function's id, registering it under a fresh one if needed.
    /// Ids are never reused.
    pub(crate) fn register(&self, function: &Function) -> Export {
        match self.ids.entry(function.key()) {
            Entry::Occupied(entry) => Export { id: *entry.get(), fresh: false },
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.entries.insert(id, function.clone());
                entry.insert(id);
                Export { id, fresh: true }
            }
        }
    }

    pub(crate) fn get(&self, id: u64) -> Option<Function> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn id_of(&self, function: &Function) -> Option<u64> {
        self.ids.get(&function.key()).map(|entry| *entry.value())
    }

    pub(crate) fn release(&self, id: u64) -> bool {
        let Some(function) = self.get(id) else {
            return false;
        };
        self.ids.remove_if(&function.key(), |_, registered| *registered == id);
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn clear(&self) {
        self.ids.clear();
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
