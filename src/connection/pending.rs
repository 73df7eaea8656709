use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Late replies for this many abandoned requests are dropped quietly.
const ABANDONED_CAPACITY: usize = 256;

/// How a pending request was resolved by the receive path.
#[derive(Debug)]
pub(crate) enum Reply {
    Response(Option<Value>),
    Fault(String),
    Violation(String),
    ConnectionFault(String),
}

pub(crate) struct PendingRequest {
    pub(crate) method: String,
    pub(crate) reply: oneshot::Sender<Reply>,
    progress: Arc<Notify>,
}

pub(crate) struct Waiter {
    pub(crate) correlation_id: String,
    pub(crate) reply: oneshot::Receiver<Reply>,
    pub(crate) progress: Arc<Notify>,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<String, PendingRequest>,
    abandoned: Mutex<VecDeque<String>>,
}

impl PendingTable {
    /// Register a waiter under a correlation id no pending request holds.
    pub(crate) fn insert(&self, method: &str) -> Waiter {
        loop {
            let correlation_id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.entries.entry(correlation_id.clone()) {
                let (tx, rx) = oneshot::channel();
                let progress = Arc::new(Notify::new());
                slot.insert(PendingRequest {
                    method: method.to_string(),
                    reply: tx,
                    progress: Arc::clone(&progress),
                });
                return Waiter {
                    correlation_id,
                    reply: rx,
                    progress,
                };
            }
        }
    }

    pub(crate) fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries.remove(correlation_id).map(|(_, pending)| pending)
    }

    /// Drop a waiter the caller gave up on. Returns whether it was still
    /// pending.
    pub(crate) fn abandon(&self, correlation_id: &str) -> bool {
        if self.entries.remove(correlation_id).is_none() {
            return false;
        }

        if let Ok(mut ring) = self.abandoned.lock() {
            if ring.len() == ABANDONED_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(correlation_id.to_string());
        }
        true
    }

    /// Whether `correlation_id` belongs to a recently abandoned request.
    /// Each id is forgiven once.
    pub(crate) fn was_abandoned(&self, correlation_id: &str) -> bool {
        match self.abandoned.lock() {
            Ok(mut ring) => match ring.iter().position(|id| id == correlation_id) {
                Some(index) => {
                    ring.remove(index);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Extend the deadline of a pending request.
    pub(crate) fn progress(&self, correlation_id: &str) -> bool {
        match self.entries.get(correlation_id) {
            Some(pending) => {
                pending.progress.notify_one();
                true
            }
            None => false,
        }
    }

    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.into_iter().filter_map(|id| self.take(&id)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Removes its waiter when the caller stops waiting for any reason,
/// including the caller's future being dropped.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    correlation_id: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, correlation_id: String) -> Self {
        Self {
            table,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.abandon(&self.correlation_id);
    }
}
