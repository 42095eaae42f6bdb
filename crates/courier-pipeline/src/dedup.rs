use std::sync::Arc;
use std::time::Duration;

use courier_core::types::InboundEvent;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time-bounded memory of recently seen events.
///
/// The platform delivers events at least once; this store turns redeliveries
/// inside the TTL into no-ops. Entries expire lazily on lookup and are
/// purged in bulk by [`sweep`](Self::sweep).
pub struct DedupStore {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Dedup key: event id, then v1 uuid, then message id.
    pub fn key_for(event: &InboundEvent) -> Option<String> {
        if let Some(id) = &event.primary_id {
            return Some(format!("event_{id}"));
        }
        if let Some(uuid) = &event.secondary_id {
            return Some(format!("uuid_{uuid}"));
        }
        event.message_id.as_ref().map(|id| format!("msg_{id}"))
    }

    /// Whether `event` was already seen inside the TTL. Records it if not.
    ///
    /// Events without any usable id are never treated as duplicates.
    pub fn seen(&self, event: &InboundEvent) -> bool {
        match Self::key_for(event) {
            Some(key) => self.seen_key(&key),
            None => {
                warn!(chat = %event.conversation_id, "event has no id, skipping dedup");
                false
            }
        }
    }

    /// Atomic check-and-record for a raw key.
    pub fn seen_key(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    debug!(key, "duplicate event");
                    true
                } else {
                    entry.insert(now + self.ttl);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.ttl);
                false
            }
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "dedup sweep");
                        }
                    }
                }
            }
        })
    }
}
