//! Deferred deletion of blocked identities' counters.
//!
//! Store-native expiry already reclaims every counter; this only removes the
//! key explicitly once a block elapses. A lost or cancelled cleanup never
//! affects correctness, and a cleanup that fires late never touches a counter
//! that has started a new window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::store::CounterStore;

/// Schedules fire-and-forget counter deletions.
///
/// Each scheduled deletion runs on its own task; the caller never waits for
/// it. At most one deletion is pending per key, and it only removes a counter
/// that is still over its limit.
pub struct CleanupScheduler<S: CounterStore + 'static> {
    store: Arc<S>,
    pending: Arc<DashMap<String, (u64, AbortHandle)>>,
    next_id: AtomicU64,
}

impl<S: CounterStore + 'static> CleanupScheduler<S> {
    /// Create a scheduler deleting keys from `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Delete `key` after `delay` if its count is still above `limit` then.
    ///
    /// A counter that restarted in a fresh window by the time the deletion
    /// runs is left alone. Scheduling a key that already has a deletion
    /// pending replaces it, since a new block episode outlives the old one.
    /// Returns `true` if a pending deletion was replaced. Must be called from
    /// within a Tokio runtime.
    pub fn schedule(&self, key: &str, limit: u64, delay: Duration) -> bool {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let pending = self.pending.clone();
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            match store.delete_if_exceeded(&owned_key, limit).await {
                Ok(true) => debug!(key = %owned_key, "Cleanup removed counter"),
                Ok(false) => debug!(key = %owned_key, "Counter expired or restarted before cleanup"),
                Err(e) => warn!(key = %owned_key, error = %e, "Cleanup failed to remove counter"),
            }

            pending.remove_if(&owned_key, |_, (pending_id, _)| *pending_id == id);
        });
        let handle = task.abort_handle();

        let replaced = match self.pending.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let (_, previous) = slot.insert((id, handle));
                previous.abort();
                true
            }
            Entry::Vacant(slot) => {
                slot.insert((id, handle));
                false
            }
        };

        debug!(
            key = %key,
            delay_secs = delay.as_secs(),
            replaced = replaced,
            "Scheduled counter cleanup"
        );
        replaced
    }

    /// Cancel a pending deletion. Returns `false` if none was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of deletions not yet run.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending deletion.
    pub fn shutdown(&self) {
        let cancelled = self.pending.len();
        self.pending.retain(|_, (_, handle)| {
            handle.abort();
            false
        });
        info!(cancelled = cancelled, "Cleanup scheduler stopped");
    }
}

impl<S: CounterStore + 'static> std::fmt::Debug for CleanupScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("pending", &self.pending.len())
            .finish()
    }
}
