//! Pending-work escalation queue
//!
//! Items that every fetch strategy failed on are handed to out-of-band
//! resolvers through the store's `pending_tasks` table. Resolvers claim
//! tasks through the queue and complete them through the [`Storage`] trait.

use crate::storage::{lock_store, NewPendingTask, PendingTask, Storage, StorageResult};
use std::sync::{Arc, Mutex};

/// Upserts pending tasks keyed by `(kind, identifier)`
pub struct PendingQueue<S: Storage> {
    store: Arc<Mutex<S>>,
}

impl<S: Storage> Clone for PendingQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Storage> PendingQueue<S> {
    pub fn new(store: Arc<Mutex<S>>) -> Self {
        Self { store }
    }

    /// Escalates an item, or bumps the task already open for it
    ///
    /// # Arguments
    ///
    /// * `kind` - Task kind, e.g. `detail`
    /// * `identifier` - The item identifier
    /// * `url` - The URL that could not be fetched
    /// * `reason` - Short failure reason, refreshed on every upsert
    /// * `context` - Free-form JSON context for the resolver
    ///
    /// # Returns
    ///
    /// The open task after the upsert, with `attempts` counting how many
    /// times the item has been escalated since it was last resolved
    pub fn upsert(
        &self,
        kind: &str,
        identifier: &str,
        url: &str,
        reason: &str,
        context: serde_json::Value,
    ) -> StorageResult<PendingTask> {
        let task = NewPendingTask {
            kind: kind.to_string(),
            identifier: identifier.to_string(),
            url: url.to_string(),
            reason: reason.to_string(),
            context,
        };

        let upserted = lock_store(&self.store).upsert_pending_task(&task)?;

        tracing::info!(
            action = "escalate",
            task_id = upserted.id,
            kind,
            identifier,
            attempts = upserted.attempts,
            reason,
            "Queued pending task"
        );

        Ok(upserted)
    }

    /// Hands pending tasks to a resolver
    ///
    /// A claimed task is not handed out again until `lease` has passed or
    /// the item is escalated anew.
    pub fn claim(
        &self,
        kind: Option<&str>,
        limit: usize,
        lease: chrono::Duration,
    ) -> StorageResult<Vec<PendingTask>> {
        let claimed = lock_store(&self.store).claim_pending_tasks(kind, limit, lease)?;

        tracing::info!(
            action = "claim",
            kind = kind.unwrap_or("*"),
            claimed = claimed.len(),
            lease_secs = lease.num_seconds(),
            "Claimed pending tasks"
        );

        Ok(claimed)
    }
}
