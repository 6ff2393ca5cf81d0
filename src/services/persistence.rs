//! Persistence gateway — debounced bucket saves and verified deletes.
//!
//! DESIGN
//! ======
//! Only the authority persists. A store listener marks the bucket (object
//! type) of every created or updated object dirty; the gateway turns those
//! marks into one `save_bucket` per dirty bucket after a quiet period.
//! Deletes bypass the debounce and go out immediately as per-key removals.
//!
//! The gateway itself is synchronous state owned by the participant worker.
//! The worker asks it what to do, runs the I/O in a spawned task, and
//! reports completion back on the same worker, so no two mutations of this
//! state ever interleave.
//!
//! Guards:
//! - loading: marks are ignored while the board is bulk-loaded.
//! - deleting: no save starts while a delete is queued or in flight, so a
//!   save built from a snapshot taken before the delete cannot land after it.
//! - writing: a delete requested while a bucket save or an out-of-cycle
//!   object write is in flight is queued until every write has landed,
//!   because that write may still carry the object.
//! - saving: one save at a time; marks arriving meanwhile wait for the next
//!   round.
//!
//! ERROR HANDLING
//! ==============
//! Writes retry with linear back-off. Dirty marks are cleared only after a
//! successful save; a failed save re-marks its buckets and flips the health
//! channel to failing. In-memory state is never rolled back. A delete is
//! followed by a read to verify the key is gone, since a save racing the
//! delete can put it back; the pair is retried a bounded number of times.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::board::object::{CanvasObject, ObjectId};
use crate::board::store::StoreEvent;
use crate::config::PersistConfig;
use crate::db::{DurableStore, StorageError};

// =============================================================================
// HEALTH
// =============================================================================

/// Whether durable writes are currently succeeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceHealth {
    Healthy,
    /// Changes are not being saved. Carries the last error.
    Failing(String),
}

// =============================================================================
// DIRTY TRACKER
// =============================================================================

#[derive(Debug, Default)]
struct DirtyState {
    buckets: BTreeSet<String>,
    generation: u64,
    suspended: bool,
}

/// Dirty bucket set shared between the store listener and the gateway.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    inner: Arc<Mutex<DirtyState>>,
}

impl DirtyTracker {
    fn state(&self) -> MutexGuard<'_, DirtyState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a bucket dirty. Ignored while loading.
    pub fn mark(&self, bucket: &str) {
        let mut state = self.state();
        if state.suspended {
            return;
        }
        state.buckets.insert(bucket.to_owned());
        state.generation += 1;
    }

    /// Feed a store event.
    pub fn observe(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Created { object, .. } | StoreEvent::Updated { object, .. } => self.mark(&object.kind),
            StoreEvent::Deleted { .. } | StoreEvent::Reordered { .. } => {}
        }
    }

    fn generation(&self) -> u64 {
        self.state().generation
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.state().buckets).into_iter().collect()
    }

    fn set_suspended(&self, suspended: bool) {
        self.state().suspended = suspended;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.state().buckets.is_empty()
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

pub struct PersistenceGateway {
    dirty: DirtyTracker,
    debounce: Duration,
    deadline: Option<Instant>,
    seen_generation: u64,
    saving: bool,
    writes: usize,
    queued_deletes: Vec<(String, ObjectId)>,
    deleting: HashSet<ObjectId>,
    health: watch::Sender<PersistenceHealth>,
}

impl PersistenceGateway {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        let (health, _) = watch::channel(PersistenceHealth::Healthy);
        Self {
            dirty: DirtyTracker::default(),
            debounce,
            deadline: None,
            seen_generation: 0,
            saving: false,
            writes: 0,
            queued_deletes: Vec::new(),
            deleting: HashSet::new(),
            health,
        }
    }

    /// Handle for the store listener.
    #[must_use]
    pub fn tracker(&self) -> DirtyTracker {
        self.dirty.clone()
    }

    #[must_use]
    pub fn subscribe_health(&self) -> watch::Receiver<PersistenceHealth> {
        self.health.subscribe()
    }

    #[must_use]
    pub fn health(&self) -> PersistenceHealth {
        self.health.borrow().clone()
    }

    pub fn begin_loading(&self) {
        self.dirty.set_suspended(true);
    }

    pub fn end_loading(&self) {
        self.dirty.set_suspended(false);
    }

    /// A delete is queued or in flight.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        !self.deleting.is_empty() || !self.queued_deletes.is_empty()
    }

    /// A bucket save or an out-of-cycle write is in flight.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.saving || self.writes > 0
    }

    /// Nothing is queued or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_writing() && !self.is_deleting()
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// When the next save is due, if one is pending.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Restart the quiet period if anything was marked since the last look.
    pub fn poll_changes(&mut self, now: Instant) {
        let generation = self.dirty.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.deadline = Some(now + self.debounce);
        }
    }

    /// Buckets to save now, or `None` if the save must wait. A save blocked
    /// by an in-flight delete or save is pushed back by one quiet period.
    pub fn take_save(&mut self, now: Instant) -> Option<Vec<String>> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        if self.saving || self.is_deleting() {
            self.deadline = Some(now + self.debounce);
            return None;
        }
        self.deadline = None;
        let buckets = self.dirty.take();
        if buckets.is_empty() {
            return None;
        }
        self.saving = true;
        Some(buckets)
    }

    /// Buckets to save immediately, ignoring the quiet period but not the
    /// guards.
    pub fn take_save_now(&mut self) -> Option<Vec<String>> {
        if self.saving || self.is_deleting() || !self.dirty.is_dirty() {
            return None;
        }
        self.deadline = None;
        self.saving = true;
        Some(self.dirty.take())
    }

    pub fn save_finished(&mut self, buckets: &[String], result: Result<(), StorageError>) {
        self.saving = false;
        match result {
            Ok(()) => self.set_health(PersistenceHealth::Healthy),
            Err(e) => {
                error!(error = %e, ?buckets, "save failed after retries; keeping buckets dirty");
                for bucket in buckets {
                    self.dirty.mark(bucket);
                }
                self.set_health(PersistenceHealth::Failing(e.to_string()));
            }
        }
    }

    /// Register a delete. Returns `true` if it may start now; otherwise it
    /// waits in the queue until in-flight writes land (see
    /// [`PersistenceGateway::take_ready_deletes`]).
    pub fn request_delete(&mut self, bucket: &str, id: ObjectId) -> bool {
        if self.is_writing() {
            debug!(%id, bucket, "delete queued behind in-flight write");
            self.queued_deletes.push((bucket.to_owned(), id));
            return false;
        }
        self.deleting.insert(id);
        true
    }

    /// Queued deletes that may start now. Empty while any write is still
    /// in flight.
    pub fn take_ready_deletes(&mut self) -> Vec<(String, ObjectId)> {
        if self.is_writing() {
            return Vec::new();
        }
        let ready = std::mem::take(&mut self.queued_deletes);
        self.deleting.extend(ready.iter().map(|(_, id)| *id));
        ready
    }

    pub fn delete_finished(&mut self, id: ObjectId, result: Result<(), StorageError>) {
        self.deleting.remove(&id);
        match result {
            Ok(()) => self.set_health(PersistenceHealth::Healthy),
            Err(e) => {
                error!(%id, error = %e, "delete failed after retries");
                self.set_health(PersistenceHealth::Failing(e.to_string()));
            }
        }
    }

    /// Start a write outside the save cycle.
    pub fn begin_write(&mut self) {
        self.writes += 1;
    }

    /// Record the outcome of a write made outside the save cycle. The write
    /// carried a snapshot that may already be older than a concurrent bucket
    /// save, so the bucket is marked dirty either way.
    pub fn write_finished(&mut self, bucket: &str, result: Result<(), StorageError>) {
        self.writes = self.writes.saturating_sub(1);
        self.dirty.mark(bucket);
        match result {
            Ok(()) => self.set_health(PersistenceHealth::Healthy),
            Err(e) => {
                error!(bucket, error = %e, "object write failed after retries");
                self.set_health(PersistenceHealth::Failing(e.to_string()));
            }
        }
    }

    fn set_health(&self, next: PersistenceHealth) {
        self.health.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match &next {
                PersistenceHealth::Healthy => info!("persistence recovered"),
                PersistenceHealth::Failing(reason) => warn!(%reason, "persistence failing"),
            }
            *current = next.clone();
            true
        });
    }
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("deadline", &self.deadline)
            .field("saving", &self.saving)
            .field("writes", &self.writes)
            .field("queued_deletes", &self.queued_deletes.len())
            .field("deleting", &self.deleting.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// DURABLE I/O
// =============================================================================

fn backoff(config: &PersistConfig, attempt: usize) -> Duration {
    config.retry_base * u32::try_from(attempt).unwrap_or(u32::MAX)
}

/// Save each bucket, retrying the whole set on failure.
///
/// # Errors
///
/// Returns the last error once retries are exhausted.
pub async fn save_all_with_retry(
    durable: &dyn DurableStore,
    batches: &[(String, Vec<CanvasObject>)],
    config: &PersistConfig,
) -> Result<(), StorageError> {
    let mut attempt = 1;
    loop {
        match save_batches(durable, batches).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.retries => {
                warn!(error = %e, attempt, total = config.retries, buckets = batches.len(), "save failed; retrying");
                tokio::time::sleep(backoff(config, attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn save_batches(durable: &dyn DurableStore, batches: &[(String, Vec<CanvasObject>)]) -> Result<(), StorageError> {
    for (bucket, objects) in batches {
        durable.save_bucket(bucket, objects).await?;
    }
    Ok(())
}

/// Save one object outside the debounce cycle.
///
/// # Errors
///
/// Returns the last error once retries are exhausted.
pub async fn save_object_with_retry(
    durable: &dyn DurableStore,
    object: &CanvasObject,
    config: &PersistConfig,
) -> Result<(), StorageError> {
    let batch = [(object.kind.clone(), vec![object.clone()])];
    save_all_with_retry(durable, &batch, config).await
}

async fn delete_with_retry(
    durable: &dyn DurableStore,
    bucket: &str,
    id: ObjectId,
    config: &PersistConfig,
) -> Result<(), StorageError> {
    let mut attempt = 1;
    loop {
        match durable.delete_key(bucket, id).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.retries => {
                warn!(%id, error = %e, attempt, total = config.retries, "delete failed; retrying");
                tokio::time::sleep(backoff(config, attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Delete one key and confirm it is gone, repeating the pair when a
/// concurrent write put it back.
///
/// # Errors
///
/// Returns [`StorageError::StillPresent`] when the key survives every
/// verification round, or the underlying error when deletes keep failing.
pub async fn delete_verified(
    durable: &dyn DurableStore,
    bucket: &str,
    id: ObjectId,
    config: &PersistConfig,
) -> Result<(), StorageError> {
    for round in 1..=config.delete_verify_attempts {
        delete_with_retry(durable, bucket, id, config).await?;
        if !durable.contains_key(bucket, id).await? {
            return Ok(());
        }
        warn!(%id, bucket, round, "object still present after delete; retrying");
        tokio::time::sleep(backoff(config, round)).await;
    }
    Err(StorageError::StillPresent { bucket: bucket.to_owned(), id })
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
