//! Participant — one board replica and the worker that drives it.
//!
//! DESIGN
//! ======
//! Every mutation of a replica happens on a single spawned worker task. The
//! worker owns the [`ReplicationChannel`] and, on the authority, the
//! [`PersistenceGateway`]; nothing else holds a reference to either. Three
//! sources feed the worker:
//!
//! - jobs: closures posted by [`ParticipantHandle`] for local intents and
//!   queries;
//! - durable I/O: tasks in the worker's own `JoinSet`, each finishing with
//!   a completion closure;
//! - the relay link: inbound frames, decoded and handed to the channel;
//! - the save timer: the gateway's debounce deadline.
//!
//! Effects the channel returns are executed immediately. Broadcasts go out
//! on the link in the order they were produced; durable writes run as I/O
//! tasks whose completions run back on the worker, so the gateway's guards
//! are only ever touched from the worker.
//!
//! LIFECYCLE
//! =========
//! Startup reads durable storage under the loading guard, marks the buckets
//! of any objects whose ranks had to be repaired, subscribes the dirty
//! tracker and asks the room for its locks. The worker stops once every
//! handle is dropped. On the way out it waits for in-flight I/O, starts any
//! deletes that were queued behind it, then saves whatever is still dirty.
//! [`ParticipantHandle::shutdown`] waits for all of that to finish.
//!
//! ERROR HANDLING
//! ==============
//! Local intents surface [`ReplicationError`] to the caller. Inbound frames
//! that fail to decode are logged and dropped. A closed relay link leaves
//! the replica running offline.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::board::lock::{Lock, LockState};
use crate::board::object::{CanvasObject, Data, ObjectId, ParticipantId, Position, TypeRegistry};
use crate::board::store::{ReorderTarget, StoreEvent};
use crate::config::PersistConfig;
use crate::db::{DurableStore, StorageError};
use crate::frame::Envelope;
use crate::services::persistence::{
    PersistenceGateway, PersistenceHealth, delete_verified, save_all_with_retry, save_object_with_retry,
};
use crate::services::replication::{Effect, ReplicationChannel, ReplicationError, Role};
use crate::services::transport::Link;

const JOB_QUEUE_CAPACITY: usize = 256;

type Job = Box<dyn FnOnce(&mut Participant) + Send>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    #[error("participant worker stopped")]
    Stopped,
    #[error("the authority needs a durable store")]
    MissingStore,
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error("initial load failed: {0}")]
    Load(#[from] StorageError),
}

/// Everything needed to start a replica.
pub struct ParticipantOptions {
    pub id: ParticipantId,
    pub label: String,
    pub role: Role,
    pub registry: TypeRegistry,
    pub persist: PersistConfig,
    /// Required for the authority. Peers only read it at startup.
    pub durable: Option<Arc<dyn DurableStore>>,
}

impl ParticipantOptions {
    #[must_use]
    pub fn new(role: Role, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            label: label.into(),
            role,
            registry: TypeRegistry::with_builtins(),
            persist: PersistConfig::default(),
            durable: None,
        }
    }

    #[must_use]
    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    #[must_use]
    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }
}

// =============================================================================
// WORKER STATE
// =============================================================================

/// State owned by the worker task.
pub struct Participant {
    channel: ReplicationChannel,
    gateway: Option<PersistenceGateway>,
    durable: Option<Arc<dyn DurableStore>>,
    persist: PersistConfig,
    outbound: mpsc::Sender<frames::Frame>,
    io: JoinSet<Job>,
}

impl Participant {
    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(envelope) => self.send(&envelope),
                Effect::DeleteDurable { bucket, id } => self.spawn_delete(bucket, id),
                Effect::PersistThenBroadcast { object, confirm } => self.spawn_confirm(object, confirm),
            }
        }
    }

    fn send(&self, envelope: &Envelope) {
        match self.outbound.try_send(frames::Frame::from(envelope)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id = %envelope.id, kind = envelope.message.kind().as_str(), "relay link full; dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(id = %envelope.id, "relay link closed; frame not sent");
            }
        }
    }

    fn apply_local<T>(
        &mut self,
        intent: impl FnOnce(&mut ReplicationChannel) -> Result<(T, Vec<Effect>), ReplicationError>,
    ) -> Result<T, ReplicationError> {
        let (value, effects) = intent(&mut self.channel)?;
        self.execute(effects);
        Ok(value)
    }

    fn receive_frame(&mut self, frame: frames::Frame) {
        match Envelope::try_from(frame) {
            Ok(envelope) => {
                let effects = self.channel.receive(envelope);
                self.execute(effects);
            }
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    // =========================================================================
    // DURABLE WRITES
    // =========================================================================

    fn spawn_delete(&mut self, bucket: String, id: ObjectId) {
        if self.durable.is_none() {
            return;
        }
        let Some(gateway) = self.gateway.as_mut() else {
            return;
        };
        if gateway.request_delete(&bucket, id) {
            self.start_delete(bucket, id);
        }
    }

    fn start_delete(&mut self, bucket: String, id: ObjectId) {
        let Some(durable) = self.durable.clone() else {
            return;
        };
        let config = self.persist;
        self.io.spawn(async move {
            let result = delete_verified(durable.as_ref(), &bucket, id, &config).await;
            Box::new(move |p: &mut Participant| {
                if let Some(gateway) = p.gateway.as_mut() {
                    gateway.delete_finished(id, result);
                }
            }) as Job
        });
    }

    /// Start deletes that were waiting for in-flight writes.
    fn start_ready_deletes(&mut self) {
        let ready = self.gateway.as_mut().map(PersistenceGateway::take_ready_deletes).unwrap_or_default();
        for (bucket, id) in ready {
            self.start_delete(bucket, id);
        }
    }

    fn spawn_confirm(&mut self, object: CanvasObject, confirm: Envelope) {
        let Some(durable) = self.durable.clone() else {
            self.send(&confirm);
            return;
        };
        if let Some(gateway) = self.gateway.as_mut() {
            gateway.begin_write();
        }
        let config = self.persist;
        self.io.spawn(async move {
            let result = save_object_with_retry(durable.as_ref(), &object, &config).await;
            Box::new(move |p: &mut Participant| {
                if let Some(gateway) = p.gateway.as_mut() {
                    gateway.write_finished(&object.kind, result);
                }
                p.send(&confirm);
                p.start_ready_deletes();
            }) as Job
        });
    }

    fn save_batches(&self, buckets: &[String]) -> Vec<(String, Vec<CanvasObject>)> {
        let store = self.channel.store();
        buckets
            .iter()
            .map(|bucket| (bucket.clone(), store.objects_of_kind(bucket)))
            .collect()
    }

    fn spawn_save(&mut self, buckets: Vec<String>, done: Option<oneshot::Sender<bool>>) {
        let Some(durable) = self.durable.clone() else {
            return;
        };
        let batches = self.save_batches(&buckets);
        let config = self.persist;
        debug!(?buckets, "saving dirty buckets");
        self.io.spawn(async move {
            let result = save_all_with_retry(durable.as_ref(), &batches, &config).await;
            Box::new(move |p: &mut Participant| {
                let saved = result.is_ok();
                if let Some(gateway) = p.gateway.as_mut() {
                    gateway.save_finished(&buckets, result);
                }
                if let Some(done) = done
                    && done.send(saved).is_err()
                {
                    debug!("flush caller went away");
                }
                p.start_ready_deletes();
            }) as Job
        });
    }

    fn complete(&mut self, done: Result<Job, JoinError>) {
        match done {
            Ok(job) => job(self),
            Err(e) => warn!(error = %e, "durable I/O task failed"),
        }
    }

    /// Refresh the debounce deadline and return it.
    fn poll_persistence(&mut self) -> Option<Instant> {
        let gateway = self.gateway.as_mut()?;
        gateway.poll_changes(Instant::now());
        gateway.deadline()
    }

    fn save_if_due(&mut self) {
        let Some(gateway) = self.gateway.as_mut() else {
            return;
        };
        if let Some(buckets) = gateway.take_save(Instant::now()) {
            self.spawn_save(buckets, None);
        }
    }

    /// Start a save of everything dirty right now. The receiver resolves to
    /// whether the save succeeded; `None` means there was nothing to start.
    fn flush(&mut self) -> Option<oneshot::Receiver<bool>> {
        let buckets = self.gateway.as_mut()?.take_save_now()?;
        let (tx, rx) = oneshot::channel();
        self.spawn_save(buckets, Some(tx));
        Some(rx)
    }

    /// Finish in-flight I/O, then save remaining dirty buckets inline.
    async fn final_flush(&mut self) {
        while let Some(done) = self.io.join_next().await {
            self.complete(done);
        }
        let Some(buckets) = self.gateway.as_mut().and_then(PersistenceGateway::take_save_now) else {
            return;
        };
        let Some(durable) = self.durable.clone() else {
            return;
        };
        let batches = self.save_batches(&buckets);
        let result = save_all_with_retry(durable.as_ref(), &batches, &self.persist).await;
        match &result {
            Ok(()) => info!(?buckets, "final save complete"),
            Err(e) => warn!(?buckets, error = %e, "final save failed; changes lost"),
        }
        if let Some(gateway) = self.gateway.as_mut() {
            gateway.save_finished(&buckets, result);
        }
    }
}

// =============================================================================
// STARTUP
// =============================================================================

/// Load the board, start the worker and return a handle to it.
///
/// # Errors
///
/// Returns [`ParticipantError::MissingStore`] for an authority without a
/// durable store and [`ParticipantError::Load`] if the initial read fails.
pub async fn spawn_participant(link: Link, options: ParticipantOptions) -> Result<ParticipantHandle, ParticipantError> {
    let ParticipantOptions { id, label, role, registry, persist, durable } = options;
    if role == Role::Authority && durable.is_none() {
        return Err(ParticipantError::MissingStore);
    }

    let mut channel = ReplicationChannel::new(id, label, role, registry);
    let gateway = (role == Role::Authority).then(|| PersistenceGateway::new(persist.debounce));

    if let Some(durable) = durable.as_ref() {
        if let Some(gateway) = gateway.as_ref() {
            gateway.begin_loading();
        }
        let loaded = durable.load_all().await;
        if let Some(gateway) = gateway.as_ref() {
            gateway.end_loading();
        }
        let repairs = channel.load(loaded?)?;
        if let Some(gateway) = gateway.as_ref() {
            let tracker = gateway.tracker();
            for repair in &repairs {
                if let Some(object) = channel.store().get(repair.id) {
                    tracker.mark(&object.kind);
                }
            }
        }
    }

    if let Some(gateway) = gateway.as_ref() {
        let tracker = gateway.tracker();
        channel.store_mut().subscribe(move |event| tracker.observe(event));
    }

    let health = gateway.as_ref().map(PersistenceGateway::subscribe_health);
    let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(JOB_QUEUE_CAPACITY);
    let (stopped_tx, stopped) = watch::channel(());
    let Link { outbound, inbound } = link;

    let mut participant = Participant {
        channel,
        gateway,
        durable,
        persist,
        outbound,
        io: JoinSet::new(),
    };
    let hello = participant.channel.request_lock_state();
    participant.execute(hello);

    info!(%id, ?role, objects = participant.channel.store().len(), "participant started");
    tokio::spawn(run(participant, jobs_rx, inbound, stopped_tx));

    Ok(ParticipantHandle { id, role, jobs: jobs_tx, health, stopped })
}

/// The worker loop. `stopped` is dropped once the final save is done.
async fn run(
    mut participant: Participant,
    mut jobs: mpsc::Receiver<Job>,
    mut inbound: mpsc::Receiver<frames::Frame>,
    stopped: watch::Sender<()>,
) {
    let mut link_open = true;
    loop {
        let deadline = participant.poll_persistence();
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job(&mut participant),
                None => break,
            },
            Some(done) = participant.io.join_next(), if !participant.io.is_empty() => {
                participant.complete(done);
            }
            frame = inbound.recv(), if link_open => match frame {
                Some(frame) => participant.receive_frame(frame),
                None => {
                    warn!(id = %participant.channel.self_id(), "relay link closed; continuing offline");
                    link_open = false;
                }
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                participant.save_if_due();
            }
        }
    }
    participant.final_flush().await;
    info!(id = %participant.channel.self_id(), "participant stopped");
    drop(stopped);
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable front door to a running participant.
#[derive(Clone)]
pub struct ParticipantHandle {
    id: ParticipantId,
    role: Role,
    jobs: mpsc::Sender<Job>,
    health: Option<watch::Receiver<PersistenceHealth>>,
    stopped: watch::Receiver<()>,
}

impl ParticipantHandle {
    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Persistence status, for the authority only.
    #[must_use]
    pub fn persistence_status(&self) -> Option<watch::Receiver<PersistenceHealth>> {
        self.health.clone()
    }

    async fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Participant) -> R + Send + 'static,
    ) -> Result<R, ParticipantError> {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |p: &mut Participant| {
            if tx.send(f(p)).is_err() {
                debug!("caller went away before reply");
            }
        });
        self.jobs.send(job).await.map_err(|_| ParticipantError::Stopped)?;
        rx.await.map_err(|_| ParticipantError::Stopped)
    }

    /// Create an object on top of the stack.
    ///
    /// # Errors
    ///
    /// Fails for unknown or invalid object types.
    pub async fn create(
        &self,
        kind: impl Into<String>,
        position: Position,
        attributes: Data,
    ) -> Result<ObjectId, ParticipantError> {
        let kind = kind.into();
        Ok(self
            .call(move |p| p.apply_local(|c| c.create(&kind, position, attributes)))
            .await??)
    }

    /// # Errors
    ///
    /// Fails when another participant holds the object's lock or the id is
    /// unknown.
    pub async fn update(&self, id: ObjectId, patch: Data) -> Result<(), ParticipantError> {
        Ok(self
            .call(move |p| p.apply_local(|c| c.update(id, &patch).map(|e| ((), e))))
            .await??)
    }

    /// Returns whether the object existed.
    ///
    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn delete(&self, id: ObjectId) -> Result<bool, ParticipantError> {
        self.call(move |p| {
            let effects = p.channel.delete(id);
            let existed = !effects.is_empty();
            p.execute(effects);
            existed
        })
        .await
    }

    /// # Errors
    ///
    /// Fails for unknown ids.
    pub async fn reorder(&self, id: ObjectId, target: ReorderTarget) -> Result<(), ParticipantError> {
        Ok(self
            .call(move |p| p.apply_local(|c| c.reorder(id, target).map(|e| ((), e))))
            .await??)
    }

    /// # Errors
    ///
    /// Fails if any member is unknown.
    pub async fn reorder_group(&self, ids: Vec<ObjectId>, delta: i32) -> Result<(), ParticipantError> {
        Ok(self
            .call(move |p| p.apply_local(|c| c.reorder_group(&ids, delta).map(|e| ((), e))))
            .await??)
    }

    /// # Errors
    ///
    /// Fails when another participant is already editing the object.
    pub async fn begin_edit(&self, id: ObjectId) -> Result<(), ParticipantError> {
        Ok(self
            .call(move |p| p.apply_local(|c| c.begin_edit(id).map(|e| ((), e))))
            .await??)
    }

    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn end_edit(&self, id: ObjectId) -> Result<(), ParticipantError> {
        self.call(move |p| {
            let effects = p.channel.end_edit(id);
            p.execute(effects);
        })
        .await
    }

    /// Every object, bottom to top.
    ///
    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn snapshot(&self) -> Result<Vec<CanvasObject>, ParticipantError> {
        self.call(|p| p.channel.snapshot()).await
    }

    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn get(&self, id: ObjectId) -> Result<Option<CanvasObject>, ParticipantError> {
        self.call(move |p| p.channel.store().get(id).cloned()).await
    }

    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn lock_state(&self, id: ObjectId) -> Result<LockState, ParticipantError> {
        self.call(move |p| p.channel.locks().state(id)).await
    }

    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn known_locks(&self) -> Result<Vec<Lock>, ParticipantError> {
        self.call(|p| p.channel.locks().known_locks()).await
    }

    /// Stream store events. Events are dropped, with a warning, while the
    /// receiver is `capacity` events behind. Dropping the receiver
    /// unsubscribes on the next event.
    ///
    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn subscribe(&self, capacity: usize) -> Result<mpsc::Receiver<StoreEvent>, ParticipantError> {
        let (tx, rx) = mpsc::channel(capacity);
        self.call(move |p| {
            p.channel.store_mut().subscribe_while(move |event| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("store event subscriber lagging; event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("store event subscriber gone; unsubscribing");
                    false
                }
            });
        })
        .await?;
        Ok(rx)
    }

    /// Save dirty buckets now instead of waiting for the quiet period.
    /// Returns `false` when nothing was saved: nothing was dirty, another
    /// save or delete was in flight, or the save failed.
    ///
    /// # Errors
    ///
    /// Fails only if the worker has stopped.
    pub async fn flush(&self) -> Result<bool, ParticipantError> {
        let Some(done) = self.call(Participant::flush).await? else {
            return Ok(false);
        };
        done.await.map_err(|_| ParticipantError::Stopped)
    }

    /// Drop this handle and wait until the worker has stopped: in-flight
    /// writes and deletes have landed and the final save has run. The
    /// worker only stops once every clone of the handle is gone.
    pub async fn shutdown(self) {
        let ParticipantHandle { jobs, mut stopped, .. } = self;
        drop(jobs);
        while stopped.changed().await.is_ok() {}
    }
}

impl std::fmt::Debug for ParticipantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "participant_test.rs"]
mod tests;
