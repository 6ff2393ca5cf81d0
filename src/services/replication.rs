//! Replication channel — the participant-side protocol state machine.
//!
//! DESIGN
//! ======
//! The channel owns this participant's object store and lock coordinator
//! and turns both local intents and inbound envelopes into state changes
//! plus a list of [`Effect`]s. It never performs I/O itself; the
//! participant worker executes effects and feeds completions back in.
//!
//! Local writes take the optimistic path: applied immediately, then
//! broadcast. Remote envelopes take the confirmed path through the same
//! store methods and therefore the same conflict policy.
//!
//! REORDERING
//! ==========
//! Peers never decide a rank. A peer applies its own move optimistically
//! and sends `reorderRequest`; the authority resolves the proposal against
//! its current order, applies it, bumps its sequence counter and emits a
//! persist-then-broadcast `reorderConfirm`. Confirms older than the last
//! one applied for the same object are dropped, so every participant
//! converges on the authority's latest decision.
//!
//! Concurrent creates can carry the same rank. Peers keep a replicated
//! create's rank verbatim, shared or not; only the authority repairs the
//! clash, and the repaired rank reaches everyone as a `reorderConfirm`.
//!
//! ERROR HANDLING
//! ==============
//! Inbound problems never propagate: unknown objects are logged at debug
//! (ordinary races with deletes), everything else at warn. Local intents
//! return [`ReplicationError`] so the caller can refuse the action.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::board::lock::{EditStart, LockCoordinator, LockError, LockState};
use crate::board::object::{CanvasObject, Data, ObjectId, Origin, ParticipantId, Position, TypeRegistry};
use crate::board::order::{GroupMoveOutcome, MoveOutcome, Repair};
use crate::board::rank::Rank;
use crate::board::store::{CreateOutcome, ObjectStore, ReorderTarget, StoreError, UpdateMeta, UpdateOutcome};
use crate::frame::{Clock, Envelope, Message};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes durable storage and arbitrates reorders.
    Authority,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Work the channel asks its owner to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send to every other participant.
    Broadcast(Envelope),
    /// Remove one durable key, bypassing the save debounce.
    DeleteDurable { bucket: String, id: ObjectId },
    /// Persist the object, then broadcast the confirmation.
    PersistThenBroadcast { object: CanvasObject, confirm: Envelope },
}

pub struct ReplicationChannel {
    self_id: ParticipantId,
    role: Role,
    store: ObjectStore,
    locks: LockCoordinator,
    clock: Clock,
    sequence: u64,
    confirmed: HashMap<ObjectId, u64>,
}

impl ReplicationChannel {
    #[must_use]
    pub fn new(self_id: ParticipantId, label: impl Into<String>, role: Role, registry: TypeRegistry) -> Self {
        let mut clock = Clock::new();
        // Seeded from wall time so a restarted authority keeps issuing
        // sequences above the ones peers already applied.
        let sequence = u64::try_from(clock.tick()).unwrap_or_default();
        Self {
            self_id,
            role,
            store: ObjectStore::new(registry),
            locks: LockCoordinator::new(self_id, label),
            clock,
            sequence,
            confirmed: HashMap::new(),
        }
    }

    #[must_use]
    pub fn self_id(&self) -> ParticipantId {
        self.self_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Mutable store access for subscriptions.
    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    #[must_use]
    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Every object, bottom to top.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CanvasObject> {
        self.store.ordered().into_iter().cloned().collect()
    }

    fn envelope(&mut self, message: Message) -> Envelope {
        Envelope::new(self.self_id, self.clock.tick(), message)
    }

    fn broadcast(&mut self, message: Message) -> Effect {
        Effect::Broadcast(self.envelope(message))
    }

    fn object(&self, id: ObjectId) -> Result<CanvasObject, StoreError> {
        self.store.get(id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Sequence a rank the authority has just applied.
    fn confirm(&mut self, id: ObjectId, rank: Rank) -> Result<Effect, StoreError> {
        self.sequence += 1;
        let sequence = self.sequence;
        self.confirmed.insert(id, sequence);
        let object = self.object(id)?;
        let confirm = self.envelope(Message::ReorderConfirm { object_id: id, rank, sequence });
        Ok(Effect::PersistThenBroadcast { object, confirm })
    }

    fn announce_rank(&mut self, id: ObjectId, rank: Rank) -> Result<Effect, StoreError> {
        match self.role {
            Role::Authority => self.confirm(id, rank),
            Role::Peer => Ok(self.broadcast(Message::ReorderRequest { object_id: id, proposed_rank: rank })),
        }
    }

    // =========================================================================
    // LOADING
    // =========================================================================

    /// Install objects read from durable storage, then sweep duplicate
    /// ranks. Objects of unknown or invalid types are skipped. Returns every
    /// rank that had to change, so the caller can persist them.
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures from the sweep.
    pub fn load(&mut self, objects: Vec<CanvasObject>) -> Result<Vec<Repair>, ReplicationError> {
        let total = objects.len();
        let mut repairs = Vec::new();
        for object in objects {
            let id = object.id;
            let stamp = object.last_modified;
            self.clock.observe(stamp);
            match self.store.create(object, Origin::Remote, stamp) {
                Ok(CreateOutcome::Created { repair: Some(repair), .. }) => repairs.push(repair),
                Ok(_) => {}
                Err(e) => warn!(%id, error = %e, "skipping stored object"),
            }
        }
        repairs.extend(self.store.repair_collisions()?);
        info!(loaded = self.store.len(), total, repaired = repairs.len(), "board loaded");
        Ok(repairs)
    }

    // =========================================================================
    // LOCAL INTENTS
    // =========================================================================

    /// Create a new object on top of the stack.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Kind`] for unregistered or invalid types.
    pub fn create(
        &mut self,
        kind: &str,
        position: Position,
        attributes: Data,
    ) -> Result<(ObjectId, Vec<Effect>), ReplicationError> {
        let attributes = self.store.registry().build(kind, attributes).map_err(StoreError::from)?;
        let object = CanvasObject::new(kind, position, attributes);
        let id = object.id;
        let ts = self.clock.tick();
        self.store.create(object, Origin::Local, ts)?;
        let object = self.object(id)?;
        let effect = Effect::Broadcast(Envelope::new(self.self_id, ts, Message::Create { object }));
        Ok((id, vec![effect]))
    }

    /// Patch an object.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::HeldByOther`] when another participant is editing
    /// the object and [`StoreError::NotFound`] for unknown ids.
    pub fn update(&mut self, id: ObjectId, patch: &Data) -> Result<Vec<Effect>, ReplicationError> {
        if let LockState::LockedByOther(owner) = self.locks.state(id) {
            return Err(LockError::HeldByOther { object_id: id, owner }.into());
        }
        let ts = self.clock.tick();
        let outcome = self
            .store
            .update(id, patch, Origin::Local, UpdateMeta { timestamp: ts }, &self.locks)?;
        let UpdateOutcome::Applied { fields } = outcome else {
            return Ok(Vec::new());
        };
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = fields.iter().map(String::as_str).collect();
        let patch = CanvasObject::filter_patch(patch, &keys);
        let effect = Effect::Broadcast(Envelope::new(self.self_id, ts, Message::Update { object_id: id, patch }));
        Ok(vec![effect])
    }

    /// Delete an object. Unknown ids produce no effects.
    pub fn delete(&mut self, id: ObjectId) -> Vec<Effect> {
        let Some(object) = self.store.delete(id, Origin::Local) else {
            return Vec::new();
        };
        self.forget(id);
        let mut effects = vec![self.broadcast(Message::Delete { object_id: id })];
        if self.role == Role::Authority {
            effects.push(Effect::DeleteDurable { bucket: object.kind, id });
        }
        effects
    }

    /// Move one object in the draw order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub fn reorder(&mut self, id: ObjectId, target: ReorderTarget) -> Result<Vec<Effect>, ReplicationError> {
        match self.store.reorder(id, target, Origin::Local)? {
            MoveOutcome::AtBoundary => Ok(Vec::new()),
            MoveOutcome::Moved(rank) => Ok(vec![self.announce_rank(id, rank)?]),
        }
    }

    /// Move a group of objects as one block.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if any member is unknown.
    pub fn reorder_group(&mut self, ids: &[ObjectId], delta: i32) -> Result<Vec<Effect>, ReplicationError> {
        let GroupMoveOutcome::Moved(placed) = self.store.reorder_group(ids, delta, Origin::Local)? else {
            return Ok(Vec::new());
        };
        let mut effects = Vec::with_capacity(placed.len());
        for (id, rank) in placed {
            effects.push(self.announce_rank(id, rank)?);
        }
        Ok(effects)
    }

    /// Start an exclusive edit.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::HeldByOther`] if someone else is editing.
    pub fn begin_edit(&mut self, id: ObjectId) -> Result<Vec<Effect>, ReplicationError> {
        if !self.store.contains(id) {
            return Err(StoreError::NotFound(id).into());
        }
        match self.locks.begin_edit(id)? {
            EditStart::Acquired(lock) => Ok(vec![self.broadcast(Message::Lock { lock })]),
            EditStart::AlreadyHeld => Ok(Vec::new()),
        }
    }

    /// End an exclusive edit. Ending an edit that was never started is a
    /// no-op.
    pub fn end_edit(&mut self, id: ObjectId) -> Vec<Effect> {
        match self.locks.end_edit(id) {
            Some(lock) => vec![self.broadcast(Message::Unlock { lock })],
            None => Vec::new(),
        }
    }

    /// Ask every peer for the locks it holds (sent on join).
    pub fn request_lock_state(&mut self) -> Vec<Effect> {
        vec![self.broadcast(Message::LockStateRequest)]
    }

    fn forget(&mut self, id: ObjectId) {
        self.locks.forget(id);
        self.confirmed.remove(&id);
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Apply an envelope from another participant.
    pub fn receive(&mut self, envelope: Envelope) -> Vec<Effect> {
        if envelope.sender == self.self_id {
            debug!(id = %envelope.id, kind = envelope.message.kind().as_str(), "echo suppressed");
            return Vec::new();
        }
        self.clock.observe(envelope.ts);

        let kind = envelope.message.kind();
        let sender = envelope.sender;
        match self.apply_remote(envelope) {
            Ok(effects) => effects,
            Err(ReplicationError::Store(StoreError::NotFound(id))) => {
                debug!(%id, %sender, kind = kind.as_str(), "inbound message for unknown object");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, %sender, kind = kind.as_str(), "inbound message rejected");
                Vec::new()
            }
        }
    }

    fn apply_remote(&mut self, envelope: Envelope) -> Result<Vec<Effect>, ReplicationError> {
        let Envelope { sender, ts, message, .. } = envelope;
        match message {
            Message::Create { object } => self.remote_create(object, ts),
            Message::Update { object_id, patch } => {
                self.store
                    .update(object_id, &patch, Origin::Remote, UpdateMeta { timestamp: ts }, &self.locks)?;
                Ok(Vec::new())
            }
            Message::Delete { object_id } => Ok(self.remote_delete(object_id)),
            Message::ReorderRequest { object_id, proposed_rank } => self.remote_reorder_request(object_id, &proposed_rank, sender),
            Message::ReorderConfirm { object_id, rank, sequence } => {
                self.remote_reorder_confirm(object_id, rank, sequence, sender)?;
                Ok(Vec::new())
            }
            Message::Lock { lock } => {
                self.locks.apply_remote_lock(lock)?;
                Ok(Vec::new())
            }
            Message::Unlock { lock } => {
                self.locks.apply_remote_unlock(lock.object_id, sender)?;
                Ok(Vec::new())
            }
            Message::LockStateRequest => {
                let held = self.locks.held_locks();
                if held.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![self.broadcast(Message::LockStateResponse { locks: held })])
            }
            Message::LockStateResponse { locks } => {
                let desyncs = self.locks.apply_lock_state(locks);
                if desyncs > 0 {
                    warn!(%sender, desyncs, "lock state response contradicted local locks");
                }
                Ok(Vec::new())
            }
        }
    }

    fn remote_create(&mut self, object: CanvasObject, ts: i64) -> Result<Vec<Effect>, ReplicationError> {
        let id = object.id;
        let outcome = match self.role {
            Role::Authority => self.store.create(object, Origin::Remote, ts)?,
            Role::Peer => self.store.create_replica(object, ts)?,
        };
        match outcome {
            CreateOutcome::Created { repair: Some(repair), .. } if self.role == Role::Authority => {
                Ok(vec![self.confirm(id, repair.to)?])
            }
            CreateOutcome::Created { .. } | CreateOutcome::Duplicate => Ok(Vec::new()),
        }
    }

    fn remote_delete(&mut self, id: ObjectId) -> Vec<Effect> {
        let Some(object) = self.store.delete(id, Origin::Remote) else {
            return Vec::new();
        };
        self.forget(id);
        match self.role {
            Role::Authority => vec![Effect::DeleteDurable { bucket: object.kind, id }],
            Role::Peer => Vec::new(),
        }
    }

    fn remote_reorder_request(
        &mut self,
        id: ObjectId,
        proposed: &Rank,
        sender: ParticipantId,
    ) -> Result<Vec<Effect>, ReplicationError> {
        if self.role != Role::Authority {
            debug!(%id, %sender, "reorder request ignored by non-authority");
            return Ok(Vec::new());
        }
        if !self.store.contains(id) {
            warn!(%id, %sender, "reorder request for unknown object");
            return Ok(Vec::new());
        }
        let rank = self.store.order().free_rank(id, proposed).map_err(StoreError::from)?;
        if rank != *proposed {
            debug!(%id, %proposed, accepted = %rank, "proposed rank taken; adjusted");
        }
        self.store.apply_rank(id, rank.clone(), Origin::Remote)?;
        Ok(vec![self.confirm(id, rank)?])
    }

    fn remote_reorder_confirm(
        &mut self,
        id: ObjectId,
        rank: Rank,
        sequence: u64,
        sender: ParticipantId,
    ) -> Result<(), ReplicationError> {
        if self.role == Role::Authority {
            warn!(%id, %sender, sequence, "reorder confirm from another participant ignored");
            return Ok(());
        }
        if let Some(last) = self.confirmed.get(&id)
            && *last >= sequence
        {
            debug!(%id, sequence, last, "stale reorder confirm dropped");
            return Ok(());
        }
        self.confirmed.insert(id, sequence);
        self.store.apply_rank(id, rank, Origin::Remote)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReplicationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationChannel")
            .field("self_id", &self.self_id)
            .field("role", &self.role)
            .field("store", &self.store)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "replication_test.rs"]
mod tests;
