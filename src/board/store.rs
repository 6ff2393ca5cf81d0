//! Object store — this participant's authoritative in-memory registry.
//!
//! DESIGN
//! ======
//! The store owns every object and the order model that ranks them. All
//! writes, local or replicated, pass through the same methods; remote
//! updates are filtered by [`resolve_conflict`] first:
//!
//! - remote and older than the local copy: discard (stale)
//! - remote, same timestamp, local copy written locally: discard (local wins)
//! - remote while the object is under a local exclusive interaction: only
//!   presence fields get through
//! - otherwise apply and restamp
//!
//! Listeners are called synchronously, in registration order, after the
//! state change is complete. Events carry a snapshot of the object so a
//! listener never needs to reach back into the store.

use std::collections::HashMap;

use tracing::debug;

use crate::board::object::{CanvasObject, Data, KindError, ObjectId, Origin, TypeRegistry};
use crate::board::order::{GroupMoveOutcome, MoveOutcome, OrderError, OrderModel, Repair};
use crate::board::rank::Rank;

/// Fields a remote update may still change while a local gesture holds the
/// object. Used only for presence highlighting.
pub const PRESENCE_FIELDS: &[&str] = &["selected"];

/// Changed-field name reported when the rank moves.
pub const FIELD_RANK: &str = "rank";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),
    #[error(transparent)]
    Kind(#[from] KindError),
    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Created { object: CanvasObject, origin: Origin },
    Updated { object: CanvasObject, origin: Origin, fields: Vec<String> },
    Deleted { object: CanvasObject, origin: Origin },
    /// Every object whose derived draw index changed, with its new index.
    Reordered { changes: Vec<(ObjectId, usize)> },
}

/// Metadata accompanying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateMeta {
    /// Logical timestamp of the modification.
    pub timestamp: i64,
}

/// Why a remote update was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Stale,
    LocalWinsTie,
    LocallyHeld,
}

/// Verdict of the conflict policy for one incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply,
    /// Apply only these fields and leave the modification stamp alone.
    ApplyOnly(&'static [&'static str]),
    Discard(DiscardReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { draw_index: usize, repair: Option<Repair> },
    /// Already known; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { fields: Vec<String> },
    Discarded(DiscardReason),
}

/// Where a single-object reorder should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderTarget {
    By(i32),
    Top,
    Bottom,
}

/// Answers whether a local exclusive interaction currently holds an object.
pub trait InteractionGuard {
    fn is_locally_held(&self, id: ObjectId) -> bool;
}

/// Guard for contexts with no interactive editing (loaders, tests).
pub struct NoInteraction;

impl InteractionGuard for NoInteraction {
    fn is_locally_held(&self, _id: ObjectId) -> bool {
        false
    }
}

/// Handle returned by [`ObjectStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Returns `false` to unsubscribe.
type Listener = Box<dyn FnMut(&StoreEvent) -> bool + Send>;

// =============================================================================
// CONFLICT POLICY
// =============================================================================

/// Decide what to do with an update against `existing`. Local writes always
/// apply; remote writes are arbitrated by timestamp, then by interaction.
#[must_use]
pub fn resolve_conflict(existing: &CanvasObject, origin: Origin, timestamp: i64, locally_held: bool) -> Resolution {
    if origin == Origin::Local {
        return Resolution::Apply;
    }
    if timestamp < existing.last_modified {
        return Resolution::Discard(DiscardReason::Stale);
    }
    if timestamp == existing.last_modified && existing.last_modified_by == Origin::Local {
        return Resolution::Discard(DiscardReason::LocalWinsTie);
    }
    if locally_held {
        return Resolution::ApplyOnly(PRESENCE_FIELDS);
    }
    Resolution::Apply
}

// =============================================================================
// STORE
// =============================================================================

pub struct ObjectStore {
    registry: TypeRegistry,
    objects: HashMap<ObjectId, CanvasObject>,
    order: OrderModel,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl ObjectStore {
    #[must_use]
    pub fn new(registry: TypeRegistry) -> Self {
        Self { registry, objects: HashMap::new(), order: OrderModel::new(), listeners: Vec::new(), next_subscription: 0 }
    }

    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    #[must_use]
    pub fn order(&self) -> &OrderModel {
        &self.order
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&CanvasObject> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[must_use]
    pub fn draw_index(&self, id: ObjectId) -> Option<usize> {
        self.order.draw_index(id)
    }

    /// Every object, bottom to top.
    #[must_use]
    pub fn ordered(&self) -> Vec<&CanvasObject> {
        self.order
            .ordered_ids()
            .iter()
            .filter_map(|id| self.objects.get(id))
            .collect()
    }

    /// Objects of one type, bottom to top.
    #[must_use]
    pub fn objects_of_kind(&self, kind: &str) -> Vec<CanvasObject> {
        self.order
            .ordered_ids_of_kind(kind)
            .iter()
            .filter_map(|id| self.objects.get(id).cloned())
            .collect()
    }

    // -------------------------------------------------------------------------
    // SUBSCRIPTION
    // -------------------------------------------------------------------------

    pub fn subscribe(&mut self, mut listener: impl FnMut(&StoreEvent) + Send + 'static) -> SubscriptionId {
        self.subscribe_while(move |event| {
            listener(event);
            true
        })
    }

    /// Subscribe until the listener returns `false`; it is removed right
    /// after that call.
    pub fn subscribe_while(&mut self, listener: impl FnMut(&StoreEvent) -> bool + Send + 'static) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: &StoreEvent) {
        self.listeners.retain_mut(|(_, listener)| listener(event));
    }

    fn emit_reorder_since(&mut self, before: &HashMap<ObjectId, usize>) {
        let mut changes: Vec<(ObjectId, usize)> = self
            .order
            .draw_indices()
            .into_iter()
            .filter(|(id, index)| before.get(id) != Some(index))
            .collect();
        if changes.is_empty() {
            return;
        }
        changes.sort_by_key(|(_, index)| *index);
        self.emit(&StoreEvent::Reordered { changes });
    }

    fn emit_rank_update(&mut self, id: ObjectId, origin: Origin) {
        if let Some(object) = self.objects.get(&id).cloned() {
            self.emit(&StoreEvent::Updated { object, origin, fields: vec![FIELD_RANK.to_owned()] });
        }
    }

    fn sync_rank(&mut self, id: ObjectId) {
        let rank = self.order.rank(id).cloned();
        if let Some(object) = self.objects.get_mut(&id) {
            object.rank = rank;
        }
    }

    // -------------------------------------------------------------------------
    // MUTATIONS
    // -------------------------------------------------------------------------

    /// Insert an object. A known id is a no-op, so a duplicate echo of a
    /// create never double-inserts. A carried rank is kept (repaired on
    /// collision); a missing one is assigned on top.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Kind`] for unregistered or invalid types.
    pub fn create(&mut self, object: CanvasObject, origin: Origin, timestamp: i64) -> Result<CreateOutcome, StoreError> {
        self.insert(object, origin, timestamp, true)
    }

    /// Insert an object replicated from another participant on a replica
    /// that does not arbitrate ranks. A carried rank is kept as-is even on
    /// collision; the authority's `reorderConfirm` decides the final rank.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Kind`] for unregistered or invalid types.
    pub fn create_replica(&mut self, object: CanvasObject, timestamp: i64) -> Result<CreateOutcome, StoreError> {
        self.insert(object, Origin::Remote, timestamp, false)
    }

    fn insert(
        &mut self,
        mut object: CanvasObject,
        origin: Origin,
        timestamp: i64,
        repair_collision: bool,
    ) -> Result<CreateOutcome, StoreError> {
        if self.objects.contains_key(&object.id) {
            debug!(id = %object.id, ?origin, "duplicate create ignored");
            return Ok(CreateOutcome::Duplicate);
        }
        self.registry.check(&object)?;

        let before = self.order.draw_indices();
        let id = object.id;
        let (draw_index, repair) = match object.rank.take() {
            Some(rank) if repair_collision => self.order.assign_with_rank(id, rank, &object.kind)?,
            Some(rank) => (self.order.place(id, rank, &object.kind)?, None),
            None => (self.order.assign(id, &object.kind)?, None),
        };
        object.rank = self.order.rank(id).cloned();
        object.last_modified = timestamp;
        object.last_modified_by = origin;

        self.objects.insert(id, object.clone());
        self.emit(&StoreEvent::Created { object, origin });
        self.emit_reorder_since(&before);
        Ok(CreateOutcome::Created { draw_index, repair })
    }

    /// Apply a patch under the conflict policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub fn update(
        &mut self,
        id: ObjectId,
        patch: &Data,
        origin: Origin,
        meta: UpdateMeta,
        guard: &dyn InteractionGuard,
    ) -> Result<UpdateOutcome, StoreError> {
        let object = self.objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let resolution = resolve_conflict(object, origin, meta.timestamp, guard.is_locally_held(id));
        let fields = match resolution {
            Resolution::Discard(reason) => {
                debug!(%id, ?reason, incoming = meta.timestamp, current = object.last_modified, "update discarded");
                return Ok(UpdateOutcome::Discarded(reason));
            }
            Resolution::ApplyOnly(allowed) => {
                let fields = object.apply_patch(&CanvasObject::filter_patch(patch, allowed));
                if fields.is_empty() {
                    debug!(%id, "remote update dropped during local interaction");
                    return Ok(UpdateOutcome::Discarded(DiscardReason::LocallyHeld));
                }
                fields
            }
            Resolution::Apply => {
                let fields = object.apply_patch(patch);
                object.last_modified = meta.timestamp.max(object.last_modified);
                object.last_modified_by = origin;
                fields
            }
        };

        if !fields.is_empty() {
            let object = object.clone();
            self.emit(&StoreEvent::Updated { object, origin, fields: fields.clone() });
        }
        Ok(UpdateOutcome::Applied { fields })
    }

    /// Remove an object. Unknown ids are a silent no-op.
    pub fn delete(&mut self, id: ObjectId, origin: Origin) -> Option<CanvasObject> {
        let object = self.objects.remove(&id)?;
        let before = self.order.draw_indices();
        self.order.remove(id);
        self.emit(&StoreEvent::Deleted { object: object.clone(), origin });
        self.emit_reorder_since(&before);
        Some(object)
    }

    /// Reorder one object through the order model.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub fn reorder(&mut self, id: ObjectId, target: ReorderTarget, origin: Origin) -> Result<MoveOutcome, StoreError> {
        if !self.objects.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let before = self.order.draw_indices();
        let outcome = match target {
            ReorderTarget::By(delta) => self.order.move_by(id, delta)?,
            ReorderTarget::Top => self.order.move_to_top(id)?,
            ReorderTarget::Bottom => self.order.move_to_bottom(id)?,
        };
        if let MoveOutcome::Moved(_) = outcome {
            self.sync_rank(id);
            self.emit_rank_update(id, origin);
            self.emit_reorder_since(&before);
        }
        Ok(outcome)
    }

    /// Move several objects as one contiguous block.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub fn reorder_group(&mut self, ids: &[ObjectId], delta: i32, origin: Origin) -> Result<GroupMoveOutcome, StoreError> {
        if let Some(missing) = ids.iter().find(|id| !self.objects.contains_key(id)) {
            return Err(StoreError::NotFound(*missing));
        }
        let before = self.order.draw_indices();
        let outcome = self.order.move_group(ids, delta)?;
        if let GroupMoveOutcome::Moved(placed) = &outcome {
            for (id, _) in placed {
                self.sync_rank(*id);
                self.emit_rank_update(*id, origin);
            }
            self.emit_reorder_since(&before);
        }
        Ok(outcome)
    }

    /// Set a rank decided by the authority. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub fn apply_rank(&mut self, id: ObjectId, rank: Rank, origin: Origin) -> Result<bool, StoreError> {
        if !self.objects.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if self.order.rank(id) == Some(&rank) {
            return Ok(false);
        }
        let before = self.order.draw_indices();
        self.order.apply_rank(id, rank)?;
        self.sync_rank(id);
        self.emit_rank_update(id, origin);
        self.emit_reorder_since(&before);
        Ok(true)
    }

    /// Sweep duplicate ranks (after a bulk load).
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures.
    pub fn repair_collisions(&mut self) -> Result<Vec<Repair>, StoreError> {
        let before = self.order.draw_indices();
        let repairs = self.order.repair_collisions()?;
        for repair in &repairs {
            self.sync_rank(repair.id);
            self.emit_rank_update(repair.id, Origin::Local);
        }
        if !repairs.is_empty() {
            self.emit_reorder_since(&before);
        }
        Ok(repairs)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("objects", &self.objects.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
