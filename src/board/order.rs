//! Order model — object id to rank mapping and derived draw order.
//!
//! DESIGN
//! ======
//! Ranks are the source of truth. Integer draw indices are a disposable
//! cache: a sorted view built lazily on the first query after any write and
//! dropped on the next write. Sorting is by `(rank, id)`, so duplicate ranks
//! from corrupt data still produce a total order until they are repaired.
//!
//! Every rank written by this model is checked against the ranks already in
//! use. Collisions are repaired by regenerating the rank of the newcomer
//! (or, in a sweep, of the higher id) into the gap just above the
//! duplicate, and reported as [`Repair`] records.

use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::board::object::ObjectId;
use crate::board::rank::{self, Rank, RankError};

/// Upper bound on collision retries when appending a new rank.
const MAX_ASSIGN_ATTEMPTS: usize = 8;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("object has no rank: {0}")]
    NotFound(ObjectId),
    #[error("group move needs at least one object")]
    EmptyGroup,
    #[error(transparent)]
    Rank(#[from] RankError),
}

/// Result of a single-object move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The object now holds this rank.
    Moved(Rank),
    /// Already at the requested extreme; nothing changed.
    AtBoundary,
}

/// Result of a group move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMoveOutcome {
    /// New ranks, bottom-most member first.
    Moved(Vec<(ObjectId, Rank)>),
    AtBoundary,
}

/// A rank regenerated to break a collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub id: ObjectId,
    pub from: Rank,
    pub to: Rank,
}

#[derive(Debug, Clone)]
struct Entry {
    rank: Rank,
    kind: String,
}

#[derive(Debug, Default)]
struct SortedView {
    ids: Vec<ObjectId>,
    index: HashMap<ObjectId, usize>,
}

/// Rank registry for every live object on this participant.
#[derive(Debug, Default)]
pub struct OrderModel {
    entries: HashMap<ObjectId, Entry>,
    sorted: OnceCell<SortedView>,
}

// =============================================================================
// QUERIES
// =============================================================================

impl OrderModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn rank(&self, id: ObjectId) -> Option<&Rank> {
        self.entries.get(&id).map(|e| &e.rank)
    }

    #[must_use]
    pub fn kind(&self, id: ObjectId) -> Option<&str> {
        self.entries.get(&id).map(|e| e.kind.as_str())
    }

    /// Derived integer draw position, 0 = bottom.
    #[must_use]
    pub fn draw_index(&self, id: ObjectId) -> Option<usize> {
        self.view().index.get(&id).copied()
    }

    /// The object drawn at position `n`.
    #[must_use]
    pub fn nth(&self, n: usize) -> Option<ObjectId> {
        self.view().ids.get(n).copied()
    }

    /// All ids bottom to top.
    #[must_use]
    pub fn ordered_ids(&self) -> &[ObjectId] {
        &self.view().ids
    }

    /// Ids of one object type, bottom to top.
    #[must_use]
    pub fn ordered_ids_of_kind(&self, kind: &str) -> Vec<ObjectId> {
        self.view()
            .ids
            .iter()
            .filter(|id| self.kind(**id) == Some(kind))
            .copied()
            .collect()
    }

    /// Snapshot of every derived draw index, for change detection.
    #[must_use]
    pub fn draw_indices(&self) -> HashMap<ObjectId, usize> {
        self.view().index.clone()
    }

    #[must_use]
    pub fn max_rank(&self) -> Option<&Rank> {
        self.view().ids.last().and_then(|id| self.rank(*id))
    }

    #[must_use]
    pub fn min_rank(&self) -> Option<&Rank> {
        self.view().ids.first().and_then(|id| self.rank(*id))
    }

    /// Another object currently holding `rank`, if any.
    #[must_use]
    pub fn rank_owner(&self, rank: &Rank, exclude: ObjectId) -> Option<ObjectId> {
        self.entries
            .iter()
            .find(|(id, entry)| **id != exclude && entry.rank == *rank)
            .map(|(id, _)| *id)
    }

    /// Every pair of ids sharing a rank, lower id first.
    #[must_use]
    pub fn collisions(&self) -> Vec<(ObjectId, ObjectId)> {
        self.view()
            .ids
            .windows(2)
            .filter(|pair| self.rank(pair[0]) == self.rank(pair[1]))
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }

    fn view(&self) -> &SortedView {
        self.sorted.get_or_init(|| {
            let mut ids: Vec<ObjectId> = self.entries.keys().copied().collect();
            ids.sort_by(|a, b| {
                let ra = &self.entries[a].rank;
                let rb = &self.entries[b].rank;
                ra.cmp(rb).then_with(|| a.cmp(b))
            });
            let index = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            SortedView { ids, index }
        })
    }

    fn invalidate(&mut self) {
        self.sorted.take();
    }

    fn write(&mut self, id: ObjectId, rank: Rank, kind: Option<&str>) {
        let kind = kind
            .map(str::to_owned)
            .or_else(|| self.entries.get(&id).map(|e| e.kind.clone()))
            .unwrap_or_default();
        self.entries.insert(id, Entry { rank, kind });
        self.invalidate();
    }

    /// Smallest rank in use that is strictly greater than `rank`.
    fn next_rank_above(&self, rank: &Rank) -> Option<Rank> {
        self.entries
            .values()
            .map(|e| &e.rank)
            .filter(|r| *r > rank)
            .min()
            .cloned()
    }

    /// Rank for the slot between two neighbours.
    ///
    /// Equal neighbours only happen with unrepaired duplicate data; there is
    /// no key strictly between them, so the tie is broken below the upper
    /// one instead.
    fn slot_rank(lower: Option<&Rank>, upper: Option<&Rank>) -> Result<Rank, RankError> {
        match (lower, upper) {
            (Some(lower), Some(upper)) if lower == upper => {
                warn!(%upper, "duplicate neighbour ranks; breaking tie below");
                rank::before(upper)
            }
            _ => rank::between_bounds(lower, upper),
        }
    }
}

// =============================================================================
// ASSIGNMENT
// =============================================================================

impl OrderModel {
    /// Give `id` a rank above every existing object. Idempotent: an id that
    /// already has a rank keeps it.
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures.
    pub fn assign(&mut self, id: ObjectId, kind: &str) -> Result<usize, OrderError> {
        if let Some(index) = self.draw_index(id) {
            return Ok(index);
        }

        let mut candidate = rank::between_bounds(self.max_rank(), None)?;
        for attempt in 1..MAX_ASSIGN_ATTEMPTS {
            let Some(owner) = self.rank_owner(&candidate, id) else {
                break;
            };
            warn!(%id, %owner, rank = %candidate, attempt, "fresh rank already in use; retrying");
            candidate = rank::after(&candidate)?;
        }

        self.write(id, candidate, Some(kind));
        self.draw_index(id).ok_or(OrderError::NotFound(id))
    }

    /// Insert or replace `id` with a rank that came from outside (durable
    /// storage, a replicated object). A rank already held by a different
    /// object is regenerated into the gap directly above it and the repair
    /// is returned; the load itself never fails on a collision.
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures.
    pub fn assign_with_rank(
        &mut self,
        id: ObjectId,
        rank: Rank,
        kind: &str,
    ) -> Result<(usize, Option<Repair>), OrderError> {
        let free = self.free_rank(id, &rank)?;
        let repair = (free != rank).then(|| {
            warn!(%id, from = %rank, to = %free, "rank collision repaired");
            Repair { id, from: rank.clone(), to: free }
        });

        let assigned = repair.as_ref().map_or(rank, |r| r.to.clone());
        self.write(id, assigned, Some(kind));
        let index = self.draw_index(id).ok_or(OrderError::NotFound(id))?;
        Ok((index, repair))
    }

    /// `rank` if no other object holds it, otherwise a fresh rank in the gap
    /// directly above it.
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures.
    pub fn free_rank(&self, id: ObjectId, rank: &Rank) -> Result<Rank, OrderError> {
        if self.rank_owner(rank, id).is_none() {
            return Ok(rank.clone());
        }
        let upper = self.next_rank_above(rank);
        Self::slot_rank(Some(rank), upper.as_ref()).map_err(OrderError::from)
    }

    /// Set a rank decided elsewhere (an authority confirmation) verbatim.
    /// Returns the id of any object that already held the same rank; the
    /// `(rank, id)` tie-break keeps the order total meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] if `id` has no rank yet.
    pub fn apply_rank(&mut self, id: ObjectId, rank: Rank) -> Result<Option<ObjectId>, OrderError> {
        if !self.contains(id) {
            return Err(OrderError::NotFound(id));
        }
        let clash = self.rank_owner(&rank, id);
        if let Some(owner) = clash {
            warn!(%id, %owner, %rank, "applied rank collides with another object");
        }
        self.write(id, rank, None);
        Ok(clash)
    }

    /// Insert `id` with a rank it carried from another participant,
    /// verbatim, even if another object already holds it. Only the
    /// authority regenerates ranks; its confirmation settles the clash.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] if the inserted id cannot be indexed.
    pub fn place(&mut self, id: ObjectId, rank: Rank, kind: &str) -> Result<usize, OrderError> {
        if let Some(owner) = self.rank_owner(&rank, id) {
            debug!(%id, %owner, %rank, "replicated rank shared until confirmed");
        }
        self.write(id, rank, Some(kind));
        self.draw_index(id).ok_or(OrderError::NotFound(id))
    }

    /// Drop `id` from the order.
    pub fn remove(&mut self, id: ObjectId) -> Option<Rank> {
        let removed = self.entries.remove(&id).map(|e| e.rank);
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    /// Regenerate ranks until no two objects share one. Within each
    /// duplicate pair the higher id moves into the gap above the shared rank.
    ///
    /// # Errors
    ///
    /// Propagates rank generation failures.
    pub fn repair_collisions(&mut self) -> Result<Vec<Repair>, OrderError> {
        let mut repairs = Vec::new();
        for _ in 0..=self.entries.len() {
            let Some((_, victim)) = self.collisions().into_iter().next() else {
                break;
            };
            let from = self.rank(victim).cloned().ok_or(OrderError::NotFound(victim))?;
            let upper = self.next_rank_above(&from);
            let to = Self::slot_rank(Some(&from), upper.as_ref())?;
            warn!(id = %victim, %from, %to, "rank collision repaired");
            self.write(victim, to.clone(), None);
            repairs.push(Repair { id: victim, from, to });
        }
        Ok(repairs)
    }
}

// =============================================================================
// MOVES
// =============================================================================

impl OrderModel {
    /// Move `id` by `delta` positions; positive is toward the top. The move
    /// is clamped to the ends of the order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] for unknown ids.
    pub fn move_by(&mut self, id: ObjectId, delta: i32) -> Result<MoveOutcome, OrderError> {
        let index = self.draw_index(id).ok_or(OrderError::NotFound(id))?;
        let last = self.len() - 1;
        let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
        let target = if delta >= 0 {
            index.saturating_add(magnitude).min(last)
        } else {
            index.saturating_sub(magnitude)
        };
        if target == index {
            debug!(%id, delta, "move at boundary");
            return Ok(MoveOutcome::AtBoundary);
        }

        let others: Vec<ObjectId> = self
            .ordered_ids()
            .iter()
            .copied()
            .filter(|other| *other != id)
            .collect();
        let lower = target
            .checked_sub(1)
            .and_then(|i| others.get(i))
            .and_then(|other| self.rank(*other))
            .cloned();
        let upper = others.get(target).and_then(|other| self.rank(*other)).cloned();

        let next = Self::slot_rank(lower.as_ref(), upper.as_ref())?;
        self.write(id, next.clone(), None);
        Ok(MoveOutcome::Moved(next))
    }

    /// Move `id` above every other object.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] for unknown ids.
    pub fn move_to_top(&mut self, id: ObjectId) -> Result<MoveOutcome, OrderError> {
        let index = self.draw_index(id).ok_or(OrderError::NotFound(id))?;
        if index + 1 == self.len() {
            return Ok(MoveOutcome::AtBoundary);
        }
        let max = self.max_rank().cloned().ok_or(OrderError::NotFound(id))?;
        let next = rank::after(&max)?;
        self.write(id, next.clone(), None);
        Ok(MoveOutcome::Moved(next))
    }

    /// Move `id` below every other object.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] for unknown ids.
    pub fn move_to_bottom(&mut self, id: ObjectId) -> Result<MoveOutcome, OrderError> {
        let index = self.draw_index(id).ok_or(OrderError::NotFound(id))?;
        if index == 0 {
            return Ok(MoveOutcome::AtBoundary);
        }
        let min = self.min_rank().cloned().ok_or(OrderError::NotFound(id))?;
        let next = rank::before(&min)?;
        self.write(id, next.clone(), None);
        Ok(MoveOutcome::Moved(next))
    }

    /// Move a possibly scattered group past `|delta|` non-member neighbours
    /// as one block. Members end contiguous, in their original relative
    /// order, directly beyond the chosen neighbour; objects outside the group
    /// keep their ranks.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::EmptyGroup`] for an empty id list and
    /// [`OrderError::NotFound`] for unknown ids.
    pub fn move_group(&mut self, ids: &[ObjectId], delta: i32) -> Result<GroupMoveOutcome, OrderError> {
        if ids.is_empty() {
            return Err(OrderError::EmptyGroup);
        }
        if let Some(missing) = ids.iter().find(|id| !self.contains(**id)) {
            return Err(OrderError::NotFound(*missing));
        }
        if delta == 0 {
            return Ok(GroupMoveOutcome::AtBoundary);
        }

        let group: HashSet<ObjectId> = ids.iter().copied().collect();
        let order = self.ordered_ids().to_vec();
        let members: Vec<ObjectId> = order.iter().copied().filter(|id| group.contains(id)).collect();
        let steps = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);

        let (lower, upper) = if delta > 0 {
            let top = order.iter().rposition(|id| group.contains(id)).unwrap_or(0);
            let above: Vec<usize> = (top + 1..order.len()).collect();
            let Some(&neighbour) = above.get(steps.min(above.len()).saturating_sub(1)) else {
                return Ok(GroupMoveOutcome::AtBoundary);
            };
            (
                self.rank(order[neighbour]).cloned(),
                order.get(neighbour + 1).and_then(|id| self.rank(*id)).cloned(),
            )
        } else {
            let bottom = order.iter().position(|id| group.contains(id)).unwrap_or(0);
            let Some(neighbour) = bottom.checked_sub(steps.min(bottom).max(1)) else {
                return Ok(GroupMoveOutcome::AtBoundary);
            };
            (
                neighbour
                    .checked_sub(1)
                    .and_then(|i| order.get(i))
                    .and_then(|id| self.rank(*id))
                    .cloned(),
                self.rank(order[neighbour]).cloned(),
            )
        };

        // Chain interpolations so each member lands just above the previous.
        let mut placed = Vec::with_capacity(members.len());
        let mut floor = lower;
        for id in members {
            let next = Self::slot_rank(floor.as_ref(), upper.as_ref())?;
            self.write(id, next.clone(), None);
            floor = Some(next.clone());
            placed.push((id, next));
        }
        Ok(GroupMoveOutcome::Moved(placed))
    }
}

#[cfg(test)]
#[path = "order_test.rs"]
mod tests;
