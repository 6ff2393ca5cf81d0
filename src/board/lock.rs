//! Lock coordinator — exclusive interactive edits.
//!
//! DESIGN
//! ======
//! A lock is ephemeral and never persisted. Each participant tracks, per
//! object, whether it is unlocked, held by itself, or held by someone else.
//! The coordinator only decides transitions; broadcasting the matching
//! `lock`/`unlock` message is the caller's job.
//!
//! There is no expiry. A holder that disconnects without unlocking leaves
//! the lock in place on every peer that saw it, and a later joiner will not
//! learn about it because only the holder answers lock state requests.
//!
//! ERROR HANDLING
//! ==============
//! A remote lock or unlock that contradicts a lock held by this participant
//! is a protocol desync: it is logged at error level, rejected, and the
//! local state is kept.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::board::object::{ObjectId, ParticipantId};
use crate::board::store::InteractionGuard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub object_id: ObjectId,
    pub owner_id: ParticipantId,
    #[serde(default)]
    pub owner_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedBySelf,
    LockedByOther(ParticipantId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("object {object_id} is being edited by {owner}")]
    HeldByOther { object_id: ObjectId, owner: ParticipantId },
    #[error("lock desync on {object_id}: {sender} claims an object held locally")]
    Desync { object_id: ObjectId, sender: ParticipantId },
}

/// Result of a local edit-start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditStart {
    /// Newly acquired; broadcast this lock.
    Acquired(Lock),
    /// Already ours; nothing to broadcast.
    AlreadyHeld,
}

#[derive(Debug)]
pub struct LockCoordinator {
    self_id: ParticipantId,
    label: String,
    locks: HashMap<ObjectId, Lock>,
}

impl LockCoordinator {
    #[must_use]
    pub fn new(self_id: ParticipantId, label: impl Into<String>) -> Self {
        Self { self_id, label: label.into(), locks: HashMap::new() }
    }

    #[must_use]
    pub fn self_id(&self) -> ParticipantId {
        self.self_id
    }

    #[must_use]
    pub fn state(&self, object_id: ObjectId) -> LockState {
        match self.locks.get(&object_id) {
            None => LockState::Unlocked,
            Some(lock) if lock.owner_id == self.self_id => LockState::LockedBySelf,
            Some(lock) => LockState::LockedByOther(lock.owner_id),
        }
    }

    /// Every lock this participant knows about.
    #[must_use]
    pub fn known_locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.locks.values().cloned().collect();
        locks.sort_by_key(|lock| lock.object_id);
        locks
    }

    /// Locks held by this participant; the answer to a lock state request.
    #[must_use]
    pub fn held_locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self
            .locks
            .values()
            .filter(|lock| lock.owner_id == self.self_id)
            .cloned()
            .collect();
        locks.sort_by_key(|lock| lock.object_id);
        locks
    }

    // =========================================================================
    // LOCAL TRANSITIONS
    // =========================================================================

    /// Start an exclusive edit.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::HeldByOther`] when someone else holds the object;
    /// the edit must not start.
    pub fn begin_edit(&mut self, object_id: ObjectId) -> Result<EditStart, LockError> {
        match self.state(object_id) {
            LockState::LockedByOther(owner) => Err(LockError::HeldByOther { object_id, owner }),
            LockState::LockedBySelf => Ok(EditStart::AlreadyHeld),
            LockState::Unlocked => {
                let lock = Lock { object_id, owner_id: self.self_id, owner_label: self.label.clone() };
                self.locks.insert(object_id, lock.clone());
                Ok(EditStart::Acquired(lock))
            }
        }
    }

    /// End an exclusive edit. Returns the released lock for broadcasting, or
    /// `None` if this participant did not hold it.
    pub fn end_edit(&mut self, object_id: ObjectId) -> Option<Lock> {
        if self.state(object_id) != LockState::LockedBySelf {
            return None;
        }
        self.locks.remove(&object_id)
    }

    /// Drop whatever is known about a deleted object.
    pub fn forget(&mut self, object_id: ObjectId) -> Option<Lock> {
        self.locks.remove(&object_id)
    }

    // =========================================================================
    // REMOTE TRANSITIONS
    // =========================================================================

    /// Apply a lock announced by another participant.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Desync`] if this participant holds the object.
    pub fn apply_remote_lock(&mut self, lock: Lock) -> Result<(), LockError> {
        if lock.owner_id == self.self_id {
            debug!(object_id = %lock.object_id, "ignoring own lock echo");
            return Ok(());
        }
        match self.state(lock.object_id) {
            LockState::LockedBySelf => {
                error!(object_id = %lock.object_id, sender = %lock.owner_id, "remote lock on object held locally");
                Err(LockError::Desync { object_id: lock.object_id, sender: lock.owner_id })
            }
            LockState::LockedByOther(owner) if owner != lock.owner_id => {
                warn!(object_id = %lock.object_id, previous = %owner, next = %lock.owner_id, "lock changed hands without unlock");
                self.locks.insert(lock.object_id, lock);
                Ok(())
            }
            LockState::LockedByOther(_) | LockState::Unlocked => {
                self.locks.insert(lock.object_id, lock);
                Ok(())
            }
        }
    }

    /// Apply an unlock announced by another participant. An unlock from
    /// someone other than the recorded owner is logged and still honoured.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Desync`] if this participant holds the object.
    pub fn apply_remote_unlock(&mut self, object_id: ObjectId, sender: ParticipantId) -> Result<(), LockError> {
        match self.state(object_id) {
            LockState::LockedBySelf => {
                error!(%object_id, %sender, "remote unlock on object held locally");
                Err(LockError::Desync { object_id, sender })
            }
            LockState::LockedByOther(owner) => {
                if owner != sender {
                    warn!(%object_id, %owner, %sender, "unlock from a participant that does not hold the lock");
                }
                self.locks.remove(&object_id);
                Ok(())
            }
            LockState::Unlocked => Ok(()),
        }
    }

    /// Apply a peer's answer to a lock state request. Desyncs are skipped
    /// and counted.
    pub fn apply_lock_state(&mut self, locks: Vec<Lock>) -> usize {
        let mut desyncs = 0;
        for lock in locks {
            if self.apply_remote_lock(lock).is_err() {
                desyncs += 1;
            }
        }
        desyncs
    }
}

impl InteractionGuard for LockCoordinator {
    fn is_locally_held(&self, id: ObjectId) -> bool {
        self.state(id) == LockState::LockedBySelf
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
