use uuid::Uuid;

use super::*;

fn coordinator() -> LockCoordinator {
    LockCoordinator::new(Uuid::new_v4(), "me")
}

fn remote(object_id: ObjectId, owner_id: ParticipantId) -> Lock {
    Lock { object_id, owner_id, owner_label: "them".into() }
}

#[test]
fn begin_edit_acquires_once() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();

    let EditStart::Acquired(lock) = locks.begin_edit(id).unwrap() else {
        panic!("expected acquisition");
    };
    assert_eq!(lock.owner_id, locks.self_id());
    assert_eq!(lock.owner_label, "me");
    assert_eq!(locks.state(id), LockState::LockedBySelf);
    assert_eq!(locks.begin_edit(id).unwrap(), EditStart::AlreadyHeld);
}

#[test]
fn begin_edit_refused_when_held_by_other() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    let other = Uuid::new_v4();
    locks.apply_remote_lock(remote(id, other)).unwrap();

    assert_eq!(locks.begin_edit(id), Err(LockError::HeldByOther { object_id: id, owner: other }));
    assert_eq!(locks.state(id), LockState::LockedByOther(other));
}

#[test]
fn end_edit_only_releases_own_locks() {
    let mut locks = coordinator();
    let mine = Uuid::new_v4();
    let theirs = Uuid::new_v4();
    locks.begin_edit(mine).unwrap();
    locks.apply_remote_lock(remote(theirs, Uuid::new_v4())).unwrap();

    assert!(locks.end_edit(mine).is_some());
    assert!(locks.end_edit(mine).is_none());
    assert!(locks.end_edit(theirs).is_none());
    assert_eq!(locks.state(mine), LockState::Unlocked);
    assert!(matches!(locks.state(theirs), LockState::LockedByOther(_)));
}

#[test]
fn remote_lock_on_own_object_is_desync() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    let other = Uuid::new_v4();
    locks.begin_edit(id).unwrap();

    assert_eq!(
        locks.apply_remote_lock(remote(id, other)),
        Err(LockError::Desync { object_id: id, sender: other })
    );
    assert_eq!(locks.state(id), LockState::LockedBySelf);
}

#[test]
fn remote_unlock_on_own_object_is_desync() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    locks.begin_edit(id).unwrap();

    assert!(locks.apply_remote_unlock(id, Uuid::new_v4()).is_err());
    assert_eq!(locks.state(id), LockState::LockedBySelf);
}

#[test]
fn remote_unlock_clears_foreign_lock() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    let other = Uuid::new_v4();
    locks.apply_remote_lock(remote(id, other)).unwrap();
    locks.apply_remote_unlock(id, other).unwrap();
    assert_eq!(locks.state(id), LockState::Unlocked);
    locks.apply_remote_unlock(id, other).unwrap();
}

#[test]
fn unlock_from_non_owner_still_clears_lock() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    let owner = Uuid::new_v4();
    locks.apply_remote_lock(remote(id, owner)).unwrap();

    locks.apply_remote_unlock(id, Uuid::new_v4()).unwrap();
    assert_eq!(locks.state(id), LockState::Unlocked);
}

#[test]
fn own_lock_echo_is_ignored() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    locks.apply_remote_lock(remote(id, locks.self_id())).unwrap();
    assert_eq!(locks.state(id), LockState::Unlocked);
}

#[test]
fn foreign_lock_can_change_hands() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
    locks.apply_remote_lock(remote(id, first)).unwrap();
    locks.apply_remote_lock(remote(id, second)).unwrap();
    assert_eq!(locks.state(id), LockState::LockedByOther(second));
}

#[test]
fn held_locks_excludes_foreign() {
    let mut locks = coordinator();
    let mine = Uuid::new_v4();
    locks.begin_edit(mine).unwrap();
    locks.apply_remote_lock(remote(Uuid::new_v4(), Uuid::new_v4())).unwrap();

    let held = locks.held_locks();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].object_id, mine);
    assert_eq!(locks.known_locks().len(), 2);
}

#[test]
fn stuck_lock_is_not_reported_by_bystander() {
    // B locks Z and vanishes; A saw the lock but never held it.
    let mut a = coordinator();
    let z = Uuid::new_v4();
    let b = Uuid::new_v4();
    a.apply_remote_lock(remote(z, b)).unwrap();

    assert_eq!(a.state(z), LockState::LockedByOther(b));
    assert!(a.held_locks().is_empty());
}

#[test]
fn lock_state_response_is_applied() {
    let mut joiner = coordinator();
    let holder = Uuid::new_v4();
    let ids = [Uuid::new_v4(), Uuid::new_v4()];
    let desyncs = joiner.apply_lock_state(ids.iter().map(|id| remote(*id, holder)).collect());

    assert_eq!(desyncs, 0);
    for id in ids {
        assert_eq!(joiner.state(id), LockState::LockedByOther(holder));
    }
}

#[test]
fn lock_state_response_counts_desyncs() {
    let mut joiner = coordinator();
    let id = Uuid::new_v4();
    joiner.begin_edit(id).unwrap();
    assert_eq!(joiner.apply_lock_state(vec![remote(id, Uuid::new_v4())]), 1);
}

#[test]
fn forget_drops_any_lock() {
    let mut locks = coordinator();
    let id = Uuid::new_v4();
    locks.begin_edit(id).unwrap();
    assert!(locks.forget(id).is_some());
    assert_eq!(locks.state(id), LockState::Unlocked);
}

#[test]
fn guard_reports_only_local_interaction() {
    let mut locks = coordinator();
    let (mine, theirs) = (Uuid::new_v4(), Uuid::new_v4());
    locks.begin_edit(mine).unwrap();
    locks.apply_remote_lock(remote(theirs, Uuid::new_v4())).unwrap();
    assert!(locks.is_locally_held(mine));
    assert!(!locks.is_locally_held(theirs));
}

#[test]
fn lock_serializes_camel_case() {
    let lock = remote(Uuid::nil(), Uuid::nil());
    let json = serde_json::to_value(&lock).unwrap();
    assert!(json.get("objectId").is_some());
    assert!(json.get("ownerLabel").is_some());
}
