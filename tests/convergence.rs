//! Multi-participant convergence through the in-process relay.
//!
//! Each test runs one authority and a few peers in the same room, all
//! attached with `AppState::join_local`, and waits for their replicas to
//! agree.

use std::sync::Arc;
use std::time::Duration;

use boardsync::board::lock::LockState;
use boardsync::board::object::{CanvasObject, Data, ObjectId, Position};
use boardsync::board::rank::Rank;
use boardsync::board::store::ReorderTarget;
use boardsync::config::PersistConfig;
use boardsync::db::memory::MemoryStore;
use boardsync::services::participant::{ParticipantHandle, ParticipantOptions, spawn_participant};
use boardsync::services::replication::Role;
use boardsync::state::AppState;

const ROOM: &str = "studio";

fn persist() -> PersistConfig {
    PersistConfig {
        debounce: Duration::from_millis(20),
        retries: 3,
        retry_base: Duration::from_millis(5),
        delete_verify_attempts: 3,
    }
}

struct Hub {
    state: AppState,
    store: MemoryStore,
    authority: ParticipantHandle,
}

impl Hub {
    async fn start(store: MemoryStore) -> Self {
        let state = AppState::new(64);
        let options = ParticipantOptions::new(Role::Authority, "authority")
            .with_durable(Arc::new(store.clone()))
            .with_persist(persist());
        let link = state.join_local(ROOM, options.id).await;
        let authority = spawn_participant(link, options).await.unwrap();
        Self { state, store, authority }
    }

    /// Join a peer that reads the current durable board at startup.
    async fn join(&self, label: &str) -> ParticipantHandle {
        let options = ParticipantOptions::new(Role::Peer, label).with_durable(Arc::new(self.store.clone()));
        let link = self.state.join_local(ROOM, options.id).await;
        spawn_participant(link, options).await.unwrap()
    }
}

async fn order(handle: &ParticipantHandle) -> Vec<ObjectId> {
    handle.snapshot().await.unwrap().into_iter().map(|o| o.id).collect()
}

/// Wait until every replica reports `expected` as its draw order.
async fn wait_for_order(handles: &[&ParticipantHandle], expected: &[ObjectId]) {
    for _ in 0..400 {
        let mut agreed = true;
        for handle in handles {
            if order(handle).await != expected {
                agreed = false;
                break;
            }
        }
        if agreed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replicas never converged on {expected:?}");
}

/// Wait until every replica has the same draw order with `len` objects.
async fn wait_for_agreement(handles: &[&ParticipantHandle], len: usize) -> Vec<ObjectId> {
    for _ in 0..400 {
        let first = order(handles[0]).await;
        let mut agreed = first.len() == len;
        for handle in &handles[1..] {
            if !agreed {
                break;
            }
            agreed = order(handle).await == first;
        }
        if agreed {
            return first;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replicas never agreed on {len} objects");
}

async fn wait_for_lock(handle: &ParticipantHandle, id: ObjectId, expected: &LockState) {
    for _ in 0..400 {
        if handle.lock_state(id).await.unwrap() == *expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("lock on {id} never became {expected:?}");
}

async fn card(handle: &ParticipantHandle) -> ObjectId {
    handle.create("card", Position::default(), Data::new()).await.unwrap()
}

#[tokio::test]
async fn moving_up_swaps_draw_order_everywhere() {
    let hub = Hub::start(MemoryStore::new()).await;
    let ana = hub.join("ana").await;
    let bea = hub.join("bea").await;
    let everyone = [&hub.authority, &ana, &bea];

    let x = card(&ana).await;
    let y = card(&ana).await;
    wait_for_order(&everyone, &[x, y]).await;

    ana.reorder(x, ReorderTarget::By(1)).await.unwrap();
    wait_for_order(&everyone, &[y, x]).await;
}

#[tokio::test]
async fn concurrent_moves_converge_on_authority_order() {
    let hub = Hub::start(MemoryStore::new()).await;
    let ana = hub.join("ana").await;
    let bea = hub.join("bea").await;
    let everyone = [&hub.authority, &ana, &bea];

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(card(&hub.authority).await);
    }
    wait_for_order(&everyone, &ids).await;

    let (first, second) = tokio::join!(
        ana.reorder(ids[0], ReorderTarget::Top),
        bea.reorder(ids[1], ReorderTarget::Top),
    );
    first.unwrap();
    second.unwrap();

    let agreed = wait_for_agreement(&everyone, 4).await;
    assert_eq!(&agreed[..2], &[ids[2], ids[3]]);
}

#[tokio::test]
async fn edits_and_deletes_reach_every_replica_and_storage() {
    let hub = Hub::start(MemoryStore::new()).await;
    let ana = hub.join("ana").await;
    let everyone = [&hub.authority, &ana];

    let id = card(&ana).await;
    wait_for_order(&everyone, &[id]).await;

    let mut patch = Data::new();
    patch.insert("title".into(), serde_json::json!("roadmap"));
    ana.update(id, patch).await.unwrap();
    for _ in 0..400 {
        let stored = hub.store.get("card", id).await;
        if stored.is_some_and(|o| o.attributes.get("title") == Some(&serde_json::json!("roadmap"))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stored = hub.store.get("card", id).await.unwrap();
    assert_eq!(stored.attributes.get("title"), Some(&serde_json::json!("roadmap")));

    assert!(ana.delete(id).await.unwrap());
    wait_for_order(&everyone, &[]).await;
    for _ in 0..400 {
        if hub.store.get("card", id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("deleted object still in storage");
}

#[tokio::test]
async fn crashed_editor_leaves_a_stuck_lock() {
    let hub = Hub::start(MemoryStore::new()).await;
    let ana = hub.join("ana").await;
    let bea = hub.join("bea").await;

    let z = card(&ana).await;
    wait_for_order(&[&hub.authority, &ana, &bea], &[z]).await;
    for _ in 0..400 {
        if hub.store.get("card", z).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    bea.begin_edit(z).await.unwrap();
    let held_by_bea = LockState::LockedByOther(bea.id());
    wait_for_lock(&ana, z, &held_by_bea).await;

    // No unlock is ever sent.
    drop(bea);

    let cal = hub.join("cal").await;
    assert_eq!(order(&cal).await, vec![z]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cal.lock_state(z).await.unwrap(), LockState::Unlocked);
    assert_eq!(ana.lock_state(z).await.unwrap(), held_by_bea);
}

#[tokio::test]
async fn duplicate_stored_ranks_are_separated_on_load() {
    let store = MemoryStore::new();
    let mut objects = Vec::new();
    for rank in ["a0", "a0", "a1"] {
        let mut object = CanvasObject::new("card", Position::default(), Data::new());
        object.rank = Some(Rank::parse(rank).unwrap());
        objects.push(object);
    }
    let top = objects[2].id;
    store.seed(objects).await;

    let hub = Hub::start(store).await;
    let snapshot = hub.authority.snapshot().await.unwrap();
    let ranks: Vec<Rank> = snapshot.iter().map(|o| o.rank.clone().unwrap()).collect();
    assert_eq!(ranks.len(), 3);
    assert!(ranks.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(snapshot[2].id, top);

    // Repaired ranks reach storage, so a later joiner loads a clean board.
    for object in &snapshot {
        for _ in 0..400 {
            if hub.store.get("card", object.id).await.is_some_and(|o| o.rank == object.rank) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let ana = hub.join("ana").await;
    let expected: Vec<ObjectId> = snapshot.iter().map(|o| o.id).collect();
    wait_for_order(&[&ana], &expected).await;
}

async fn ranks(handle: &ParticipantHandle) -> Vec<Option<Rank>> {
    handle.snapshot().await.unwrap().into_iter().map(|o| o.rank).collect()
}

#[tokio::test]
async fn concurrent_creates_converge_on_distinct_ranks() {
    let hub = Hub::start(MemoryStore::new()).await;
    let ana = hub.join("ana").await;
    let bea = hub.join("bea").await;
    let everyone = [&hub.authority, &ana, &bea];

    let base = card(&hub.authority).await;
    wait_for_order(&everyone, &[base]).await;

    // Both peers rank their card just above `base`, so the ranks clash.
    let (x, y) = tokio::join!(card(&ana), card(&bea));
    let agreed = wait_for_agreement(&everyone, 3).await;
    assert!(agreed.contains(&x) && agreed.contains(&y));

    for _ in 0..400 {
        let expected = ranks(&hub.authority).await;
        let mut same = true;
        for peer in [&ana, &bea] {
            same &= ranks(peer).await == expected;
        }
        if same {
            assert!(expected.iter().all(Option::is_some));
            assert!(expected.windows(2).all(|pair| pair[0] < pair[1]), "ranks not distinct: {expected:?}");
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replicas never agreed on ranks");
}
