use super::*;
use crate::board::object::{Data, Position};

fn card() -> CanvasObject {
    CanvasObject::new("card", Position::default(), Data::new())
}

#[tokio::test]
async fn save_upserts_without_dropping_siblings() {
    let store = MemoryStore::new();
    let (a, b) = (card(), card());
    store.save_bucket("card", &[a.clone()]).await.unwrap();
    store.save_bucket("card", &[b.clone()]).await.unwrap();

    assert_eq!(store.len().await, 2);
    assert_eq!(store.save_count().await, 2);
    assert_eq!(store.get("card", a.id).await, Some(a));
}

#[tokio::test]
async fn delete_is_per_key_and_tolerates_absence() {
    let store = MemoryStore::new();
    let (a, b) = (card(), card());
    store.seed([a.clone(), b.clone()]).await;

    store.delete_key("card", a.id).await.unwrap();
    store.delete_key("card", a.id).await.unwrap();
    assert!(!store.contains_key("card", a.id).await.unwrap());
    assert!(store.contains_key("card", b.id).await.unwrap());
}

#[tokio::test]
async fn injected_failures_are_consumed() {
    let store = MemoryStore::new();
    store.fail_saves(1).await;
    assert!(store.save_bucket("card", &[card()]).await.is_err());
    assert!(store.save_bucket("card", &[card()]).await.is_ok());
}

#[tokio::test]
async fn ignored_delete_leaves_key_behind() {
    let store = MemoryStore::new();
    let a = card();
    store.seed([a.clone()]).await;
    store.ignore_deletes(1).await;

    store.delete_key("card", a.id).await.unwrap();
    assert!(store.contains_key("card", a.id).await.unwrap());
    store.delete_key("card", a.id).await.unwrap();
    assert!(store.is_empty().await);
    assert_eq!(store.delete_count().await, 2);
}
