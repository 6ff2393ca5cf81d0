//! In-process durable store.
//!
//! Used when no `DATABASE_URL` is configured and throughout the tests. A
//! fault plan can make the next N saves or deletes fail, or make deletes
//! silently leave the key behind, to exercise the retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::board::object::{CanvasObject, ObjectId};
use crate::db::{DurableStore, StorageError};

#[derive(Debug, Default)]
struct Faults {
    failing_saves: usize,
    failing_deletes: usize,
    ignored_deletes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeMap<String, HashMap<ObjectId, CanvasObject>>,
    faults: Faults,
    saves: usize,
    deletes: usize,
}

/// Bucketed map behind an async mutex. Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed objects directly, bypassing fault injection.
    pub async fn seed(&self, objects: impl IntoIterator<Item = CanvasObject>) {
        let mut inner = self.inner.lock().await;
        for object in objects {
            inner
                .buckets
                .entry(object.kind.clone())
                .or_default()
                .insert(object.id, object);
        }
    }

    /// Fail the next `count` bucket saves.
    pub async fn fail_saves(&self, count: usize) {
        self.inner.lock().await.faults.failing_saves = count;
    }

    /// Fail the next `count` deletes.
    pub async fn fail_deletes(&self, count: usize) {
        self.inner.lock().await.faults.failing_deletes = count;
    }

    /// Report success for the next `count` deletes without removing the key.
    pub async fn ignore_deletes(&self, count: usize) {
        self.inner.lock().await.faults.ignored_deletes = count;
    }

    pub async fn get(&self, bucket: &str, id: ObjectId) -> Option<CanvasObject> {
        self.inner
            .lock()
            .await
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(&id).cloned())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.buckets.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Successful bucket saves so far.
    pub async fn save_count(&self) -> usize {
        self.inner.lock().await.saves
    }

    /// Delete calls that reached the store so far.
    pub async fn delete_count(&self) -> usize {
        self.inner.lock().await.deletes
    }
}

fn take_fault(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<CanvasObject>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .buckets
            .values()
            .flat_map(|objects| objects.values().cloned())
            .collect())
    }

    async fn save_bucket(&self, bucket: &str, objects: &[CanvasObject]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if take_fault(&mut inner.faults.failing_saves) {
            return Err(StorageError::Unavailable(format!("injected save failure for {bucket}")));
        }
        let entries = inner.buckets.entry(bucket.to_owned()).or_default();
        for object in objects {
            entries.insert(object.id, object.clone());
        }
        inner.saves += 1;
        Ok(())
    }

    async fn delete_key(&self, bucket: &str, id: ObjectId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.deletes += 1;
        if take_fault(&mut inner.faults.failing_deletes) {
            return Err(StorageError::Unavailable(format!("injected delete failure for {id}")));
        }
        if take_fault(&mut inner.faults.ignored_deletes) {
            return Ok(());
        }
        if let Some(objects) = inner.buckets.get_mut(bucket) {
            objects.remove(&id);
        }
        Ok(())
    }

    async fn contains_key(&self, bucket: &str, id: ObjectId) -> Result<bool, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.buckets.get(bucket).is_some_and(|objects| objects.contains_key(&id)))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
