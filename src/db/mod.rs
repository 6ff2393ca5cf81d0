//! Durable storage for canvas objects.
//!
//! SYSTEM CONTEXT
//! ==============
//! Only the authority writes through [`DurableStore`]; peers may use it to
//! read the initial board. The layout is one bucket per object type, each a
//! mapping `id -> serialized object`. Bucket saves are per-key upserts and
//! deletes are per-key removals, so a save never drops a sibling and a
//! delete never touches one.

pub mod memory;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::board::object::{CanvasObject, ObjectId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("object {id} still present in {bucket} after delete")]
    StillPresent { bucket: String, id: ObjectId },
}

/// Bucketed object storage owned by the authority.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Every stored object, across all buckets.
    async fn load_all(&self) -> Result<Vec<CanvasObject>, StorageError>;

    /// Upsert `objects` into `bucket`.
    async fn save_bucket(&self, bucket: &str, objects: &[CanvasObject]) -> Result<(), StorageError>;

    /// Remove one key. Removing an absent key is not an error.
    async fn delete_key(&self, bucket: &str, id: ObjectId) -> Result<(), StorageError>;

    async fn contains_key(&self, bucket: &str, id: ObjectId) -> Result<bool, StorageError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

/// `canvas_objects` rows scoped to one room.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    room: String,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool, room: impl Into<String>) -> Self {
        Self { pool, room: room.into() }
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn load_all(&self) -> Result<Vec<CanvasObject>, StorageError> {
        let rows = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT body FROM canvas_objects WHERE room = $1 ORDER BY bucket, id",
        )
        .bind(&self.room)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_value(body).map_err(StorageError::from))
            .collect()
    }

    async fn save_bucket(&self, bucket: &str, objects: &[CanvasObject]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for object in objects {
            let body = serde_json::to_value(object)?;
            sqlx::query(
                "INSERT INTO canvas_objects (room, bucket, id, body, updated_at) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (room, bucket, id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()",
            )
            .bind(&self.room)
            .bind(bucket)
            .bind(object.id)
            .bind(&body)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_key(&self, bucket: &str, id: ObjectId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM canvas_objects WHERE room = $1 AND bucket = $2 AND id = $3")
            .bind(&self.room)
            .bind(bucket)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn contains_key(&self, bucket: &str, id: ObjectId) -> Result<bool, StorageError> {
        let row = sqlx::query_as::<_, (Uuid,)>(
            "SELECT id FROM canvas_objects WHERE room = $1 AND bucket = $2 AND id = $3",
        )
        .bind(&self.room)
        .bind(bucket)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "mod_test.rs"]
mod tests;
