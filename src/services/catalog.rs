//! Metadata catalog collaborator.
//!
//! The coordinator only ever inserts: one `MediaItem` per successful completion.

use crate::models::media::{MediaItem, NewMediaItem};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("media item for `{0}` already exists")]
    Duplicate(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem, CatalogError>;
}

/// Catalog backed by the `media_items` table.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get_media(&self, id: Uuid) -> Result<Option<MediaItem>, CatalogError> {
        let item = sqlx::query_as::<_, MediaItem>(
            r#"
            SELECT id, filename, content_type, size_bytes, storage_key, etag, owner_id, surface, created_at
            FROM media_items
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(item)
    }

    pub async fn count_for_key(&self, storage_key: &str) -> Result<i64, CatalogError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM media_items WHERE storage_key = ?")
            .bind(storage_key)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MetadataCatalog for SqliteCatalog {
    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem, CatalogError> {
        let size_bytes = i64::try_from(item.size_bytes)
            .map_err(|_| CatalogError::Unavailable(format!("size {} out of range", item.size_bytes)))?;

        let result = sqlx::query_as::<_, MediaItem>(
            r#"
            INSERT INTO media_items
                (id, filename, content_type, size_bytes, storage_key, etag, owner_id, surface, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, filename, content_type, size_bytes, storage_key, etag, owner_id, surface, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&item.filename)
        .bind(&item.content_type)
        .bind(size_bytes)
        .bind(&item.storage_key)
        .bind(&item.etag)
        .bind(&item.owner_id)
        .bind(&item.surface)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(media) => Ok(media),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(CatalogError::Duplicate(item.storage_key))
            }
            Err(err) => Err(err.into()),
        }
    }
}
