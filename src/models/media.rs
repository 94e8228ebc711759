//! Catalog record for a finished upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A media item in the metadata catalog.
///
/// Written exactly once per successful completion, after the object exists in storage.
/// It carries no reference back to the upload session that produced it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    /// Catalog identifier.
    pub id: Uuid,

    /// Original filename supplied by the uploader.
    pub filename: String,

    /// MIME type declared at initiation and accepted by policy.
    pub content_type: String,

    /// Size of the assembled object in bytes (measured, not declared).
    pub size_bytes: i64,

    /// Object key in storage.
    pub storage_key: String,

    /// Entity tag of the stored object.
    pub etag: Option<String>,

    /// Uploading principal.
    pub owner_id: String,

    /// Surface the upload came from.
    pub surface: String,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a [`MediaItem`].
#[derive(Clone, Debug)]
pub struct NewMediaItem {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub etag: Option<String>,
    pub owner_id: String,
    pub surface: String,
}
