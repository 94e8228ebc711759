//! Object storage abstraction used by the coordinator.
//!
//! Backends implement both strategies' primitives: native multipart uploads (create,
//! pre-sign part URLs, complete, abort) and single-shot puts, plus delete for
//! compensating cleanup.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("multipart upload `{0}` not found")]
    NoSuchUpload(String),
    #[error("part {part_number} is invalid: {reason}")]
    InvalidPart { part_number: u32, reason: String },
    #[error("parts must be listed in strictly ascending order")]
    InvalidPartOrder,
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// A finalized object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub etag: String,
}

/// A part reference used to finalize a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    /// 1-based storage part number.
    pub part_number: u32,
    #[serde(rename = "eTag")]
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a storage-side multipart upload and return its handle.
    async fn create_multipart(&self, key: &str, content_type: &str) -> ObjectStoreResult<String>;

    /// URL a client can PUT part `part_number` to without going through the server.
    /// Bodies larger than `max_bytes` are refused.
    async fn presign_part(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires_in: Duration,
    ) -> ObjectStoreResult<String>;

    /// Assemble the listed parts (ascending part numbers) into the object at `key`.
    async fn complete_multipart(
        &self,
        key: &str,
        storage_upload_id: &str,
        parts: &[CompletedPart],
    ) -> ObjectStoreResult<StoredObject>;

    /// Discard a multipart upload and every part stored under it.
    async fn abort_multipart(&self, key: &str, storage_upload_id: &str) -> ObjectStoreResult<()>;

    /// Write a whole object.
    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> ObjectStoreResult<StoredObject>;

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()>;

    /// Public URL the finalized object is served from.
    fn object_url(&self, key: &str) -> String;
}

/// Strip the quotes some clients keep around entity tags.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}
