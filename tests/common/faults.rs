//! Collaborators that can be told to fail.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use upload_coordinator::{
    models::media::{MediaItem, NewMediaItem},
    services::{
        catalog::{CatalogError, MetadataCatalog, SqliteCatalog},
        object_store::{CompletedPart, ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject},
        storage_service::LocalObjectStore,
    },
};

/// Wraps the SQLite catalog; `fail` makes every insert error out.
#[allow(dead_code)]
pub struct FlakyCatalog {
    pub inner: SqliteCatalog,
    pub fail: AtomicBool,
    pub inserts: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyCatalog {
    pub fn new(inner: SqliteCatalog) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataCatalog for FlakyCatalog {
    async fn insert_media(&self, item: NewMediaItem) -> Result<MediaItem, CatalogError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("injected catalog failure".into()));
        }
        let media = self.inner.insert_media(item).await?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(media)
    }
}

/// Wraps the local object store with per-operation failure switches and call counters.
#[allow(dead_code)]
pub struct FlakyStorage {
    pub inner: Arc<LocalObjectStore>,
    pub fail_create: AtomicBool,
    pub fail_finalize: AtomicBool,
    pub fail_delete: AtomicBool,
    pub creates: AtomicUsize,
    pub aborts: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyStorage {
    pub fn new(inner: Arc<LocalObjectStore>) -> Self {
        Self {
            inner,
            fail_create: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> ObjectStoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FlakyStorage {
    async fn create_multipart(&self, key: &str, content_type: &str) -> ObjectStoreResult<String> {
        Self::injected(&self.fail_create, "create")?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_multipart(key, content_type).await
    }

    async fn presign_part(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires_in: Duration,
    ) -> ObjectStoreResult<String> {
        self.inner
            .presign_part(storage_upload_id, part_number, max_bytes, expires_in)
            .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        storage_upload_id: &str,
        parts: &[CompletedPart],
    ) -> ObjectStoreResult<StoredObject> {
        Self::injected(&self.fail_finalize, "finalize")?;
        self.inner
            .complete_multipart(key, storage_upload_id, parts)
            .await
    }

    async fn abort_multipart(&self, key: &str, storage_upload_id: &str) -> ObjectStoreResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart(key, storage_upload_id).await
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> ObjectStoreResult<StoredObject> {
        Self::injected(&self.fail_finalize, "put")?;
        self.inner.put_object(key, content_type, data).await
    }

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail_delete, "delete")?;
        self.inner.delete_object(key).await
    }

    fn object_url(&self, key: &str) -> String {
        self.inner.object_url(key)
    }
}
