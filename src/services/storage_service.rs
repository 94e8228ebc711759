//! src/services/storage_service.rs
//!
//! LocalObjectStore: object storage on local disk with native multipart uploads.
//! Payloads are sharded beneath `base_path/objects/{shard}/{shard}/{key}`; a small JSON
//! head next to them (under `base_path/heads`) records content type, size and ETag.
//! Multipart uploads keep their parts in `base_path/multipart/{storage_upload_id}` until
//! they are completed or aborted.

use crate::services::{
    object_store::{
        CompletedPart, ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject,
        normalize_etag,
    },
    presign::{PartUrlSigner, SignatureError},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_PART_NUMBER: u32 = 10_000;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata persisted next to each object payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHead {
    pub content_type: String,
    pub size_bytes: u64,
    pub etag: String,
}

/// Bookkeeping for an open multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultipartManifest {
    key: String,
    content_type: String,
}

/// Local filesystem object store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where everything is stored.
    pub base_path: PathBuf,

    signer: PartUrlSigner,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, signer: PartUrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Storage upload ids are UUIDs we minted; anything else never names a directory.
    fn ensure_upload_id_safe(storage_upload_id: &str) -> ObjectStoreResult<()> {
        Uuid::parse_str(storage_upload_id)
            .map(|_| ())
            .map_err(|_| ObjectStoreError::NoSuchUpload(storage_upload_id.to_string()))
    }

    /// Two-level shard identifiers for an object key: the first two bytes of MD5(key).
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn sharded_path(&self, root: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.join(root);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.sharded_path("objects", key)
    }

    fn head_path(&self, key: &str) -> PathBuf {
        let mut path = self.sharded_path("heads", key);
        path.as_mut_os_string().push(".json");
        path
    }

    fn multipart_dir(&self, storage_upload_id: &str) -> PathBuf {
        self.base_path.join("multipart").join(storage_upload_id)
    }

    fn part_path(&self, storage_upload_id: &str, part_number: u32) -> PathBuf {
        self.multipart_dir(storage_upload_id)
            .join(format!("{:05}.part", part_number))
    }

    async fn read_manifest(&self, storage_upload_id: &str) -> ObjectStoreResult<MultipartManifest> {
        Self::ensure_upload_id_safe(storage_upload_id)?;
        let path = self.multipart_dir(storage_upload_id).join("upload.json");
        let raw = fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NoSuchUpload(storage_upload_id.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        serde_json::from_slice(&raw).map_err(|err| ObjectStoreError::Io(io::Error::other(err)))
    }

    async fn write_head(&self, key: &str, head: &ObjectHead) -> ObjectStoreResult<()> {
        let path = self.head_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec(head).map_err(io::Error::other)?;
        fs::write(&path, raw).await?;
        Ok(())
    }

    /// Stream bytes into `final_path` through a temporary file.
    ///
    /// - The parent directory must already exist.
    /// - Computes MD5 and size while streaming.
    /// - Stops with `ErrorKind::FileTooLarge` once more than `max_bytes` arrive.
    /// - fsyncs before atomically renaming into place.
    /// - Removes the temporary file on any error.
    async fn write_stream<S>(
        &self,
        final_path: &Path,
        stream: S,
        max_bytes: Option<u64>,
    ) -> ObjectStoreResult<(u64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectStoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if let Some(max) = max_bytes.filter(|max| size_bytes > *max) {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(io::Error::new(
                    ErrorKind::FileTooLarge,
                    format!("body exceeds {} bytes", max),
                )));
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }
        Self::persist(file, &tmp_path, final_path).await?;

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Flush, fsync and rename a finished temporary file into place.
    async fn persist(mut file: File, tmp_path: &Path, final_path: &Path) -> ObjectStoreResult<()> {
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(tmp_path, final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(final_path).await?;
                fs::rename(tmp_path, final_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }
        Ok(())
    }

    /// Verify a pre-signed part URL.
    pub fn verify_part_signature(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires: i64,
        signature: &str,
    ) -> Result<(), SignatureError> {
        self.signer.verify(
            storage_upload_id,
            part_number,
            max_bytes,
            expires,
            signature,
            Utc::now(),
        )
    }

    /// Store one part of an open multipart upload; re-uploading a part number replaces it.
    ///
    /// Returns the part's ETag (hex MD5 of its bytes). A body over `max_bytes` is discarded.
    pub async fn upload_part<S>(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        stream: S,
    ) -> ObjectStoreResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(ObjectStoreError::InvalidPart {
                part_number,
                reason: format!("part number must be between 1 and {}", MAX_PART_NUMBER),
            });
        }
        self.read_manifest(storage_upload_id).await?;
        let path = self.part_path(storage_upload_id, part_number);
        // An abort may remove the upload directory mid-write; it is never recreated here.
        let (size_bytes, etag) = self
            .write_stream(&path, stream, Some(max_bytes))
            .await
            .map_err(|err| match err {
                ObjectStoreError::Io(io) if io.kind() == ErrorKind::NotFound => {
                    ObjectStoreError::NoSuchUpload(storage_upload_id.to_string())
                }
                ObjectStoreError::Io(io) if io.kind() == ErrorKind::FileTooLarge => {
                    ObjectStoreError::InvalidPart {
                        part_number,
                        reason: format!("part exceeds {} bytes", max_bytes),
                    }
                }
                other => other,
            })?;
        debug!(
            storage_upload_id,
            part_number, size_bytes, "stored multipart part"
        );
        Ok(etag)
    }

    /// Open an object for reading.
    pub async fn get_object_reader(&self, key: &str) -> ObjectStoreResult<(ObjectHead, File)> {
        Self::ensure_key_safe(key)?;
        let raw = fs::read(self.head_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let head: ObjectHead =
            serde_json::from_slice(&raw).map_err(|err| ObjectStoreError::Io(io::Error::other(err)))?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        Ok((head, file))
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn remove_file_if_present(path: &Path) -> ObjectStoreResult<bool> {
        match fs::remove_file(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn create_multipart(&self, key: &str, content_type: &str) -> ObjectStoreResult<String> {
        Self::ensure_key_safe(key)?;
        let storage_upload_id = Uuid::new_v4().to_string();
        let dir = self.multipart_dir(&storage_upload_id);
        fs::create_dir_all(&dir).await?;
        let manifest = MultipartManifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
        };
        let raw = serde_json::to_vec(&manifest).map_err(io::Error::other)?;
        fs::write(dir.join("upload.json"), raw).await?;
        debug!(storage_upload_id = %storage_upload_id, key, "created multipart upload");
        Ok(storage_upload_id)
    }

    async fn presign_part(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires_in: Duration,
    ) -> ObjectStoreResult<String> {
        Self::ensure_upload_id_safe(storage_upload_id)?;
        Ok(self.signer.part_url(
            storage_upload_id,
            part_number,
            max_bytes,
            expires_in,
            Utc::now(),
        ))
    }

    /// Concatenate the listed parts into the final object.
    ///
    /// Each part's bytes are re-hashed and must match the ETag the caller reported.
    /// The resulting ETag follows the multipart convention `md5(part digests)-N`.
    async fn complete_multipart(
        &self,
        key: &str,
        storage_upload_id: &str,
        parts: &[CompletedPart],
    ) -> ObjectStoreResult<StoredObject> {
        Self::ensure_key_safe(key)?;
        let manifest = self.read_manifest(storage_upload_id).await?;
        if manifest.key != key {
            return Err(ObjectStoreError::NoSuchUpload(storage_upload_id.to_string()));
        }
        if parts.is_empty() {
            return Err(ObjectStoreError::InvalidPartOrder);
        }
        if parts
            .windows(2)
            .any(|pair| pair[1].part_number <= pair[0].part_number)
        {
            return Err(ObjectStoreError::InvalidPartOrder);
        }

        let final_path = self.object_path(key);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut composite = Context::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        for part in parts {
            let result = async {
                let mut input = File::open(self.part_path(storage_upload_id, part.part_number))
                    .await
                    .map_err(|err| {
                        if err.kind() == ErrorKind::NotFound {
                            ObjectStoreError::InvalidPart {
                                part_number: part.part_number,
                                reason: "part was never uploaded".into(),
                            }
                        } else {
                            ObjectStoreError::Io(err)
                        }
                    })?;
                let mut digest = Context::new();
                loop {
                    let read = input.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    digest.consume(&buf[..read]);
                    out.write_all(&buf[..read]).await?;
                    size_bytes += read as u64;
                }
                let digest = digest.compute();
                if format!("{:x}", digest) != normalize_etag(&part.etag) {
                    return Err(ObjectStoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: "entity tag does not match stored part".into(),
                    });
                }
                composite.consume(digest.0);
                Ok::<(), ObjectStoreError>(())
            }
            .await;
            if let Err(err) = result {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        Self::persist(out, &tmp_path, &final_path).await?;

        let etag = format!("{:x}-{}", composite.compute(), parts.len());
        self.write_head(
            key,
            &ObjectHead {
                content_type: manifest.content_type,
                size_bytes,
                etag: etag.clone(),
            },
        )
        .await?;

        if let Err(err) = fs::remove_dir_all(self.multipart_dir(storage_upload_id)).await {
            debug!(
                "failed to remove parts of completed upload {}: {}",
                storage_upload_id, err
            );
        }

        Ok(StoredObject {
            key: key.to_string(),
            size_bytes,
            etag,
        })
    }

    async fn abort_multipart(&self, _key: &str, storage_upload_id: &str) -> ObjectStoreResult<()> {
        Self::ensure_upload_id_safe(storage_upload_id)?;
        match fs::remove_dir_all(self.multipart_dir(storage_upload_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ObjectStoreError::NoSuchUpload(storage_upload_id.to_string()))
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> ObjectStoreResult<StoredObject> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let (size_bytes, etag) = self
            .write_stream(&path, futures::stream::once(async move { Ok(data) }), None)
            .await?;
        self.write_head(
            key,
            &ObjectHead {
                content_type: content_type.to_string(),
                size_bytes,
                etag: etag.clone(),
            },
        )
        .await?;
        Ok(StoredObject {
            key: key.to_string(),
            size_bytes,
            etag,
        })
    }

    /// Remove an object and its head, then prune empty shard directories.
    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()> {
        Self::ensure_key_safe(key)?;
        let object_path = self.object_path(key);
        let head_path = self.head_path(key);
        let removed_payload = Self::remove_file_if_present(&object_path).await?;
        let removed_head = Self::remove_file_if_present(&head_path).await?;
        if !removed_payload && !removed_head {
            return Err(ObjectStoreError::ObjectNotFound(key.to_string()));
        }
        debug!("removed object {}", object_path.display());

        for (path, root) in [(&object_path, "objects"), (&head_path, "heads")] {
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent, &self.base_path.join(root)).await;
            }
        }
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/objects/{}", self.signer.base_url(), key)
    }
}
