//! UploadCoordinator: initiate, part transport, completion, abort and expiry.
//!
//! All status changes go through the session store's compare-and-set `transition`, so two
//! callers racing on the same upload cannot both finalize it. The strategy only changes how
//! the object is finalized; policy checks and the state machine are shared.

use crate::models::{
    media::{MediaItem, NewMediaItem},
    session::{OwnerContext, ReceivedPart, SessionStatus, UploadSession, part_count},
    surface::{UploadStrategy, UploadSurface},
};
use crate::services::{
    catalog::{CatalogError, MetadataCatalog},
    object_store::{CompletedPart, ObjectStore, ObjectStoreError, StoredObject},
    policy::{MAX_PART_COUNT, PolicyTable, PolicyViolation, sanitize_filename},
    session_store::{SessionStore, StoreError},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("content type `{content_type}` is not allowed for {surface} uploads")]
    InvalidType {
        content_type: String,
        surface: UploadSurface,
    },
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("file is empty")]
    EmptyFile,
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("file would need {parts} parts, more than the {max} allowed")]
    TooManyParts { parts: u64, max: u64 },
    #[error("part index {index} is outside 0..{total_parts}")]
    InvalidPartIndex { index: u32, total_parts: u32 },
    #[error("part {index} has {size} bytes; parts must hold 1..={part_size} bytes")]
    InvalidPartSize {
        index: u32,
        size: u64,
        part_size: u64,
    },
    #[error("invalid part list: {0}")]
    InvalidPartList(String),
    #[error("operation not supported for {0} uploads")]
    StrategyMismatch(UploadStrategy),
    #[error("upload {0} not found")]
    NotFound(Uuid),
    #[error("upload {upload_id} is already {status}")]
    AlreadyTerminal {
        upload_id: Uuid,
        status: SessionStatus,
    },
    #[error("upload {0} is being completed")]
    CompletionInProgress(Uuid),
    #[error("missing parts {0:?}")]
    MissingParts(Vec<u32>),
    #[error("server is buffering too many bytes (limit {limit}); retry later")]
    BufferFull { limit: u64 },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] ObjectStoreError),
    #[error("storage finalize failed: {0}")]
    StorageFinalizeFailed(#[source] ObjectStoreError),
    /// `status` is where the session was left: `uploading` can be completed again,
    /// `aborted` has to start over.
    #[error("metadata write failed: {source}; upload is {status}")]
    MetadataWriteFailed {
        #[source]
        source: CatalogError,
        status: SessionStatus,
    },
    #[error("session store error: {0}")]
    Store(#[source] StoreError),
}

impl UploadError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidType { .. } => "InvalidType",
            UploadError::TooLarge { .. } => "TooLarge",
            UploadError::EmptyFile => "EmptyFile",
            UploadError::InvalidFilename(_) => "InvalidFilename",
            UploadError::TooManyParts { .. } => "TooManyParts",
            UploadError::InvalidPartIndex { .. } => "InvalidPartIndex",
            UploadError::InvalidPartSize { .. } => "InvalidPartSize",
            UploadError::InvalidPartList(_) => "InvalidPartList",
            UploadError::StrategyMismatch(_) => "StrategyMismatch",
            UploadError::NotFound(_) => "NotFound",
            UploadError::AlreadyTerminal { .. } => "AlreadyTerminal",
            UploadError::CompletionInProgress(_) => "CompletionInProgress",
            UploadError::MissingParts(_) => "MissingParts",
            UploadError::BufferFull { .. } => "BufferFull",
            UploadError::StorageUnavailable(_) => "StorageUnavailable",
            UploadError::StorageFinalizeFailed(_) => "StorageFinalizeFailed",
            UploadError::MetadataWriteFailed { .. } => "MetadataWriteFailed",
            UploadError::Store(_) => "SessionStoreError",
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::MetadataWriteFailed { status, .. } => {
                *status == SessionStatus::Uploading
            }
            other => matches!(
                other,
                UploadError::StorageUnavailable(_)
                    | UploadError::StorageFinalizeFailed(_)
                    | UploadError::BufferFull { .. }
                    | UploadError::CompletionInProgress(_)
            ),
        }
    }
}

impl From<PolicyViolation> for UploadError {
    fn from(violation: PolicyViolation) -> Self {
        match violation {
            PolicyViolation::InvalidType {
                content_type,
                surface,
            } => UploadError::InvalidType {
                content_type,
                surface,
            },
            PolicyViolation::TooLarge { size, max, .. } => UploadError::TooLarge { size, max },
            PolicyViolation::EmptyFile => UploadError::EmptyFile,
            PolicyViolation::InvalidFilename(reason) => UploadError::InvalidFilename(reason),
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => UploadError::NotFound(id),
            StoreError::Conflict {
                upload_id,
                status: SessionStatus::Completing,
            } => UploadError::CompletionInProgress(upload_id),
            StoreError::Conflict { upload_id, status } if status.is_terminal() => {
                UploadError::AlreadyTerminal { upload_id, status }
            }
            StoreError::CapacityExceeded { limit } => UploadError::BufferFull { limit },
            other => UploadError::Store(other),
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub part_size_hint: Option<u64>,
    pub surface: UploadSurface,
    /// Defaults to the surface's configured strategy.
    pub strategy: Option<UploadStrategy>,
}

/// Where the client PUTs one part (pre-signed strategy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartUploadUrl {
    pub part_index: u32,
    /// Storage part number, `part_index + 1`. Report this back at completion.
    pub part_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: Uuid,
    pub object_key: String,
    pub strategy: UploadStrategy,
    pub total_parts: u32,
    pub part_size: u64,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_part_upload_urls: Option<Vec<PartUploadUrl>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReceipt {
    pub part_index: u32,
    #[serde(rename = "eTag")]
    pub etag: String,
    pub received_parts: usize,
    pub total_parts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub object_url: String,
    pub metadata_record: MediaItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub upload_id: Uuid,
    pub status: SessionStatus,
    pub strategy: UploadStrategy,
    pub object_key: String,
    pub total_parts: u32,
    pub part_size: u64,
    pub received_parts: Vec<u32>,
    pub missing_parts: Vec<u32>,
    pub received_bytes: u64,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionProgress {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.upload_id,
            status: session.status,
            strategy: session.strategy,
            object_key: session.object_key.clone(),
            total_parts: session.total_parts,
            part_size: session.part_size,
            received_parts: session.received_parts.keys().copied().collect(),
            missing_parts: if session.status.is_terminal() {
                Vec::new()
            } else {
                session.missing_parts()
            },
            received_bytes: session.received_bytes(),
            expires_at: session.expires_at,
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long a session may stay open; also how long tombstones are kept.
    pub session_ttl: Duration,
    /// Lifetime of pre-signed part URLs (never longer than the session).
    pub presign_expiry: Duration,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    storage: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    catalog: Arc<dyn MetadataCatalog>,
    policies: Arc<PolicyTable>,
    settings: CoordinatorSettings,
}

impl UploadCoordinator {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        catalog: Arc<dyn MetadataCatalog>,
        policies: PolicyTable,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            storage,
            sessions,
            catalog,
            policies: Arc::new(policies),
            settings,
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Validate, plan the parts and open a session.
    ///
    /// Nothing touches storage until the request has passed policy.
    pub async fn initiate(
        &self,
        owner_id: &str,
        request: InitiateRequest,
    ) -> Result<InitiateResponse, UploadError> {
        self.policies.validate(
            &request.filename,
            &request.content_type,
            request.size,
            request.surface,
        )?;
        let policy = self.policies.policy(request.surface);

        let part_size = policy.effective_part_size(request.part_size_hint);
        let parts = part_count(request.size, part_size);
        if parts > MAX_PART_COUNT {
            return Err(UploadError::TooManyParts {
                parts,
                max: MAX_PART_COUNT,
            });
        }
        // Bounded by MAX_PART_COUNT above.
        let total_parts = parts as u32;
        let strategy = request.strategy.unwrap_or(policy.default_strategy);

        let upload_id = Uuid::new_v4();
        let object_key = format!(
            "{}/{}/{}",
            policy.key_prefix,
            upload_id,
            sanitize_filename(&request.filename)
        );

        let (storage_upload_id, urls) = match strategy {
            UploadStrategy::Buffered => (None, None),
            UploadStrategy::Presigned => {
                let storage_upload_id = self
                    .storage
                    .create_multipart(&object_key, &request.content_type)
                    .await
                    .map_err(UploadError::StorageUnavailable)?;
                let max_part_bytes = part_size.min(policy.max_file_size);
                match self
                    .presign_all(&storage_upload_id, total_parts, max_part_bytes)
                    .await
                {
                    Ok(urls) => (Some(storage_upload_id), Some(urls)),
                    Err(err) => {
                        self.abort_storage_upload(&object_key, &storage_upload_id, upload_id)
                            .await;
                        return Err(UploadError::StorageUnavailable(err));
                    }
                }
            }
        };

        let now = Utc::now();
        let session = UploadSession {
            upload_id,
            object_key: object_key.clone(),
            filename: request.filename,
            content_type: request.content_type,
            declared_size: request.size,
            part_size,
            total_parts,
            strategy,
            storage_upload_id: storage_upload_id.clone(),
            received_parts: Default::default(),
            status: SessionStatus::Initiated,
            owner: OwnerContext {
                owner_id: owner_id.to_string(),
                surface: request.surface,
            },
            created_at: now,
            updated_at: now,
            expires_at: now + to_time_delta(self.settings.session_ttl),
        };
        let expires_at = session.expires_at;

        if let Err(err) = self.sessions.insert(session).await {
            if let Some(storage_upload_id) = &storage_upload_id {
                self.abort_storage_upload(&object_key, storage_upload_id, upload_id)
                    .await;
            }
            return Err(err.into());
        }

        info!(
            upload_id = %upload_id,
            object_key = %object_key,
            surface = %request.surface,
            strategy = %strategy,
            size = request.size,
            part_size,
            total_parts,
            "Initiated upload"
        );

        Ok(InitiateResponse {
            upload_id,
            object_key,
            strategy,
            total_parts,
            part_size,
            expires_at,
            per_part_upload_urls: urls,
        })
    }

    async fn presign_all(
        &self,
        storage_upload_id: &str,
        total_parts: u32,
        max_part_bytes: u64,
    ) -> Result<Vec<PartUploadUrl>, ObjectStoreError> {
        let expires_in = self.settings.presign_expiry.min(self.settings.session_ttl);
        let mut urls = Vec::with_capacity(total_parts as usize);
        for part_index in 0..total_parts {
            let part_number = part_index + 1;
            let url = self
                .storage
                .presign_part(storage_upload_id, part_number, max_part_bytes, expires_in)
                .await?;
            urls.push(PartUploadUrl {
                part_index,
                part_number,
                url,
            });
        }
        Ok(urls)
    }

    /// Accept one buffered part. Re-sending an index replaces the earlier bytes.
    pub async fn upload_part(
        &self,
        upload_id: Uuid,
        index: u32,
        data: Bytes,
    ) -> Result<PartReceipt, UploadError> {
        let session = self.load(upload_id).await?;
        ensure_open(&session)?;
        if session.strategy != UploadStrategy::Buffered {
            return Err(UploadError::StrategyMismatch(session.strategy));
        }
        if index >= session.total_parts {
            return Err(UploadError::InvalidPartIndex {
                index,
                total_parts: session.total_parts,
            });
        }
        let size = data.len() as u64;
        if size == 0 || size > session.part_size {
            return Err(UploadError::InvalidPartSize {
                index,
                size,
                part_size: session.part_size,
            });
        }

        let etag = format!("{:x}", md5::compute(&data));
        let updated = self
            .sessions
            .record_part(
                upload_id,
                index,
                ReceivedPart {
                    etag: Some(etag.clone()),
                    size_bytes: size,
                },
                Some(data),
            )
            .await?;

        tracing::debug!(
            upload_id = %upload_id,
            part_index = index,
            size,
            received = updated.received_parts.len(),
            total_parts = updated.total_parts,
            "Stored part"
        );

        Ok(PartReceipt {
            part_index: index,
            etag,
            received_parts: updated.received_parts.len(),
            total_parts: updated.total_parts,
        })
    }

    /// Verify the part set, finalize the object and record it in the catalog.
    ///
    /// `parts` is required for pre-signed uploads and ignored for buffered ones.
    pub async fn complete(
        &self,
        upload_id: Uuid,
        parts: Option<Vec<CompletedPart>>,
    ) -> Result<CompletionResult, UploadError> {
        let session = self.load(upload_id).await?;
        ensure_open(&session)?;

        let ordered = match session.strategy {
            UploadStrategy::Presigned => {
                let parts = parts.ok_or_else(|| {
                    UploadError::InvalidPartList("pre-signed uploads must list their parts".into())
                })?;
                Some(ordered_part_list(&session, parts)?)
            }
            UploadStrategy::Buffered => {
                let missing = session.missing_parts();
                if !missing.is_empty() {
                    return Err(UploadError::MissingParts(missing));
                }
                None
            }
        };

        let session = self
            .sessions
            .transition(
                upload_id,
                &SessionStatus::ACCEPTING_PARTS,
                SessionStatus::Completing,
            )
            .await?;
        info!(upload_id = %upload_id, object_key = %session.object_key, "Completing upload");

        let stored = match ordered {
            Some(parts) => self.finalize_multipart(&session, &parts).await?,
            None => self.finalize_buffered(&session).await?,
        };

        // The declared size is untrusted; check what actually landed in storage.
        if let Err(violation) = self
            .policies
            .validate_size(stored.size_bytes, session.owner.surface)
        {
            warn!(
                upload_id = %upload_id,
                size = stored.size_bytes,
                declared = session.declared_size,
                "Assembled object violates policy; discarding"
            );
            self.delete_object_best_effort(&session, "policy violation")
                .await;
            self.retire(&session, SessionStatus::Completing, SessionStatus::Aborted)
                .await;
            return Err(violation.into());
        }

        let record = NewMediaItem {
            filename: session.filename.clone(),
            content_type: session.content_type.clone(),
            size_bytes: stored.size_bytes,
            storage_key: stored.key.clone(),
            etag: Some(stored.etag.clone()),
            owner_id: session.owner.owner_id.clone(),
            surface: session.owner.surface.as_str().to_string(),
        };
        let metadata_record = match self.catalog.insert_media(record).await {
            Ok(item) => item,
            Err(err) => {
                error!(upload_id = %upload_id, error = %err, "Metadata write failed");
                self.delete_object_best_effort(&session, "metadata write failed")
                    .await;
                let status = match session.strategy {
                    // Bytes are still buffered, so a retry can re-assemble.
                    UploadStrategy::Buffered => {
                        self.revert_completing(upload_id).await;
                        SessionStatus::Uploading
                    }
                    // The storage-side upload was consumed by finalize.
                    UploadStrategy::Presigned => {
                        self.retire(&session, SessionStatus::Completing, SessionStatus::Aborted)
                            .await;
                        SessionStatus::Aborted
                    }
                };
                return Err(UploadError::MetadataWriteFailed {
                    source: err,
                    status,
                });
            }
        };

        self.retire(&session, SessionStatus::Completing, SessionStatus::Completed)
            .await;
        info!(
            upload_id = %upload_id,
            object_key = %stored.key,
            size = stored.size_bytes,
            media_id = %metadata_record.id,
            "Completed upload"
        );

        Ok(CompletionResult {
            object_url: self.storage.object_url(&stored.key),
            metadata_record,
        })
    }

    async fn finalize_multipart(
        &self,
        session: &UploadSession,
        parts: &[CompletedPart],
    ) -> Result<StoredObject, UploadError> {
        let Some(storage_upload_id) = session.storage_upload_id.as_deref() else {
            self.revert_completing(session.upload_id).await;
            return Err(UploadError::StrategyMismatch(session.strategy));
        };
        match self
            .storage
            .complete_multipart(&session.object_key, storage_upload_id, parts)
            .await
        {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(upload_id = %session.upload_id, error = %err, "Multipart finalize failed");
                self.revert_completing(session.upload_id).await;
                Err(match err {
                    ObjectStoreError::InvalidPart { .. } | ObjectStoreError::InvalidPartOrder => {
                        UploadError::InvalidPartList(err.to_string())
                    }
                    other => UploadError::StorageFinalizeFailed(other),
                })
            }
        }
    }

    async fn finalize_buffered(&self, session: &UploadSession) -> Result<StoredObject, UploadError> {
        let buffers = match self.sessions.part_data(session.upload_id).await {
            Ok(buffers) => buffers,
            Err(err) => {
                self.revert_completing(session.upload_id).await;
                return Err(err.into());
            }
        };
        let missing = session.missing_from(buffers.iter().map(|(index, _)| index));
        if !missing.is_empty() {
            self.revert_completing(session.upload_id).await;
            return Err(UploadError::MissingParts(missing));
        }

        let total: usize = buffers.iter().map(|(_, bytes)| bytes.len()).sum();
        if let Err(violation) = self
            .policies
            .validate_size(total as u64, session.owner.surface)
        {
            self.retire(session, SessionStatus::Completing, SessionStatus::Aborted)
                .await;
            return Err(violation.into());
        }

        let mut assembled = BytesMut::with_capacity(total);
        for (_, bytes) in &buffers {
            assembled.extend_from_slice(bytes);
        }
        drop(buffers);

        match self
            .storage
            .put_object(&session.object_key, &session.content_type, assembled.freeze())
            .await
        {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(upload_id = %session.upload_id, error = %err, "Object put failed");
                self.revert_completing(session.upload_id).await;
                Err(UploadError::StorageFinalizeFailed(err))
            }
        }
    }

    /// Abort an upload. Aborting an already aborted or expired upload is a no-op.
    pub async fn abort(&self, upload_id: Uuid) -> Result<(), UploadError> {
        let session = self.load(upload_id).await?;
        match session.status {
            SessionStatus::Aborted | SessionStatus::Expired => return Ok(()),
            SessionStatus::Completed => {
                return Err(UploadError::AlreadyTerminal {
                    upload_id,
                    status: session.status,
                });
            }
            SessionStatus::Completing => return Err(UploadError::CompletionInProgress(upload_id)),
            SessionStatus::Initiated | SessionStatus::Uploading => {}
        }

        match self
            .sessions
            .transition(
                upload_id,
                &SessionStatus::ACCEPTING_PARTS,
                SessionStatus::Aborted,
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict {
                status: SessionStatus::Aborted | SessionStatus::Expired,
                ..
            }) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        self.release(&session).await;
        info!(upload_id = %upload_id, "Aborted upload");
        Ok(())
    }

    /// Current progress of an upload, including terminal tombstones.
    pub async fn status(&self, upload_id: Uuid) -> Result<SessionProgress, UploadError> {
        let session = self.load(upload_id).await?;
        Ok(SessionProgress::from(&session))
    }

    /// Expire every session past its deadline. Returns how many were expired.
    pub async fn sweep_expired(&self) -> Result<usize, UploadError> {
        let mut expired = 0;
        for session in self.sessions.expired(Utc::now()).await? {
            if self.expire(&session).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Drop tombstones older than the session TTL.
    pub async fn purge_tombstones(&self) -> Result<usize, UploadError> {
        let horizon = Utc::now() - to_time_delta(self.settings.session_ttl);
        Ok(self.sessions.purge_retired(horizon).await?)
    }

    /// Part bytes currently held for buffered uploads.
    pub async fn buffered_bytes(&self) -> Result<u64, UploadError> {
        Ok(self.sessions.buffered_bytes().await?)
    }

    /// Spawn the periodic expiry sweep.
    pub fn start_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match coordinator.sweep_expired().await {
                    Ok(0) => {}
                    Ok(count) => info!(expired = count, "Swept expired upload sessions"),
                    Err(err) => warn!(error = %err, "Expiry sweep failed"),
                }
                match coordinator.purge_tombstones().await {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!(purged = count, "Purged upload tombstones"),
                    Err(err) => warn!(error = %err, "Tombstone purge failed"),
                }
            }
        })
    }

    /// Fetch a session, expiring it first if its deadline has passed.
    async fn load(&self, upload_id: Uuid) -> Result<UploadSession, UploadError> {
        let session = self
            .sessions
            .get(upload_id)
            .await?
            .ok_or(UploadError::NotFound(upload_id))?;
        if !(session.status.accepts_parts() && session.is_expired_at(Utc::now())) {
            return Ok(session);
        }
        self.expire(&session).await?;
        self.sessions
            .get(upload_id)
            .await?
            .ok_or(UploadError::NotFound(upload_id))
    }

    /// Move a session to `expired` and release it. Returns false if another caller moved it first.
    async fn expire(&self, session: &UploadSession) -> Result<bool, UploadError> {
        match self
            .sessions
            .transition(
                session.upload_id,
                &SessionStatus::ACCEPTING_PARTS,
                SessionStatus::Expired,
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        self.release(session).await;
        info!(
            upload_id = %session.upload_id,
            expires_at = %session.expires_at,
            "Expired upload"
        );
        Ok(true)
    }

    /// Discard storage-side state and buffered parts of a session that has just
    /// become aborted or expired. Failures are logged only.
    async fn release(&self, session: &UploadSession) {
        if let Some(storage_upload_id) = &session.storage_upload_id {
            self.abort_storage_upload(&session.object_key, storage_upload_id, session.upload_id)
                .await;
        }
        if let Err(err) = self.sessions.retire(session.upload_id).await {
            warn!(upload_id = %session.upload_id, error = %err, "Failed to release session buffers");
        }
    }

    async fn abort_storage_upload(&self, object_key: &str, storage_upload_id: &str, upload_id: Uuid) {
        if let Err(err) = self
            .storage
            .abort_multipart(object_key, storage_upload_id)
            .await
        {
            warn!(
                upload_id = %upload_id,
                storage_upload_id,
                error = %err,
                "Failed to abort storage multipart upload"
            );
        }
    }

    /// Exactly one compensating delete; its failure is logged, never returned.
    async fn delete_object_best_effort(&self, session: &UploadSession, reason: &str) {
        match self.storage.delete_object(&session.object_key).await {
            Ok(()) => info!(
                upload_id = %session.upload_id,
                object_key = %session.object_key,
                reason,
                "Deleted unreferenced object"
            ),
            Err(err) => warn!(
                upload_id = %session.upload_id,
                object_key = %session.object_key,
                reason,
                error = %err,
                "Compensating delete failed; object left orphaned"
            ),
        }
    }

    async fn revert_completing(&self, upload_id: Uuid) {
        if let Err(err) = self
            .sessions
            .transition(upload_id, &[SessionStatus::Completing], SessionStatus::Uploading)
            .await
        {
            warn!(upload_id = %upload_id, error = %err, "Failed to reopen upload after failed completion");
        }
    }

    async fn retire(&self, session: &UploadSession, from: SessionStatus, to: SessionStatus) {
        if let Err(err) = self.sessions.transition(session.upload_id, &[from], to).await {
            error!(upload_id = %session.upload_id, error = %err, status = %to, "Failed to retire upload");
            return;
        }
        if let Err(err) = self.sessions.retire(session.upload_id).await {
            warn!(upload_id = %session.upload_id, error = %err, "Failed to release session buffers");
        }
    }
}

fn to_time_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

fn ensure_open(session: &UploadSession) -> Result<(), UploadError> {
    match session.status {
        SessionStatus::Completing => Err(UploadError::CompletionInProgress(session.upload_id)),
        status if status.is_terminal() => Err(UploadError::AlreadyTerminal {
            upload_id: session.upload_id,
            status,
        }),
        _ => Ok(()),
    }
}

/// Validate a client-reported part list and return it sorted by part number.
fn ordered_part_list(
    session: &UploadSession,
    mut parts: Vec<CompletedPart>,
) -> Result<Vec<CompletedPart>, UploadError> {
    let mut seen = BTreeSet::new();
    for part in &parts {
        if part.part_number == 0 || part.part_number > session.total_parts {
            return Err(UploadError::InvalidPartList(format!(
                "part number {} is outside 1..={}",
                part.part_number, session.total_parts
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(UploadError::InvalidPartList(format!(
                "part number {} has no entity tag",
                part.part_number
            )));
        }
        if !seen.insert(part.part_number - 1) {
            return Err(UploadError::InvalidPartList(format!(
                "part number {} listed twice",
                part.part_number
            )));
        }
    }
    let missing = session.missing_from(seen.iter());
    if !missing.is_empty() {
        return Err(UploadError::MissingParts(missing));
    }
    parts.sort_by_key(|part| part.part_number);
    Ok(parts)
}
