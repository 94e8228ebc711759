//! Session Store
//!
//! Keyed storage for in-flight upload sessions:
//! - `MemorySessionStore`: process-local map, for single-instance deployments
//! - `SqliteSessionStore`: shared database tables, for deployments with several instances
//!
//! Status changes are compare-and-set: a transition names the statuses it may start from
//! and fails with `Conflict` when another caller got there first. Buffered part bytes are
//! held by the store and count against a global byte cap.

use crate::models::{
    session::{OwnerContext, ReceivedPart, SessionStatus, UploadSession},
    surface::{UploadStrategy, UploadSurface},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload session {0} not found")]
    NotFound(Uuid),
    #[error("upload session {upload_id} is {status}")]
    Conflict {
        upload_id: Uuid,
        status: SessionStatus,
    },
    #[error("no transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("buffered part bytes would exceed the {limit} byte limit")]
    CapacityExceeded { limit: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt session record: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reject compare-and-set requests the session state machine does not allow.
fn check_transition(from: &[SessionStatus], to: SessionStatus) -> StoreResult<()> {
    match from.iter().find(|status| !status.can_transition_to(to)) {
        Some(&from) => Err(StoreError::InvalidTransition { from, to }),
        None => Ok(()),
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: UploadSession) -> StoreResult<()>;

    async fn get(&self, upload_id: Uuid) -> StoreResult<Option<UploadSession>>;

    /// Mark part `index` received, replacing any earlier submission of the same index.
    ///
    /// Only legal while the session accepts parts; moves `initiated` to `uploading`.
    /// `data` is the part's bytes for the buffered strategy.
    async fn record_part(
        &self,
        upload_id: Uuid,
        index: u32,
        part: ReceivedPart,
        data: Option<Bytes>,
    ) -> StoreResult<UploadSession>;

    /// Atomically move the session to `to` if its status is one of `from`.
    async fn transition(
        &self,
        upload_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<UploadSession>;

    /// Buffered part bytes, ascending by index.
    async fn part_data(&self, upload_id: Uuid) -> StoreResult<Vec<(u32, Bytes)>>;

    /// Release parts and buffered bytes, keeping the status record as a tombstone.
    async fn retire(&self, upload_id: Uuid) -> StoreResult<()>;

    /// Non-terminal sessions accepting parts whose deadline is at or before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<UploadSession>>;

    /// Drop tombstones last touched before `before`. Returns how many were removed.
    async fn purge_retired(&self, before: DateTime<Utc>) -> StoreResult<usize>;

    /// Total part bytes currently buffered.
    async fn buffered_bytes(&self) -> StoreResult<u64>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Clone)]
pub struct MemorySessionStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: RwLock<MemoryState>,

    /// Ceiling on buffered bytes across all sessions.
    max_buffered_bytes: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Uuid, Entry>,
    buffered_bytes: u64,
}

struct Entry {
    session: UploadSession,
    buffers: BTreeMap<u32, Bytes>,
}

impl Entry {
    fn buffered(&self) -> u64 {
        self.buffers.values().map(|b| b.len() as u64).sum()
    }
}

impl MemorySessionStore {
    pub fn new(max_buffered_bytes: u64) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: RwLock::new(MemoryState::default()),
                max_buffered_bytes,
            }),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: UploadSession) -> StoreResult<()> {
        let mut state = self.inner.state.write().await;
        state.entries.insert(
            session.upload_id,
            Entry {
                session,
                buffers: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, upload_id: Uuid) -> StoreResult<Option<UploadSession>> {
        let state = self.inner.state.read().await;
        Ok(state.entries.get(&upload_id).map(|e| e.session.clone()))
    }

    async fn record_part(
        &self,
        upload_id: Uuid,
        index: u32,
        part: ReceivedPart,
        data: Option<Bytes>,
    ) -> StoreResult<UploadSession> {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let entry = state
            .entries
            .get_mut(&upload_id)
            .ok_or(StoreError::NotFound(upload_id))?;
        if !entry.session.status.accepts_parts() {
            return Err(StoreError::Conflict {
                upload_id,
                status: entry.session.status,
            });
        }

        let replaced = entry.buffers.get(&index).map_or(0, |b| b.len() as u64);
        let incoming = data.as_ref().map_or(0, |b| b.len() as u64);
        let total = state.buffered_bytes - replaced + incoming;
        if incoming > replaced && total > self.inner.max_buffered_bytes {
            return Err(StoreError::CapacityExceeded {
                limit: self.inner.max_buffered_bytes,
            });
        }

        match data {
            Some(bytes) => {
                entry.buffers.insert(index, bytes);
            }
            None => {
                entry.buffers.remove(&index);
            }
        }
        state.buffered_bytes = total;
        entry.session.received_parts.insert(index, part);
        entry.session.status = SessionStatus::Uploading;
        entry.session.updated_at = Utc::now();
        Ok(entry.session.clone())
    }

    async fn transition(
        &self,
        upload_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<UploadSession> {
        check_transition(from, to)?;
        let mut state = self.inner.state.write().await;
        let entry = state
            .entries
            .get_mut(&upload_id)
            .ok_or(StoreError::NotFound(upload_id))?;
        if !from.contains(&entry.session.status) {
            return Err(StoreError::Conflict {
                upload_id,
                status: entry.session.status,
            });
        }
        entry.session.status = to;
        entry.session.updated_at = Utc::now();
        Ok(entry.session.clone())
    }

    async fn part_data(&self, upload_id: Uuid) -> StoreResult<Vec<(u32, Bytes)>> {
        let state = self.inner.state.read().await;
        let entry = state
            .entries
            .get(&upload_id)
            .ok_or(StoreError::NotFound(upload_id))?;
        Ok(entry
            .buffers
            .iter()
            .map(|(index, bytes)| (*index, bytes.clone()))
            .collect())
    }

    async fn retire(&self, upload_id: Uuid) -> StoreResult<()> {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let entry = state
            .entries
            .get_mut(&upload_id)
            .ok_or(StoreError::NotFound(upload_id))?;
        let released = entry.buffered();
        entry.buffers.clear();
        entry.session.received_parts.clear();
        state.buffered_bytes -= released;
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<UploadSession>> {
        let state = self.inner.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.session.status.accepts_parts() && e.session.is_expired_at(now))
            .map(|e| e.session.clone())
            .collect())
    }

    async fn purge_retired(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let count = state.entries.len();
        let mut released = 0;
        state.entries.retain(|_, e| {
            let purge = e.session.status.is_terminal() && e.session.updated_at < before;
            if purge {
                released += e.buffered();
            }
            !purge
        });
        state.buffered_bytes -= released;
        Ok(count - state.entries.len())
    }

    async fn buffered_bytes(&self) -> StoreResult<u64> {
        Ok(self.inner.state.read().await.buffered_bytes)
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<SqlitePool>,
    max_buffered_bytes: u64,
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    object_key: String,
    filename: String,
    content_type: String,
    declared_size: i64,
    part_size: i64,
    total_parts: i64,
    strategy: String,
    storage_upload_id: Option<String>,
    status: String,
    owner_id: String,
    surface: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct PartRow {
    part_index: i64,
    etag: Option<String>,
    size_bytes: i64,
}

const SESSION_COLUMNS: &str = "id, object_key, filename, content_type, declared_size, part_size, \
     total_parts, strategy, storage_upload_id, status, owner_id, surface, created_at, updated_at, \
     expires_at";

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Decode(format!("{} does not fit in i64", value)))
}

fn to_u64(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Decode(format!("negative value {}", value)))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl SessionRow {
    fn into_session(self, parts: Vec<PartRow>) -> StoreResult<UploadSession> {
        let mut received_parts = BTreeMap::new();
        for part in parts {
            let index = u32::try_from(part.part_index)
                .map_err(|_| StoreError::Decode(format!("part index {}", part.part_index)))?;
            received_parts.insert(
                index,
                ReceivedPart {
                    etag: part.etag,
                    size_bytes: to_u64(part.size_bytes)?,
                },
            );
        }
        Ok(UploadSession {
            upload_id: self.id,
            object_key: self.object_key,
            filename: self.filename,
            content_type: self.content_type,
            declared_size: to_u64(self.declared_size)?,
            part_size: to_u64(self.part_size)?,
            total_parts: u32::try_from(self.total_parts)
                .map_err(|_| StoreError::Decode(format!("total parts {}", self.total_parts)))?,
            strategy: self
                .strategy
                .parse::<UploadStrategy>()
                .map_err(StoreError::Decode)?,
            storage_upload_id: self.storage_upload_id,
            received_parts,
            status: self
                .status
                .parse::<SessionStatus>()
                .map_err(StoreError::Decode)?,
            owner: OwnerContext {
                owner_id: self.owner_id,
                surface: self
                    .surface
                    .parse::<UploadSurface>()
                    .map_err(StoreError::Decode)?,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>, max_buffered_bytes: u64) -> Self {
        Self {
            db,
            max_buffered_bytes,
        }
    }

    async fn load_parts(&self, upload_id: Uuid) -> StoreResult<Vec<PartRow>> {
        let parts = sqlx::query_as::<_, PartRow>(
            "SELECT part_index, etag, size_bytes FROM upload_parts WHERE upload_id = ? ORDER BY part_index",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    async fn status_of(&self, upload_id: Uuid) -> StoreResult<Option<SessionStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_sessions WHERE id = ?")
                .bind(upload_id)
                .fetch_optional(&*self.db)
                .await?;
        status
            .map(|s| s.parse::<SessionStatus>().map_err(StoreError::Decode))
            .transpose()
    }

    /// Turn a compare-and-set miss into `NotFound` or `Conflict`.
    async fn miss(&self, upload_id: Uuid) -> StoreError {
        match self.status_of(upload_id).await {
            Ok(Some(status)) => StoreError::Conflict { upload_id, status },
            Ok(None) => StoreError::NotFound(upload_id),
            Err(err) => err,
        }
    }

    async fn require(&self, upload_id: Uuid) -> StoreResult<UploadSession> {
        self.get(upload_id)
            .await?
            .ok_or(StoreError::NotFound(upload_id))
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, session: UploadSession) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO upload_sessions ({}) VALUES ({})",
            SESSION_COLUMNS,
            placeholders(15)
        ))
        .bind(session.upload_id)
        .bind(&session.object_key)
        .bind(&session.filename)
        .bind(&session.content_type)
        .bind(to_i64(session.declared_size)?)
        .bind(to_i64(session.part_size)?)
        .bind(i64::from(session.total_parts))
        .bind(session.strategy.as_str())
        .bind(&session.storage_upload_id)
        .bind(session.status.as_str())
        .bind(&session.owner.owner_id)
        .bind(session.owner.surface.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, upload_id: Uuid) -> StoreResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        match row {
            Some(row) => {
                let parts = self.load_parts(upload_id).await?;
                row.into_session(parts).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn record_part(
        &self,
        upload_id: Uuid,
        index: u32,
        part: ReceivedPart,
        data: Option<Bytes>,
    ) -> StoreResult<UploadSession> {
        let mut tx = self.db.begin().await?;

        // Taking the write lock first serializes concurrent part writes and transitions.
        let updated = sqlx::query(&format!(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(SessionStatus::ACCEPTING_PARTS.len())
        ))
        .bind(SessionStatus::Uploading.as_str())
        .bind(Utc::now())
        .bind(upload_id)
        .bind(SessionStatus::Initiated.as_str())
        .bind(SessionStatus::Uploading.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.miss(upload_id).await);
        }

        if let Some(bytes) = &data {
            let others: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM upload_parts \
                 WHERE NOT (upload_id = ? AND part_index = ?)",
            )
            .bind(upload_id)
            .bind(i64::from(index))
            .fetch_one(&mut *tx)
            .await?;
            if to_u64(others)? + bytes.len() as u64 > self.max_buffered_bytes {
                tx.rollback().await?;
                return Err(StoreError::CapacityExceeded {
                    limit: self.max_buffered_bytes,
                });
            }
        }

        sqlx::query(
            "INSERT INTO upload_parts (upload_id, part_index, etag, size_bytes, data) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(upload_id, part_index) DO UPDATE SET \
             etag = excluded.etag, size_bytes = excluded.size_bytes, data = excluded.data",
        )
        .bind(upload_id)
        .bind(i64::from(index))
        .bind(&part.etag)
        .bind(to_i64(part.size_bytes)?)
        .bind(data.as_ref().map(|b| b.to_vec()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.require(upload_id).await
    }

    async fn transition(
        &self,
        upload_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<UploadSession> {
        check_transition(from, to)?;
        let sql = format!(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len().max(1))
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(upload_id);
        if from.is_empty() {
            query = query.bind(Option::<String>::None);
        }
        for status in from {
            query = query.bind(status.as_str());
        }
        let updated = query.execute(&*self.db).await?;
        if updated.rows_affected() == 0 {
            return Err(self.miss(upload_id).await);
        }
        self.require(upload_id).await
    }

    async fn part_data(&self, upload_id: Uuid) -> StoreResult<Vec<(u32, Bytes)>> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT part_index, data FROM upload_parts \
             WHERE upload_id = ? AND data IS NOT NULL ORDER BY part_index",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter()
            .map(|(index, data)| {
                let index = u32::try_from(index)
                    .map_err(|_| StoreError::Decode(format!("part index {}", index)))?;
                Ok((index, Bytes::from(data)))
            })
            .collect()
    }

    async fn retire(&self, upload_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<UploadSession>> {
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE status IN ({}) AND expires_at <= ?",
            SESSION_COLUMNS,
            placeholders(SessionStatus::ACCEPTING_PARTS.len())
        );
        let mut query = sqlx::query_as::<_, SessionRow>(&sql);
        for status in SessionStatus::ACCEPTING_PARTS {
            query = query.bind(status.as_str());
        }
        let rows = query.bind(now).fetch_all(&*self.db).await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let parts = self.load_parts(row.id).await?;
            sessions.push(row.into_session(parts)?);
        }
        Ok(sessions)
    }

    async fn purge_retired(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let sql = format!(
            "DELETE FROM upload_sessions WHERE status IN ({}) AND updated_at < ?",
            placeholders(SessionStatus::TERMINAL.len())
        );
        let mut query = sqlx::query(&sql);
        for status in SessionStatus::TERMINAL {
            query = query.bind(status.as_str());
        }
        let result = query.bind(before).execute(&*self.db).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn buffered_bytes(&self) -> StoreResult<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM upload_parts")
            .fetch_one(&*self.db)
            .await?;
        to_u64(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn session(total_parts: u32) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            upload_id: Uuid::new_v4(),
            object_key: "complaints/x/report.pdf".into(),
            filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            declared_size: 10,
            part_size: 4,
            total_parts,
            strategy: UploadStrategy::Buffered,
            storage_upload_id: None,
            received_parts: BTreeMap::new(),
            status: SessionStatus::Initiated,
            owner: OwnerContext {
                owner_id: "u1".into(),
                surface: UploadSurface::ComplaintAttachment,
            },
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::minutes(10),
        }
    }

    fn part(size: u64) -> ReceivedPart {
        ReceivedPart {
            etag: Some(format!("etag-{}", size)),
            size_bytes: size,
        }
    }

    async fn sqlite_store(limit: u64) -> SqliteSessionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        SqliteSessionStore::new(Arc::new(pool), limit)
    }

    async fn stores(limit: u64) -> Vec<(&'static str, Arc<dyn SessionStore>)> {
        vec![
            ("memory", Arc::new(MemorySessionStore::new(limit))),
            ("sqlite", Arc::new(sqlite_store(limit).await)),
        ]
    }

    #[tokio::test]
    async fn parts_overwrite_instead_of_double_counting() {
        for (name, store) in stores(1024).await {
            let s = session(3);
            let id = s.upload_id;
            store.insert(s).await.unwrap();

            store
                .record_part(id, 1, part(4), Some(Bytes::from_static(b"aaaa")))
                .await
                .unwrap();
            let after = store
                .record_part(id, 1, part(2), Some(Bytes::from_static(b"bb")))
                .await
                .unwrap();

            assert_eq!(after.status, SessionStatus::Uploading, "{name}");
            assert_eq!(after.received_parts.len(), 1, "{name}");
            assert_eq!(after.missing_parts(), vec![0, 2], "{name}");
            assert_eq!(store.buffered_bytes().await.unwrap(), 2, "{name}");
            assert_eq!(
                store.part_data(id).await.unwrap(),
                vec![(1, Bytes::from_static(b"bb"))],
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        for (name, store) in stores(1024).await {
            let s = session(1);
            let id = s.upload_id;
            store.insert(s).await.unwrap();

            let first = store
                .transition(id, &SessionStatus::ACCEPTING_PARTS, SessionStatus::Completing)
                .await
                .unwrap();
            assert_eq!(first.status, SessionStatus::Completing, "{name}");

            let second = store
                .transition(id, &SessionStatus::ACCEPTING_PARTS, SessionStatus::Completing)
                .await;
            assert!(
                matches!(
                    second,
                    Err(StoreError::Conflict {
                        status: SessionStatus::Completing,
                        ..
                    })
                ),
                "{name}"
            );

            let parts = store
                .record_part(id, 0, part(1), Some(Bytes::from_static(b"x")))
                .await;
            assert!(matches!(parts, Err(StoreError::Conflict { .. })), "{name}");

            let missing = store
                .transition(Uuid::new_v4(), &[SessionStatus::Initiated], SessionStatus::Aborted)
                .await;
            assert!(matches!(missing, Err(StoreError::NotFound(_))), "{name}");

            let illegal = store
                .transition(id, &[SessionStatus::Completing], SessionStatus::Expired)
                .await;
            assert!(
                matches!(illegal, Err(StoreError::InvalidTransition { .. })),
                "{name}"
            );
            assert_eq!(
                store.get(id).await.unwrap().unwrap().status,
                SessionStatus::Completing,
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn buffered_bytes_are_capped_across_sessions() {
        for (name, store) in stores(6).await {
            let a = session(2);
            let b = session(2);
            let (a_id, b_id) = (a.upload_id, b.upload_id);
            store.insert(a).await.unwrap();
            store.insert(b).await.unwrap();

            store
                .record_part(a_id, 0, part(4), Some(Bytes::from_static(b"aaaa")))
                .await
                .unwrap();
            let full = store
                .record_part(b_id, 0, part(4), Some(Bytes::from_static(b"bbbb")))
                .await;
            assert!(
                matches!(full, Err(StoreError::CapacityExceeded { limit: 6 })),
                "{name}"
            );

            // Retiring a session releases its share.
            store.retire(a_id).await.unwrap();
            assert_eq!(store.buffered_bytes().await.unwrap(), 0, "{name}");
            store
                .record_part(b_id, 0, part(4), Some(Bytes::from_static(b"bbbb")))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn expired_and_purge_follow_status() {
        for (name, store) in stores(1024).await {
            let mut stale = session(1);
            stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
            let stale_id = stale.upload_id;
            let fresh = session(1);
            store.insert(stale).await.unwrap();
            store.insert(fresh).await.unwrap();

            let expired = store.expired(Utc::now()).await.unwrap();
            assert_eq!(expired.len(), 1, "{name}");
            assert_eq!(expired[0].upload_id, stale_id, "{name}");

            store
                .transition(stale_id, &SessionStatus::ACCEPTING_PARTS, SessionStatus::Expired)
                .await
                .unwrap();
            store.retire(stale_id).await.unwrap();
            assert!(store.expired(Utc::now()).await.unwrap().is_empty(), "{name}");

            // Tombstone survives until the purge horizon passes it.
            let tombstone = store.get(stale_id).await.unwrap().unwrap();
            assert_eq!(tombstone.status, SessionStatus::Expired, "{name}");
            assert_eq!(
                store
                    .purge_retired(Utc::now() - chrono::Duration::minutes(1))
                    .await
                    .unwrap(),
                0,
                "{name}"
            );
            assert_eq!(
                store
                    .purge_retired(Utc::now() + chrono::Duration::seconds(1))
                    .await
                    .unwrap(),
                1,
                "{name}"
            );
            assert!(store.get(stale_id).await.unwrap().is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn sqlite_round_trips_every_field() {
        let store = sqlite_store(1024).await;
        let mut s = session(3);
        s.strategy = UploadStrategy::Presigned;
        s.storage_upload_id = Some("mp-1".into());
        let id = s.upload_id;
        store.insert(s.clone()).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.object_key, s.object_key);
        assert_eq!(loaded.strategy, UploadStrategy::Presigned);
        assert_eq!(loaded.storage_upload_id.as_deref(), Some("mp-1"));
        assert_eq!(loaded.owner, s.owner);
        assert_eq!(loaded.total_parts, 3);
        assert_eq!(loaded.expires_at, s.expires_at);
    }

    #[tokio::test]
    async fn concurrent_parts_are_all_recorded() {
        for (name, store) in stores(1 << 20).await {
            let s = session(16);
            let id = s.upload_id;
            store.insert(s).await.unwrap();

            let handles: Vec<_> = (0..16u32)
                .map(|index| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        store
                            .record_part(id, index, part(1), Some(Bytes::from(vec![index as u8])))
                            .await
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let loaded = store.get(id).await.unwrap().unwrap();
            assert!(loaded.missing_parts().is_empty(), "{name}");
            assert_eq!(store.part_data(id).await.unwrap().len(), 16, "{name}");
        }
    }
}
