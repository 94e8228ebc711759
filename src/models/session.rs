//! Upload sessions: the coordinator's bookkeeping for one in-flight upload.

use super::surface::{UploadStrategy, UploadSurface};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// `initiated -> uploading -> completing -> completed`, with `aborted` reachable from any
/// non-terminal status and `expired` from `initiated`/`uploading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initiated,
    Uploading,
    Completing,
    Completed,
    Aborted,
    Expired,
}

impl SessionStatus {
    /// Statuses that still accept parts.
    pub const ACCEPTING_PARTS: [SessionStatus; 2] =
        [SessionStatus::Initiated, SessionStatus::Uploading];

    pub const TERMINAL: [SessionStatus; 3] = [
        SessionStatus::Completed,
        SessionStatus::Aborted,
        SessionStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn accepts_parts(&self) -> bool {
        Self::ACCEPTING_PARTS.contains(self)
    }

    /// Whether the state machine defines a transition from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initiated, Uploading)
                | (Initiated, Completing)
                | (Uploading, Completing)
                | (Completing, Uploading)
                | (Completing, Completed)
                | (Initiated | Uploading | Completing, Aborted)
                | (Initiated | Uploading, Expired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completing => "completing",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(SessionStatus::Initiated),
            "uploading" => Ok(SessionStatus::Uploading),
            "completing" => Ok(SessionStatus::Completing),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(format!("unknown session status `{}`", other)),
        }
    }
}

/// Who is uploading and from where. Authorization happens before the coordinator sees this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerContext {
    pub owner_id: String,
    pub surface: UploadSurface,
}

/// A part the session has accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedPart {
    /// Storage-assigned or server-computed entity tag.
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// One in-flight upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub object_key: String,
    pub filename: String,
    pub content_type: String,
    /// Size claimed by the client at initiation. Untrusted.
    pub declared_size: u64,
    pub part_size: u64,
    pub total_parts: u32,
    pub strategy: UploadStrategy,
    /// Storage-side multipart handle (pre-signed strategy only).
    pub storage_upload_id: Option<String>,
    /// Accepted parts keyed by 0-based part index.
    pub received_parts: BTreeMap<u32, ReceivedPart>,
    pub status: SessionStatus,
    pub owner: OwnerContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Indices in `0..total_parts` that are not in `present`, ascending.
    pub fn missing_from<'a, I>(&self, present: I) -> Vec<u32>
    where
        I: IntoIterator<Item = &'a u32>,
    {
        let present: std::collections::BTreeSet<u32> = present.into_iter().copied().collect();
        (0..self.total_parts)
            .filter(|index| !present.contains(index))
            .collect()
    }

    /// Indices not yet received by this session.
    pub fn missing_parts(&self) -> Vec<u32> {
        self.missing_from(self.received_parts.keys())
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_parts.values().map(|p| p.size_bytes).sum()
    }
}

/// Compute the number of parts for a file of `size` bytes split into `part_size` parts.
pub fn part_count(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size)
}
