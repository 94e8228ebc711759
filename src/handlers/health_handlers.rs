//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> probes the catalog database, the storage directory and the session store

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffered_bytes: Option<u64>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CheckStatus {
    fn from_result<T>(result: Result<T, String>) -> Self {
        match result {
            Ok(_) => Self {
                ok: true,
                error: None,
            },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. The body lists each check and, when the
/// session store answered, how many part bytes are buffered right now.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
        .map_err(|e| format!("query failed: {}", e))
        .and_then(|v| match v {
            1 => Ok(()),
            other => Err(format!("unexpected result: {}", other)),
        });
    let storage = probe_directory(&state.storage.base_path).await;
    let sessions = state
        .coordinator
        .buffered_bytes()
        .await
        .map_err(|e| e.to_string());
    let buffered_bytes = sessions.as_ref().ok().copied();

    let checks = BTreeMap::from([
        ("catalog", CheckStatus::from_result(catalog)),
        ("storage", CheckStatus::from_result(storage)),
        ("sessions", CheckStatus::from_result(sessions)),
    ]);
    let ready = checks.values().all(|c| c.ok);
    if !ready {
        tracing::warn!("Readiness check failed");
    }

    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
        buffered_bytes,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Write, read back and remove a scratch file under `dir`.
async fn probe_directory(dir: &Path) -> Result<(), String> {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&probe, b"readyz")
        .await
        .map_err(|e| format!("could not write probe file: {}", e))?;
    let read = fs::read(&probe).await;
    // best-effort cleanup
    let _ = fs::remove_file(&probe).await;
    match read {
        Ok(bytes) if bytes == b"readyz" => Ok(()),
        Ok(_) => Err("probe file content mismatch".to_string()),
        Err(e) => Err(format!("could not read probe file: {}", e)),
    }
}
