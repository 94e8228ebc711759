//! HTTP handlers for the upload protocol: initiate, send parts, complete, abort.
//! All state lives in the `UploadCoordinator`; handlers only translate HTTP.

use crate::{
    errors::AppError,
    services::{
        object_store::CompletedPart,
        upload_service::{
            CompletionResult, InitiateRequest, InitiateResponse, PartReceipt, SessionProgress,
        },
    },
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

/// Header naming the uploading principal. Set by the authenticating proxy.
pub const UPLOADER_HEADER: &str = "x-uploader-id";

const ANONYMOUS: &str = "anonymous";

/// Body of `POST /uploads/{uploadId}/complete`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    /// Required for pre-signed uploads; ignored for buffered ones.
    pub parts: Option<Vec<CompletedPart>>,
}

fn uploader(headers: &HeaderMap) -> &str {
    headers
        .get(UPLOADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
}

/// `POST /uploads`
pub async fn initiate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<InitiateResponse>), AppError> {
    let response = state
        .coordinator
        .initiate(uploader(&headers), request)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// `GET /uploads/{uploadId}`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<SessionProgress>, AppError> {
    Ok(Json(state.coordinator.status(upload_id).await?))
}

/// `PUT /uploads/{uploadId}/parts/{partIndex}` with the raw part bytes as body.
pub async fn upload_part(
    State(state): State<AppState>,
    Path((upload_id, part_index)): Path<(Uuid, u32)>,
    body: Bytes,
) -> Result<Json<PartReceipt>, AppError> {
    let receipt = state
        .coordinator
        .upload_part(upload_id, part_index, body)
        .await?;
    Ok(Json(receipt))
}

/// `POST /uploads/{uploadId}/complete`
///
/// An empty body is accepted for buffered uploads.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<CompletionResult>, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CompleteRequest::default()
    } else {
        serde_json::from_slice::<CompleteRequest>(&body).map_err(|err| {
            AppError::new(StatusCode::BAD_REQUEST, format!("invalid completion body: {}", err))
                .with_code("InvalidPartList")
        })?
    };

    let result = state
        .coordinator
        .complete(upload_id, request.parts)
        .await?;
    Ok(Json(result))
}

/// `DELETE /uploads/{uploadId}`
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    state.coordinator.abort(upload_id).await?;
    Ok(Json(json!({ "ok": true })))
}
