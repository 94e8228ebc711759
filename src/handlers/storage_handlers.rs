//! HTTP handlers backed directly by the local object store.
//! Signed part writes stream to disk; object reads stream from disk.

use crate::{
    errors::AppError,
    services::{presign::SignatureError, storage_service::ObjectHead},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query string of a pre-signed part URL.
#[derive(Debug, Deserialize)]
pub struct SignedPartQuery {
    /// Largest body the URL accepts; covered by the signature.
    pub max: u64,
    pub expires: i64,
    pub signature: String,
}

/// PUT `/storage/multipart/{storageUploadId}/{partNumber}?max=&expires=&signature=`
///
/// Returns the part's ETag header; the client reports it back at completion.
/// The body is streamed and cut off once it passes `max` bytes.
pub async fn put_signed_part(
    State(state): State<AppState>,
    Path((storage_upload_id, part_number)): Path<(String, u32)>,
    Query(query): Query<SignedPartQuery>,
    body: Body,
) -> Result<Response, AppError> {
    state
        .storage
        .verify_part_signature(
            &storage_upload_id,
            part_number,
            query.max,
            query.expires,
            &query.signature,
        )
        .map_err(|err| {
            let code = match err {
                SignatureError::Invalid => "SignatureDoesNotMatch",
                SignatureError::Expired => "RequestExpired",
            };
            AppError::new(StatusCode::FORBIDDEN, err.to_string()).with_code(code)
        })?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let etag = state
        .storage
        .upload_part(&storage_upload_id, part_number, query.max, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// GET `/objects/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (head, file) = state.storage.get_object_reader(&key).await?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &head);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, head: &ObjectHead) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&head.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(head.size_bytes));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", head.etag)) {
        headers.insert(header::ETAG, value);
    }
}
