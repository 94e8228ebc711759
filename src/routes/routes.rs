//! Defines routes for the upload protocol and the local storage backend.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /uploads` -> initiate
//!   - `GET    /uploads/{uploadId}` -> progress
//!   - `PUT    /uploads/{uploadId}/parts/{partIndex}` -> buffered part bytes
//!   - `POST   /uploads/{uploadId}/complete` -> complete
//!   - `DELETE /uploads/{uploadId}` -> abort
//!
//! - **Storage**
//!   - `PUT    /storage/multipart/{storageUploadId}/{partNumber}` -> pre-signed part write
//!   - `GET    /objects/{*key}` -> download a finalized object
//!
//! The wildcard `*key` allows nested keys like `media/{uploadId}/clip.mp4`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers::{get_object, put_signed_part},
        upload_handlers::{abort_upload, complete_upload, get_upload, initiate_upload, upload_part},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router.
///
/// `max_part_bytes` bounds buffered part bodies; signed part writes stream to disk and are
/// not buffered.
pub fn routes(max_part_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload sessions
        .route("/uploads", post(initiate_upload))
        .route("/uploads/{upload_id}", get(get_upload).delete(abort_upload))
        .route(
            "/uploads/{upload_id}/parts/{part_index}",
            put(upload_part).layer(DefaultBodyLimit::max(max_part_bytes)),
        )
        .route("/uploads/{upload_id}/complete", post(complete_upload))
        // Storage
        .route(
            "/storage/multipart/{storage_upload_id}/{part_number}",
            put(put_signed_part),
        )
        .route("/objects/{*key}", get(get_object))
}
