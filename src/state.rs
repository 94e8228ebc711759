//! Shared handler state.

use crate::services::{storage_service::LocalObjectStore, upload_service::UploadCoordinator};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    /// Local backend, also serving signed part writes and object reads.
    pub storage: Arc<LocalObjectStore>,
    pub db: Arc<SqlitePool>,
}
