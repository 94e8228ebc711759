//! Upload coordinator: multipart uploads with pre-signed or server-buffered part transport,
//! assembled into a single stored object and recorded in a metadata catalog.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use services::upload_service::{UploadCoordinator, UploadError};
