//! Core data models for the upload coordinator.
//!
//! Sessions live in the session store for the duration of an upload; media items are
//! written once to the metadata catalog when an upload completes.

pub mod media;
pub mod session;
pub mod surface;
