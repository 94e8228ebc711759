//! Upload pipeline components and their storage collaborators.

pub mod catalog;
pub mod object_store;
pub mod policy;
pub mod presign;
pub mod session_store;
pub mod storage_service;
pub mod upload_service;
