//! Storage and access-control components wired together by `main`.

pub mod access_guard;
pub mod blob_store;
pub mod catalog;
pub mod file_service;
pub mod id_allocator;
pub mod reconciler;
