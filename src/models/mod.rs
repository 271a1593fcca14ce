//! Core data models for the file store.
//!
//! File records map to the `files` table and identities to the `users`
//! table via `sqlx::FromRow`; both serialize as JSON via `serde`.

pub mod file_record;
pub mod identity;
