//! Core data models for the chunked file store.
//!
//! These entities map to the `files` and `chunks` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod chunk;
pub mod file;
pub mod share;
