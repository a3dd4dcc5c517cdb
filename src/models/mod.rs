//! Core data models.
//!
//! `record` and `session` are the in-process types the dispatcher and the
//! uploaders pass around. `multipart` and `object` map to the local
//! backend's SQLite tables via `sqlx::FromRow`.

pub mod multipart;
pub mod object;
pub mod record;
pub mod session;
