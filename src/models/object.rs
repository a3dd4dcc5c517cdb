//! Represents a completed object in the local backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata of an object produced by completing a multipart session.
///
/// The payload lives on disk; this row is what makes the key visible to
/// existence probes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key (path-like identifier).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Multipart etag: md5 of the concatenated part digests, suffixed with
    /// the part count.
    pub etag: String,

    /// Timestamp when the object was completed.
    pub last_modified: DateTime<Utc>,
}
