//! Represents multipart upload sessions and parts as the local backend
//! persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A multipart upload session, created before the first part arrives.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Session id handed back to the uploader.
    pub id: Uuid,

    /// Object key the session will produce once completed.
    pub key: String,

    /// Content type recorded at creation, copied onto the final object.
    pub content_type: String,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,

    /// Whether upload has been completed successfully.
    pub completed: bool,
}

/// A single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Parent upload session.
    pub upload_id: Uuid,

    /// Part number (1-based).
    pub part_number: i64,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the part body, hex encoded.
    pub etag: String,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}
