//! The object-storage boundary: four operations every backend provides.
//!
//! Uploaders and the naming resolver only ever talk to an
//! `Arc<dyn ObjectBackend>` built once in `main`, so tests can substitute
//! [`MemoryStore`](super::memory_store::MemoryStore).

use crate::models::session::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Minimum size of every part except the last, as enforced by S3.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Content type declared for every object this service writes.
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Result of an existence probe that reached the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Exists,
    NotFound,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("upload session `{0}` not found")]
    UnknownSession(String),
    #[error("upload session `{0}` is already completed")]
    SessionCompleted(String),
    #[error("part {part_number} of session `{session_id}` was never uploaded or its etag does not match")]
    InvalidPart {
        session_id: String,
        part_number: u32,
    },
    #[error("parts must be listed in strictly increasing order (part {0} out of order)")]
    InvalidPartOrder(u32),
    #[error("part {part_number} is {size} bytes, below the {min} byte minimum for non-final parts")]
    PartTooSmall {
        part_number: u32,
        size: usize,
        min: usize,
    },
    #[error("cannot complete session `{0}` without parts")]
    NoParts(String),
    #[error("part number {0} is outside 1..=10000")]
    InvalidPartNumber(u32),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Multipart object storage as seen by the upload pipeline.
///
/// `probe` may lag behind `complete_session` on eventually consistent
/// stores. Every part passed to `complete_session` except the last must be
/// at least [`min_part_size`](ObjectBackend::min_part_size) bytes.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name used in logs and readiness output.
    fn name(&self) -> &'static str;

    /// Smallest size the backend accepts for a non-final part.
    fn min_part_size(&self) -> usize;

    /// Check whether an object already occupies `location`.
    async fn probe(&self, location: &str) -> BackendResult<Presence>;

    /// Open a multipart session that will produce `location`.
    async fn create_session(&self, location: &str, content_type: &str) -> BackendResult<String>;

    /// Upload one numbered part and return its etag.
    ///
    /// Re-uploading a part number replaces the earlier body.
    async fn upload_part(
        &self,
        location: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<String>;

    /// Assemble `parts`, in order, into the object at `location`.
    async fn complete_session(
        &self,
        location: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()>;
}

/// Validate the part list handed to `complete_session`: non-empty and
/// strictly increasing.
pub(crate) fn check_part_order(session_id: &str, parts: &[CompletedPart]) -> BackendResult<()> {
    if parts.is_empty() {
        return Err(BackendError::NoParts(session_id.to_string()));
    }
    for pair in parts.windows(2) {
        if pair[1].part_number <= pair[0].part_number {
            return Err(BackendError::InvalidPartOrder(pair[1].part_number));
        }
    }
    Ok(())
}

/// S3 caps part numbers at 10000; the local and memory backends follow.
pub(crate) fn check_part_number(part_number: u32) -> BackendResult<()> {
    if (1..=10_000).contains(&part_number) {
        Ok(())
    } else {
        Err(BackendError::InvalidPartNumber(part_number))
    }
}
