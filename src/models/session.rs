//! Client-side bookkeeping for one multipart upload session.

use serde::{Deserialize, Serialize};

/// A part the backend has acknowledged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based).
    pub part_number: u32,

    /// Tag returned by the backend for this part.
    pub etag: String,
}

/// Session state owned by a single partition uploader.
///
/// `session_id` is set at most once. `completed_parts` only grows, in
/// strictly increasing part-number order.
#[derive(Debug)]
pub struct UploadSession {
    session_id: Option<String>,
    next_part_number: u32,
    completed_parts: Vec<CompletedPart>,
}

impl Default for UploadSession {
    fn default() -> Self {
        Self {
            session_id: None,
            next_part_number: 1,
            completed_parts: Vec::new(),
        }
    }
}

impl UploadSession {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn next_part_number(&self) -> u32 {
        self.next_part_number
    }

    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed_parts
    }

    /// Record the id returned by create-session. Ignored if already open.
    pub fn open(&mut self, session_id: String) {
        if self.session_id.is_none() {
            self.session_id = Some(session_id);
        }
    }

    /// Record a successful upload of part `next_part_number`.
    pub fn record_part(&mut self, etag: String) {
        self.completed_parts.push(CompletedPart {
            part_number: self.next_part_number,
            etag,
        });
        self.next_part_number += 1;
    }
}
