//! Per-partition upload actor.
//!
//! A `PartitionUploader` owns one storage location and the multipart session
//! that fills it. Records arrive over a bounded queue, their payloads are
//! buffered newline-terminated, and the buffer is shipped as the next part
//! whenever it reaches `min_chunk_size`. On cancellation the queue is
//! drained, the remainder goes out as the final (possibly short) part and
//! the session is completed.
//!
//! A failed backend call never touches the buffer or the part counter; the
//! next threshold crossing, or shutdown, retries the same step.

use super::backend::{BackendError, CONTENT_TYPE_NDJSON, ObjectBackend};
use crate::models::{record::Record, session::UploadSession};
use bytes::{BufMut, Bytes, BytesMut};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct UploaderSettings {
    /// Buffer size that triggers a part upload. Must be at least the
    /// backend's minimum non-final part size.
    pub min_chunk_size: usize,

    /// Capacity of each uploader's input queue.
    pub queue_capacity: usize,

    /// Upper bound on the shutdown drain-flush-complete sequence.
    pub final_flush_timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploaderState {
    /// No session yet.
    Idle,
    SessionOpen,
    Finalizing,
    Closed,
    /// Shutdown could not finish; see the logged cause.
    Abandoned,
}

/// How an uploader ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was ever buffered, so no session was opened.
    Empty,
    /// The session was completed with this many parts.
    Completed { parts: usize },
    /// The session was left open at the backend.
    Orphaned { session_id: String },
    /// No session could be created; this many buffered bytes were dropped.
    Lost { bytes: usize },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not create upload session: {0}")]
    SessionCreate(#[source] BackendError),
    #[error("could not upload part {part_number}: {source}")]
    PartUpload {
        part_number: u32,
        #[source]
        source: BackendError,
    },
    #[error("could not complete upload session: {0}")]
    Complete(#[source] BackendError),
    #[error("final flush did not finish within {0:?}")]
    Timeout(Duration),
}

/// Sending side of an uploader's queue, kept in the dispatcher's registry.
#[derive(Clone, Debug)]
pub struct UploaderHandle {
    location: Arc<str>,
    tx: mpsc::Sender<Record>,
}

impl UploaderHandle {
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Queue a record, waiting while the queue is full. The record comes back
    /// only if the uploader has already shut down.
    pub async fn enqueue(&self, record: Record) -> Result<(), Record> {
        self.tx.send(record).await.map_err(|err| err.0)
    }
}

pub struct PartitionUploader {
    location: Arc<str>,
    backend: Arc<dyn ObjectBackend>,
    min_chunk_size: usize,
    final_flush_timeout: Option<Duration>,
    rx: mpsc::Receiver<Record>,
    buffer: BytesMut,
    session: UploadSession,
    state: UploaderState,
}

impl PartitionUploader {
    pub fn new(
        location: String,
        backend: Arc<dyn ObjectBackend>,
        settings: &UploaderSettings,
    ) -> (Self, UploaderHandle) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let location: Arc<str> = location.into();
        let uploader = Self {
            location: location.clone(),
            backend,
            min_chunk_size: settings.min_chunk_size,
            final_flush_timeout: settings.final_flush_timeout,
            rx,
            buffer: BytesMut::new(),
            session: UploadSession::default(),
            state: UploaderState::Idle,
        };
        (uploader, UploaderHandle { location, tx })
    }

    pub fn state(&self) -> UploaderState {
        self.state
    }

    /// Consume the queue until `ct` fires (or every handle is dropped), then
    /// make one final flush-and-complete attempt.
    pub async fn run(mut self, ct: CancellationToken) -> UploadOutcome {
        debug!(location = %self.location, "uploader started");
        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => break,
                record = self.rx.recv() => match record {
                    Some(record) => self.accept(record).await,
                    None => break,
                },
            }
        }

        let outcome = self.shutdown().await;
        debug!(
            location = %self.location,
            ?outcome,
            state = ?self.state(),
            session_open = self.session.is_open(),
            "uploader stopped"
        );
        outcome
    }

    async fn accept(&mut self, record: Record) {
        self.buffer.extend_from_slice(record.payload());
        self.buffer.put_u8(b'\n');

        if self.buffer.len() >= self.min_chunk_size {
            if let Err(err) = self.flush().await {
                warn!(
                    location = %self.location,
                    buffered = self.buffer.len(),
                    error = %err,
                    "flush failed, will retry on next trigger"
                );
            }
        }
    }

    /// Upload the buffer as the next part, opening the session first if
    /// needed. An empty buffer is never sent.
    async fn flush(&mut self) -> Result<(), UploadError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let session_id = match self.session.session_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self
                    .backend
                    .create_session(&self.location, CONTENT_TYPE_NDJSON)
                    .await
                    .map_err(UploadError::SessionCreate)?;
                info!(location = %self.location, session_id = %id, "upload session created");
                self.session.open(id.clone());
                self.state = UploaderState::SessionOpen;
                id
            }
        };

        let part_number = self.session.next_part_number();
        let body = Bytes::copy_from_slice(&self.buffer);
        let size = body.len();
        let etag = self
            .backend
            .upload_part(&self.location, &session_id, part_number, body)
            .await
            .map_err(|source| UploadError::PartUpload {
                part_number,
                source,
            })?;

        self.session.record_part(etag);
        self.buffer.clear();
        debug!(location = %self.location, part_number, size, "part uploaded");
        Ok(())
    }

    async fn shutdown(&mut self) -> UploadOutcome {
        let Some(limit) = self.final_flush_timeout else {
            return self.drain_and_finalize().await;
        };

        let result = tokio::time::timeout(limit, self.drain_and_finalize()).await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => self.abandon(UploadError::Timeout(limit)),
        }
    }

    async fn drain_and_finalize(&mut self) -> UploadOutcome {
        // Records already accepted onto the queue belong in this object.
        self.rx.close();
        while let Some(record) = self.rx.recv().await {
            self.accept(record).await;
        }

        self.state = UploaderState::Finalizing;
        if let Err(err) = self.flush().await {
            return self.abandon(err);
        }

        let Some(session_id) = self.session.session_id().map(str::to_owned) else {
            self.state = UploaderState::Closed;
            return UploadOutcome::Empty;
        };

        let parts = self.session.completed_parts();
        match self
            .backend
            .complete_session(&self.location, &session_id, parts)
            .await
        {
            Ok(()) => {
                self.state = UploaderState::Closed;
                info!(
                    location = %self.location,
                    session_id = %session_id,
                    parts = parts.len(),
                    "upload session completed"
                );
                UploadOutcome::Completed { parts: parts.len() }
            }
            Err(source) => self.abandon(UploadError::Complete(source)),
        }
    }

    fn abandon(&mut self, err: UploadError) -> UploadOutcome {
        self.state = UploaderState::Abandoned;
        match self.session.session_id() {
            Some(session_id) => {
                warn!(
                    location = %self.location,
                    session_id = %session_id,
                    buffered = self.buffer.len(),
                    parts = self.session.completed_parts().len(),
                    error = %err,
                    "upload session orphaned"
                );
                UploadOutcome::Orphaned {
                    session_id: session_id.to_string(),
                }
            }
            None => {
                error!(
                    location = %self.location,
                    bytes = self.buffer.len(),
                    error = %err,
                    "buffered records lost, no upload session could be created"
                );
                UploadOutcome::Lost {
                    bytes: self.buffer.len(),
                }
            }
        }
    }
}
