//! In-process backend holding objects and sessions in memory.
//!
//! Used when the service runs with `--backend memory` and as the test double
//! for the upload pipeline. Faults can be scheduled per operation.

use super::backend::{
    BackendError, BackendResult, ObjectBackend, Presence, check_part_number, check_part_order,
};
use crate::models::session::CompletedPart;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};
use tracing::debug;
use uuid::Uuid;

/// Backend operation, used to schedule faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Probe,
    CreateSession,
    UploadPart,
    CompleteSession,
}

/// A call that reached the store, successful or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Probe(String),
    CreateSession(String),
    UploadPart {
        location: String,
        part_number: u32,
        size: usize,
    },
    CompleteSession {
        location: String,
        part_numbers: Vec<u32>,
    },
}

struct Session {
    location: String,
    parts: BTreeMap<u32, (String, Bytes)>,
    completed: bool,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    faults: HashMap<Operation, usize>,
    calls: Vec<Call>,
}

impl Inner {
    /// Consume one scheduled fault for `op`, if any.
    fn take_fault(&mut self, op: Operation) -> BackendResult<()> {
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BackendError::Unavailable(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn open_session(&mut self, session_id: &str) -> BackendResult<&mut Session> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BackendError::UnknownSession(session_id.to_string()))?;
        if session.completed {
            return Err(BackendError::SessionCompleted(session_id.to_string()));
        }
        Ok(session)
    }
}

pub struct MemoryStore {
    min_part_size: usize,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(min_part_size: usize) -> Self {
        Self {
            min_part_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation is a single insert, so a poisoned map is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    async fn probe(&self, location: &str) -> BackendResult<Presence> {
        let mut inner = self.lock();
        inner.calls.push(Call::Probe(location.to_string()));
        inner.take_fault(Operation::Probe)?;

        if inner.objects.contains_key(location) {
            Ok(Presence::Exists)
        } else {
            Ok(Presence::NotFound)
        }
    }

    async fn create_session(&self, location: &str, _content_type: &str) -> BackendResult<String> {
        let mut inner = self.lock();
        inner.calls.push(Call::CreateSession(location.to_string()));
        inner.take_fault(Operation::CreateSession)?;

        let session_id = Uuid::new_v4().to_string();
        inner.sessions.insert(
            session_id.clone(),
            Session {
                location: location.to_string(),
                parts: BTreeMap::new(),
                completed: false,
            },
        );
        debug!(location, session_id = %session_id, "memory session created");
        Ok(session_id)
    }

    async fn upload_part(
        &self,
        location: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<String> {
        let mut inner = self.lock();
        inner.calls.push(Call::UploadPart {
            location: location.to_string(),
            part_number,
            size: body.len(),
        });
        inner.take_fault(Operation::UploadPart)?;
        check_part_number(part_number)?;

        let etag = format!("{:x}", md5::compute(&body));
        let session = inner.open_session(session_id)?;
        session.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_session(
        &self,
        location: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::CompleteSession {
            location: location.to_string(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        inner.take_fault(Operation::CompleteSession)?;
        check_part_order(session_id, parts)?;

        let min = self.min_part_size;
        let session = inner.open_session(session_id)?;
        let mut body = BytesMut::new();
        for (idx, part) in parts.iter().enumerate() {
            let (etag, bytes) = session
                .parts
                .get(&part.part_number)
                .filter(|(etag, _)| *etag == part.etag)
                .ok_or_else(|| BackendError::InvalidPart {
                    session_id: session_id.to_string(),
                    part_number: part.part_number,
                })?;
            let is_last = idx + 1 == parts.len();
            if !is_last && bytes.len() < min {
                return Err(BackendError::PartTooSmall {
                    part_number: part.part_number,
                    size: bytes.len(),
                    min,
                });
            }
            debug!(part_number = part.part_number, etag = %etag, "assembling part");
            body.extend_from_slice(bytes);
        }

        session.completed = true;
        let key = session.location.clone();
        inner.objects.insert(key, body.freeze());
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Fail the next `times` calls of `op` with [`BackendError::Unavailable`].
    pub fn fail_next(&self, op: Operation, times: usize) {
        *self.lock().faults.entry(op).or_default() += times;
    }

    /// Store an object directly, as if another writer had created it.
    pub fn insert_object(&self, location: &str, body: impl Into<Bytes>) {
        self.lock().objects.insert(location.to_string(), body.into());
    }

    pub fn object(&self, location: &str) -> Option<Bytes> {
        self.lock().objects.get(location).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Part numbers uploaded to `location`, in call order, failed calls included.
    pub fn uploaded_part_numbers(&self, location: &str) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::UploadPart {
                    location: loc,
                    part_number,
                    ..
                } if loc == location => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    /// Number of sessions created for `location` that were never completed.
    pub fn open_sessions(&self, location: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.location == location && !s.completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_parts_into_one_object() {
        let store = MemoryStore::new(4);
        let id = store.create_session("/a", "text/plain").await.unwrap();
        let p1 = store.upload_part("/a", &id, 1, Bytes::from_static(b"abcd")).await.unwrap();
        let p2 = store.upload_part("/a", &id, 2, Bytes::from_static(b"e")).await.unwrap();

        assert_eq!(store.probe("/a").await.unwrap(), Presence::NotFound);
        store
            .complete_session(
                "/a",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: p1 },
                    CompletedPart { part_number: 2, etag: p2 },
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.probe("/a").await.unwrap(), Presence::Exists);
        assert_eq!(store.object("/a").unwrap(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn rejects_undersized_non_final_part() {
        let store = MemoryStore::new(4);
        let id = store.create_session("/a", "text/plain").await.unwrap();
        let p1 = store.upload_part("/a", &id, 1, Bytes::from_static(b"ab")).await.unwrap();
        let p2 = store.upload_part("/a", &id, 2, Bytes::from_static(b"cd")).await.unwrap();

        let err = store
            .complete_session(
                "/a",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: p1 },
                    CompletedPart { part_number: 2, etag: p2 },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PartTooSmall { part_number: 1, .. }));
        assert!(store.object("/a").is_none());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new(0);
        store.fail_next(Operation::Probe, 1);

        assert!(matches!(
            store.probe("/x").await,
            Err(BackendError::Unavailable(_))
        ));
        assert_eq!(store.probe("/x").await.unwrap(), Presence::NotFound);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let store = MemoryStore::new(0);
        let err = store
            .upload_part("/a", "missing", 1, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownSession(_)));
    }
}
