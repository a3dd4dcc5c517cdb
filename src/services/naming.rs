//! Claims a free storage location for a partition before its uploader starts.

use super::backend::{BackendError, ObjectBackend, Presence};
use crate::models::record::PartitionKey;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("could not probe `{location}`: {source}")]
    Probe {
        location: String,
        #[source]
        source: BackendError,
    },
    #[error("no free location for `{key}` after {attempts} attempts")]
    Exhausted { key: String, attempts: u32 },
}

/// Picks the first of `key`, `key-1`, `key-2`, ... that the backend reports
/// as absent.
#[derive(Clone)]
pub struct NamingResolver {
    backend: Arc<dyn ObjectBackend>,
    max_attempts: u32,
}

impl NamingResolver {
    pub fn new(backend: Arc<dyn ObjectBackend>, max_attempts: u32) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Return the location the most recent probe confirmed free.
    pub async fn resolve(&self, desired: &PartitionKey) -> Result<String, ResolutionError> {
        for attempt in 0..self.max_attempts {
            let candidate = candidate_name(desired, attempt);
            match self.backend.probe(&candidate).await {
                Ok(Presence::NotFound) => {
                    debug!(desired = %desired, location = %candidate, "location resolved");
                    return Ok(candidate);
                }
                Ok(Presence::Exists) => {
                    debug!(location = %candidate, "location taken, trying next suffix");
                }
                Err(source) => {
                    warn!(location = %candidate, error = %source, "existence probe failed");
                    return Err(ResolutionError::Probe {
                        location: candidate,
                        source,
                    });
                }
            }
        }

        Err(ResolutionError::Exhausted {
            key: desired.to_string(),
            attempts: self.max_attempts,
        })
    }
}

fn candidate_name(desired: &PartitionKey, attempt: u32) -> String {
    if attempt == 0 {
        desired.as_str().to_owned()
    } else {
        format!("{}-{attempt}", desired.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::record::Record,
        services::memory_store::{Call, MemoryStore, Operation},
    };
    use chrono::FixedOffset;

    fn key() -> PartitionKey {
        // 2024-01-01, client 5
        Record::new(1, 5, 1_704_067_200_000, &b"{}"[..])
            .unwrap()
            .partition_key(&FixedOffset::east_opt(0).unwrap())
    }

    #[tokio::test]
    async fn free_key_is_returned_as_is() {
        let store = Arc::new(MemoryStore::new(0));
        let resolver = NamingResolver::new(store.clone(), 10);

        let location = resolver.resolve(&key()).await.unwrap();
        assert_eq!(location, "/chat/2024-01-01/content_logs_2024-01-01_5");
    }

    #[tokio::test]
    async fn taken_key_resolves_to_the_suffixed_name_that_was_probed_free() {
        let store = Arc::new(MemoryStore::new(0));
        store.insert_object("/chat/2024-01-01/content_logs_2024-01-01_5", "old");
        let resolver = NamingResolver::new(store.clone(), 10);

        let location = resolver.resolve(&key()).await.unwrap();

        // The returned name is the one confirmed free, never the taken original.
        assert_eq!(location, "/chat/2024-01-01/content_logs_2024-01-01_5-1");
        assert_eq!(
            store.calls(),
            vec![
                Call::Probe("/chat/2024-01-01/content_logs_2024-01-01_5".into()),
                Call::Probe("/chat/2024-01-01/content_logs_2024-01-01_5-1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn suffixes_keep_increasing_past_several_collisions() {
        let store = Arc::new(MemoryStore::new(0));
        let base = "/chat/2024-01-01/content_logs_2024-01-01_5";
        store.insert_object(base, "a");
        store.insert_object(&format!("{base}-1"), "b");
        store.insert_object(&format!("{base}-2"), "c");
        let resolver = NamingResolver::new(store, 10);

        assert_eq!(resolver.resolve(&key()).await.unwrap(), format!("{base}-3"));
    }

    #[tokio::test]
    async fn probe_failure_is_a_resolution_error() {
        let store = Arc::new(MemoryStore::new(0));
        store.fail_next(Operation::Probe, 1);
        let resolver = NamingResolver::new(store, 10);

        let err = resolver.resolve(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Probe { ref location, .. }
                if location == "/chat/2024-01-01/content_logs_2024-01-01_5"
        ));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = Arc::new(MemoryStore::new(0));
        let base = "/chat/2024-01-01/content_logs_2024-01-01_5";
        store.insert_object(base, "a");
        store.insert_object(&format!("{base}-1"), "b");
        let resolver = NamingResolver::new(store, 2);

        let err = resolver.resolve(&key()).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Exhausted { attempts: 2, .. }));
    }
}
