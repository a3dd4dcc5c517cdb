//! Routes records to per-partition uploaders, starting them on first sight.
//!
//! The dispatcher task is the only reader and writer of the partition
//! registry; ingress reaches it through [`DispatcherClient`] over a bounded
//! queue, so the map needs no lock.

use super::{
    backend::ObjectBackend,
    naming::{NamingResolver, ResolutionError},
    shutdown::Shutdown,
    uploader::{PartitionUploader, UploaderHandle, UploaderSettings},
};
use crate::models::record::{PartitionKey, Record};
use chrono::FixedOffset;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    /// Capacity of the ingress → dispatcher queue.
    pub queue_capacity: usize,

    /// Offset at which calendar days are cut for partition keys.
    pub partition_offset: FixedOffset,

    pub max_name_attempts: u32,

    pub uploader: UploaderSettings,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("partition `{key}` could not be established: {source}")]
    Resolution {
        key: String,
        #[source]
        source: ResolutionError,
    },
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("uploader for `{0}` has stopped")]
    UploaderStopped(String),
}

struct RouteRequest {
    record: Record,
    reply: oneshot::Sender<Result<(), DispatchError>>,
}

/// Cloneable entry point used by ingress.
#[derive(Clone)]
pub struct DispatcherClient {
    tx: mpsc::Sender<RouteRequest>,
}

impl DispatcherClient {
    /// Hand a record to the dispatcher and wait until it has been queued
    /// for its partition, or rejected.
    pub async fn route(&self, record: Record) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouteRequest { record, reply })
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;

        rx.await.map_err(|_| DispatchError::ShuttingDown)?
    }
}

pub struct Dispatcher {
    rx: mpsc::Receiver<RouteRequest>,
    registry: HashMap<PartitionKey, UploaderHandle>,
    resolver: NamingResolver,
    backend: Arc<dyn ObjectBackend>,
    settings: DispatcherSettings,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        settings: DispatcherSettings,
        shutdown: Shutdown,
    ) -> (Self, DispatcherClient) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let dispatcher = Self {
            rx,
            registry: HashMap::new(),
            resolver: NamingResolver::new(backend.clone(), settings.max_name_attempts),
            backend,
            settings,
            shutdown,
        };
        (dispatcher, DispatcherClient { tx })
    }

    /// Serve route requests until the shutdown token fires.
    pub async fn run(mut self) {
        let ct = self.shutdown.token();
        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(RouteRequest { record, reply }) => {
                        let result = self.route(record).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
            }
        }
        info!(partitions = self.registry.len(), "dispatcher stopped");
    }

    /// Forward `record` to its partition's uploader, creating the uploader
    /// (and claiming its location) if this is the first record for the key.
    pub async fn route(&mut self, record: Record) -> Result<(), DispatchError> {
        let key = record.partition_key(&self.settings.partition_offset);
        let handle = match self.registry.get(&key) {
            Some(handle) => handle.clone(),
            None => self.start_uploader(key).await?,
        };

        handle.enqueue(record).await.map_err(|record| {
            warn!(
                location = handle.location(),
                content_id = record.content_id(),
                "uploader stopped, record rejected"
            );
            DispatchError::UploaderStopped(handle.location().to_string())
        })
    }

    async fn start_uploader(&mut self, key: PartitionKey) -> Result<UploaderHandle, DispatchError> {
        let location = self.resolver.resolve(&key).await.map_err(|source| {
            warn!(key = %key, error = %source, "partition could not be established");
            DispatchError::Resolution {
                key: key.to_string(),
                source,
            }
        })?;

        let (uploader, handle) =
            PartitionUploader::new(location, self.backend.clone(), &self.settings.uploader);
        self.shutdown.spawn(uploader.run(self.shutdown.token()));
        debug!(
            key = %key,
            location = handle.location(),
            tasks = self.shutdown.active_tasks(),
            "uploader spawned"
        );
        info!(key = %key, location = handle.location(), "partition started");

        self.registry.insert(key, handle.clone());
        Ok(handle)
    }
}
