use crate::services::{backend::ObjectBackend, dispatcher::DispatcherClient, shutdown::Shutdown};
use std::sync::Arc;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherClient,
    pub backend: Arc<dyn ObjectBackend>,
    pub shutdown: Shutdown,
}
