//! Application state shared across request handlers.

use std::sync::Arc;

use crate::allocation::AllocationService;
use crate::store::Storage;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: Arc<AllocationService>,
    storage: Storage,
}

impl AppState {
    pub fn new(service: Arc<AllocationService>, storage: Storage) -> Self {
        Self {
            inner: Arc::new(AppStateInner { service, storage }),
        }
    }

    pub fn service(&self) -> &AllocationService {
        &self.inner.service
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }
}
