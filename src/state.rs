//! Shared application state
//!
//! One `AppState` is built at startup and shared by the RTMP listener and
//! every HTTP handler. The segmenter-handle table is keyed by stream key;
//! a stopped stream's handle stays behind so its final playlist (with
//! `#EXT-X-ENDLIST`) remains servable until the key republishes.

use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::TokenStore;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::mux::{Fmp4Muxer, Muxer};
use crate::registry::Registry;
use crate::segmenter::SegmenterHandle;
use crate::storage::{LocalStorage, Storage};

/// Shared state for RTMP sessions and HTTP handlers
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Registry,
    pub tokens: TokenStore,
    pub storage: Arc<dyn Storage>,
    pub muxer: Arc<dyn Muxer>,
    /// Segmenter handles by stream key
    pub segmenters: DashMap<String, Arc<SegmenterHandle>>,
}

impl AppState {
    /// Build state with the local-filesystem storage backend
    pub fn new(config: ServerConfig) -> Result<Self> {
        let storage = Arc::new(LocalStorage::new(&config.storage_root)?);
        Ok(Self::with_backends(config, storage, Arc::new(Fmp4Muxer::new())))
    }

    /// Build state over explicit storage and muxer backends
    pub fn with_backends(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        Self {
            registry: Registry::new(config.limits.clone()),
            tokens: TokenStore::new(config.token.clone()),
            storage,
            muxer,
            segmenters: DashMap::new(),
            config,
        }
    }

    /// Segmenter handle for a stream key, if any session produced one
    pub fn segmenter(&self, stream_key: &str) -> Option<Arc<SegmenterHandle>> {
        self.segmenters.get(stream_key).map(|h| h.clone())
    }
}

/// In-memory state for tests
#[cfg(test)]
pub fn test_state() -> Arc<AppState> {
    Arc::new(AppState::with_backends(
        ServerConfig::default(),
        Arc::new(crate::storage::MemoryStorage::new()),
        Arc::new(Fmp4Muxer::new()),
    ))
}
