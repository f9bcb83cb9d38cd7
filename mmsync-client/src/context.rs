//! Shared state for one sync session.

use crate::status::{MmsStatusTranslator, StatusTranslator};
use mmsync_core::{
    CacheKey, CommitRecord, Element, ElementRequest, ElementsPost, FailureReason, HistoryKey,
    KeyVariant, SourceProvider, StaticSource, StorageError, SyncConfig, Transport,
    TransportFailure,
};
use mmsync_storage::{EditOverlayStore, EditTracker, ElementCache, ElementRef, TrackerKey, WriteSeq};
use std::sync::Arc;
use tracing::debug;

/// Collaborators and process-scoped state shared by the coordinator,
/// the conflict resolver and the bulk grouper.
pub struct SyncContext {
    pub config: SyncConfig,
    pub cache: Arc<ElementCache>,
    pub overlays: EditOverlayStore,
    pub tracker: EditTracker,
    pub transport: Arc<dyn Transport>,
    pub translator: Arc<dyn StatusTranslator>,
    pub source: Arc<dyn SourceProvider>,
}

impl SyncContext {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let cache = Arc::new(ElementCache::new(config.stale_write_policy));
        let source = Arc::new(StaticSource::new(config.source.clone()));
        Self {
            overlays: EditOverlayStore::new(Arc::clone(&cache)),
            tracker: EditTracker::new(config.tracker_channel_capacity),
            cache,
            transport,
            translator: Arc::new(MmsStatusTranslator),
            source,
            config,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn StatusTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.source = source;
        self
    }

    pub fn translate(&self, failure: TransportFailure) -> FailureReason {
        self.translator.translate(failure)
    }

    /// Write body for `elements`, stamped with the provenance marker.
    pub fn post_body(&self, elements: Vec<Element>) -> ElementsPost {
        ElementsPost {
            elements,
            source: self.source.source(),
        }
    }

    /// Key under which `element` answers `request`.
    pub fn request_key(request: &ElementRequest, element: &Element, variant: KeyVariant) -> CacheKey {
        let request = if element.id.is_empty() {
            request.clone()
        } else {
            request.for_element(element.id.clone())
        };
        CacheKey::for_request(&request, variant)
    }

    /// Cache a fetched element as the answer to `request`.
    pub fn cache_element(
        &self,
        request: &ElementRequest,
        element: Element,
        variant: KeyVariant,
        seq: WriteSeq,
    ) -> Result<ElementRef, StorageError> {
        let key = Self::request_key(request, &element, variant);
        self.cache.put(&key, element, seq)
    }

    /// Cache `last_version` as the tombstone for `request`.
    pub fn cache_deleted(
        &self,
        request: &ElementRequest,
        last_version: Element,
        seq: WriteSeq,
    ) -> Result<ElementRef, StorageError> {
        let key = Self::request_key(request, &last_version, KeyVariant::Read);
        debug!(key = %key, "Element deleted on server");
        self.cache.put_deleted(&key, last_version, seq)
    }

    /// Apply a server-confirmed write.
    ///
    /// Updates the canonical entry and the overlay, prepends to a cached
    /// history list, and closes the open edit.
    pub fn commit_saved(&self, saved: Element) -> Result<ElementRef, StorageError> {
        let seq = self.cache.next_seq();
        let key = CacheKey::latest_of(&saved, KeyVariant::Read);
        let handle = self.cache.put(&key, saved.clone(), seq)?;
        self.overlays.adopt(&key, saved.clone())?;
        self.cache
            .push_history_entry(&HistoryKey::of(&saved), CommitRecord::from_saved(&saved))?;
        self.tracker.remove(&TrackerKey::of(&saved))?;
        Ok(handle)
    }

    /// Take the server's version as both canonical and overlay.
    pub fn adopt_server(&self, server: Element) -> Result<ElementRef, StorageError> {
        let seq = self.cache.next_seq();
        let key = CacheKey::latest_of(&server, KeyVariant::Read);
        let handle = self.cache.put(&key, server.clone(), seq)?;
        self.overlays.adopt(&key, server.clone())?;
        self.tracker.remove(&TrackerKey::of(&server))?;
        Ok(handle)
    }

    /// Clear cache, overlays and the open-edit registry.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.cache.clear()?;
        self.tracker.reset()
    }
}
