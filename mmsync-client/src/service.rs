//! The element service facade.
//!
//! [`ElementService`] is the one object UI code talks to. Reads go through
//! the cache, then the request coordinator; saves go through the conflict
//! resolver or the bulk grouper; every server answer lands in the shared
//! cache so all holders of a handle see it.

use crate::bulk::{BulkReport, BulkUpdateGrouper};
use crate::conflict::{ConflictResolver, SaveOptions, SaveOutcome};
use crate::context::SyncContext;
use crate::coordinator::RequestCoordinator;
use crate::http::HttpTransport;
use crate::scheduler::PriorityScheduler;
use mmsync_core::{
    CacheKey, Element, ElementRequest, ElementsRequest, HistoryKey, KeyVariant, Priority,
    RefScope, SyncConfig, SyncError, SyncResult, Transport, ValidationError,
};
use mmsync_storage::{
    EditTracker, EditTrackerEvent, ElementCache, ElementRef, HistoryRef, TrackerKey,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Per-call read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub priority: Priority,
    /// Bypass the cache and always ask the server.
    pub update: bool,
    /// Resolve to `None` instead of [`SyncError::EmptyResponse`].
    pub allow_empty: bool,
}

impl GetOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn refresh(mut self) -> Self {
        self.update = true;
        self
    }

    pub fn allowing_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }
}

/// Result of comparing a cached element with the server's copy.
#[derive(Debug, Clone, PartialEq)]
pub enum OutdatedStatus {
    Current,
    Outdated { server: Element, cached: Element },
}

impl OutdatedStatus {
    pub fn is_outdated(&self) -> bool {
        matches!(self, Self::Outdated { .. })
    }
}

struct Inner {
    ctx: Arc<SyncContext>,
    scheduler: Arc<PriorityScheduler>,
    elements: RequestCoordinator<Option<ElementRef>>,
    edits: RequestCoordinator<ElementRef>,
    lists: RequestCoordinator<Vec<ElementRef>>,
    histories: RequestCoordinator<HistoryRef>,
    resolver: ConflictResolver,
    bulk: BulkUpdateGrouper,
}

/// Client-side access to the element repository.
///
/// Cheap to clone; clones share the cache, the overlays and the open-edit
/// registry.
#[derive(Clone)]
pub struct ElementService {
    inner: Arc<Inner>,
}

fn flight_key(request: &ElementRequest) -> String {
    let key = CacheKey::for_request(request, KeyVariant::Read);
    if request.extended {
        format!("{key}|extended")
    } else {
        key.to_string()
    }
}

fn required(found: Option<ElementRef>, allow_empty: bool) -> SyncResult<Option<ElementRef>> {
    match found {
        None if !allow_empty => Err(SyncError::EmptyResponse),
        found => Ok(found),
    }
}

/// Whether a cached handle can answer `request`.
fn satisfies(handle: &ElementRef, request_extended: bool) -> SyncResult<bool> {
    Ok(!request_extended || handle.with(Element::is_extended)?)
}

impl ElementService {
    /// Build a service over `transport` after validating `config`.
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self::from_context(SyncContext::new(config, transport)))
    }

    /// Build a service talking to the configured server over HTTP.
    pub fn connect(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn from_context(ctx: SyncContext) -> Self {
        let ctx = Arc::new(ctx);
        let scheduler = Arc::new(PriorityScheduler::new(ctx.config.max_concurrent_requests));
        info!(
            limit = ctx.config.max_concurrent_requests,
            policy = ?ctx.config.stale_write_policy,
            "Element service ready"
        );
        Self {
            inner: Arc::new(Inner {
                elements: RequestCoordinator::new(Arc::clone(&scheduler)),
                edits: RequestCoordinator::unscheduled(),
                lists: RequestCoordinator::new(Arc::clone(&scheduler)),
                histories: RequestCoordinator::new(Arc::clone(&scheduler)),
                resolver: ConflictResolver::new(Arc::clone(&ctx)),
                bulk: BulkUpdateGrouper::new(Arc::clone(&ctx)),
                scheduler,
                ctx,
            }),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.inner.ctx
    }

    pub fn cache(&self) -> &ElementCache {
        &self.inner.ctx.cache
    }

    pub fn tracker(&self) -> &EditTracker {
        &self.inner.ctx.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EditTrackerEvent> {
        self.inner.ctx.tracker.subscribe()
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read one element with default options.
    pub async fn get_element(&self, request: &ElementRequest) -> SyncResult<ElementRef> {
        self.get_element_with(request, GetOptions::default())
            .await?
            .ok_or(SyncError::EmptyResponse)
    }

    /// Read one element.
    ///
    /// Concurrent reads of the same context share one request. A cached
    /// answer is returned unless `opts.update` is set or the request asks
    /// for extended data the cached copy lacks.
    pub async fn get_element_with(
        &self,
        request: &ElementRequest,
        opts: GetOptions,
    ) -> SyncResult<Option<ElementRef>> {
        let request = request.clone().normalized();
        let flight = flight_key(&request);
        if let Some(shared) = self.inner.elements.join(&flight, opts.priority) {
            return required(shared.await?, opts.allow_empty);
        }

        let ctx = &self.inner.ctx;
        let key = CacheKey::for_request(&request, KeyVariant::Read);
        if !opts.update {
            if let Some(cached) = ctx.cache.get(&key)? {
                if satisfies(&cached, request.extended)? {
                    return Ok(Some(cached));
                }
            }
        }
        if let Some(last) = ctx.cache.get_deleted(&key)? {
            return Err(SyncError::Gone {
                recent_version: Box::new(last.snapshot()?),
            });
        }

        let ctx = Arc::clone(ctx);
        let shared = self.inner.elements.fetch(flight, opts.priority, move |token| {
            let seq = ctx.cache.next_seq();
            async move {
                match ctx.transport.get_element(&request).await {
                    Ok(response) => {
                        let Some(element) = response.elements.into_iter().next() else {
                            return Ok(None);
                        };
                        if !token.is_current() {
                            return Err(SyncError::SessionReset);
                        }
                        let handle = ctx.cache_element(&request, element, KeyVariant::Read, seq)?;
                        Ok(Some(handle))
                    }
                    Err(failure) => {
                        let deleted = failure
                            .body
                            .as_ref()
                            .and_then(|body| body.deleted_version(&request.element_id))
                            .cloned();
                        match deleted {
                            Some(last) => {
                                if token.is_current() {
                                    ctx.cache_deleted(&request, last.clone(), seq)?;
                                }
                                Err(SyncError::Gone {
                                    recent_version: Box::new(last),
                                })
                            }
                            None => Err(SyncError::Request(ctx.translate(failure))),
                        }
                    }
                }
            }
        });
        required(shared.await?, opts.allow_empty)
    }

    /// Read several elements of one context.
    ///
    /// Cached ids are answered locally, ids already being fetched join
    /// their flight, the rest go out as one batch. Ids the server does not
    /// return are left out; the result follows the request's order.
    pub async fn get_elements(
        &self,
        request: &ElementsRequest,
        opts: GetOptions,
    ) -> SyncResult<Vec<ElementRef>> {
        let request = request.clone().normalized();
        let ctx = &self.inner.ctx;

        let mut found: HashMap<String, ElementRef> = HashMap::new();
        let mut joined = Vec::new();
        let mut missing = Vec::new();
        for id in &request.element_ids {
            let single = request.request_for(id.clone());
            if !opts.update {
                if let Some(cached) = ctx.cache.get(&CacheKey::for_request(&single, KeyVariant::Read))? {
                    if satisfies(&cached, request.extended)? {
                        found.insert(id.clone(), cached);
                        continue;
                    }
                }
            }
            if let Some(shared) = self.inner.elements.join(&flight_key(&single), opts.priority) {
                joined.push((id.clone(), shared));
                continue;
            }
            if !missing.contains(id) {
                missing.push(id.clone());
            }
        }

        if !missing.is_empty() {
            let flight = format!(
                "batch|{}|{}|{}|{}",
                request.scope(),
                request.commit_id,
                request.extended,
                missing.join(",")
            );
            let ctx = Arc::clone(ctx);
            let batch = request.clone();
            let shared = self.inner.lists.fetch(flight, opts.priority, move |token| {
                let seq = ctx.cache.next_seq();
                async move {
                    let response = ctx
                        .transport
                        .get_elements(&batch, &missing)
                        .await
                        .map_err(|failure| SyncError::Request(ctx.translate(failure)))?;
                    if !token.is_current() {
                        return Err(SyncError::SessionReset);
                    }
                    for deleted in response.deleted {
                        let single = batch.request_for(deleted.id.clone());
                        ctx.cache_deleted(&single, deleted, seq)?;
                    }
                    let mut handles = Vec::with_capacity(response.elements.len());
                    for element in response.elements {
                        let single = batch.request_for(element.id.clone());
                        handles.push(ctx.cache_element(&single, element, KeyVariant::Read, seq)?);
                    }
                    Ok(handles)
                }
            });
            for handle in shared.await? {
                let id = handle.with(|element| element.id.clone())?;
                found.insert(id, handle);
            }
        }

        for (id, shared) in joined {
            match shared.await {
                Ok(Some(handle)) => {
                    found.insert(id, handle);
                }
                Ok(None) => {}
                Err(error) => debug!(id = %id, error = %error, "Joined read failed, omitting"),
            }
        }

        Ok(request
            .element_ids
            .iter()
            .filter_map(|id| found.remove(id))
            .collect())
    }

    /// Open an edit overlay for one element.
    ///
    /// Returns the existing overlay unless `opts.update` is set, in which
    /// case the element is re-read and the overlay reset to the server's
    /// version. The overlay is registered as an open edit.
    pub async fn get_element_for_edit(
        &self,
        request: &ElementRequest,
        opts: GetOptions,
    ) -> SyncResult<ElementRef> {
        let request = request.clone().normalized();
        let flight = format!("{}|edit", flight_key(&request));
        if let Some(shared) = self.inner.edits.join(&flight, opts.priority) {
            return shared.await;
        }

        let key = CacheKey::for_request(&request, KeyVariant::Read);
        if !opts.update {
            if let Some(existing) = self.inner.ctx.overlays.existing(&key)? {
                return Ok(existing);
            }
        }

        let service = self.clone();
        self.inner
            .edits
            .fetch(flight, opts.priority, move |_token| async move {
                let read_opts = GetOptions {
                    allow_empty: false,
                    ..opts
                };
                let canonical = service
                    .get_element_with(&request, read_opts)
                    .await?
                    .ok_or(SyncError::EmptyResponse)?
                    .snapshot()?;
                let ctx = &service.inner.ctx;
                let overlay = if opts.update {
                    ctx.overlays.adopt(&key, canonical.clone())?
                } else {
                    ctx.overlays.open(&key, &canonical)?
                };
                ctx.tracker
                    .add_or_update(TrackerKey::of(&canonical), overlay.clone())?;
                Ok(overlay)
            })
            .await
    }

    /// Commit history of one element, newest first.
    pub async fn get_element_history(
        &self,
        request: &ElementRequest,
        opts: GetOptions,
    ) -> SyncResult<HistoryRef> {
        let request = request.clone().normalized();
        let key = HistoryKey::for_request(&request);
        let flight = key.to_string();
        if let Some(shared) = self.inner.histories.join(&flight, opts.priority) {
            return shared.await;
        }
        if !opts.update {
            if let Some(cached) = self.inner.ctx.cache.history(&key)? {
                return Ok(cached);
            }
        }

        let ctx = Arc::clone(&self.inner.ctx);
        self.inner
            .histories
            .fetch(flight, opts.priority, move |token| async move {
                let response = ctx
                    .transport
                    .get_history(&request)
                    .await
                    .map_err(|failure| SyncError::Request(ctx.translate(failure)))?;
                if !token.is_current() {
                    return Err(SyncError::SessionReset);
                }
                debug!(key = %key, commits = response.commits.len(), "History fetched");
                Ok(ctx.cache.put_history(key, response.commits)?)
            })
            .await
    }

    /// GET an arbitrary URL and cache the elements listed under `json_key`.
    ///
    /// Null entries are skipped. Each element is cached as the answer to
    /// `request` retargeted at its id.
    pub async fn get_generic_elements(
        &self,
        url: &str,
        request: &ElementRequest,
        json_key: &str,
        opts: GetOptions,
    ) -> SyncResult<Vec<ElementRef>> {
        let request = request.clone().normalized();
        let flight = format!("generic|{url}|{json_key}");
        if let Some(shared) = self.inner.lists.join(&flight, opts.priority) {
            return shared.await;
        }

        let ctx = Arc::clone(&self.inner.ctx);
        let url = url.to_string();
        let json_key = json_key.to_string();
        self.inner
            .lists
            .fetch(flight, opts.priority, move |token| {
                let seq = ctx.cache.next_seq();
                async move {
                    let document = ctx
                        .transport
                        .get_generic(&url)
                        .await
                        .map_err(|failure| SyncError::Request(ctx.translate(failure)))?;
                    let Some(items) = document.get(&json_key).and_then(Value::as_array) else {
                        return Err(SyncError::EmptyResponse);
                    };
                    if !token.is_current() {
                        return Err(SyncError::SessionReset);
                    }
                    let mut handles = Vec::with_capacity(items.len());
                    for item in items.iter().filter(|item| !item.is_null()) {
                        let element: Element =
                            serde_json::from_value(item.clone()).map_err(|e| {
                                ValidationError::InvalidValue {
                                    field: json_key.clone(),
                                    reason: e.to_string(),
                                }
                            })?;
                        handles.push(ctx.cache_element(&request, element, KeyVariant::Read, seq)?);
                    }
                    Ok(handles)
                }
            })
            .await
    }

    /// Compare the cached copy of `element` with the server's.
    ///
    /// An element that is not cached is reported current. The server copy
    /// fetched for the comparison is not cached.
    pub async fn is_cache_outdated(&self, element: &Element) -> SyncResult<OutdatedStatus> {
        let ctx = &self.inner.ctx;
        let request = element.identity().normalized();
        let Some(cached) = ctx.cache.get(&CacheKey::for_request(&request, KeyVariant::Read))? else {
            return Ok(OutdatedStatus::Current);
        };

        let ticket = self.inner.scheduler.ticket(Priority::Normal);
        let permit = self.inner.scheduler.acquire(ticket).await;
        let fetched = ctx.transport.get_element(&request).await;
        drop(permit);

        let response = fetched.map_err(|failure| SyncError::Request(ctx.translate(failure)))?;
        let server = response
            .elements
            .into_iter()
            .next()
            .ok_or(SyncError::EmptyResponse)?;
        let cached = cached.snapshot()?;
        if server.comparable() == cached.comparable() {
            Ok(OutdatedStatus::Current)
        } else {
            debug!(id = %server.id, "Cached element is outdated");
            Ok(OutdatedStatus::Outdated { server, cached })
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Save one edited element, resolving concurrent-edit conflicts.
    pub async fn update_element(&self, edit: Element, opts: SaveOptions) -> SyncResult<SaveOutcome> {
        self.inner.resolver.save(edit, opts).await
    }

    /// Save many edited elements, one write per (project, ref).
    pub async fn update_elements(&self, edits: Vec<Element>) -> SyncResult<BulkReport> {
        self.inner.bulk.update_many(edits).await
    }

    /// Create one element in `scope`.
    pub async fn create_element(&self, scope: &RefScope, element: Element) -> SyncResult<ElementRef> {
        let ctx = &self.inner.ctx;
        let wanted = element.id.clone();
        let response = ctx
            .transport
            .post_elements(scope, &ctx.post_body(vec![element]), None)
            .await
            .map_err(|failure| SyncError::Request(ctx.translate(failure)))?;

        let created = if wanted.is_empty() {
            response.elements.first()
        } else {
            response.pick(&wanted)
        };
        let created = created.cloned().ok_or(SyncError::EmptyResponse)?;
        let request = ElementRequest::new(scope.project_id.clone(), created.id.clone())
            .on_ref(scope.ref_id.clone());
        info!(id = %created.id, scope = %scope, "Element created");
        Ok(ctx.cache_element(&request, created, KeyVariant::Read, ctx.cache.next_seq())?)
    }

    /// Create several elements in `scope`.
    ///
    /// Each created element is cached and gets an edit overlay.
    pub async fn create_elements(
        &self,
        scope: &RefScope,
        elements: Vec<Element>,
    ) -> SyncResult<Vec<ElementRef>> {
        let ctx = &self.inner.ctx;
        let response = ctx
            .transport
            .post_elements(scope, &ctx.post_body(elements), None)
            .await
            .map_err(|failure| SyncError::Request(ctx.translate(failure)))?;
        if response.elements.is_empty() {
            return Err(SyncError::EmptyResponse);
        }

        let mut handles = Vec::with_capacity(response.elements.len());
        for created in response.elements {
            let request = ElementRequest::new(scope.project_id.clone(), created.id.clone())
                .on_ref(scope.ref_id.clone());
            let seq = ctx.cache.next_seq();
            ctx.cache_element(&request, created.clone(), KeyVariant::Edit, seq)?;
            handles.push(ctx.cache_element(&request, created, KeyVariant::Read, seq)?);
        }
        info!(count = handles.len(), scope = %scope, "Elements created");
        Ok(handles)
    }

    // ========================================================================
    // EDITS
    // ========================================================================

    /// Drop the edit overlay for one element and close its open edit.
    ///
    /// Holders of the discarded overlay see their changes reverted to the
    /// canonical copy.
    pub fn discard_edit(&self, request: &ElementRequest) -> SyncResult<Option<ElementRef>> {
        let ctx = &self.inner.ctx;
        let request = request.clone().normalized();
        let key = CacheKey::for_request(&request, KeyVariant::Read);
        let canonical = ctx.cache.get(&key)?.map(|h| h.snapshot()).transpose()?;
        let removed = ctx.overlays.discard(&key, canonical.as_ref())?;
        // open edits are keyed by the element's identity, not the requested context
        let open = match &removed {
            Some(overlay) => overlay.with(TrackerKey::of)?,
            None => TrackerKey::for_request(&request),
        };
        ctx.tracker.remove(&open)?;
        Ok(removed)
    }

    /// Register `overlay` as an open edit.
    pub fn track_edit(&self, overlay: &ElementRef) -> SyncResult<()> {
        let key = overlay.with(TrackerKey::of)?;
        self.inner.ctx.tracker.add_or_update(key, overlay.clone())?;
        Ok(())
    }

    /// Whether the overlay for `request` differs from the canonical copy.
    pub fn has_edits(&self, request: &ElementRequest) -> SyncResult<bool> {
        let ctx = &self.inner.ctx;
        let key = CacheKey::for_request(request, KeyVariant::Read);
        match ctx.cache.get(&key)? {
            Some(canonical) => {
                let canonical = canonical.snapshot()?;
                Ok(ctx.overlays.has_edits(&key, &canonical)?)
            }
            None => Ok(ctx.overlays.existing(&key)?.is_some()),
        }
    }

    /// Every open edit, ordered by key.
    pub fn open_edits(&self) -> SyncResult<Vec<(TrackerKey, ElementRef)>> {
        Ok(self.inner.ctx.tracker.get_all()?)
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    /// End the session.
    ///
    /// In-flight requests resolve to [`SyncError::SessionReset`] and never
    /// write into the cleared cache.
    pub fn reset(&self) -> SyncResult<()> {
        let inner = &self.inner;
        inner.elements.reset();
        inner.edits.reset();
        inner.lists.reset();
        inner.histories.reset();
        if let Err(error) = inner.ctx.reset() {
            warn!(error = %error, "Session reset failed");
            return Err(error.into());
        }
        info!("Element session reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_options_builders() {
        let opts = GetOptions::with_priority(Priority::Immediate)
            .refresh()
            .allowing_empty();
        assert_eq!(opts.priority, Priority::Immediate);
        assert!(opts.update);
        assert!(opts.allow_empty);
        assert_eq!(GetOptions::default().priority, Priority::Normal);
    }

    #[test]
    fn test_flight_key_separates_extended_reads() {
        let plain = ElementRequest::new("p", "e1").normalized();
        let extended = plain.clone().extended();
        assert_eq!(flight_key(&plain), "p|master|e1|latest");
        assert_eq!(flight_key(&extended), "p|master|e1|latest|extended");
        // unnormalized requests share the key of their normalized form
        assert_eq!(flight_key(&ElementRequest::new("p", "e1")), flight_key(&plain));
    }

    #[test]
    fn test_required_maps_missing_to_empty_response() {
        assert!(matches!(required(None, false), Err(SyncError::EmptyResponse)));
        assert!(matches!(required(None, true), Ok(None)));
        let handle = ElementRef::new(Element::default());
        assert!(required(Some(handle), false).unwrap().is_some());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl Transport for Unreachable {
            async fn get_element(
                &self,
                _: &ElementRequest,
            ) -> Result<mmsync_core::ElementsResponse, mmsync_core::TransportFailure> {
                unreachable!()
            }
            async fn get_elements(
                &self,
                _: &ElementsRequest,
                _: &[String],
            ) -> Result<mmsync_core::ElementsResponse, mmsync_core::TransportFailure> {
                unreachable!()
            }
            async fn get_generic(&self, _: &str) -> Result<Value, mmsync_core::TransportFailure> {
                unreachable!()
            }
            async fn post_elements(
                &self,
                _: &RefScope,
                _: &mmsync_core::ElementsPost,
                _: Option<std::time::Duration>,
            ) -> Result<mmsync_core::ElementsResponse, mmsync_core::TransportFailure> {
                unreachable!()
            }
            async fn get_history(
                &self,
                _: &ElementRequest,
            ) -> Result<mmsync_core::CommitsResponse, mmsync_core::TransportFailure> {
                unreachable!()
            }
        }

        let mut config = SyncConfig::default_client("http://mms.test");
        config.max_concurrent_requests = 0;
        let result = ElementService::new(config, Arc::new(Unreachable));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
