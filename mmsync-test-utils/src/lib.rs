//! mmsync Test Utilities
//!
//! Shared test infrastructure for the mmsync workspace:
//! - An in-memory element repository implementing `Transport`
//! - Proptest generators for elements and tracker keys
//! - Fixtures for common scenarios
//! - Assertions on `SyncError` shapes

pub use mmsync_core::{
    CacheKey, CommitRecord, CommitsResponse, Element, ElementRequest, ElementType,
    ElementsPost, ElementsRequest, ElementsResponse, KeyVariant, Priority, RefScope, Rejection,
    SyncConfig, SyncError, SyncResult, Transport, TransportFailure,
};
pub use mmsync_storage::TrackerKey;

use async_trait::async_trait;
use chrono::Utc;
use mmsync_core::element::QUALIFIED_ID_FIELD;
use mmsync_core::wire::NO_CHANGE;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// MOCK REPOSITORY
// ============================================================================

/// One request the mock repository received.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetElement(ElementRequest),
    GetElements { request: ElementsRequest, ids: Vec<String> },
    GetGeneric(String),
    PostElements { scope: RefScope, body: ElementsPost },
    GetHistory(ElementRequest),
}

type ElementId = (String, String, String);

fn element_id(project: &str, ref_id: &str, id: &str) -> ElementId {
    (project.to_string(), ref_id.to_string(), id.to_string())
}

#[derive(Default)]
struct ServerState {
    live: HashMap<ElementId, Element>,
    versions: HashMap<(ElementId, String), Element>,
    deleted: HashMap<ElementId, Element>,
    histories: HashMap<ElementId, Vec<CommitRecord>>,
    generic: HashMap<String, Value>,
    scripted_gets: HashMap<String, VecDeque<Result<ElementsResponse, TransportFailure>>>,
    scripted_posts: HashMap<RefScope, VecDeque<Result<ElementsResponse, TransportFailure>>>,
    calls: Vec<Call>,
    commits: u64,
    post_delay: Option<Duration>,
}

impl ServerState {
    fn next_commit(&mut self) -> u64 {
        self.commits += 1;
        self.commits
    }

    /// Stamp `element` as a new version and record it.
    fn commit(&mut self, mut element: Element) -> Element {
        let n = self.next_commit();
        element.commit_id = format!("c{n}");
        element.read = Some(format!("r{n}"));
        element.modified = Some(Utc::now());
        let key = element_id(&element.project_id, &element.ref_id, &element.id);
        self.versions
            .insert((key.clone(), element.commit_id.clone()), element.clone());
        self.histories
            .entry(key.clone())
            .or_default()
            .insert(0, CommitRecord::from_saved(&element));
        self.live.insert(key, element.clone());
        element
    }

    fn lookup(&self, request: &ElementRequest) -> Result<Element, TransportFailure> {
        let request = request.clone().normalized();
        let key = element_id(&request.project_id, &request.ref_id, &request.element_id);
        if let Some(last) = self.deleted.get(&key) {
            return Err(TransportFailure::new(410, "Gone").with_body(ElementsResponse {
                deleted: vec![last.clone()],
                ..Default::default()
            }));
        }
        let found = if request.is_latest() {
            self.live.get(&key)
        } else {
            self.versions.get(&(key, request.commit_id.clone()))
        };
        let mut element = found
            .cloned()
            .ok_or_else(|| TransportFailure::new(404, "Not Found"))?;
        if request.extended {
            element.set_field(
                QUALIFIED_ID_FIELD,
                format!("{}/{}", element.project_id, element.id),
            );
        }
        Ok(element)
    }

    fn apply_post(&mut self, scope: &RefScope, body: &ElementsPost) -> Result<ElementsResponse, TransportFailure> {
        let mut response = ElementsResponse::default();
        for submitted in &body.elements {
            let mut submitted = submitted.clone();
            if submitted.id.is_empty() {
                submitted.id = format!("generated-{}", self.next_commit());
            }
            let key = element_id(&scope.project_id, &scope.ref_id, &submitted.id);
            let stored = self.live.get(&key).cloned();

            if let (Some(stored), Some(read)) = (&stored, &submitted.read) {
                if stored.read.as_ref() != Some(read) {
                    return Err(TransportFailure::new(409, "Conflict")
                        .with_body(ElementsResponse::of(vec![stored.clone()])));
                }
            }

            let mut merged = stored.clone().unwrap_or_else(|| {
                Element::new(
                    submitted.id.clone(),
                    scope.project_id.clone(),
                    scope.ref_id.clone(),
                    submitted.element_type.clone(),
                )
            });
            merged.element_type = submitted.element_type.clone();
            for (field, value) in submitted.fields {
                merged.fields.insert(field, value);
            }
            merged.modifier = Some(body.source.clone());

            match stored {
                Some(stored)
                    if stored.fields == merged.fields
                        && stored.element_type == merged.element_type =>
                {
                    response.rejected.push(Rejection {
                        code: NO_CHANGE,
                        message: "Not Modified".to_string(),
                        object: Some(stored),
                    });
                }
                _ => response.elements.push(self.commit(merged)),
            }
        }
        Ok(response)
    }
}

/// In-memory element repository.
///
/// Writes follow the repository's rules: a submitted `_read` token older
/// than the stored one is a 409 carrying the server version, a write that
/// changes nothing is a 304 rejection carrying the stored element, and
/// every real write gets a fresh commit id and read token.
pub struct MockTransport {
    state: Mutex<ServerState>,
    gate: watch::Sender<bool>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(ServerState::default()),
            gate,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `element` as a new version and return what the server holds.
    pub fn seed(&self, element: Element) -> Element {
        self.lock().commit(element)
    }

    /// Change an element as another user would.
    pub fn server_edit(&self, request: &ElementRequest, edit: impl FnOnce(&mut Element)) -> Element {
        let mut state = self.lock();
        let request = request.clone().normalized();
        let key = element_id(&request.project_id, &request.ref_id, &request.element_id);
        let mut element = state.live.get(&key).cloned().unwrap_or_default();
        edit(&mut element);
        state.commit(element)
    }

    /// Delete an element; later reads answer 410 with its last version.
    pub fn delete(&self, request: &ElementRequest) -> Option<Element> {
        let mut state = self.lock();
        let request = request.clone().normalized();
        let key = element_id(&request.project_id, &request.ref_id, &request.element_id);
        let last = state.live.remove(&key)?;
        state.deleted.insert(key, last.clone());
        Some(last)
    }

    pub fn current(&self, request: &ElementRequest) -> Option<Element> {
        let request = request.clone().normalized();
        let key = element_id(&request.project_id, &request.ref_id, &request.element_id);
        self.lock().live.get(&key).cloned()
    }

    pub fn set_generic(&self, url: impl Into<String>, document: Value) {
        self.lock().generic.insert(url.into(), document);
    }

    /// Answer the next read of `element_id` with `reply` instead.
    pub fn script_get(&self, element_id: impl Into<String>, reply: Result<ElementsResponse, TransportFailure>) {
        self.lock()
            .scripted_gets
            .entry(element_id.into())
            .or_default()
            .push_back(reply);
    }

    /// Answer the next write to `scope` with `reply` instead.
    pub fn script_post(&self, scope: RefScope, reply: Result<ElementsResponse, TransportFailure>) {
        self.lock()
            .scripted_posts
            .entry(scope)
            .or_default()
            .push_back(reply);
    }

    /// Delay every write by `delay`.
    pub fn set_post_delay(&self, delay: Duration) {
        self.lock().post_delay = Some(delay);
    }

    /// Park reads until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Single reads of `element_id`.
    pub fn get_count(&self, element_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::GetElement(r) if r.element_id == element_id))
            .count()
    }

    pub fn post_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::PostElements { .. }))
            .count()
    }

    /// Most reads that were in progress at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn gated_read(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
        tokio::task::yield_now().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_element(&self, request: &ElementRequest) -> Result<ElementsResponse, TransportFailure> {
        self.lock().calls.push(Call::GetElement(request.clone()));
        self.gated_read().await;
        let mut state = self.lock();
        if let Some(reply) = state
            .scripted_gets
            .get_mut(&request.element_id)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        state.lookup(request).map(|element| ElementsResponse::of(vec![element]))
    }

    async fn get_elements(
        &self,
        request: &ElementsRequest,
        ids: &[String],
    ) -> Result<ElementsResponse, TransportFailure> {
        self.lock().calls.push(Call::GetElements {
            request: request.clone(),
            ids: ids.to_vec(),
        });
        self.gated_read().await;
        let state = self.lock();
        let mut response = ElementsResponse::default();
        for id in ids {
            match state.lookup(&request.request_for(id.clone())) {
                Ok(element) => response.elements.push(element),
                Err(failure) => {
                    if let Some(body) = failure.body {
                        response.deleted.extend(body.deleted);
                    }
                }
            }
        }
        Ok(response)
    }

    async fn get_generic(&self, url: &str) -> Result<Value, TransportFailure> {
        self.lock().calls.push(Call::GetGeneric(url.to_string()));
        self.gated_read().await;
        self.lock()
            .generic
            .get(url)
            .cloned()
            .ok_or_else(|| TransportFailure::new(404, "Not Found"))
    }

    async fn post_elements(
        &self,
        scope: &RefScope,
        body: &ElementsPost,
        _timeout: Option<Duration>,
    ) -> Result<ElementsResponse, TransportFailure> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(Call::PostElements {
                scope: scope.clone(),
                body: body.clone(),
            });
            state.post_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(reply) = state
            .scripted_posts
            .get_mut(scope)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        state.apply_post(scope, body)
    }

    async fn get_history(&self, request: &ElementRequest) -> Result<CommitsResponse, TransportFailure> {
        self.lock().calls.push(Call::GetHistory(request.clone()));
        self.gated_read().await;
        let request = request.clone().normalized();
        let key = element_id(&request.project_id, &request.ref_id, &request.element_id);
        self.lock()
            .histories
            .get(&key)
            .cloned()
            .map(|commits| CommitsResponse { commits })
            .ok_or_else(|| TransportFailure::new(404, "Not Found"))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_element_id() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9_]{0,15}".prop_map(|s| format!("MMS_{s}"))
    }

    pub fn arb_ref_id() -> impl Strategy<Value = String> {
        prop_oneof![Just("master".to_string()), "[a-z]{3,8}".prop_map(|s| s)]
    }

    pub fn arb_element_type() -> impl Strategy<Value = ElementType> {
        prop_oneof![
            Just(ElementType::Property),
            Just(ElementType::Port),
            Just(ElementType::Slot),
            Just(ElementType::Constraint),
            Just(ElementType::Other("Class".to_string())),
        ]
    }

    pub fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::Immediate),
        ]
    }

    /// An element with identity, a name and optional documentation.
    pub fn arb_element() -> impl Strategy<Value = Element> {
        (
            arb_element_id(),
            "[A-Z]{2,6}".prop_map(|s| format!("PROJECT-{s}")),
            arb_ref_id(),
            arb_element_type(),
            "[a-zA-Z0-9 ]{1,30}".prop_map(|s| s),
            prop::option::of("[a-zA-Z0-9 ]{1,80}".prop_map(|s| s)),
        )
            .prop_map(|(id, project, ref_id, element_type, name, documentation)| {
                let element = Element::new(id, project, ref_id, element_type).with_name(name);
                match documentation {
                    Some(doc) => element.with_documentation(doc),
                    None => element,
                }
            })
    }

    pub fn arb_tracker_key() -> impl Strategy<Value = TrackerKey> {
        (arb_element_id(), "[A-Z]{2,6}".prop_map(|s| format!("PROJECT-{s}")), arb_ref_id())
            .prop_map(|(id, project, ref_id)| TrackerKey::new(id, project, ref_id))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub const PROJECT: &str = "PROJECT-TEST";
    pub const BASE_URL: &str = "http://mms.test/alfresco/service";

    /// Client configuration with no save grace delay.
    pub fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default_client(BASE_URL);
        config.save_grace_delay_ms = 0;
        config
    }

    pub fn property(id: &str) -> Element {
        Element::new(id, PROJECT, "master", ElementType::Property)
            .with_name(format!("{id} name"))
            .with_documentation("")
            .with_field("defaultValue", serde_json::json!({ "value": 1 }))
    }

    pub fn property_on(id: &str, ref_id: &str) -> Element {
        let mut element = property(id);
        element.ref_id = ref_id.to_string();
        element
    }

    pub fn request(id: &str) -> ElementRequest {
        ElementRequest::new(PROJECT, id)
    }

    pub fn scope(ref_id: &str) -> RefScope {
        RefScope::new(PROJECT, ref_id)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert the error is a translated request failure with `status`.
    pub fn assert_request_status<T: std::fmt::Debug>(result: &SyncResult<T>, status: u16) {
        match result {
            Err(SyncError::Request(reason)) => assert_eq!(
                reason.status, status,
                "Expected status {status}, got {reason:?}"
            ),
            other => panic!("Expected request failure {status}, got {other:?}"),
        }
    }

    pub fn assert_gone<T: std::fmt::Debug>(result: &SyncResult<T>, id: &str) {
        match result {
            Err(SyncError::Gone { recent_version }) => assert_eq!(recent_version.id, id),
            other => panic!("Expected Gone for {id}, got {other:?}"),
        }
    }

    pub fn assert_session_reset<T: std::fmt::Debug>(result: &SyncResult<T>) {
        assert!(
            matches!(result, Err(SyncError::SessionReset)),
            "Expected SessionReset, got {result:?}"
        );
    }
}
