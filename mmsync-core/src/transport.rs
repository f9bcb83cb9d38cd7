//! Transport and provenance traits.
//!
//! The sync layer never talks HTTP directly. It drives a [`Transport`],
//! which the client crate implements over reqwest and the test utilities
//! implement in memory.

use crate::element::{ElementRequest, ElementsRequest, RefScope};
use crate::error::TransportFailure;
use crate::wire::{CommitsResponse, ElementsPost, ElementsResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Element repository endpoints used by the sync layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Read one element in the request's context.
    async fn get_element(&self, request: &ElementRequest)
        -> Result<ElementsResponse, TransportFailure>;

    /// Batch read of `ids` in the request's context.
    async fn get_elements(
        &self,
        request: &ElementsRequest,
        ids: &[String],
    ) -> Result<ElementsResponse, TransportFailure>;

    /// Arbitrary GET returning a JSON document.
    async fn get_generic(&self, url: &str) -> Result<serde_json::Value, TransportFailure>;

    /// Write elements into one (project, ref) partition.
    async fn post_elements(
        &self,
        scope: &RefScope,
        body: &ElementsPost,
        timeout: Option<Duration>,
    ) -> Result<ElementsResponse, TransportFailure>;

    /// Commit history of one element.
    async fn get_history(&self, request: &ElementRequest)
        -> Result<CommitsResponse, TransportFailure>;
}

/// Supplies the provenance marker attached to writes.
pub trait SourceProvider: Send + Sync + 'static {
    fn source(&self) -> String;
}

/// A provenance marker fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSource(pub String);

impl StaticSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }
}

impl SourceProvider for StaticSource {
    fn source(&self) -> String {
        self.0.clone()
    }
}
