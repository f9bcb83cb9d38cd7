//! reqwest-backed transport for the MMS REST layout.
//!
//! URL construction for the element repository lives here and nowhere
//! else.

use async_trait::async_trait;
use mmsync_core::{
    CommitsResponse, ConfigError, ElementRequest, ElementsPost, ElementsRequest, ElementsResponse,
    IdRef, RefScope, SyncConfig, Transport, TransportFailure, LATEST,
};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct BatchRead<'a> {
    elements: &'a [IdRef],
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: config.request_timeout_ms.to_string(),
                reason: e.to_string(),
            })?;
        let base_url = Url::parse(config.api_base_url.trim_end_matches('/')).map_err(|e| {
            ConfigError::InvalidValue {
                field: "api_base_url".to_string(),
                value: config.api_base_url.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            client,
            base_url,
            headers: HeaderMap::new(),
        })
    }

    /// Headers sent with every request (authorization, for example).
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportFailure::new(0, format!("cannot extend base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn elements_url(&self, scope: &RefScope) -> Result<Url, TransportFailure> {
        self.url(&["projects", &scope.project_id, "refs", &scope.ref_id, "elements"])
    }

    fn element_url(&self, request: &ElementRequest) -> Result<Url, TransportFailure> {
        self.url(&[
            "projects",
            &request.project_id,
            "refs",
            &request.ref_id,
            "elements",
            &request.element_id,
        ])
    }

    fn with_context(builder: RequestBuilder, commit_id: &str, extended: bool) -> RequestBuilder {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if !commit_id.is_empty() && commit_id != LATEST {
            query.push(("commitId", commit_id));
        }
        if extended {
            query.push(("extended", "true"));
        }
        if query.is_empty() {
            builder
        } else {
            builder.query(&query)
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, TransportFailure> {
        let response = builder
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(failure_from)?;
        parse_response(response).await
    }
}

fn failure_from(err: reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        return TransportFailure::new(408, err.to_string());
    }
    let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
    TransportFailure::new(status, err.to_string())
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportFailure> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| TransportFailure::new(500, format!("invalid response body: {e}")));
    }
    let text = response.text().await.map_err(failure_from)?;
    let mut failure = TransportFailure::new(status.as_u16(), text.clone());
    if let Ok(body) = serde_json::from_str::<ElementsResponse>(&text) {
        failure = failure.with_body(body);
    }
    Err(failure)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_element(
        &self,
        request: &ElementRequest,
    ) -> Result<ElementsResponse, TransportFailure> {
        let url = self.element_url(request)?;
        debug!(url = %url, "GET element");
        let builder = Self::with_context(self.client.get(url), &request.commit_id, request.extended);
        self.send(builder).await
    }

    async fn get_elements(
        &self,
        request: &ElementsRequest,
        ids: &[String],
    ) -> Result<ElementsResponse, TransportFailure> {
        let url = self.elements_url(&request.scope())?;
        let refs: Vec<IdRef> = ids.iter().map(|id| IdRef { id: id.clone() }).collect();
        debug!(url = %url, count = refs.len(), "PUT element batch read");
        let builder = Self::with_context(self.client.put(url), &request.commit_id, request.extended)
            .json(&BatchRead { elements: &refs });
        self.send(builder).await
    }

    async fn get_generic(&self, url: &str) -> Result<serde_json::Value, TransportFailure> {
        let absolute = if url.starts_with("http") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.as_str().trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        };
        let url = Url::parse(&absolute)
            .map_err(|e| TransportFailure::new(400, format!("invalid url {absolute}: {e}")))?;
        debug!(url = %url, "GET generic");
        self.send(self.client.get(url)).await
    }

    async fn post_elements(
        &self,
        scope: &RefScope,
        body: &ElementsPost,
        timeout: Option<Duration>,
    ) -> Result<ElementsResponse, TransportFailure> {
        let url = self.elements_url(scope)?;
        debug!(url = %url, count = body.elements.len(), "POST elements");
        let mut builder = self.client.post(url).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        self.send(builder).await
    }

    async fn get_history(
        &self,
        request: &ElementRequest,
    ) -> Result<CommitsResponse, TransportFailure> {
        let mut url = self.element_url(request)?;
        url.path_segments_mut()
            .map_err(|_| TransportFailure::new(0, "cannot extend history url"))?
            .push("commits");
        debug!(url = %url, "GET element history");
        self.send(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(&SyncConfig::default_client("https://mms.example.org/api/")).unwrap()
    }

    #[test]
    fn test_element_url_layout() {
        let req = ElementRequest::new("PROJ-1", "e 1").on_ref("dev");
        let url = transport().element_url(&req).unwrap();
        assert_eq!(
            url.as_str(),
            "https://mms.example.org/api/projects/PROJ-1/refs/dev/elements/e%201"
        );
    }

    #[test]
    fn test_elements_url_layout() {
        let url = transport()
            .elements_url(&RefScope::new("p1", "master"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://mms.example.org/api/projects/p1/refs/master/elements"
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = SyncConfig::default_client("https://mms.example.org");
        config.max_concurrent_requests = 0;
        assert!(HttpTransport::new(&config).is_err());
    }
}
