use axum::http::{HeaderMap, Method};
use bytes::Bytes;

use crate::errors::AppError;

/// HTTP client for the configured upstream. No response timeout —
/// streaming responses can be arbitrarily long-lived — and redirects are
/// surfaced to the client as-is rather than followed.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(32)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    /// Dispatch the upstream request, returning the raw response so the
    /// caller can either buffer or stream the body.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, AppError> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Upstream request failed: {}", e);
                AppError::Upstream(e.to_string())
            })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}
