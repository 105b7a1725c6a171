//! Client for the single upstream repository.
//!
//! Requests are forwarded over HTTP/1.1 only.  The connect timeout and the
//! wait for response headers are both bounded; the body itself may stream
//! for as long as it takes.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::http::ProxyError;

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    response_timeout: Option<Duration>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repocache/", env!("CARGO_PKG_VERSION")))
            .http1_only()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            response_timeout: config.response_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upstream URL for an inbound path-and-query, appended verbatim.
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Send one request upstream and wait for its response headers.
    ///
    /// `body` is `None` for requests that carry no payload.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let request = builder
            .build()
            .map_err(|source| ProxyError::RequestConstruction {
                url: url.to_string(),
                source,
            })?;

        debug!(%url, method = %request.method(), "forwarding to upstream");

        let send = self.client.execute(request);
        let result = match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send).await.map_err(|_| {
                ProxyError::UpstreamTimeout {
                    url: url.to_string(),
                    detail: format!("no response headers within {}s", timeout.as_secs_f64()),
                }
            })?,
            None => send.await,
        };

        result.map_err(|source| ProxyError::from_transport(url, source))
    }

    /// Plain reachability probe used by the health check.
    pub async fn probe(&self, timeout: Duration) -> Result<reqwest::StatusCode, reqwest::Error> {
        let resp = self
            .client
            .head(format!("{}/", self.base_url))
            .timeout(timeout)
            .send()
            .await?;
        Ok(resp.status())
    }
}
