use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::Client;

use crate::config::RetryPolicy;
use crate::error::{EmbedError, Result};

/// HTTP method of a [`TransportRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// One outgoing request as seen by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    /// A `GET` request without extra headers.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
        }
    }

    /// A `HEAD` request without extra headers.
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            ..Self::get(url)
        }
    }

    /// Append a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Status, headers and body of a completed request.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Abstraction over the network stack.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// Builder for [`HttpTransport`].
#[derive(Default)]
pub struct HttpTransportBuilder {
    client: Option<Client>,
    user_agent: Option<String>,
}

impl HttpTransportBuilder {
    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the default `embed-updater/<version>` user agent.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Create the transport, building a reqwest client unless one was given.
    pub fn build(self) -> Result<HttpTransport> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(
                    self.user_agent
                        .unwrap_or_else(|| format!("embed-updater/{}", env!("CARGO_PKG_VERSION"))),
                )
                .build()?,
        };
        Ok(HttpTransport { client })
    }
}

/// reqwest-backed [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new builder.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
        };
        let mut builder = self
            .client
            .request(method, &request.url)
            .header("Cache-Control", "no-cache");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Body and freshness token of a successfully fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub etag: Option<String>,
    pub body: Bytes,
}

/// Performs single logical fetches with a per-attempt deadline and a bounded
/// number of attempts. Everything above this layer only sees presence or
/// absence of a result.
#[derive(Clone)]
pub struct Resolver {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Resolver {
    /// Resolver sending through `transport` under `policy`.
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Retry budget applied to every request.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request` until one attempt settles with a 2xx or 304 status.
    ///
    /// Each attempt races the transport against `timeout`. A request that
    /// loses the race is dropped rather than awaited.
    pub async fn send(
        &self,
        request: TransportRequest,
        timeout: Duration,
    ) -> Option<TransportResponse> {
        for attempt in 1..=self.policy.attempts {
            let outcome = tokio::select! {
                result = self.transport.send(request.clone()) => Some(result),
                _ = tokio::time::sleep(timeout) => None,
            };

            match outcome {
                Some(Ok(response)) if settled(response.status) => return Some(response),
                Some(Ok(response)) => {
                    tracing::debug!(url = %request.url, attempt, status = response.status, "unexpected status");
                }
                Some(Err(err)) => {
                    tracing::debug!(url = %request.url, attempt, error = %err, "request failed");
                }
                None => {
                    tracing::debug!(url = %request.url, attempt, ?timeout, "request timed out");
                }
            }
        }

        tracing::warn!(
            url = %request.url,
            attempts = self.policy.attempts,
            "giving up on resource"
        );
        None
    }

    /// Fetch `url` with a cache-busting query parameter. Only a 200 response
    /// counts as a result.
    pub async fn fetch(&self, url: &str, method: Method) -> Option<Fetched> {
        let request = TransportRequest {
            url: cache_busted(url),
            method,
            headers: Vec::new(),
        };
        let response = self.send(request, self.policy.timeout_for(url)).await?;
        if response.status != 200 {
            return None;
        }
        Some(Fetched {
            etag: response.header("etag").map(str::to_string),
            body: response.body,
        })
    }

    /// Fetch `url` and fail with a transport error when nothing arrives.
    pub async fn fetch_required(&self, url: &str) -> Result<Fetched> {
        self.fetch(url, Method::Get)
            .await
            .ok_or_else(|| EmbedError::Transport(format!("no response from {url}")))
    }
}

fn settled(status: u16) -> bool {
    (200..300).contains(&status) || status == 304
}

fn cache_busted(url: &str) -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..999_999);
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}rand={nonce}")
}

/// Strip a `rand` cache-busting parameter appended by [`Resolver::fetch`].
#[cfg(test)]
pub(crate) fn without_cache_buster(url: &str) -> &str {
    match url.rfind("rand=") {
        Some(index) if index > 0 && matches!(url.as_bytes()[index - 1], b'?' | b'&') => {
            &url[..index - 1]
        }
        _ => url,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn policy(attempts: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout_ms,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let transport = MockTransport::new();
        transport.sequence(
            "https://host/app.js",
            vec![
                response(500, "boom"),
                response(502, "boom"),
                with_header(response(200, "ok"), "ETag", "\"v1\""),
            ],
        );

        let resolver = Resolver::new(transport.clone(), policy(5, 1_000));
        let fetched = resolver.fetch("https://host/app.js", Method::Get).await.unwrap();
        assert_eq!(fetched.body, Bytes::from("ok"));
        assert_eq!(fetched.etag.as_deref(), Some("\"v1\""));
        assert_eq!(transport.count("https://host/app.js"), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let transport = MockTransport::new();
        transport.route("https://host/app.js", response(404, "missing"));

        let resolver = Resolver::new(transport.clone(), policy(5, 1_000));
        assert!(resolver.fetch("https://host/app.js", Method::Get).await.is_none());
        assert_eq!(transport.count("https://host/app.js"), 5);
    }

    #[tokio::test]
    async fn hanging_host_is_abandoned_after_deadline() {
        let transport = MockTransport::new();
        transport.hang("https://slow/app.js");

        let resolver = Resolver::new(transport.clone(), policy(3, 20));
        let started = std::time::Instant::now();
        assert!(resolver.fetch("https://slow/app.js", Method::Get).await.is_none());
        assert_eq!(transport.count("https://slow/app.js"), 3);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn not_modified_settles_a_raw_send() {
        let transport = MockTransport::new();
        transport.route("https://host/release.json", response(304, ""));

        let resolver = Resolver::new(transport.clone(), policy(5, 1_000));
        let response = resolver
            .send(
                TransportRequest::get("https://host/release.json"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 304);
        assert_eq!(transport.count("https://host/release.json"), 1);
    }

    #[test]
    fn cache_buster_round_trips() {
        let busted = cache_busted("https://host/app.js");
        assert!(busted.starts_with("https://host/app.js?rand="));
        assert_eq!(without_cache_buster(&busted), "https://host/app.js");

        let busted = cache_busted("https://host/app.js?v=2");
        assert_eq!(without_cache_buster(&busted), "https://host/app.js?v=2");
    }
}
