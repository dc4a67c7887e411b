//! # Control API Client
//!
//! Asynchronous client for the proxy engine's REST control API, built on
//! `reqwest` with `reqwest-middleware`. Roster queries go through a retrying
//! client (exponential backoff), mutations and latency probes go through a plain
//! one so a probe timeout is reported as a result instead of being retried.

use std::time::Duration;

use reqwest::{header::{AUTHORIZATION, CONTENT_TYPE}, Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{RosterError, RosterResult};
use crate::model::{
    ConnectionWire, ConnectionsResponse, DelayResponse, MessageResponse, ProvidersResponse,
    ProxiesResponse, SwitchRequest,
};

/// Where the control API lives. Supplied by the configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ApiConfig {
    /// Absolute base URL (e.g. `http://127.0.0.1:9090`). Queries are disabled while unset.
    pub base_url: Option<String>,
    /// Optional bearer credential.
    pub secret: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self { base_url: Some(base_url.into()), secret }
    }

    /// `false` when no base URL is set; nothing may be requested in that state.
    pub fn is_enabled(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Backoff for roster queries: `min(base * 2^attempt, max)` for up to `max_attempts` tries.
///
/// The exponent base is the backoff builder's default of 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueryRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// Status, body and decoded payload of one control API exchange.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a 2xx answer, `None` for an empty body.
    pub data: Option<T>,
    /// Human readable reason for a non-2xx answer.
    pub error_message: Option<String>,
    pub status: u16,
    pub success: bool,
}

impl<T> ApiResponse<T> {
    /// Turns a non-2xx answer into `RosterError::Http`.
    pub fn into_result(self) -> RosterResult<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(RosterError::Http {
                status: self.status,
                message: self.error_message.unwrap_or_default(),
            })
        }
    }
}

/// Client bound to one `ApiConfig`.
pub struct ControlApi {
    /// Retrying client for GET roster queries.
    query: ClientWithMiddleware,
    /// Single-shot client for mutations and probes.
    command: ClientWithMiddleware,
    base_url: Url,
    secret: Option<String>,
}

impl ControlApi {
    /// Builds both clients for `config`.
    ///
    /// # Errors
    /// `ConfigUnavailable` when no base URL is set, `InvalidUrl` when it does not parse.
    pub fn new(config: &ApiConfig, retry: &QueryRetry) -> RosterResult<Self> {
        let raw = config.base_url.as_deref().filter(|u| !u.trim().is_empty()).ok_or(RosterError::ConfigUnavailable)?;
        let base_url = Url::parse(raw.trim())?;
        if base_url.cannot_be_a_base() {
            return Err(RosterError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(retry.base_delay, retry.max_delay.max(retry.base_delay))
            .jitter(Jitter::None)
            .build_with_max_retries(retry.max_attempts.saturating_sub(1));

        let http = reqwest::Client::builder().user_agent("lib_roster/0.1").build()?;
        let query = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let command = ClientBuilder::new(http).build();

        Ok(Self {
            query,
            command,
            base_url,
            secret: config.secret.clone().filter(|s| !s.is_empty()),
        })
    }

    /// Appends percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> RosterResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RosterError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Performs one request and decodes a 2xx body into `T`.
    ///
    /// Non-2xx answers are not errors at this level; they come back with
    /// `success == false` and the engine's `message` if it sent one.
    async fn request<T, B>(
        &self,
        client: &ClientWithMiddleware,
        method: Method,
        url: Url,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> RosterResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut req = client.request(method, url);

        if let Some(token) = &self.secret {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(reqwest_middleware::Error::from)?;

        if status.is_success() {
            let data = if bytes.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(serde_json::from_slice::<T>(&bytes)?)
            };
            Ok(ApiResponse { data, error_message: None, status: status.as_u16(), success: true })
        } else {
            Ok(ApiResponse {
                data: None,
                error_message: Some(error_message(status, &bytes)),
                status: status.as_u16(),
                success: false,
            })
        }
    }

    /// GET that must return a body.
    async fn query_json<T: DeserializeOwned>(&self, segments: &[&str]) -> RosterResult<T> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();
        self.request::<T, ()>(&self.query, Method::GET, url, None, None)
            .await?
            .into_result()?
            .ok_or_else(|| RosterError::Http { status: 200, message: format!("empty body from {}", path) })
    }

    /// Request whose body, if any, is ignored.
    async fn command<B: Serialize + ?Sized>(&self, method: Method, segments: &[&str], body: Option<&B>) -> RosterResult<()> {
        let url = self.endpoint(segments)?;
        self.request::<serde_json::Value, B>(&self.command, method, url, body, None)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// `GET /proxies`
    pub async fn get_proxies(&self) -> RosterResult<ProxiesResponse> {
        self.query_json(&["proxies"]).await
    }

    /// `GET /providers/proxies`
    pub async fn get_providers(&self) -> RosterResult<ProvidersResponse> {
        self.query_json(&["providers", "proxies"]).await
    }

    /// `PUT /proxies/{group}` with `{ "name": member }`.
    pub async fn switch_proxy(&self, group: &str, member: &str) -> RosterResult<()> {
        self.command(Method::PUT, &["proxies", group], Some(&SwitchRequest { name: member })).await
    }

    /// `GET /proxies/{name}/delay?url=..&timeout=..`, never retried.
    pub async fn proxy_delay(&self, name: &str, test_url: &str, timeout: Duration) -> RosterResult<ApiResponse<DelayResponse>> {
        let mut url = self.endpoint(&["proxies", name, "delay"])?;
        url.query_pairs_mut()
            .append_pair("url", test_url)
            .append_pair("timeout", &timeout.as_millis().to_string());
        // Give the engine its own timeout first so it can answer with a message.
        let transport_timeout = timeout + Duration::from_secs(2);
        self.request::<DelayResponse, ()>(&self.command, Method::GET, url, None, Some(transport_timeout)).await
    }

    /// `GET /providers/proxies/{name}/healthcheck`
    pub async fn healthcheck_provider(&self, name: &str) -> RosterResult<()> {
        self.command::<()>(Method::GET, &["providers", "proxies", name, "healthcheck"], None).await
    }

    /// `PUT /providers/proxies/{name}`
    pub async fn update_provider(&self, name: &str) -> RosterResult<()> {
        self.command::<()>(Method::PUT, &["providers", "proxies", name], None).await
    }

    /// `GET /connections`
    pub async fn get_connections(&self) -> RosterResult<Vec<ConnectionWire>> {
        let body: ConnectionsResponse = self.query_json(&["connections"]).await?;
        Ok(body.connections.unwrap_or_default())
    }

    /// `DELETE /connections/{id}`
    pub async fn close_connection(&self, id: &str) -> RosterResult<()> {
        self.command::<()>(Method::DELETE, &["connections", id], None).await
    }
}

/// Prefers the engine's `{ "message" }`, then the raw text, then the status reason.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(msg) = serde_json::from_slice::<MessageResponse>(body) {
        return msg.message;
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if !text.is_empty() {
        return text;
    }
    status.canonical_reason().unwrap_or("request failed").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockControlApi, MockResponse};

    #[test]
    fn config_without_base_url_is_disabled() {
        assert!(!ApiConfig::default().is_enabled());
        assert!(!ApiConfig { base_url: Some("  ".into()), secret: None }.is_enabled());
        assert!(matches!(
            ControlApi::new(&ApiConfig::default(), &QueryRetry::default()),
            Err(RosterError::ConfigUnavailable)
        ));
    }

    #[test]
    fn endpoint_encodes_segments_and_keeps_prefix() {
        let api = ControlApi::new(&ApiConfig::new("http://127.0.0.1:9090/api/", None), &QueryRetry::default()).unwrap();
        let url = api.endpoint(&["proxies", "🇯🇵 Tokyo/01", "delay"]).unwrap();
        assert_eq!(url.path(), "/api/proxies/%F0%9F%87%AF%F0%9F%87%B5%20Tokyo%2F01/delay");
    }

    #[test]
    fn error_message_prefers_engine_message() {
        assert_eq!(error_message(StatusCode::REQUEST_TIMEOUT, br#"{"message":"Timeout"}"#), "Timeout");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, b"upstream down"), "upstream down");
        assert_eq!(error_message(StatusCode::NOT_FOUND, b""), "Not Found");
    }

    #[tokio::test]
    async fn sends_bearer_secret_and_decodes_delay() {
        let mock = MockControlApi::start().await;
        mock.route("GET", "/proxies/A/delay", MockResponse::json(200, r#"{"delay":123}"#));
        let api = ControlApi::new(&mock.config(Some("s3cret")), &QueryRetry::default()).unwrap();

        let res = api.proxy_delay("A", "http://www.gstatic.com/generate_204", Duration::from_millis(5000)).await.unwrap();
        assert!(res.success);
        assert_eq!(res.data.unwrap().delay, 123);

        let seen = mock.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].header("authorization").as_deref(), Some("Bearer s3cret"));
        assert!(seen[0].target.contains("timeout=5000"));
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error_until_unwrapped() {
        let mock = MockControlApi::start().await;
        mock.route("GET", "/proxies/B/delay", MockResponse::json(408, r#"{"message":"Timeout"}"#));
        let api = ControlApi::new(&mock.config(None), &QueryRetry::default()).unwrap();

        let res = api.proxy_delay("B", "http://example.com", Duration::from_millis(100)).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.status, 408);
        match res.into_result() {
            Err(RosterError::Http { status, message }) => {
                assert_eq!(status, 408);
                assert_eq!(message, "Timeout");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn roster_queries_retry_transient_failures_with_backoff() {
        let retry = QueryRetry::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(1_000));
        assert_eq!(retry.max_delay, Duration::from_millis(30_000));

        let mock = MockControlApi::start().await;
        mock.route("GET", "/proxies", MockResponse::json(503, r#"{"message":"core restarting"}"#));
        let api = ControlApi::new(&mock.config(None), &retry).unwrap();

        let started = std::time::Instant::now();
        let err = api.get_proxies().await.unwrap_err();

        assert!(matches!(err, RosterError::Http { status: 503, .. }));
        assert_eq!(mock.count("GET", "/proxies"), 3);
        // 1s then 2s between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn commands_are_sent_once() {
        let mock = MockControlApi::start().await;
        mock.route("PUT", "/proxies/Proxy", MockResponse::json(503, r#"{"message":"busy"}"#));
        let api = ControlApi::new(&mock.config(None), &QueryRetry::default()).unwrap();

        assert!(api.switch_proxy("Proxy", "B").await.is_err());
        assert_eq!(mock.count("PUT", "/proxies/Proxy"), 1);
    }

    #[tokio::test]
    async fn switch_sends_json_body() {
        let mock = MockControlApi::start().await;
        mock.route("PUT", "/proxies/Proxy", MockResponse::empty(204));
        let api = ControlApi::new(&mock.config(None), &QueryRetry::default()).unwrap();

        api.switch_proxy("Proxy", "B").await.unwrap();
        let seen = mock.requests();
        let body: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body, serde_json::json!({ "name": "B" }));
    }
}
