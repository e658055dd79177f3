//! Request Dispatcher: endpoint selection, attempt loop, retry/failover (spec §4.F).

use crate::error::ClientError;
use crate::pool::BufferPools;
use crate::resolver::AddressResolver;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Additional retries after the first attempt; at most 4 attempts total.
pub const MAX_ADDITIONAL_ATTEMPTS: usize = 3;
/// Default per-call timeout when `CallSpec::timeout` is zero.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Fixed delay between retries after a retryable failure.
pub const INTER_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    fn carries_body(self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

/// Opaque, pre-encoded or structured request body.
#[derive(Debug, Clone)]
pub enum Body {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

/// Trace propagation carried alongside a call, replacing Go's ambient `context.Value` lookups
/// with an explicit struct (spec §9, "Dynamic typing").
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub trace_id: Option<String>,
    pub user_info: Option<String>,
    pub step_id: Option<String>,
    pub deadline: Option<Instant>,
    cancelled: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl CallContext {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().map(|c| c.load(Ordering::Acquire)).unwrap_or(false)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// One outbound call's parameters.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub path: String,
    pub body: Option<Body>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub context: CallContext,
}

impl CallSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), body: None, headers: Vec::new(), timeout: Duration::ZERO, context: CallContext::default() }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() { DEFAULT_CALL_TIMEOUT } else { self.timeout }
    }
}

/// Selects a live endpoint, issues the HTTP call over a pooled client, and retries
/// across alternate endpoints on retryable failure.
pub struct RequestDispatcher {
    service_name: String,
    resolver: Arc<AddressResolver>,
    http: reqwest::Client,
    pools: Arc<BufferPools>,
    sleeper: Arc<dyn Sleeper>,
    round_robin: AtomicU64,
}

impl RequestDispatcher {
    pub fn new(service_name: impl Into<String>, resolver: Arc<AddressResolver>, pools: Arc<BufferPools>) -> Self {
        Self {
            service_name: service_name.into(),
            resolver,
            http: reqwest::Client::new(),
            pools,
            sleeper: Arc::new(TokioSleeper),
            round_robin: AtomicU64::new(0),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn get(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatch(Method::Get, spec).await
    }

    pub async fn post(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatch(Method::Post, spec).await
    }

    pub async fn put(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatch(Method::Put, spec).await
    }

    pub async fn delete(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatch(Method::Delete, spec).await
    }

    /// The attempt loop (spec §4.F). At most `1 + MAX_ADDITIONAL_ATTEMPTS` attempts.
    async fn dispatch(&self, method: Method, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        let mut failed_addresses: HashSet<String> = HashSet::new();
        let mut failures: Vec<ClientError> = Vec::new();

        for attempt in 0..=MAX_ADDITIONAL_ATTEMPTS {
            let current = self.resolver.get_addresses();
            if current.is_empty() {
                return Err(ClientError::NoEndpoints { service: self.service_name.clone() });
            }

            let available: Vec<&String> = current.iter().filter(|a| !failed_addresses.contains(*a)).collect();
            if available.is_empty() {
                return Err(ClientError::AllEndpointsFailed { service: self.service_name.clone(), failures });
            }

            let index = (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize) % available.len();
            let endpoint = available[index].clone();

            if spec.context.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let timeout = spec.effective_timeout();
            if let Some(remaining) = spec.context.remaining() {
                if remaining.is_zero() || remaining < timeout {
                    return Err(ClientError::DeadlineExceeded);
                }
            }

            tracing::debug!(service = %self.service_name, endpoint = %endpoint, attempt, "dispatching request");

            match self.attempt(method, &endpoint, &spec, timeout).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() => {
                    failed_addresses.insert(endpoint.clone());
                    ClientError::record_failure(&mut failures, err);
                    if attempt < MAX_ADDITIONAL_ATTEMPTS {
                        self.sleeper.sleep(INTER_ATTEMPT_DELAY).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(ClientError::AllEndpointsFailed { service: self.service_name.clone(), failures })
    }

    async fn attempt(
        &self,
        method: Method,
        endpoint: &str,
        spec: &CallSpec,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let url = format!("http://{}{}", endpoint, spec.path);

        // Default headers go in first; caller-supplied and trace headers are applied
        // with `upsert_header`, which replaces rather than appends, so they override
        // the defaults instead of riding alongside them as a second value.
        let mut scratch = self.pools.take_request_scratch();
        scratch.headers.push(("User-Agent".to_string(), "cg-http-client/1.0".to_string()));
        scratch.headers.push(("Accept".to_string(), "application/json".to_string()));

        if method.carries_body() {
            if let Some(body) = &spec.body {
                scratch.headers.push(("Content-Type".to_string(), "application/json".to_string()));
                match body {
                    Body::Json(value) => {
                        if let Err(e) = serde_json::to_writer(&mut scratch.body, value) {
                            self.pools.give_back_request_scratch(scratch);
                            return Err(ClientError::ConfigInvalid(format!("failed to encode request body: {}", e)));
                        }
                    }
                    Body::Raw(bytes) => scratch.body.extend_from_slice(bytes),
                }
            }
        }

        for (key, value) in &spec.headers {
            upsert_header(&mut scratch.headers, key, value.clone());
        }
        if let Some(trace_id) = &spec.context.trace_id {
            upsert_header(&mut scratch.headers, "X-Trace-ID", trace_id.clone());
        }
        if let Some(user_info) = &spec.context.user_info {
            upsert_header(&mut scratch.headers, "X-User-Info", user_info.clone());
        }
        if let Some(step_id) = &spec.context.step_id {
            upsert_header(&mut scratch.headers, "X-Step-ID", step_id.clone());
        }

        let header_map = match build_header_map(&scratch.headers) {
            Ok(map) => map,
            Err(err) => {
                self.pools.give_back_request_scratch(scratch);
                return Err(err);
            }
        };
        let body_bytes = scratch.body.clone();
        self.pools.give_back_request_scratch(scratch);

        let mut request = self.http.request(method.as_reqwest(), &url).timeout(timeout).headers(header_map);
        if !body_bytes.is_empty() {
            request = request.body(body_bytes);
        }

        let response = request.send().await.map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        let body_bytes = response.bytes().await.map_err(|e| classify_transport_error(&e))?;

        if status.as_u16() >= 400 {
            return Err(ClientError::HttpError { status: status.as_u16(), body: String::from_utf8_lossy(&body_bytes).into_owned() });
        }

        let mut response_scratch = self.pools.take_response_scratch();
        response_scratch.body.extend_from_slice(&body_bytes);

        let mut handle = self.pools.get_buffer(response_scratch.body.len());
        handle.as_mut_slice().copy_from_slice(&response_scratch.body);
        let result = handle.as_slice().to_vec();
        handle.release();
        self.pools.give_back_response_scratch(response_scratch);

        Ok(result)
    }
}

/// Replace an existing header of the same name (case-insensitive) instead of adding a
/// second value for it, so callers can override a default by supplying the same key.
fn upsert_header(headers: &mut Vec<(String, String)>, key: &str, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        Some(existing) => existing.1 = value,
        None => headers.push((key.to_string(), value)),
    }
}

fn build_header_map(headers: &[(String, String)]) -> Result<reqwest::header::HeaderMap, ClientError> {
    let mut map = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::try_from(key.as_str())
            .map_err(|e| ClientError::ConfigInvalid(format!("invalid header name {}: {}", key, e)))?;
        let val = reqwest::header::HeaderValue::try_from(value.as_str())
            .map_err(|e| ClientError::ConfigInvalid(format!("invalid header value for {}: {}", key, e)))?;
        map.insert(name, val);
    }
    Ok(map)
}

fn classify_transport_error(err: &reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::RegistryUnavailable(format!("request timed out: {}", err))
    } else {
        ClientError::RegistryUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn dispatcher_with(endpoints: &[&str]) -> (RequestDispatcher, Vec<MockServer>) {
        let mut servers = Vec::new();
        let mut addrs = Vec::new();
        for _ in endpoints {
            let server = MockServer::start().await;
            addrs.push(server.uri().trim_start_matches("http://").to_string());
            servers.push(server);
        }
        let resolver = Arc::new(AddressResolver::new("orders"));
        resolver.update_addresses(addrs);
        let dispatcher = RequestDispatcher::new("orders", resolver, Arc::new(BufferPools::new()))
            .with_sleeper(Arc::new(crate::sleeper::InstantSleeper));
        (dispatcher, servers)
    }

    #[tokio::test]
    async fn round_robin_alternates_across_two_endpoints() {
        let (dispatcher, servers) = dispatcher_with(&["a", "b"]).await;
        for server in &servers {
            Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(200).set_body_string("ok")).mount(server).await;
        }

        let mut hits = Vec::new();
        for _ in 0..4 {
            dispatcher.get(CallSpec::new("/x")).await.unwrap();
        }
        for server in &servers {
            hits.push(server.received_requests().await.unwrap().len());
        }
        assert_eq!(hits, vec![2, 2]);
    }

    #[tokio::test]
    async fn retries_on_5xx_and_succeeds_on_second_endpoint() {
        let (dispatcher, servers) = dispatcher_with(&["a", "b"]).await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(503)).mount(&servers[0]).await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_string("ok")).mount(&servers[1]).await;

        // Force selection to start on the failing endpoint.
        let result = dispatcher.get(CallSpec::new("/y")).await.unwrap();
        assert_eq!(result, b"ok");
    }

    #[tokio::test]
    async fn no_retry_on_4xx() {
        let (dispatcher, servers) = dispatcher_with(&["a"]).await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404).set_body_string("nope")).mount(&servers[0]).await;

        let err = dispatcher.get(CallSpec::new("/z")).await.unwrap_err();
        assert!(err.is_http_error());
        assert_eq!(servers[0].received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_endpoints_fails_fast() {
        let resolver = Arc::new(AddressResolver::new("orders"));
        let dispatcher = RequestDispatcher::new("orders", resolver, Arc::new(BufferPools::new()));
        let err = dispatcher.get(CallSpec::new("/x")).await.unwrap_err();
        assert!(err.is_no_endpoints());
    }

    #[tokio::test]
    async fn expired_deadline_short_circuits_without_network_io() {
        let (dispatcher, servers) = dispatcher_with(&["a"]).await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&servers[0]).await;

        let past = Instant::now() - Duration::from_secs(1);
        let ctx = CallContext::default().with_deadline(past);
        let err = dispatcher.get(CallSpec::new("/x").with_context(ctx)).await.unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert_eq!(servers[0].received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn all_endpoints_failed_after_exhausting_retries() {
        let (dispatcher, servers) = dispatcher_with(&["a", "b"]).await;
        for server in &servers {
            Mock::given(method("GET")).respond_with(ResponseTemplate::new(503)).mount(server).await;
        }

        let err = dispatcher.get(CallSpec::new("/x")).await.unwrap_err();
        assert!(err.is_all_endpoints_failed());
    }

    #[tokio::test]
    async fn caller_header_overrides_default_instead_of_appending() {
        let (dispatcher, servers) = dispatcher_with(&["a"]).await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&servers[0]).await;

        dispatcher.get(CallSpec::new("/x").with_header("Accept", "text/plain")).await.unwrap();

        let requests = servers[0].received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let accept_name: wiremock::http::HeaderName = "accept".parse().unwrap();
        let accept_values: Vec<_> = requests[0].headers.get(&accept_name).expect("accept header present").iter().collect();
        assert_eq!(accept_values.len(), 1, "caller header must replace the default, not append to it");
        assert_eq!(accept_values[0].as_str(), "text/plain");
    }

    #[tokio::test]
    async fn timeout_is_not_classified_as_an_http_error() {
        let (dispatcher, servers) = dispatcher_with(&["a"]).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&servers[0]).await;

        let err = dispatcher
            .get(CallSpec::new("/x").with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(!err.is_http_error(), "a transport timeout must not surface as ClientError::HttpError");
    }
}
