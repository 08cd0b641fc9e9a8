//! Resilient client - application requests against the current backend
//!
//! Requests go to whatever [`BackendUrl`] holds. It starts at the configured
//! default and is replaced by the first discovery result, which runs in the
//! background so early callers are never blocked on it.
//!
//! A connection-class failure (unreachable or timed out) triggers exactly one
//! rediscovery and one retry. HTTP error statuses are real answers from the
//! backend and are returned as-is.

use crate::config::DiscoveryConfig;
use crate::discoverer::Discoverer;
use crate::error::{Error, Result, error_chain};
use crate::probe::{HttpProbe, Probe};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use sage_core::{BackendInfo, Candidate};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shared, swappable "current backend URL".
#[derive(Debug, Clone)]
pub struct BackendUrl(Arc<RwLock<String>>);

impl BackendUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(url.into())))
    }

    pub fn get(&self) -> String {
        self.0.read().clone()
    }

    pub fn set(&self, url: impl Into<String>) {
        *self.0.write() = url.into();
    }
}

/// A request that can be replayed against a different base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Fully buffered successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct ResilientClient {
    http: reqwest::Client,
    probe: HttpProbe,
    discoverer: Arc<Discoverer>,
    current: BackendUrl,
    request_timeout: Duration,
    discovery_started: AtomicBool,
    initial_discovery: Mutex<Option<JoinHandle<()>>>,
    /// Set once a foreground discovery has written `current`. The background
    /// task checks it under the same lock and leaves newer addresses alone.
    pinned: Arc<Mutex<bool>>,
    rediscoveries: AtomicU64,
}

impl ResilientClient {
    pub fn new(discoverer: Arc<Discoverer>) -> Result<Self> {
        let cell = BackendUrl::new(discoverer.config().default_backend_url.clone());
        Self::with_backend_url(discoverer, cell)
    }

    /// Use a caller-owned URL cell, e.g. to share it with a UI layer.
    pub fn with_backend_url(discoverer: Arc<Discoverer>, current: BackendUrl) -> Result<Self> {
        let config: &DiscoveryConfig = discoverer.config();
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(config.probe_timeout)
            .build()
            .map_err(|e| Error::Request(error_chain(&e)))?;
        let probe = HttpProbe::from_config(config)?;
        let request_timeout = config.request_timeout;

        Ok(Self {
            http,
            probe,
            discoverer,
            current,
            request_timeout,
            discovery_started: AtomicBool::new(false),
            initial_discovery: Mutex::new(None),
            pinned: Arc::new(Mutex::new(false)),
            rediscoveries: AtomicU64::new(0),
        })
    }

    pub fn backend_url(&self) -> BackendUrl {
        self.current.clone()
    }

    pub fn current_url(&self) -> String {
        self.current.get()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Rediscoveries triggered by connection failures so far.
    pub fn rediscovery_count(&self) -> u64 {
        self.rediscoveries.load(Ordering::Relaxed)
    }

    /// Kick off background discovery once. Later calls are no-ops.
    pub fn start_discovery(&self) {
        if self.discovery_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let discoverer = self.discoverer.clone();
        let cell = self.current.clone();
        let pinned = self.pinned.clone();
        let handle = tokio::spawn(async move {
            let result = discoverer.discover().await;
            match result.backend {
                Some(backend) => {
                    let pinned = pinned.lock();
                    if *pinned {
                        tracing::debug!(
                            url = %backend.url,
                            current = %cell.get(),
                            "Initial discovery finished after a rediscovery, keeping newer address"
                        );
                    } else {
                        tracing::info!(url = %backend.url, "Using discovered backend");
                        cell.set(backend.url);
                    }
                }
                None => tracing::warn!(
                    url = %cell.get(),
                    "Initial discovery found no backend, keeping default address"
                ),
            }
        });
        *self.initial_discovery.lock() = Some(handle);
    }

    /// Start background discovery if needed and wait for it to finish.
    pub async fn wait_for_discovery(&self) {
        self.start_discovery();
        let handle = self.initial_discovery.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("Background discovery task failed: {}", e);
        }
    }

    /// Run discovery now and switch to its result.
    pub async fn refresh(&self) -> Result<BackendInfo> {
        let backend = self.discoverer.discover_backend().await?;
        self.adopt(&backend.url);
        Ok(backend)
    }

    /// Live health of the current backend, identity check included.
    pub async fn health(&self) -> Result<BackendInfo> {
        let candidate = Candidate::parse(&self.current.get())?;
        self.probe.probe(&candidate).await.into_result()
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.with_rediscovery(|base| self.send_buffered(base, request))
            .await
    }

    /// For streaming endpoints: the response is handed over once headers
    /// arrive, and the caller drains the body (e.g. with `chunk()`).
    pub async fn stream(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        self.with_rediscovery(|base| self.send_streaming(base, request))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(&ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| Error::Request(e.to_string()))?;
        self.send(&ApiRequest::post(path, body)).await?.json()
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(&ApiRequest::delete(path)).await?.json()
    }

    async fn with_rediscovery<T, F, Fut>(&self, attempt: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.start_discovery();

        let base = self.current.get();
        let err = match attempt(base.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_connection_class() => err,
            Err(err) => return Err(err),
        };

        tracing::warn!(url = %base, "Backend connection failed, rediscovering: {}", err);
        self.rediscoveries.fetch_add(1, Ordering::Relaxed);

        let Some(new_base) = self.rediscover().await else {
            return Err(err);
        };

        match attempt(new_base.clone()).await {
            Ok(value) => Ok(value),
            Err(retry_err) => {
                tracing::warn!(url = %new_base, "Retry after rediscovery failed: {}", retry_err);
                Err(err)
            }
        }
    }

    async fn rediscover(&self) -> Option<String> {
        let result = self.discoverer.discover().await;
        match result.backend {
            Some(backend) => {
                self.adopt(&backend.url);
                Some(backend.url)
            }
            None => {
                tracing::warn!(
                    attempts = result.attempts.len(),
                    "Rediscovery found no backend"
                );
                None
            }
        }
    }

    /// Switch to `url` and keep the initial background discovery from
    /// overwriting it later.
    fn adopt(&self, url: &str) {
        let mut pinned = self.pinned.lock();
        *pinned = true;
        self.current.set(url);
    }

    fn build(&self, url: &str, request: &ApiRequest) -> Result<reqwest::RequestBuilder> {
        let target = if request.query.is_empty() {
            reqwest::Url::parse(url)
        } else {
            reqwest::Url::parse_with_params(url, &request.query)
        }
        .map_err(|e| Error::Request(format!("{url}: {e}")))?;
        let mut builder = self.http.request(request.method.clone(), target);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        tracing::debug!(method = %request.method, url = %url, "Sending backend request");
        Ok(builder)
    }

    /// Timeout covers the whole exchange, body included.
    async fn send_buffered(&self, base: String, request: &ApiRequest) -> Result<ApiResponse> {
        let url = join_url(&base, &request.path);
        let timeout = request.timeout.unwrap_or(self.request_timeout);
        let builder = self.build(&url, request)?;

        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, body.to_vec()))
        };
        let (status, body) = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => return Err(Error::Timeout { url, after: timeout }),
            Ok(Err(e)) => return Err(Error::from_reqwest(&url, e, timeout)),
            Ok(Ok(v)) => v,
        };

        if !(200..300).contains(&status) {
            return Err(Error::Application {
                url,
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(ApiResponse { url, status, body })
    }

    /// Timeout covers only the wait for response headers.
    async fn send_streaming(&self, base: String, request: &ApiRequest) -> Result<reqwest::Response> {
        let url = join_url(&base, &request.path);
        let timeout = request.timeout.unwrap_or(self.request_timeout);
        let builder = self.build(&url, request)?;

        let resp = match tokio::time::timeout(timeout, builder.send()).await {
            Err(_) => return Err(Error::Timeout { url, after: timeout }),
            Ok(Err(e)) => return Err(Error::from_reqwest(&url, e, timeout)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Application { url, status, body });
        }
        Ok(resp)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
