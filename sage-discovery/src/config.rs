//! Discovery configuration
//!
//! Defaults match a stock SAGE install. Everything can be overridden from the
//! process environment, which is read once at startup.

use sage_core::{
    DEFAULT_BACKEND_URL, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_TTL, DEFAULT_HEALTH_PATH, DEFAULT_PORTS,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, Origin, SERVICE_IDENTITY,
};
use std::time::Duration;

pub const ENV_BACKEND_URL: &str = "SAGE_BACKEND_URL";
pub const ENV_BACKEND_PORTS: &str = "SAGE_BACKEND_PORTS";
pub const ENV_ORIGIN: &str = "SAGE_ORIGIN";
pub const ENV_PROBE_TIMEOUT_MS: &str = "SAGE_PROBE_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "SAGE_REQUEST_TIMEOUT_MS";
pub const ENV_BATCH_SIZE: &str = "SAGE_BATCH_SIZE";

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where the caller itself is served from.
    pub origin: Origin,
    /// Well-known backend ports, in preference order.
    pub ports: Vec<u16>,
    /// Tried before anything else when set.
    pub override_url: Option<String>,
    pub health_path: String,
    /// Expected `service` field in the health payload.
    pub service_identity: String,
    pub probe_timeout: Duration,
    /// Probes in flight at once during a full sweep.
    pub batch_size: usize,
    pub cache_ttl: Duration,
    /// Per-request timeout for application calls.
    pub request_timeout: Duration,
    /// Address used by the client until discovery finishes.
    pub default_backend_url: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            origin: Origin::default(),
            ports: DEFAULT_PORTS.to_vec(),
            override_url: None,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            service_identity: SERVICE_IDENTITY.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_backend_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Defaults overlaid with `SAGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DiscoveryConfig::from_env`] with an explicit variable source.
    /// Malformed values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_BACKEND_URL) {
            config.override_url = Some(url.trim().to_string());
        }

        if let Some(raw) = get(ENV_BACKEND_PORTS) {
            match parse_port_list(&raw) {
                Some(ports) => config.ports = ports,
                None => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_BACKEND_PORTS),
            }
        }

        if let Some(raw) = get(ENV_ORIGIN) {
            match Origin::parse(&raw) {
                Ok(origin) => config.origin = origin,
                Err(e) => tracing::warn!(value = %raw, "Ignoring invalid {}: {}", ENV_ORIGIN, e),
            }
        }

        if let Some(ms) = get(ENV_PROBE_TIMEOUT_MS).and_then(|v| parse_positive(&v)) {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = get(ENV_REQUEST_TIMEOUT_MS).and_then(|v| parse_positive(&v)) {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = get(ENV_BATCH_SIZE).and_then(|v| parse_positive(&v)) {
            config.batch_size = n as usize;
        }

        config
    }
}

/// `"8001, 8002"` -> `[8001, 8002]`. Rejects empty lists and port 0.
pub fn parse_port_list(raw: &str) -> Option<Vec<u16>> {
    let ports = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u16>().ok().filter(|p| *p != 0))
        .collect::<Option<Vec<_>>>()?;
    if ports.is_empty() { None } else { Some(ports) }
}

fn parse_positive(raw: &str) -> Option<u64> {
    let parsed = raw.trim().parse::<u64>().ok().filter(|v| *v > 0);
    if parsed.is_none() {
        tracing::warn!(value = %raw, "Ignoring non-positive numeric override");
    }
    parsed
}
