//! Discovery data model
//!
//! Candidates are produced fresh on every discovery run and never mutated.
//! A `BackendInfo` only exists once a candidate passed the authenticity check.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing scheme in '{0}' (expected http:// or https://)")]
    MissingScheme(String),

    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("missing host in '{0}'")]
    MissingHost(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// Splits `scheme://host[:port][/path]` into its parts. IPv6 hosts must be
/// bracketed and are returned without brackets.
fn split_address(url: &str) -> Result<(Scheme, String, Option<u16>), AddressParseError> {
    let trimmed = url.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| AddressParseError::MissingScheme(trimmed.to_string()))?;
    let scheme = Scheme::parse(scheme)
        .ok_or_else(|| AddressParseError::UnsupportedScheme(scheme.to_string()))?;

    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    // Drop userinfo, it never identifies a backend.
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(AddressParseError::MissingHost(trimmed.to_string()));
    }

    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, after) = v6
            .split_once(']')
            .ok_or_else(|| AddressParseError::MissingHost(trimmed.to_string()))?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| AddressParseError::InvalidPort(trimmed.to_string()))?,
            ),
            None if after.is_empty() => None,
            None => return Err(AddressParseError::InvalidPort(trimmed.to_string())),
        };
        (host.to_string(), port)
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(trimmed.to_string()))?;
        (host.to_string(), Some(port))
    } else {
        (authority.to_string(), None)
    };

    if host.is_empty() {
        return Err(AddressParseError::MissingHost(trimmed.to_string()));
    }

    Ok((scheme, host.to_ascii_lowercase(), port))
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{host}]")
    } else {
        f.write_str(host)
    }
}

/// The page (or process) origin discovery runs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
        }
    }

    /// Parse an origin such as `http://192.168.1.5:8080`. The port is ignored.
    pub fn parse(url: &str) -> Result<Self, AddressParseError> {
        let (scheme, host, _) = split_address(url)?;
        Ok(Self { scheme, host })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new(Scheme::Http, "localhost")
    }
}

/// An address to try. Not validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse an absolute URL. A missing port falls back to the scheme default.
    pub fn parse(url: &str) -> Result<Self, AddressParseError> {
        let (scheme, host, port) = split_address(url)?;
        Ok(Self {
            port: port.unwrap_or_else(|| scheme.default_port()),
            scheme,
            host,
        })
    }

    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        write_host(f, &self.host)?;
        write!(f, ":{}", self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Healthy,
    Unhealthy,
}

/// A backend that passed the authenticity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub url: String,
    pub port: u16,
    pub version: String,
    pub status: BackendStatus,
    /// Unix millis of the probe that validated this backend.
    pub validated_at: u64,
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    Timeout,
    UnhealthyStatus,
    /// Something else answered on the port.
    NotOurs,
    /// SAGE answered but is still starting.
    NotReady,
}

/// One probe outcome, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub url: String,
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Attempt {
    pub fn succeeded(url: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            url: url.into(),
            success: true,
            response_time_ms,
            kind: None,
            error: None,
        }
    }

    pub fn failed(
        url: impl Into<String>,
        response_time_ms: u64,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            success: false,
            response_time_ms,
            kind: Some(kind),
            error: Some(error.into()),
        }
    }

    pub fn failed_with(&self, kind: FailureKind) -> bool {
        self.kind == Some(kind)
    }
}

/// Terminal output of one discovery run.
///
/// Built only through [`DiscoveryResult::found`] and [`DiscoveryResult::failed`]
/// so that `success` always matches the presence of `backend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: Vec<Attempt>,
}

impl DiscoveryResult {
    pub fn found(backend: BackendInfo, attempts: Vec<Attempt>) -> Self {
        Self {
            success: true,
            backend: Some(backend),
            error: None,
            attempts,
        }
    }

    pub fn failed(error: impl Into<String>, attempts: Vec<Attempt>) -> Self {
        Self {
            success: false,
            backend: None,
            error: Some(error.into()),
            attempts,
        }
    }
}

/// Persisted record of the last known-good backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub backend: BackendInfo,
    /// Unix millis.
    pub cached_at: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at) < ttl_ms
    }
}

/// Body of `GET /health` on a SAGE backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthPayload {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}
