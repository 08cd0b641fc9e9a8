//! Health probe - tests a single candidate address
//!
//! One bounded-time `GET {candidate}/health`. The deadline is enforced by
//! dropping the request future, which closes the connection, so abandoned
//! probes do not pile up while a sweep walks many candidates.

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result, error_chain};
use async_trait::async_trait;
use sage_core::{Attempt, BackendInfo, BackendStatus, Candidate, FailureKind, now_millis};
use std::fmt;
use std::time::{Duration, Instant};

/// Classification of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Identity confirmed and the backend reports itself healthy.
    Healthy(BackendInfo),
    /// Connection could not be established.
    Unreachable(String),
    /// No complete answer before the deadline; the request was cancelled.
    Timeout(Duration),
    /// Non-2xx HTTP status.
    UnhealthyStatus(u16),
    /// Something answered, but it is not a SAGE backend.
    NotOurs(String),
    /// A SAGE backend that is up but not ready (status other than `healthy`).
    Unhealthy(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy(info) => write!(f, "healthy (version {})", info.version),
            ProbeOutcome::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            ProbeOutcome::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            ProbeOutcome::UnhealthyStatus(code) => write!(f, "unhealthy status: HTTP {code}"),
            ProbeOutcome::NotOurs(reason) => write!(f, "not a SAGE backend: {reason}"),
            ProbeOutcome::Unhealthy(status) => write!(f, "backend reports status '{status}'"),
        }
    }
}

impl ProbeOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ProbeOutcome::Healthy(_) => None,
            ProbeOutcome::Unreachable(_) => Some(FailureKind::Unreachable),
            ProbeOutcome::Timeout(_) => Some(FailureKind::Timeout),
            ProbeOutcome::UnhealthyStatus(_) => Some(FailureKind::UnhealthyStatus),
            ProbeOutcome::NotOurs(_) => Some(FailureKind::NotOurs),
            ProbeOutcome::Unhealthy(_) => Some(FailureKind::NotReady),
        }
    }
}

/// Outcome plus the diagnostic attempt record.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub candidate: Candidate,
    pub outcome: ProbeOutcome,
    pub attempt: Attempt,
}

impl ProbeReport {
    pub fn new(candidate: Candidate, outcome: ProbeOutcome, elapsed: Duration) -> Self {
        let url = candidate.url();
        let elapsed_ms = elapsed.as_millis() as u64;
        let attempt = match outcome.failure_kind() {
            None => Attempt::succeeded(url, elapsed_ms),
            Some(kind) => Attempt::failed(url, elapsed_ms, kind, outcome.to_string()),
        };
        Self {
            candidate,
            outcome,
            attempt,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Healthy(_))
    }

    pub fn backend(&self) -> Option<&BackendInfo> {
        match &self.outcome {
            ProbeOutcome::Healthy(info) => Some(info),
            _ => None,
        }
    }

    /// Map the outcome onto the error taxonomy.
    pub fn into_result(self) -> Result<BackendInfo> {
        let url = self.candidate.url();
        match self.outcome {
            ProbeOutcome::Healthy(info) => Ok(info),
            ProbeOutcome::Unreachable(reason) => Err(Error::Unreachable { url, reason }),
            ProbeOutcome::Timeout(after) => Err(Error::Timeout { url, after }),
            ProbeOutcome::UnhealthyStatus(status) => Err(Error::Application {
                url,
                status,
                body: "health check failed".to_string(),
            }),
            ProbeOutcome::NotOurs(reason) => Err(Error::AuthenticityMismatch { url, reason }),
            ProbeOutcome::Unhealthy(status) => Err(Error::NotReady { url, status }),
        }
    }
}

/// Seam between discovery and the network.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, candidate: &Candidate) -> ProbeReport;
}

/// Probes `/health` over HTTP(S) and checks the service identity.
pub struct HttpProbe {
    client: reqwest::Client,
    health_path: String,
    identity: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(
        timeout: Duration,
        health_path: impl Into<String>,
        identity: impl Into<String>,
    ) -> Result<Self> {
        // Loopback traffic must never go through a system proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(error_chain(&e)))?;

        Ok(Self {
            client,
            health_path: normalize_path(health_path.into()),
            identity: identity.into(),
            timeout,
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        Self::new(
            config.probe_timeout,
            config.health_path.clone(),
            config.service_identity.clone(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_url(&self, candidate: &Candidate) -> String {
        format!("{}{}", candidate, self.health_path)
    }

    async fn fetch(&self, url: &str) -> std::result::Result<(u16, Vec<u8>), reqwest::Error> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, candidate: &Candidate) -> ProbeReport {
        let url = self.health_url(candidate);
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.fetch(&url)).await {
            Err(_) => ProbeOutcome::Timeout(self.timeout),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Timeout(self.timeout),
            Ok(Err(e)) => ProbeOutcome::Unreachable(error_chain(&e)),
            Ok(Ok((status, body))) => classify(candidate, status, &body, &self.identity),
        };

        let elapsed = started.elapsed();
        tracing::debug!(
            url = %url,
            elapsed_ms = elapsed.as_millis() as u64,
            outcome = %outcome,
            "Health probe finished"
        );

        ProbeReport::new(candidate.clone(), outcome, elapsed)
    }
}

/// Decide what answered. Only a 2xx JSON payload naming `identity` in its
/// `service` field is accepted as ours.
pub fn classify(candidate: &Candidate, status: u16, body: &[u8], identity: &str) -> ProbeOutcome {
    if !(200..300).contains(&status) {
        return ProbeOutcome::UnhealthyStatus(status);
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
        return ProbeOutcome::NotOurs("response is not JSON".to_string());
    };

    match payload.get("service").and_then(|v| v.as_str()) {
        None => {
            return ProbeOutcome::NotOurs("payload has no service identity field".to_string());
        }
        Some(service) if service != identity => {
            return ProbeOutcome::NotOurs(format!("payload identifies as '{service}'"));
        }
        Some(_) => {}
    }

    let reported = payload
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("missing");
    if !reported.eq_ignore_ascii_case("healthy") {
        return ProbeOutcome::Unhealthy(reported.to_string());
    }

    let version = payload
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    ProbeOutcome::Healthy(BackendInfo {
        url: candidate.url(),
        port: candidate.port,
        version,
        status: BackendStatus::Healthy,
        validated_at: now_millis(),
    })
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}
