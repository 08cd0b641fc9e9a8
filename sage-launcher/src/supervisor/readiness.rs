//! Readiness wait - poll the backend health endpoint until it answers as SAGE

use sage_core::{BackendInfo, Candidate, SERVICE_IDENTITY};
use sage_discovery::{HttpProbe, Probe};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use super::ServiceProcess;
use crate::defaults;
use crate::error::LaunchError;

pub struct Readiness {
    url: String,
    candidate: Candidate,
    probe: HttpProbe,
    interval: Duration,
    deadline: Duration,
}

impl Readiness {
    pub fn new(
        url: impl Into<String>,
        health_path: &str,
        interval: Duration,
        deadline: Duration,
    ) -> Result<Self, LaunchError> {
        let url = url.into();
        let candidate = Candidate::parse(&url).map_err(sage_discovery::Error::from)?;
        let probe = HttpProbe::new(defaults::READINESS_PROBE_TIMEOUT, health_path, SERVICE_IDENTITY)?;
        Ok(Self {
            url,
            candidate,
            probe,
            interval,
            deadline,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Probe every `interval` until the backend is healthy or `deadline` passes.
///
/// When `process` is given and exits first, that is reported instead of
/// waiting out the deadline.
pub async fn wait_until_ready(
    readiness: &Readiness,
    process: Option<&ServiceProcess>,
) -> Result<BackendInfo, LaunchError> {
    let started = Instant::now();
    let mut interval = tokio::time::interval(readiness.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    loop {
        interval.tick().await;

        if let Some(process) = process
            && let Some(status) = process.exit_status()
        {
            return Err(LaunchError::ProcessExited {
                name: process.name.clone(),
                status: Some(status),
                log_tail: process.log_tail(defaults::LOG_TAIL_LINES),
            });
        }

        attempts += 1;
        let last_error = match readiness.probe.probe(&readiness.candidate).await.into_result() {
            Ok(info) => {
                tracing::debug!(
                    url = %readiness.url,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Readiness check passed"
                );
                return Ok(info);
            }
            Err(e) => {
                tracing::debug!(url = %readiness.url, attempt = attempts, "Not ready yet: {}", e);
                e.to_string()
            }
        };

        if started.elapsed() >= readiness.deadline {
            return Err(LaunchError::ReadinessTimeout {
                url: readiness.url.clone(),
                waited: started.elapsed(),
                last_error,
            });
        }
    }
}
