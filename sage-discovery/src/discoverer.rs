//! Discoverer - one discovery run over cache, candidates, and probes
//!
//! Fast path: re-probe the cached address, one probe total. Otherwise sweep
//! the generated candidates in fixed-size concurrent batches. The first
//! healthy candidate in generator order wins and no later batch is issued.

use crate::cache::{DiscoveryCache, FileStore, MemoryStore};
use crate::candidates;
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::probe::{HttpProbe, Probe, ProbeOutcome, ProbeReport};
use sage_core::{Attempt, BackendInfo, Candidate, DiscoveryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

pub struct Discoverer {
    config: DiscoveryConfig,
    probe: Arc<dyn Probe>,
    cache: Option<DiscoveryCache>,
}

impl Discoverer {
    pub fn new(config: DiscoveryConfig, probe: Arc<dyn Probe>, cache: DiscoveryCache) -> Self {
        Self {
            config,
            probe,
            cache: Some(cache),
        }
    }

    /// HTTP probing plus the on-disk cache under `SAGE_HOME`. Falls back to an
    /// in-memory cache when no home directory can be determined.
    pub fn from_config(config: DiscoveryConfig) -> Result<Self> {
        let probe = Arc::new(HttpProbe::from_config(&config)?);
        let cache = match FileStore::default_location() {
            Ok(store) => DiscoveryCache::new(Box::new(store), config.cache_ttl),
            Err(e) => {
                tracing::warn!("Using in-memory discovery cache: {}", e);
                DiscoveryCache::new(Box::new(MemoryStore::new()), config.cache_ttl)
            }
        };
        Ok(Self::new(config, probe, cache))
    }

    /// Skip the cache entirely: no fast path, no write-back.
    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&DiscoveryCache> {
        self.cache.as_ref()
    }

    /// Addresses a full sweep would try, in probe order.
    pub fn candidates(&self) -> Vec<Candidate> {
        candidates::generate(
            &self.config.origin,
            &self.config.ports,
            self.config.override_url.as_deref(),
        )
    }

    /// Run one discovery. Never retries on its own; the caller decides when to
    /// try again.
    pub async fn discover(&self) -> DiscoveryResult {
        let mut attempts = Vec::new();

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.read() {
                match Candidate::parse(&entry.backend.url) {
                    Ok(candidate) => {
                        let report = self.probe.probe(&candidate).await;
                        let attempt = report.attempt.clone();
                        if let ProbeOutcome::Healthy(backend) = report.outcome {
                            tracing::debug!(url = %backend.url, "Cached backend still healthy");
                            return DiscoveryResult::found(backend, vec![attempt]);
                        }
                        tracing::info!(
                            url = %entry.backend.url,
                            reason = %report.outcome,
                            "Cached backend failed re-check, rediscovering"
                        );
                        attempts.push(attempt);
                    }
                    Err(e) => {
                        tracing::warn!(url = %entry.backend.url, "Cached backend address is invalid: {}", e);
                    }
                }
            }
            // Whatever is stored did not yield a live backend; the sweep
            // starts from a clean slate.
            cache.invalidate();
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return DiscoveryResult::failed("no candidate addresses configured", attempts);
        }

        let batch_size = self.config.batch_size.max(1);
        for (round, batch) in candidates.chunks(batch_size).enumerate() {
            tracing::debug!(round, size = batch.len(), "Probing candidate batch");

            let reports = self.probe_batch(batch).await;
            let mut winner: Option<BackendInfo> = None;
            for report in reports {
                attempts.push(report.attempt);
                if winner.is_none()
                    && let ProbeOutcome::Healthy(backend) = report.outcome
                {
                    winner = Some(backend);
                }
            }

            if let Some(backend) = winner {
                tracing::info!(
                    url = %backend.url,
                    version = %backend.version,
                    attempts = attempts.len(),
                    "Discovered SAGE backend"
                );
                if let Some(cache) = &self.cache {
                    cache.write(&backend);
                }
                return DiscoveryResult::found(backend, attempts);
            }
        }

        let err = Error::ExhaustedCandidates {
            attempts: attempts.clone(),
        };
        tracing::warn!(attempts = attempts.len(), "{}", err);
        DiscoveryResult::failed(err.to_string(), attempts)
    }

    /// [`Discoverer::discover`] as a `Result`.
    pub async fn discover_backend(&self) -> Result<BackendInfo> {
        let result = self.discover().await;
        match result.backend {
            Some(backend) => Ok(backend),
            None => Err(Error::ExhaustedCandidates {
                attempts: result.attempts,
            }),
        }
    }

    /// Probe every member of `batch` concurrently and wait for all of them.
    /// Reports come back in batch order regardless of completion order.
    async fn probe_batch(&self, batch: &[Candidate]) -> Vec<ProbeReport> {
        let mut set = JoinSet::new();
        for (idx, candidate) in batch.iter().cloned().enumerate() {
            let probe = self.probe.clone();
            set.spawn(async move { (idx, probe.probe(&candidate).await) });
        }

        let mut slots: Vec<Option<ProbeReport>> = vec![None; batch.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, report)) => slots[idx] = Some(report),
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(batch)
            .map(|(slot, candidate)| {
                slot.unwrap_or_else(|| {
                    ProbeReport::new(
                        candidate.clone(),
                        ProbeOutcome::Unreachable("probe task aborted".to_string()),
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }
}

/// URLs of `attempts`, for logs and assertions.
pub fn attempted_urls(attempts: &[Attempt]) -> Vec<&str> {
    attempts.iter().map(|a| a.url.as_str()).collect()
}
