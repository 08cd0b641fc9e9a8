//! SAGE Core - Shared discovery data model
//!
//! This crate contains the types shared between the discovery client
//! (`sage-discovery`) and the launcher (`sage-launcher`): candidate
//! addresses, probe attempts, discovery results, and the cache record.
//!
//! Everything here is plain data. Network I/O lives in `sage-discovery`,
//! process management lives in `sage-launcher`.

mod model;

pub use model::*;

use std::time::Duration;

/// Value of the `service` field every SAGE backend returns from `/health`.
pub const SERVICE_IDENTITY: &str = "SAGE RAG API";

pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_PORTS: &[u16] = &[8001];
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8001";

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Covers slow local inference on the backend.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Name of the single persisted discovery entry.
pub const CACHE_KEY: &str = "sage-backend-discovery";

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
