//! SAGE discovery - find, validate, and stay connected to the local backend
//!
//! ```text
//! ResilientClient ──(connection-class failure)──▶ Discoverer::discover()
//!                                                    ├── DiscoveryCache (fast path, one probe)
//!                                                    ├── candidates::generate()
//!                                                    └── Probe (batched, bounded concurrency)
//! ```
//!
//! The backend has no fixed address. Discovery tries a short, ordered list of
//! candidates and only accepts one whose `/health` payload carries the SAGE
//! service identity, so an unrelated process on a well-known port is never
//! mistaken for the backend.

pub mod cache;
pub mod candidates;
pub mod client;
pub mod config;
pub mod discoverer;
mod error;
pub mod probe;

pub use cache::{CacheError, CacheStore, DiscoveryCache, FileStore, MemoryStore};
pub use client::{ApiRequest, BackendUrl, ResilientClient};
pub use config::DiscoveryConfig;
pub use discoverer::Discoverer;
pub use error::{Error, Result};
pub use probe::{HttpProbe, Probe, ProbeOutcome, ProbeReport};
