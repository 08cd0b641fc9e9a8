use std::time::Duration;

pub const BACKEND_PORT: u16 = 8001;
pub const FRONTEND_PORT: u16 = 5173;
pub const GRPC_PORT: u16 = 50051;
pub const OWNED_PORTS: &[u16] = &[BACKEND_PORT, FRONTEND_PORT, GRPC_PORT];

pub const READINESS_INTERVAL: Duration = Duration::from_secs(1);
pub const READINESS_DEADLINE: Duration = Duration::from_secs(120);
pub const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Time the OS gets to release a port after its owner was killed.
pub const PORT_RELEASE_DELAY: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

pub const LOG_TAIL_LINES: usize = 40;
