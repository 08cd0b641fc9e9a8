use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Fatal launcher errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not free port {port}{}: {reason}", pid_suffix(.pid))]
    PortReclaimFailure {
        port: u16,
        pid: Option<u32>,
        reason: String,
    },

    #[error("backend at {url} was not ready after {}s: {last_error}", .waited.as_secs())]
    ReadinessTimeout {
        url: String,
        waited: Duration,
        last_error: String,
    },

    #[error("failed to start {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("{name} exited during startup ({})\n{log_tail}", describe_status(.status))]
    ProcessExited {
        name: String,
        status: Option<ExitStatus>,
        log_tail: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] sage_discovery::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub fn guidance(&self) -> &'static str {
        match self {
            LaunchError::PortReclaimFailure { .. } => {
                "Another program is holding a port SAGE needs. Close it or restart the computer, then launch SAGE again."
            }
            LaunchError::ReadinessTimeout { .. } => {
                "The assistant took too long to start. Check logs/backend.log on the SAGE drive."
            }
            LaunchError::SpawnFailed { .. } | LaunchError::ProcessExited { .. } => {
                "A SAGE component failed to start. Check the logs folder on the SAGE drive."
            }
            LaunchError::Config(_) => "Fix sage.toml on the SAGE drive, or delete it to use defaults.",
            LaunchError::Discovery(e) => e.guidance(),
            LaunchError::Io(_) => "Check that the SAGE drive is still connected and writable.",
        }
    }
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|p| format!(" (held by pid {p})")).unwrap_or_default()
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(s) => s.to_string(),
        None => "status unknown".to_string(),
    }
}
