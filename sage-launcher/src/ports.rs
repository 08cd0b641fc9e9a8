//! Port reclaimer - frees the ports SAGE owns before startup
//!
//! A previous run that crashed, or was unplugged mid-session, can leave a
//! listener behind. Whatever holds an owned port is force-killed; the port is
//! then verified free after a short release delay.

use std::io;
use std::net::TcpListener;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use crate::defaults;
use crate::error::LaunchError;

/// OS process operations needed by the launcher.
pub trait PlatformProcesses: Send + Sync {
    /// Pids listening on `port` (TCP, any local address).
    fn listener_pids(&self, port: u16) -> io::Result<Vec<u32>>;

    /// Force-terminate `pid`. A pid that is already gone is not an error.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    fn is_running(&self, pid: u32) -> bool;
}

/// The host OS, via `lsof`/`kill` on unix and `netstat`/`taskkill` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl PlatformProcesses for SystemProcesses {
    #[cfg(unix)]
    fn listener_pids(&self, port: u16) -> io::Result<Vec<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-tiTCP:{port}"), "-sTCP:LISTEN"])
            .output();

        match output {
            // lsof exits 1 with empty output when nothing matches.
            Ok(out) => Ok(parse_pid_lines(&String::from_utf8_lossy(&out.stdout))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(port, "lsof not installed, falling back to a bind check");
                if port_is_bindable(port) {
                    Ok(Vec::new())
                } else {
                    Err(io::Error::other(
                        "port is in use and lsof is not available to find its owner",
                    ))
                }
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(windows)]
    fn listener_pids(&self, port: u16) -> io::Result<Vec<u32>> {
        let output = Command::new("netstat").arg("-ano").output()?;
        Ok(parse_netstat_listeners(
            &String::from_utf8_lossy(&output.stdout),
            port,
        ))
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain syscall, no memory is shared with the callee.
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let output = Command::new("taskkill").args(taskkill_args(pid, true)).output()?;
        if output.status.success() || !self.is_running(pid) {
            Ok(())
        } else {
            Err(io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut sys = sysinfo::System::new();
        sys.refresh_processes(
            sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
            false,
        );
        sys.process(sysinfo::Pid::from_u32(pid)).is_some()
    }
}

pub fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg_attr(windows, allow(dead_code))]
fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// `taskkill` arguments for `pid` and its whole process tree. Without
/// `force` Windows asks the tree to close instead of ending it.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn taskkill_args(pid: u32, force: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(4);
    if force {
        args.push("/F".to_string());
    }
    args.extend(["/T".to_string(), "/PID".to_string(), pid.to_string()]);
    args
}

/// `netstat -ano` rows look like
/// `TCP    0.0.0.0:8001    0.0.0.0:0    LISTENING    4242`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !cols[1].ends_with(&suffix) || cols[3] != "LISTENING" {
                return None;
            }
            cols[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Listeners killed during one reclaim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub killed: Vec<(u16, u32)>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty()
    }
}

pub struct PortReclaimer {
    platform: Arc<dyn PlatformProcesses>,
    release_delay: Duration,
    own_pid: u32,
}

impl PortReclaimer {
    pub fn new(platform: Arc<dyn PlatformProcesses>) -> Self {
        Self {
            platform,
            release_delay: defaults::PORT_RELEASE_DELAY,
            own_pid: std::process::id(),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemProcesses))
    }

    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Free every port in `ports`. Ports with no listener are left alone,
    /// so running this twice is harmless.
    pub async fn reclaim(&self, ports: &[u16]) -> Result<ReclaimReport, LaunchError> {
        let mut report = ReclaimReport::default();

        for &port in ports {
            let pids = self.listeners(port)?;
            if pids.is_empty() {
                tracing::debug!(port, "Port is free");
                continue;
            }

            for pid in pids {
                tracing::info!(port, pid, "Terminating stale listener");
                self.platform
                    .terminate(pid)
                    .map_err(|e| LaunchError::PortReclaimFailure {
                        port,
                        pid: Some(pid),
                        reason: e.to_string(),
                    })?;
                report.killed.push((port, pid));
            }

            tokio::time::sleep(self.release_delay).await;

            for &(_, pid) in report.killed.iter().filter(|(p, _)| *p == port) {
                if self.platform.is_running(pid) {
                    tracing::warn!(port, pid, "Process still running after kill");
                }
            }

            if let Some(&pid) = self.listeners(port)?.first() {
                return Err(LaunchError::PortReclaimFailure {
                    port,
                    pid: Some(pid),
                    reason: "still listening after termination".to_string(),
                });
            }
            tracing::info!(port, "Port reclaimed");
        }

        Ok(report)
    }

    fn listeners(&self, port: u16) -> Result<Vec<u32>, LaunchError> {
        let pids = self
            .platform
            .listener_pids(port)
            .map_err(|e| LaunchError::PortReclaimFailure {
                port,
                pid: None,
                reason: e.to_string(),
            })?;
        Ok(pids.into_iter().filter(|&pid| pid != self.own_pid).collect())
    }
}
