//! Service supervisor - starts the SAGE processes and waits for the backend
//!
//! Startup is a fixed sequence: reclaim owned ports, start every managed
//! process detached with its output appended to `logs/<name>.log`, then poll
//! the backend health endpoint until it answers as SAGE. Any failure is fatal
//! and tears down whatever was already started.

mod readiness;

pub use readiness::{Readiness, wait_until_ready};

use parking_lot::{Mutex, RwLock};
use sage_core::BackendInfo;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::{LauncherConfig, ServiceConfig};
use crate::defaults;
use crate::error::LaunchError;
use crate::paths;
use crate::ports::PortReclaimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ProcessState {
    fn can_become(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }
}

/// Progress reported while starting and stopping.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    PortReclaimed { port: u16, pid: u32 },
    ProcessStarted { name: String, pid: Option<u32> },
    WaitingForReadiness { url: String },
    Ready { backend: BackendInfo },
    ProcessFailed { name: String, reason: String },
    Stopped { name: String },
}

/// One managed child process.
pub struct ServiceProcess {
    pub name: String,
    pub working_dir: PathBuf,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
    state: RwLock<ProcessState>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
}

impl ServiceProcess {
    pub fn new(
        name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        command: Vec<String>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            command,
            env: BTreeMap::new(),
            log_path: log_path.into(),
            state: RwLock::new(ProcessState::NotStarted),
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
        }
    }

    /// Build from a `[backend]`/`[frontend]` section, resolving paths against
    /// the medium root and preferring bundled interpreters.
    pub fn from_config(name: &str, root: &Path, config: &ServiceConfig) -> Self {
        let mut command = config.command.clone();
        if let Some(program) = command.first_mut()
            && let Some(bundled) = paths::bundled_program(root, program)
        {
            *program = bundled.to_string_lossy().into_owned();
        }

        let working_dir = config
            .working_dir
            .as_deref()
            .map(|dir| paths::under_root(root, dir))
            .unwrap_or_else(|| root.to_path_buf());
        let log_path = paths::logs_dir(root).join(format!("{name}.log"));

        let mut process = Self::new(name, working_dir, command, log_path);
        process.env = config.env.clone();
        if let Some(port) = config.port {
            process.env.insert("PORT".to_string(), port.to_string());
        }
        process
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    /// Move to `next` if allowed. Invalid transitions are logged and ignored.
    pub fn transition(&self, next: ProcessState) -> bool {
        let mut state = self.state.write();
        if state.can_become(next) {
            *state = next;
            true
        } else {
            tracing::warn!(
                process = %self.name,
                from = ?*state,
                to = ?next,
                "Ignoring invalid process state transition"
            );
            false
        }
    }

    pub fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::Relaxed);
        if pid > 0 { Some(pid) } else { None }
    }

    /// Start detached: own process group, stdin closed, output appended to
    /// the log file. The child outlives the launcher unless stopped.
    pub fn spawn(&self) -> Result<(), LaunchError> {
        if !self.transition(ProcessState::Starting) {
            return Ok(());
        }

        match self.spawn_child() {
            Ok(child) => {
                if let Some(pid) = child.id() {
                    self.pid.store(pid, Ordering::Relaxed);
                }
                *self.child.lock() = Some(child);
                self.transition(ProcessState::Running);
                tracing::info!(
                    process = %self.name,
                    pid = self.pid(),
                    log = %self.log_path.display(),
                    "Process started"
                );
                Ok(())
            }
            Err(reason) => {
                self.transition(ProcessState::Failed);
                Err(LaunchError::SpawnFailed {
                    name: self.name.clone(),
                    reason,
                })
            }
        }
    }

    fn spawn_child(&self) -> Result<Child, String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "empty command".to_string())?;

        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| format!("cannot open {}: {e}", self.log_path.display()))?;
        let log_err = log.try_clone().map_err(|e| e.to_string())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

        cmd.spawn().map_err(|e| format!("{program}: {e}"))
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock();
        child.as_mut()?.try_wait().ok().flatten()
    }

    pub fn log_tail(&self, lines: usize) -> String {
        read_log_tail(&self.log_path, lines)
    }

    /// Polite termination, then force after `grace`. Safe to call again.
    pub async fn stop(&self, grace: Duration) {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            if self.state() == ProcessState::Starting {
                self.transition(ProcessState::Stopped);
            }
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(process = %self.name, %status, "Process had already exited");
        } else {
            request_termination(&child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(process = %self.name, %status, "Process stopped");
                }
                _ => {
                    tracing::warn!(process = %self.name, "Process ignored termination, killing");
                    force_kill_group(&child);
                    if let Err(e) = child.kill().await {
                        tracing::debug!(process = %self.name, "Kill after grace period: {}", e);
                    }
                }
            }
        }

        if self.state() != ProcessState::Failed {
            self.transition(ProcessState::Stopped);
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) {
    if let Some(pid) = child.id().and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: plain syscall. Negative pid targets the whole group created
        // by `process_group(0)`.
        unsafe {
            libc::kill(-pid, libc::SIGTERM);
        }
    }
}

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[cfg(windows)]
fn request_termination(child: &Child) {
    if let Some(pid) = child.id() {
        run_taskkill(pid, false);
    }
}

#[cfg(windows)]
fn run_taskkill(pid: u32, force: bool) {
    let status = std::process::Command::new("taskkill")
        .args(crate::ports::taskkill_args(pid, force))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if !status.success() => tracing::debug!(pid, %status, "taskkill did not succeed"),
        Err(e) => tracing::debug!(pid, "Failed to run taskkill: {}", e),
        Ok(_) => {}
    }
}

#[cfg(unix)]
fn force_kill_group(child: &Child) {
    if let Some(pid) = child.id().and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: see `request_termination`.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
fn force_kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        run_taskkill(pid, true);
    }
}

/// Last `lines` lines of `path`, or an empty string if it cannot be read.
pub fn read_log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub struct ServiceSupervisor {
    reclaimer: PortReclaimer,
    processes: Vec<Arc<ServiceProcess>>,
    owned_ports: Vec<u16>,
    readiness: Readiness,
    shutdown_grace: Duration,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ServiceSupervisor {
    /// `backend` is started first and is the one readiness waits on.
    pub fn new(
        reclaimer: PortReclaimer,
        backend: ServiceProcess,
        readiness: Readiness,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            reclaimer,
            processes: vec![Arc::new(backend)],
            owned_ports: defaults::OWNED_PORTS.to_vec(),
            readiness,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
            events,
        }
    }

    pub fn from_config(
        root: &Path,
        config: &LauncherConfig,
        reclaimer: PortReclaimer,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<Self, LaunchError> {
        let backend = ServiceProcess::from_config("backend", root, &config.backend);
        let readiness = Readiness::new(
            config.backend_url(),
            &config.readiness.health_path,
            config.readiness_interval(),
            config.readiness_deadline(),
        )?;

        let mut supervisor = Self::new(reclaimer, backend, readiness, events)
            .with_owned_ports(config.ports.owned.clone())
            .with_shutdown_grace(config.shutdown_grace());
        if let Some(frontend) = &config.frontend {
            supervisor = supervisor.with_process(ServiceProcess::from_config("frontend", root, frontend));
        }
        Ok(supervisor)
    }

    pub fn with_process(mut self, process: ServiceProcess) -> Self {
        self.processes.push(Arc::new(process));
        self
    }

    pub fn with_owned_ports(mut self, ports: Vec<u16>) -> Self {
        self.owned_ports = ports;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn backend(&self) -> &ServiceProcess {
        &self.processes[0]
    }

    /// Run the startup sequence. On error everything already started is
    /// shut down before returning.
    pub async fn start(&self) -> Result<BackendInfo, LaunchError> {
        match self.run_startup().await {
            Ok(backend) => Ok(backend),
            Err(e) => {
                tracing::error!("Startup failed: {}", e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn run_startup(&self) -> Result<BackendInfo, LaunchError> {
        let report = self.reclaimer.reclaim(&self.owned_ports).await?;
        for (port, pid) in report.killed {
            self.emit(SupervisorEvent::PortReclaimed { port, pid });
        }

        for process in &self.processes {
            if let Err(e) = process.spawn() {
                self.emit(SupervisorEvent::ProcessFailed {
                    name: process.name.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
            self.emit(SupervisorEvent::ProcessStarted {
                name: process.name.clone(),
                pid: process.pid(),
            });
        }

        self.emit(SupervisorEvent::WaitingForReadiness {
            url: self.readiness.url().to_string(),
        });
        let backend = self.backend();
        match wait_until_ready(&self.readiness, Some(backend)).await {
            Ok(info) => {
                tracing::info!(url = %info.url, version = %info.version, "Backend is ready");
                self.emit(SupervisorEvent::Ready {
                    backend: info.clone(),
                });
                Ok(info)
            }
            Err(e) => {
                if matches!(e, LaunchError::ProcessExited { .. }) {
                    backend.transition(ProcessState::Failed);
                }
                self.emit(SupervisorEvent::ProcessFailed {
                    name: backend.name.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop every process, last started first. Idempotent.
    pub async fn shutdown(&self) {
        for process in self.processes.iter().rev() {
            let before = process.state();
            process.stop(self.shutdown_grace).await;
            if before != process.state() && process.state() == ProcessState::Stopped {
                self.emit(SupervisorEvent::Stopped {
                    name: process.name.clone(),
                });
            }
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}
