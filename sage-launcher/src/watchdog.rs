//! Environment watchdog - cleans up launch shortcuts once the medium is gone
//!
//! Watches a sentinel path on the SAGE drive, the medium root by default. The first time it disappears
//! after having been seen, every registered launch affordance is removed and
//! the watchdog stops. It does not resume if the drive comes back.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::config::WatchdogConfig;
use crate::paths;

/// Something that lets the user launch SAGE from the host, such as a desktop
/// shortcut.
pub trait LaunchAffordance: Send + Sync {
    fn describe(&self) -> String;

    /// Remove it. Already gone is success.
    fn remove(&self) -> io::Result<()>;
}

/// `.desktop` entry, `.lnk` shortcut, or any other single file.
#[derive(Debug, Clone)]
pub struct ShortcutFile {
    path: PathBuf,
}

impl ShortcutFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LaunchAffordance for ShortcutFile {
    fn describe(&self) -> String {
        self.path().display().to_string()
    }

    fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Shortcuts the SAGE installer creates on this host.
pub fn default_affordances() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if cfg!(windows) {
        if let Some(desktop) = dirs::desktop_dir() {
            out.push(desktop.join("SAGE.lnk"));
        }
    } else {
        if let Some(desktop) = dirs::desktop_dir() {
            out.push(desktop.join("SAGE.desktop"));
        }
        if let Some(data) = dirs::data_dir() {
            out.push(data.join("applications").join("sage.desktop"));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogState {
    pub sentinel_path: PathBuf,
    pub present: bool,
}

pub struct EnvironmentWatchdog {
    state: WatchdogState,
    interval: Duration,
    affordances: Vec<Box<dyn LaunchAffordance>>,
    fired: bool,
}

impl EnvironmentWatchdog {
    pub fn new(sentinel_path: impl Into<PathBuf>, interval: Duration) -> Self {
        let sentinel_path = sentinel_path.into();
        let present = sentinel_path.exists();
        Self {
            state: WatchdogState {
                sentinel_path,
                present,
            },
            interval,
            affordances: Vec::new(),
            fired: false,
        }
    }

    /// Sentinel and shortcuts from `[watchdog]`, falling back to the
    /// medium root and the installer's shortcuts.
    pub fn from_config(root: &Path, config: &WatchdogConfig) -> Self {
        let sentinel = config
            .sentinel
            .as_deref()
            .map(|p| paths::under_root(root, p))
            .unwrap_or_else(|| paths::default_sentinel(root));
        let affordances = if config.affordances.is_empty() {
            default_affordances()
        } else {
            config.affordances.clone()
        };

        let mut watchdog = Self::new(sentinel, config.interval());
        for path in affordances {
            watchdog = watchdog.with_affordance(Box::new(ShortcutFile::new(path)));
        }
        watchdog
    }

    pub fn with_affordance(mut self, affordance: Box<dyn LaunchAffordance>) -> Self {
        self.affordances.push(affordance);
        self
    }

    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// One check. Returns true if cleanup ran on this tick.
    pub fn tick(&mut self) -> bool {
        if self.fired {
            return false;
        }

        let present = self.state.sentinel_path.exists();
        let was_present = std::mem::replace(&mut self.state.present, present);
        if was_present && !present {
            tracing::warn!(
                sentinel = %self.state.sentinel_path.display(),
                "SAGE medium removed, cleaning up launch shortcuts"
            );
            self.cleanup();
            self.fired = true;
            return true;
        }
        if !was_present && present {
            tracing::debug!(sentinel = %self.state.sentinel_path.display(), "Medium present");
        }
        false
    }

    fn cleanup(&self) {
        for affordance in &self.affordances {
            match affordance.remove() {
                Ok(()) => tracing::info!(target_path = %affordance.describe(), "Removed launch shortcut"),
                Err(e) => tracing::warn!(
                    target_path = %affordance.describe(),
                    "Failed to remove launch shortcut: {}",
                    e
                ),
            }
        }
    }

    /// Poll until cleanup has run once, then return the final state.
    pub async fn run(mut self) -> WatchdogState {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            sentinel = %self.state.sentinel_path.display(),
            interval_secs = self.interval.as_secs(),
            "Watching SAGE medium"
        );

        loop {
            interval.tick().await;
            if self.tick() {
                return self.state;
            }
        }
    }
}
