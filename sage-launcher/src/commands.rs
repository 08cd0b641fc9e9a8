use std::path::Path;
use std::time::Duration;

use sage_core::{Candidate, DiscoveryResult};
use sage_discovery::{DiscoveryConfig, Discoverer, HttpProbe, Probe};
use tokio::sync::mpsc;

use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::ports::PortReclaimer;
use crate::supervisor::{ServiceSupervisor, SupervisorEvent};
use crate::watchdog::EnvironmentWatchdog;

pub async fn start(root: &Path, config: &LauncherConfig, watch: bool) -> Result<(), LaunchError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reclaimer = PortReclaimer::system().with_release_delay(config.release_delay());
    let supervisor = ServiceSupervisor::from_config(root, config, reclaimer, tx)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = match supervisor.start().await {
        Ok(backend) => {
            println!("SAGE is ready at {} (version {})", backend.url, backend.version);
            wait_for_exit(root, config, watch).await;
            supervisor.shutdown().await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    // Closing the channel lets the printer drain and finish.
    drop(supervisor);
    let _ = printer.await;
    result
}

async fn wait_for_exit(root: &Path, config: &LauncherConfig, watch: bool) {
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if watch {
        let watchdog = EnvironmentWatchdog::from_config(root, &config.watchdog);
        tokio::select! {
            _ = interrupted => tracing::info!("Interrupted, shutting down"),
            _ = watchdog.run() => tracing::info!("Medium removed, shutting down"),
        }
    } else {
        interrupted.await;
        tracing::info!("Interrupted, shutting down");
    }
}

fn print_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::PortReclaimed { port, pid } => {
            println!("Freed port {port} (stopped pid {pid})");
        }
        SupervisorEvent::ProcessStarted { name, pid } => match pid {
            Some(pid) => println!("Started {name} (pid {pid})"),
            None => println!("Started {name}"),
        },
        SupervisorEvent::WaitingForReadiness { url } => {
            println!("Waiting for the assistant at {url} ...");
        }
        SupervisorEvent::Ready { .. } => {}
        SupervisorEvent::ProcessFailed { name, reason } => {
            eprintln!("{name} failed: {reason}");
        }
        SupervisorEvent::Stopped { name } => println!("Stopped {name}"),
    }
}

pub async fn discover(no_cache: bool, json: bool) -> Result<(), LaunchError> {
    let config = DiscoveryConfig::from_env();
    let mut discoverer = Discoverer::from_config(config)?;
    if no_cache {
        discoverer = discoverer.without_cache();
    }

    let result = discoverer.discover().await;

    if json {
        let out = serde_json::to_string_pretty(&result)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        println!("{out}");
    } else {
        print_discovery(&result);
    }

    if result.success {
        Ok(())
    } else {
        Err(sage_discovery::Error::ExhaustedCandidates {
            attempts: result.attempts,
        }
        .into())
    }
}

fn print_discovery(result: &DiscoveryResult) {
    for attempt in &result.attempts {
        match &attempt.error {
            None => println!("  ok    {} ({}ms)", attempt.url, attempt.response_time_ms),
            Some(e) => println!("  fail  {} ({}ms): {e}", attempt.url, attempt.response_time_ms),
        }
    }
    if let Some(backend) = &result.backend {
        println!(
            "Found SAGE backend {} at {}",
            backend.version, backend.url
        );
    }
}

pub async fn reclaim(ports: &[u16], release_delay: Duration) -> Result<(), LaunchError> {
    let report = PortReclaimer::system()
        .with_release_delay(release_delay)
        .reclaim(ports)
        .await?;

    if report.is_empty() {
        println!("All ports already free");
    }
    for (port, pid) in report.killed {
        println!("Freed port {port} (stopped pid {pid})");
    }
    Ok(())
}

pub async fn watch(root: &Path, config: &LauncherConfig) -> Result<(), LaunchError> {
    let watchdog = EnvironmentWatchdog::from_config(root, &config.watchdog);
    if !watchdog.state().present {
        tracing::warn!(
            sentinel = %watchdog.state().sentinel_path.display(),
            "Sentinel not present yet; cleanup runs only after it has been seen"
        );
    }

    let state = watchdog.run().await;
    println!(
        "Medium removed ({} is gone), launch shortcuts cleaned up",
        state.sentinel_path.display()
    );
    Ok(())
}

pub async fn health(url: &str, json: bool) -> Result<(), LaunchError> {
    let config = DiscoveryConfig::from_env();
    let candidate = Candidate::parse(url).map_err(sage_discovery::Error::from)?;
    let probe = HttpProbe::from_config(&config)?;

    let report = probe.probe(&candidate).await;
    if json {
        let out = serde_json::to_string_pretty(&report.attempt)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        println!("{out}");
    }

    let info = report.into_result()?;
    if !json {
        println!("Healthy: SAGE backend {} at {}", info.version, info.url);
    }
    Ok(())
}
