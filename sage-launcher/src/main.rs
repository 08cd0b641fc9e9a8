mod cli;
mod commands;
mod config;
mod defaults;
mod error;
mod paths;
mod ports;
mod supervisor;
mod watchdog;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::Cli;

fn main() {
    // Parse CLI arguments early so we can configure logging.
    let cli = Cli::parse();

    let log_guard = init_tracing(&cli);

    if let Err(e) = cli.run() {
        tracing::debug!("Command failed: {:?}", e);
        eprintln!("Error: {e}");
        eprintln!("{}", e.guidance());
        // Flush the file log before exiting.
        drop(log_guard);
        std::process::exit(1);
    }
}

/// Console logging plus, when the medium is writable, `logs/launcher.log`.
fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            }
        })
    };

    let file = cli.medium_root().ok().and_then(|root| {
        let dir = paths::logs_dir(&root);
        std::fs::create_dir_all(&dir).ok()?;
        let appender = tracing_appender::rolling::never(dir, "launcher.log");
        Some(tracing_appender::non_blocking(appender))
    });

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match file {
        Some((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .init();
            None
        }
    }
}
