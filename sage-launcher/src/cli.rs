use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;
use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::paths;

/// SAGE launcher - start, find, and clean up the local SAGE assistant
#[derive(Parser)]
#[command(name = "sage-launcher")]
#[command(version)]
#[command(about = "SAGE launcher - start, find, and clean up the local SAGE assistant")]
pub struct Cli {
    /// Root of the SAGE medium (defaults to the directory above the launcher)
    #[arg(long, global = true, env = "SAGE_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Launcher config file (defaults to <root>/sage.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Free SAGE ports, start the backend and frontend, and wait until ready
    Start {
        /// Do not watch for the medium being removed
        #[arg(long)]
        no_watch: bool,
    },

    /// Look for a running SAGE backend and report every address tried
    Discover {
        /// Ignore and do not update the discovery cache
        #[arg(long)]
        no_cache: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Kill whatever is listening on SAGE ports
    Reclaim {
        /// Ports to free (defaults to the owned ports from sage.toml)
        #[arg(value_name = "PORT")]
        ports: Vec<u16>,
    },

    /// Remove launch shortcuts once the medium disappears
    Watch {
        /// Sentinel file whose disappearance means the medium is gone
        #[arg(long, value_name = "FILE")]
        sentinel: Option<PathBuf>,
    },

    /// Check one address for a healthy SAGE backend
    Health {
        /// Backend base URL, e.g. http://localhost:8001
        url: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn medium_root(&self) -> Result<PathBuf, std::io::Error> {
        paths::medium_root(self.root.as_deref())
    }

    pub fn run(self) -> Result<(), LaunchError> {
        let root = self.medium_root()?;
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| paths::config_path(&root));

        let rt = tokio::runtime::Runtime::new()?;

        match self.command {
            Commands::Start { no_watch } => {
                let config = LauncherConfig::load(&config_path)?;
                rt.block_on(commands::start(&root, &config, !no_watch))
            }
            Commands::Discover { no_cache, json } => rt.block_on(commands::discover(no_cache, json)),
            Commands::Reclaim { ports } => {
                let config = LauncherConfig::load(&config_path)?;
                let ports = if ports.is_empty() {
                    config.ports.owned.clone()
                } else {
                    ports
                };
                rt.block_on(commands::reclaim(&ports, config.release_delay()))
            }
            Commands::Watch { sentinel } => {
                let mut config = LauncherConfig::load(&config_path)?;
                if sentinel.is_some() {
                    config.watchdog.sentinel = sentinel;
                }
                rt.block_on(commands::watch(&root, &config))
            }
            Commands::Health { url, json } => rt.block_on(commands::health(&url, json)),
        }
    }
}
