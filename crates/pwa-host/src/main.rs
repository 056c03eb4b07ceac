//! Command-line host for the offline cache controller.
//!
//! Registers a worker for an origin, dispatches fetch events through it and
//! keeps generations on disk between runs.
//!
//! ## Usage
//!
//! ```bash
//! # Install and activate a worker (pre-caches the manifest)
//! pwa-host --config pwa-host.json install
//!
//! # Dispatch navigations through the active worker
//! pwa-host fetch / /events/ --navigate
//!
//! # Clear every cache after logging out
//! pwa-host logout
//!
//! # Show stored generations
//! pwa-host list
//! ```

use clap::{Parser, Subcommand};
use pwa_common::{init_logging, LogConfig};
use std::path::PathBuf;
use tracing::error;

mod config;
mod host;

use config::HostConfig;
use host::Host;

#[derive(Parser)]
#[command(name = "pwa-host")]
#[command(about = "Drive the offline cache controller against a live origin")]
struct Cli {
    /// Host configuration file (JSON)
    #[arg(short, long, default_value = "pwa-host.json")]
    config: PathBuf,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate a new worker
    Install,

    /// Dispatch fetch events through the active worker
    Fetch {
        /// Paths relative to the origin
        #[arg(required = true)]
        paths: Vec<String>,
        /// Treat the requests as page navigations
        #[arg(long)]
        navigate: bool,
        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
    },

    /// Post the logout message and clear every cache
    Logout,

    /// List stored generations and their entries
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = HostConfig::load(&cli.config)?;
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(config.log_format))?;

    let host = Host::open(config).await?;

    match cli.command {
        Commands::Install => {
            let generation = host.install().await?;
            println!("Active generation: {generation}");
        }

        Commands::Fetch {
            paths,
            navigate,
            method,
        } => {
            let mut failed = false;
            for path in paths {
                match host.fetch(&path, navigate, &method).await {
                    Ok(report) => {
                        let source = report
                            .source
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "uncontrolled".to_string());
                        println!(
                            "{} {} [{}] {} bytes",
                            report.status, report.url, source, report.body_len
                        );
                    }
                    Err(e) => {
                        error!(path = %path, error = %e, "Fetch failed");
                        println!("ERR {path}: {e}");
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Logout => {
            host.logout().await?;
            println!("All caches cleared");
        }

        Commands::List => {
            let listings = host.list().await?;
            if listings.is_empty() {
                println!("No caches stored");
            }
            for listing in listings {
                let marker = if listing.active { "*" } else { " " };
                println!("{marker} {} ({} entries)", listing.name, listing.keys.len());
                for key in listing.keys {
                    println!("    {key}");
                }
            }
        }
    }

    Ok(())
}
