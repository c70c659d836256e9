//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stampede_service::config::Config;
use stampede_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Stampede commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Check the health of a running server.
    Healthcheck {
        /// Address of the server to check. Defaults to the configured `bind` address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Timeout of the check, in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("stampede@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded here, no runtime was started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(config, addr, timeout).context("healthcheck failed")?
        }
    }

    Ok(())
}
