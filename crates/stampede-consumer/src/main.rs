//! A load generator for stampede.
//!
//! Opens a number of concurrent random data streams against a running server and reports how
//! many items each of them received.

use std::time::Instant;

use clap::Parser;
use tracing::level_filters::LevelFilter;

mod consume;

/// Opens concurrent random data streams against a stampede server.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The host the server listens on.
    #[arg(long, short = 'H', default_value = "localhost")]
    host: String,

    /// The port the server listens on.
    #[arg(long, short, default_value_t = 3021)]
    port: u16,

    /// The number of concurrent streams.
    #[arg(long, short, default_value_t = 10)]
    consumers: usize,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

impl Cli {
    fn stream_url(&self) -> String {
        format!("http://{}:{}/random-data", self.host, self.port)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let start = Instant::now();
    let summary = consume::run(&cli.stream_url(), cli.consumers).await?;

    tracing::info!(
        streams = summary.streams,
        items = summary.items,
        failures = summary.failures,
        elapsed = %humantime::format_duration(start.elapsed()),
        "All streams finished"
    );

    if summary.failures == summary.streams && summary.streams > 0 {
        anyhow::bail!("every stream failed");
    }
    Ok(())
}
