//! Stampede.
//!
//! Stampede is a standalone web service that streams response bodies of slow upstream HTTP
//! endpoints to many concurrent consumers. Concurrent requests for the same upstream URL are
//! coalesced through a shared store, so that the upstream sees at most one fetch at a time.

#![warn(clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
