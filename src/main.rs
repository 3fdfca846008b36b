//! minibusd - a small D-Bus message broker daemon.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minibusd::{Broker, Result};

/// A small D-Bus message broker.
#[derive(Parser, Debug)]
#[command(name = "minibusd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// D-Bus address to listen on (repeatable).
    ///
    /// E.g. "unix:path=/run/minibusd.sock" or
    /// "tcp:host=127.0.0.1,port=7000". A socket in a fresh temporary
    /// directory is created when no address is given.
    #[arg(long, short = 'l')]
    listen: Vec<String>,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing/logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    let mut broker = Broker::new();
    if args.listen.is_empty() {
        let address = broker.add_temp_unix_listener().await?;
        info!(address = %address, "Listening");
    } else {
        for address in &args.listen {
            let resolved = broker.add_listener(address).await?;
            info!(address = %resolved, "Listening");
        }
    }

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!(error = %e, "Broker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            info!("Shutting down");
        }
    }

    Ok(())
}
