use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use multiquota::client::{Client, RetryProxy};
use multiquota::config::LimiterConfig;
use multiquota::ratelimit::{Clock, SkewedClock};

/// Send fake requests through a multi-bucket rate limiter.
#[derive(Debug, Parser)]
#[command(name = "multiquota", version, about)]
struct Args {
    /// YAML file with bucket definitions (defaults to 3/second and 10/minute)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: u32,

    /// How many times faster than real time the clock runs
    #[arg(long, default_value_t = 10.0)]
    skew: f64,

    /// Retry refused requests with backoff instead of waiting out the exhausted period
    #[arg(long)]
    retry: bool,

    /// Print limiter status and logs as JSON
    #[arg(long)]
    json: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct Request {
    req: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting multiquota demo client");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };
    info!(buckets = config.buckets.len(), "Configuration loaded");

    let clock = Arc::new(SkewedClock::new(args.skew)?);
    let limiter = Arc::new(config.build_limiter(Arc::clone(&clock))?);
    let client = Client::new(Arc::clone(&limiter));
    let proxy = RetryProxy::new(config.retry.clone(), Arc::clone(&clock))?;

    let mut sent = 0;
    let mut i = 0;
    while i < args.requests {
        let status = limiter.status();
        if args.json {
            println!("{}", serde_json::to_string(&status)?);
        } else {
            println!("{}", status);
        }

        let request = Request { req: i };
        let result = if args.retry {
            proxy.call_if(|| client.send(&request), |err| err.exhausted().is_some())
        } else {
            client.send(&request)
        };

        match result {
            Ok(_) => {
                sent += 1;
                i += 1;
            }
            Err(err) => match err.exhausted() {
                Some(exhausted) if !args.retry => {
                    let wait = client.backoff_for(exhausted);
                    info!(error = %err, wait = ?wait, "Waiting to regain quota");
                    clock.sleep(wait);
                }
                _ => {
                    warn!(error = %err, request = i, "Dropping request");
                    i += 1;
                }
            },
        }
    }

    info!(sent, requested = args.requests, "Multiquota demo client finished");
    Ok(())
}
