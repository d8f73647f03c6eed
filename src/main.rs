use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use souq_guard::config::GuardConfig;
use souq_guard::ratelimit::{LimiterName, RateLimitResult};
use souq_guard::service::GuardService;

#[derive(Debug, Parser)]
#[command(name = "souq-guard", version, about = "Rate limit and lockout tooling")]
struct Cli {
    /// YAML configuration file; environment overrides apply on top
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved limiter table as YAML
    Limits,
    /// Run checks against one limiter and print the results as JSON
    Probe {
        /// Limiter to exercise
        #[arg(short, long, default_value = "api")]
        limiter: LimiterName,

        /// Identifier to count against
        #[arg(short, long, default_value = "127.0.0.1")]
        identifier: String,

        /// Number of checks
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Issue all checks at once instead of one after another
        #[arg(long)]
        concurrent: bool,

        /// Pause between sequential checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Clear the identifier's window before probing
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReport {
    limiter: LimiterName,
    identifier: String,
    backend: &'static str,
    store_ping: Option<String>,
    results: Vec<RateLimitResult>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = GuardConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Limits => {
            print!("{}", serde_yaml::to_string(&config.limits)?);
        }
        Command::Probe {
            limiter,
            identifier,
            count,
            concurrent,
            interval_ms,
            reset,
        } => {
            let service = GuardService::start(config)?;
            let named = service.registry().get(limiter).clone();
            info!(limiter = %limiter, identifier = %identifier, count, "Probing limiter");

            let store_ping = match service.distributed() {
                Some(distributed) => Some(match distributed.ping().await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => e.to_string(),
                }),
                None => None,
            };

            if reset {
                named.reset(&identifier).await;
            }

            let results = if concurrent {
                futures::future::join_all((0..count).map(|_| named.check(&identifier))).await
            } else {
                let mut results = Vec::with_capacity(count as usize);
                let sequential = async {
                    for i in 0..count {
                        if i > 0 && interval_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                        }
                        results.push(named.check(&identifier).await);
                    }
                };
                tokio::select! {
                    _ = sequential => {}
                    _ = shutdown_signal() => {}
                }
                results
            };

            let report = ProbeReport {
                limiter,
                identifier,
                backend: if service.distributed().is_some() {
                    "redis"
                } else {
                    "in_process"
                },
                store_ping,
                results,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            service.shutdown().await;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping probe");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping probe");
        }
    }
}
