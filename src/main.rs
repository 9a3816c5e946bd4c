use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{initialize, LimiterHandle};

/// Exercise a Tollgate limiter from the command line.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, short)]
    config: Option<String>,

    /// Shared store endpoint, overriding the configuration (e.g. redis://localhost:6379/0)
    #[arg(long)]
    store: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume tokens repeatedly and print each verdict
    Consume {
        /// Key to consume tokens for
        #[arg(long, default_value = "test-user")]
        key: String,

        /// Number of attempts
        #[arg(long, default_value_t = 5)]
        count: u32,

        /// Tokens per attempt
        #[arg(long, default_value_t = 1)]
        tokens: u32,

        /// Pause between attempts
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Print the bucket state for a key
    State {
        #[arg(long, default_value = "test-user")]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.endpoint = Some(store);
    }

    let handle = initialize(&config).await?;
    info!(backend = handle.backend_name(), "Limiter initialized");

    match cli.command {
        Command::Consume {
            key,
            count,
            tokens,
            interval_ms,
        } => {
            tokio::select! {
                _ = consume_loop(&handle, &key, count, tokens, Duration::from_millis(interval_ms)) => {}
                _ = shutdown_signal() => {}
            }
        }
        Command::State { key } => match handle.get_state(&key).await {
            Some(state) => println!("{}", serde_json::to_string(&state)?),
            None => println!("not available"),
        },
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

async fn consume_loop(handle: &LimiterHandle, key: &str, count: u32, tokens: u32, interval: Duration) {
    for attempt in 1..=count {
        let verdict = handle.consume(key, tokens).await;
        info!(
            attempt = attempt,
            outcome = if verdict.allowed { "allowed" } else { "rate-limited" },
            "Attempt finished"
        );
        match serde_json::to_string(&verdict) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!(error = %e, "Failed to encode verdict"),
        }

        if attempt < count {
            tokio::time::sleep(interval).await;
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
