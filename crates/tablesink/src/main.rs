//! tablesink - Main entry point

use clap::{Parser, Subcommand};
use std::process;
use tablesink::Config;
use tablesink_common::logging::{init_logging, LogConfig, LogLevel};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Kafka to PostgreSQL table sink
#[derive(Parser, Debug)]
#[command(name = "tablesink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    command: Option<Command>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Consume the topic and write to PostgreSQL
    Run,
    /// Print the resolved configuration as JSON (password redacted)
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::default()
        .with_log_file_prefix("tablesink")
        .with_filter_directives(default_filter(cli.verbose));
    let log_config = if cli.verbose {
        log_config.with_level(LogLevel::Debug)
    } else {
        log_config
    };

    // Environment variables take precedence
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        },
    };

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            process::exit(2);
        },
    };

    if let Err(e) = execute(cli.command.unwrap_or(Command::Run)).await {
        error!("tablesink failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        // Flush buffered file output before exiting
        drop(guard);
        process::exit(1);
    }
}

/// Per-target directives; `--verbose` raises the sink's own target to debug
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "tablesink=debug,sqlx=warn,rdkafka=info"
    } else {
        "tablesink=info,sqlx=warn,rdkafka=info"
    }
}

async fn execute(command: Command) -> anyhow::Result<()> {
    let config = Config::load()?;

    match command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        },
        Command::Run => {
            info!(
                brokers = %config.kafka.brokers,
                topic = %config.kafka.topic,
                "Starting tablesink"
            );

            let shutdown = CancellationToken::new();
            tokio::spawn(shutdown_signal(shutdown.clone()));

            let stats = tablesink::run(config, shutdown).await?;
            info!(
                committed = stats.committed,
                rows_written = stats.rows_written,
                "tablesink shut down gracefully"
            );
            Ok(())
        },
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing the current message");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing the current message");
        },
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_flag_controls_sink_target() {
        assert!(default_filter(false).contains("tablesink=info"));
        assert!(default_filter(true).contains("tablesink=debug"));
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["tablesink"]);
        assert_eq!(cli.command, None);
        assert!(!cli.verbose);

        let cli = Cli::parse_from(["tablesink", "--verbose", "config"]);
        assert_eq!(cli.command, Some(Command::Config));
        assert!(cli.verbose);
    }
}
