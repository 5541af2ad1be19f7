//! CLI entry point for framecast
//!
//! `framecast serve` runs the HTTP API and the worker pool. `framecast worker`
//! is the encoder process the pool launches; it speaks line-delimited JSON on
//! stdin/stdout and logs to stderr.

use clap::{Parser, Subcommand};
use framecast::config::LoggingConfig;
use framecast::{run_worker, Config, Daemon, WorkerSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

/// framecast - turns uploaded frame sequences into videos
#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the encoder worker pool
    Serve {
        /// Path to the configuration file (config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Skip startup checks (ffmpeg availability). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },

    /// Run one encoder worker over stdin/stdout (started by `serve`)
    Worker {
        #[arg(long)]
        worker_id: usize,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Command {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Command::Serve { config, .. } | Command::Worker { config, .. } => config.as_ref(),
        }
    }
}

/// Logs always go to stderr; a worker's stdout carries its messages.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_optional(args.command.config_path().map(PathBuf::as_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    match args.command {
        Command::Serve {
            config: config_path,
            skip_checks,
        } => serve(config, config_path, skip_checks).await,
        Command::Worker { worker_id, .. } => worker(config, worker_id).await,
    }
}

async fn serve(config: Config, config_path: Option<PathBuf>, skip_checks: bool) -> ExitCode {
    tracing::info!(
        config = ?config_path,
        sessions = %config.sessions.root_dir.display(),
        "framecast starting"
    );

    let daemon = if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config, config_path).await
    } else {
        Daemon::new(config, config_path).await
    };

    match daemon {
        Ok(daemon) => {
            if let Err(e) = daemon.run_with_server().await {
                tracing::error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}

async fn worker(config: Config, worker_id: usize) -> ExitCode {
    // Ctrl-C reaches the whole process group; the pool decides when workers stop
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("ignoring interrupt, waiting for SHUTDOWN");
        }
    });

    let settings = WorkerSettings::from_config(&config);
    tracing::info!(worker_id, pid = std::process::id(), "worker started");

    match run_worker(worker_id, settings, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}
