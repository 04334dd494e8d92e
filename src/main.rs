//! Arca daemon CLI entry point: `daemon start|stop|status`, exit codes
//! 0 (success), 1 (generic failure), 2 (misconfiguration) per spec.md §6.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use arca_daemon::daemon::{self, StartOverrides};

#[derive(Parser)]
#[command(name = "arcad")]
#[command(about = "Docker Engine API-compatible daemon for a VM-per-container runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the on-disk configuration file.
    #[arg(short, long, default_value = "/etc/arca/config.json", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the Arca daemon itself.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon and block until it receives a shutdown signal.
    Start {
        /// Override the Unix socket path from the config file.
        #[arg(long)]
        socket_path: Option<PathBuf>,

        /// Override the log level (`error`, `warn`, `info`, `debug`, `trace`).
        #[arg(long)]
        log_level: Option<String>,

        /// Path to the guest kernel image, passed through to the runtime
        /// adapter without interpretation.
        #[arg(long)]
        kernel_path: Option<PathBuf>,

        /// Stay attached to the controlling terminal. This build never
        /// self-daemonizes, so this flag is accepted for CLI compatibility
        /// but otherwise has no effect - process supervision is left to
        /// the OS service manager.
        #[arg(long)]
        foreground: bool,
    },
    /// Signal a running daemon to shut down gracefully.
    Stop,
    /// Report whether a daemon is reachable at the configured socket.
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start { socket_path, log_level, kernel_path, foreground: _ } => {
                init_logging(log_level.as_deref());
                let overrides = StartOverrides {
                    socket_path: socket_path.clone(),
                    log_level: log_level.clone(),
                    kernel_path: kernel_path.clone(),
                };
                daemon::start(&cli.config, overrides).await
            }
            DaemonAction::Stop => {
                init_logging(None);
                daemon::stop(&cli.config).await
            }
            DaemonAction::Status => {
                init_logging(None);
                daemon::status(&cli.config).await
            }
        },
    };

    if let Err(e) = result {
        error!("{:#}", e);
        let misconfigured = e.to_string().contains("configuration") || e.to_string().contains("pid file");
        std::process::exit(if misconfigured { 2 } else { 1 });
    }
}

fn init_logging(level_override: Option<&str>) {
    let filter = level_override
        .map(|l| format!("arca_daemon={}", l))
        .unwrap_or_else(|| "arca_daemon=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();
}
