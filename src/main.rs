//! packet-log: a newline-delimited packet log server
//!
//! Clients send arbitrary bytes over TCP. Every `\n`-terminated packet is
//! appended to a shared log file, and the whole log is written back to the
//! client that sent it.
//!
//! Features:
//! - Packets of any length, split across any number of reads
//! - Sequential or concurrent serving with an atomic append-and-read
//! - Clean shutdown on SIGINT/SIGTERM that removes the log file
//! - Optional daemon mode
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod daemon;
mod framer;
mod server;
mod shutdown;
mod storage;

use config::{Config, ServeMode};
use server::{Server, ServerError};
use shutdown::Shutdown;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Record termination signals until the async listener takes over.
    shutdown::install_early_handlers()?;

    // Load configuration
    let mut config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    // Bind before detaching so address errors reach the invoking shell.
    let listener = server::bind_listener(config.listen, config.backlog)?;

    if config.daemon {
        if config.log_file.is_none() {
            warn!("Daemon mode without a log file discards all log output");
        }
        config.absolutize_paths()?;
        daemon::daemonize()?;
    }

    let runtime = match config.mode {
        ServeMode::Sequential => tokio::runtime::Builder::new_current_thread(),
        ServeMode::Concurrent => tokio::runtime::Builder::new_multi_thread(),
    }
    .enable_all()
    .build()?;

    let span = info_span!("packet-log", pid = std::process::id());
    runtime.block_on(run(config, listener).instrument(span))?;
    Ok(())
}

async fn run(config: Config, listener: std::net::TcpListener) -> Result<(), ServerError> {
    info!(
        listen = %config.listen,
        mode = ?config.mode,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        "Starting packet-log server"
    );

    let shutdown = Shutdown::new();
    shutdown::listen_for_signals(shutdown.clone()).map_err(ServerError::Signal)?;

    let server = Server::new(config, listener, shutdown).await?;
    server.run().await?;

    info!("Exiting");
    Ok(())
}
