mod cli;
mod config;
mod network;
mod progress;
mod protocol;
mod receiver;
mod sender;
mod transfer;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::Config;
use receiver::ReceiverSettings;
use sender::{Sender, SenderSettings};
use std::io::IsTerminal;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transfer::FileQueue;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let show_progress = !cli.no_progress && std::io::stderr().is_terminal();

    match cli.command {
        Commands::Send { dir, host } => {
            if let Some(dir) = dir {
                config.send.directory = dir;
            }
            if let Some(host) = host {
                config.send.host = host;
            }
            send_files(&config, show_progress).await?;
        }
        Commands::Receive { dir, bind } => {
            if let Some(dir) = dir {
                config.receive.directory = dir;
            }
            if let Some(bind) = bind {
                config.receive.bind = bind;
            }
            receive_files(&config).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "fpush=debug" } else { "fpush=info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(timeout) = cli.timeout {
        config.io_timeout = timeout;
    }
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

async fn send_files(config: &Config, show_progress: bool) -> Result<()> {
    let dir = &config.send.directory;
    ensure_dir(dir).await?;

    let queue = FileQueue::snapshot(dir).await?;
    if queue.is_empty() {
        warn!(dir = %dir.display(), "no files to send");
    } else {
        info!(dir = %dir.display(), files = queue.len(), "queued files");
    }

    let summary = Sender::new(SenderSettings::from(config), queue)
        .with_progress(show_progress)
        .run()
        .await?;

    info!(
        sent = summary.sent,
        skipped = summary.skipped,
        bytes = summary.bytes,
        reconnects = summary.reconnects,
        "transfer finished"
    );
    Ok(())
}

async fn receive_files(config: &Config) -> Result<()> {
    let dir = &config.receive.directory;
    ensure_dir(dir).await?;

    let listener = network::bind(&config.receive.bind, config.port).await?;
    info!(
        addr = %listener.local_addr()?,
        dir = %dir.display(),
        "listening"
    );

    receiver::accept_loop(listener, ReceiverSettings::from(config)).await
}
