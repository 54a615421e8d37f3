// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{fmt, prelude::*};

use swarmseedr::config::{self, load_settings, save_settings};
use swarmseedr::networking::PeerAddrInfo;
use swarmseedr::{AddTorrentOptions, Session, Status, TorrentHandle};

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file; defaults to settings.toml in the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at DEBUG instead of INFO.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a magnet link, bare info-hash or .torrent file.
    Add {
        input: String,
        /// Peer to connect to, as <hex peer id>@<ip:port>. Repeatable.
        #[arg(long = "peer")]
        peers: Vec<PeerAddrInfo>,
        #[arg(long)]
        stop_after_download: bool,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Seed a local file or directory in place.
    Seed { path: PathBuf },
    /// Resume persisted torrents.
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = base_data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let general_log = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(31)
        .filename_prefix("app")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking_general, _guard_general) = tracing_appender::non_blocking(general_log);
    let filter = Targets::new().with_default(if cli.debug {
        LevelFilter::DEBUG
    } else {
        DEFAULT_LOG_FILTER
    });
    let general_layer = fmt::layer()
        .with_writer(non_blocking_general)
        .with_ansi(false)
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(general_layer).try_init();

    tracing::info!("STARTING SWARMSEEDR");

    let lock_path = base_data_dir.join("swarmseedr.lock");
    let lock_file = File::create(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        println!("swarmseedr is already running.");
        return Ok(());
    }

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let settings = load_settings(config_path.as_deref());
    if let Some(path) = config_path.as_deref().filter(|p| !p.exists()) {
        if let Err(e) = save_settings(&settings, path) {
            tracing::warn!(error = %e, "Failed to write default settings");
        }
    }

    let session = Session::open(settings).await?;
    println!("Listening as {}", session.local_peer());

    let wait_for = match cli.command {
        Commands::Add {
            input,
            peers,
            stop_after_download,
            data_dir,
        } => {
            let options = AddTorrentOptions {
                stopped: false,
                stop_after_download,
                data_dir,
            };
            let handle = add_input(&session, &input, options).await?;
            if !peers.is_empty() {
                handle.add_peers(peers).await?;
            }
            println!("Added {}", handle.id());
            stop_after_download.then_some(handle)
        }
        Commands::Seed { path } => {
            let handle = session
                .create_from_path(&path, AddTorrentOptions::default())
                .await?;
            println!("Seeding {} from {}", handle.id(), path.display());
            None
        }
        Commands::Run => None,
    };

    run_until_done(&session, wait_for).await;
    session.close().await;
    tracing::info!("SWARMSEEDR STOPPED");
    Ok(())
}

async fn add_input(
    session: &Session,
    input: &str,
    options: AddTorrentOptions,
) -> Result<TorrentHandle, Box<dyn std::error::Error>> {
    let path = Path::new(input);
    if path.extension().is_some_and(|ext| ext == "torrent") && path.is_file() {
        let bytes = tokio::fs::read(path).await?;
        Ok(session.add_torrent_bytes(&bytes, options).await?)
    } else {
        Ok(session.add_magnet(input, options).await?)
    }
}

/// Logs progress until Ctrl-C, or until `wait_for` has finished downloading and stopped.
async fn run_until_done(session: &Session, wait_for: Option<TorrentHandle>) {
    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl-C received, shutting down");
                return;
            }
            _ = progress.tick() => {
                for handle in session.list().await {
                    let Ok(stats) = handle.stats().await else {
                        continue;
                    };
                    let line = format!(
                        "{} {:<20} {:>5}/{:<5} pieces  down {} B/s  up {} B/s  peers {}",
                        &stats.info_hash[..8],
                        stats.status.to_string(),
                        stats.pieces.have,
                        stats.pieces.total,
                        stats.speed.download,
                        stats.speed.upload,
                        stats.peers.total,
                    );
                    tracing::info!(torrent = %handle.id(), name = %stats.name, "{}", line);
                    println!("{line}  {}", stats.name);
                    if let Some(error) = &stats.error {
                        println!("    error: {error}");
                    }
                }
                if let Some(handle) = &wait_for {
                    if handle.status() == Status::Stopped && handle.is_complete() {
                        println!("Download complete");
                        return;
                    }
                }
            }
        }
    }
}
