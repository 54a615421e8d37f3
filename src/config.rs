// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Eight-character client prefix of generated peer ids, e.g. `-SS0300-`.
    pub client_id: String,
    /// Identity bucket under which resume records are stored.
    pub user: String,
    pub listen_addr: SocketAddr,

    // Disk
    pub data_dir: PathBuf,
    pub resume_dir: PathBuf,
    pub data_dir_includes_torrent_id: bool,
    pub max_open_files: u64,

    // Networking
    pub global_download_limit_bps: u64,
    pub global_upload_limit_bps: u64,
    pub max_peer_dial: usize,
    pub max_peer_accept: usize,
    pub max_peer_addresses: usize,
    pub blocked_ips: Vec<IpAddr>,
    pub dial_timeout_secs: u64,
    pub discovery_interval_secs: u64,
    pub find_providers_limit: usize,

    // Metadata
    pub parallel_metadata_downloads: usize,
    pub max_metadata_size: u64,

    // Choking
    pub unchoked_peers: usize,
    pub optimistic_unchoked_peers: usize,
    pub unchoke_interval_secs: u64,
    pub optimistic_rotation_ticks: u32,

    // Requests
    pub endgame_max_duplicate_downloads: usize,
    pub endgame_threshold_pieces: u32,
    pub default_requests_out: usize,
    pub max_requests_out: usize,
    pub max_requests_in: usize,

    // Timings
    pub piece_read_timeout_secs: u64,
    pub snub_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub peer_inactivity_timeout_secs: u64,

    // Performance
    pub write_cache_size: u64,
    pub parallel_writes: usize,
    pub parallel_reads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let (data_dir, resume_dir) = match get_app_paths() {
            Some((_, base)) => (base.join("data"), base.join("resume")),
            None => (PathBuf::from("data"), PathBuf::from("resume")),
        };
        Self {
            client_id: "-SS0300-".to_string(),
            user: "default".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6681)),
            data_dir,
            resume_dir,
            data_dir_includes_torrent_id: false,
            max_open_files: 10240,
            global_download_limit_bps: 0,
            global_upload_limit_bps: 0,
            max_peer_dial: 80,
            max_peer_accept: 200,
            max_peer_addresses: 2000,
            blocked_ips: Vec::new(),
            dial_timeout_secs: 10,
            discovery_interval_secs: 60,
            find_providers_limit: 50,
            parallel_metadata_downloads: 2,
            max_metadata_size: 30 * MIB,
            unchoked_peers: 3,
            optimistic_unchoked_peers: 1,
            unchoke_interval_secs: 10,
            optimistic_rotation_ticks: 3,
            endgame_max_duplicate_downloads: 3,
            endgame_threshold_pieces: 10,
            default_requests_out: 50,
            max_requests_out: 250,
            max_requests_in: 250,
            piece_read_timeout_secs: 30,
            snub_timeout_secs: 60,
            keep_alive_interval_secs: 60,
            peer_inactivity_timeout_secs: 120,
            write_cache_size: 256 * MIB,
            parallel_writes: 8,
            parallel_reads: 8,
        }
    }
}

impl Settings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn unchoke_interval(&self) -> Duration {
        Duration::from_secs(self.unchoke_interval_secs)
    }

    pub fn piece_read_timeout(&self) -> Duration {
        Duration::from_secs(self.piece_read_timeout_secs)
    }

    pub fn snub_timeout(&self) -> Duration {
        Duration::from_secs(self.snub_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn peer_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_inactivity_timeout_secs)
    }

    /// Where a torrent's files go when the caller did not pick a directory.
    pub fn torrent_data_dir(&self, id: &str) -> PathBuf {
        if self.data_dir_includes_torrent_id {
            self.data_dir.join(id)
        } else {
            self.data_dir.clone()
        }
    }
}

/// (config dir, local data dir), created on first use.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("com", "github", "swarmseedr")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_local_dir().to_path_buf();

    fs::create_dir_all(&config_dir).ok()?;
    fs::create_dir_all(&data_dir).ok()?;

    Some((config_dir, data_dir))
}

pub fn default_config_path() -> Option<PathBuf> {
    get_app_paths().map(|(config_dir, _)| config_dir.join("settings.toml"))
}

/// Settings from the TOML file merged with `SWARMSEEDR_*` environment variables.
/// Unreadable or invalid sources fall back to defaults.
pub fn load_settings(config_path: Option<&Path>) -> Settings {
    let Some(path) = config_path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Settings::default();
    };

    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("SWARMSEEDR_"))
        .extract()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid settings, using defaults");
            Settings::default()
        })
}

pub fn save_settings(settings: &Settings, config_path: &Path) -> io::Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_file_path = config_path.with_extension("toml.tmp");
    let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
    fs::write(&temp_file_path, content)?;
    fs::rename(&temp_file_path, config_path)?;
    Ok(())
}
