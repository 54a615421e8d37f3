// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod addr_list;
pub mod allocator;
pub mod info_downloader;
pub mod manager;
pub mod piece;
pub mod piece_downloader;
pub mod piece_picker;
pub mod stats;
pub(crate) mod tasks;
pub mod unchoker;
pub mod verifier;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::bitfield::Bitfield;
use crate::config::Settings;
use crate::networking::discovery::Discovery;
use crate::networking::transport::{PeerAddrInfo, Transport};
use crate::resource_manager::ResourceManagerClient;
use crate::resumer::{ResumeStats, Resumer};
use crate::token_bucket::RateLimits;
use crate::torrent_file::{InfoHash, Metainfo};

pub use manager::{TorrentHandle, TorrentManager};
pub use stats::{Stats, Status};

/// Everything a torrent loop needs at construction. Collaborators are shared with the
/// rest of the session.
pub struct TorrentParameters {
    /// Hex info-hash; also the resume record key.
    pub id: String,
    pub info_hash: InfoHash,
    pub name: String,
    /// `None` for magnet starts until metadata arrives from peers.
    pub metainfo: Option<Metainfo>,
    /// Resumed bitfield, trusted only if allocation finds nothing missing.
    pub bitfield: Option<Bitfield>,
    pub data_dir: PathBuf,
    pub stop_after_download: bool,
    pub initial_stats: ResumeStats,
    pub fixed_peers: Vec<PeerAddrInfo>,

    pub settings: Arc<Settings>,
    pub transport: Arc<dyn Transport>,
    pub discovery: Arc<dyn Discovery>,
    pub resumer: Arc<dyn Resumer>,
    pub resource_manager: ResourceManagerClient,
    pub limits: RateLimits,
}

#[derive(Debug)]
pub enum ManagerCommand {
    Start,
    Stop,
    /// Re-check all data on disk and stop afterwards.
    Verify,
    Stats(oneshot::Sender<Stats>),
    AddPeers(Vec<PeerAddrInfo>),
    /// Stops the torrent and ends the loop; acknowledged once everything is torn down.
    Close(oneshot::Sender<()>),
}
