// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-torrent peer-to-peer download and upload engine.
//!
//! A [`Session`] owns the shared transport, discovery, resume store and resource
//! limits. Every torrent runs as its own [`TorrentManager`] loop and is driven through
//! a [`TorrentHandle`].

pub mod bitfield;
pub mod config;
pub mod errors;
pub mod networking;
pub mod resource_manager;
pub mod resumer;
pub mod session;
pub mod storage;
pub mod token_bucket;
pub mod torrent_file;
pub mod torrent_manager;

pub use config::Settings;
pub use session::{AddTorrentOptions, Session};
pub use torrent_manager::{Stats, Status, TorrentHandle, TorrentManager};
