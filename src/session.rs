// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, RwLock};
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::config::Settings;
use crate::errors::{MetainfoError, ResumeError, SessionError};
use crate::networking::discovery::{Discovery, StaticDiscovery};
use crate::networking::transport::{PeerAddrInfo, PeerId, TcpTransport, Transport};
use crate::resource_manager::{session_limits, ResourceManager, ResourceManagerClient};
use crate::resumer::{FileResumer, ResumeRecord, ResumeStats, Resumer};
use crate::token_bucket::RateLimits;
use crate::torrent_file::{builder, info_hash_hex, magnet, parser, InfoHash, Metainfo};
use crate::torrent_manager::{Stats, TorrentHandle, TorrentManager, TorrentParameters};

/// How a newly added torrent is set up.
#[derive(Debug, Clone, Default)]
pub struct AddTorrentOptions {
    /// Register the torrent without starting it.
    pub stopped: bool,
    pub stop_after_download: bool,
    /// Overrides the directory derived from [`Settings::torrent_data_dir`].
    pub data_dir: Option<PathBuf>,
}

/// Owns the collaborators shared by all torrents and the map of running torrent loops,
/// keyed by hex info-hash.
pub struct Session {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    resumer: Arc<dyn Resumer>,
    resources: ResourceManagerClient,
    limits: RateLimits,
    shutdown_tx: broadcast::Sender<()>,
    torrents: RwLock<HashMap<String, TorrentHandle>>,
}

impl Session {
    /// Binds a TCP transport on `listen_addr` and persists resume data under
    /// `resume_dir/<user>`. Peers come from the fixed peers of each torrent.
    pub async fn open(settings: Settings) -> Result<Self, SessionError> {
        let peer_id = PeerId::generate(&settings.client_id);
        let transport =
            TcpTransport::bind(peer_id, settings.listen_addr, settings.dial_timeout()).await?;
        let resumer = FileResumer::new(&settings.resume_dir, &settings.user).await?;
        Self::new(
            settings,
            Arc::new(transport),
            Arc::new(StaticDiscovery::new(Vec::new())),
            Arc::new(resumer),
        )
        .await
    }

    /// Builds a session on the given collaborators and restores every persisted torrent.
    pub async fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        resumer: Arc<dyn Resumer>,
    ) -> Result<Self, SessionError> {
        if settings.max_open_files > 0 {
            match rlimit::increase_nofile_limit(settings.max_open_files) {
                Ok(limit) => event!(Level::DEBUG, limit, "Open file limit raised"),
                Err(e) => event!(Level::WARN, error = %e, "Could not raise open file limit"),
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (resource_manager, resources) = ResourceManager::new(
            session_limits(
                settings.write_cache_size as usize,
                settings.parallel_reads,
                settings.parallel_writes,
            ),
            shutdown_tx.clone(),
        );
        tokio::spawn(resource_manager.run());

        let session = Self {
            limits: RateLimits::new(
                settings.global_download_limit_bps,
                settings.global_upload_limit_bps,
            ),
            settings: Arc::new(settings),
            transport,
            discovery,
            resumer,
            resources,
            shutdown_tx,
            torrents: RwLock::new(HashMap::new()),
        };
        session.load_torrents().await?;
        Ok(session)
    }

    pub fn local_peer(&self) -> PeerAddrInfo {
        self.transport.local_peer()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn load_torrents(&self) -> Result<(), SessionError> {
        let ids = self.resumer.list().await?;
        let mut torrents = self.torrents.write().await;
        for id in ids {
            let record = match self.resumer.read(&id).await {
                Ok(record) => record,
                Err(e) => {
                    event!(Level::WARN, torrent = %id, error = %e, "Skipping unreadable resume record");
                    continue;
                }
            };
            match self.restore(&id, record).await {
                Ok(handle) => {
                    torrents.insert(id, handle);
                }
                Err(e) => {
                    event!(Level::WARN, torrent = %id, error = %e, "Skipping invalid resume record")
                }
            }
        }
        event!(Level::INFO, count = torrents.len(), "Loaded torrents");
        Ok(())
    }

    async fn restore(&self, id: &str, record: ResumeRecord) -> Result<TorrentHandle, SessionError> {
        let info_hash: InfoHash = record.info_hash.as_slice().try_into().map_err(|_| {
            MetainfoError::InvalidInfoHash(format!("{} bytes", record.info_hash.len()))
        })?;
        let metainfo = if record.info.is_empty() {
            None
        } else {
            Some(Metainfo::from_info_bytes(record.info.clone())?)
        };
        let bitfield = metainfo.as_ref().and_then(|m| {
            (!record.bitfield.is_empty())
                .then(|| Bitfield::from_bytes(&record.bitfield, m.num_pieces()).ok())
                .flatten()
        });
        let fixed_peers = record
            .fixed_peers
            .iter()
            .filter_map(|p| p.parse::<PeerAddrInfo>().ok())
            .collect();

        let handle = self.spawn_torrent(TorrentInit {
            id: id.to_string(),
            info_hash,
            name: record.name,
            metainfo,
            bitfield,
            data_dir: PathBuf::from(record.data_dir),
            stop_after_download: record.stop_after_download,
            initial_stats: ResumeStats {
                bytes_downloaded: record.bytes_downloaded,
                bytes_uploaded: record.bytes_uploaded,
                bytes_wasted: record.bytes_wasted,
                seeded_for: Duration::from_secs(record.seeded_for),
            },
            fixed_peers,
        });
        if record.started {
            handle.start().await?;
        }
        Ok(handle)
    }

    fn spawn_torrent(&self, init: TorrentInit) -> TorrentHandle {
        let (manager, handle) = TorrentManager::new(TorrentParameters {
            id: init.id,
            info_hash: init.info_hash,
            name: init.name,
            metainfo: init.metainfo,
            bitfield: init.bitfield,
            data_dir: init.data_dir,
            stop_after_download: init.stop_after_download,
            initial_stats: init.initial_stats,
            fixed_peers: init.fixed_peers,
            settings: self.settings.clone(),
            transport: self.transport.clone(),
            discovery: self.discovery.clone(),
            resumer: self.resumer.clone(),
            resource_manager: self.resources.clone(),
            limits: self.limits.clone(),
        });
        tokio::spawn(manager.run());
        handle
    }

    /// Adds a torrent from a magnet link or a bare info-hash. Adding a known info-hash
    /// returns the existing torrent.
    pub async fn add_magnet(
        &self,
        uri: &str,
        options: AddTorrentOptions,
    ) -> Result<TorrentHandle, SessionError> {
        let link = magnet::parse(uri)?;
        self.add(
            link.info_hash,
            link.name.unwrap_or_default(),
            None,
            None,
            options,
        )
        .await
    }

    /// Adds a torrent from the contents of a `.torrent` file.
    pub async fn add_torrent_bytes(
        &self,
        bytes: &[u8],
        options: AddTorrentOptions,
    ) -> Result<TorrentHandle, SessionError> {
        let (_, metainfo) = parser::from_bytes(bytes)?;
        let name = metainfo.name().to_string();
        self.add(metainfo.info_hash, name, Some(metainfo), None, options)
            .await
    }

    /// Hashes local content and seeds it in place. The data is trusted as complete, so
    /// verification is skipped.
    pub async fn create_from_path(
        &self,
        path: &Path,
        options: AddTorrentOptions,
    ) -> Result<TorrentHandle, SessionError> {
        let content = path.to_path_buf();
        let info = tokio::task::spawn_blocking(move || builder::create_info(&content, 0))
            .await
            .map_err(|e| MetainfoError::Io(std::io::Error::other(e)))??;
        let metainfo = Metainfo::from_info(info)?;
        let mut bitfield = Bitfield::new(metainfo.num_pieces());
        bitfield.set_all();

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let options = AddTorrentOptions {
            data_dir: Some(parent),
            ..options
        };
        let name = metainfo.name().to_string();
        self.add(
            metainfo.info_hash,
            name,
            Some(metainfo),
            Some(bitfield),
            options,
        )
        .await
    }

    async fn add(
        &self,
        info_hash: InfoHash,
        name: String,
        metainfo: Option<Metainfo>,
        bitfield: Option<Bitfield>,
        options: AddTorrentOptions,
    ) -> Result<TorrentHandle, SessionError> {
        let id = info_hash_hex(&info_hash);
        let mut torrents = self.torrents.write().await;
        if let Some(existing) = torrents.get(&id) {
            event!(Level::INFO, torrent = %id, "Torrent already present");
            return Ok(existing.clone());
        }

        let data_dir = options
            .data_dir
            .unwrap_or_else(|| self.settings.torrent_data_dir(&id));
        let record = ResumeRecord {
            info_hash: info_hash.to_vec(),
            name: name.clone(),
            info: metainfo
                .as_ref()
                .map(|m| m.info_bytes.clone())
                .unwrap_or_default(),
            bitfield: bitfield
                .as_ref()
                .map(|b| b.bytes().to_vec())
                .unwrap_or_default(),
            added_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            stop_after_download: options.stop_after_download,
            data_dir: data_dir.display().to_string(),
            ..Default::default()
        };
        self.resumer.write(&id, &record).await?;

        let handle = self.spawn_torrent(TorrentInit {
            id: id.clone(),
            info_hash,
            name,
            metainfo,
            bitfield,
            data_dir,
            stop_after_download: options.stop_after_download,
            initial_stats: ResumeStats::default(),
            fixed_peers: Vec::new(),
        });
        event!(Level::INFO, torrent = %id, name = %record.name, "Torrent added");
        if !options.stopped {
            handle.start().await?;
        }
        torrents.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Option<TorrentHandle> {
        self.torrents.read().await.get(id).cloned()
    }

    /// All torrents, ordered by id.
    pub async fn list(&self) -> Vec<TorrentHandle> {
        let mut handles: Vec<TorrentHandle> = self.torrents.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub async fn stats(&self, id: &str) -> Result<Stats, SessionError> {
        let handle = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(handle.stats().await?)
    }

    /// Closes the torrent and forgets its resume record. Downloaded data stays on disk.
    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .torrents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        handle.close().await;
        match self.resumer.delete(id).await {
            Ok(()) | Err(ResumeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        event!(Level::INFO, torrent = %id, "Torrent removed");
        Ok(())
    }

    /// Stops every torrent, waiting for each loop to finish, then shuts down the
    /// resource manager.
    pub async fn close(&self) {
        let handles: Vec<TorrentHandle> = self.torrents.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
        let _ = self.shutdown_tx.send(());
        event!(Level::INFO, "Session closed");
    }
}

struct TorrentInit {
    id: String,
    info_hash: InfoHash,
    name: String,
    metainfo: Option<Metainfo>,
    bitfield: Option<Bitfield>,
    data_dir: PathBuf,
    stop_after_download: bool,
    initial_stats: ResumeStats,
    fixed_peers: Vec<PeerAddrInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::memory::{MemoryNetwork, MemoryNode};
    use crate::resumer::MemoryResumer;
    use crate::torrent_file::tests::single_file_info;
    use crate::torrent_file::Torrent;
    use crate::torrent_manager::Status;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.join("data"),
            resume_dir: dir.join("resume"),
            max_open_files: 0,
            unchoke_interval_secs: 1,
            discovery_interval_secs: 1,
            ..Settings::default()
        }
    }

    async fn session_on(node: &MemoryNode, resumer: Arc<MemoryResumer>, dir: &TempDir) -> Session {
        Session::new(
            test_settings(dir.path()),
            Arc::new(node.clone()),
            Arc::new(node.clone()),
            resumer,
        )
        .await
        .unwrap()
    }

    async fn wait_status(handle: &TorrentHandle, status: Status) {
        let mut rx = handle.subscribe_status();
        let reached = matches!(timeout(WAIT, rx.wait_for(|s| *s == status)).await, Ok(Ok(_)));
        assert!(reached, "status {status} not reached, still {}", handle.status());
    }

    #[tokio::test]
    async fn test_add_magnet_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let resumer = Arc::new(MemoryResumer::new());
        let session = session_on(&network.node(PeerId([1; 20])), resumer.clone(), &dir).await;

        let uri = format!("magnet:?xt=urn:btih:{}&dn=Some+Show", "ab".repeat(20));
        let options = AddTorrentOptions {
            stopped: true,
            ..Default::default()
        };
        let first = session.add_magnet(&uri, options.clone()).await.unwrap();
        let second = session.add_magnet(&"ab".repeat(20), options).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(session.list().await.len(), 1);

        let record = resumer.read(first.id()).await.unwrap();
        assert_eq!(record.name, "Some Show");
        assert_eq!(record.info_hash, vec![0xAB; 20]);
        assert!(record.info.is_empty());
        assert_eq!(PathBuf::from(record.data_dir), dir.path().join("data"));

        let stats = session.stats(first.id()).await.unwrap();
        assert_eq!(stats.status, Status::Stopped);
        assert_eq!(stats.name, "Some Show");
        session.close().await;
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let session = session_on(&network.node(PeerId([1; 20])), Arc::new(MemoryResumer::new()), &dir).await;

        let err = session
            .add_torrent_bytes(b"not bencode", AddTorrentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Input(_)));
        let err = session
            .add_magnet("magnet:?xt=urn:btih:1234", AddTorrentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Input(_)));
        assert!(matches!(
            session.stats("missing").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(session.list().await.is_empty());
        session.close().await;
    }

    #[tokio::test]
    async fn test_seed_local_file_and_download_by_torrent_file() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let source = dir.path().join("share");
        tokio::fs::create_dir_all(&source).await.unwrap();
        let file = source.join("payload.bin");
        tokio::fs::write(&file, &content).await.unwrap();

        let seed_dir = tempfile::tempdir().unwrap();
        let seeder = session_on(&network.node(PeerId([1; 20])), Arc::new(MemoryResumer::new()), &seed_dir).await;
        let seeded = seeder
            .create_from_path(&file, AddTorrentOptions::default())
            .await
            .unwrap();
        wait_status(&seeded, Status::Seeding).await;
        assert_eq!(seeder.stats(seeded.id()).await.unwrap().pieces.checked, 0);

        let info = single_file_info("payload.bin", 16384, &content);
        let bytes = serde_bencode::to_bytes(&Torrent {
            info,
            ..Default::default()
        })
        .unwrap();

        let leech_dir = tempfile::tempdir().unwrap();
        let leecher = session_on(&network.node(PeerId([2; 20])), Arc::new(MemoryResumer::new()), &leech_dir).await;
        let leeching = leecher
            .add_torrent_bytes(&bytes, AddTorrentOptions::default())
            .await
            .unwrap();
        assert_eq!(leeching.id(), seeded.id());
        // Found through discovery; no fixed peers were given.
        timeout(WAIT, leeching.wait_complete()).await.unwrap().unwrap();

        let downloaded = tokio::fs::read(leech_dir.path().join("data").join("payload.bin"))
            .await
            .unwrap();
        assert_eq!(downloaded, content);
        seeder.close().await;
        leecher.close().await;
    }

    #[tokio::test]
    async fn test_restart_restores_started_torrents() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let node = network.node(PeerId([1; 20]));
        let resumer = Arc::new(MemoryResumer::new());
        let file = dir.path().join("keep.bin");
        tokio::fs::write(&file, vec![9u8; 40_000]).await.unwrap();

        let session = session_on(&node, resumer.clone(), &dir).await;
        let seeded = session
            .create_from_path(&file, AddTorrentOptions::default())
            .await
            .unwrap();
        let parked = session
            .add_magnet(&"cd".repeat(20), AddTorrentOptions { stopped: true, ..Default::default() })
            .await
            .unwrap();
        wait_status(&seeded, Status::Seeding).await;
        let id = seeded.id().to_string();
        session.close().await;
        assert!(resumer.read(&id).await.unwrap().started);

        let session = session_on(&node, resumer.clone(), &dir).await;
        assert_eq!(session.list().await.len(), 2);
        let restored = session.get(&id).await.unwrap();
        wait_status(&restored, Status::Seeding).await;
        let stats = restored.stats().await.unwrap();
        assert_eq!(stats.name, "keep.bin");
        assert_eq!(stats.pieces.have, stats.pieces.total);
        let parked = session.get(parked.id()).await.unwrap();
        assert_eq!(parked.status(), Status::Stopped);

        session.remove(&id).await.unwrap();
        assert!(matches!(
            resumer.read(&id).await,
            Err(ResumeError::NotFound(_))
        ));
        assert!(session.get(&id).await.is_none());
        assert!(matches!(
            session.remove(&id).await,
            Err(SessionError::NotFound(_))
        ));
        session.close().await;
    }
}
