// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::errors::StorageError;
use crate::networking::connection::BlockReader;
use crate::networking::discovery::Discovery;
use crate::networking::protocol::BlockInfo;
use crate::networking::transport::{PeerAddrInfo, PeerId};
use crate::resource_manager::{PermitGuard, ResourceManagerClient, ResourceManagerError};
use crate::storage::Storage;
use crate::torrent_file::InfoHash;
use crate::torrent_manager::allocator::Allocation;
use crate::torrent_manager::verifier::hash_matches;

/// Results of background work, tagged with the run they belong to so completions
/// from before a stop are ignored.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    Allocated(Result<Option<Allocation>, StorageError>),
    Verified(Result<Option<Bitfield>, StorageError>),
    PieceWritten(PieceWriteResult),
    RamGranted {
        peer: PeerId,
        piece: u32,
        allowed_fast: bool,
        permit: Result<PermitGuard, ResourceManagerError>,
    },
    PeersFound(Vec<PeerAddrInfo>),
}

pub(crate) type TaskSender = mpsc::UnboundedSender<(u64, TaskEvent)>;

/// Serves upload reads from storage, one disk-read permit per block.
pub(crate) struct StorageBlockReader {
    pub storage: Arc<dyn Storage>,
    pub piece_length: u64,
    pub resources: ResourceManagerClient,
}

#[async_trait]
impl BlockReader for StorageBlockReader {
    async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>, StorageError> {
        let _permit = self
            .resources
            .acquire_disk_read()
            .await
            .map_err(|_| StorageError::Closed)?;
        let offset = block.piece_index as u64 * self.piece_length + block.offset as u64;
        self.storage.read_at(offset, block.length as usize).await
    }
}

#[derive(Debug)]
pub(crate) struct PieceWriteJob {
    pub peer: PeerId,
    pub index: u32,
    pub offset: u64,
    pub hash: [u8; 20],
    pub buffer: Vec<u8>,
    pub ram_permit: Option<PermitGuard>,
}

#[derive(Debug)]
pub(crate) struct PieceWriteResult {
    pub peer: PeerId,
    pub index: u32,
    pub len: usize,
    pub hash_ok: bool,
    pub error: Option<StorageError>,
}

/// Hashes the assembled piece and writes it if the hash matches. The piece buffer
/// budget is held until the write finished.
pub(crate) async fn write_piece(
    job: PieceWriteJob,
    storage: Arc<dyn Storage>,
    resources: ResourceManagerClient,
) -> PieceWriteResult {
    let PieceWriteJob {
        peer,
        index,
        offset,
        hash,
        buffer,
        ram_permit,
    } = job;
    let len = buffer.len();

    let (hash_ok, error) = match hash_matches(buffer, hash).await {
        Ok((buffer, true)) => match resources.acquire_disk_write().await {
            Ok(_permit) => (true, storage.write_at(offset, &buffer).await.err()),
            Err(_) => (true, Some(StorageError::Closed)),
        },
        Ok((_, false)) => (false, None),
        Err(e) => (false, Some(e)),
    };
    drop(ram_permit);
    PieceWriteResult {
        peer,
        index,
        len,
        hash_ok,
        error,
    }
}

/// Advertises the torrent every `interval` and, while the torrent wants more peers,
/// asks discovery for providers.
pub(crate) async fn announce_loop(
    discovery: Arc<dyn Discovery>,
    info_hash: InfoHash,
    interval: Duration,
    limit: usize,
    need_more_peers: Arc<AtomicBool>,
    tx: TaskSender,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = discovery.advertise(&info_hash).await {
            event!(Level::DEBUG, error = %e, "Advertise failed");
        }
        if !need_more_peers.load(Ordering::Relaxed) {
            continue;
        }
        match discovery.find_providers(&info_hash, limit).await {
            Ok(peers) if !peers.is_empty() => {
                if tx.send((generation, TaskEvent::PeersFound(peers))).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => event!(Level::DEBUG, error = %e, "Provider lookup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::discovery::StaticDiscovery;
    use crate::resource_manager::tests::spawn_test_manager;
    use crate::storage::tests::allocate_for_test;
    use crate::storage::{FileStorage, MultiFileInfo};
    use crate::torrent_file::tests::single_file_info;
    use sha1::{Digest, Sha1};
    use tempfile::tempdir;

    async fn storage(len: usize) -> (tempfile::TempDir, Arc<FileStorage>) {
        let dir = tempdir().unwrap();
        let info = single_file_info("x", 16384, &vec![0u8; len]);
        let layout = MultiFileInfo::new(dir.path(), &info);
        allocate_for_test(&layout).await;
        (dir, Arc::new(FileStorage::new(layout)))
    }

    #[tokio::test]
    async fn test_write_piece_checks_hash() {
        let (_dir, storage) = storage(32768).await;
        let resources = spawn_test_manager();
        let data = vec![5u8; 16384];
        let hash: [u8; 20] = Sha1::digest(&data).into();

        let job = |buffer: Vec<u8>| PieceWriteJob {
            peer: PeerId([1; 20]),
            index: 1,
            offset: 16384,
            hash,
            buffer,
            ram_permit: None,
        };
        let bad = write_piece(job(vec![6u8; 16384]), storage.clone(), resources.clone()).await;
        assert!(!bad.hash_ok);
        assert_eq!(bad.len, 16384);
        assert_eq!(storage.read_at(16384, 4).await.unwrap(), vec![0; 4]);

        let good = write_piece(job(data.clone()), storage.clone(), resources.clone()).await;
        assert!(good.hash_ok && good.error.is_none());
        assert_eq!(storage.read_at(16384, 16384).await.unwrap(), data);

        let reader = StorageBlockReader {
            storage: storage.clone(),
            piece_length: 16384,
            resources,
        };
        let block = reader
            .read_block(BlockInfo {
                piece_index: 1,
                offset: 100,
                length: 10,
            })
            .await
            .unwrap();
        assert_eq!(block, vec![5; 10]);
    }

    #[tokio::test]
    async fn test_announce_loop_reports_providers_when_needed() {
        let provider = PeerAddrInfo::new(PeerId([9; 20]), vec![([10, 0, 0, 9], 1).into()]);
        let discovery = Arc::new(StaticDiscovery::new(vec![provider.clone()]));
        let need = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(announce_loop(
            discovery,
            [0; 20],
            Duration::from_secs(60),
            10,
            need,
            tx,
            7,
        ));
        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(event, TaskEvent::PeersFound(peers) if peers == vec![provider]));
        task.abort();
    }
}
