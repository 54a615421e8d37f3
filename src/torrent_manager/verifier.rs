// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::errors::StorageError;
use crate::resource_manager::ResourceManagerClient;
use crate::storage::Storage;
use crate::torrent_manager::piece::Piece;

/// Runs CPU-bound work off the runtime. A task that panicked or was cancelled is
/// reported as an I/O error rather than a bad hash.
async fn run_blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        event!(Level::WARN, error = %e, "Hashing task failed");
        StorageError::Io(io::Error::other(e))
    })
}

pub(crate) async fn hash_matches(
    data: Vec<u8>,
    expected: [u8; 20],
) -> Result<(Vec<u8>, bool), StorageError> {
    run_blocking(move || {
        let ok = Sha1::digest(&data).as_slice() == expected;
        (data, ok)
    })
    .await
}

/// Reads and hashes every piece in order. Mismatches leave the bit unset; only I/O
/// errors fail the run. `progress` carries the number of pieces checked so far.
/// Returns `None` when stopped or when the resource manager is gone.
pub async fn verify(
    pieces: &[Piece],
    storage: Arc<dyn Storage>,
    resources: &ResourceManagerClient,
    progress: &watch::Sender<u32>,
    stop: &watch::Receiver<bool>,
) -> Result<Option<Bitfield>, StorageError> {
    let mut bitfield = Bitfield::new(pieces.len() as u32);
    for piece in pieces {
        if *stop.borrow() {
            return Ok(None);
        }
        let data = {
            let Ok(_permit) = resources.acquire_disk_read().await else {
                return Ok(None);
            };
            storage.read_at(piece.offset, piece.length as usize).await?
        };
        let (_, ok) = hash_matches(data, piece.hash).await?;
        if ok {
            bitfield.set(piece.index);
        }
        progress.send_replace(piece.index + 1);
    }
    Ok(Some(bitfield))
}
