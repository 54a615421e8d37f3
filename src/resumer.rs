// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent per-torrent records, stored per user so several identities can share a
//! resume directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::errors::ResumeError;

/// Bencode has no booleans; they are stored as 0/1 integers.
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(i64::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(i64::deserialize(d)? != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeRecord {
    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,
    pub name: String,
    /// `<hex peer id>@<socket addr>` entries.
    #[serde(default)]
    pub fixed_peers: Vec<String>,
    /// Raw info dictionary, empty until metadata is known.
    #[serde(default, with = "serde_bytes")]
    pub info: Vec<u8>,
    /// Empty until the first verification or allocation finished.
    #[serde(default, with = "serde_bytes")]
    pub bitfield: Vec<u8>,
    /// Unix seconds.
    pub added_at: u64,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub bytes_uploaded: u64,
    #[serde(default)]
    pub bytes_wasted: u64,
    /// Seconds.
    #[serde(default)]
    pub seeded_for: u64,
    #[serde(default, with = "int_bool")]
    pub started: bool,
    #[serde(default, with = "int_bool")]
    pub stop_after_download: bool,
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeStats {
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_wasted: u64,
    pub seeded_for: Duration,
}

pub type RecordUpdate = Box<dyn FnOnce(&mut ResumeRecord) + Send>;

/// Resume record store. Partial writes to an id without a record are ignored.
#[async_trait]
pub trait Resumer: Send + Sync {
    async fn write(&self, id: &str, record: &ResumeRecord) -> Result<(), ResumeError>;

    async fn read(&self, id: &str) -> Result<ResumeRecord, ResumeError>;

    async fn list(&self) -> Result<Vec<String>, ResumeError>;

    async fn delete(&self, id: &str) -> Result<(), ResumeError>;

    /// Applies `update` to the stored record, if there is one.
    async fn update(&self, id: &str, update: RecordUpdate) -> Result<(), ResumeError>;

    async fn write_info(&self, id: &str, info: Vec<u8>) -> Result<(), ResumeError> {
        self.update(id, Box::new(move |r| r.info = info)).await
    }

    async fn write_bitfield(&self, id: &str, bitfield: Vec<u8>) -> Result<(), ResumeError> {
        self.update(id, Box::new(move |r| r.bitfield = bitfield)).await
    }

    async fn write_started(&self, id: &str, started: bool) -> Result<(), ResumeError> {
        self.update(id, Box::new(move |r| r.started = started)).await
    }

    async fn write_stats(&self, id: &str, stats: ResumeStats) -> Result<(), ResumeError> {
        self.update(
            id,
            Box::new(move |r| {
                r.bytes_downloaded = stats.bytes_downloaded;
                r.bytes_uploaded = stats.bytes_uploaded;
                r.bytes_wasted = stats.bytes_wasted;
                r.seeded_for = stats.seeded_for.as_secs();
            }),
        )
        .await
    }
}

const RECORD_EXTENSION: &str = "resume";

/// One bencoded file per torrent under `<resume_dir>/<user>/`.
pub struct FileResumer {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileResumer {
    pub async fn new(resume_dir: &Path, user: &str) -> Result<Self, ResumeError> {
        let dir = resume_dir.join(user);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn read_unlocked(&self, id: &str) -> Result<ResumeRecord, ResumeError> {
        match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => Ok(serde_bencode::from_bytes(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ResumeError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_unlocked(&self, id: &str, record: &ResumeRecord) -> Result<(), ResumeError> {
        let bytes = serde_bencode::to_bytes(record)?;
        let path = self.path(id);
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl Resumer for FileResumer {
    async fn write(&self, id: &str, record: &ResumeRecord) -> Result<(), ResumeError> {
        let _guard = self.lock.lock().await;
        self.write_unlocked(id, record).await
    }

    async fn read(&self, id: &str) -> Result<ResumeRecord, ResumeError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked(id).await
    }

    async fn list(&self) -> Result<Vec<String>, ResumeError> {
        let _guard = self.lock.lock().await;
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<(), ResumeError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<(), ResumeError> {
        let _guard = self.lock.lock().await;
        let mut record = match self.read_unlocked(id).await {
            Ok(record) => record,
            Err(ResumeError::NotFound(_)) => {
                event!(Level::DEBUG, torrent = id, "No resume record to update");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        update(&mut record);
        self.write_unlocked(id, &record).await
    }
}

/// Keeps records in memory, for tests and embedders that do not persist.
#[derive(Default)]
pub struct MemoryResumer {
    records: Mutex<HashMap<String, ResumeRecord>>,
}

impl MemoryResumer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Resumer for MemoryResumer {
    async fn write(&self, id: &str, record: &ResumeRecord) -> Result<(), ResumeError> {
        self.records
            .lock()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<ResumeRecord, ResumeError> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ResumeError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, ResumeError> {
        let mut ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<(), ResumeError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> Result<(), ResumeError> {
        if let Some(record) = self.records.lock().await.get_mut(id) {
            update(record);
        }
        Ok(())
    }
}
