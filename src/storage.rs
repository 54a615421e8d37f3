// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::errors::StorageError;
use crate::torrent_file::Info;

/// Random-access byte store addressed by offset into the torrent's concatenated data.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError>;

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn total_size(&self) -> u64;

    /// Further reads and writes fail with `StorageError::Closed`.
    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub length: u64,
    /// Start of this file within the torrent's data stream.
    pub global_start_offset: u64,
}

/// On-disk layout of a torrent. Single-file torrents live at `root/name`;
/// multi-file torrents live under the `root/name/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFileInfo {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl MultiFileInfo {
    pub fn new(root_dir: &Path, info: &Info) -> Self {
        if !info.is_multi_file() {
            let total_size = info.length as u64;
            return Self {
                files: vec![FileInfo {
                    path: root_dir.join(&info.name),
                    length: total_size,
                    global_start_offset: 0,
                }],
                total_size,
            };
        }

        let base = root_dir.join(&info.name);
        let mut files = Vec::with_capacity(info.files.len());
        let mut current_offset = 0;
        for f in &info.files {
            let mut full_path = base.clone();
            for component in &f.path {
                full_path.push(component);
            }
            files.push(FileInfo {
                path: full_path,
                length: f.length as u64,
                global_start_offset: current_offset,
            });
            current_offset += f.length as u64;
        }
        Self {
            files,
            total_size: current_offset,
        }
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<(), StorageError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.total_size => Ok(()),
            _ => Err(StorageError::OutOfBounds {
                offset,
                length,
                total: self.total_size,
            }),
        }
    }

    /// (file index, offset within file, byte count) for every file touched by the range.
    fn spans(&self, offset: u64, length: u64) -> impl Iterator<Item = (usize, u64, u64)> + '_ {
        let end = offset + length;
        self.files
            .iter()
            .enumerate()
            .filter_map(move |(i, f)| {
                let file_end = f.global_start_offset + f.length;
                let start = offset.max(f.global_start_offset);
                let stop = end.min(file_end);
                (start < stop).then(|| (i, start - f.global_start_offset, stop - start))
            })
    }
}

pub struct FileStorage {
    layout: MultiFileInfo,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new(layout: MultiFileInfo) -> Self {
        Self {
            layout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> &MultiFileInfo {
        &self.layout
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.ensure_open()?;
        self.layout.check_bounds(offset, length as u64)?;

        let mut buffer = vec![0u8; length];
        let mut filled = 0usize;
        for (index, local_offset, count) in self.layout.spans(offset, length as u64) {
            let mut file = File::open(&self.layout.files[index].path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            let count = count as usize;
            file.read_exact(&mut buffer[filled..filled + count]).await?;
            filled += count;
        }
        Ok(buffer)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.layout.check_bounds(offset, data.len() as u64)?;

        let mut written = 0usize;
        for (index, local_offset, count) in self.layout.spans(offset, data.len() as u64) {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&self.layout.files[index].path)
                .await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            let count = count as usize;
            file.write_all(&data[written..written + count]).await?;
            written += count;
        }
        Ok(())
    }

    fn total_size(&self) -> u64 {
        self.layout.total_size
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
