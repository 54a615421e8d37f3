// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use tokio::fs::{self, OpenOptions};
use tokio::sync::watch;
use tracing::{event, Level};

use crate::errors::StorageError;
use crate::storage::MultiFileInfo;

/// What allocation found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    /// At least one file was already present.
    pub has_existing: bool,
    /// At least one file was absent or shorter than its final length.
    pub has_missing: bool,
    pub allocated: u64,
}

/// Creates every file of the layout at its final (sparse) length. Returns `None` if
/// `stop` flipped to true between files.
pub async fn allocate(
    layout: &MultiFileInfo,
    stop: &watch::Receiver<bool>,
) -> Result<Option<Allocation>, StorageError> {
    let mut result = Allocation::default();
    for file in &layout.files {
        if *stop.borrow() {
            return Ok(None);
        }
        if let Some(parent) = file.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let existing_len = match fs::metadata(&file.path).await {
            Ok(meta) => {
                result.has_existing = true;
                Some(meta.len())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file.path)
            .await?;
        if existing_len != Some(file.length) {
            result.has_missing = true;
            handle.set_len(file.length).await?;
            event!(Level::DEBUG, path = %file.path.display(), length = file.length, "Allocated file");
        }
        result.allocated += file.length;
    }
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::{Info, InfoFile};
    use tempfile::tempdir;

    fn layout(root: &std::path::Path) -> MultiFileInfo {
        let info = Info {
            name: "set".into(),
            piece_length: 16384,
            files: vec![
                InfoFile {
                    path: vec!["a.bin".into()],
                    length: 1000,
                },
                InfoFile {
                    path: vec!["nested".into(), "b.bin".into()],
                    length: 30000,
                },
            ],
            ..Default::default()
        };
        MultiFileInfo::new(root, &info)
    }

    #[tokio::test]
    async fn test_fresh_allocation_then_idempotent() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let (_tx, stop) = watch::channel(false);

        let first = allocate(&layout, &stop).await.unwrap().unwrap();
        assert!(!first.has_existing);
        assert!(first.has_missing);
        assert_eq!(first.allocated, 31000);
        let meta = std::fs::metadata(&layout.files[1].path).unwrap();
        assert_eq!(meta.len(), 30000);

        for _ in 0..2 {
            let again = allocate(&layout, &stop).await.unwrap().unwrap();
            assert!(again.has_existing);
            assert!(!again.has_missing);
        }
    }

    #[tokio::test]
    async fn test_short_file_is_extended() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let (_tx, stop) = watch::channel(false);
        allocate(&layout, &stop).await.unwrap();
        std::fs::write(&layout.files[0].path, b"short").unwrap();

        let result = allocate(&layout, &stop).await.unwrap().unwrap();
        assert!(result.has_existing && result.has_missing);
        assert_eq!(std::fs::metadata(&layout.files[0].path).unwrap().len(), 1000);
        assert_eq!(&std::fs::read(&layout.files[0].path).unwrap()[..5], b"short");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let dir = tempdir().unwrap();
        let (_tx, stop) = watch::channel(true);
        assert_eq!(allocate(&layout(dir.path()), &stop).await.unwrap(), None);
        assert!(!layout(dir.path()).files[0].path.exists());
    }
}
