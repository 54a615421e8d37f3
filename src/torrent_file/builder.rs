// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::errors::MetainfoError;
use crate::torrent_file::{Info, InfoFile};

const MIN_PIECE_LENGTH: u32 = 16 * 1024;
const MAX_PIECE_LENGTH: u32 = 16 * 1024 * 1024;
const TARGET_PIECE_COUNT: u64 = 2048;

/// Smallest power of two keeping the piece count near `TARGET_PIECE_COUNT`.
pub fn default_piece_length(total_length: u64) -> u32 {
    let mut piece_length = MIN_PIECE_LENGTH;
    while piece_length < MAX_PIECE_LENGTH
        && total_length.div_ceil(piece_length as u64) > TARGET_PIECE_COUNT
    {
        piece_length *= 2;
    }
    piece_length
}

/// Hashes a file or directory tree into an info dictionary. Blocking; run it off the runtime.
/// `piece_length == 0` picks one from the content size.
pub fn create_info(path: &Path, piece_length: u32) -> Result<Info, MetainfoError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MetainfoError::InvalidLength(format!("no usable file name in {:?}", path)))?
        .to_string();

    let meta = fs::metadata(path)?;
    let mut sources: Vec<(PathBuf, Vec<String>, u64)> = Vec::new();
    if meta.is_dir() {
        collect_files(path, &mut Vec::new(), &mut sources)?;
        if sources.is_empty() {
            return Err(MetainfoError::InvalidLength(format!(
                "directory {:?} contains no files",
                path
            )));
        }
    } else {
        sources.push((path.to_path_buf(), vec![name.clone()], meta.len()));
    }

    let total: u64 = sources.iter().map(|(_, _, len)| len).sum();
    let piece_length = if piece_length == 0 {
        default_piece_length(total)
    } else {
        piece_length
    };

    let mut pieces = Vec::with_capacity(total.div_ceil(piece_length as u64) as usize * 20);
    let mut hasher = Sha1::new();
    let mut filled = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    for (source, _, _) in &sources {
        let mut file = File::open(source)?;
        loop {
            let want = buf.len().min(piece_length as usize - filled);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            filled += n;
            if filled == piece_length as usize {
                pieces.extend_from_slice(&hasher.finalize_reset());
                filled = 0;
            }
        }
    }
    if filled > 0 {
        pieces.extend_from_slice(&hasher.finalize());
    }

    let mut info = Info {
        piece_length: piece_length as i64,
        pieces,
        name,
        ..Default::default()
    };
    if meta.is_dir() {
        info.files = sources
            .into_iter()
            .map(|(_, rel, len)| InfoFile {
                length: len as i64,
                path: rel,
            })
            .collect();
    } else {
        info.length = total as i64;
    }
    info.validate()?;
    Ok(info)
}

fn collect_files(
    dir: &Path,
    prefix: &mut Vec<String>,
    out: &mut Vec<(PathBuf, Vec<String>, u64)>,
) -> Result<(), MetainfoError> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let Some(component) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let file_type = entry.file_type()?;
        prefix.push(component);
        if file_type.is_dir() {
            collect_files(&entry.path(), prefix, out)?;
        } else if file_type.is_file() {
            out.push((entry.path(), prefix.clone(), entry.metadata()?.len()));
        }
        prefix.pop();
    }
    Ok(())
}
