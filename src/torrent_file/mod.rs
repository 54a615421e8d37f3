// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod builder;
pub mod magnet;
pub mod parser;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::MetainfoError;

pub const HASH_LEN: usize = 20;

pub type InfoHash = [u8; HASH_LEN];

pub fn info_hash_hex(info_hash: &InfoHash) -> String {
    hex::encode(info_hash)
}

pub fn info_hash_from_hex(s: &str) -> Result<InfoHash, MetainfoError> {
    let bytes = hex::decode(s).map_err(|e| MetainfoError::InvalidInfoHash(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| MetainfoError::InvalidInfoHash(format!("{} bytes", b.len())))
}

/// Outer `.torrent` document. Only the info dictionary matters to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Torrent {
    pub info: Info,

    #[serde(rename = "creation date", default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(rename = "created by", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Info {
    #[serde(rename = "piece length")]
    pub piece_length: i64,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub pieces: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InfoFile>,

    pub name: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub length: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Info {
    pub fn total_length(&self) -> i64 {
        if !self.files.is_empty() {
            return self.files.iter().map(|f| f.length).sum();
        }
        self.length
    }

    pub fn num_pieces(&self) -> u32 {
        (self.pieces.len() / HASH_LEN) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<[u8; HASH_LEN]> {
        let start = index as usize * HASH_LEN;
        self.pieces
            .get(start..start + HASH_LEN)
            .and_then(|h| h.try_into().ok())
    }

    /// (relative path components, length) for every file, in stream order.
    pub fn file_list(&self) -> Vec<(Vec<String>, u64)> {
        if !self.files.is_empty() {
            self.files
                .iter()
                .map(|f| (f.path.clone(), f.length as u64))
                .collect()
        } else {
            vec![(vec![self.name.clone()], self.length as u64)]
        }
    }

    pub fn is_multi_file(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length <= 0 || self.piece_length > u32::MAX as i64 {
            return Err(MetainfoError::InvalidLength(format!(
                "piece length {}",
                self.piece_length
            )));
        }
        if self.pieces.len() % HASH_LEN != 0 {
            return Err(MetainfoError::InvalidPieces(format!(
                "hash blob of {} bytes is not a multiple of {}",
                self.pieces.len(),
                HASH_LEN
            )));
        }
        if self.length < 0 || self.files.iter().any(|f| f.length < 0) {
            return Err(MetainfoError::InvalidLength("negative file length".into()));
        }
        if !is_safe_component(&self.name) {
            return Err(MetainfoError::InvalidLength(format!(
                "unsafe torrent name {:?}",
                self.name
            )));
        }
        for file in &self.files {
            if file.path.is_empty() || !file.path.iter().all(|c| is_safe_component(c)) {
                return Err(MetainfoError::InvalidLength(format!(
                    "unsafe file path {:?}",
                    file.path
                )));
            }
        }
        let total = self.total_length() as u64;
        let expected = total.div_ceil(self.piece_length as u64);
        if expected != self.num_pieces() as u64 {
            return Err(MetainfoError::InvalidPieces(format!(
                "{} hashes for {} bytes at piece length {}",
                self.num_pieces(),
                total,
                self.piece_length
            )));
        }
        Ok(())
    }
}

fn is_safe_component(c: &str) -> bool {
    !c.is_empty() && c != "." && c != ".." && !c.contains('/') && !c.contains('\\')
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InfoFile {
    pub length: i64,

    pub path: Vec<String>,
}

/// A validated info dictionary together with the exact bytes it was hashed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    pub info_bytes: Vec<u8>,
}

impl Metainfo {
    /// The info-hash is the SHA-1 of `info_bytes` exactly as given.
    pub fn from_info_bytes(info_bytes: Vec<u8>) -> Result<Self, MetainfoError> {
        let info: Info = serde_bencode::from_bytes(&info_bytes)?;
        info.validate()?;
        let info_hash: InfoHash = Sha1::digest(&info_bytes).into();
        Ok(Self {
            info,
            info_hash,
            info_bytes,
        })
    }

    pub fn from_info(info: Info) -> Result<Self, MetainfoError> {
        let bytes = serde_bencode::to_bytes(&info)?;
        Self::from_info_bytes(bytes)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn piece_length(&self) -> u32 {
        self.info.piece_length as u32
    }

    pub fn total_length(&self) -> u64 {
        self.info.total_length() as u64
    }

    pub fn num_pieces(&self) -> u32 {
        self.info.num_pieces()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a valid single-file info dict over `data`.
    pub(crate) fn single_file_info(name: &str, piece_length: u32, data: &[u8]) -> Info {
        let pieces = data
            .chunks(piece_length as usize)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        Info {
            piece_length: piece_length as i64,
            pieces,
            name: name.to_string(),
            length: data.len() as i64,
            ..Default::default()
        }
    }

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hash = [0xABu8; 20];
        let hex = info_hash_hex(&hash);
        assert_eq!(hex.len(), 40);
        assert_eq!(info_hash_from_hex(&hex).unwrap(), hash);
        assert!(info_hash_from_hex("abcd").is_err());
    }

    #[test]
    fn test_metainfo_hash_matches_raw_bytes() {
        let data = vec![7u8; 40_000];
        let info = single_file_info("file.bin", 16384, &data);
        let meta = Metainfo::from_info(info.clone()).unwrap();
        let expected: [u8; 20] = Sha1::digest(&meta.info_bytes).into();
        assert_eq!(meta.info_hash, expected);
        assert_eq!(meta.num_pieces(), 3);
        assert_eq!(meta.total_length(), 40_000);
        assert_eq!(meta.info, info);
    }

    #[test]
    fn test_validate_rejects_bad_hash_count() {
        let mut info = single_file_info("file.bin", 16384, &[1u8; 20_000]);
        info.pieces.truncate(20);
        assert!(matches!(
            info.validate(),
            Err(MetainfoError::InvalidPieces(_))
        ));

        info.pieces.push(0);
        assert!(matches!(
            info.validate(),
            Err(MetainfoError::InvalidPieces(_))
        ));
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        let mut info = single_file_info("root", 16384, &[1u8; 10]);
        info.length = 0;
        info.files = vec![InfoFile {
            length: 10,
            path: vec!["..".into(), "etc".into()],
        }];
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_piece_hash_and_file_list() {
        let info = single_file_info("a.bin", 4, b"abcdefgh");
        assert_eq!(info.piece_hash(1).unwrap(), <[u8; 20]>::from(Sha1::digest(b"efgh")));
        assert!(info.piece_hash(2).is_none());
        assert_eq!(info.file_list(), vec![(vec!["a.bin".to_string()], 8)]);
        assert!(!info.is_multi_file());
    }
}
