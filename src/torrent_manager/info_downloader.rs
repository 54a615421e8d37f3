// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeSet, HashSet, VecDeque};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::networking::protocol::METADATA_PIECE_SIZE;
use crate::networking::transport::PeerId;
use crate::torrent_file::InfoHash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InfoDownloadError {
    #[error("metadata size {0} is out of range")]
    InvalidSize(u64),
    #[error("metadata piece {0} was not requested")]
    NotRequested(u32),
    #[error("metadata piece {piece} has length {length}, expected {expected}")]
    InvalidLength { piece: u32, length: usize, expected: usize },
}

/// Fetches the info dictionary from one peer in 16 KiB ut_metadata pieces.
#[derive(Debug)]
pub struct InfoDownloader {
    pub peer: PeerId,
    size: usize,
    buffer: Vec<u8>,
    unrequested: VecDeque<u32>,
    requested: BTreeSet<u32>,
    received: HashSet<u32>,
    num_pieces: u32,
}

impl InfoDownloader {
    pub fn new(peer: PeerId, metadata_size: u64, max_size: u64) -> Result<Self, InfoDownloadError> {
        if metadata_size == 0 || metadata_size > max_size {
            return Err(InfoDownloadError::InvalidSize(metadata_size));
        }
        let size = metadata_size as usize;
        let num_pieces = metadata_size.div_ceil(METADATA_PIECE_SIZE as u64) as u32;
        Ok(Self {
            peer,
            size,
            buffer: vec![0; size],
            unrequested: (0..num_pieces).collect(),
            requested: BTreeSet::new(),
            received: HashSet::new(),
            num_pieces,
        })
    }

    fn piece_len(&self, piece: u32) -> usize {
        let start = piece as usize * METADATA_PIECE_SIZE as usize;
        (self.size - start).min(METADATA_PIECE_SIZE as usize)
    }

    /// Calls `send` for each new request until `budget` are outstanding.
    pub fn request_blocks(&mut self, budget: usize, mut send: impl FnMut(u32)) {
        while self.requested.len() < budget {
            let Some(piece) = self.unrequested.pop_front() else {
                break;
            };
            send(piece);
            self.requested.insert(piece);
        }
    }

    pub fn got_block(&mut self, piece: u32, data: &[u8]) -> Result<(), InfoDownloadError> {
        if !self.requested.remove(&piece) {
            return Err(InfoDownloadError::NotRequested(piece));
        }
        let expected = self.piece_len(piece);
        if data.len() != expected {
            return Err(InfoDownloadError::InvalidLength {
                piece,
                length: data.len(),
                expected,
            });
        }
        let start = piece as usize * METADATA_PIECE_SIZE as usize;
        self.buffer[start..start + expected].copy_from_slice(data);
        self.received.insert(piece);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.received.len() == self.num_pieces as usize
    }

    /// Returns the assembled bytes when their SHA-1 is the info-hash.
    pub fn into_verified(self, info_hash: &InfoHash) -> Option<Vec<u8>> {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        (digest == *info_hash).then_some(self.buffer)
    }
}
