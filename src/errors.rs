// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BitfieldError {
    #[error("invalid bitfield length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("range out of bounds: offset {offset}, length {length}, total size {total}")]
    OutOfBounds { offset: u64, length: u64, total: u64 },

    #[error("storage is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid piece hashes: {0}")]
    InvalidPieces(String),

    #[error("invalid length: {0}")]
    InvalidLength(String),

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("invalid info hash: {0}")]
    InvalidInfoHash(String),

    #[error("I/O error while reading content: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message of {0} bytes exceeds the frame limit")]
    Oversize(u32),

    #[error("unknown message id {0}")]
    UnknownMessage(u8),

    #[error("malformed {kind} message: {detail}")]
    Malformed { kind: &'static str, detail: String },

    #[error("bencode error in extension payload: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

/// Errors that stop a torrent. Cloneable so the last one can be reported in stats.
#[derive(Debug, Error, Clone)]
pub enum TorrentError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("I/O error: {0}")]
    Io(Arc<StorageError>),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("torrent is closed")]
    Closed,
}

impl From<StorageError> for TorrentError {
    fn from(e: StorageError) -> Self {
        TorrentError::Io(Arc::new(e))
    }
}

impl From<ProtocolError> for TorrentError {
    fn from(e: ProtocolError) -> Self {
        TorrentError::Protocol(e.to_string())
    }
}

impl From<MetainfoError> for TorrentError {
    fn from(e: MetainfoError) -> Self {
        TorrentError::Input(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out")]
    Timeout,

    #[error("remote does not serve protocol {0}")]
    ProtocolNotSupported(String),

    #[error("remote peer id does not match the dialed peer")]
    PeerIdMismatch,

    #[error("no usable address for peer")]
    NoAddress,

    #[error("transport is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("resume I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("resume record encoding error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("no resume record for {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    Input(#[from] MetainfoError),

    #[error("resume store error: {0}")]
    Resume(#[from] ResumeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no torrent with id {0}")]
    NotFound(String),

    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("session is closed")]
    Closed,
}
