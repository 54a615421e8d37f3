// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeMap, HashSet, VecDeque};

use thiserror::Error;

use crate::networking::connection::BlockRequester;
use crate::networking::protocol::BlockInfo;
use crate::networking::transport::PeerId;
use crate::resource_manager::PermitGuard;
use crate::torrent_manager::piece::Piece;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block {offset}+{length} does not belong to piece {piece}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },
    #[error("block at offset {0} was not requested")]
    NotRequested(u32),
}

/// Downloads one piece from one peer, block by block.
pub struct PieceDownloader {
    pub piece: u32,
    pub peer: PeerId,
    /// Started while the peer was choking us.
    pub allowed_fast: bool,
    buffer: Vec<u8>,
    unrequested: VecDeque<BlockInfo>,
    requested: BTreeMap<u32, BlockInfo>,
    received: HashSet<u32>,
    num_blocks: usize,
    permit: Option<PermitGuard>,
}

impl PieceDownloader {
    pub fn new(piece: &Piece, peer: PeerId, allowed_fast: bool, permit: Option<PermitGuard>) -> Self {
        let blocks = piece.blocks();
        Self {
            piece: piece.index,
            peer,
            allowed_fast,
            buffer: vec![0; piece.length as usize],
            num_blocks: blocks.len(),
            unrequested: blocks.into(),
            requested: BTreeMap::new(),
            received: HashSet::new(),
            permit,
        }
    }

    /// Sends requests until `budget` are outstanding.
    pub fn request_blocks(&mut self, requester: &dyn BlockRequester, budget: usize) {
        while self.requested.len() < budget {
            let Some(block) = self.unrequested.pop_front() else {
                break;
            };
            requester.request_block(block);
            self.requested.insert(block.offset, block);
        }
    }

    pub fn got_block(&mut self, offset: u32, data: &[u8]) -> Result<(), BlockError> {
        let Some(block) = self.requested.get(&offset).copied() else {
            let valid = offset as usize + data.len() <= self.buffer.len();
            return Err(if valid && !data.is_empty() {
                BlockError::NotRequested(offset)
            } else {
                BlockError::InvalidBlock {
                    piece: self.piece,
                    offset,
                    length: data.len() as u32,
                }
            });
        };
        if block.length as usize != data.len() {
            return Err(BlockError::InvalidBlock {
                piece: self.piece,
                offset,
                length: data.len() as u32,
            });
        }
        self.requested.remove(&offset);
        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.received.insert(offset);
        Ok(())
    }

    /// The peer refused a request; it goes back to the front of the queue.
    pub fn rejected(&mut self, block: BlockInfo) -> bool {
        match self.requested.remove(&block.offset) {
            Some(b) if b == block => {
                self.unrequested.push_front(b);
                true
            }
            Some(b) => {
                self.requested.insert(b.offset, b);
                false
            }
            None => false,
        }
    }

    /// A choking peer drops our queued requests.
    pub fn choked(&mut self) {
        let requested = std::mem::take(&mut self.requested);
        for block in requested.into_values().rev() {
            self.unrequested.push_front(block);
        }
    }

    pub fn cancel_pending(&mut self, requester: &dyn BlockRequester) {
        for block in std::mem::take(&mut self.requested).into_values() {
            requester.cancel_block(block);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.requested.len()
    }

    pub fn done(&self) -> bool {
        self.received.len() == self.num_blocks
    }

    /// Hands the assembled piece and its memory reservation to the write path.
    pub fn into_buffer(self) -> (Vec<u8>, Option<PermitGuard>) {
        (self.buffer, self.permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        requests: RefCell<Vec<BlockInfo>>,
        cancels: RefCell<Vec<BlockInfo>>,
    }

    impl BlockRequester for Recorder {
        fn request_block(&self, block: BlockInfo) {
            self.requests.borrow_mut().push(block);
        }
        fn cancel_block(&self, block: BlockInfo) {
            self.cancels.borrow_mut().push(block);
        }
    }

    fn piece(length: u32) -> Piece {
        Piece {
            index: 2,
            length,
            offset: 0,
            hash: [0; 20],
            done: false,
            writing: false,
        }
    }

    #[test]
    fn test_downloads_piece_within_budget() {
        let p = piece(16384 * 3 + 10);
        let mut pd = PieceDownloader::new(&p, PeerId([1; 20]), false, None);
        let rec = Recorder::default();

        pd.request_blocks(&rec, 2);
        assert_eq!(rec.requests.borrow().len(), 2);
        assert_eq!(pd.outstanding(), 2);

        pd.got_block(0, &[1; 16384]).unwrap();
        pd.request_blocks(&rec, 2);
        assert_eq!(rec.requests.borrow().len(), 3);

        pd.got_block(16384, &[2; 16384]).unwrap();
        pd.got_block(32768, &[3; 16384]).unwrap();
        pd.request_blocks(&rec, 2);
        assert_eq!(rec.requests.borrow().last().unwrap().length, 10);
        assert!(!pd.done());
        pd.got_block(49152, &[4; 10]).unwrap();
        assert!(pd.done());

        let (buf, permit) = pd.into_buffer();
        assert!(permit.is_none());
        assert_eq!(buf.len(), p.length as usize);
        assert_eq!(buf[16384], 2);
        assert_eq!(buf[49152 + 9], 4);
    }

    #[test]
    fn test_unrequested_and_malformed_blocks() {
        let mut pd = PieceDownloader::new(&piece(32768), PeerId([1; 20]), false, None);
        let rec = Recorder::default();
        pd.request_blocks(&rec, 1);

        assert_eq!(pd.got_block(16384, &[0; 16384]), Err(BlockError::NotRequested(16384)));
        assert!(matches!(
            pd.got_block(0, &[0; 100]),
            Err(BlockError::InvalidBlock { .. })
        ));
        assert!(matches!(
            pd.got_block(40000, &[0; 100]),
            Err(BlockError::InvalidBlock { .. })
        ));
        pd.got_block(0, &[0; 16384]).unwrap();
        assert_eq!(pd.got_block(0, &[0; 16384]), Err(BlockError::NotRequested(0)));
    }

    #[test]
    fn test_reject_and_choke_requeue_blocks() {
        let mut pd = PieceDownloader::new(&piece(16384 * 4), PeerId([1; 20]), true, None);
        let rec = Recorder::default();
        pd.request_blocks(&rec, 3);

        let second = rec.requests.borrow()[1];
        assert!(pd.rejected(second));
        assert!(!pd.rejected(second));
        assert_eq!(pd.outstanding(), 2);
        pd.request_blocks(&rec, 3);
        assert_eq!(rec.requests.borrow()[3], second);

        pd.choked();
        assert_eq!(pd.outstanding(), 0);
        pd.request_blocks(&rec, 1);
        assert_eq!(rec.requests.borrow().last().unwrap().offset, 0);
    }

    #[test]
    fn test_cancel_pending_cancels_outstanding() {
        let mut pd = PieceDownloader::new(&piece(16384 * 4), PeerId([1; 20]), false, None);
        let rec = Recorder::default();
        pd.request_blocks(&rec, 3);
        pd.got_block(0, &[0; 16384]).unwrap();
        pd.cancel_pending(&rec);
        assert_eq!(rec.cancels.borrow().len(), 2);
        assert_eq!(pd.outstanding(), 0);
    }
}
