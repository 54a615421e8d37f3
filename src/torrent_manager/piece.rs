// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::networking::protocol::{calculate_blocks_for_piece, BlockInfo, BLOCK_SIZE};
use crate::torrent_file::{Info, HASH_LEN};

/// One hash-verified slice of the torrent's concatenated file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    /// Offset of the first byte in the concatenated content.
    pub offset: u64,
    pub hash: [u8; HASH_LEN],
    pub done: bool,
    /// A buffer for this piece is being hashed and written.
    pub writing: bool,
}

impl Piece {
    pub fn blocks(&self) -> Vec<BlockInfo> {
        calculate_blocks_for_piece(self.index, self.length)
    }

    pub fn num_blocks(&self) -> u32 {
        self.length.div_ceil(BLOCK_SIZE)
    }

    /// True when the request lies entirely inside this piece.
    pub fn contains(&self, offset: u32, length: u32) -> bool {
        length > 0
            && offset
                .checked_add(length)
                .is_some_and(|end| end <= self.length)
    }
}

/// Splits the torrent into pieces. Every piece but the last is `piece_length` long.
pub fn pieces_from_info(info: &Info) -> Vec<Piece> {
    let piece_length = info.piece_length as u64;
    let total = info.total_length() as u64;
    let count = info.num_pieces();
    (0..count)
        .map(|index| {
            let offset = index as u64 * piece_length;
            let length = piece_length.min(total - offset) as u32;
            Piece {
                index,
                length,
                offset,
                hash: info.piece_hash(index).unwrap_or([0; HASH_LEN]),
                done: false,
                writing: false,
            }
        })
        .collect()
}
