// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;

use crate::bitfield::Bitfield;
use crate::networking::transport::PeerId;
use crate::torrent_manager::piece::Piece;

#[derive(Debug, Default, Clone)]
struct PickerPiece {
    /// Connected peers known to have the piece.
    having: HashSet<PeerId>,
    allowed_fast: HashSet<PeerId>,
    requested: HashSet<PeerId>,
    /// Subset of `requested` whose download stalled.
    snubbed: HashSet<PeerId>,
}

impl PickerPiece {
    fn running(&self) -> usize {
        self.requested.len() - self.snubbed.len()
    }
}

/// Rarest-first piece selection. Ties go to the lowest index. Once few enough pieces
/// are missing, the same piece may be assigned to several peers.
#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PickerPiece>,
    available: u32,
    endgame_max_duplicate: usize,
    endgame_threshold: u32,
}

impl PiecePicker {
    pub fn new(num_pieces: u32, endgame_max_duplicate: usize, endgame_threshold: u32) -> Self {
        Self {
            pieces: vec![PickerPiece::default(); num_pieces as usize],
            available: 0,
            endgame_max_duplicate: endgame_max_duplicate.max(1),
            endgame_threshold,
        }
    }

    /// Distinct pieces at least one connected peer has.
    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn availability(&self, index: u32) -> usize {
        self.pieces
            .get(index as usize)
            .map_or(0, |p| p.having.len())
    }

    pub fn handle_have(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if piece.having.insert(peer) && piece.having.len() == 1 {
                self.available += 1;
            }
        }
    }

    pub fn handle_bitfield(&mut self, peer: PeerId, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            self.handle_have(peer, index);
        }
    }

    pub fn handle_have_all(&mut self, peer: PeerId) {
        for index in 0..self.pieces.len() as u32 {
            self.handle_have(peer, index);
        }
    }

    pub fn handle_allowed_fast(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.allowed_fast.insert(peer);
        }
    }

    /// Chooses the next piece for `peer` and records the assignment. The flag tells
    /// whether the peer lets us download the piece while choked.
    pub fn pick_for(&mut self, peer: PeerId, pieces: &[Piece], choked: bool) -> Option<(u32, bool)> {
        let missing = pieces.iter().filter(|p| !p.done).count() as u32;
        let limit = if missing <= self.endgame_threshold {
            self.endgame_max_duplicate
        } else {
            1
        };

        let (index, _) = self
            .pieces
            .iter()
            .zip(pieces)
            .filter(|(pp, p)| !p.done && !p.writing && pp.having.contains(&peer))
            .filter(|(pp, _)| !choked || pp.allowed_fast.contains(&peer))
            .filter(|(pp, _)| !pp.requested.contains(&peer) && pp.running() < limit)
            .map(|(pp, p)| (p.index, pp.having.len()))
            .min_by_key(|&(index, availability)| (availability, index))?;

        let piece = &mut self.pieces[index as usize];
        piece.requested.insert(peer);
        Some((index, piece.allowed_fast.contains(&peer)))
    }

    pub fn handle_cancel_download(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.requested.remove(&peer);
            piece.snubbed.remove(&peer);
        }
    }

    /// Frees the slot so another peer can pick the piece; the stalled download keeps
    /// its assignment.
    pub fn handle_snubbed(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if piece.requested.contains(&peer) {
                piece.snubbed.insert(peer);
            }
        }
    }

    pub fn handle_unsnubbed(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.snubbed.remove(&peer);
        }
    }

    pub fn handle_disconnect(&mut self, peer: PeerId) {
        for piece in &mut self.pieces {
            let had = piece.having.remove(&peer);
            if had && piece.having.is_empty() {
                self.available -= 1;
            }
            piece.allowed_fast.remove(&peer);
            piece.requested.remove(&peer);
            piece.snubbed.remove(&peer);
        }
    }

    /// Peers currently assigned to the piece, snubbed ones included.
    pub fn requested_peers(&self, index: u32) -> Vec<PeerId> {
        self.pieces
            .get(index as usize)
            .map(|p| p.requested.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_manager::piece::Piece;

    fn pieces(n: u32) -> Vec<Piece> {
        (0..n)
            .map(|index| Piece {
                index,
                length: 16384,
                offset: index as u64 * 16384,
                hash: [0; 20],
                done: false,
                writing: false,
            })
            .collect()
    }

    fn peer(n: u8) -> PeerId {
        PeerId([n; 20])
    }

    #[test]
    fn test_rarest_first_with_lowest_index_tie_break() {
        let ps = pieces(20);
        let mut picker = PiecePicker::new(20, 3, 0);
        picker.handle_have_all(peer(1));
        picker.handle_have_all(peer(2));
        picker.handle_have(peer(3), 7);
        picker.handle_have(peer(3), 4);
        // 4 and 7 are held by three peers, everything else by two.
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((0, false)));
        assert_eq!(picker.pick_for(peer(2), &ps, false), Some((1, false)));
        assert_eq!(picker.available(), 20);

        let mut picker = PiecePicker::new(20, 3, 0);
        picker.handle_have_all(peer(1));
        picker.handle_have(peer(2), 0);
        picker.handle_have(peer(2), 1);
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((2, false)));
    }

    #[test]
    fn test_pick_is_deterministic() {
        let ps = pieces(10);
        let build = || {
            let mut picker = PiecePicker::new(10, 3, 0);
            picker.handle_have_all(peer(1));
            picker.handle_have(peer(2), 5);
            picker.handle_have(peer(2), 6);
            picker
        };
        let a = build().pick_for(peer(1), &ps, false);
        let b = build().pick_for(peer(1), &ps, false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_skips_done_and_writing_pieces() {
        let mut ps = pieces(3);
        ps[0].done = true;
        ps[1].writing = true;
        let mut picker = PiecePicker::new(3, 3, 0);
        picker.handle_have_all(peer(1));
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((2, false)));
        assert_eq!(picker.pick_for(peer(1), &ps, false), None);
    }

    #[test]
    fn test_no_duplicates_outside_endgame() {
        let ps = pieces(50);
        let mut picker = PiecePicker::new(50, 3, 10);
        picker.handle_have(peer(1), 0);
        picker.handle_have(peer(2), 0);
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((0, false)));
        assert_eq!(picker.pick_for(peer(2), &ps, false), None);
    }

    #[test]
    fn test_endgame_allows_limited_duplicates() {
        let ps = pieces(4);
        let mut picker = PiecePicker::new(4, 2, 10);
        for n in 1..=3 {
            picker.handle_have(peer(n), 0);
        }
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((0, false)));
        assert_eq!(picker.pick_for(peer(2), &ps, false), Some((0, false)));
        assert_eq!(picker.pick_for(peer(3), &ps, false), None);
        assert_eq!(picker.requested_peers(0).len(), 2);

        picker.handle_cancel_download(peer(1), 0);
        assert_eq!(picker.pick_for(peer(3), &ps, false), Some((0, false)));
    }

    #[test]
    fn test_snubbed_assignment_frees_slot() {
        let ps = pieces(50);
        let mut picker = PiecePicker::new(50, 3, 0);
        picker.handle_have(peer(1), 9);
        picker.handle_have(peer(2), 9);
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((9, false)));
        assert_eq!(picker.pick_for(peer(2), &ps, false), None);
        picker.handle_snubbed(peer(1), 9);
        assert_eq!(picker.pick_for(peer(2), &ps, false), Some((9, false)));
        assert_eq!(picker.requested_peers(9).len(), 2);
    }

    #[test]
    fn test_choked_peer_only_gets_allowed_fast() {
        let ps = pieces(5);
        let mut picker = PiecePicker::new(5, 3, 0);
        picker.handle_have_all(peer(1));
        assert_eq!(picker.pick_for(peer(1), &ps, true), None);
        picker.handle_allowed_fast(peer(1), 3);
        assert_eq!(picker.pick_for(peer(1), &ps, true), Some((3, true)));
    }

    #[test]
    fn test_disconnect_releases_everything() {
        let ps = pieces(4);
        let mut picker = PiecePicker::new(4, 3, 0);
        let mut bf = Bitfield::new(4);
        bf.set(1);
        bf.set(2);
        picker.handle_bitfield(peer(1), &bf);
        picker.handle_have(peer(2), 2);
        assert_eq!(picker.available(), 2);
        assert_eq!(picker.pick_for(peer(1), &ps, false), Some((1, false)));

        picker.handle_disconnect(peer(1));
        assert_eq!(picker.available(), 1);
        assert_eq!(picker.availability(2), 1);
        assert!(picker.requested_peers(1).is_empty());
        assert_eq!(picker.pick_for(peer(2), &ps, false), Some((2, false)));
    }
}
