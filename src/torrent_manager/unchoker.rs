// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;

use rand::prelude::IndexedRandom;

use crate::networking::transport::PeerId;

/// What the unchoker needs to know about one connected peer.
#[derive(Debug, Clone, Copy)]
pub struct UnchokeCandidate {
    pub peer: PeerId,
    pub interested: bool,
    /// Rate we receive from the peer.
    pub download_rate: u64,
    /// Rate we send to the peer.
    pub upload_rate: u64,
}

/// Peers that should be unchoked after a tick. Everyone else gets choked.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnchokeSet {
    pub regular: HashSet<PeerId>,
    pub optimistic: HashSet<PeerId>,
}

impl UnchokeSet {
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.regular.contains(peer) || self.optimistic.contains(peer)
    }
}

/// Tit-for-tat slot allocation: the fastest interested peers get the regular slots,
/// and a few random others rotate through the optimistic slots.
#[derive(Debug)]
pub struct Unchoker {
    slots: usize,
    optimistic_slots: usize,
    rotation_ticks: u32,
    ticks: u32,
    current: UnchokeSet,
}

impl Unchoker {
    pub fn new(slots: usize, optimistic_slots: usize, rotation_ticks: u32) -> Self {
        Self {
            slots,
            optimistic_slots,
            rotation_ticks: rotation_ticks.max(1),
            ticks: 0,
            current: UnchokeSet::default(),
        }
    }

    pub fn tick(&mut self, candidates: &[UnchokeCandidate], seeding: bool) -> &UnchokeSet {
        let rotate = self.ticks % self.rotation_ticks == 0;
        self.ticks = self.ticks.wrapping_add(1);

        let mut interested: Vec<&UnchokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();
        if seeding {
            interested.sort_by(|a, b| b.upload_rate.cmp(&a.upload_rate).then(a.peer.cmp(&b.peer)));
        } else {
            interested.sort_by(|a, b| b.download_rate.cmp(&a.download_rate).then(a.peer.cmp(&b.peer)));
        }

        let regular: HashSet<PeerId> = interested.iter().take(self.slots).map(|c| c.peer).collect();
        let rest: Vec<PeerId> = interested
            .iter()
            .map(|c| c.peer)
            .filter(|p| !regular.contains(p))
            .collect();

        let mut optimistic: HashSet<PeerId> = if rotate {
            HashSet::new()
        } else {
            self.current
                .optimistic
                .iter()
                .filter(|p| rest.contains(p))
                .copied()
                .collect()
        };
        let open: Vec<PeerId> = rest.into_iter().filter(|p| !optimistic.contains(p)).collect();
        let wanted = self.optimistic_slots.saturating_sub(optimistic.len());
        optimistic.extend(open.choose_multiple(&mut rand::rng(), wanted).copied());

        self.current = UnchokeSet {
            regular,
            optimistic,
        };
        &self.current
    }

    /// A newly interested peer may be unchoked right away while regular slots are free.
    pub fn can_fast_unchoke(&self) -> bool {
        self.current.regular.len() < self.slots
    }

    pub fn fast_unchoke(&mut self, peer: PeerId) {
        if self.can_fast_unchoke() {
            self.current.regular.insert(peer);
        }
    }

    pub fn is_optimistic(&self, peer: &PeerId) -> bool {
        self.current.optimistic.contains(peer)
    }

    /// Frees the peer's slot. It is refilled on the next tick.
    pub fn handle_disconnect(&mut self, peer: &PeerId) {
        self.current.regular.remove(peer);
        self.current.optimistic.remove(peer);
    }
}
