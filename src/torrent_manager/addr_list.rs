// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use strum_macros::Display;

use crate::errors::TorrentError;
use crate::networking::externalip::{best_addr, peer_priority};
use crate::networking::transport::{PeerAddrInfo, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PeerSource {
    Dht,
    Incoming,
    Fixed,
}

#[derive(Debug)]
struct Entry {
    info: PeerAddrInfo,
    source: PeerSource,
    priority: u32,
    seq: u64,
}

/// Bounded pool of peers waiting to be dialed, popped by BEP 40 priority and evicted
/// oldest first.
#[derive(Debug)]
pub struct AddrList {
    entries: HashMap<PeerId, Entry>,
    by_priority: BTreeSet<(u32, u64, PeerId)>,
    by_time: BTreeSet<(u64, PeerId)>,
    count_by_source: HashMap<PeerSource, usize>,
    max_items: usize,
    local_id: PeerId,
    local_addr: SocketAddr,
    blocked: HashSet<IpAddr>,
    next_seq: u64,
}

impl AddrList {
    pub fn new(max_items: usize, local: &PeerAddrInfo, blocked: HashSet<IpAddr>) -> Self {
        Self {
            entries: HashMap::new(),
            by_priority: BTreeSet::new(),
            by_time: BTreeSet::new(),
            count_by_source: HashMap::new(),
            max_items,
            local_id: local.id,
            local_addr: best_addr(&local.addrs)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
            blocked,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_priority.is_empty()
    }

    pub fn len_source(&self, source: PeerSource) -> usize {
        self.count_by_source.get(&source).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.by_priority.clear();
        self.by_time.clear();
        self.count_by_source.clear();
    }

    /// Adds candidates, replacing entries for peers already present. Returns how many
    /// were accepted before eviction.
    pub fn push(&mut self, addrs: Vec<PeerAddrInfo>, source: PeerSource) -> Result<usize, TorrentError> {
        let mut added = 0;
        for info in addrs {
            if info.addrs.is_empty() || info.id == self.local_id {
                continue;
            }
            if info.addrs.iter().any(|a| self.blocked.contains(&a.ip())) {
                continue;
            }
            let Some(addr) = best_addr(&info.addrs) else {
                continue;
            };
            self.remove(&info.id);

            let seq = self.next_seq;
            self.next_seq += 1;
            let priority = peer_priority(addr, self.local_addr);
            self.by_priority.insert((priority, seq, info.id));
            self.by_time.insert((seq, info.id));
            *self.count_by_source.entry(source).or_default() += 1;
            self.entries.insert(
                info.id,
                Entry {
                    info,
                    source,
                    priority,
                    seq,
                },
            );
            added += 1;
        }

        while self.by_time.len() > self.max_items {
            let Some(&(_, oldest)) = self.by_time.first() else {
                break;
            };
            self.remove(&oldest);
        }
        self.check_sync()?;
        Ok(added)
    }

    /// Removes and returns the highest-priority candidate.
    pub fn pop(&mut self) -> Option<(PeerAddrInfo, PeerSource)> {
        let &(_, _, id) = self.by_priority.last()?;
        let entry = self.remove(&id)?;
        Some((entry.info, entry.source))
    }

    fn remove(&mut self, id: &PeerId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.by_priority.remove(&(entry.priority, entry.seq, *id));
        self.by_time.remove(&(entry.seq, *id));
        if let Some(count) = self.count_by_source.get_mut(&entry.source) {
            *count = count.saturating_sub(1);
        }
        Some(entry)
    }

    fn check_sync(&self) -> Result<(), TorrentError> {
        let counted: usize = self.count_by_source.values().sum();
        if self.by_priority.len() != self.by_time.len()
            || self.by_time.len() != self.entries.len()
            || counted != self.entries.len()
        {
            return Err(TorrentError::InvariantViolation(format!(
                "address list out of sync: {} by priority, {} by time, {} entries, {} counted",
                self.by_priority.len(),
                self.by_time.len(),
                self.entries.len(),
                counted
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(n: u8, addr: &str) -> PeerAddrInfo {
        PeerAddrInfo::new(PeerId([n; 20]), vec![addr.parse().unwrap()])
    }

    fn list(max: usize) -> AddrList {
        AddrList::new(max, &info(0, "123.213.32.10:6881"), HashSet::new())
    }

    #[test]
    fn test_skips_self_empty_and_blocked() {
        let blocked = HashSet::from(["1.2.3.4".parse().unwrap()]);
        let mut l = AddrList::new(10, &info(0, "123.213.32.10:6881"), blocked);
        let added = l
            .push(
                vec![
                    info(0, "5.5.5.5:1"),
                    PeerAddrInfo::new(PeerId([1; 20]), vec![]),
                    info(2, "1.2.3.4:1"),
                    info(3, "5.5.5.5:2"),
                ],
                PeerSource::Dht,
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(l.len(), 1);
        assert_eq!(l.len_source(PeerSource::Dht), 1);
    }

    #[test]
    fn test_pop_returns_highest_priority() {
        let mut l = list(10);
        let peers = vec![info(1, "98.76.54.32:6881"), info(2, "123.213.32.234:6881")];
        let expected: Vec<u32> = peers
            .iter()
            .map(|p| peer_priority(p.addrs[0], "123.213.32.10:6881".parse().unwrap()))
            .collect();
        l.push(peers, PeerSource::Dht).unwrap();

        let (first, source) = l.pop().unwrap();
        assert_eq!(source, PeerSource::Dht);
        let best = if expected[0] > expected[1] { 1 } else { 2 };
        assert_eq!(first.id, PeerId([best; 20]));
        assert!(l.pop().is_some());
        assert!(l.pop().is_none());
        assert_eq!(l.len_source(PeerSource::Dht), 0);
    }

    #[test]
    fn test_push_replaces_same_peer() {
        let mut l = list(10);
        l.push(vec![info(1, "5.5.5.5:1")], PeerSource::Dht).unwrap();
        l.push(vec![info(1, "6.6.6.6:1")], PeerSource::Incoming).unwrap();
        assert_eq!(l.len(), 1);
        assert_eq!(l.len_source(PeerSource::Dht), 0);
        assert_eq!(l.len_source(PeerSource::Incoming), 1);
        let (popped, _) = l.pop().unwrap();
        assert_eq!(popped.addrs[0], "6.6.6.6:1".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut l = list(3);
        for n in 1..=5u8 {
            l.push(vec![info(n, &format!("5.5.5.{n}:1"))], PeerSource::Dht).unwrap();
        }
        assert_eq!(l.len(), 3);
        let mut left: Vec<u8> = std::iter::from_fn(|| l.pop()).map(|(p, _)| p.id.0[0]).collect();
        left.sort();
        assert_eq!(left, vec![3, 4, 5]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut l = list(10);
        l.push(vec![info(1, "5.5.5.5:1")], PeerSource::Fixed).unwrap();
        l.reset();
        assert!(l.is_empty());
        assert_eq!(l.len_source(PeerSource::Fixed), 0);
    }

    proptest! {
        #[test]
        fn prop_orderings_stay_in_sync(ops in proptest::collection::vec((any::<bool>(), 1u8..40, 0u8..3), 1..200)) {
            let mut l = list(16);
            for (is_push, n, src) in ops {
                if is_push {
                    let source = [PeerSource::Dht, PeerSource::Incoming, PeerSource::Fixed][src as usize];
                    l.push(vec![info(n, &format!("9.9.{n}.1:{}", 1000 + n as u16))], source).unwrap();
                } else {
                    l.pop();
                }
                prop_assert!(l.len() <= 16);
                prop_assert_eq!(l.by_priority.len(), l.by_time.len());
                let counted = l.len_source(PeerSource::Dht) + l.len_source(PeerSource::Incoming) + l.len_source(PeerSource::Fixed);
                prop_assert_eq!(counted, l.len());
            }
        }
    }
}
