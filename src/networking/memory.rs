// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::networking::discovery::Discovery;
use crate::networking::transport::{
    BoxStream, IncomingStream, PeerAddrInfo, PeerId, Transport,
};
use crate::torrent_file::InfoHash;

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<PeerId, HashMap<String, mpsc::Sender<IncomingStream>>>,
    providers: HashMap<InfoHash, Vec<PeerAddrInfo>>,
    next_port: u16,
}

/// In-process network. Streams are `tokio::io::duplex` pipes and discovery is a shared
/// provider table. Every node gets a unique loopback address.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn node(&self, id: PeerId) -> MemoryNode {
        let mut state = self.lock();
        state.next_port = state.next_port.wrapping_add(1);
        let addr = SocketAddr::from(([127, 0, 0, 1], 10000 + state.next_port));
        state.handlers.entry(id).or_default();
        MemoryNode {
            network: self.clone(),
            local: PeerAddrInfo::new(id, vec![addr]),
        }
    }
}

#[derive(Clone)]
pub struct MemoryNode {
    network: MemoryNetwork,
    local: PeerAddrInfo,
}

#[async_trait]
impl Transport for MemoryNode {
    fn local_peer(&self) -> PeerAddrInfo {
        self.local.clone()
    }

    async fn open_stream(
        &self,
        peer: &PeerAddrInfo,
        protocol_tag: &str,
    ) -> Result<BoxStream, TransportError> {
        let handler = {
            let state = self.network.lock();
            let node = state.handlers.get(&peer.id).ok_or(TransportError::NoAddress)?;
            node.get(protocol_tag)
                .cloned()
                .ok_or_else(|| TransportError::ProtocolNotSupported(protocol_tag.to_string()))?
        };
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        handler
            .send(IncomingStream {
                peer: self.local.clone(),
                stream: Box::new(theirs),
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(ours))
    }

    fn set_stream_handler(&self, protocol_tag: &str, handler: mpsc::Sender<IncomingStream>) {
        self.network
            .lock()
            .handlers
            .entry(self.local.id)
            .or_default()
            .insert(protocol_tag.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol_tag: &str) {
        if let Some(node) = self.network.lock().handlers.get_mut(&self.local.id) {
            node.remove(protocol_tag);
        }
    }
}

#[async_trait]
impl Discovery for MemoryNode {
    async fn advertise(&self, info_hash: &InfoHash) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let providers = state.providers.entry(*info_hash).or_default();
        if !providers.iter().any(|p| p.id == self.local.id) {
            providers.push(self.local.clone());
        }
        Ok(())
    }

    async fn find_providers(
        &self,
        info_hash: &InfoHash,
        limit: usize,
    ) -> Result<Vec<PeerAddrInfo>, TransportError> {
        let state = self.network.lock();
        Ok(state
            .providers
            .get(info_hash)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| p.id != self.local.id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_stream_round_trip() {
        let network = MemoryNetwork::new();
        let a = network.node(PeerId([1; 20]));
        let b = network.node(PeerId([2; 20]));
        assert_ne!(a.local_peer().addrs, b.local_peer().addrs);

        let (tx, mut rx) = mpsc::channel(4);
        b.set_stream_handler("/x", tx);

        let mut out = a.open_stream(&b.local_peer(), "/x").await.unwrap();
        out.write_all(b"hello").await.unwrap();
        let mut incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.peer.id, PeerId([1; 20]));
        let mut buf = [0u8; 5];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(matches!(
            a.open_stream(&b.local_peer(), "/y").await,
            Err(TransportError::ProtocolNotSupported(_))
        ));
        b.remove_stream_handler("/x");
        assert!(a.open_stream(&b.local_peer(), "/x").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_discovery_excludes_self() {
        let network = MemoryNetwork::new();
        let a = network.node(PeerId([1; 20]));
        let b = network.node(PeerId([2; 20]));
        let hash = [5u8; 20];

        a.advertise(&hash).await.unwrap();
        a.advertise(&hash).await.unwrap();
        b.advertise(&hash).await.unwrap();

        let from_a = a.find_providers(&hash, 10).await.unwrap();
        assert_eq!(from_a, vec![b.local_peer()]);
        let from_b = b.find_providers(&hash, 10).await.unwrap();
        assert_eq!(from_b, vec![a.local_peer()]);
        assert!(b.find_providers(&[0; 20], 10).await.unwrap().is_empty());
    }
}
