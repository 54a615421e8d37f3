// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::networking::transport::PeerAddrInfo;
use crate::torrent_file::InfoHash;

/// Content routing. Both calls are best effort.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn advertise(&self, info_hash: &InfoHash) -> Result<(), TransportError>;

    async fn find_providers(
        &self,
        info_hash: &InfoHash,
        limit: usize,
    ) -> Result<Vec<PeerAddrInfo>, TransportError>;
}

/// Hands out the same provider list for every torrent.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    providers: Vec<PeerAddrInfo>,
}

impl StaticDiscovery {
    pub fn new(providers: Vec<PeerAddrInfo>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn advertise(&self, _info_hash: &InfoHash) -> Result<(), TransportError> {
        Ok(())
    }

    async fn find_providers(
        &self,
        _info_hash: &InfoHash,
        limit: usize,
    ) -> Result<Vec<PeerAddrInfo>, TransportError> {
        Ok(self.providers.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::transport::PeerId;

    #[tokio::test]
    async fn test_static_discovery_respects_limit() {
        let providers: Vec<_> = (0..5u8)
            .map(|i| PeerAddrInfo::new(PeerId([i; 20]), vec![([10, 0, 0, i], 6681).into()]))
            .collect();
        let discovery = StaticDiscovery::new(providers.clone());
        discovery.advertise(&[0; 20]).await.unwrap();
        let found = discovery.find_providers(&[0; 20], 3).await.unwrap();
        assert_eq!(found, providers[..3].to_vec());
    }
}
