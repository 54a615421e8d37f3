// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{event, Level};

use crate::errors::TransportError;
use crate::torrent_file::InfoHash;

const PROTOCOL_PREFIX: &str = "/swarmseedr/transfer/1.0.0/";
const MAX_TAG_LEN: usize = 256;
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream tag under which a torrent's peer-wire sessions are routed.
pub fn protocol_tag(info_hash: &InfoHash) -> String {
    format!("{}{}", PROTOCOL_PREFIX, hex::encode(info_hash))
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// `client_prefix` followed by random alphanumerics, 20 bytes in total.
    pub fn generate(client_prefix: &str) -> Self {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let mut id = [0u8; 20];
        let prefix = client_prefix.as_bytes();
        let n = prefix.len().min(20);
        id[..n].copy_from_slice(&prefix[..n]);
        for byte in id.iter_mut().skip(n) {
            *byte = CHARSET[rng.random_range(0..CHARSET.len())];
        }
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransportError::NoAddress)?;
        let id: [u8; 20] = bytes.try_into().map_err(|_| TransportError::NoAddress)?;
        Ok(PeerId(id))
    }
}

/// A remote identity and the socket addresses it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddrInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

impl fmt::Display for PeerAddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Parses `<hex peer id>@<socket addr>`.
impl FromStr for PeerAddrInfo {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s.split_once('@').ok_or(TransportError::NoAddress)?;
        let addr: SocketAddr = addr.trim().parse().map_err(|_| TransportError::NoAddress)?;
        Ok(Self {
            id: id.trim().parse()?,
            addrs: vec![addr],
        })
    }
}

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> RawStream for T {}

pub type BoxStream = Box<dyn RawStream>;

pub struct IncomingStream {
    pub peer: PeerAddrInfo,
    pub stream: BoxStream,
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Connection-level identity shared by every torrent of a session. Streams are
/// multiplexed by protocol tag.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerAddrInfo;

    async fn open_stream(
        &self,
        peer: &PeerAddrInfo,
        protocol_tag: &str,
    ) -> Result<BoxStream, TransportError>;

    /// Inbound streams carrying `protocol_tag` are delivered to `handler`.
    fn set_stream_handler(&self, protocol_tag: &str, handler: mpsc::Sender<IncomingStream>);

    fn remove_stream_handler(&self, protocol_tag: &str);
}

type HandlerMap = Arc<RwLock<HashMap<String, mpsc::Sender<IncomingStream>>>>;

fn lookup_handler(handlers: &HandlerMap, tag: &str) -> Option<mpsc::Sender<IncomingStream>> {
    handlers
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(tag)
        .cloned()
}

/// TCP transport. A dialer sends `peer id (20) | listen port (u16) | tag len (u16) | tag`;
/// the listener answers `peer id (20) | accepted (u8)`.
pub struct TcpTransport {
    local: PeerAddrInfo,
    handlers: HandlerMap,
    dial_timeout: Duration,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    pub async fn bind(
        id: PeerId,
        listen_addr: SocketAddr,
        dial_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        event!(Level::INFO, addr = %bound, peer = %id, "Transport listening");

        let accept_task = tokio::spawn(accept_loop(listener, id, handlers.clone()));
        Ok(Self {
            local: PeerAddrInfo::new(id, vec![bound]),
            handlers,
            dial_timeout,
            accept_task,
        })
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        expected: PeerId,
        protocol_tag: &str,
    ) -> Result<BoxStream, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        let tag = protocol_tag.as_bytes();
        let mut preamble = Vec::with_capacity(24 + tag.len());
        preamble.extend_from_slice(self.local.id.as_bytes());
        let listen_port = self.local.addrs.first().map(|a| a.port()).unwrap_or(0);
        preamble.extend(listen_port.to_be_bytes());
        preamble.extend((tag.len() as u16).to_be_bytes());
        preamble.extend_from_slice(tag);
        stream.write_all(&preamble).await?;

        let mut reply = [0u8; 21];
        stream.read_exact(&mut reply).await?;
        if reply[..20] != expected.0 {
            return Err(TransportError::PeerIdMismatch);
        }
        if reply[20] != 1 {
            return Err(TransportError::ProtocolNotSupported(protocol_tag.to_string()));
        }
        Ok(Box::new(stream))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerAddrInfo {
        self.local.clone()
    }

    async fn open_stream(
        &self,
        peer: &PeerAddrInfo,
        protocol_tag: &str,
    ) -> Result<BoxStream, TransportError> {
        if peer.addrs.is_empty() {
            return Err(TransportError::NoAddress);
        }
        let mut last_err = TransportError::NoAddress;
        for addr in &peer.addrs {
            match timeout(self.dial_timeout, self.dial(*addr, peer.id, protocol_tag)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = TransportError::Timeout,
            }
        }
        Err(last_err)
    }

    fn set_stream_handler(&self, protocol_tag: &str, handler: mpsc::Sender<IncomingStream>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(protocol_tag.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol_tag: &str) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(protocol_tag);
    }
}

async fn accept_loop(listener: TcpListener, local_id: PeerId, handlers: HandlerMap) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                event!(Level::WARN, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let handlers = handlers.clone();
        tokio::spawn(async move {
            match timeout(
                PREAMBLE_TIMEOUT,
                answer_preamble(stream, remote, local_id, &handlers),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => event!(Level::DEBUG, %remote, error = %e, "Inbound stream refused"),
                Err(_) => event!(Level::DEBUG, %remote, "Inbound preamble timed out"),
            }
        });
    }
}

async fn answer_preamble(
    mut stream: TcpStream,
    remote: SocketAddr,
    local_id: PeerId,
    handlers: &HandlerMap,
) -> Result<(), TransportError> {
    let mut head = [0u8; 24];
    stream.read_exact(&mut head).await?;
    let mut id = [0u8; 20];
    id.copy_from_slice(&head[..20]);
    let listen_port = u16::from_be_bytes([head[20], head[21]]);
    let tag_len = u16::from_be_bytes([head[22], head[23]]) as usize;
    if tag_len > MAX_TAG_LEN {
        return Err(TransportError::ProtocolNotSupported(format!(
            "{} byte tag",
            tag_len
        )));
    }
    let mut tag = vec![0u8; tag_len];
    stream.read_exact(&mut tag).await?;
    let tag = String::from_utf8_lossy(&tag).into_owned();

    let mut reply = [0u8; 21];
    reply[..20].copy_from_slice(local_id.as_bytes());
    let Some(handler) = lookup_handler(handlers, &tag) else {
        event!(Level::INFO, %remote, protocol = %tag, "Refusing stream for unknown protocol");
        stream.write_all(&reply).await?;
        return Err(TransportError::ProtocolNotSupported(tag));
    };
    reply[20] = 1;
    stream.write_all(&reply).await?;
    let _ = stream.set_nodelay(true);

    let port = if listen_port == 0 { remote.port() } else { listen_port };
    let peer = PeerAddrInfo::new(PeerId(id), vec![SocketAddr::new(remote.ip(), port)]);
    handler
        .send(IncomingStream {
            peer,
            stream: Box::new(stream),
        })
        .await
        .map_err(|_| TransportError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generate_keeps_prefix() {
        let id = PeerId::generate("-SS0300-");
        assert_eq!(&id.0[..8], b"-SS0300-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(id, PeerId::generate("-SS0300-"));
    }

    #[test]
    fn test_peer_addr_info_from_str() {
        let id = PeerId([7u8; 20]);
        let text = format!("{}@127.0.0.1:6681", id);
        let parsed: PeerAddrInfo = text.parse().unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.addrs, vec!["127.0.0.1:6681".parse().unwrap()]);
        assert_eq!(parsed.to_string(), text);

        assert!("nonsense".parse::<PeerAddrInfo>().is_err());
        assert!(format!("{}@nowhere", id).parse::<PeerAddrInfo>().is_err());
    }

    #[test]
    fn test_protocol_tag_format() {
        let tag = protocol_tag(&[0xAB; 20]);
        assert!(tag.starts_with("/swarmseedr/transfer/1.0.0/"));
        assert!(tag.ends_with(&"ab".repeat(20)));
    }

    #[tokio::test]
    async fn test_tcp_transport_routes_by_tag() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = TcpTransport::bind(PeerId([1; 20]), loopback, Duration::from_secs(5))
            .await
            .unwrap();
        let b = TcpTransport::bind(PeerId([2; 20]), loopback, Duration::from_secs(5))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        b.set_stream_handler("/test/1", tx);

        let mut out = a.open_stream(&b.local_peer(), "/test/1").await.unwrap();
        out.write_all(b"ping").await.unwrap();

        let mut incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.peer.id, PeerId([1; 20]));
        assert_eq!(incoming.peer.addrs[0].port(), a.local_peer().addrs[0].port());
        let mut buf = [0u8; 4];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(matches!(
            a.open_stream(&b.local_peer(), "/other").await,
            Err(TransportError::ProtocolNotSupported(_))
        ));

        let wrong = PeerAddrInfo::new(PeerId([9; 20]), b.local_peer().addrs);
        assert!(matches!(
            a.open_stream(&wrong, "/test/1").await,
            Err(TransportError::PeerIdMismatch)
        ));

        b.remove_stream_handler("/test/1");
        assert!(a.open_stream(&b.local_peer(), "/test/1").await.is_err());
    }
}
