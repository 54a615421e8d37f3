// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{event, Level};

use crate::errors::{ProtocolError, StorageError};
use crate::networking::protocol::{
    parse_message, write_message, BlockInfo, Message, MessageSummary, MAX_FRAME_LEN,
};
use crate::networking::transport::{BoxStream, PeerId};
use crate::token_bucket::{RateLimits, TokenBucket};

const INBOUND_BUFFER: usize = 32;
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Outgoing,
    Incoming,
}

/// Source of block data for uploads, read only when the block is about to be sent.
#[async_trait]
pub trait BlockReader: Send + Sync {
    async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>, StorageError>;
}

/// Outbound request/cancel sink used by piece downloaders.
pub trait BlockRequester {
    fn request_block(&self, block: BlockInfo);
    fn cancel_block(&self, block: BlockInfo);
}

#[derive(Debug)]
pub enum PeerEventKind {
    Message(Message),
    /// A piece block of this many bytes was written to the peer.
    BlockUploaded(u32),
    /// No message arrived within the snub timeout while the timer was armed.
    Snubbed,
    Disconnected,
}

#[derive(Debug)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_queued_pieces: usize,
    pub keep_alive_interval: Duration,
    pub inactivity_timeout: Duration,
    pub snub_timeout: Duration,
    pub piece_read_timeout: Duration,
    pub max_frame_len: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_queued_pieces: 250,
            keep_alive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120),
            snub_timeout: Duration::from_secs(60),
            piece_read_timeout: Duration::from_secs(30),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

enum Outgoing {
    Message(Message),
    Piece {
        block: BlockInfo,
        reader: Arc<dyn BlockReader>,
    },
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Outgoing>,
    queued_pieces: usize,
    closed: bool,
}

struct Shared {
    outbox: Mutex<Outbox>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, item: Outgoing) {
        {
            let mut outbox = self.lock();
            if outbox.closed {
                return;
            }
            if matches!(item, Outgoing::Piece { .. }) {
                outbox.queued_pieces += 1;
            }
            outbox.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Outgoing> {
        let mut outbox = self.lock();
        let item = outbox.queue.pop_front()?;
        if matches!(item, Outgoing::Piece { .. }) {
            outbox.queued_pieces -= 1;
        }
        Some(item)
    }
}

fn reject_for(block: &BlockInfo) -> Outgoing {
    Outgoing::Message(Message::Reject(block.piece_index, block.offset, block.length))
}

enum SnubControl {
    Start,
    Stop,
}

enum Inbound {
    Message(Message),
    Uploaded(u32),
}

/// One live peer-wire stream: a reader task, a writer task draining the outbound
/// queue, and a run task multiplexing both into [`PeerEvent`]s for the owning torrent.
pub struct PeerConnection {
    id: PeerId,
    addr: Option<SocketAddr>,
    connection_type: ConnectionType,
    shared: Arc<Shared>,
    max_queued_pieces: usize,
    control_tx: mpsc::UnboundedSender<SnubControl>,
    close_tx: Option<oneshot::Sender<()>>,
    run_handle: Option<JoinHandle<()>>,
}

impl PeerConnection {
    pub fn spawn(
        id: PeerId,
        addr: Option<SocketAddr>,
        connection_type: ConnectionType,
        stream: BoxStream,
        events_tx: mpsc::Sender<PeerEvent>,
        limits: RateLimits,
        config: ConnectionConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            outbox: Mutex::new(Outbox::default()),
            notify: Notify::new(),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let max_queued_pieces = config.max_queued_pieces.max(1);

        let run_handle = tokio::spawn(run(
            id,
            stream,
            shared.clone(),
            events_tx,
            control_rx,
            close_rx,
            limits,
            config,
        ));

        Self {
            id,
            addr,
            connection_type,
            shared,
            max_queued_pieces,
            control_tx,
            close_tx: Some(close_tx),
            run_handle: Some(run_handle),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn send(&self, message: Message) {
        self.shared.push(Outgoing::Message(message));
    }

    /// Queues an upload. Block bytes are read right before transmission. When more than
    /// `max_queued_pieces` uploads are waiting the oldest one is answered with a reject.
    pub fn send_piece(&self, block: BlockInfo, reader: Arc<dyn BlockReader>) {
        {
            let mut outbox = self.shared.lock();
            if outbox.closed {
                return;
            }
            outbox.queue.push_back(Outgoing::Piece { block, reader });
            outbox.queued_pieces += 1;
            if outbox.queued_pieces > self.max_queued_pieces {
                let oldest = outbox.queue.iter().enumerate().find_map(|(i, item)| match item {
                    Outgoing::Piece { block, .. } => Some((i, *block)),
                    Outgoing::Message(_) => None,
                });
                if let Some((pos, dropped)) = oldest {
                    event!(Level::DEBUG, peer = %self.id, piece = dropped.piece_index, "Dropping oldest queued upload");
                    outbox.queue[pos] = reject_for(&dropped);
                    outbox.queued_pieces -= 1;
                }
            }
        }
        self.shared.notify.notify_one();
    }

    /// Drops a queued upload and answers it with a reject. Returns false if the block
    /// was not queued (already sent or never requested).
    pub fn cancel_piece(&self, block: BlockInfo) -> bool {
        let mut outbox = self.shared.lock();
        let pos = outbox
            .queue
            .iter()
            .position(|item| matches!(item, Outgoing::Piece { block: b, .. } if *b == block));
        match pos {
            Some(pos) => {
                outbox.queue[pos] = reject_for(&block);
                outbox.queued_pieces -= 1;
                true
            }
            None => false,
        }
    }

    pub fn queued_pieces(&self) -> usize {
        self.shared.lock().queued_pieces
    }

    /// Arms (or re-arms) the snub timer. While armed any inbound message pushes it back.
    pub fn start_snub_timer(&self) {
        let _ = self.control_tx.send(SnubControl::Start);
    }

    pub fn stop_snub_timer(&self) {
        let _ = self.control_tx.send(SnubControl::Stop);
    }

    /// Stops both tasks, closes the stream and waits until the run task has exited.
    /// No `Disconnected` event is emitted for a connection closed this way.
    pub async fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(handle) = self.run_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.run_handle.take() {
            handle.abort();
        }
    }
}

impl BlockRequester for PeerConnection {
    fn request_block(&self, block: BlockInfo) {
        self.send(Message::Request(block.piece_index, block.offset, block.length));
    }

    /// A request still sitting in the outbound queue is removed instead of cancelled.
    fn cancel_block(&self, block: BlockInfo) {
        let request = Message::Request(block.piece_index, block.offset, block.length);
        {
            let mut outbox = self.shared.lock();
            if let Some(pos) = outbox
                .queue
                .iter()
                .position(|item| matches!(item, Outgoing::Message(m) if *m == request))
            {
                outbox.queue.remove(pos);
                return;
            }
        }
        self.send(Message::Cancel(block.piece_index, block.offset, block.length));
    }
}

/// Takes `amount` from a per-connection allowance, refilling it from the shared bucket in
/// batches of ~200ms worth of traffic.
async fn spend_allowance(bucket: &TokenBucket, stash: &mut f64, amount: f64) {
    if bucket.is_unlimited() || amount <= 0.0 {
        return;
    }
    if *stash < amount {
        let batch = (bucket.rate() * 0.2).clamp(16384.0, 5.0 * 1024.0 * 1024.0);
        let request = batch.max(amount);
        bucket.consume(request).await;
        *stash += request;
    }
    *stash -= amount;
}

async fn reader_task<R>(
    mut read_half: R,
    inbound_tx: mpsc::Sender<Inbound>,
    download: Arc<TokenBucket>,
    max_frame_len: u32,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut stash = 0.0;
    loop {
        let message = parse_message(&mut read_half, max_frame_len).await?;
        if let Message::Piece(_, _, data) = &message {
            spend_allowance(&download, &mut stash, data.len() as f64).await;
        }
        if inbound_tx.send(Inbound::Message(message)).await.is_err() {
            return Ok(());
        }
    }
}

async fn writer_task<W>(
    mut write_half: W,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<Inbound>,
    upload: Arc<TokenBucket>,
    piece_read_timeout: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut stash = 0.0;
    loop {
        let Some(item) = shared.pop() else {
            shared.notify.notified().await;
            continue;
        };
        match item {
            Outgoing::Message(message) => {
                write_message(&mut write_half, &message).await?;
            }
            Outgoing::Piece { block, reader } => {
                let data = match timeout(piece_read_timeout, reader.read_block(block)).await {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        event!(Level::WARN, piece = block.piece_index, error = %e, "Cannot read block for upload");
                        return Err(ProtocolError::Malformed {
                            kind: "upload",
                            detail: e.to_string(),
                        });
                    }
                    Err(_) => {
                        return Err(ProtocolError::Malformed {
                            kind: "upload",
                            detail: "piece read timed out".into(),
                        })
                    }
                };
                let len = data.len() as u32;
                spend_allowance(&upload, &mut stash, len as f64).await;
                write_message(
                    &mut write_half,
                    &Message::Piece(block.piece_index, block.offset, data),
                )
                .await?;
                if inbound_tx.send(Inbound::Uploaded(len)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

enum Exit {
    Closed,
    Ended(String),
}

#[allow(clippy::too_many_arguments)]
async fn run(
    id: PeerId,
    stream: BoxStream,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<PeerEvent>,
    mut control_rx: mpsc::UnboundedReceiver<SnubControl>,
    mut close_rx: oneshot::Receiver<()>,
    limits: RateLimits,
    config: ConnectionConfig,
) {
    let (read_half, write_half): (ReadHalf<BoxStream>, WriteHalf<BoxStream>) = split(stream);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    let mut reader = tokio::spawn(reader_task(
        read_half,
        inbound_tx.clone(),
        limits.download.clone(),
        config.max_frame_len,
    ));
    let mut writer = tokio::spawn(writer_task(
        write_half,
        shared.clone(),
        inbound_tx,
        limits.upload.clone(),
        config.piece_read_timeout,
    ));

    let mut keep_alive = tokio::time::interval_at(
        Instant::now() + config.keep_alive_interval,
        config.keep_alive_interval,
    );
    let inactivity = sleep(config.inactivity_timeout);
    tokio::pin!(inactivity);
    let snub = sleep(FAR_FUTURE);
    tokio::pin!(snub);
    let mut snub_armed = false;
    let mut reader_done = false;
    let mut writer_done = false;

    let exit = 'session: loop {
        tokio::select! {
            biased;

            _ = &mut close_rx => break 'session Exit::Closed,

            Some(ctl) = control_rx.recv() => match ctl {
                SnubControl::Start => {
                    snub_armed = true;
                    snub.as_mut().reset(Instant::now() + config.snub_timeout);
                }
                SnubControl::Stop => snub_armed = false,
            },

            result = &mut reader => {
                reader_done = true;
                let reason = match result {
                    Ok(Ok(())) => "reader stopped".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                // Frames decoded before the stream ended still reach the torrent.
                while let Ok(inbound) = inbound_rx.try_recv() {
                    let kind = match inbound {
                        Inbound::Message(Message::KeepAlive) => continue,
                        Inbound::Message(message) => PeerEventKind::Message(message),
                        Inbound::Uploaded(len) => PeerEventKind::BlockUploaded(len),
                    };
                    tokio::select! {
                        biased;
                        _ = &mut close_rx => break 'session Exit::Closed,
                        sent = events_tx.send(PeerEvent { peer: id, kind }) => {
                            if sent.is_err() {
                                break 'session Exit::Closed;
                            }
                        }
                    }
                }
                break 'session Exit::Ended(reason);
            }

            result = &mut writer => {
                writer_done = true;
                let reason = match result {
                    Ok(Ok(())) => "writer stopped".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                break 'session Exit::Ended(reason);
            }

            Some(inbound) = inbound_rx.recv() => {
                let kind = match inbound {
                    Inbound::Message(message) => {
                        inactivity.as_mut().reset(Instant::now() + config.inactivity_timeout);
                        if snub_armed {
                            snub.as_mut().reset(Instant::now() + config.snub_timeout);
                        }
                        if message == Message::KeepAlive {
                            continue;
                        }
                        event!(Level::TRACE, peer = %id, message = ?MessageSummary(&message));
                        PeerEventKind::Message(message)
                    }
                    Inbound::Uploaded(len) => PeerEventKind::BlockUploaded(len),
                };
                tokio::select! {
                    biased;
                    _ = &mut close_rx => break 'session Exit::Closed,
                    sent = events_tx.send(PeerEvent { peer: id, kind }) => {
                        if sent.is_err() {
                            break 'session Exit::Closed;
                        }
                    }
                }
            }

            _ = &mut snub, if snub_armed => {
                snub_armed = false;
                event!(Level::DEBUG, peer = %id, "Peer snubbed");
                tokio::select! {
                    biased;
                    _ = &mut close_rx => break 'session Exit::Closed,
                    sent = events_tx.send(PeerEvent { peer: id, kind: PeerEventKind::Snubbed }) => {
                        if sent.is_err() {
                            break 'session Exit::Closed;
                        }
                    }
                }
            }

            _ = &mut inactivity => break 'session Exit::Ended("inactivity timeout".into()),

            _ = keep_alive.tick() => shared.push(Outgoing::Message(Message::KeepAlive)),
        }
    };

    {
        let mut outbox = shared.lock();
        outbox.closed = true;
        outbox.queue.clear();
        outbox.queued_pieces = 0;
    }
    if !reader_done {
        reader.abort();
        let _ = reader.await;
    }
    if !writer_done {
        writer.abort();
        let _ = writer.await;
    }

    if let Exit::Ended(reason) = exit {
        event!(Level::DEBUG, peer = %id, %reason, "Peer connection ended");
        tokio::select! {
            biased;
            _ = &mut close_rx => {}
            _ = events_tx.send(PeerEvent { peer: id, kind: PeerEventKind::Disconnected }) => {}
        }
    }
}
