// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::config::Settings;
use crate::errors::{StorageError, TorrentError, TransportError};
use crate::networking::connection::{
    BlockReader, ConnectionConfig, ConnectionType, PeerConnection, PeerEvent, PeerEventKind,
};
use crate::networking::discovery::Discovery;
use crate::networking::externalip::best_addr;
use crate::networking::protocol::{
    decode_metadata_message, encode_metadata_message, extended_handshake_message, BlockInfo,
    ClientExtendedId, ExtendedHandshakePayload, Message, MessageSummary, MetadataMessage,
    MetadataMessageType, MAX_FRAME_LEN, METADATA_PIECE_SIZE,
};
use crate::networking::session::PeerSession;
use crate::networking::transport::{
    protocol_tag, BoxStream, IncomingStream, PeerAddrInfo, PeerId, Transport,
};
use crate::resource_manager::{PermitGuard, ResourceManagerClient, ResourceManagerError};
use crate::resumer::{ResumeStats, Resumer};
use crate::storage::{FileStorage, MultiFileInfo, Storage};
use crate::token_bucket::RateLimits;
use crate::torrent_file::{info_hash_hex, InfoHash, Metainfo};
use crate::torrent_manager::addr_list::{AddrList, PeerSource};
use crate::torrent_manager::allocator::{allocate, Allocation};
use crate::torrent_manager::info_downloader::InfoDownloader;
use crate::torrent_manager::piece::{pieces_from_info, Piece};
use crate::torrent_manager::piece_downloader::{BlockError, PieceDownloader};
use crate::torrent_manager::piece_picker::PiecePicker;
use crate::torrent_manager::stats::{
    eta, printable, AddressStats, ByteStats, DownloadStats, MetadataDownloadStats, PeerStats,
    PieceStats, SpeedMeter, SpeedStats, Stats, Status,
};
use crate::torrent_manager::tasks::{
    announce_loop, write_piece, PieceWriteJob, PieceWriteResult, StorageBlockReader, TaskEvent,
    TaskSender,
};
use crate::torrent_manager::unchoker::{UnchokeCandidate, Unchoker};
use crate::torrent_manager::verifier::verify;
use crate::torrent_manager::{ManagerCommand, TorrentParameters};

const COMMAND_BUFFER: usize = 64;
const PEER_EVENT_BUFFER: usize = 1024;
const INCOMING_BUFFER: usize = 32;
/// Requests for more than this are a protocol violation.
const MAX_REQUEST_LEN: u32 = 128 * 1024;
const SPEED_TICK: Duration = Duration::from_secs(1);
/// Resume data is flushed every this many speed ticks while running.
const PERSIST_EVERY_TICKS: u32 = 30;
const CLIENT_VERSION: &str = concat!("swarmseedr ", env!("CARGO_PKG_VERSION"));

type DialOutcome = (PeerAddrInfo, PeerSource, Result<BoxStream, TransportError>);

/// Cloneable front end of a [`TorrentManager`] loop.
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    id: String,
    info_hash: InfoHash,
    command_tx: mpsc::Sender<ManagerCommand>,
    status_rx: watch::Receiver<Status>,
    completed_rx: watch::Receiver<bool>,
    bitfield: Arc<RwLock<Option<Bitfield>>>,
}

impl TorrentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    async fn send(&self, command: ManagerCommand) -> Result<(), TorrentError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| TorrentError::Closed)
    }

    pub async fn start(&self) -> Result<(), TorrentError> {
        self.send(ManagerCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), TorrentError> {
        self.send(ManagerCommand::Stop).await
    }

    pub async fn verify(&self) -> Result<(), TorrentError> {
        self.send(ManagerCommand::Verify).await
    }

    pub async fn add_peers(&self, peers: Vec<PeerAddrInfo>) -> Result<(), TorrentError> {
        self.send(ManagerCommand::AddPeers(peers)).await
    }

    pub async fn stats(&self) -> Result<Stats, TorrentError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Stats(tx)).await?;
        rx.await.map_err(|_| TorrentError::Closed)
    }

    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Pieces we own. `None` while verifying and before the first check settled it.
    pub fn bitfield(&self) -> Option<Bitfield> {
        self.bitfield
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_complete(&self) -> bool {
        *self.completed_rx.borrow()
    }

    /// Resolves once every piece is owned.
    pub async fn wait_complete(&self) -> Result<(), TorrentError> {
        let mut rx = self.completed_rx.clone();
        rx.wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| TorrentError::Closed)
    }

    /// Stops the torrent and waits until its loop has exited.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(ManagerCommand::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns all state of one torrent and processes its events one at a time. Peer
/// connections, disk work and discovery run as separate tasks that only report back
/// through channels.
pub struct TorrentManager {
    id: String,
    info_hash: InfoHash,
    name: String,
    metainfo: Option<Metainfo>,
    data_dir: PathBuf,
    stop_after_download: bool,
    fixed_peers: Vec<PeerAddrInfo>,
    protocol_tag: String,

    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    resumer: Arc<dyn Resumer>,
    resources: ResourceManagerClient,
    limits: RateLimits,

    command_rx: mpsc::Receiver<ManagerCommand>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    incoming_rx: Option<mpsc::Receiver<IncomingStream>>,
    task_tx: TaskSender,
    task_rx: mpsc::UnboundedReceiver<(u64, TaskEvent)>,
    tasks: JoinSet<()>,
    dials: JoinSet<DialOutcome>,

    status_tx: watch::Sender<Status>,
    completed_tx: watch::Sender<bool>,
    checked_tx: Arc<watch::Sender<u32>>,
    stop_tx: watch::Sender<bool>,
    shared_bitfield: Arc<RwLock<Option<Bitfield>>>,
    need_more_peers: Arc<AtomicBool>,

    running: bool,
    /// Bumped on every start and stop; task results from another run are dropped.
    generation: u64,
    allocating: bool,
    verifying: bool,
    do_verify: bool,
    completed: bool,
    last_error: Option<TorrentError>,

    pieces: Option<Vec<Piece>>,
    bitfield: Option<Bitfield>,
    storage: Option<Arc<FileStorage>>,
    block_reader: Option<Arc<dyn BlockReader>>,
    allocated: u64,

    peers: HashMap<PeerId, PeerSession>,
    dialing: HashSet<PeerId>,
    picker: Option<PiecePicker>,
    piece_downloaders: HashMap<PeerId, PieceDownloader>,
    snubbed_downloads: HashSet<PeerId>,
    choked_downloads: HashSet<PeerId>,
    info_downloaders: HashMap<PeerId, InfoDownloader>,
    snubbed_info_downloads: HashSet<PeerId>,
    unchoker: Unchoker,
    addr_list: AddrList,

    download_speed: SpeedMeter,
    upload_speed: SpeedMeter,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
    bytes_wasted: u64,
    seeded_for: Duration,
    ticks_since_persist: u32,
}

impl TorrentManager {
    pub fn new(params: TorrentParameters) -> (Self, TorrentHandle) {
        let TorrentParameters {
            id,
            info_hash,
            name,
            metainfo,
            bitfield,
            data_dir,
            stop_after_download,
            initial_stats,
            fixed_peers,
            settings,
            transport,
            discovery,
            resumer,
            resource_manager,
            limits,
        } = params;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_BUFFER);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::Stopped);
        let (completed_tx, completed_rx) = watch::channel(false);
        let (checked_tx, _) = watch::channel(0);
        let (stop_tx, _) = watch::channel(false);
        let shared_bitfield = Arc::new(RwLock::new(bitfield.clone()));

        let addr_list = AddrList::new(
            settings.max_peer_addresses,
            &transport.local_peer(),
            settings.blocked_ips.iter().copied().collect(),
        );
        let unchoker = Unchoker::new(
            settings.unchoked_peers,
            settings.optimistic_unchoked_peers,
            settings.optimistic_rotation_ticks,
        );
        let name = match &metainfo {
            Some(m) if name.is_empty() => m.name().to_string(),
            _ => name,
        };

        let handle = TorrentHandle {
            id: id.clone(),
            info_hash,
            command_tx,
            status_rx,
            completed_rx,
            bitfield: shared_bitfield.clone(),
        };

        let manager = Self {
            id,
            info_hash,
            name,
            metainfo,
            data_dir,
            stop_after_download,
            fixed_peers,
            protocol_tag: protocol_tag(&info_hash),
            settings,
            transport,
            discovery,
            resumer,
            resources: resource_manager,
            limits,
            command_rx,
            events_tx,
            events_rx,
            incoming_rx: None,
            task_tx,
            task_rx,
            tasks: JoinSet::new(),
            dials: JoinSet::new(),
            status_tx,
            completed_tx,
            checked_tx: Arc::new(checked_tx),
            stop_tx,
            shared_bitfield,
            need_more_peers: Arc::new(AtomicBool::new(false)),
            running: false,
            generation: 0,
            allocating: false,
            verifying: false,
            do_verify: false,
            completed: false,
            last_error: None,
            pieces: None,
            bitfield,
            storage: None,
            block_reader: None,
            allocated: 0,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            picker: None,
            piece_downloaders: HashMap::new(),
            snubbed_downloads: HashSet::new(),
            choked_downloads: HashSet::new(),
            info_downloaders: HashMap::new(),
            snubbed_info_downloads: HashSet::new(),
            unchoker,
            addr_list,
            download_speed: SpeedMeter::default(),
            upload_speed: SpeedMeter::default(),
            bytes_downloaded: initial_stats.bytes_downloaded,
            bytes_uploaded: initial_stats.bytes_uploaded,
            bytes_wasted: initial_stats.bytes_wasted,
            seeded_for: initial_stats.seeded_for,
            ticks_since_persist: 0,
        };
        (manager, handle)
    }

    pub async fn run(mut self) {
        let mut speed_tick = interval(SPEED_TICK);
        speed_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut unchoke_tick = interval(self.settings.unchoke_interval());
        unchoke_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        self.stop(None).await;
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some((generation, task_event)) = self.task_rx.recv() => {
                    if generation == self.generation {
                        self.handle_task_event(task_event).await;
                    }
                }
                Some(peer_event) = self.events_rx.recv() => {
                    self.handle_peer_event(peer_event).await;
                }
                Some(incoming) = recv_incoming(&mut self.incoming_rx) => {
                    self.handle_incoming(incoming);
                }
                Some(joined) = self.dials.join_next() => {
                    if let Ok((addr, source, result)) = joined {
                        self.handle_dial_result(addr, source, result);
                    }
                }
                Some(Err(e)) = self.tasks.join_next() => {
                    if e.is_panic() {
                        self.stop(Some(TorrentError::InvariantViolation(format!(
                            "background task panicked: {e}"
                        ))))
                        .await;
                    }
                }
                _ = speed_tick.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick);
                    last_tick = now;
                    self.tick_speed(dt).await;
                }
                _ = unchoke_tick.tick(), if self.running => {
                    self.tick_unchoker();
                }
            }
            self.publish_status();
        }
        self.publish_status();
        event!(Level::DEBUG, torrent = %self.id, "Torrent loop exited");
    }

    /// Returns true when the loop should exit.
    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        event!(Level::TRACE, torrent = %self.id, ?command);
        match command {
            ManagerCommand::Start => self.start().await,
            ManagerCommand::Stop => {
                self.stop(None).await;
                self.write_started(false).await;
            }
            ManagerCommand::Verify => self.verify().await,
            ManagerCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            ManagerCommand::AddPeers(peers) => self.add_fixed_peers(peers).await,
            ManagerCommand::Close(ack) => {
                self.stop(None).await;
                self.publish_status();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    async fn handle_task_event(&mut self, task_event: TaskEvent) {
        match task_event {
            TaskEvent::Allocated(result) => self.handle_allocated(result).await,
            TaskEvent::Verified(result) => self.handle_verified(result).await,
            TaskEvent::PieceWritten(result) => self.handle_piece_written(result).await,
            TaskEvent::RamGranted {
                peer,
                piece,
                allowed_fast,
                permit,
            } => self.handle_ram_granted(peer, piece, allowed_fast, permit),
            TaskEvent::PeersFound(peers) => self.add_addrs(peers, PeerSource::Dht).await,
        }
    }

    // Lifecycle

    async fn start(&mut self) {
        if self.running {
            return;
        }
        event!(Level::INFO, torrent = %self.id, name = %self.name, "Starting torrent");
        self.running = true;
        self.last_error = None;
        self.generation += 1;
        self.stop_tx.send_replace(false);
        if !self.do_verify {
            self.write_started(true).await;
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        self.transport
            .set_stream_handler(&self.protocol_tag, incoming_tx);
        self.incoming_rx = Some(incoming_rx);

        if !self.do_verify {
            self.need_more_peers
                .store(!self.completed, Ordering::Relaxed);
            self.tasks.spawn(announce_loop(
                self.discovery.clone(),
                self.info_hash,
                self.settings.discovery_interval(),
                self.settings.find_providers_limit,
                self.need_more_peers.clone(),
                self.task_tx.clone(),
                self.generation,
            ));
            let fixed = self.fixed_peers.clone();
            self.add_addrs(fixed, PeerSource::Fixed).await;
        }

        if self.metainfo.is_some() {
            self.start_allocator();
        } else {
            self.start_info_downloaders();
        }
    }

    /// Tears down every peer and background task of the current run. Returns only after
    /// all of them have exited.
    async fn stop(&mut self, err: Option<TorrentError>) {
        if let Some(e) = err {
            event!(Level::ERROR, torrent = %self.id, error = %e, "Torrent stopped with error");
            self.last_error = Some(e);
        }
        if !self.running {
            return;
        }
        event!(Level::INFO, torrent = %self.id, "Stopping torrent");
        self.running = false;
        self.status_tx.send_replace(Status::Stopping);
        self.stop_tx.send_replace(true);
        self.generation += 1;

        self.transport.remove_stream_handler(&self.protocol_tag);
        self.incoming_rx = None;
        self.tasks.shutdown().await;
        self.dials.shutdown().await;
        self.dialing.clear();

        for (_, session) in self.peers.drain() {
            session.close().await;
        }
        self.piece_downloaders.clear();
        self.snubbed_downloads.clear();
        self.choked_downloads.clear();
        self.info_downloaders.clear();
        self.snubbed_info_downloads.clear();
        self.unchoker = Unchoker::new(
            self.settings.unchoked_peers,
            self.settings.optimistic_unchoked_peers,
            self.settings.optimistic_rotation_ticks,
        );
        self.picker = None;
        self.pieces = None;
        self.allocating = false;
        self.verifying = false;

        self.persist_bitfield().await;
        self.persist_stats().await;
        self.block_reader = None;
        if let Some(storage) = self.storage.take() {
            storage.close().await;
        }

        self.download_speed.reset_rate();
        self.upload_speed.reset_rate();
        self.addr_list.reset();
        self.need_more_peers.store(false, Ordering::Relaxed);
    }

    /// Re-checks all data: stop, forget the bitfield, allocate and verify, stop again.
    async fn verify(&mut self) {
        if self.metainfo.is_none() {
            event!(Level::WARN, torrent = %self.id, "Cannot verify before metadata is known");
            return;
        }
        self.stop(None).await;
        self.do_verify = true;
        self.replace_bitfield(None);
        self.set_completed(false);
        self.start().await;
    }

    fn start_allocator(&mut self) {
        let Some(metainfo) = &self.metainfo else {
            return;
        };
        if !self.running {
            return;
        }
        self.allocating = true;
        let layout = MultiFileInfo::new(&self.data_dir, &metainfo.info);
        let stop_rx = self.stop_tx.subscribe();
        let tx = self.task_tx.clone();
        let generation = self.generation;
        self.tasks.spawn(async move {
            let result = allocate(&layout, &stop_rx).await;
            let _ = tx.send((generation, TaskEvent::Allocated(result)));
        });
    }

    async fn handle_allocated(&mut self, result: Result<Option<Allocation>, StorageError>) {
        self.allocating = false;
        let allocation = match result {
            Ok(Some(allocation)) => allocation,
            Ok(None) => return,
            Err(e) => {
                self.stop(Some(e.into())).await;
                return;
            }
        };
        let Some(metainfo) = &self.metainfo else {
            return;
        };
        event!(
            Level::DEBUG,
            torrent = %self.id,
            existing = allocation.has_existing,
            missing = allocation.has_missing,
            "Allocation finished"
        );

        let layout = MultiFileInfo::new(&self.data_dir, &metainfo.info);
        let storage = Arc::new(FileStorage::new(layout));
        self.block_reader = Some(Arc::new(StorageBlockReader {
            storage: storage.clone(),
            piece_length: metainfo.piece_length() as u64,
            resources: self.resources.clone(),
        }));
        self.storage = Some(storage);
        let pieces = pieces_from_info(&metainfo.info);
        let num_pieces = pieces.len() as u32;
        self.picker = Some(PiecePicker::new(
            num_pieces,
            self.settings.endgame_max_duplicate_downloads,
            self.settings.endgame_threshold_pieces,
        ));
        self.pieces = Some(pieces);
        self.allocated = allocation.allocated;

        self.process_queued_messages().await;
        if !self.running {
            return;
        }

        let resumed = self.bitfield.take().filter(|bf| bf.len() == num_pieces);
        let trusted = match resumed {
            Some(bitfield) if !allocation.has_missing => Some(bitfield),
            _ if !allocation.has_existing => Some(Bitfield::new(num_pieces)),
            _ => None,
        };
        match trusted {
            Some(bitfield) => self.finish_checking(bitfield).await,
            None => self.start_verifier(),
        }
    }

    fn start_verifier(&mut self) {
        let (Some(pieces), Some(storage)) = (&self.pieces, &self.storage) else {
            return;
        };
        let pieces = pieces.clone();
        let storage: Arc<dyn Storage> = storage.clone();
        let resources = self.resources.clone();
        let progress = self.checked_tx.clone();
        let stop_rx = self.stop_tx.subscribe();
        let tx = self.task_tx.clone();
        let generation = self.generation;

        self.verifying = true;
        self.checked_tx.send_replace(0);
        self.replace_bitfield(None);
        event!(Level::INFO, torrent = %self.id, pieces = pieces.len(), "Verifying data");
        self.tasks.spawn(async move {
            let result = verify(&pieces, storage, &resources, &progress, &stop_rx).await;
            let _ = tx.send((generation, TaskEvent::Verified(result)));
        });
    }

    async fn handle_verified(&mut self, result: Result<Option<Bitfield>, StorageError>) {
        self.verifying = false;
        match result {
            Ok(Some(bitfield)) => {
                event!(
                    Level::INFO,
                    torrent = %self.id,
                    have = bitfield.count(),
                    total = bitfield.len(),
                    "Verification finished"
                );
                self.finish_checking(bitfield).await;
            }
            Ok(None) => {}
            Err(e) => self.stop(Some(e.into())).await,
        }
    }

    /// Applies the bitfield from allocation or verification and starts downloading.
    async fn finish_checking(&mut self, bitfield: Bitfield) {
        if let Some(pieces) = &mut self.pieces {
            for piece in pieces.iter_mut() {
                piece.done = bitfield.test(piece.index);
            }
        }
        let complete = bitfield.all();
        self.replace_bitfield(Some(bitfield));
        self.persist_bitfield().await;

        if self.do_verify {
            self.do_verify = false;
            self.set_completed(complete);
            self.stop(None).await;
            self.write_started(false).await;
            return;
        }
        if !complete {
            self.set_completed(false);
        }

        self.announce_owned_pieces();
        if self.check_completion().await {
            return;
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.update_interest(id);
        }
        self.start_piece_downloaders();
    }

    /// Returns true when every piece is owned, stopping the torrent if it was asked to
    /// stop after download. The first time that happens downloads are cancelled and
    /// peers not interested in us are dropped.
    async fn check_completion(&mut self) -> bool {
        if !self.completed {
            if !self.bitfield.as_ref().is_some_and(|bf| bf.all()) {
                return false;
            }
            self.on_first_completion().await;
        }
        if self.stop_after_download && self.running {
            self.stop(None).await;
            self.write_started(false).await;
        }
        true
    }

    async fn on_first_completion(&mut self) {
        event!(Level::INFO, torrent = %self.id, name = %self.name, "Download completed");
        self.set_completed(true);
        self.persist_bitfield().await;
        self.persist_stats().await;

        let downloads: Vec<PeerId> = self.piece_downloaders.keys().copied().collect();
        for id in downloads {
            self.abandon_download(id, true);
        }
        let uninterested: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, peer)| !peer.peer_interested)
            .map(|(id, _)| *id)
            .collect();
        for id in uninterested {
            self.close_peer(id).await;
        }
        for peer in self.peers.values_mut() {
            peer.set_interested(false);
        }
        self.addr_list.reset();
        self.need_more_peers.store(false, Ordering::Relaxed);
    }

    // Peers

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_queued_pieces: self.settings.max_requests_in,
            keep_alive_interval: self.settings.keep_alive_interval(),
            inactivity_timeout: self.settings.peer_inactivity_timeout(),
            snub_timeout: self.settings.snub_timeout(),
            piece_read_timeout: self.settings.piece_read_timeout(),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    fn handle_incoming(&mut self, incoming: IncomingStream) {
        let IncomingStream { peer, stream } = incoming;
        if !self.running {
            return;
        }
        if self.peers.contains_key(&peer.id) {
            event!(Level::DEBUG, torrent = %self.id, peer = %peer.id, "Duplicate peer, closing stream");
            return;
        }
        let incoming = self
            .peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Incoming)
            .count();
        if incoming >= self.settings.max_peer_accept {
            event!(Level::DEBUG, torrent = %self.id, peer = %peer.id, "Too many incoming peers, closing stream");
            return;
        }
        self.add_peer(peer.id, best_addr(&peer.addrs), ConnectionType::Incoming, stream);
    }

    fn add_peer(
        &mut self,
        id: PeerId,
        addr: Option<SocketAddr>,
        connection_type: ConnectionType,
        stream: BoxStream,
    ) {
        event!(Level::DEBUG, torrent = %self.id, peer = %id, ?connection_type, "Peer connected");
        let conn = PeerConnection::spawn(
            id,
            addr,
            connection_type,
            stream,
            self.events_tx.clone(),
            self.limits.clone(),
            self.connection_config(),
        );
        let session = PeerSession::new(conn);
        self.send_first_messages(&session, addr);
        self.peers.insert(id, session);
        self.update_need_more_peers();
    }

    fn send_first_messages(&self, session: &PeerSession, addr: Option<SocketAddr>) {
        let have = match (&self.metainfo, &self.bitfield) {
            (Some(_), Some(bf)) if bf.all() => Message::HaveAll,
            (Some(_), Some(bf)) if bf.count() > 0 => Message::Bitfield(bf.bytes().to_vec()),
            _ => Message::HaveNone,
        };
        session.send(have);

        let payload = ExtendedHandshakePayload {
            m: ClientExtendedId::advertised(),
            metadata_size: self.metainfo.as_ref().map(|m| m.info_bytes.len() as i64),
            reqq: Some(self.settings.max_requests_in as i64),
            v: Some(CLIENT_VERSION.to_string()),
            yourip: addr.map(|a| match a.ip() {
                IpAddr::V4(ip) => ip.octets().to_vec(),
                IpAddr::V6(ip) => ip.octets().to_vec(),
            }),
        };
        match extended_handshake_message(&payload) {
            Ok(message) => session.send(message),
            Err(e) => event!(Level::WARN, error = %e, "Failed to encode extension handshake"),
        }
    }

    async fn close_peer(&mut self, id: PeerId) {
        let Some(session) = self.peers.remove(&id) else {
            return;
        };
        event!(Level::DEBUG, torrent = %self.id, peer = %id, "Closing peer");
        self.piece_downloaders.remove(&id);
        self.snubbed_downloads.remove(&id);
        self.choked_downloads.remove(&id);
        self.info_downloaders.remove(&id);
        self.snubbed_info_downloads.remove(&id);
        if let Some(picker) = &mut self.picker {
            picker.handle_disconnect(id);
        }
        self.unchoker.handle_disconnect(&id);
        session.close().await;

        self.start_piece_downloaders();
        self.start_info_downloaders();
        self.dial_addresses();
    }

    async fn add_fixed_peers(&mut self, peers: Vec<PeerAddrInfo>) {
        for peer in &peers {
            if !self.fixed_peers.contains(peer) {
                self.fixed_peers.push(peer.clone());
            }
        }
        let entries: Vec<String> = self.fixed_peers.iter().map(|p| p.to_string()).collect();
        if let Err(e) = self
            .resumer
            .update(&self.id, Box::new(move |r| r.fixed_peers = entries))
            .await
        {
            event!(Level::WARN, torrent = %self.id, error = %e, "Failed to persist fixed peers");
        }
        self.add_addrs(peers, PeerSource::Fixed).await;
    }

    async fn add_addrs(&mut self, addrs: Vec<PeerAddrInfo>, source: PeerSource) {
        if !self.running || self.completed || addrs.is_empty() {
            return;
        }
        match self.addr_list.push(addrs, source) {
            Ok(added) => {
                event!(Level::DEBUG, torrent = %self.id, %source, added, "Received peer addresses")
            }
            Err(e) => {
                self.stop(Some(e)).await;
                return;
            }
        }
        self.dial_addresses();
    }

    fn dial_addresses(&mut self) {
        if !self.running || self.completed {
            return;
        }
        while self.peers.len() + self.dialing.len() < self.settings.max_peer_dial {
            let Some((addr, source)) = self.addr_list.pop() else {
                break;
            };
            if self.peers.contains_key(&addr.id) || self.dialing.contains(&addr.id) {
                continue;
            }
            event!(Level::TRACE, torrent = %self.id, peer = %addr, %source, "Dialing peer");
            self.dialing.insert(addr.id);
            let transport = self.transport.clone();
            let tag = self.protocol_tag.clone();
            let dial_timeout = self.settings.dial_timeout();
            self.dials.spawn(async move {
                let result = match timeout(dial_timeout, transport.open_stream(&addr, &tag)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };
                (addr, source, result)
            });
        }
        self.update_need_more_peers();
    }

    fn handle_dial_result(
        &mut self,
        addr: PeerAddrInfo,
        source: PeerSource,
        result: Result<BoxStream, TransportError>,
    ) {
        self.dialing.remove(&addr.id);
        if !self.running {
            return;
        }
        match result {
            Ok(stream) if !self.peers.contains_key(&addr.id) => {
                self.add_peer(addr.id, best_addr(&addr.addrs), ConnectionType::Outgoing, stream);
            }
            Ok(_) => {
                event!(Level::DEBUG, torrent = %self.id, peer = %addr.id, "Already connected, dropping dialed stream");
            }
            Err(e) => {
                event!(Level::DEBUG, torrent = %self.id, peer = %addr, %source, error = %e, "Dial failed");
            }
        }
        self.dial_addresses();
    }

    fn update_need_more_peers(&self) {
        let need = self.running
            && !self.completed
            && self.addr_list.is_empty()
            && self.peers.len() + self.dialing.len() < self.settings.max_peer_dial;
        self.need_more_peers.store(need, Ordering::Relaxed);
    }

    // Peer events

    async fn handle_peer_event(&mut self, peer_event: PeerEvent) {
        let PeerEvent { peer, kind } = peer_event;
        if !self.peers.contains_key(&peer) {
            return;
        }
        match kind {
            PeerEventKind::Message(message) => self.handle_peer_message(peer, message).await,
            PeerEventKind::BlockUploaded(len) => {
                let len = len as u64;
                self.bytes_uploaded += len;
                self.upload_speed.mark(len);
                if let Some(session) = self.peers.get_mut(&peer) {
                    session.bytes_uploaded += len;
                    session.upload_speed.mark(len);
                }
            }
            PeerEventKind::Snubbed => self.handle_snubbed(peer),
            PeerEventKind::Disconnected => {
                event!(Level::DEBUG, torrent = %self.id, peer = %peer, "Peer disconnected");
                self.close_peer(peer).await;
            }
        }
    }

    async fn handle_peer_message(&mut self, id: PeerId, message: Message) {
        event!(Level::TRACE, torrent = %self.id, peer = %id, message = ?MessageSummary(&message));
        let metadata_ready = self.pieces.is_some();
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        let result = match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.handle_choke(id);
                Ok(())
            }
            Message::Unchoke => {
                self.handle_unchoke(id);
                Ok(())
            }
            Message::Interested => {
                peer.peer_interested = true;
                if peer.am_choking && self.unchoker.can_fast_unchoke() {
                    self.unchoker.fast_unchoke(id);
                    peer.unchoke();
                }
                Ok(())
            }
            Message::NotInterested => {
                peer.peer_interested = false;
                Ok(())
            }
            Message::Have(_)
            | Message::Bitfield(_)
            | Message::HaveAll
            | Message::HaveNone
            | Message::AllowedFast(_)
                if !metadata_ready =>
            {
                peer.queue_pending(message).map_err(TorrentError::from)
            }
            Message::Have(index) => self.handle_have(id, index),
            Message::Bitfield(bytes) => Bitfield::from_bytes(&bytes, self.num_pieces())
                .map_err(|e| TorrentError::Protocol(e.to_string()))
                .and_then(|bitfield| self.handle_peer_bitfield(id, bitfield)),
            Message::HaveAll => {
                let mut bitfield = Bitfield::new(self.num_pieces());
                bitfield.set_all();
                self.handle_peer_bitfield(id, bitfield)
            }
            Message::HaveNone => self.handle_peer_bitfield(id, Bitfield::new(self.num_pieces())),
            Message::AllowedFast(index) => self.handle_allowed_fast(id, index),
            Message::Request(index, begin, length) => self.handle_request(id, index, begin, length),
            Message::Cancel(index, begin, length) => {
                peer.cancel_upload(BlockInfo {
                    piece_index: index,
                    offset: begin,
                    length,
                });
                Ok(())
            }
            Message::Reject(index, begin, length) => {
                self.handle_reject(id, index, begin, length);
                Ok(())
            }
            Message::Piece(index, begin, data) => self.handle_piece(id, index, begin, data),
            Message::Extended(extended_id, payload) => {
                self.handle_extended(id, extended_id, payload).await
            }
        };

        if let Err(e) = result {
            event!(Level::DEBUG, torrent = %self.id, peer = %id, error = %e, "Closing misbehaving peer");
            self.close_peer(id).await;
        }
    }

    /// Replays messages that arrived before the piece count was known.
    async fn process_queued_messages(&mut self) {
        let queued: Vec<(PeerId, Vec<Message>)> = self
            .peers
            .iter_mut()
            .filter(|(_, peer)| !peer.pending_messages.is_empty())
            .map(|(id, peer)| (*id, std::mem::take(&mut peer.pending_messages)))
            .collect();
        for (id, messages) in queued {
            for message in messages {
                self.handle_peer_message(id, message).await;
            }
        }
    }

    fn num_pieces(&self) -> u32 {
        self.pieces.as_ref().map_or(0, |p| p.len() as u32)
    }

    fn handle_have(&mut self, id: PeerId, index: u32) -> Result<(), TorrentError> {
        let num_pieces = self.num_pieces();
        if index >= num_pieces {
            return Err(TorrentError::Protocol(format!(
                "have for piece {index} of {num_pieces}"
            )));
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        peer.bitfield
            .get_or_insert_with(|| Bitfield::new(num_pieces))
            .set(index);
        if let Some(picker) = &mut self.picker {
            picker.handle_have(id, index);
        }
        self.update_interest(id);
        self.start_piece_downloader_for(id);
        Ok(())
    }

    fn handle_peer_bitfield(&mut self, id: PeerId, bitfield: Bitfield) -> Result<(), TorrentError> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        if peer.bitfield.is_some() {
            return Err(TorrentError::Protocol("piece announcement after bitfield".into()));
        }
        if let Some(picker) = &mut self.picker {
            if bitfield.all() {
                picker.handle_have_all(id);
            } else {
                picker.handle_bitfield(id, &bitfield);
            }
        }
        peer.bitfield = Some(bitfield);
        self.update_interest(id);
        self.start_piece_downloader_for(id);
        Ok(())
    }

    fn handle_allowed_fast(&mut self, id: PeerId, index: u32) -> Result<(), TorrentError> {
        let num_pieces = self.num_pieces();
        if index >= num_pieces {
            return Err(TorrentError::Protocol(format!(
                "allowed fast for piece {index} of {num_pieces}"
            )));
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        peer.allowed_fast.insert(index);
        if let Some(picker) = &mut self.picker {
            picker.handle_allowed_fast(id, index);
        }
        self.start_piece_downloader_for(id);
        Ok(())
    }

    fn update_interest(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let interested = !self.completed
            && match (&self.bitfield, &peer.bitfield) {
                (Some(ours), Some(theirs)) => theirs.iter_set().any(|i| !ours.test(i)),
                _ => false,
            };
        peer.set_interested(interested);
    }

    fn handle_choke(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.peer_choking = true;
        match self.piece_downloaders.get_mut(&id) {
            Some(pd) if pd.allowed_fast => {
                pd.choked();
                self.choked_downloads.insert(id);
            }
            Some(_) => {
                self.abandon_download(id, false);
                self.start_piece_downloader_for(id);
            }
            None => {}
        }
    }

    fn handle_unchoke(&mut self, id: PeerId) {
        let (default_out, max_out) = self.request_limits();
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.peer_choking = false;
        if let Some(pd) = self.piece_downloaders.get_mut(&id) {
            self.choked_downloads.remove(&id);
            let budget = peer.max_allowed_requests(default_out, max_out);
            pd.request_blocks(&*peer, budget);
        } else {
            self.start_piece_downloader_for(id);
        }
    }

    fn handle_snubbed(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.snubbed = true;
        event!(Level::DEBUG, torrent = %self.id, peer = %id, "Peer snubbed");
        if let Some(pd) = self.piece_downloaders.get(&id) {
            if self.snubbed_downloads.insert(id) {
                if let Some(picker) = &mut self.picker {
                    picker.handle_snubbed(id, pd.piece);
                }
            }
            self.start_piece_downloaders();
        }
        if self.info_downloaders.contains_key(&id) {
            self.snubbed_info_downloads.insert(id);
            self.start_info_downloaders();
        }
    }

    // Uploads

    fn handle_request(
        &mut self,
        id: PeerId,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        if length > MAX_REQUEST_LEN {
            return Err(TorrentError::Protocol(format!("request of {length} bytes")));
        }
        let Some(peer) = self.peers.get(&id) else {
            return Ok(());
        };
        let (Some(pieces), Some(reader), Some(bitfield)) =
            (&self.pieces, &self.block_reader, &self.bitfield)
        else {
            peer.send(Message::Reject(index, begin, length));
            return Ok(());
        };
        let Some(piece) = pieces.get(index as usize) else {
            return Err(TorrentError::Protocol(format!("request for piece {index}")));
        };
        if !piece.contains(begin, length) {
            return Err(TorrentError::Protocol(format!(
                "request outside piece {index}: offset {begin}, length {length}"
            )));
        }
        if peer.am_choking || !bitfield.test(index) {
            peer.send(Message::Reject(index, begin, length));
            return Ok(());
        }
        peer.upload(
            BlockInfo {
                piece_index: index,
                offset: begin,
                length,
            },
            reader.clone(),
        );
        Ok(())
    }

    // Piece downloads

    fn request_limits(&self) -> (usize, usize) {
        (
            self.settings.default_requests_out,
            self.settings.max_requests_out,
        )
    }

    fn can_download(&self) -> bool {
        self.running
            && !self.completed
            && !self.do_verify
            && self.bitfield.is_some()
            && self.pieces.is_some()
    }

    fn start_piece_downloaders(&mut self) {
        if !self.can_download() {
            return;
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.start_piece_downloader_for(id);
        }
    }

    /// Picks a piece for `id` and reserves its buffer; the download starts once the
    /// reservation is granted.
    fn start_piece_downloader_for(&mut self, id: PeerId) {
        if !self.can_download() {
            return;
        }
        let (Some(pieces), Some(picker), Some(peer)) =
            (&self.pieces, &mut self.picker, self.peers.get_mut(&id))
        else {
            return;
        };
        if peer.downloading.is_some() || peer.bitfield.is_none() {
            return;
        }
        let Some((index, allowed_fast)) = picker.pick_for(id, pieces, peer.peer_choking) else {
            return;
        };
        let length = pieces[index as usize].length as usize;
        peer.downloading = Some(index);
        peer.awaiting_ram = true;

        let resources = self.resources.clone();
        let tx = self.task_tx.clone();
        let generation = self.generation;
        self.tasks.spawn(async move {
            let permit = resources.acquire_piece_memory(length).await;
            let _ = tx.send((
                generation,
                TaskEvent::RamGranted {
                    peer: id,
                    piece: index,
                    allowed_fast,
                    permit,
                },
            ));
        });
    }

    fn handle_ram_granted(
        &mut self,
        id: PeerId,
        index: u32,
        allowed_fast: bool,
        permit: Result<PermitGuard, ResourceManagerError>,
    ) {
        let (default_out, max_out) = self.request_limits();
        let usable = self.can_download()
            && self
                .pieces
                .as_ref()
                .and_then(|p| p.get(index as usize))
                .is_some_and(|p| !p.done && !p.writing);
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.downloading != Some(index) || !peer.awaiting_ram {
            return;
        }
        peer.awaiting_ram = false;

        let permit = match permit {
            Ok(permit) if usable && (!peer.peer_choking || allowed_fast) => permit,
            other => {
                if let Err(e) = other {
                    event!(Level::WARN, torrent = %self.id, error = %e, "Piece buffer reservation failed");
                }
                peer.downloading = None;
                if let Some(picker) = &mut self.picker {
                    picker.handle_cancel_download(id, index);
                }
                self.start_piece_downloader_for(id);
                return;
            }
        };
        let Some(piece) = self.pieces.as_ref().and_then(|p| p.get(index as usize)) else {
            return;
        };
        let mut pd = PieceDownloader::new(piece, id, allowed_fast, Some(permit));
        let budget = peer.max_allowed_requests(default_out, max_out);
        pd.request_blocks(&*peer, budget);
        peer.start_snub_timer();
        self.piece_downloaders.insert(id, pd);
    }

    /// Drops the download assigned to `id`, optionally cancelling its outstanding
    /// requests.
    fn abandon_download(&mut self, id: PeerId, cancel: bool) {
        let Some(mut pd) = self.piece_downloaders.remove(&id) else {
            return;
        };
        self.snubbed_downloads.remove(&id);
        self.choked_downloads.remove(&id);
        if let Some(picker) = &mut self.picker {
            picker.handle_cancel_download(id, pd.piece);
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            if cancel {
                pd.cancel_pending(&*peer);
            }
            peer.downloading = None;
            peer.stop_snub_timer();
        }
    }

    fn handle_reject(&mut self, id: PeerId, index: u32, begin: u32, length: u32) {
        let block = BlockInfo {
            piece_index: index,
            offset: begin,
            length,
        };
        let Some(pd) = self.piece_downloaders.get_mut(&id) else {
            return;
        };
        if pd.piece != index || !pd.rejected(block) {
            return;
        }
        // Retried from the next unchoke round.
        self.abandon_download(id, true);
    }

    fn handle_piece(
        &mut self,
        id: PeerId,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<(), TorrentError> {
        let (default_out, max_out) = self.request_limits();
        let len = data.len() as u64;
        self.bytes_downloaded += len;
        self.download_speed.mark(len);
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        peer.bytes_downloaded += len;
        peer.download_speed.mark(len);

        let Some(pd) = self
            .piece_downloaders
            .get_mut(&id)
            .filter(|pd| pd.piece == index)
        else {
            self.bytes_wasted += len;
            peer.bytes_wasted += len;
            return Ok(());
        };
        if self.snubbed_downloads.remove(&id) {
            peer.snubbed = false;
            if let Some(picker) = &mut self.picker {
                picker.handle_unsnubbed(id, index);
            }
        }
        match pd.got_block(begin, &data) {
            Ok(()) => {}
            Err(BlockError::NotRequested(_)) => {
                self.bytes_wasted += len;
                peer.bytes_wasted += len;
                return Ok(());
            }
            Err(e @ BlockError::InvalidBlock { .. }) => {
                self.bytes_wasted += len;
                peer.bytes_wasted += len;
                return Err(TorrentError::Protocol(e.to_string()));
            }
        }
        if !pd.done() {
            let budget = peer.max_allowed_requests(default_out, max_out);
            pd.request_blocks(&*peer, budget);
            return Ok(());
        }
        self.complete_download(id);
        Ok(())
    }

    /// Hands a fully received piece to the hash-and-write path.
    fn complete_download(&mut self, id: PeerId) {
        let Some(pd) = self.piece_downloaders.remove(&id) else {
            return;
        };
        let index = pd.piece;
        self.snubbed_downloads.remove(&id);
        self.choked_downloads.remove(&id);
        if let Some(picker) = &mut self.picker {
            picker.handle_cancel_download(id, index);
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.downloading = None;
            peer.stop_snub_timer();
        }

        let (Some(pieces), Some(storage)) = (&mut self.pieces, &self.storage) else {
            return;
        };
        let Some(piece) = pieces.get_mut(index as usize) else {
            return;
        };
        let (buffer, ram_permit) = pd.into_buffer();
        if piece.done || piece.writing {
            // Lost an endgame race.
            self.bytes_wasted += buffer.len() as u64;
        } else {
            piece.writing = true;
            let job = PieceWriteJob {
                peer: id,
                index,
                offset: piece.offset,
                hash: piece.hash,
                buffer,
                ram_permit,
            };
            let storage: Arc<dyn Storage> = storage.clone();
            let resources = self.resources.clone();
            let tx = self.task_tx.clone();
            let generation = self.generation;
            self.tasks.spawn(async move {
                let result = write_piece(job, storage, resources).await;
                let _ = tx.send((generation, TaskEvent::PieceWritten(result)));
            });
        }
        self.start_piece_downloader_for(id);
    }

    async fn handle_piece_written(&mut self, result: PieceWriteResult) {
        let PieceWriteResult {
            peer,
            index,
            len,
            hash_ok,
            error,
        } = result;
        match self.pieces.as_mut().and_then(|p| p.get_mut(index as usize)) {
            Some(piece) => piece.writing = false,
            None => return,
        }
        if let Some(e) = error {
            self.stop(Some(e.into())).await;
            return;
        }
        if !hash_ok {
            event!(Level::WARN, torrent = %self.id, peer = %peer, piece = index, "Piece hash mismatch");
            self.bytes_wasted += len as u64;
            if let Some(session) = self.peers.get_mut(&peer) {
                session.bytes_wasted += len as u64;
            }
            self.close_peer(peer).await;
            return;
        }

        if let Some(piece) = self.pieces.as_mut().and_then(|p| p.get_mut(index as usize)) {
            piece.done = true;
        }
        if let Some(bitfield) = &mut self.bitfield {
            bitfield.set(index);
        }
        self.publish_bitfield();
        event!(Level::DEBUG, torrent = %self.id, piece = index, "Piece written");

        let duplicates: Vec<PeerId> = self
            .piece_downloaders
            .iter()
            .filter(|(_, pd)| pd.piece == index)
            .map(|(id, _)| *id)
            .collect();
        for id in duplicates {
            self.abandon_download(id, true);
        }
        for session in self.peers.values() {
            if !session.has_piece(index) {
                session.send(Message::Have(index));
            }
        }

        if self.check_completion().await {
            return;
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.update_interest(id);
        }
        self.start_piece_downloaders();
    }

    fn announce_owned_pieces(&self) {
        let Some(bitfield) = &self.bitfield else {
            return;
        };
        for peer in self.peers.values() {
            for index in bitfield.iter_set() {
                if !peer.has_piece(index) {
                    peer.send(Message::Have(index));
                }
            }
        }
    }

    // Metadata

    async fn handle_extended(
        &mut self,
        id: PeerId,
        extended_id: u8,
        payload: Vec<u8>,
    ) -> Result<(), TorrentError> {
        if extended_id == ClientExtendedId::Handshake.id() {
            let handshake: ExtendedHandshakePayload = serde_bencode::from_bytes(&payload)
                .map_err(|e| TorrentError::Protocol(format!("extension handshake: {e}")))?;
            if let Some(peer) = self.peers.get_mut(&id) {
                event!(Level::DEBUG, torrent = %self.id, peer = %id, client = ?handshake.v, "Extension handshake");
                peer.extension_handshake = Some(handshake);
            }
            self.start_info_downloaders();
            return Ok(());
        }
        if extended_id != ClientExtendedId::UtMetadata.id() {
            event!(Level::TRACE, torrent = %self.id, peer = %id, extended_id, "Ignoring unknown extension message");
            return Ok(());
        }

        let (message, data) = decode_metadata_message(&payload)?;
        match message.msg_type {
            t if t == MetadataMessageType::Request as u8 => self.serve_metadata(id, message.piece),
            t if t == MetadataMessageType::Data as u8 => {
                self.handle_metadata_data(id, message.piece, data).await?
            }
            t if t == MetadataMessageType::Reject as u8 => self.handle_metadata_reject(id),
            other => {
                return Err(TorrentError::Protocol(format!(
                    "unknown ut_metadata message type {other}"
                )))
            }
        }
        Ok(())
    }

    fn serve_metadata(&self, id: PeerId, piece: u32) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let Some(ut_id) = peer.ut_metadata_id() else {
            return;
        };
        let chunk = self.metainfo.as_ref().and_then(|m| {
            let total = m.info_bytes.len();
            let start = (piece as usize).checked_mul(METADATA_PIECE_SIZE as usize)?;
            let end = start.checked_add(METADATA_PIECE_SIZE as usize)?.min(total);
            (start < total).then(|| (&m.info_bytes[start..end], total as u64))
        });
        let encoded = match chunk {
            Some((data, total)) => {
                encode_metadata_message(&MetadataMessage::data(piece, total), Some(data))
            }
            None => encode_metadata_message(&MetadataMessage::reject(piece), None),
        };
        match encoded {
            Ok(payload) => peer.send(Message::Extended(ut_id, payload)),
            Err(e) => event!(Level::WARN, error = %e, "Failed to encode metadata message"),
        }
    }

    fn start_info_downloaders(&mut self) {
        if !self.running || self.metainfo.is_some() {
            return;
        }
        let (default_out, max_out) = self.request_limits();
        let max_size = self.settings.max_metadata_size;
        let running = self
            .info_downloaders
            .len()
            .saturating_sub(self.snubbed_info_downloads.len());
        let mut slots = self
            .settings
            .parallel_metadata_downloads
            .saturating_sub(running);

        let candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(id, peer)| {
                !self.info_downloaders.contains_key(*id)
                    && !peer.metadata_rejected
                    && peer.ut_metadata_id().is_some()
                    && peer.metadata_size().is_some()
            })
            .map(|(id, _)| *id)
            .collect();

        for id in candidates {
            if slots == 0 {
                break;
            }
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            let (Some(ut_id), Some(size)) = (peer.ut_metadata_id(), peer.metadata_size()) else {
                continue;
            };
            match InfoDownloader::new(id, size, max_size) {
                Ok(mut downloader) => {
                    let session: &PeerSession = peer;
                    downloader.request_blocks(
                        session.max_allowed_requests(default_out, max_out),
                        |piece| send_metadata_request(session, ut_id, piece),
                    );
                    peer.downloading_metadata = true;
                    peer.start_snub_timer();
                    self.info_downloaders.insert(id, downloader);
                    slots -= 1;
                }
                Err(e) => {
                    event!(Level::DEBUG, torrent = %self.id, peer = %id, error = %e, "Peer metadata unusable");
                    peer.metadata_rejected = true;
                }
            }
        }
    }

    async fn handle_metadata_data(
        &mut self,
        id: PeerId,
        piece: u32,
        data: &[u8],
    ) -> Result<(), TorrentError> {
        let (default_out, max_out) = self.request_limits();
        let (Some(downloader), Some(peer)) =
            (self.info_downloaders.get_mut(&id), self.peers.get_mut(&id))
        else {
            return Ok(());
        };
        if self.snubbed_info_downloads.remove(&id) {
            peer.snubbed = false;
        }
        downloader
            .got_block(piece, data)
            .map_err(|e| TorrentError::Protocol(e.to_string()))?;
        if !downloader.done() {
            if let Some(ut_id) = peer.ut_metadata_id() {
                let session: &PeerSession = peer;
                downloader.request_blocks(
                    session.max_allowed_requests(default_out, max_out),
                    |piece| send_metadata_request(session, ut_id, piece),
                );
            }
            return Ok(());
        }

        peer.downloading_metadata = false;
        peer.stop_snub_timer();
        let Some(downloader) = self.info_downloaders.remove(&id) else {
            return Ok(());
        };
        let info_bytes = downloader
            .into_verified(&self.info_hash)
            .ok_or_else(|| TorrentError::Protocol("metadata hash mismatch".into()))?;
        let metainfo = Metainfo::from_info_bytes(info_bytes)
            .map_err(|e| TorrentError::Protocol(format!("invalid metadata: {e}")))?;
        self.metadata_received(metainfo).await;
        Ok(())
    }

    fn handle_metadata_reject(&mut self, id: PeerId) {
        if self.info_downloaders.remove(&id).is_none() {
            return;
        }
        self.snubbed_info_downloads.remove(&id);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.metadata_rejected = true;
            peer.downloading_metadata = false;
            peer.stop_snub_timer();
        }
        self.start_info_downloaders();
    }

    async fn metadata_received(&mut self, metainfo: Metainfo) {
        event!(Level::INFO, torrent = %self.id, name = %metainfo.name(), "Metadata received");
        self.name = metainfo.name().to_string();
        let info = metainfo.info_bytes.clone();
        let name = self.name.clone();
        if let Err(e) = self
            .resumer
            .update(
                &self.id,
                Box::new(move |r| {
                    r.info = info;
                    r.name = name;
                }),
            )
            .await
        {
            event!(Level::WARN, torrent = %self.id, error = %e, "Failed to persist metadata");
        }

        for (id, _) in self.info_downloaders.drain() {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.downloading_metadata = false;
                peer.stop_snub_timer();
            }
        }
        self.snubbed_info_downloads.clear();
        self.metainfo = Some(metainfo);
        self.start_allocator();
    }

    // Timers

    async fn tick_speed(&mut self, dt: Duration) {
        self.download_speed.tick(dt);
        self.upload_speed.tick(dt);
        for peer in self.peers.values_mut() {
            peer.tick_speed(dt);
        }
        if !self.running {
            return;
        }
        if self.completed {
            self.seeded_for += dt;
        }
        self.ticks_since_persist += 1;
        if self.ticks_since_persist >= PERSIST_EVERY_TICKS {
            self.ticks_since_persist = 0;
            self.persist_bitfield().await;
            self.persist_stats().await;
        }
    }

    fn tick_unchoker(&mut self) {
        let candidates: Vec<UnchokeCandidate> = self
            .peers
            .values()
            .map(|p| UnchokeCandidate {
                peer: p.id(),
                interested: p.peer_interested,
                download_rate: p.download_speed.rate(),
                upload_rate: p.upload_speed.rate(),
            })
            .collect();
        let unchoked = self.unchoker.tick(&candidates, self.completed).clone();
        for peer in self.peers.values_mut() {
            let id = peer.id();
            if unchoked.contains(&id) {
                peer.unchoke();
                peer.optimistic_unchoked = self.unchoker.is_optimistic(&id);
            } else {
                peer.choke();
            }
        }
        self.start_piece_downloaders();
        self.start_info_downloaders();
    }

    // State publication

    fn status(&self) -> Status {
        if !self.running {
            Status::Stopped
        } else if self.metainfo.is_none() {
            Status::DownloadingMetadata
        } else if self.allocating {
            Status::Allocating
        } else if self.verifying {
            Status::Verifying
        } else if self.completed {
            Status::Seeding
        } else {
            Status::Downloading
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            event!(Level::DEBUG, torrent = %self.id, from = %current, to = %status, "Status changed");
            *current = status;
            true
        });
    }

    fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
        self.completed_tx.send_replace(completed);
    }

    fn replace_bitfield(&mut self, bitfield: Option<Bitfield>) {
        self.bitfield = bitfield;
        self.publish_bitfield();
    }

    fn publish_bitfield(&self) {
        *self
            .shared_bitfield
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = self.bitfield.clone();
    }

    async fn write_started(&self, started: bool) {
        if let Err(e) = self.resumer.write_started(&self.id, started).await {
            event!(Level::WARN, torrent = %self.id, error = %e, "Failed to persist started flag");
        }
    }

    async fn persist_bitfield(&self) {
        let Some(bitfield) = &self.bitfield else {
            return;
        };
        if let Err(e) = self
            .resumer
            .write_bitfield(&self.id, bitfield.bytes().to_vec())
            .await
        {
            event!(Level::WARN, torrent = %self.id, error = %e, "Failed to persist bitfield");
        }
    }

    async fn persist_stats(&self) {
        let stats = ResumeStats {
            bytes_downloaded: self.bytes_downloaded,
            bytes_uploaded: self.bytes_uploaded,
            bytes_wasted: self.bytes_wasted,
            seeded_for: self.seeded_for,
        };
        if let Err(e) = self.resumer.write_stats(&self.id, stats).await {
            event!(Level::WARN, torrent = %self.id, error = %e, "Failed to persist stats");
        }
    }

    fn bytes_completed(&self) -> u64 {
        let (Some(metainfo), Some(bitfield)) = (&self.metainfo, &self.bitfield) else {
            return 0;
        };
        let piece_length = metainfo.piece_length() as u64;
        let count = bitfield.len();
        let mut completed = bitfield.count() as u64 * piece_length;
        if count > 0 && bitfield.test(count - 1) {
            let last = metainfo.total_length() - (count as u64 - 1) * piece_length;
            completed = completed - piece_length + last;
        }
        completed
    }

    fn stats(&self) -> Stats {
        let status = self.status();
        let total_pieces = self.metainfo.as_ref().map_or(0, |m| m.num_pieces());
        let have = self.bitfield.as_ref().map_or(0, |b| b.count());
        let total_bytes = self.metainfo.as_ref().map_or(0, |m| m.total_length());
        let completed_bytes = self.bytes_completed();
        let incomplete = total_bytes.saturating_sub(completed_bytes);
        let download_rate = self.download_speed.rate();

        let incoming = self
            .peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Incoming)
            .count();
        let snubbed = self.snubbed_downloads.len();
        let choked = self.choked_downloads.len();
        let metadata_snubbed = self.snubbed_info_downloads.len();

        Stats {
            info_hash: info_hash_hex(&self.info_hash),
            status,
            error: self.last_error.as_ref().map(|e| e.to_string()),
            name: printable(&self.name),
            piece_length: self.metainfo.as_ref().map_or(0, |m| m.piece_length()),
            seeded_for: self.seeded_for,
            speed: SpeedStats {
                download: download_rate,
                upload: self.upload_speed.rate(),
            },
            eta: if status == Status::Downloading {
                eta(incomplete, download_rate)
            } else {
                None
            },
            pieces: PieceStats {
                checked: *self.checked_tx.borrow(),
                have,
                missing: total_pieces.saturating_sub(have),
                available: self.picker.as_ref().map_or(0, |p| p.available()),
                total: total_pieces,
            },
            bytes: ByteStats {
                completed: completed_bytes,
                incomplete,
                total: total_bytes,
                downloaded: self.bytes_downloaded,
                uploaded: self.bytes_uploaded,
                wasted: self.bytes_wasted,
                allocated: self.allocated,
            },
            peers: PeerStats {
                total: self.peers.len(),
                incoming,
                outgoing: self.peers.len() - incoming,
            },
            addresses: AddressStats {
                total: self.addr_list.len(),
                dht: self.addr_list.len_source(PeerSource::Dht),
                incoming: self.addr_list.len_source(PeerSource::Incoming),
                fixed: self.addr_list.len_source(PeerSource::Fixed),
            },
            downloads: DownloadStats {
                total: self.piece_downloaders.len(),
                running: self
                    .piece_downloaders
                    .len()
                    .saturating_sub(snubbed + choked),
                snubbed,
                choked,
            },
            metadata_downloads: MetadataDownloadStats {
                total: self.info_downloaders.len(),
                running: self
                    .info_downloaders
                    .len()
                    .saturating_sub(metadata_snubbed),
                snubbed: metadata_snubbed,
            },
        }
    }
}

fn send_metadata_request(peer: &PeerSession, ut_id: u8, piece: u32) {
    match encode_metadata_message(&MetadataMessage::request(piece), None) {
        Ok(payload) => peer.send(Message::Extended(ut_id, payload)),
        Err(e) => event!(Level::WARN, error = %e, "Failed to encode metadata request"),
    }
}

async fn recv_incoming(
    rx: &mut Option<mpsc::Receiver<IncomingStream>>,
) -> Option<IncomingStream> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::memory::{MemoryNetwork, MemoryNode};
    use crate::networking::protocol::{parse_message, write_message};
    use crate::resource_manager::tests::spawn_test_manager;
    use crate::resumer::{MemoryResumer, ResumeRecord};
    use crate::torrent_file::tests::single_file_info;
    use std::future::Future;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const PIECE_LEN: u32 = 16384;
    const WAIT: Duration = Duration::from_secs(10);

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn metainfo(name: &str, data: &[u8]) -> Metainfo {
        Metainfo::from_info(single_file_info(name, PIECE_LEN, data)).unwrap()
    }

    struct TestTorrent {
        handle: TorrentHandle,
        resumer: Arc<MemoryResumer>,
        node: MemoryNode,
        dir: TempDir,
    }

    impl TestTorrent {
        fn id(&self) -> String {
            self.handle.id().to_string()
        }

        fn data_path(&self, metainfo: &Metainfo) -> PathBuf {
            MultiFileInfo::new(self.dir.path(), &metainfo.info).files[0]
                .path
                .clone()
        }
    }

    /// Spawns a torrent loop on its own in-memory node. With `seed` the content is
    /// written to disk first and announced as complete.
    async fn spawn_torrent(
        network: &MemoryNetwork,
        node_id: u8,
        info_hash: InfoHash,
        metainfo: Option<Metainfo>,
        seed: Option<&[u8]>,
        stop_after_download: bool,
        fixed_peers: Vec<PeerAddrInfo>,
    ) -> TestTorrent {
        let dir = tempfile::tempdir().unwrap();
        let node = network.node(PeerId([node_id; 20]));

        let mut bitfield = None;
        if let (Some(m), Some(data)) = (&metainfo, seed) {
            let layout = MultiFileInfo::new(dir.path(), &m.info);
            tokio::fs::write(&layout.files[0].path, data).await.unwrap();
            let mut bf = Bitfield::new(m.num_pieces());
            bf.set_all();
            bitfield = Some(bf);
        }

        let id = info_hash_hex(&info_hash);
        let resumer = Arc::new(MemoryResumer::new());
        let record = ResumeRecord {
            info_hash: info_hash.to_vec(),
            data_dir: dir.path().display().to_string(),
            ..Default::default()
        };
        resumer.write(&id, &record).await.unwrap();

        let settings = Settings {
            unchoke_interval_secs: 1,
            discovery_interval_secs: 1,
            ..Settings::default()
        };
        let (manager, handle) = TorrentManager::new(TorrentParameters {
            id,
            info_hash,
            name: String::new(),
            metainfo,
            bitfield,
            data_dir: dir.path().to_path_buf(),
            stop_after_download,
            initial_stats: ResumeStats::default(),
            fixed_peers,
            settings: Arc::new(settings),
            transport: Arc::new(node.clone()),
            discovery: Arc::new(node.clone()),
            resumer: resumer.clone(),
            resource_manager: spawn_test_manager(),
            limits: RateLimits::unlimited(),
        });
        tokio::spawn(manager.run());
        TestTorrent {
            handle,
            resumer,
            node,
            dir,
        }
    }

    async fn wait_status(handle: &TorrentHandle, status: Status) {
        let mut rx = handle.subscribe_status();
        let reached = matches!(timeout(WAIT, rx.wait_for(|s| *s == status)).await, Ok(Ok(_)));
        assert!(
            reached,
            "status {status} not reached, still {}",
            handle.status()
        );
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + WAIT;
        while !check().await {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_fresh_torrent_skips_verification() {
        let network = MemoryNetwork::new();
        let m = metainfo("fresh.bin", &content(4 * PIECE_LEN as usize));
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), None, false, vec![]).await;

        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Downloading).await;

        let bitfield = t.handle.bitfield().unwrap();
        assert_eq!(bitfield.len(), 4);
        assert_eq!(bitfield.count(), 0);

        let stats = t.handle.stats().await.unwrap();
        assert_eq!(stats.pieces.checked, 0);
        assert_eq!(stats.pieces.total, 4);
        assert_eq!(stats.bytes.total, 4 * PIECE_LEN as u64);
        assert_eq!(stats.bytes.completed, 0);
        assert_eq!(stats.name, "fresh.bin");
        assert!(stats.error.is_none());

        let record = t.resumer.read(&t.id()).await.unwrap();
        assert!(record.started);
        assert_eq!(record.bitfield, vec![0]);
        assert!(t.data_path(&m).exists());

        t.handle.close().await;
        assert_eq!(t.handle.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn test_bad_piece_closes_peer_and_counts_waste() {
        let network = MemoryNetwork::new();
        let m = metainfo("bad.bin", &content(4 * PIECE_LEN as usize));
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), None, false, vec![]).await;
        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Downloading).await;

        let fake = network.node(PeerId([2; 20]));
        let mut stream = fake
            .open_stream(&t.node.local_peer(), &protocol_tag(&m.info_hash))
            .await
            .unwrap();
        write_message(&mut stream, &Message::HaveAll).await.unwrap();
        write_message(&mut stream, &Message::Unchoke).await.unwrap();

        let (index, begin, length) = loop {
            if let Message::Request(index, begin, length) =
                parse_message(&mut stream, MAX_FRAME_LEN).await.unwrap()
            {
                break (index, begin, length);
            }
        };
        let garbage = Message::Piece(index, begin, vec![0xAB; length as usize]);
        write_message(&mut stream, &garbage).await.unwrap();

        eventually(|| {
            let handle = t.handle.clone();
            async move { handle.stats().await.unwrap().peers.total == 0 }
        })
        .await;

        let stats = t.handle.stats().await.unwrap();
        assert_eq!(stats.bytes.wasted, length as u64);
        assert_eq!(stats.bytes.downloaded, length as u64);
        assert_eq!(stats.pieces.have, 0);
        assert_eq!(t.handle.bitfield().unwrap().count(), 0);
        assert_eq!(t.handle.status(), Status::Downloading);

        // The torrent hung up on us.
        loop {
            if parse_message(&mut stream, MAX_FRAME_LEN).await.is_err() {
                break;
            }
        }
        t.handle.close().await;
    }

    #[tokio::test]
    async fn test_peer_announcing_twice_before_metadata_is_closed() {
        let network = MemoryNetwork::new();
        let m = metainfo("early.bin", &content(2 * PIECE_LEN as usize));
        let t = spawn_torrent(&network, 1, m.info_hash, None, None, false, vec![]).await;
        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::DownloadingMetadata).await;

        let fake = network.node(PeerId([2; 20]));
        let mut stream = fake
            .open_stream(&t.node.local_peer(), &protocol_tag(&m.info_hash))
            .await
            .unwrap();
        for _ in 0..100 {
            write_message(&mut stream, &Message::Have(1)).await.unwrap();
        }
        write_message(&mut stream, &Message::HaveAll).await.unwrap();
        write_message(&mut stream, &Message::HaveAll).await.unwrap();

        while parse_message(&mut stream, MAX_FRAME_LEN).await.is_ok() {}
        eventually(|| {
            let handle = t.handle.clone();
            async move { handle.stats().await.unwrap().peers.total == 0 }
        })
        .await;
        assert_eq!(t.handle.status(), Status::DownloadingMetadata);
        t.handle.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_incoming_stream_is_refused() {
        let network = MemoryNetwork::new();
        let m = metainfo("dup.bin", &content(2 * PIECE_LEN as usize));
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), None, false, vec![]).await;
        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Downloading).await;

        let fake = network.node(PeerId([2; 20]));
        let tag = protocol_tag(&m.info_hash);
        let mut first = fake.open_stream(&t.node.local_peer(), &tag).await.unwrap();
        assert_eq!(
            parse_message(&mut first, MAX_FRAME_LEN).await.unwrap(),
            Message::HaveNone
        );

        let mut second = fake.open_stream(&t.node.local_peer(), &tag).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        let stats = t.handle.stats().await.unwrap();
        assert_eq!(stats.peers.total, 1);
        assert_eq!(stats.peers.incoming, 1);
        t.handle.close().await;
    }

    #[tokio::test]
    async fn test_download_from_seeder_stops_after_download() {
        let network = MemoryNetwork::new();
        let data = content(5 * PIECE_LEN as usize - 1000);
        let m = metainfo("movie.bin", &data);

        let seeder = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), Some(&data), false, vec![]).await;
        seeder.handle.start().await.unwrap();
        wait_status(&seeder.handle, Status::Seeding).await;

        let leecher = spawn_torrent(
            &network,
            2,
            m.info_hash,
            Some(m.clone()),
            None,
            true,
            vec![seeder.node.local_peer()],
        )
        .await;
        leecher.handle.start().await.unwrap();
        timeout(WAIT, leecher.handle.wait_complete())
            .await
            .unwrap()
            .unwrap();
        wait_status(&leecher.handle, Status::Stopped).await;

        assert_eq!(tokio::fs::read(leecher.data_path(&m)).await.unwrap(), data);
        let stats = leecher.handle.stats().await.unwrap();
        assert_eq!(stats.status, Status::Stopped);
        assert_eq!(stats.pieces.have, 5);
        assert_eq!(stats.bytes.completed, data.len() as u64);
        assert_eq!(stats.bytes.downloaded, data.len() as u64);
        assert_eq!(stats.bytes.wasted, 0);

        let record = leecher.resumer.read(&leecher.id()).await.unwrap();
        assert!(!record.started);
        assert!(Bitfield::from_bytes(&record.bitfield, 5).unwrap().all());
        assert_eq!(record.bytes_downloaded, data.len() as u64);

        eventually(|| {
            let handle = seeder.handle.clone();
            async move { handle.stats().await.unwrap().bytes.uploaded > 0 }
        })
        .await;
        seeder.handle.close().await;
        leecher.handle.close().await;
    }

    #[tokio::test]
    async fn test_restarting_complete_torrent_stops_after_download_again() {
        let network = MemoryNetwork::new();
        let data = content(2 * PIECE_LEN as usize);
        let m = metainfo("done.bin", &data);
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), Some(&data), true, vec![]).await;

        for _ in 0..2 {
            let mut status = t.handle.subscribe_status();
            status.borrow_and_update();
            t.handle.start().await.unwrap();
            timeout(WAIT, status.changed()).await.unwrap().unwrap();
            wait_status(&t.handle, Status::Stopped).await;

            assert!(t.handle.is_complete());
            let stats = t.handle.stats().await.unwrap();
            assert_eq!(stats.status, Status::Stopped);
            assert_eq!(stats.pieces.have, 2);
            assert!(!t.resumer.read(&t.id()).await.unwrap().started);
        }
        t.handle.close().await;
    }

    #[tokio::test]
    async fn test_magnet_start_fetches_metadata_from_peer() {
        let network = MemoryNetwork::new();
        let data = content(3 * PIECE_LEN as usize);
        let m = metainfo("magnet.bin", &data);

        let seeder = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), Some(&data), false, vec![]).await;
        seeder.handle.start().await.unwrap();
        wait_status(&seeder.handle, Status::Seeding).await;

        let leecher = spawn_torrent(
            &network,
            2,
            m.info_hash,
            None,
            None,
            false,
            vec![seeder.node.local_peer()],
        )
        .await;
        assert_eq!(leecher.handle.stats().await.unwrap().name, "");
        leecher.handle.start().await.unwrap();
        wait_status(&leecher.handle, Status::Seeding).await;

        let stats = leecher.handle.stats().await.unwrap();
        assert_eq!(stats.name, "magnet.bin");
        assert_eq!(stats.pieces.have, 3);
        assert_eq!(stats.metadata_downloads.total, 0);

        let record = leecher.resumer.read(&leecher.id()).await.unwrap();
        assert_eq!(record.info, m.info_bytes);
        assert_eq!(record.name, "magnet.bin");
        assert_eq!(tokio::fs::read(leecher.data_path(&m)).await.unwrap(), data);

        seeder.handle.close().await;
        leecher.handle.close().await;
    }

    #[tokio::test]
    async fn test_verify_command_rechecks_data_and_stops() {
        let network = MemoryNetwork::new();
        let data = content(3 * PIECE_LEN as usize);
        let m = metainfo("check.bin", &data);
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), Some(&data), false, vec![]).await;
        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Seeding).await;

        let mut corrupted = data.clone();
        corrupted[PIECE_LEN as usize + 10] ^= 0xFF;
        tokio::fs::write(t.data_path(&m), &corrupted).await.unwrap();

        t.handle.verify().await.unwrap();
        eventually(|| {
            let handle = t.handle.clone();
            async move {
                handle.status() == Status::Stopped
                    && handle.bitfield().is_some_and(|bf| bf.count() == 2)
            }
        })
        .await;

        let bitfield = t.handle.bitfield().unwrap();
        assert!(bitfield.test(0) && !bitfield.test(1) && bitfield.test(2));
        let stats = t.handle.stats().await.unwrap();
        assert_eq!(stats.pieces.checked, 3);
        assert!(stats.error.is_none());
        assert!(!t.resumer.read(&t.id()).await.unwrap().started);
        t.handle.close().await;
    }

    #[tokio::test]
    async fn test_stop_and_restart_trusts_saved_bitfield() {
        let network = MemoryNetwork::new();
        let data = content(2 * PIECE_LEN as usize);
        let m = metainfo("restart.bin", &data);
        let t = spawn_torrent(&network, 1, m.info_hash, Some(m.clone()), Some(&data), false, vec![]).await;

        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Seeding).await;
        t.handle.stop().await.unwrap();
        wait_status(&t.handle, Status::Stopped).await;
        assert!(!t.resumer.read(&t.id()).await.unwrap().started);

        t.handle.start().await.unwrap();
        wait_status(&t.handle, Status::Seeding).await;
        let stats = t.handle.stats().await.unwrap();
        assert_eq!(stats.pieces.checked, 0);
        assert_eq!(stats.pieces.have, 2);
        t.handle.close().await;
    }
}
