// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::bitfield::Bitfield;
use crate::errors::ProtocolError;
use crate::networking::connection::{BlockReader, BlockRequester, ConnectionType, PeerConnection};
use crate::networking::protocol::{BlockInfo, ExtendedHandshakePayload, Message};
use crate::networking::transport::PeerId;
use crate::torrent_manager::stats::SpeedMeter;

/// Messages a peer may have queued before metadata is known.
pub const MAX_PENDING_MESSAGES: usize = 4096;

/// Protocol and bookkeeping state for one connected peer. Owned by the torrent loop;
/// the underlying [`PeerConnection`] only moves bytes.
pub struct PeerSession {
    conn: PeerConnection,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub optimistic_unchoked: bool,

    /// Set when the snub timer fired and cleared once the peer delivers again.
    pub snubbed: bool,
    /// Piece this peer is downloading for us, if any.
    pub downloading: Option<u32>,
    /// Metadata transfer in progress with this peer.
    pub downloading_metadata: bool,
    /// The peer rejected a metadata request; it is not asked again.
    pub metadata_rejected: bool,
    /// Waiting on the RAM budget before a piece download can start.
    pub awaiting_ram: bool,

    /// `None` until the peer announced what it has.
    pub bitfield: Option<Bitfield>,
    pub extension_handshake: Option<ExtendedHandshakePayload>,
    /// Pieces the peer lets us download while choked.
    pub allowed_fast: HashSet<u32>,
    /// Messages that need piece counts, held until metadata is known.
    pub pending_messages: Vec<Message>,

    pub download_speed: SpeedMeter,
    pub upload_speed: SpeedMeter,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_wasted: u64,
}

impl PeerSession {
    pub fn new(conn: PeerConnection) -> Self {
        Self {
            conn,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            optimistic_unchoked: false,
            snubbed: false,
            downloading: None,
            downloading_metadata: false,
            metadata_rejected: false,
            awaiting_ram: false,
            bitfield: None,
            extension_handshake: None,
            allowed_fast: HashSet::new(),
            pending_messages: Vec::new(),
            download_speed: SpeedMeter::default(),
            upload_speed: SpeedMeter::default(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            bytes_wasted: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.conn.id()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn.connection_type()
    }

    pub fn conn(&self) -> &PeerConnection {
        &self.conn
    }

    pub fn send(&self, message: Message) {
        self.conn.send(message);
    }

    /// Holds a message until the piece count is known. Repeats, and haves covered by a
    /// queued have-all, are dropped.
    pub fn queue_pending(&mut self, message: Message) -> Result<(), ProtocolError> {
        let announces =
            |m: &Message| matches!(m, Message::Bitfield(_) | Message::HaveAll | Message::HaveNone);
        let queued = &mut self.pending_messages;
        if announces(&message) && queued.iter().any(announces) {
            return Err(ProtocolError::Malformed {
                kind: "bitfield",
                detail: "pieces announced twice".into(),
            });
        }
        if queued.contains(&message)
            || (matches!(message, Message::Have(_)) && queued.contains(&Message::HaveAll))
        {
            return Ok(());
        }
        if queued.len() >= MAX_PENDING_MESSAGES {
            return Err(ProtocolError::Malformed {
                kind: "queued",
                detail: format!("more than {MAX_PENDING_MESSAGES} messages before metadata"),
            });
        }
        queued.push(message);
        Ok(())
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.as_ref().is_some_and(|bf| bf.test(index))
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extension_handshake
            .as_ref()
            .and_then(|hs| hs.ut_metadata_id())
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.extension_handshake
            .as_ref()
            .and_then(|hs| hs.metadata_size)
            .filter(|size| *size > 0)
            .map(|size| size as u64)
    }

    /// Outstanding request budget: the peer's advertised queue depth when present.
    pub fn max_allowed_requests(&self, default: usize, max: usize) -> usize {
        let reqq = self
            .extension_handshake
            .as_ref()
            .and_then(|hs| hs.reqq)
            .unwrap_or(0)
            .max(0) as usize;
        let n = if reqq > 0 { reqq } else { default };
        n.clamp(1, max.max(1))
    }

    pub fn choke(&mut self) {
        if !self.am_choking {
            self.am_choking = true;
            self.optimistic_unchoked = false;
            self.send(Message::Choke);
        }
    }

    pub fn unchoke(&mut self) {
        if self.am_choking {
            self.am_choking = false;
            self.send(Message::Unchoke);
        }
    }

    pub fn set_interested(&mut self, interested: bool) {
        if self.am_interested != interested {
            self.am_interested = interested;
            self.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    pub fn upload(&self, block: BlockInfo, reader: Arc<dyn BlockReader>) {
        self.conn.send_piece(block, reader);
    }

    pub fn cancel_upload(&self, block: BlockInfo) -> bool {
        self.conn.cancel_piece(block)
    }

    pub fn start_snub_timer(&self) {
        self.conn.start_snub_timer();
    }

    pub fn stop_snub_timer(&self) {
        self.conn.stop_snub_timer();
    }

    pub fn tick_speed(&mut self, dt: Duration) {
        self.download_speed.tick(dt);
        self.upload_speed.tick(dt);
    }

    pub async fn close(self) {
        self.conn.close().await;
    }
}

impl BlockRequester for PeerSession {
    fn request_block(&self, block: BlockInfo) {
        self.conn.request_block(block);
    }

    fn cancel_block(&self, block: BlockInfo) {
        self.conn.cancel_block(block);
    }
}
