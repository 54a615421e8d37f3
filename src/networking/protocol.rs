// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::ProtocolError;

pub const BLOCK_SIZE: u32 = 16384;
pub const METADATA_PIECE_SIZE: u32 = 16384;

/// Largest frame accepted from a peer. Covers a piece block plus headers and the
/// bitfield of any torrent with fewer than ~16M pieces.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, EnumIter)]
pub enum ClientExtendedId {
    Handshake = 0,
    UtMetadata = 2,
}

impl ClientExtendedId {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientExtendedId::Handshake => "handshake",
            ClientExtendedId::UtMetadata => "ut_metadata",
        }
    }

    /// The `m` dictionary we advertise.
    pub fn advertised() -> HashMap<String, u8> {
        ClientExtendedId::iter()
            .filter(|&variant| variant != ClientExtendedId::Handshake)
            .map(|variant| (variant.as_str().to_string(), variant.id()))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExtendedHandshakePayload {
    #[serde(default)]
    pub m: HashMap<String, u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,

    /// Number of outstanding requests the sender accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    /// Our address as seen by the sender, 4 or 16 bytes.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub yourip: Option<Vec<u8>>,
}

impl ExtendedHandshakePayload {
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m
            .get(ClientExtendedId::UtMetadata.as_str())
            .copied()
            .filter(|&id| id != 0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct MetadataMessage {
    /// 0 for request, 1 for data, 2 for reject.
    pub msg_type: u8,

    pub piece: u32,

    /// Only included in data messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request as u8,
            piece,
            total_size: None,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject as u8,
            piece,
            total_size: None,
        }
    }

    pub fn data(piece: u32, total_size: u64) -> Self {
        Self {
            msg_type: MetadataMessageType::Data as u8,
            piece,
            total_size: Some(total_size),
        }
    }
}

/// Bencoded header, followed by the raw piece bytes for data messages.
pub fn encode_metadata_message(
    msg: &MetadataMessage,
    data: Option<&[u8]>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = serde_bencode::to_bytes(msg)?;
    if let Some(data) = data {
        payload.extend_from_slice(data);
    }
    Ok(payload)
}

pub fn decode_metadata_message(payload: &[u8]) -> Result<(MetadataMessage, &[u8]), ProtocolError> {
    let header_len = bencode_value_len(payload).ok_or_else(|| ProtocolError::Malformed {
        kind: "ut_metadata",
        detail: "unterminated bencode header".into(),
    })?;
    let msg: MetadataMessage = serde_bencode::from_bytes(&payload[..header_len])?;
    Ok((msg, &payload[header_len..]))
}

/// Length of the first complete bencode value in `buf`.
fn bencode_value_len(buf: &[u8]) -> Option<usize> {
    fn skip(buf: &[u8], pos: usize, depth: usize) -> Option<usize> {
        if depth > 64 {
            return None;
        }
        match *buf.get(pos)? {
            b'i' => {
                let end = buf[pos..].iter().position(|&b| b == b'e')?;
                Some(pos + end + 1)
            }
            b'l' | b'd' => {
                let mut cur = pos + 1;
                while *buf.get(cur)? != b'e' {
                    cur = skip(buf, cur, depth + 1)?;
                }
                Some(cur + 1)
            }
            b'0'..=b'9' => {
                let colon = buf[pos..].iter().position(|&b| b == b':')?;
                let len: usize = std::str::from_utf8(&buf[pos..pos + colon]).ok()?.parse().ok()?;
                let end = pos + colon + 1 + len;
                (end <= buf.len()).then_some(end)
            }
            _ => None,
        }
    }
    skip(buf, 0, 0)
}

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    HaveAll,
    HaveNone,
    Reject(u32, u32, u32),
    AllowedFast(u32),
    Extended(u8, Vec<u8>),
}

pub struct MessageSummary<'a>(pub &'a Message);
impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Bitfield(bitfield) => {
                write!(f, "BITFIELD(len: {})", bitfield.len())
            }
            Message::Piece(index, begin, data) => {
                write!(
                    f,
                    "PIECE(index: {}, begin: {}, len: {})",
                    index,
                    begin,
                    data.len()
                )
            }
            Message::Extended(id, payload) => {
                write!(f, "EXTENDED(id: {}, len: {})", id, payload.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Requests are identified by their (index, begin, length) triple.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Blocks of a piece in offset order; the last one may be short.
pub fn calculate_blocks_for_piece(piece_index: u32, piece_size: u32) -> Vec<BlockInfo> {
    let mut blocks = Vec::with_capacity(piece_size.div_ceil(BLOCK_SIZE) as usize);
    let mut current_offset = 0;
    while current_offset < piece_size {
        let block_length = std::cmp::min(BLOCK_SIZE, piece_size - current_offset);
        blocks.push(BlockInfo {
            piece_index,
            offset: current_offset,
            length: block_length,
        });
        current_offset += block_length;
    }
    blocks
}

fn fixed(id: u8, fields: &[u32]) -> Vec<u8> {
    let len = 1 + 4 * fields.len() as u32;
    let mut bytes = Vec::with_capacity(4 + len as usize);
    bytes.extend(len.to_be_bytes());
    bytes.push(id);
    for field in fields {
        bytes.extend(field.to_be_bytes());
    }
    bytes
}

fn framed(id: u8, header: &[u32], body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = 1 + 4 * header.len() + body.len();
    let len: u32 = len
        .try_into()
        .map_err(|_| ProtocolError::Oversize(u32::MAX))?;
    let mut bytes = Vec::with_capacity(4 + len as usize);
    bytes.extend(len.to_be_bytes());
    bytes.push(id);
    for field in header {
        bytes.extend(field.to_be_bytes());
    }
    bytes.extend_from_slice(body);
    Ok(bytes)
}

pub fn generate_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    match message {
        Message::KeepAlive => Ok(vec![0, 0, 0, 0]),
        Message::Choke => Ok(fixed(0, &[])),
        Message::Unchoke => Ok(fixed(1, &[])),
        Message::Interested => Ok(fixed(2, &[])),
        Message::NotInterested => Ok(fixed(3, &[])),
        Message::Have(index) => Ok(fixed(4, &[*index])),
        Message::Bitfield(bitfield) => framed(5, &[], bitfield),
        Message::Request(index, begin, length) => Ok(fixed(6, &[*index, *begin, *length])),
        Message::Piece(index, begin, block) => framed(7, &[*index, *begin], block),
        Message::Cancel(index, begin, length) => Ok(fixed(8, &[*index, *begin, *length])),
        Message::HaveAll => Ok(fixed(0x0E, &[])),
        Message::HaveNone => Ok(fixed(0x0F, &[])),
        Message::Reject(index, begin, length) => Ok(fixed(0x10, &[*index, *begin, *length])),
        Message::AllowedFast(index) => Ok(fixed(0x11, &[*index])),
        Message::Extended(extended_id, payload) => {
            let mut body = Vec::with_capacity(1 + payload.len());
            body.push(*extended_id);
            body.extend_from_slice(payload);
            framed(20, &[], &body)
        }
    }
}

pub fn extended_handshake_message(
    payload: &ExtendedHandshakePayload,
) -> Result<Message, ProtocolError> {
    Ok(Message::Extended(
        ClientExtendedId::Handshake.id(),
        serde_bencode::to_bytes(payload)?,
    ))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = generate_message(message)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn expect_len(kind: &'static str, payload: &[u8], len: usize) -> Result<(), ProtocolError> {
    if payload.len() != len {
        return Err(ProtocolError::Malformed {
            kind,
            detail: format!("expected {} payload bytes, got {}", len, payload.len()),
        });
    }
    Ok(())
}

/// Decodes one message from the frame body (id byte plus payload).
pub fn decode_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
    let Some((&id, payload)) = frame.split_first() else {
        return Ok(Message::KeepAlive);
    };
    let triple = |kind: &'static str| -> Result<(u32, u32, u32), ProtocolError> {
        expect_len(kind, payload, 12)?;
        Ok((
            read_u32(payload, 0),
            read_u32(payload, 4),
            read_u32(payload, 8),
        ))
    };
    match id {
        0 => expect_len("choke", payload, 0).map(|_| Message::Choke),
        1 => expect_len("unchoke", payload, 0).map(|_| Message::Unchoke),
        2 => expect_len("interested", payload, 0).map(|_| Message::Interested),
        3 => expect_len("not interested", payload, 0).map(|_| Message::NotInterested),
        4 => {
            expect_len("have", payload, 4)?;
            Ok(Message::Have(read_u32(payload, 0)))
        }
        5 => Ok(Message::Bitfield(payload.to_vec())),
        6 => triple("request").map(|(i, b, l)| Message::Request(i, b, l)),
        7 => {
            if payload.len() < 8 {
                return Err(ProtocolError::Malformed {
                    kind: "piece",
                    detail: format!("{} byte payload", payload.len()),
                });
            }
            Ok(Message::Piece(
                read_u32(payload, 0),
                read_u32(payload, 4),
                payload[8..].to_vec(),
            ))
        }
        8 => triple("cancel").map(|(i, b, l)| Message::Cancel(i, b, l)),
        0x0E => expect_len("have all", payload, 0).map(|_| Message::HaveAll),
        0x0F => expect_len("have none", payload, 0).map(|_| Message::HaveNone),
        0x10 => triple("reject").map(|(i, b, l)| Message::Reject(i, b, l)),
        0x11 => {
            expect_len("allowed fast", payload, 4)?;
            Ok(Message::AllowedFast(read_u32(payload, 0)))
        }
        20 => {
            let Some((&extended_id, body)) = payload.split_first() else {
                return Err(ProtocolError::Malformed {
                    kind: "extended",
                    detail: "missing extended id".into(),
                });
            };
            Ok(Message::Extended(extended_id, body.to_vec()))
        }
        other => Err(ProtocolError::UnknownMessage(other)),
    }
}

pub async fn parse_message<R>(reader: &mut R, max_len: u32) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let message_len = u32::from_be_bytes(len_buf);
    if message_len == 0 {
        return Ok(Message::KeepAlive);
    }
    if message_len > max_len {
        return Err(ProtocolError::Oversize(message_len));
    }
    let mut frame = vec![0u8; message_len as usize];
    reader.read_exact(&mut frame).await?;
    decode_frame(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn assert_message_roundtrip(msg: Message) {
        let bytes = generate_message(&msg).unwrap();
        let mut reader = &bytes[..];
        let parsed = parse_message(&mut reader, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(msg, parsed);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_fast_extension_messages() {
        assert_eq!(generate_message(&Message::HaveAll).unwrap(), vec![0, 0, 0, 1, 0x0E]);
        assert_eq!(generate_message(&Message::HaveNone).unwrap(), vec![0, 0, 0, 1, 0x0F]);
        assert_message_roundtrip(Message::Reject(3, 16384, 16384)).await;
        assert_message_roundtrip(Message::AllowedFast(42)).await;
    }

    #[tokio::test]
    async fn test_piece_and_bitfield_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let block = vec![9u8; 300];
        write_message(&mut a, &Message::Piece(1, 16384, block.clone()))
            .await
            .unwrap();
        write_message(&mut a, &Message::Bitfield(vec![0b1010_0000]))
            .await
            .unwrap();
        write_message(&mut a, &Message::KeepAlive).await.unwrap();

        assert_eq!(
            parse_message(&mut b, MAX_FRAME_LEN).await.unwrap(),
            Message::Piece(1, 16384, block)
        );
        assert_eq!(
            parse_message(&mut b, MAX_FRAME_LEN).await.unwrap(),
            Message::Bitfield(vec![0b1010_0000])
        );
        assert_eq!(
            parse_message(&mut b, MAX_FRAME_LEN).await.unwrap(),
            Message::KeepAlive
        );
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        bytes.push(7);
        let mut reader = &bytes[..];
        assert!(matches!(
            parse_message(&mut reader, MAX_FRAME_LEN).await,
            Err(ProtocolError::Oversize(_))
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            decode_frame(&[4, 0, 0]),
            Err(ProtocolError::Malformed { kind: "have", .. })
        ));
        assert!(matches!(
            decode_frame(&[6, 0, 0, 0, 1]),
            Err(ProtocolError::Malformed { kind: "request", .. })
        ));
        assert!(matches!(
            decode_frame(&[99]),
            Err(ProtocolError::UnknownMessage(99))
        ));
        assert!(decode_frame(&[20]).is_err());
    }

    #[tokio::test]
    async fn test_eof_is_an_io_error() {
        let bytes = [0u8, 0, 0, 5, 4, 0];
        let mut reader = &bytes[..];
        assert!(matches!(
            parse_message(&mut reader, MAX_FRAME_LEN).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn test_extended_handshake_payload() {
        let payload = ExtendedHandshakePayload {
            m: ClientExtendedId::advertised(),
            metadata_size: Some(12345),
            reqq: Some(250),
            v: Some("swarmseedr".into()),
            yourip: Some(vec![127, 0, 0, 1]),
        };
        let msg = extended_handshake_message(&payload).unwrap();
        let Message::Extended(id, bytes) = msg else {
            panic!("expected extended message");
        };
        assert_eq!(id, 0);
        let decoded: ExtendedHandshakePayload = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.ut_metadata_id(), Some(2));
        assert!(!decoded.m.contains_key("handshake"));

        let minimal: ExtendedHandshakePayload = serde_bencode::from_bytes(b"de").unwrap();
        assert!(minimal.ut_metadata_id().is_none());
        assert!(minimal.reqq.is_none());
    }

    #[test]
    fn test_metadata_data_message_keeps_trailing_bytes() {
        let msg = MetadataMessage::data(1, 20000);
        let payload = encode_metadata_message(&msg, Some(b"d4:name3:fooe")).unwrap();
        let (decoded, data) = decode_metadata_message(&payload).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(data, b"d4:name3:fooe");

        let request = encode_metadata_message(&MetadataMessage::request(3), None).unwrap();
        let (req, rest) = decode_metadata_message(&request).unwrap();
        assert_eq!(req.msg_type, MetadataMessageType::Request as u8);
        assert_eq!(req.piece, 3);
        assert!(rest.is_empty());

        assert!(decode_metadata_message(b"d8:msg_typei1e").is_err());
    }

    #[test]
    fn test_blocks_for_piece() {
        let blocks = calculate_blocks_for_piece(2, 40000);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].offset, 32768);
        assert_eq!(blocks[2].length, 40000 - 32768);
        assert!(calculate_blocks_for_piece(0, 0).is_empty());
    }
}
