//! Peer wire protocol
//!
//! The BitTorrent peer protocol as defined in BEP 3: the 68-byte handshake
//! binding a TCP connection to an info-hash, followed by length-prefixed
//! typed messages. This module owns message encoding/decoding, connection
//! setup with deadlines, and the per-peer record shared with the tracker
//! state.

use std::time::Duration;

use bitvec::prelude::*;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::metainfo::Sha1Hash;
use crate::error::{Error, Result};

/// Protocol string for the handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake for the standard protocol string
pub const HANDSHAKE_SIZE: usize = 68; // 1 + 19 + 8 + 20 + 20

/// Largest block a REQUEST may ask for or a PIECE may carry (16 KiB)
pub const MAX_BLOCK: u32 = 1 << 14;

/// Cap on the frame length prefix. Twice the block limit plus the PIECE
/// header; anything larger is treated as hostile.
pub const MAX_FRAME: usize = 2 * MAX_BLOCK as usize + 9;

/// Deadline covering dial plus the full handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolling idle deadline on post-handshake reads, reset by any message
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How often a quiet session sends KEEPALIVE
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Write deadline for outgoing messages
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// One peer as known to the tracker state.
///
/// The record outlives any single connection: after a session dies the
/// torrent-handler may spawn a fresh peer-handler for the same record.
/// Only `pieces` is shared across tasks and needs the lock; the choke and
/// interest flags live in the session that owns the connection.
#[derive(Debug)]
pub struct PeerRecord {
    /// IP address or hostname as reported by the tracker
    pub host: String,
    /// Port in [1, 65535]
    pub port: u16,
    /// What the remote has advertised via BITFIELD/HAVE. Empty until a
    /// session sizes it for the torrent.
    pub pieces: Mutex<BitVec<u8, Msb0>>,
}

impl PeerRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            pieces: Mutex::new(BitVec::new()),
        }
    }

    /// The `"host:port"` key used in supervision maps. IPv6 addresses are
    /// wrapped in brackets.
    pub fn key(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether the remote advertises a piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces
            .lock()
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }
}

/// Peer wire protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep connection alive (zero length prefix, no id)
    KeepAlive,
    /// Stop honouring REQUESTs from the remote
    Choke,
    /// Resume honouring REQUESTs
    Unchoke,
    /// This side wants data from the remote
    Interested,
    /// This side wants nothing
    NotInterested,
    /// The sender now has a piece
    Have { index: u32 },
    /// The sender's full piece bitfield, MSB-first packing
    Bitfield { bitfield: Vec<u8> },
    /// Ask for a block
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw an earlier REQUEST
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port advertisement; accepted and ignored
    Port { port: u16 },
}

impl PeerMessage {
    /// Wire id of the message, `None` for KEEPALIVE
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel { .. } => Some(8),
            Self::Port { .. } => Some(9),
        }
    }

    /// Encode as `<length:4 BE><id:1><payload>`
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }

    /// Decode from a frame body (length prefix already stripped).
    ///
    /// Peer identity on returned errors is filled in by the caller via
    /// [`Error::with_peer`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        let fixed = |want: usize, name: &str| -> Result<()> {
            if payload.len() != want {
                Err(Error::protocol_violation(
                    "",
                    format!("{} payload is {} bytes, expected {}", name, payload.len(), want),
                ))
            } else {
                Ok(())
            }
        };

        match id {
            0 => {
                fixed(0, "CHOKE")?;
                Ok(Self::Choke)
            }
            1 => {
                fixed(0, "UNCHOKE")?;
                Ok(Self::Unchoke)
            }
            2 => {
                fixed(0, "INTERESTED")?;
                Ok(Self::Interested)
            }
            3 => {
                fixed(0, "NOT_INTERESTED")?;
                Ok(Self::NotInterested)
            }

            4 => {
                fixed(4, "HAVE")?;
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Self::Have { index })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                fixed(12, "REQUEST")?;
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let length = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
                if length > 2 * MAX_BLOCK {
                    return Err(Error::protocol_violation(
                        "",
                        format!("REQUEST length {} exceeds {}", length, 2 * MAX_BLOCK),
                    ));
                }
                Ok(Self::Request {
                    index,
                    begin,
                    length,
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(Error::protocol_violation(
                        "",
                        format!("PIECE payload is {} bytes, expected >= 8", payload.len()),
                    ));
                }
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let block = payload[8..].to_vec();
                if block.len() > 2 * MAX_BLOCK as usize {
                    return Err(Error::protocol_violation(
                        "",
                        format!("PIECE block of {} bytes exceeds {}", block.len(), 2 * MAX_BLOCK),
                    ));
                }
                Ok(Self::Piece {
                    index,
                    begin,
                    block,
                })
            }

            8 => {
                fixed(12, "CANCEL")?;
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let length = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
                Ok(Self::Cancel {
                    index,
                    begin,
                    length,
                })
            }

            9 => {
                fixed(2, "PORT")?;
                let port = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(Self::Port { port })
            }

            _ => Err(Error::protocol_violation(
                "",
                format!("unknown message id {}", id),
            )),
        }
    }
}

/// An established, handshaken connection to one peer
pub struct PeerConnection {
    reader: PeerReader,
    writer: PeerWriter,
}

/// Read half of a peer connection, owned by the session's reader task
pub struct PeerReader {
    half: OwnedReadHalf,
    peer: String,
    buf: BytesMut,
}

/// Write half of a peer connection
pub struct PeerWriter {
    half: OwnedWriteHalf,
    peer: String,
}

impl PeerConnection {
    /// Dial `record` and complete the handshake, all under the 5 second
    /// deadline. The received info-hash must match `info_hash`.
    pub async fn connect(
        record: &PeerRecord,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
    ) -> Result<Self> {
        let key = record.key();
        let addr = format!("{}:{}", record.host, record.port);

        let stream = timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| Error::handshake(&key, e))?;

            let mut handshake = Vec::with_capacity(HANDSHAKE_SIZE);
            handshake.push(PROTOCOL_STRING.len() as u8);
            handshake.extend_from_slice(PROTOCOL_STRING);
            handshake.extend_from_slice(&[0u8; 8]);
            handshake.extend_from_slice(&info_hash);
            handshake.extend_from_slice(&peer_id);

            stream
                .write_all(&handshake)
                .await
                .map_err(|e| Error::handshake(&key, e))?;

            // pstrlen first, then the remaining 48 + pstrlen bytes
            let mut pstrlen = [0u8; 1];
            stream
                .read_exact(&mut pstrlen)
                .await
                .map_err(|e| Error::handshake(&key, e))?;
            let pstrlen = pstrlen[0] as usize;
            if pstrlen == 0 {
                return Err(Error::handshake(&key, "zero-length protocol string"));
            }

            let mut rest = vec![0u8; pstrlen + 48];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(|e| Error::handshake(&key, e))?;

            if &rest[..pstrlen] != PROTOCOL_STRING {
                return Err(Error::handshake(&key, "unknown protocol string"));
            }

            // Reserved bytes at rest[pstrlen..pstrlen+8] are ignored.
            let remote_hash = &rest[pstrlen + 8..pstrlen + 28];
            if remote_hash != info_hash {
                return Err(Error::handshake(&key, "info-hash mismatch"));
            }

            Ok(stream)
        })
        .await
        .map_err(|_| Error::handshake(&key, "handshake timed out"))??;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: PeerReader {
                half: read_half,
                peer: key.clone(),
                buf: BytesMut::with_capacity(MAX_FRAME),
            },
            writer: PeerWriter {
                half: write_half,
                peer: key,
            },
        })
    }

    /// Split into the reader half (for the session's read loop) and the
    /// writer half (shared by the main loop and the downloader).
    pub fn split(self) -> (PeerReader, PeerWriter) {
        (self.reader, self.writer)
    }
}

impl PeerReader {
    /// Receive one framed message. The idle deadline is two minutes,
    /// restarted on every successful read.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        timeout(IDLE_TIMEOUT, self.recv_inner())
            .await
            .map_err(|_| Error::connection_lost(&self.peer, "idle timeout"))?
    }

    async fn recv_inner(&mut self) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        self.half
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Error::connection_lost(&self.peer, e))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME {
            return Err(Error::protocol_violation(
                &self.peer,
                format!("frame of {} bytes exceeds cap {}", len, MAX_FRAME),
            ));
        }

        self.buf.resize(len, 0);
        self.half
            .read_exact(&mut self.buf)
            .await
            .map_err(|e| Error::connection_lost(&self.peer, e))?;

        PeerMessage::decode(&self.buf).map_err(|e| e.with_peer(&self.peer))
    }
}

impl PeerWriter {
    /// Send one message
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<()> {
        let data = msg.encode();
        timeout(SEND_TIMEOUT, self.half.write_all(&data))
            .await
            .map_err(|_| Error::connection_lost(&self.peer, "send timeout"))?
            .map_err(|e| Error::connection_lost(&self.peer, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_and_flag_messages() {
        assert_eq!(PeerMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::Choke.encode(), vec![0, 0, 0, 1, 0]);
        assert_eq!(PeerMessage::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
        assert_eq!(PeerMessage::Interested.encode(), vec![0, 0, 0, 1, 2]);
        assert_eq!(PeerMessage::NotInterested.encode(), vec![0, 0, 0, 1, 3]);

        assert_eq!(PeerMessage::decode(&[]).unwrap(), PeerMessage::KeepAlive);
        assert_eq!(PeerMessage::decode(&[0]).unwrap(), PeerMessage::Choke);
    }

    #[test]
    fn test_round_trip_all_ids() {
        let messages = vec![
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have { index: 42 },
            PeerMessage::Bitfield {
                bitfield: vec![0b1010_0000, 0x01],
            },
            PeerMessage::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                index: 3,
                begin: 0,
                block: vec![7u8; 16],
            },
            PeerMessage::Cancel {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            PeerMessage::Port { port: 6881 },
        ];

        for msg in messages {
            let encoded = msg.encode();
            let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
            assert_eq!(len, encoded.len() - 4);
            let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_rejects_truncated_payloads() {
        assert!(PeerMessage::decode(&[4, 0, 0]).is_err()); // HAVE with 2 bytes
        assert!(PeerMessage::decode(&[6, 0, 0, 0, 1]).is_err()); // short REQUEST
        assert!(PeerMessage::decode(&[7, 0, 0, 0, 1]).is_err()); // short PIECE
        assert!(PeerMessage::decode(&[9, 1]).is_err()); // short PORT
    }

    #[test]
    fn test_decode_rejects_unknown_id() {
        let err = PeerMessage::decode(&[42, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::PeerProtocolViolation { .. }));
    }

    #[test]
    fn test_decode_rejects_oversized_block() {
        // REQUEST for more than 2 * MAX_BLOCK
        let mut payload = vec![6];
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&(2 * MAX_BLOCK + 1).to_be_bytes());
        assert!(PeerMessage::decode(&payload).is_err());

        // PIECE carrying more than 2 * MAX_BLOCK
        let mut payload = vec![7];
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend(vec![0u8; 2 * MAX_BLOCK as usize + 1]);
        assert!(PeerMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_max_block_request_accepted() {
        let mut payload = vec![6];
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&MAX_BLOCK.to_be_bytes());
        assert!(PeerMessage::decode(&payload).is_ok());
    }

    #[test]
    fn test_peer_record_key() {
        assert_eq!(PeerRecord::new("10.0.0.1", 6881).key(), "10.0.0.1:6881");
        assert_eq!(PeerRecord::new("::1", 6881).key(), "[::1]:6881");
        assert_eq!(
            PeerRecord::new("seed.example.org", 51413).key(),
            "seed.example.org:51413"
        );
    }

    #[test]
    fn test_peer_record_has_piece() {
        let record = PeerRecord::new("10.0.0.1", 6881);
        assert!(!record.has_piece(0));

        *record.pieces.lock() = bitvec![u8, Msb0; 0; 16];
        record.pieces.lock().set(3, true);
        assert!(record.has_piece(3));
        assert!(!record.has_piece(4));
        assert!(!record.has_piece(99));
    }

    #[tokio::test]
    async fn test_handshake_against_loopback() {
        use tokio::net::TcpListener;

        let info_hash = [7u8; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_SIZE];
            stream.read_exact(&mut incoming).await.unwrap();
            assert_eq!(incoming[0] as usize, PROTOCOL_STRING.len());
            assert_eq!(&incoming[28..48], &info_hash);

            let mut reply = Vec::with_capacity(HANDSHAKE_SIZE);
            reply.push(19);
            reply.extend_from_slice(PROTOCOL_STRING);
            reply.extend_from_slice(&[0u8; 8]);
            reply.extend_from_slice(&info_hash);
            reply.extend_from_slice(b"-XX0000-abcdefghijkl");
            stream.write_all(&reply).await.unwrap();

            // Then one HAVE message
            stream
                .write_all(&PeerMessage::Have { index: 5 }.encode())
                .await
                .unwrap();
        });

        let record = PeerRecord::new(addr.ip().to_string(), addr.port());
        let conn = PeerConnection::connect(&record, info_hash, *b"-UT0000-123456789012")
            .await
            .unwrap();
        let (mut reader, _writer) = conn.split();

        let msg = reader.recv().await.unwrap();
        assert_eq!(msg, PeerMessage::Have { index: 5 });

        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_info_hash() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_SIZE];
            stream.read_exact(&mut incoming).await.unwrap();

            let mut reply = Vec::with_capacity(HANDSHAKE_SIZE);
            reply.push(19);
            reply.extend_from_slice(PROTOCOL_STRING);
            reply.extend_from_slice(&[0u8; 8]);
            reply.extend_from_slice(&[9u8; 20]); // different hash
            reply.extend_from_slice(b"-XX0000-abcdefghijkl");
            stream.write_all(&reply).await.unwrap();
        });

        let record = PeerRecord::new(addr.ip().to_string(), addr.port());
        let result = PeerConnection::connect(&record, [7u8; 20], *b"-UT0000-123456789012").await;
        assert!(matches!(result, Err(Error::PeerHandshakeFailed { .. })));
    }
}
