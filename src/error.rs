//! Typed error hierarchy for torc
//!
//! Every layer of the client reports through this one enum so that failures
//! can be carried inside supervision messages and logged uniformly.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the client
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Bencode input that violates the grammar
    #[error("malformed bencode: {context}")]
    BencodeMalformed { context: String },

    /// A required key was absent from a bencoded dictionary.
    ///
    /// Kept separate from [`Error::BencodeMalformed`] so callers can tell
    /// "missing" apart from "corrupt" (the tracker response parser needs
    /// this distinction).
    #[error("bencode key not found: {key}")]
    BencodeKeyNotFound { key: String },

    /// A metainfo file that decoded but fails validation
    #[error("invalid metainfo field '{field}': {context}")]
    MetainfoInvalid {
        field: &'static str,
        context: String,
    },

    /// The tracker could not be reached or answered with an HTTP error
    #[error("tracker {url} unreachable: {cause}")]
    TrackerUnreachable { url: String, cause: String },

    /// The tracker answered 200 but the body does not parse
    #[error("malformed tracker response: {context}")]
    TrackerMalformed { context: String },

    /// The tracker answered with an explicit failure reason
    #[error("tracker failure: {reason}")]
    TrackerFailure { reason: String },

    /// The 68-byte opening exchange with a peer failed
    #[error("handshake with {peer} failed: {cause}")]
    PeerHandshakeFailed { peer: String, cause: String },

    /// The peer sent something the wire protocol does not allow
    #[error("protocol violation by {peer}: {detail}")]
    PeerProtocolViolation { peer: String, detail: String },

    /// The peer connection died (reset, timeout, EOF)
    #[error("connection to {peer} lost: {cause}")]
    PeerConnectionLost { peer: String, cause: String },

    /// File I/O failed in the storage layer
    #[error("storage {op} failed at {path:?}: {cause}")]
    StorageIo {
        path: PathBuf,
        op: &'static str,
        cause: String,
    },

    /// A read touched a region no piece has ever been written to
    #[error("read of unwritten storage range: piece {piece}, offset {begin}, length {length}")]
    StorageMissing { piece: u32, begin: u32, length: u32 },

    /// A fully assembled piece did not hash to the expected digest
    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },
}

impl Error {
    /// Create a bencode grammar error
    pub fn bencode(context: impl Into<String>) -> Self {
        Self::BencodeMalformed {
            context: context.into(),
        }
    }

    /// Create a missing-key error
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::BencodeKeyNotFound { key: key.into() }
    }

    /// Create a metainfo validation error
    pub fn metainfo(field: &'static str, context: impl Into<String>) -> Self {
        Self::MetainfoInvalid {
            field,
            context: context.into(),
        }
    }

    /// Create a tracker transport error
    pub fn tracker_unreachable(url: impl Into<String>, cause: impl ToString) -> Self {
        Self::TrackerUnreachable {
            url: url.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a tracker response parse error
    pub fn tracker_malformed(context: impl Into<String>) -> Self {
        Self::TrackerMalformed {
            context: context.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(peer: impl Into<String>, cause: impl ToString) -> Self {
        Self::PeerHandshakeFailed {
            peer: peer.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(peer: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PeerProtocolViolation {
            peer: peer.into(),
            detail: detail.into(),
        }
    }

    /// Create a lost-connection error
    pub fn connection_lost(peer: impl Into<String>, cause: impl ToString) -> Self {
        Self::PeerConnectionLost {
            peer: peer.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a storage I/O error
    pub fn storage(path: impl Into<PathBuf>, op: &'static str, cause: impl ToString) -> Self {
        Self::StorageIo {
            path: path.into(),
            op,
            cause: cause.to_string(),
        }
    }

    /// Fill in the peer identity on peer-scoped errors.
    ///
    /// The wire codec decodes frames without knowing which session they came
    /// from; the session attaches its "host:port" before reporting upward.
    pub fn with_peer(mut self, peer: &str) -> Self {
        match &mut self {
            Self::PeerHandshakeFailed { peer: p, .. }
            | Self::PeerProtocolViolation { peer: p, .. }
            | Self::PeerConnectionLost { peer: p, .. } => {
                if p.is_empty() {
                    *p = peer.to_string();
                }
            }
            _ => {}
        }
        self
    }

    /// Whether this error should tear down the whole peer session
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(
            self,
            Self::PeerHandshakeFailed { .. }
                | Self::PeerProtocolViolation { .. }
                | Self::PeerConnectionLost { .. }
        )
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;
