//! Torrent engine
//!
//! Everything below the controller: the metainfo decoder, the tracker
//! client, the peer wire protocol, disk striping, and the two supervisor
//! layers (torrent-handler and peer-handler) that coordinate them.

pub mod bencode;
pub mod handler;
pub mod metainfo;
pub mod peer;
pub mod peer_handler;
pub mod storage;
pub mod tracker;

pub use bencode::{raw_slice, BencodeValue};
pub use metainfo::{FileEntry, Metainfo, Sha1Hash};
pub use peer::{PeerConnection, PeerMessage, PeerRecord, MAX_BLOCK};
pub use storage::Storage;
pub use tracker::{generate_peer_id, AnnounceEvent, TrackerClient, TrackerState};

use std::path::Path;

use parking_lot::Mutex;

use crate::error::Result;

/// One torrent: the immutable descriptor plus the mutable tracker state
/// shared by every task working on it.
#[derive(Debug)]
pub struct Torrent {
    pub metainfo: Metainfo,
    pub tracker: Mutex<TrackerState>,
}

impl Torrent {
    /// Build from the raw bytes of a .torrent file
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let metainfo = Metainfo::parse(data)?;
        let tracker = Mutex::new(TrackerState::new(&metainfo));
        Ok(Self { metainfo, tracker })
    }

    /// Read and parse a .torrent file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| crate::error::Error::storage(path, "read", e))?;
        Self::from_bytes(&data)
    }

    /// Child key of this torrent in the controller's map
    pub fn key(&self) -> String {
        self.metainfo.info_hash_hex()
    }
}
