//! Tracker client and per-torrent tracker state
//!
//! One HTTP GET per announce, bencoded response, and a peer map that is
//! merged (never replaced) so live connections are not disturbed by a
//! refresh. All mutable per-torrent state lives in [`TrackerState`] behind
//! a single mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use rand::Rng;

use super::bencode::BencodeValue;
use super::metainfo::Metainfo;
use super::peer::PeerRecord;
use super::Torrent;
use crate::config::Config;
use crate::error::{Error, Result};

/// Per-request timeout for tracker HTTP traffic
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First contact for a torrent
    Started,
    /// This client stops requesting data
    Stopped,
    /// The download just finished
    Completed,
    /// Regular interval announce; no event flag on the wire
    Periodic,
}

impl AnnounceEvent {
    fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Stopped => Some("stopped"),
            Self::Completed => Some("completed"),
            Self::Periodic => None,
        }
    }
}

/// Mutable tracker-side state of one torrent, guarded by the torrent's
/// single mutex.
///
/// Invariant: `have` is a bitwise subset of `downloading` — a piece is
/// marked downloading when claimed and stays set once verified.
#[derive(Debug)]
pub struct TrackerState {
    /// Bytes served to remote peers
    pub uploaded: u64,
    /// Bytes of verified pieces on disk
    pub downloaded: u64,
    /// Bytes still missing
    pub left: u64,

    /// Bit set iff the piece is verified on disk. MSB-first packing.
    pub have: BitVec<u8, Msb0>,
    /// Bit set iff some peer-handler has claimed the piece (downloading or
    /// already downloaded). Superset of `have`.
    pub downloading: BitVec<u8, Msb0>,
    /// How many connected peers advertise each piece
    pub availability: Vec<u32>,

    /// A `started` announce has been made
    pub started: bool,
    /// A `completed` announce has been made
    pub completed: bool,

    /// Seconds until the next periodic announce
    pub interval: u64,
    /// Seeder count from the last response
    pub seeders: u64,
    /// Leecher count from the last response
    pub leechers: u64,

    /// Known peers keyed by `"host:port"`
    pub peers: HashMap<String, Arc<PeerRecord>>,
}

impl TrackerState {
    pub fn new(metainfo: &Metainfo) -> Self {
        let bits = metainfo.piece_count();
        Self {
            uploaded: 0,
            downloaded: 0,
            left: metainfo.total_size,
            have: bitvec![u8, Msb0; 0; bits],
            downloading: bitvec![u8, Msb0; 0; bits],
            availability: vec![0; bits],
            started: false,
            completed: false,
            interval: 0,
            seeders: 0,
            leechers: 0,
            peers: HashMap::new(),
        }
    }

    /// Merge freshly announced peers. Existing records are kept untouched
    /// so live connections and their bitfields survive a refresh.
    pub fn merge_peers(&mut self, discovered: Vec<(String, u16)>) -> usize {
        let mut added = 0;
        for (host, port) in discovered {
            if port == 0 {
                continue;
            }
            let record = PeerRecord::new(host, port);
            let key = record.key();
            if let std::collections::hash_map::Entry::Vacant(entry) = self.peers.entry(key) {
                entry.insert(Arc::new(record));
                added += 1;
            }
        }
        added
    }

    /// Whether the piece is verified on disk
    pub fn have_piece(&self, index: u32) -> bool {
        self.have.get(index as usize).map(|b| *b).unwrap_or(false)
    }
}

/// Parsed announce response
#[derive(Debug)]
struct AnnounceResponse {
    interval: u64,
    complete: u64,
    incomplete: u64,
    peers: Vec<(String, u16)>,
}

/// HTTP tracker client (BEP 3)
pub struct TrackerClient {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
}

impl TrackerClient {
    pub fn new(config: &Config, peer_id: [u8; 20]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::tracker_unreachable("(client setup)", e))?;

        Ok(Self {
            http,
            peer_id,
            port: config.port,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announce this client's state and merge the returned peers into the
    /// torrent's tracker state. `started`/`completed` latch on success.
    pub async fn announce(&self, torrent: &Torrent, event: AnnounceEvent) -> Result<()> {
        let url = self.build_url(torrent, event);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::tracker_unreachable(&torrent.metainfo.announce, e))?;

        if !response.status().is_success() {
            return Err(Error::tracker_unreachable(
                &torrent.metainfo.announce,
                format!("HTTP status {}", response.status()),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::tracker_unreachable(&torrent.metainfo.announce, e))?;

        let parsed = parse_response(&body)?;

        let mut state = torrent.tracker.lock();
        match event {
            AnnounceEvent::Started => state.started = true,
            AnnounceEvent::Completed => state.completed = true,
            _ => {}
        }
        state.interval = parsed.interval;
        state.seeders = parsed.complete;
        state.leechers = parsed.incomplete;
        let added = state.merge_peers(parsed.peers);
        let known = state.peers.len();
        drop(state);

        tracing::debug!(
            torrent = %torrent.metainfo.info_hash_hex(),
            ?event,
            added,
            known,
            "tracker announce ok"
        );
        Ok(())
    }

    /// Assemble the announce URL, preserving any query string already
    /// present. `info_hash` and `peer_id` are raw bytes, percent-encoded.
    fn build_url(&self, torrent: &Torrent, event: AnnounceEvent) -> String {
        let (uploaded, downloaded, left) = {
            let state = torrent.tracker.lock();
            (state.uploaded, state.downloaded, state.left)
        };

        let mut url = torrent.metainfo.announce.clone();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in &torrent.metainfo.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &self.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str(&format!("&port={}", self.port));
        url.push_str(&format!("&uploaded={}", uploaded));
        url.push_str(&format!("&downloaded={}", downloaded));
        url.push_str(&format!("&left={}", left));
        url.push_str("&compact=1");
        url.push_str("&no_peer_id=1");

        if let Some(name) = event.as_str() {
            url.push_str(&format!("&event={}", name));
        }

        url
    }
}

/// Parse a bencoded announce response
fn parse_response(data: &[u8]) -> Result<AnnounceResponse> {
    let value =
        BencodeValue::parse_exact(data).map_err(|e| Error::tracker_malformed(e.to_string()))?;
    if value.as_dict().is_none() {
        return Err(Error::tracker_malformed("response is not a dictionary"));
    }

    if let Some(failure) = value.get("failure reason") {
        let reason = failure
            .as_string()
            .unwrap_or("(non-text failure reason)")
            .to_string();
        return Err(Error::TrackerFailure { reason });
    }

    let interval = value
        .get("interval")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| Error::tracker_malformed("missing or invalid 'interval'"))?;
    if interval == 0 {
        return Err(Error::tracker_malformed("'interval' must be positive"));
    }

    let complete = value.get("complete").and_then(|v| v.as_uint()).unwrap_or(0);
    let incomplete = value
        .get("incomplete")
        .and_then(|v| v.as_uint())
        .unwrap_or(0);

    let mut peers = parse_peers(value.get("peers"))?;
    peers.extend(parse_peers6(value.get("peers6"))?);

    Ok(AnnounceResponse {
        interval,
        complete,
        incomplete,
        peers,
    })
}

/// Peers in either the compact IPv4 model (6-byte groups) or the
/// dictionary model
fn parse_peers(value: Option<&BencodeValue>) -> Result<Vec<(String, u16)>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    match value {
        BencodeValue::Bytes(data) => {
            if data.len() % 6 != 0 {
                return Err(Error::tracker_malformed(format!(
                    "compact peers length {} is not a multiple of 6",
                    data.len()
                )));
            }
            Ok(data
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    (ip, port)
                })
                .collect())
        }

        BencodeValue::List(list) => {
            let mut peers = Vec::with_capacity(list.len());
            for item in list {
                let ip = item
                    .get("ip")
                    .and_then(|v| v.as_string())
                    .ok_or_else(|| Error::tracker_malformed("peer entry missing 'ip'"))?
                    .to_string();
                let port = item
                    .get("port")
                    .and_then(|v| v.as_uint())
                    .filter(|p| *p <= u16::MAX as u64)
                    .ok_or_else(|| Error::tracker_malformed("peer entry missing 'port'"))?;
                peers.push((ip, port as u16));
            }
            Ok(peers)
        }

        _ => Err(Error::tracker_malformed("unexpected 'peers' encoding")),
    }
}

/// Compact IPv6 peers (BEP 7, 18-byte groups). Optional; anything else is
/// ignored.
fn parse_peers6(value: Option<&BencodeValue>) -> Result<Vec<(String, u16)>> {
    let Some(BencodeValue::Bytes(data)) = value else {
        return Ok(Vec::new());
    };

    if data.len() % 18 != 0 {
        return Err(Error::tracker_malformed(format!(
            "compact peers6 length {} is not a multiple of 18",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let ip = std::net::Ipv6Addr::from(octets).to_string();
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            (ip, port)
        })
        .collect())
}

/// Generate the process-wide peer id: the configured Azureus-style tag
/// followed by 12 random ASCII digits.
pub fn generate_peer_id(client_tag: &[u8; 8]) -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(client_tag);

    let mut rng = rand::rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = b'0' + rng.random_range(0..10u8);
    }

    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(body: &[u8]) -> Result<AnnounceResponse> {
        parse_response(body)
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id(b"-UT0000-");
        assert_eq!(&peer_id[..8], b"-UT0000-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn test_parse_compact_peers() {
        let mut body = b"d8:completei3e10:incompletei5e8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]); // 127.0.0.1:6881
        body.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE2]); // 192.168.1.1:6882
        body.push(b'e');

        let resp = respond(&body).unwrap();
        assert_eq!(resp.interval, 900);
        assert_eq!(resp.complete, 3);
        assert_eq!(resp.incomplete, 5);
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0], ("127.0.0.1".to_string(), 6881));
        assert_eq!(resp.peers[1], ("192.168.1.1".to_string(), 6882));
    }

    #[test]
    fn test_parse_empty_compact_peers() {
        let body = b"d8:intervali900e5:peers0:e";
        let resp = respond(body).unwrap();
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:10.0.0.994:porti6881eeee";
        let resp = respond(body).unwrap();
        assert_eq!(resp.peers, vec![("10.0.0.99".to_string(), 6881)]);
    }

    #[test]
    fn test_parse_peers6() {
        let mut body = b"d8:intervali60e6:peers618:".to_vec();
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]); // ::1
        body.extend_from_slice(&0x1AE1u16.to_be_bytes());
        body.push(b'e');

        let resp = respond(&body).unwrap();
        assert_eq!(resp.peers, vec![("::1".to_string(), 6881)]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";
        match respond(body) {
            Err(Error::TrackerFailure { reason }) => assert_eq!(reason, "torrent unknown"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_missing_interval() {
        let body = b"d5:peers0:e";
        assert!(matches!(respond(body), Err(Error::TrackerMalformed { .. })));
    }

    #[test]
    fn test_parse_rejects_zero_interval() {
        let body = b"d8:intervali0e5:peers0:e";
        assert!(matches!(respond(body), Err(Error::TrackerMalformed { .. })));
    }

    #[test]
    fn test_parse_rejects_ragged_compact_peers() {
        let body = b"d8:intervali60e5:peers5:abcdee";
        assert!(matches!(respond(body), Err(Error::TrackerMalformed { .. })));
    }

    /// Single-file metainfo of `total` bytes with 16-byte pieces
    fn test_metainfo(total: u64) -> Metainfo {
        let piece_count = total.div_ceil(16);
        let pieces = vec![0u8; 20 * piece_count as usize];
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce11:http://a/an4:infod");
        data.extend_from_slice(format!("6:lengthi{}e", total).as_bytes());
        data.extend_from_slice(b"4:name1:a12:piece lengthi16e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        Metainfo::parse(&data).unwrap()
    }

    #[test]
    fn test_merge_preserves_existing_records() {
        let metainfo = test_metainfo(16);
        let mut state = TrackerState::new(&metainfo);

        state.merge_peers(vec![("10.0.0.1".to_string(), 6881)]);
        let original = Arc::clone(&state.peers["10.0.0.1:6881"]);

        // Give the live record an advertised piece, then re-merge the same
        // peer plus a new one.
        *original.pieces.lock() = bitvec![u8, Msb0; 1; 8];
        let added = state.merge_peers(vec![
            ("10.0.0.1".to_string(), 6881),
            ("10.0.0.2".to_string(), 6881),
        ]);

        assert_eq!(added, 1);
        assert_eq!(state.peers.len(), 2);
        assert!(Arc::ptr_eq(&original, &state.peers["10.0.0.1:6881"]));
        assert!(state.peers["10.0.0.1:6881"].has_piece(0));
    }

    #[test]
    fn test_merge_skips_port_zero() {
        let metainfo = test_metainfo(16);
        let mut state = TrackerState::new(&metainfo);
        assert_eq!(state.merge_peers(vec![("10.0.0.1".to_string(), 0)]), 0);
        assert!(state.peers.is_empty());
    }

    #[test]
    fn test_new_state_shape() {
        // 20 bytes total, piece length 16 -> 2 pieces
        let metainfo = test_metainfo(20);

        let state = TrackerState::new(&metainfo);
        assert_eq!(state.left, 20);
        assert_eq!(state.have.len(), 2);
        assert_eq!(state.downloading.len(), 2);
        assert_eq!(state.have.as_raw_slice().len(), 1);
        assert_eq!(state.availability, vec![0, 0]);
        assert!(!state.started && !state.completed);
    }
}
