//! Peer-handler
//!
//! One task per live peer session. After the handshake the session splits
//! into three cooperating tasks: a reader that pumps framed messages into
//! a bounded queue, a downloader that claims pieces and requests blocks,
//! and the main loop that owns the protocol state flags, serves REQUESTs,
//! and talks to the torrent-handler through the supervision fabric.

use std::sync::Arc;

use bitvec::prelude::*;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::peer::{
    PeerConnection, PeerMessage, PeerReader, PeerRecord, PeerWriter, KEEPALIVE_INTERVAL, MAX_BLOCK,
};
use super::storage::Storage;
use super::Torrent;
use crate::com::{ComHandle, Message, MessageKind, CHANNEL_CAPACITY};
use crate::config::{Config, PieceSelection};
use crate::error::{Error, Result};

/// What the main loop forwards to the downloader: the choke transitions,
/// incoming blocks, and the terminal error.
enum DownloadEvent {
    Choke,
    Unchoke,
    Block {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Failed,
}

/// Run one peer session to completion.
///
/// Dial and handshake come first; failure there is a `TotalFailure` without
/// ever registering with the parent. A registered session always ends by
/// unregistering, which emits the `Exiting` notification upward.
pub async fn run(
    com: ComHandle,
    record: Arc<PeerRecord>,
    torrent: Arc<Torrent>,
    storage: Arc<Storage>,
    config: Arc<Config>,
    peer_id: [u8; 20],
) {
    let key = record.key();

    let conn = match PeerConnection::connect(&record, torrent.metainfo.info_hash, peer_id).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer = %key, error = %e, "handshake failed");
            com.send_parent(
                Message::new(MessageKind::TotalFailure)
                    .with_error(e)
                    .with_child(&key),
            )
            .await;
            return;
        }
    };

    info!(peer = %key, "peer session established");
    com.send_parent(Message::new(MessageKind::Success).with_child(&key))
        .await;
    let from_parent = com.add_child(&key);

    // Fresh session, fresh view of the remote: zero bitfield sized for
    // this torrent.
    *record.pieces.lock() = bitvec![u8, Msb0; 0; torrent.metainfo.piece_count()];

    session(
        &com,
        conn,
        from_parent,
        &record,
        &torrent,
        &storage,
        &config,
        &key,
    )
    .await;

    release_availability(&torrent, &record);
    com.remove_child(&key).await;
    debug!(peer = %key, "peer session closed");
}

/// The post-handshake part of the session: spawn reader and downloader,
/// then multiplex parent commands, remote messages, and the keepalive tick.
#[allow(clippy::too_many_arguments)]
async fn session(
    com: &ComHandle,
    conn: PeerConnection,
    mut from_parent: mpsc::Receiver<Message>,
    record: &Arc<PeerRecord>,
    torrent: &Arc<Torrent>,
    storage: &Arc<Storage>,
    config: &Arc<Config>,
    key: &str,
) {
    let (reader, writer) = conn.split();
    let writer = Arc::new(AsyncMutex::new(writer));

    // Opening policy: interested and unchoked right away.
    {
        let mut w = writer.lock().await;
        let opened = async {
            w.send(&PeerMessage::Interested).await?;
            w.send(&PeerMessage::Unchoke).await
        }
        .await;
        if let Err(e) = opened {
            com.send_parent(
                Message::new(MessageKind::TotalFailure)
                    .with_error(e)
                    .with_child(key),
            )
            .await;
            return;
        }
    }

    let (read_tx, mut read_rx) = mpsc::channel::<Result<PeerMessage>>(CHANNEL_CAPACITY);
    let reader_task = tokio::spawn(read_loop(reader, read_tx));

    let (dl_tx, dl_rx) = mpsc::channel::<DownloadEvent>(CHANNEL_CAPACITY);
    let downloader_task = tokio::spawn(downloader(
        com.clone(),
        dl_rx,
        Arc::clone(torrent),
        Arc::clone(record),
        Arc::clone(storage),
        Arc::clone(&writer),
        config.piece_selection,
        key.to_string(),
    ));
    // Dropped (set to None) once the downloader goes away so a full queue
    // can never wedge the main loop.
    let mut dl_tx = Some(dl_tx);

    let am_choking = false;
    let mut peer_choking = true;
    let mut peer_interested = false;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            maybe = from_parent.recv() => {
                let Some(msg) = maybe else { break };
                match msg.kind {
                    MessageKind::Have => {
                        if let Some(index) = msg.piece_index() {
                            if let Err(e) = writer.lock().await.send(&PeerMessage::Have { index }).await {
                                debug!(peer = %key, error = %e, "failed to advertise piece");
                            }
                        }
                    }
                    MessageKind::Quit => {
                        debug!(peer = %key, "quit received");
                        break;
                    }
                    other => debug!(peer = %key, kind = %other, "unexpected parent message"),
                }
            }

            maybe = read_rx.recv() => {
                let Some(result) = maybe else { break };
                let msg = match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(peer = %key, error = %e, "session lost");
                        forward(&mut dl_tx, DownloadEvent::Failed).await;
                        com.send_parent(
                            Message::new(MessageKind::TotalFailure)
                                .with_error(e)
                                .with_child(key),
                        )
                        .await;
                        break;
                    }
                };

                match msg {
                    PeerMessage::KeepAlive => {}

                    PeerMessage::Choke => {
                        peer_choking = true;
                        forward(&mut dl_tx, DownloadEvent::Choke).await;
                    }
                    PeerMessage::Unchoke => {
                        peer_choking = false;
                        forward(&mut dl_tx, DownloadEvent::Unchoke).await;
                    }
                    PeerMessage::Interested => peer_interested = true,
                    PeerMessage::NotInterested => peer_interested = false,

                    PeerMessage::Have { index } => {
                        if let Err(e) = apply_have(torrent, record, index) {
                            let e = e.with_peer(key);
                            forward(&mut dl_tx, DownloadEvent::Failed).await;
                            com.send_parent(
                                Message::new(MessageKind::TotalFailure)
                                    .with_error(e)
                                    .with_child(key),
                            )
                            .await;
                            break;
                        }
                    }

                    PeerMessage::Bitfield { bitfield } => {
                        if !apply_bitfield(torrent, record, &bitfield) {
                            warn!(
                                peer = %key,
                                got = bitfield.len(),
                                expected = torrent.metainfo.bitfield_len(),
                                "rejecting bitfield of wrong length"
                            );
                        }
                    }

                    PeerMessage::Request { index, begin, length } => {
                        if am_choking {
                            debug!(peer = %key, "ignoring request while choking");
                            continue;
                        }
                        match storage.read(index, begin, length).await {
                            Ok(block) => {
                                let sent = writer
                                    .lock()
                                    .await
                                    .send(&PeerMessage::Piece { index, begin, block })
                                    .await;
                                match sent {
                                    Ok(()) => {
                                        torrent.tracker.lock().uploaded += length as u64;
                                        debug!(peer = %key, index, begin, length, "served block");
                                    }
                                    Err(e) => debug!(peer = %key, error = %e, "failed to send block"),
                                }
                            }
                            // The remote asked for something we cannot
                            // serve; its problem, not fatal for us.
                            Err(e) => debug!(peer = %key, error = %e.with_peer(key), "cannot serve request"),
                        }
                    }

                    PeerMessage::Piece { index, begin, block } => {
                        forward(&mut dl_tx, DownloadEvent::Block { index, begin, block }).await;
                    }

                    PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
                }
            }

            _ = keepalive.tick() => {
                debug!(peer = %key, peer_choking, peer_interested, "sending keepalive");
                if let Err(e) = writer.lock().await.send(&PeerMessage::KeepAlive).await {
                    debug!(peer = %key, error = %e, "keepalive failed");
                }
            }
        }
    }

    // Teardown: the reader is aborted, the downloader sees its queue close
    // and unwinds on its own (releasing any claim it holds).
    reader_task.abort();
    drop(dl_tx);
    let _ = downloader_task.await;
}

/// Pump framed messages into the session queue until the first error
async fn read_loop(mut reader: PeerReader, tx: mpsc::Sender<Result<PeerMessage>>) {
    loop {
        let result = reader.recv().await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

/// Send to the downloader unless it already went away
async fn forward(dl_tx: &mut Option<mpsc::Sender<DownloadEvent>>, event: DownloadEvent) {
    if let Some(tx) = dl_tx {
        if tx.send(event).await.is_err() {
            *dl_tx = None;
        }
    }
}

/// Record a HAVE. An index at or past the piece count is a protocol
/// violation.
fn apply_have(torrent: &Torrent, record: &PeerRecord, index: u32) -> Result<()> {
    let count = torrent.metainfo.piece_count();
    if index as usize >= count {
        return Err(Error::protocol_violation(
            "",
            format!("HAVE index {} out of range ({} pieces)", index, count),
        ));
    }

    let mut state = torrent.tracker.lock();
    let mut remote = record.pieces.lock();
    if !remote[index as usize] {
        remote.set(index as usize, true);
        state.availability[index as usize] += 1;
    }
    Ok(())
}

/// Replace the remote bitfield. Only a bitfield of exactly the expected
/// byte length is accepted; anything else is ignored and the old view
/// kept. Returns whether the bitfield was applied.
fn apply_bitfield(torrent: &Torrent, record: &PeerRecord, bytes: &[u8]) -> bool {
    if bytes.len() != torrent.metainfo.bitfield_len() {
        return false;
    }

    let count = torrent.metainfo.piece_count();
    let mut incoming = BitVec::<u8, Msb0>::from_slice(bytes);
    incoming.truncate(count);

    let mut state = torrent.tracker.lock();
    let mut remote = record.pieces.lock();
    for i in 0..count {
        let old = remote[i];
        let new = incoming[i];
        if new && !old {
            state.availability[i] += 1;
        } else if old && !new {
            state.availability[i] = state.availability[i].saturating_sub(1);
        }
    }
    *remote = incoming;
    true
}

/// Subtract this session's advertised pieces from the availability counts
/// and zero the record for the next session.
fn release_availability(torrent: &Torrent, record: &PeerRecord) {
    let mut state = torrent.tracker.lock();
    let mut remote = record.pieces.lock();
    for (i, bit) in remote.iter().enumerate() {
        if *bit {
            state.availability[i] = state.availability[i].saturating_sub(1);
        }
    }
    remote.fill(false);
}

/// Claim a free piece this peer advertises: not had, not already claimed,
/// and set in the remote bitfield. The claim is atomic under the tracker
/// mutex.
fn claim_piece(torrent: &Torrent, record: &PeerRecord, selection: PieceSelection) -> Option<u32> {
    let mut state = torrent.tracker.lock();
    let remote = record.pieces.lock();

    let mut best: Option<(usize, u32)> = None;
    for i in 0..state.have.len() {
        if state.have[i] || state.downloading[i] {
            continue;
        }
        if !remote.get(i).map(|b| *b).unwrap_or(false) {
            continue;
        }
        match selection {
            PieceSelection::LowestIndex => {
                best = Some((i, 0));
                break;
            }
            PieceSelection::Rarest => {
                let avail = state.availability[i];
                if best.map_or(true, |(_, a)| avail < a) {
                    best = Some((i, avail));
                }
            }
        }
    }

    let (index, _) = best?;
    state.downloading.set(index, true);
    Some(index as u32)
}

/// Undo a claim so another session can pick the piece up
fn release_claim(torrent: &Torrent, piece: u32) {
    let mut state = torrent.tracker.lock();
    if !state.have[piece as usize] {
        state.downloading.set(piece as usize, false);
    }
}

/// Why a piece fetch stopped early
enum FetchFailure {
    /// The peer broke protocol for this piece; the session may live on
    Violation(Error),
    /// The connection or session is gone
    SessionOver,
}

/// The downloader: claim pieces this peer advertises and pull them block
/// by block until nothing is left to claim or the session ends.
#[allow(clippy::too_many_arguments)]
async fn downloader(
    com: ComHandle,
    mut queue: mpsc::Receiver<DownloadEvent>,
    torrent: Arc<Torrent>,
    record: Arc<PeerRecord>,
    storage: Arc<Storage>,
    writer: Arc<AsyncMutex<PeerWriter>>,
    selection: PieceSelection,
    key: String,
) {
    let mut choked = true;

    loop {
        // No point claiming while choked; waiting here also lets the
        // remote's opening BITFIELD land before the first claim.
        while choked {
            match queue.recv().await {
                Some(DownloadEvent::Unchoke) => choked = false,
                Some(DownloadEvent::Choke) | Some(DownloadEvent::Block { .. }) => {}
                Some(DownloadEvent::Failed) | None => return,
            }
        }

        let Some(piece) = claim_piece(&torrent, &record, selection) else {
            debug!(peer = %key, "no claimable piece advertised by remote");
            return;
        };

        match fetch_piece(piece, &mut queue, &mut choked, &torrent, &writer, &key).await {
            Ok(data) => {
                if let Err(e) = storage.verify(piece, &data) {
                    warn!(peer = %key, piece, "piece failed hash verification");
                    release_claim(&torrent, piece);
                    com.send_parent(
                        Message::new(MessageKind::Failure)
                            .with_error(e)
                            .with_child(&key),
                    )
                    .await;
                    continue;
                }

                if let Err(e) = storage.write(piece, 0, &data).await {
                    warn!(peer = %key, piece, error = %e, "failed to store piece");
                    release_claim(&torrent, piece);
                    com.send_parent(
                        Message::new(MessageKind::Failure)
                            .with_error(e)
                            .with_child(&key),
                    )
                    .await;
                    continue;
                }

                let finished = {
                    let mut state = torrent.tracker.lock();
                    state.have.set(piece as usize, true);
                    state.downloaded += data.len() as u64;
                    state.left = state.left.saturating_sub(data.len() as u64);
                    state.left == 0
                };

                debug!(peer = %key, piece, bytes = data.len(), "piece verified and stored");
                com.send_parent(Message::have(piece).with_child(&key)).await;
                if finished {
                    com.send_parent(Message::new(MessageKind::Complete).with_child(&key))
                        .await;
                }
            }

            Err(FetchFailure::Violation(e)) => {
                warn!(peer = %key, piece, error = %e, "aborting piece");
                release_claim(&torrent, piece);
                com.send_parent(
                    Message::new(MessageKind::Failure)
                        .with_error(e)
                        .with_child(&key),
                )
                .await;
            }

            Err(FetchFailure::SessionOver) => {
                release_claim(&torrent, piece);
                return;
            }
        }
    }
}

/// Pull one whole piece, block by block, honouring choke transitions
async fn fetch_piece(
    piece: u32,
    queue: &mut mpsc::Receiver<DownloadEvent>,
    choked: &mut bool,
    torrent: &Torrent,
    writer: &AsyncMutex<PeerWriter>,
    key: &str,
) -> std::result::Result<Vec<u8>, FetchFailure> {
    let piece_len = torrent.metainfo.piece_length_at(piece).unwrap_or(0);
    let mut data = Vec::with_capacity(piece_len as usize);
    let mut begin = 0u32;

    while (begin as u64) < piece_len {
        if *choked {
            match queue.recv().await {
                Some(DownloadEvent::Unchoke) => *choked = false,
                Some(DownloadEvent::Choke) | Some(DownloadEvent::Block { .. }) => {}
                Some(DownloadEvent::Failed) | None => return Err(FetchFailure::SessionOver),
            }
            continue;
        }

        let want = MAX_BLOCK.min((piece_len - begin as u64) as u32);
        let request = PeerMessage::Request {
            index: piece,
            begin,
            length: want,
        };
        if writer.lock().await.send(&request).await.is_err() {
            return Err(FetchFailure::SessionOver);
        }

        loop {
            match queue.recv().await {
                Some(DownloadEvent::Block {
                    index,
                    begin: b,
                    block,
                }) => {
                    if index != piece || b != begin || block.len() != want as usize {
                        return Err(FetchFailure::Violation(Error::protocol_violation(
                            key,
                            format!(
                                "unexpected block: got piece {} offset {} len {}, \
                                 wanted piece {} offset {} len {}",
                                index,
                                b,
                                block.len(),
                                piece,
                                begin,
                                want
                            ),
                        )));
                    }
                    data.extend_from_slice(&block);
                    begin += want;
                    break;
                }
                Some(DownloadEvent::Choke) => {
                    *choked = true;
                    break;
                }
                Some(DownloadEvent::Unchoke) => {}
                Some(DownloadEvent::Failed) | None => return Err(FetchFailure::SessionOver),
            }
        }
    }

    Ok(data)
}
