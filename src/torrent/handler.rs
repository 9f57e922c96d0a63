//! Torrent-handler
//!
//! One task per torrent. It makes the first tracker contact, supervises up
//! to `max_peers` peer-handlers through its own channel bundle, re-announces
//! on the tracker's interval, and relays commands from the controller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::peer::PeerRecord;
use super::peer_handler;
use super::storage::Storage;
use super::tracker::{AnnounceEvent, TrackerClient};
use super::Torrent;
use crate::com::{ComBundle, ComHandle, Message, MessageKind};
use crate::config::Config;

/// How long a handler waits for its peer sessions to acknowledge a Quit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run one torrent to completion.
///
/// The first announce is make-or-break: on failure the handler reports
/// `Add` with the error and exits without ever registering.
pub async fn run(com: ComHandle, torrent: Arc<Torrent>, config: Arc<Config>, peer_id: [u8; 20]) {
    let key = torrent.key();

    let client = match TrackerClient::new(&config, peer_id) {
        Ok(client) => client,
        Err(e) => {
            com.send_parent(
                Message::new(MessageKind::Add)
                    .with_error(e)
                    .with_torrent(Arc::clone(&torrent))
                    .with_child(&key),
            )
            .await;
            return;
        }
    };

    info!(torrent = %key, "torrent handler started");

    if let Err(e) = client.announce(&torrent, AnnounceEvent::Started).await {
        warn!(torrent = %key, error = %e, "first tracker contact failed");
        com.send_parent(
            Message::new(MessageKind::Add)
                .with_error(e)
                .with_torrent(Arc::clone(&torrent))
                .with_child(&key),
        )
        .await;
        return;
    }

    com.send_parent(
        Message::new(MessageKind::Add)
            .with_torrent(Arc::clone(&torrent))
            .with_child(&key),
    )
    .await;
    let mut from_controller = com.add_child(&key);

    let storage = Arc::new(Storage::new(Arc::clone(&torrent), &config.download_path));
    let mut peers = ComBundle::new();
    let peers_handle = peers.handle();

    // Sessions in flight or registered, by "host:port" key. Children only
    // appear in the bundle after their handshake, so this set is what
    // prevents double-spawning a peer that is still connecting.
    let mut live: HashSet<String> = HashSet::new();

    spawn_peers(
        &peers_handle,
        &mut live,
        &torrent,
        &storage,
        &config,
        peer_id,
        None,
    );

    let mut retry_count: u32 = 0;
    let mut next_announce = Instant::now() + announce_delay(&torrent);

    loop {
        tokio::select! {
            maybe = from_controller.recv() => {
                let Some(msg) = maybe else { break };
                match msg.kind {
                    MessageKind::Remove => {
                        if let Err(e) = storage.remove_files().await {
                            warn!(torrent = %key, error = %e, "file removal incomplete");
                        }
                        com.send_parent(Message::new(MessageKind::Remove).with_child(&key)).await;
                        break;
                    }

                    MessageKind::Start => {
                        let running = peers_handle.child_count();
                        if running > 0 {
                            com.send_parent(
                                Message::new(MessageKind::Failure)
                                    .with_payload(
                                        format!(
                                            "cannot start: {} peer sessions still running",
                                            running
                                        )
                                        .into_bytes(),
                                    )
                                    .with_child(&key),
                            )
                            .await;
                        } else {
                            spawn_peers(
                                &peers_handle,
                                &mut live,
                                &torrent,
                                &storage,
                                &config,
                                peer_id,
                                None,
                            );
                            com.send_parent(Message::new(MessageKind::Start).with_child(&key)).await;
                        }
                    }

                    MessageKind::Stop => {
                        peers_handle.broadcast(Message::new(MessageKind::Quit)).await;
                    }

                    MessageKind::List => {
                        com.send_parent(
                            Message::new(MessageKind::List)
                                .with_torrent(Arc::clone(&torrent))
                                .with_child(&key),
                        )
                        .await;
                    }

                    MessageKind::Quit => break,

                    other => debug!(torrent = %key, kind = %other, "unexpected controller message"),
                }
            }

            Some(msg) = peers.recv() => {
                match msg.kind {
                    MessageKind::Success => {
                        com.send_parent(msg.with_child(&key)).await;
                    }

                    MessageKind::Have => {
                        let payload = msg.payload.clone().unwrap_or_default();
                        peers_handle
                            .broadcast(Message::new(MessageKind::Have).with_payload(payload))
                            .await;
                    }

                    MessageKind::Complete => {
                        info!(torrent = %key, "download complete");
                        if let Err(e) = client.announce(&torrent, AnnounceEvent::Completed).await {
                            warn!(torrent = %key, error = %e, "completed announce failed");
                        }
                        com.send_parent(
                            Message::new(MessageKind::Complete)
                                .with_torrent(Arc::clone(&torrent))
                                .with_child(&key),
                        )
                        .await;
                    }

                    MessageKind::TotalFailure => {
                        let failed = msg.child.clone();
                        live.remove(&failed);
                        if let Some(e) = &msg.error {
                            debug!(torrent = %key, peer = %failed, error = %e, "peer session died");
                        }
                        // Replace with some other unconnected peer; the one
                        // that just failed is skipped while alternatives
                        // exist.
                        spawn_peers(
                            &peers_handle,
                            &mut live,
                            &torrent,
                            &storage,
                            &config,
                            peer_id,
                            Some(&failed),
                        );
                    }

                    MessageKind::Exiting => {
                        live.remove(&msg.child);
                    }

                    MessageKind::Failure => {
                        if let Some(e) = &msg.error {
                            warn!(torrent = %key, peer = %msg.child, error = %e, "peer reported failure");
                        }
                    }

                    other => debug!(torrent = %key, kind = %other, "unexpected peer message"),
                }
            }

            _ = tokio::time::sleep_until(next_announce) => {
                debug!(torrent = %key, "tracker interval expired");
                match client.announce(&torrent, AnnounceEvent::Periodic).await {
                    Ok(()) => {
                        retry_count = 0;
                        // The refresh may have discovered new peers; top the
                        // sessions back up to the cap.
                        spawn_peers(
                            &peers_handle,
                            &mut live,
                            &torrent,
                            &storage,
                            &config,
                            peer_id,
                            None,
                        );
                    }
                    Err(e) => {
                        retry_count += 1;
                        if retry_count >= config.max_tracker_retries {
                            error!(
                                torrent = %key,
                                retries = retry_count,
                                error = %e,
                                "giving up on tracker"
                            );
                            com.send_parent(
                                Message::new(MessageKind::TotalFailure)
                                    .with_error(e)
                                    .with_child(&key),
                            )
                            .await;
                            break;
                        }
                        warn!(
                            torrent = %key,
                            retries = retry_count,
                            error = %e,
                            "periodic announce failed"
                        );
                        com.send_parent(
                            Message::new(MessageKind::Failure)
                                .with_error(e)
                                .with_child(&key),
                        )
                        .await;
                    }
                }
                next_announce = Instant::now() + announce_delay(&torrent);
            }
        }
    }

    shutdown_peers(&peers_handle, &mut peers).await;
    com.remove_child(&key).await;
    info!(torrent = %key, "torrent handler exiting");
}

/// Seconds until the next periodic announce, per the tracker's last
/// response. The interval is in seconds; a tracker that did not supply one
/// yet gets polled after a minute.
fn announce_delay(torrent: &Torrent) -> Duration {
    let interval = torrent.tracker.lock().interval;
    Duration::from_secs(if interval == 0 { 60 } else { interval })
}

/// Spawn peer-handlers for unconnected peers up to the configured cap.
/// Returns how many were spawned.
fn spawn_peers(
    handle: &ComHandle,
    live: &mut HashSet<String>,
    torrent: &Arc<Torrent>,
    storage: &Arc<Storage>,
    config: &Arc<Config>,
    peer_id: [u8; 20],
    skip: Option<&str>,
) -> usize {
    let capacity = (config.max_peers as usize).saturating_sub(live.len());
    if capacity == 0 {
        return 0;
    }

    let candidates: Vec<Arc<PeerRecord>> = {
        let state = torrent.tracker.lock();
        state
            .peers
            .values()
            .filter(|record| {
                let key = record.key();
                !live.contains(&key) && skip != Some(key.as_str())
            })
            .take(capacity)
            .cloned()
            .collect()
    };

    let spawned = candidates.len();
    for record in candidates {
        let key = record.key();
        debug!(peer = %key, "spawning peer handler");
        live.insert(key);
        tokio::spawn(peer_handler::run(
            handle.clone(),
            record,
            Arc::clone(torrent),
            Arc::clone(storage),
            Arc::clone(config),
            peer_id,
        ));
    }
    spawned
}

/// Tell every peer session to quit and wait (bounded) for their exits
async fn shutdown_peers(handle: &ComHandle, peers: &mut ComBundle) {
    handle.broadcast(Message::new(MessageKind::Quit)).await;

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while handle.child_count() > 0 {
        match tokio::time::timeout_at(deadline, peers.recv()).await {
            Ok(Some(_)) => {}
            _ => break,
        }
    }
}
