//! Controller
//!
//! The top-level dispatcher. Owns the process-wide peer id and download
//! path, maps front-end commands onto per-torrent handlers keyed by
//! info-hash, and relays handler responses back to the front-end.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::com::{ComBundle, ComHandle, Message, MessageKind};
use crate::config::{Config, LogLevel};
use crate::error::Result;
use crate::torrent::{generate_peer_id, handler};

/// The controller's own child key in the front-end's bundle
pub const CONTROLLER_KEY: &str = "controller";

/// How long a quitting controller waits for its torrent handlers
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Top-level dispatcher state
pub struct Controller {
    config: Arc<Config>,
    peer_id: [u8; 20],
    log_level: LogLevel,
    /// Torrents with a spawned handler, by info-hash hex
    handlers: HashSet<String>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let peer_id = generate_peer_id(&config.client_tag);
        let log_level = config.log_level;
        Ok(Self {
            config: Arc::new(config),
            peer_id,
            log_level,
            handlers: HashSet::new(),
        })
    }

    /// The 20-byte peer id presented to trackers and peers
    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Current log verbosity as last set via the `LogLevel` command
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Run the dispatch loop. `commands` is this controller's receiver in
    /// the front-end's bundle; `front` is the handle it reports back on.
    pub async fn run(mut self, front: ComHandle, mut commands: mpsc::Receiver<Message>) {
        let mut torrents = ComBundle::new();
        let torrents_handle = torrents.handle();

        info!("controller started");

        loop {
            tokio::select! {
                maybe = commands.recv() => {
                    let Some(msg) = maybe else { break };
                    match msg.kind {
                        MessageKind::Add => {
                            self.handle_add(msg, &front, &torrents_handle).await;
                        }

                        MessageKind::Remove | MessageKind::Start | MessageKind::Stop => {
                            if !self.handlers.contains(&msg.child) {
                                front.send_parent(
                                    Message::new(MessageKind::Failure)
                                        .with_payload(b"non-existing torrent".to_vec())
                                        .with_child(&msg.child),
                                )
                                .await;
                            } else {
                                let key = msg.child.clone();
                                if !torrents_handle.send_child(&key, msg).await {
                                    // Spawned but not registered yet (still
                                    // announcing); the front-end can retry.
                                    front.send_parent(
                                        Message::new(MessageKind::Failure)
                                            .with_payload(b"torrent is still starting".to_vec())
                                            .with_child(&key),
                                    )
                                    .await;
                                }
                            }
                        }

                        MessageKind::List => {
                            torrents_handle.broadcast(Message::new(MessageKind::List)).await;
                        }

                        MessageKind::LogLevel => {
                            self.handle_log_level(msg, &front).await;
                        }

                        MessageKind::Quit => {
                            self.shutdown(&torrents_handle, &mut torrents, &front).await;
                            break;
                        }

                        other => debug!(kind = %other, "unexpected front-end command"),
                    }
                }

                Some(msg) = torrents.recv() => {
                    match msg.kind {
                        // A handler whose first announce failed reports Add
                        // with an error and is already gone.
                        MessageKind::Add => {
                            if msg.error.is_some() {
                                self.handlers.remove(&msg.child);
                            }
                            front.send_parent(msg).await;
                        }

                        MessageKind::Exiting => {
                            self.handlers.remove(&msg.child);
                        }

                        MessageKind::TotalFailure => {
                            warn!(torrent = %msg.child, "torrent handler gave up");
                            front.send_parent(msg).await;
                        }

                        // Remove/Start/Stop/List responses and peer-level
                        // Success/Failure/Complete pass through unchanged.
                        _ => front.send_parent(msg).await,
                    }
                }
            }
        }

        front.remove_child(CONTROLLER_KEY).await;
        info!("controller exiting");
    }

    async fn handle_add(&mut self, msg: Message, front: &ComHandle, torrents: &ComHandle) {
        let Some(torrent) = msg.torrent else {
            front
                .send_parent(
                    Message::new(MessageKind::Failure)
                        .with_payload(b"no torrent specified".to_vec()),
                )
                .await;
            return;
        };

        let key = torrent.key();
        if self.handlers.contains(&key) {
            front
                .send_parent(
                    Message::new(MessageKind::Failure)
                        .with_payload(b"torrent already added".to_vec())
                        .with_child(&key),
                )
                .await;
            return;
        }

        info!(torrent = %key, name = %torrent.metainfo.name, "adding torrent");
        self.handlers.insert(key);
        tokio::spawn(handler::run(
            torrents.clone(),
            torrent,
            Arc::clone(&self.config),
            self.peer_id,
        ));
    }

    async fn handle_log_level(&mut self, msg: Message, front: &ComHandle) {
        let requested = msg
            .payload
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default()
            .to_string();

        match requested.parse::<LogLevel>() {
            Ok(level) => {
                self.log_level = level;
                info!(%level, "log level changed");
                front
                    .send_parent(
                        Message::new(MessageKind::Success)
                            .with_payload(level.to_string().into_bytes()),
                    )
                    .await;
            }
            Err(e) => {
                front
                    .send_parent(
                        Message::new(MessageKind::Failure).with_payload(e.into_bytes()),
                    )
                    .await;
            }
        }
    }

    /// Propagate Quit to every torrent handler and wait (bounded) for their
    /// Exiting notifications, forwarding anything else that is still in
    /// flight.
    async fn shutdown(
        &mut self,
        torrents_handle: &ComHandle,
        torrents: &mut ComBundle,
        front: &ComHandle,
    ) {
        torrents_handle.broadcast(Message::new(MessageKind::Quit)).await;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while torrents_handle.child_count() > 0 {
            match tokio::time::timeout_at(deadline, torrents.recv()).await {
                Ok(Some(msg)) => {
                    if msg.kind == MessageKind::Exiting {
                        self.handlers.remove(&msg.child);
                    } else {
                        front.send_parent(msg).await;
                    }
                }
                _ => {
                    warn!(
                        remaining = torrents_handle.child_count(),
                        "torrent handlers still alive at shutdown deadline"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::ComBundle;

    async fn start_controller() -> (ComBundle, ComHandle) {
        let bundle = ComBundle::new();
        let handle = bundle.handle();
        let commands = handle.add_child(CONTROLLER_KEY);
        let controller = Controller::new(Config::default()).unwrap();
        tokio::spawn(controller.run(handle.clone(), commands));
        (bundle, handle)
    }

    #[test]
    fn test_peer_id_shape() {
        let controller = Controller::new(Config::default()).unwrap();
        let peer_id = controller.peer_id();
        assert_eq!(&peer_id[..8], b"-UT0000-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }

    #[tokio::test]
    async fn test_add_without_torrent_fails() {
        let (mut bundle, handle) = start_controller().await;

        handle
            .send_child(CONTROLLER_KEY, Message::new(MessageKind::Add))
            .await;

        let msg = bundle.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Failure);
        assert_eq!(msg.payload.as_deref(), Some(b"no torrent specified".as_slice()));
    }

    #[tokio::test]
    async fn test_command_for_unknown_torrent_fails() {
        let (mut bundle, handle) = start_controller().await;

        handle
            .send_child(
                CONTROLLER_KEY,
                Message::new(MessageKind::Remove).with_child("deadbeef"),
            )
            .await;

        let msg = bundle.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Failure);
        assert_eq!(
            msg.payload.as_deref(),
            Some(b"non-existing torrent".as_slice())
        );
        assert_eq!(msg.child, "deadbeef");
    }

    #[tokio::test]
    async fn test_log_level_command_acks() {
        let (mut bundle, handle) = start_controller().await;

        handle
            .send_child(
                CONTROLLER_KEY,
                Message::new(MessageKind::LogLevel).with_payload(b"high".to_vec()),
            )
            .await;

        let msg = bundle.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Success);
        assert_eq!(msg.payload.as_deref(), Some(b"high".as_slice()));

        handle
            .send_child(
                CONTROLLER_KEY,
                Message::new(MessageKind::LogLevel).with_payload(b"loudest".to_vec()),
            )
            .await;
        let msg = bundle.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Failure);
    }

    #[tokio::test]
    async fn test_quit_emits_exiting() {
        let (mut bundle, handle) = start_controller().await;

        handle
            .send_child(CONTROLLER_KEY, Message::new(MessageKind::Quit))
            .await;

        let msg = bundle.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Exiting);
        assert_eq!(msg.child, CONTROLLER_KEY);
        assert_eq!(handle.child_count(), 0);
    }
}
