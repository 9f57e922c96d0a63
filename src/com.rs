//! Supervision messaging fabric
//!
//! Messages travel between a parent task and its supervised children over
//! bounded channels. A [`ComBundle`] is the parent's end: one shared queue
//! every child sends up on, and one queue per child the parent sends down
//! on. Children hold a cloneable [`ComHandle`] and register themselves
//! under a string key once they are ready to receive commands.
//!
//! All queues are bounded, so a stalled consumer throttles its producers
//! instead of dropping messages. Within one sender/receiver pair messages
//! are FIFO; across senders no ordering is promised.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::torrent::Torrent;

/// Capacity of every supervision queue
pub const CHANNEL_CAPACITY: usize = 10;

/// Discriminant of a supervision message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Add a torrent / response to an add
    Add,
    /// Remove a torrent and its handler
    Remove,
    /// Restart peer sessions for a stopped torrent
    Start,
    /// Stop peer sessions, keep the handler alive
    Stop,
    /// Tear down the receiver and everything below it
    Quit,
    /// Request or carry a descriptor snapshot
    List,
    /// A piece index this side now has
    Have,
    /// A command executed fine
    Success,
    /// Something went wrong but the sender keeps running
    Failure,
    /// Something went wrong and the sender is exiting
    TotalFailure,
    /// Emitted by the fabric when a child is unregistered
    Exiting,
    /// A download finished
    Complete,
    /// Change the log verbosity
    LogLevel,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Start => "Start",
            Self::Stop => "Stop",
            Self::Quit => "Quit",
            Self::List => "List",
            Self::Have => "Have",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::TotalFailure => "TotalFailure",
            Self::Exiting => "Exiting",
            Self::Complete => "Complete",
            Self::LogLevel => "LogLevel",
        };
        write!(f, "{}", name)
    }
}

/// One supervision message
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// Raw payload bytes; a 4-byte big-endian piece index for `Have`,
    /// a level name for `LogLevel`
    pub payload: Option<Vec<u8>>,
    /// Set when reporting a problem
    pub error: Option<Error>,
    /// The torrent this message concerns, where one is needed
    pub torrent: Option<Arc<Torrent>>,
    /// Key of the child this message is from or for
    pub child: String,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: None,
            error: None,
            torrent: None,
            child: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_torrent(mut self, torrent: Arc<Torrent>) -> Self {
        self.torrent = Some(torrent);
        self
    }

    pub fn with_child(mut self, child: impl Into<String>) -> Self {
        self.child = child.into();
        self
    }

    /// Decode the payload as a big-endian piece index
    pub fn piece_index(&self) -> Option<u32> {
        let payload = self.payload.as_deref()?;
        let bytes: [u8; 4] = payload.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Build a `Have` message for one piece index
    pub fn have(index: u32) -> Self {
        Self::new(MessageKind::Have).with_payload(index.to_be_bytes().to_vec())
    }
}

/// Parent side of the fabric: owns the upward receiver
pub struct ComBundle {
    rx: mpsc::Receiver<Message>,
    handle: ComHandle,
}

/// Cloneable handle shared with children (and with the parent's own code
/// that sends downward)
#[derive(Clone)]
pub struct ComHandle {
    to_parent: mpsc::Sender<Message>,
    children: Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>,
}

impl ComBundle {
    pub fn new() -> Self {
        let (to_parent, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            rx,
            handle: ComHandle {
                to_parent,
                children: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    pub fn handle(&self) -> ComHandle {
        self.handle.clone()
    }

    /// Receive the next message sent up by any child.
    ///
    /// Never returns `None` in practice: the bundle itself keeps one sender
    /// alive inside its handle.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Default for ComBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl ComHandle {
    /// Register a child under `key` and hand back the queue it will receive
    /// parent messages on. The key is always the caller's; re-registering a
    /// key replaces the previous queue.
    pub fn add_child(&self, key: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.children.lock().insert(key.to_string(), tx);
        rx
    }

    /// Unregister `key` and notify the parent with an `Exiting` message.
    /// Called by the child as the last step of its teardown.
    pub async fn remove_child(&self, key: &str) {
        let existed = self.children.lock().remove(key).is_some();
        if existed {
            self.send_parent(Message::new(MessageKind::Exiting).with_child(key))
                .await;
        }
    }

    /// Send a message up to the parent
    pub async fn send_parent(&self, msg: Message) {
        // The parent dropping its bundle mid-shutdown is not an error worth
        // surfacing to senders.
        let _ = self.to_parent.send(msg).await;
    }

    /// Send a message down to one child. Returns false if the key is not
    /// registered.
    pub async fn send_child(&self, key: &str, msg: Message) -> bool {
        let tx = match self.children.lock().get(key) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(msg).await.is_ok()
    }

    /// Send a copy of a message to every registered child
    pub async fn broadcast(&self, msg: Message) {
        let targets: Vec<(String, mpsc::Sender<Message>)> = self
            .children
            .lock()
            .iter()
            .map(|(k, tx)| (k.clone(), tx.clone()))
            .collect();

        for (key, tx) in targets {
            let _ = tx.send(msg.clone().with_child(key)).await;
        }
    }

    pub fn has_child(&self, key: &str) -> bool {
        self.children.lock().contains_key(key)
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }
}
