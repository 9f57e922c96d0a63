//! # torc
//!
//! A BitTorrent client library built around a supervised tree of async
//! tasks: a controller dispatches front-end commands to one torrent-handler
//! per torrent, which supervises up to `max_peers` peer-handlers, each
//! driving one TCP peer session with its own reader and downloader tasks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use torc::{ComBundle, Config, Controller, Message, MessageKind, Torrent};
//! use torc::controller::CONTROLLER_KEY;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = Controller::new(Config::default())?;
//!
//!     let mut bundle = ComBundle::new();
//!     let handle = bundle.handle();
//!     let commands = handle.add_child(CONTROLLER_KEY);
//!     tokio::spawn(controller.run(handle.clone(), commands));
//!
//!     let torrent = Arc::new(Torrent::from_file("example.torrent").await?);
//!     handle
//!         .send_child(
//!             CONTROLLER_KEY,
//!             Message::new(MessageKind::Add).with_torrent(torrent),
//!         )
//!         .await;
//!
//!     while let Some(msg) = bundle.recv().await {
//!         println!("{}: {:?}", msg.kind, msg.error);
//!         if msg.kind == MessageKind::Complete {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod com;
pub mod config;
pub mod controller;
pub mod error;
pub mod torrent;

pub use com::{ComBundle, ComHandle, Message, MessageKind};
pub use config::{Config, LogLevel, PieceSelection};
pub use controller::Controller;
pub use error::{Error, Result};
pub use torrent::{Metainfo, Storage, Torrent};
