//! Client configuration
//!
//! One record constructed at startup and passed explicitly into each
//! supervisor; there is no process-global state.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};

/// Default listening port announced to trackers
pub const DEFAULT_PORT: u16 = 6881;

/// Default cap on concurrent peer sessions per torrent
pub const DEFAULT_MAX_PEERS: u32 = 8;

/// Default number of consecutive tracker failures tolerated before a
/// torrent-handler gives up
pub const DEFAULT_MAX_TRACKER_RETRIES: u32 = 5;

/// Log verbosity, front-end facing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No output at all
    None,
    /// Lifecycle events only
    #[default]
    Low,
    /// Per-message and per-piece detail
    High,
}

impl LogLevel {
    /// Map onto a `tracing` filter level
    pub fn filter(self) -> LevelFilter {
        match self {
            Self::None => LevelFilter::OFF,
            Self::Low => LevelFilter::INFO,
            Self::High => LevelFilter::DEBUG,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            _ => Err(format!("invalid log level: {}", s)),
        }
    }
}

/// Strategy the downloader uses when claiming the next piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceSelection {
    /// Scan pieces in order and take the first free one. Deterministic.
    #[default]
    LowestIndex,
    /// Prefer the piece the fewest connected peers advertise
    Rarest,
}

impl FromStr for PieceSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lowest" | "lowest-index" => Ok(Self::LowestIndex),
            "rarest" | "rarest-first" => Ok(Self::Rarest),
            _ => Err(format!("invalid piece selection policy: {}", s)),
        }
    }
}

/// Main configuration for the client
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory the payload files are written under
    pub download_path: PathBuf,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Port announced to trackers. The client announces this value but does
    /// not bind a listening socket.
    pub port: u16,

    /// Maximum concurrent peer sessions per torrent
    pub max_peers: u32,

    /// Consecutive periodic-announce failures before a torrent-handler exits
    pub max_tracker_retries: u32,

    /// User agent for tracker HTTP requests
    pub user_agent: String,

    /// Fixed 8-byte Azureus-style prefix of the peer id, e.g. `-UT0000-`
    pub client_tag: [u8; 8],

    /// Piece claiming strategy
    pub piece_selection: PieceSelection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("./"),
            log_level: LogLevel::default(),
            port: DEFAULT_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            max_tracker_retries: DEFAULT_MAX_TRACKER_RETRIES,
            user_agent: "torc/1.0".to_string(),
            client_tag: *b"-UT0000-",
            piece_selection: PieceSelection::default(),
        }
    }
}

impl Config {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::metainfo("port", "must be non-zero"));
        }
        if self.max_peers == 0 {
            return Err(Error::metainfo("max_peers", "must be at least 1"));
        }
        if self.client_tag[0] != b'-' || self.client_tag[7] != b'-' {
            return Err(Error::metainfo(
                "client_tag",
                "must be '-' delimited, e.g. -UT0000-",
            ));
        }
        if !self.client_tag.iter().all(u8::is_ascii) {
            return Err(Error::metainfo("client_tag", "must be ASCII"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 6881);
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.max_tracker_retries, 5);
        assert_eq!(config.user_agent, "torc/1.0");
        assert_eq!(&config.client_tag, b"-UT0000-");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_round_trip() {
        for s in ["none", "low", "high"] {
            let level: LogLevel = s.parse().unwrap();
            assert_eq!(level.to_string(), s);
        }
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_piece_selection_parse() {
        assert_eq!(
            "rarest".parse::<PieceSelection>().unwrap(),
            PieceSelection::Rarest
        );
        assert_eq!(
            "lowest".parse::<PieceSelection>().unwrap(),
            PieceSelection::LowestIndex
        );
    }

    #[test]
    fn test_validate_rejects_bad_tag() {
        let config = Config {
            client_tag: *b"UT00000-",
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
