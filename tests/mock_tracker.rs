//! Mock HTTP tracker
//!
//! A minimal scripted HTTP/1.1 server speaking just enough of the tracker
//! protocol for the integration suites: each accepted request consumes the
//! next scripted reply, falling back to a standing reply once the script
//! runs dry.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use torc::torrent::BencodeValue;

/// One scripted tracker reply
#[derive(Clone)]
pub enum TrackerReply {
    /// Bencoded success with compact IPv4 peers
    Ok {
        interval: u64,
        peers: Vec<SocketAddr>,
    },
    /// Plain HTTP error status, empty body
    Status(u16),
    /// Bencoded `failure reason`
    Failure(String),
}

impl TrackerReply {
    fn to_http(&self) -> Vec<u8> {
        match self {
            Self::Ok { interval, peers } => {
                let mut compact = Vec::with_capacity(peers.len() * 6);
                for peer in peers {
                    if let SocketAddr::V4(v4) = peer {
                        compact.extend_from_slice(&v4.ip().octets());
                        compact.extend_from_slice(&v4.port().to_be_bytes());
                    }
                }

                let mut dict = BTreeMap::new();
                dict.insert(b"complete".to_vec(), BencodeValue::Integer(1));
                dict.insert(b"incomplete".to_vec(), BencodeValue::Integer(peers.len() as i64));
                dict.insert(
                    b"interval".to_vec(),
                    BencodeValue::Integer(*interval as i64),
                );
                dict.insert(b"peers".to_vec(), BencodeValue::Bytes(compact));
                http_response(200, "OK", &BencodeValue::Dict(dict).encode())
            }

            Self::Status(code) => http_response(*code, "Error", b""),

            Self::Failure(reason) => {
                let mut dict = BTreeMap::new();
                dict.insert(
                    b"failure reason".to_vec(),
                    BencodeValue::Bytes(reason.clone().into_bytes()),
                );
                http_response(200, "OK", &BencodeValue::Dict(dict).encode())
            }
        }
    }
}

fn http_response(code: u16, text: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        text,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// A listening scripted tracker
pub struct MockTracker {
    addr: SocketAddr,
    announces: Arc<AtomicUsize>,
}

impl MockTracker {
    /// Start serving: `script` replies are consumed in order, then
    /// `fallback` answers every further announce.
    pub async fn start(script: Vec<TrackerReply>, fallback: TrackerReply) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let announces = Arc::new(AtomicUsize::new(0));

        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let counter = Arc::clone(&announces);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = script.lock().pop_front().unwrap_or_else(|| fallback.clone());

                tokio::spawn(async move {
                    // Read the request head; the body is empty for GET.
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match stream.read(&mut chunk).await {
                            Ok(0) => return,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let _ = stream.write_all(&reply.to_http()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Ok(Self { addr, announces })
    }

    /// The announce URL to bake into test torrents
    pub fn url(&self) -> String {
        format!("http://{}/announce", self.addr)
    }

    /// How many announces have been received
    pub fn announce_count(&self) -> usize {
        self.announces.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_then_fallback() {
        let tracker = MockTracker::start(
            vec![TrackerReply::Status(500)],
            TrackerReply::Ok {
                interval: 60,
                peers: vec![],
            },
        )
        .await
        .unwrap();

        let client = reqwest::Client::new();
        let first = client.get(tracker.url()).send().await.unwrap();
        assert_eq!(first.status().as_u16(), 500);

        let second = client.get(tracker.url()).send().await.unwrap();
        assert_eq!(second.status().as_u16(), 200);
        let body = second.bytes().await.unwrap();
        assert!(body.starts_with(b"d"));

        assert_eq!(tracker.announce_count(), 2);
    }
}
