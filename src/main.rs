//! Interactive front-end
//!
//! A stdin command loop over the controller: `a <path>` adds a torrent,
//! `ls` lists every torrent's state, `log <level>` changes verbosity,
//! `q` quits. Controller messages are rendered as they arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

use torc::controller::CONTROLLER_KEY;
use torc::{ComBundle, ComHandle, Config, Controller, LogLevel, Message, MessageKind, Torrent};

type ReloadHandle = reload::Handle<LevelFilter, Registry>;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("torc: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    let mut config = Config::default();
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [dir] if !dir.starts_with('-') => config.download_path = PathBuf::from(dir),
        _ => {
            eprintln!("usage: torc [download-dir]");
            return 2;
        }
    }

    let (filter, reload_handle) = reload::Layer::new(config.log_level.filter());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("torc: {}", e);
            return 2;
        }
    };

    let mut bundle = ComBundle::new();
    let handle = bundle.handle();
    let commands = handle.add_child(CONTROLLER_KEY);
    tokio::spawn(controller.run(handle.clone(), commands));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if handle_command(&line, &handle, &reload_handle).await {
                            break;
                        }
                    }
                    // stdin closed: shut down cleanly
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("torc: stdin error: {}", e);
                        break;
                    }
                }
            }
            Some(msg) = bundle.recv() => render(&msg),
        }
    }

    shutdown(&handle, &mut bundle).await;
    0
}

/// Dispatch one input line. Returns true when the loop should end.
async fn handle_command(line: &str, handle: &ComHandle, reload_handle: &ReloadHandle) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => false,

        Some("q") | Some("quit") => true,

        Some("a") | Some("add") => {
            let Some(path) = parts.next() else {
                eprintln!("usage: a <torrent-file>");
                return false;
            };
            match Torrent::from_file(path).await {
                Ok(torrent) => {
                    handle
                        .send_child(
                            CONTROLLER_KEY,
                            Message::new(MessageKind::Add).with_torrent(Arc::new(torrent)),
                        )
                        .await;
                }
                Err(e) => eprintln!("torc: cannot add {}: {}", path, e),
            }
            false
        }

        Some("ls") => {
            handle
                .send_child(CONTROLLER_KEY, Message::new(MessageKind::List))
                .await;
            false
        }

        Some("log") => {
            let Some(level) = parts.next() else {
                eprintln!("usage: log <none|low|high>");
                return false;
            };
            match level.parse::<LogLevel>() {
                Ok(level) => {
                    let _ = reload_handle.modify(|f| *f = level.filter());
                    handle
                        .send_child(
                            CONTROLLER_KEY,
                            Message::new(MessageKind::LogLevel)
                                .with_payload(level.to_string().into_bytes()),
                        )
                        .await;
                }
                Err(e) => eprintln!("torc: {}", e),
            }
            false
        }

        Some(other) => {
            eprintln!("torc: unknown command {:?} (try: a <file>, ls, log <level>, q)", other);
            false
        }
    }
}

/// Print one controller message for the user
fn render(msg: &Message) {
    match msg.kind {
        MessageKind::Add => match (&msg.error, &msg.torrent) {
            (Some(e), _) => eprintln!("add failed: {}", e),
            (None, Some(torrent)) => {
                println!("added {} ({})", torrent.metainfo.name, msg.child)
            }
            (None, None) => println!("added {}", msg.child),
        },

        MessageKind::List => {
            let Some(torrent) = &msg.torrent else { return };
            let state = torrent.tracker.lock();
            println!("{} ({})", torrent.metainfo.name, msg.child);
            for file in &torrent.metainfo.files {
                println!("  file {} ({} bytes)", file.path.display(), file.length);
            }
            println!(
                "  pieces {}/{}  downloaded {}  uploaded {}  left {}",
                state.have.count_ones(),
                torrent.metainfo.piece_count(),
                state.downloaded,
                state.uploaded,
                state.left,
            );
            println!(
                "  peers {}  seeders {}  leechers {}  interval {}s",
                state.peers.len(),
                state.seeders,
                state.leechers,
                state.interval,
            );
        }

        MessageKind::Complete => {
            if let Some(torrent) = &msg.torrent {
                println!("completed {}", torrent.metainfo.name);
            }
        }

        MessageKind::Failure | MessageKind::TotalFailure => {
            if let Some(e) = &msg.error {
                eprintln!("{}: {}", msg.kind, e);
            } else if let Some(payload) = &msg.payload {
                eprintln!("{}: {}", msg.kind, String::from_utf8_lossy(payload));
            }
        }

        MessageKind::Success => {
            if let Some(payload) = &msg.payload {
                println!("ok: {}", String::from_utf8_lossy(payload));
            } else {
                println!("ok ({})", msg.child);
            }
        }

        _ => {}
    }
}

/// Ask the controller to quit and drain until its Exiting notification
async fn shutdown(handle: &ComHandle, bundle: &mut ComBundle) {
    handle
        .send_child(CONTROLLER_KEY, Message::new(MessageKind::Quit))
        .await;

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match tokio::time::timeout_at(deadline, bundle.recv()).await {
            Ok(Some(msg)) => {
                if msg.kind == MessageKind::Exiting && msg.child == CONTROLLER_KEY {
                    break;
                }
                render(&msg);
            }
            _ => break,
        }
    }
}
