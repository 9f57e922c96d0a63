//! Disk storage layer
//!
//! Presents the torrent payload as one virtual byte stream striped across
//! the metainfo's file table. A request `(piece, begin, length)` maps to
//! `global_offset = piece * piece_length + begin` and is transferred file
//! by file across boundaries. Directories and files are created on demand
//! by writes; reads of regions nothing has written yet fail with
//! `StorageMissing`.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::metainfo::FileEntry;
use super::Torrent;
use crate::error::{Error, Result};

/// Random-access view over one torrent's payload files
pub struct Storage {
    torrent: Arc<Torrent>,
    root: PathBuf,
}

impl Storage {
    pub fn new(torrent: Arc<Torrent>, root: impl Into<PathBuf>) -> Self {
        Self {
            torrent,
            root: root.into(),
        }
    }

    fn file_path(&self, entry: &FileEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    /// Validate a `(piece, begin, length)` triple against the piece table.
    /// Zero is a valid piece index and a valid begin.
    fn check_bounds(&self, piece: u32, begin: u32, length: usize) -> Result<()> {
        let metainfo = &self.torrent.metainfo;

        if piece as usize >= metainfo.piece_count() {
            return Err(Error::protocol_violation(
                "",
                format!(
                    "piece index {} out of range (piece count {})",
                    piece,
                    metainfo.piece_count()
                ),
            ));
        }
        if (begin as u64) >= metainfo.piece_length {
            return Err(Error::protocol_violation(
                "",
                format!("begin {} out of range (piece length {})", begin, metainfo.piece_length),
            ));
        }

        // piece index was checked above
        let piece_len = metainfo.piece_length_at(piece).unwrap_or(0);
        if begin as u64 + length as u64 > piece_len {
            return Err(Error::protocol_violation(
                "",
                format!(
                    "range {}+{} exceeds piece {} length {}",
                    begin, length, piece, piece_len
                ),
            ));
        }
        Ok(())
    }

    /// Read `length` bytes starting at `(piece, begin)`
    pub async fn read(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        self.check_bounds(piece, begin, length as usize)?;

        let global = piece as u64 * self.torrent.metainfo.piece_length + begin as u64;
        let mut out = Vec::with_capacity(length as usize);
        let mut pos = global;
        let mut remaining = length as usize;

        for entry in &self.torrent.metainfo.files {
            if remaining == 0 {
                break;
            }
            let file_end = entry.offset + entry.length;
            if entry.length == 0 || pos >= file_end {
                continue;
            }

            let path = self.file_path(entry);
            let mut file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::StorageMissing {
                        piece,
                        begin,
                        length,
                    })
                }
                Err(e) => return Err(Error::storage(&path, "open", e)),
            };

            file.seek(SeekFrom::Start(pos - entry.offset))
                .await
                .map_err(|e| Error::storage(&path, "seek", e))?;

            let take = remaining.min((file_end - pos) as usize);
            let mut buf = vec![0u8; take];
            match file.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::StorageMissing {
                        piece,
                        begin,
                        length,
                    })
                }
                Err(e) => return Err(Error::storage(&path, "read", e)),
            }

            out.extend_from_slice(&buf);
            pos += take as u64;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(Error::StorageMissing {
                piece,
                begin,
                length,
            });
        }
        Ok(out)
    }

    /// Write `data` starting at `(piece, begin)`, creating directories and
    /// files on demand and extending them as needed
    pub async fn write(&self, piece: u32, begin: u32, data: &[u8]) -> Result<()> {
        self.check_bounds(piece, begin, data.len())?;

        let global = piece as u64 * self.torrent.metainfo.piece_length + begin as u64;
        let mut pos = global;
        let mut written = 0usize;

        for entry in &self.torrent.metainfo.files {
            if written == data.len() {
                break;
            }
            let file_end = entry.offset + entry.length;
            if entry.length == 0 || pos >= file_end {
                continue;
            }

            let path = self.file_path(entry);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::storage(parent, "mkdir", e))?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| Error::storage(&path, "open", e))?;

            file.seek(SeekFrom::Start(pos - entry.offset))
                .await
                .map_err(|e| Error::storage(&path, "seek", e))?;

            let take = (data.len() - written).min((file_end - pos) as usize);
            file.write_all(&data[written..written + take])
                .await
                .map_err(|e| Error::storage(&path, "write", e))?;

            pos += take as u64;
            written += take;
        }

        Ok(())
    }

    /// Check a fully assembled piece against its expected digest. The hash
    /// covers the piece content only, never any wire header.
    pub fn verify(&self, piece: u32, data: &[u8]) -> Result<()> {
        let expected = self
            .torrent
            .metainfo
            .piece_hash(piece)
            .ok_or_else(|| {
                Error::protocol_violation("", format!("piece index {} out of range", piece))
            })?;

        let mut hasher = Sha1::new();
        hasher.update(data);
        let actual: [u8; 20] = hasher.finalize().into();

        if actual == *expected {
            Ok(())
        } else {
            Err(Error::PieceHashMismatch { index: piece })
        }
    }

    /// Best-effort removal of the payload files and any directories that
    /// became empty
    pub async fn remove_files(&self) -> Result<()> {
        for entry in &self.torrent.metainfo.files {
            let path = self.file_path(entry);
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::storage(&path, "remove", e)),
            }

            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(())
    }
}
