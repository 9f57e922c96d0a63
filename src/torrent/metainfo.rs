//! Metainfo loader
//!
//! Parses .torrent files (BEP 3 metainfo) into an immutable descriptor:
//! announce URL, piece table, file layout, and the info-hash derived from
//! the raw bytes of the `info` dictionary.

use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use super::bencode::{raw_slice, BencodeValue};
use crate::error::{Error, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed torrent descriptor. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the raw bencoded `info` dictionary
    pub info_hash: Sha1Hash,
    /// Tracker announce URL
    pub announce: String,
    /// Suggested name for the file or root directory
    pub name: String,
    /// Bytes per piece, except possibly the last
    pub piece_length: u64,
    /// One SHA-1 digest per piece
    pub pieces: Vec<Sha1Hash>,
    /// Files in byte-stream order. Single-file torrents are normalised
    /// into a one-element sequence whose path is `name`.
    pub files: Vec<FileEntry>,
    /// Total payload size in bytes
    pub total_size: u64,
}

/// One file of the torrent payload
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the download root
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Start offset of this file in the concatenated byte stream
    pub offset: u64,
}

impl Metainfo {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        if root.as_dict().is_none() {
            return Err(Error::metainfo("root", "must be a dictionary"));
        }

        let announce = root
            .get("announce")
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::metainfo("announce", "missing or not a string"))?
            .to_string();
        if announce.is_empty() {
            return Err(Error::metainfo("announce", "must be non-empty"));
        }
        let announce_url =
            Url::parse(&announce).map_err(|e| Error::metainfo("announce", e.to_string()))?;
        if !matches!(announce_url.scheme(), "http" | "https") {
            return Err(Error::metainfo(
                "announce",
                format!("unsupported scheme {:?}", announce_url.scheme()),
            ));
        }

        // The info-hash is over the value's raw bytes as encountered in the
        // source file, never a re-encoding.
        let info_bytes = raw_slice(data, &["info"])
            .map_err(|_| Error::metainfo("info", "missing dictionary"))?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash: Sha1Hash = hasher.finalize().into();

        let info = root.require("info")?;
        if info.as_dict().is_none() {
            return Err(Error::metainfo("info", "must be a dictionary"));
        }

        let name = info
            .get("name")
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::metainfo("name", "missing or not a string"))?
            .to_string();
        validate_relative_path(Path::new(&name))?;

        let piece_length = info
            .get("piece length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| Error::metainfo("piece length", "missing or not an integer"))?;
        if piece_length == 0 {
            return Err(Error::metainfo("piece length", "must be positive"));
        }

        let pieces_bytes = info
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| Error::metainfo("pieces", "missing or not a byte string"))?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(Error::metainfo(
                "pieces",
                format!("length {} is not a positive multiple of 20", pieces_bytes.len()),
            ));
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // Exactly one of `length` (single file) and `files` (multi file)
        // must be present.
        let single = info.get("length");
        let multi = info.get("files");
        let (files, total_size) = match (single, multi) {
            (Some(_), Some(_)) => {
                return Err(Error::metainfo(
                    "info",
                    "both 'length' and 'files' present",
                ))
            }
            (Some(length), None) => {
                let length = length
                    .as_uint()
                    .ok_or_else(|| Error::metainfo("length", "not a non-negative integer"))?;
                let file = FileEntry {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                };
                (vec![file], length)
            }
            (None, Some(files_value)) => Self::parse_files(&name, files_value)?,
            (None, None) => {
                return Err(Error::metainfo(
                    "info",
                    "neither 'length' nor 'files' present",
                ))
            }
        };

        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(Error::metainfo(
                "pieces",
                format!(
                    "piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                    pieces.len(),
                    expected_pieces,
                    total_size,
                    piece_length
                ),
            ));
        }

        Ok(Metainfo {
            info_hash,
            announce,
            name,
            piece_length,
            pieces,
            files,
            total_size,
        })
    }

    /// Parse the `files` list of a multi-file torrent. Entries are rooted
    /// under the torrent's `name` directory.
    fn parse_files(name: &str, value: &BencodeValue) -> Result<(Vec<FileEntry>, u64)> {
        let list = value
            .as_list()
            .ok_or_else(|| Error::metainfo("files", "must be a list"))?;
        if list.is_empty() {
            return Err(Error::metainfo("files", "must be non-empty"));
        }

        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;

        for entry in list {
            let dict = entry
                .as_dict()
                .ok_or_else(|| Error::metainfo("files", "entry must be a dictionary"))?;

            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_uint())
                .ok_or_else(|| Error::metainfo("files", "entry missing integer 'length'"))?;

            let components = dict
                .get(b"path".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| Error::metainfo("files", "entry missing 'path' list"))?;
            if components.is_empty() {
                return Err(Error::metainfo("files", "entry has empty 'path'"));
            }

            let mut path = PathBuf::from(name);
            for component in components {
                let part = component
                    .as_string()
                    .ok_or_else(|| Error::metainfo("files", "path component not a string"))?;
                path.push(part);
            }
            validate_relative_path(&path)?;

            files.push(FileEntry {
                path,
                length,
                offset,
            });
            offset += length;
        }

        Ok((files, offset))
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of the have/downloading/remote bitfields
    pub fn bitfield_len(&self) -> usize {
        self.piece_count().div_ceil(8)
    }

    /// Length of one piece; the last piece covers only the stream remainder
    pub fn piece_length_at(&self, index: u32) -> Option<u64> {
        let start = (index as u64).checked_mul(self.piece_length)?;
        if start >= self.total_size {
            return None;
        }
        Some((self.total_size - start).min(self.piece_length))
    }

    /// Expected digest for one piece
    pub fn piece_hash(&self, index: u32) -> Option<&Sha1Hash> {
        self.pieces.get(index as usize)
    }

    /// Info-hash rendered as lowercase hex, used as the controller child key
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Reject paths that would escape the download root
fn validate_relative_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(Error::metainfo(
                    "path",
                    "contains parent directory reference (..)",
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::metainfo("path", "is absolute"))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        // One file "test.txt" of 100 bytes, piece length 32768, 1 piece hash
        let pieces = vec![0u8; 20];
        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(b"8:announce35:http://tracker.example.com/announce");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(b"6:lengthi100e");
        data.extend_from_slice(b"4:name8:test.txt");
        data.extend_from_slice(b"12:piece lengthi32768e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    fn multi_file_torrent() -> Vec<u8> {
        // Two 10-byte files, piece length 16 -> 2 pieces
        let pieces = vec![0u8; 40];
        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(b"8:announce35:http://tracker.example.com/announce");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(b"5:filesl");
        data.extend_from_slice(b"d6:lengthi10e4:pathl5:a.txtee");
        data.extend_from_slice(b"d6:lengthi10e4:pathl3:sub5:b.txtee");
        data.extend_from_slice(b"e");
        data.extend_from_slice(b"4:name4:demo");
        data.extend_from_slice(b"12:piece lengthi16e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::parse(&single_file_torrent()).unwrap();

        assert_eq!(metainfo.name, "test.txt");
        assert_eq!(metainfo.piece_length, 32768);
        assert_eq!(metainfo.total_size, 100);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, PathBuf::from("test.txt"));
        assert_eq!(metainfo.files[0].offset, 0);
        assert_eq!(metainfo.announce, "http://tracker.example.com/announce");
    }

    #[test]
    fn test_parse_multi_file_offsets() {
        let metainfo = Metainfo::parse(&multi_file_torrent()).unwrap();

        assert_eq!(metainfo.total_size, 20);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.files.len(), 2);
        assert_eq!(metainfo.files[0].path, PathBuf::from("demo/a.txt"));
        assert_eq!(metainfo.files[0].offset, 0);
        assert_eq!(metainfo.files[1].path, PathBuf::from("demo/sub/b.txt"));
        assert_eq!(metainfo.files[1].offset, 10);
    }

    #[test]
    fn test_info_hash_matches_raw_slice() {
        let data = single_file_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        let info = raw_slice(&data, &["info"]).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(info);
        let expected: Sha1Hash = hasher.finalize().into();

        assert_eq!(metainfo.info_hash, expected);
        assert_eq!(metainfo.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_piece_length_at() {
        let metainfo = Metainfo::parse(&multi_file_torrent()).unwrap();

        // total 20 bytes, piece length 16: last piece is 4 bytes
        assert_eq!(metainfo.piece_length_at(0), Some(16));
        assert_eq!(metainfo.piece_length_at(1), Some(4));
        assert_eq!(metainfo.piece_length_at(2), None);
    }

    #[test]
    fn test_bitfield_len() {
        let metainfo = Metainfo::parse(&multi_file_torrent()).unwrap();
        assert_eq!(metainfo.bitfield_len(), 1);
    }

    #[test]
    fn test_rejects_missing_announce() {
        let data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(
            Metainfo::parse(data),
            Err(Error::MetainfoInvalid { field: "announce", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_pieces_length() {
        let data = b"d8:announce11:http://a/an4:infod6:lengthi100e4:name4:test12:piece lengthi1024e6:pieces5:12345ee";
        assert!(Metainfo::parse(data).is_err());
    }

    #[test]
    fn test_rejects_both_length_and_files() {
        let data = b"d8:announce11:http://a/an4:infod5:filesld6:lengthi1e4:pathl1:aeee6:lengthi1e4:name1:n12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(Metainfo::parse(data).is_err());
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        // 100 bytes at piece length 32768 needs 1 piece, not 2
        let pieces = vec![0u8; 40];
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce11:http://a/an4:infod");
        data.extend_from_slice(b"6:lengthi100e4:name1:a12:piece lengthi32768e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let pieces = vec![0u8; 20];
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce11:http://a/an4:infod");
        data.extend_from_slice(b"5:filesld6:lengthi10e4:pathl2:..6:secretee");
        data.extend_from_slice(b"e4:name4:demo12:piece lengthi16e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_non_http_announce() {
        let pieces = vec![0u8; 20];
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce14:udp://a:80/ann4:infod");
        data.extend_from_slice(b"6:lengthi100e4:name1:a12:piece lengthi32768e");
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }
}
