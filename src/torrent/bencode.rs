//! Bencode codec
//!
//! A hand-written parser is used instead of a serde adapter because the
//! info-hash is defined over the *raw bytes* of the `info` value as they
//! appear in the source file: [`raw_slice`] walks the original buffer and
//! returns the byte-exact span of a keyed value, which is then fed to SHA-1
//! unchanged.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Maximum allowed length for a bencode string (100 MiB).
/// Prevents malicious torrents from causing memory exhaustion.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    if s.len() <= 50 {
                        write!(f, "Bytes(\"{}\")", s)
                    } else {
                        write!(f, "Bytes(\"{}...\" [{} bytes])", &s[..50], b.len())
                    }
                } else {
                    write!(f, "Bytes([{} bytes])", b.len())
                }
            }
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).to_string(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// Result of parsing bencode, includes the remaining unparsed bytes
pub struct ParseResult<'a> {
    /// The parsed value
    pub value: BencodeValue,
    /// The remaining unparsed bytes
    pub remaining: &'a [u8],
}

impl BencodeValue {
    /// Parse one bencode value from the front of `data`.
    ///
    /// Returns the parsed value and the remaining unparsed bytes.
    pub fn parse(data: &[u8]) -> Result<ParseResult<'_>> {
        match data.first() {
            None => Err(Error::bencode("empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data),
            Some(b'd') => Self::parse_dict(data),
            Some(b'0'..=b'9') => Self::parse_bytes(data),
            Some(c) => Err(Error::bencode(format!(
                "unexpected byte {:?} at value start",
                *c as char
            ))),
        }
    }

    /// Parse a complete bencode value, rejecting trailing data
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let result = Self::parse(data)?;
        if !result.remaining.is_empty() {
            return Err(Error::bencode(format!(
                "trailing data: {} bytes",
                result.remaining.len()
            )));
        }
        Ok(result.value)
    }

    /// Parse an integer: `i<number>e`
    fn parse_integer(data: &[u8]) -> Result<ParseResult<'_>> {
        let end = data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| Error::bencode("unterminated integer"))?
            + 1;

        let num_str = std::str::from_utf8(&data[1..end])
            .map_err(|_| Error::bencode("non-ASCII bytes in integer"))?;

        if num_str.len() > 1 && num_str.starts_with('0') {
            return Err(Error::bencode("integer with leading zero"));
        }
        if num_str == "-0" {
            return Err(Error::bencode("negative zero integer"));
        }
        if num_str.starts_with("-0") && num_str.len() > 2 {
            return Err(Error::bencode("integer with leading zero after minus"));
        }

        let value = num_str
            .parse::<i64>()
            .map_err(|_| Error::bencode(format!("unparsable integer {:?}", num_str)))?;

        Ok(ParseResult {
            value: BencodeValue::Integer(value),
            remaining: &data[end + 1..],
        })
    }

    /// Parse a byte string: `<length>:<data>`
    fn parse_bytes(data: &[u8]) -> Result<ParseResult<'_>> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| Error::bencode("string without ':' separator"))?;

        let len_str = std::str::from_utf8(&data[..colon])
            .map_err(|_| Error::bencode("non-ASCII bytes in string length"))?;

        if !len_str.bytes().all(|b| b.is_ascii_digit()) || len_str.is_empty() {
            return Err(Error::bencode(format!(
                "non-digit in string length {:?}",
                len_str
            )));
        }

        let len = len_str
            .parse::<usize>()
            .map_err(|_| Error::bencode(format!("string length overflow {:?}", len_str)))?;

        if len > MAX_STRING_LENGTH {
            return Err(Error::bencode(format!(
                "string length {} exceeds maximum {}",
                len, MAX_STRING_LENGTH
            )));
        }

        let start = colon + 1;
        let end = start + len;
        if end > data.len() {
            return Err(Error::bencode(format!(
                "truncated string: declared {} bytes, {} available",
                len,
                data.len() - start
            )));
        }

        Ok(ParseResult {
            value: BencodeValue::Bytes(data[start..end].to_vec()),
            remaining: &data[end..],
        })
    }

    /// Parse a list: `l<items>e`
    fn parse_list(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = Vec::new();
        let mut remaining = &data[1..];

        while !remaining.is_empty() && remaining[0] != b'e' {
            let result = Self::parse(remaining)?;
            items.push(result.value);
            remaining = result.remaining;
        }

        if remaining.is_empty() {
            return Err(Error::bencode("unterminated list"));
        }

        Ok(ParseResult {
            value: BencodeValue::List(items),
            remaining: &remaining[1..],
        })
    }

    /// Parse a dictionary: `d<pairs>e`.
    ///
    /// Keys out of lexicographic order are tolerated here (real-world
    /// torrents contain them); the encoder always emits sorted keys.
    fn parse_dict(data: &[u8]) -> Result<ParseResult<'_>> {
        let mut items = BTreeMap::new();
        let mut remaining = &data[1..];

        while !remaining.is_empty() && remaining[0] != b'e' {
            let key_result = Self::parse_bytes(remaining)?;
            let key = match key_result.value {
                BencodeValue::Bytes(k) => k,
                _ => return Err(Error::bencode("dict key must be a string")),
            };
            remaining = key_result.remaining;

            let value_result = Self::parse(remaining)?;
            items.insert(key, value_result.value);
            remaining = value_result.remaining;
        }

        if remaining.is_empty() {
            return Err(Error::bencode("unterminated dict"));
        }

        Ok(ParseResult {
            value: BencodeValue::Dict(items),
            remaining: &remaining[1..],
        })
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode into an existing buffer. Dict keys come out in lexicographic
    /// byte order since the map is a `BTreeMap`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessor methods

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }

    /// Get a dict value by key, with a precise error on absence
    pub fn require(&self, key: &str) -> Result<&BencodeValue> {
        self.get(key).ok_or_else(|| Error::key_not_found(key))
    }
}

/// Walk one bencoded value in `data` and return the index just past it.
fn skip_value(data: &[u8], start: usize) -> Result<usize> {
    let rest = data
        .get(start..)
        .ok_or_else(|| Error::bencode("truncated input"))?;
    let result = BencodeValue::parse(rest)?;
    Ok(data.len() - result.remaining.len())
}

/// Return the byte-exact span of the value stored under `path` inside the
/// bencoded dictionary in `data`.
///
/// The span includes the value's leading type byte and trailing `e` where
/// applicable, exactly as encountered in the buffer; hashing this slice
/// reproduces the digest other clients compute. Resolution walks the
/// structure (it never does a substring search, which could match key
/// bytes inside unrelated string data).
pub fn raw_slice<'a>(data: &'a [u8], path: &[&str]) -> Result<&'a [u8]> {
    let (first, rest) = match path.split_first() {
        Some(split) => split,
        None => return Ok(data),
    };

    if data.first() != Some(&b'd') {
        return Err(Error::bencode("raw_slice root is not a dict"));
    }

    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        // Dict key
        let key_end = skip_value(data, pos)?;
        let key_result = BencodeValue::parse_bytes(&data[pos..key_end])?;
        let key = match key_result.value {
            BencodeValue::Bytes(k) => k,
            _ => return Err(Error::bencode("dict key must be a string")),
        };

        // Dict value span
        let value_end = skip_value(data, key_end)?;

        if key == first.as_bytes() {
            let span = &data[key_end..value_end];
            return if rest.is_empty() {
                Ok(span)
            } else {
                raw_slice(span, rest)
            };
        }
        pos = value_end;
    }

    Err(Error::key_not_found(*first))
}
