// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reversible encoding of small structured records into SIP user parts.
//!
//! Values are serialized into length-prefixed tokens:
//!
//! | Value  | Token                                  |
//! |--------|----------------------------------------|
//! | string | `s<len>/<bytes>`                       |
//! | blob   | `b<len>/<bytes>`                       |
//! | array  | `a<count>/<item>...`                   |
//! | struct | `x<count>/<keylen>/<key><value>...`    |
//!
//! The token stream is then restricted to characters legal in a SIP user
//! part. Every other byte becomes `?` followed by two hex digits.
//!
//! ```
//! use sip_regcache::alias_codec::{decode, encode, AliasValue};
//!
//! let mut fields = std::collections::BTreeMap::new();
//! fields.insert("h".to_string(), AliasValue::from("10.0.0.5"));
//! fields.insert("p".to_string(), AliasValue::from("5060"));
//! let value = AliasValue::Struct(fields);
//!
//! let user = encode(&value);
//! assert_eq!(user, "x2/1/hs8/10.0.0.51/ps4/5060");
//! assert_eq!(decode(&user).unwrap(), value);
//! ```

use std::collections::BTreeMap;
use std::fmt;

const STR_LABEL: u8 = b's';
const BLOB_LABEL: u8 = b'b';
const ARRAY_LABEL: u8 = b'a';
const STRUCT_LABEL: u8 = b'x';

const LEN_SEPARATOR: u8 = b'/';
const ESCAPE_CHAR: u8 = b'?';

/// Deepest nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 32;

/// Bytes that pass through unescaped.
const ALLOWED: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
ABCDEFGHIJKLMNOPQRSTUVWXYZ\
0123456789\
-_.!~*'\
&=+$,;/";

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// A value the codec can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasValue {
    Str(String),
    Blob(Vec<u8>),
    Array(Vec<AliasValue>),
    Struct(BTreeMap<String, AliasValue>),
}

impl AliasValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AliasValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, AliasValue>> {
        match self {
            AliasValue::Struct(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for AliasValue {
    fn from(s: &str) -> Self {
        AliasValue::Str(s.to_owned())
    }
}

impl From<String> for AliasValue {
    fn from(s: String) -> Self {
        AliasValue::Str(s)
    }
}

impl From<Vec<u8>> for AliasValue {
    fn from(bytes: Vec<u8>) -> Self {
        AliasValue::Blob(bytes)
    }
}

/// Reasons a user part could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasCodecError {
    /// `?` not followed by two hex digits.
    BadEscape(usize),
    /// Token label is not one of `s`, `b`, `a`, `x`.
    UnknownLabel(u8),
    /// Length or count is missing, empty, or too large.
    BadLength,
    /// Input ended inside a token.
    Truncated,
    /// A string or struct key is not valid UTF-8.
    InvalidUtf8,
    /// Bytes remain after the top-level value.
    TrailingData(usize),
    /// Nesting exceeds [`MAX_DEPTH`].
    TooDeep,
}

impl fmt::Display for AliasCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEscape(pos) => write!(f, "invalid escape sequence at offset {}", pos),
            Self::UnknownLabel(label) => write!(f, "unknown label '{}'", label.escape_ascii()),
            Self::BadLength => write!(f, "missing or invalid length"),
            Self::Truncated => write!(f, "input truncated"),
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::TrailingData(len) => write!(f, "{} trailing bytes after value", len),
            Self::TooDeep => write!(f, "nesting deeper than {}", MAX_DEPTH),
        }
    }
}

impl std::error::Error for AliasCodecError {}

/// Encodes `value` into a string made of user-part characters only.
pub fn encode(value: &AliasValue) -> String {
    let mut raw = Vec::new();
    write_value(value, &mut raw);

    let mut out = String::with_capacity(raw.len());
    for byte in raw {
        if ALLOWED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push(ESCAPE_CHAR as char);
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0f) as usize] as char);
        }
    }
    tracing::trace!(encoded = %out, "encoded alias variables");
    out
}

/// Decodes a string produced by [`encode`].
pub fn decode(src: &str) -> Result<AliasValue, AliasCodecError> {
    let raw = unescape(src.as_bytes())?;
    let mut reader = Reader { buf: &raw, pos: 0 };
    let value = reader.read_value(0)?;
    let rest = raw.len() - reader.pos;
    if rest > 0 {
        return Err(AliasCodecError::TrailingData(rest));
    }
    Ok(value)
}

/// Returns true if `c` may appear in [`encode`] output.
pub fn is_encoded_char(c: char) -> bool {
    c.is_ascii() && (ALLOWED.contains(&(c as u8)) || c as u8 == ESCAPE_CHAR || c.is_ascii_hexdigit())
}

fn write_value(value: &AliasValue, out: &mut Vec<u8>) {
    match value {
        AliasValue::Str(s) => write_bytes(STR_LABEL, s.as_bytes(), out),
        AliasValue::Blob(b) => write_bytes(BLOB_LABEL, b, out),
        AliasValue::Array(items) => {
            write_header(ARRAY_LABEL, items.len(), out);
            for item in items {
                write_value(item, out);
            }
        }
        AliasValue::Struct(fields) => {
            write_header(STRUCT_LABEL, fields.len(), out);
            for (key, item) in fields {
                write_len(key.len(), out);
                out.extend_from_slice(key.as_bytes());
                write_value(item, out);
            }
        }
    }
}

fn write_bytes(label: u8, bytes: &[u8], out: &mut Vec<u8>) {
    write_header(label, bytes.len(), out);
    out.extend_from_slice(bytes);
}

fn write_header(label: u8, len: usize, out: &mut Vec<u8>) {
    out.push(label);
    write_len(len, out);
}

fn write_len(len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(len.to_string().as_bytes());
    out.push(LEN_SEPARATOR);
}

fn unescape(src: &[u8]) -> Result<Vec<u8>, AliasCodecError> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] == ESCAPE_CHAR {
            let hi = src.get(i + 1).and_then(|c| hex_value(*c));
            let lo = src.get(i + 2).and_then(|c| hex_value(*c));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(AliasCodecError::BadEscape(i)),
            }
            i += 3;
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_value(&mut self, depth: usize) -> Result<AliasValue, AliasCodecError> {
        if depth > MAX_DEPTH {
            return Err(AliasCodecError::TooDeep);
        }
        let label = *self.buf.get(self.pos).ok_or(AliasCodecError::Truncated)?;
        self.pos += 1;
        match label {
            STR_LABEL => {
                let bytes = self.read_string()?;
                let s = std::str::from_utf8(bytes).map_err(|_| AliasCodecError::InvalidUtf8)?;
                Ok(AliasValue::Str(s.to_owned()))
            }
            BLOB_LABEL => Ok(AliasValue::Blob(self.read_string()?.to_vec())),
            ARRAY_LABEL => {
                let count = self.read_len()?;
                // count is untrusted; grow as items actually decode
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(AliasValue::Array(items))
            }
            STRUCT_LABEL => {
                let count = self.read_len()?;
                let mut fields = BTreeMap::new();
                for _ in 0..count {
                    let key = self.read_string()?;
                    let key = std::str::from_utf8(key)
                        .map_err(|_| AliasCodecError::InvalidUtf8)?
                        .to_owned();
                    let value = self.read_value(depth + 1)?;
                    fields.insert(key, value);
                }
                Ok(AliasValue::Struct(fields))
            }
            other => Err(AliasCodecError::UnknownLabel(other)),
        }
    }

    fn read_len(&mut self) -> Result<usize, AliasCodecError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            let c = *self.buf.get(self.pos).ok_or(AliasCodecError::Truncated)?;
            self.pos += 1;
            match c {
                b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((c - b'0') as usize))
                        .ok_or(AliasCodecError::BadLength)?;
                }
                LEN_SEPARATOR if self.pos - 1 > start => return Ok(len),
                _ => return Err(AliasCodecError::BadLength),
            }
        }
    }

    fn read_string(&mut self) -> Result<&'a [u8], AliasCodecError> {
        let len = self.read_len()?;
        let end = self.pos.checked_add(len).ok_or(AliasCodecError::BadLength)?;
        let bytes = self.buf.get(self.pos..end).ok_or(AliasCodecError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }
}
