//! Minimal deterministic DAG-CBOR: the subset needed for archive headers and
//! graph nodes.

use crate::cid::Cid;
use crate::error::{Error, Result};

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const TAG_CID: u64 = 42;

/// Nesting limit when decoding untrusted input.
const MAX_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Uint(u64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
    Link(Cid),
}

impl Value {
    /// Build a map; keys are put into DAG-CBOR canonical order.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut entries: Vec<(String, Value)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));
        Value::Map(entries)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Value::Link(cid) => Some(cid),
            _ => None,
        }
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Uint(v) => write_head(out, MAJOR_UINT, *v),
        Value::Bytes(b) => {
            write_head(out, MAJOR_BYTES, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            write_head(out, MAJOR_TEXT, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(entries) => {
            write_head(out, MAJOR_MAP, entries.len() as u64);
            for (k, v) in entries {
                write_head(out, MAJOR_TEXT, k.len() as u64);
                out.extend_from_slice(k.as_bytes());
                encode_into(v, out);
            }
        }
        Value::Link(cid) => {
            write_head(out, MAJOR_TAG, TAG_CID);
            let bytes = cid.to_bytes();
            // multibase identity prefix
            write_head(out, MAJOR_BYTES, bytes.len() as u64 + 1);
            out.push(0x00);
            out.extend_from_slice(&bytes);
        }
    }
}

fn write_head(out: &mut Vec<u8>, major: u8, v: u64) {
    let m = major << 5;
    if v < 24 {
        out.push(m | v as u8);
    } else if v <= u64::from(u8::MAX) {
        out.push(m | 24);
        out.push(v as u8);
    } else if v <= u64::from(u16::MAX) {
        out.push(m | 25);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= u64::from(u32::MAX) {
        out.push(m | 26);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(m | 27);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Decode exactly one value spanning all of `buf`.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let mut pos = 0usize;
    let value = decode_at(buf, &mut pos, 0)?;
    if pos != buf.len() {
        return Err(Error::Archive(format!("{} trailing bytes after CBOR value", buf.len() - pos)));
    }
    Ok(value)
}

fn decode_at(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Archive("CBOR nesting too deep".into()));
    }
    let (major, arg) = read_head(buf, pos)?;
    match major {
        MAJOR_UINT => Ok(Value::Uint(arg)),
        MAJOR_BYTES => Ok(Value::Bytes(take(buf, pos, arg)?.to_vec())),
        MAJOR_TEXT => Ok(Value::Text(read_text(buf, pos, arg)?)),
        MAJOR_ARRAY => {
            let n = bounded_len(buf, *pos, arg)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(decode_at(buf, pos, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        MAJOR_MAP => {
            let n = bounded_len(buf, *pos, arg)?;
            let mut entries = Vec::with_capacity(n);
            for _ in 0..n {
                let (kmajor, klen) = read_head(buf, pos)?;
                if kmajor != MAJOR_TEXT {
                    return Err(Error::Archive("CBOR map key is not text".into()));
                }
                let key = read_text(buf, pos, klen)?;
                entries.push((key, decode_at(buf, pos, depth + 1)?));
            }
            Ok(Value::Map(entries))
        }
        MAJOR_TAG if arg == TAG_CID => {
            let (bmajor, blen) = read_head(buf, pos)?;
            if bmajor != MAJOR_BYTES {
                return Err(Error::Archive("CID tag does not wrap bytes".into()));
            }
            let raw = take(buf, pos, blen)?;
            match raw.split_first() {
                Some((0x00, cid)) => Ok(Value::Link(Cid::from_bytes(cid)?)),
                _ => Err(Error::Archive("CID link missing identity multibase prefix".into())),
            }
        }
        _ => Err(Error::Archive(format!("unsupported CBOR major type {major} (arg {arg})"))),
    }
}

fn read_head(buf: &[u8], pos: &mut usize) -> Result<(u8, u64)> {
    let first = take(buf, pos, 1)?[0];
    let major = first >> 5;
    let info = first & 0x1f;
    let arg = match info {
        0..=23 => u64::from(info),
        24 => u64::from(take(buf, pos, 1)?[0]),
        25 => {
            let b = take(buf, pos, 2)?;
            u64::from(u16::from_be_bytes([b[0], b[1]]))
        }
        26 => {
            let b = take(buf, pos, 4)?;
            u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        27 => {
            let mut b8 = [0u8; 8];
            b8.copy_from_slice(take(buf, pos, 8)?);
            u64::from_be_bytes(b8)
        }
        _ => return Err(Error::Archive(format!("unsupported CBOR additional info {info}"))),
    };
    Ok((major, arg))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: u64) -> Result<&'a [u8]> {
    let len = bounded_len(buf, *pos, len)?;
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

fn read_text(buf: &[u8], pos: &mut usize, len: u64) -> Result<String> {
    let raw = take(buf, pos, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Archive("CBOR text is not UTF-8".into()))
}

// Any length (or element count) larger than the bytes left is corrupt.
fn bounded_len(buf: &[u8], pos: usize, len: u64) -> Result<usize> {
    let remaining = buf.len().saturating_sub(pos) as u64;
    if len > remaining {
        return Err(Error::Archive(format!("CBOR length {len} exceeds remaining {remaining}")));
    }
    Ok(len as usize)
}
