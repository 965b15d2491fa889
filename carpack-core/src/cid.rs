//! CIDv1 content identifiers: binary form, base32 text form, and the
//! handful of codecs and multihash codes this crate produces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub const CODEC_RAW: u64 = 0x55;
pub const CODEC_DAG_CBOR: u64 = 0x71;
pub const CODEC_FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

pub const HASH_IDENTITY: u64 = 0x00;
pub const HASH_BLAKE3: u64 = 0x1e;
pub const HASH_SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// Longest inline digest accepted for identity CIDs.
const MAX_DIGEST_LEN: usize = 64;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    codec: u64,
    hash_code: u64,
    digest: Vec<u8>,
}

impl Cid {
    pub fn new(codec: u64, hash_code: u64, digest: &[u8]) -> Self {
        Self { codec, hash_code, digest: digest.to_vec() }
    }

    /// Raw-codec CID over the BLAKE3 digest of `data`.
    pub fn raw(data: &[u8]) -> Self {
        Self::new(CODEC_RAW, HASH_BLAKE3, blake3::hash(data).as_bytes())
    }

    /// DAG-CBOR CID over the BLAKE3 digest of an encoded node.
    pub fn dag_cbor(encoded: &[u8]) -> Self {
        Self::new(CODEC_DAG_CBOR, HASH_BLAKE3, blake3::hash(encoded).as_bytes())
    }

    /// Identifier of the zero-length leaf. It inlines its (empty) content,
    /// so no archive record is ever needed to resolve it.
    pub fn empty_leaf() -> Self {
        Self::new(CODEC_RAW, HASH_IDENTITY, &[])
    }

    /// Piece CID for a raw piece commitment.
    pub fn piece(commitment: &[u8; 32]) -> Self {
        Self::new(CODEC_FIL_COMMITMENT_UNSEALED, HASH_SHA2_256_TRUNC254_PADDED, commitment)
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn hash_code(&self) -> u64 {
        self.hash_code
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn is_inline(&self) -> bool {
        self.hash_code == HASH_IDENTITY
    }

    /// Check that `data` is the content this identifier names.
    pub fn verifies(&self, data: &[u8]) -> bool {
        match self.hash_code {
            HASH_IDENTITY => self.digest == data,
            HASH_BLAKE3 => self.digest == blake3::hash(data).as_bytes(),
            _ => false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.digest.len());
        write_varint(&mut out, 1);
        write_varint(&mut out, self.codec);
        write_varint(&mut out, self.hash_code);
        write_varint(&mut out, self.digest.len() as u64);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Decode a binary CID from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn read_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let version = read_varint(buf, &mut pos)?;
        if version != 1 {
            return Err(Error::Archive(format!("unsupported CID version {version}")));
        }
        let codec = read_varint(buf, &mut pos)?;
        let hash_code = read_varint(buf, &mut pos)?;
        let len = read_varint(buf, &mut pos)? as usize;
        if len > MAX_DIGEST_LEN || pos + len > buf.len() {
            return Err(Error::Archive(format!("bad multihash length {len}")));
        }
        let digest = buf[pos..pos + len].to_vec();
        pos += len;
        Ok((Self { codec, hash_code, digest }, pos))
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (cid, used) = Self::read_bytes(buf)?;
        if used != buf.len() {
            return Err(Error::Archive("trailing bytes after CID".into()));
        }
        Ok(cid)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", base32_encode(&self.to_bytes()))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(body) = s.strip_prefix('b') else {
            return Err(Error::Archive(format!("unsupported multibase in {s:?}")));
        };
        let bytes = base32_decode(body)
            .ok_or_else(|| Error::Archive(format!("invalid base32 in {s:?}")))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Unsigned LEB128, as used by multiformats and CAR framing.
pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some(&b) = buf.get(*pos) else {
            return Err(Error::Archive("truncated varint".into()));
        };
        *pos += 1;
        if shift == 63 && b > 1 {
            return Err(Error::Archive("varint overflows u64".into()));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::Archive("varint overflows u64".into()));
        }
    }
}

const B32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc = 0u32;
    let mut bits = 0u32;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(B32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(B32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut acc = 0u32;
    let mut bits = 0u32;
    for c in s.bytes() {
        let v = B32_ALPHABET.iter().position(|&a| a == c.to_ascii_lowercase())? as u32;
        acc = (acc << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}
