//! Streaming piece-commitment accumulator.
//!
//! Input is consumed in 127-byte quads. Each quad is fr32-expanded into four
//! 32-byte leaves (two zero bits inserted after every 254 bits), and leaves
//! are folded into a binary Merkle tree as they arrive, so memory stays at one
//! pending node per tree level regardless of input size.

use std::io;

use serde::Serialize;

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::merkle::{self, Node};

/// Unpadded bytes per fr32 quad.
pub const QUAD_IN: usize = 127;
/// Padded bytes per fr32 quad.
pub const QUAD_OUT: usize = 128;
/// Smallest size class a piece is committed at.
pub const MIN_PIECE_SIZE: u64 = 128;

const NODE_SIZE: u64 = 32;

/// Finalised commitment: root digest and the padded size class it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Commitment {
    pub digest: Node,
    pub size: u64,
}

impl Commitment {
    pub fn cid(&self) -> Cid {
        Cid::piece(&self.digest)
    }

    /// Re-express this commitment at a larger size class.
    pub fn padded_to(&self, target: u64) -> Result<Commitment> {
        Ok(Commitment { digest: pad(&self.digest, self.size, target)?, size: target })
    }
}

pub struct CommpCalc {
    quad: [u8; QUAD_IN],
    quad_len: usize,
    layers: Vec<Option<Node>>,
    bytes: u64,
}

impl Default for CommpCalc {
    fn default() -> Self {
        Self::new()
    }
}

impl CommpCalc {
    pub fn new() -> Self {
        Self { quad: [0u8; QUAD_IN], quad_len: 0, layers: Vec::new(), bytes: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.bytes += data.len() as u64;
        while !data.is_empty() {
            let take = (QUAD_IN - self.quad_len).min(data.len());
            self.quad[self.quad_len..self.quad_len + take].copy_from_slice(&data[..take]);
            self.quad_len += take;
            data = &data[take..];
            if self.quad_len == QUAD_IN {
                self.flush_quad();
            }
        }
    }

    fn flush_quad(&mut self) {
        self.quad[self.quad_len..].fill(0);
        let expanded = fr32_expand(&self.quad);
        for leaf in expanded.chunks_exact(NODE_SIZE as usize) {
            let mut node = [0u8; 32];
            node.copy_from_slice(leaf);
            self.push_leaf(node);
        }
        self.quad_len = 0;
    }

    fn push_leaf(&mut self, mut node: Node) {
        let mut level = 0usize;
        loop {
            if level == self.layers.len() {
                self.layers.push(None);
            }
            match self.layers[level].take() {
                Some(left) => {
                    node = merkle::combine(&left, &node);
                    level += 1;
                }
                None => {
                    self.layers[level] = Some(node);
                    return;
                }
            }
        }
    }

    /// Finalise at the smallest size class holding everything written.
    pub fn finish(self) -> Result<Commitment> {
        let size = natural_size(self.bytes);
        self.finish_at(size)
    }

    /// Finalise at an explicit size class; the tail of the tree is filled
    /// with zero subtrees.
    pub fn finish_at(mut self, size: u64) -> Result<Commitment> {
        validate_size(size)?;
        let natural = natural_size(self.bytes);
        if size < natural {
            return Err(Error::InvalidSize(format!(
                "piece size {size} is smaller than the {natural} bytes needed for {} bytes of data",
                self.bytes
            )));
        }
        if self.quad_len > 0 {
            self.flush_quad();
        }
        let depth = level_of(size);
        let mut carry: Option<Node> = None;
        for level in 0..depth {
            let pending = self.layers.get_mut(level).and_then(Option::take);
            carry = match (pending, carry) {
                (Some(left), Some(right)) => Some(merkle::combine(&left, &right)),
                (Some(left), None) | (None, Some(left)) => {
                    Some(merkle::combine(&left, &merkle::zero_commitment(level)))
                }
                (None, None) => None,
            };
        }
        let digest = carry
            .or_else(|| self.layers.get_mut(depth).and_then(Option::take))
            .unwrap_or_else(|| merkle::zero_commitment(depth));
        Ok(Commitment { digest, size })
    }
}

impl io::Write for CommpCalc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Smallest power-of-two size class `s >= 128` with `s * 127 / 128 >= bytes`.
pub fn natural_size(bytes: u64) -> u64 {
    let padded = bytes.div_ceil(QUAD_IN as u64) * QUAD_OUT as u64;
    padded.max(MIN_PIECE_SIZE).next_power_of_two()
}

pub fn validate_size(size: u64) -> Result<()> {
    if size < MIN_PIECE_SIZE || !size.is_power_of_two() {
        return Err(Error::InvalidSize(format!(
            "{size} is not a power of two of at least {MIN_PIECE_SIZE}"
        )));
    }
    Ok(())
}

/// Expand a commitment computed at `from` bytes to the size class `to`,
/// pairing the root with a zero subtree once per doubling.
pub fn pad(digest: &Node, from: u64, to: u64) -> Result<Node> {
    validate_size(from)?;
    validate_size(to)?;
    if to < from {
        return Err(Error::InvalidSize(format!(
            "cannot pad a {from} byte piece down to {to} bytes"
        )));
    }
    let mut out = *digest;
    for level in level_of(from)..level_of(to) {
        out = merkle::combine(&out, &merkle::zero_commitment(level));
    }
    Ok(out)
}

fn level_of(size: u64) -> usize {
    (size / NODE_SIZE).trailing_zeros() as usize
}

/// Spread 127 bytes over four 254-bit words, each stored in 32 bytes with the
/// top two bits clear.
pub fn fr32_expand(input: &[u8; QUAD_IN]) -> [u8; QUAD_OUT] {
    let mut out = [0u8; QUAD_OUT];
    out[..32].copy_from_slice(&input[..32]);
    out[31] &= 0x3f;
    for i in 32..64 {
        out[i] = (input[i - 1] >> 6) | (input[i] << 2);
    }
    out[63] &= 0x3f;
    for i in 64..96 {
        out[i] = (input[i - 1] >> 4) | (input[i] << 4);
    }
    out[95] &= 0x3f;
    for i in 96..127 {
        out[i] = (input[i - 1] >> 2) | (input[i] << 6);
    }
    out[127] = input[126] >> 2;
    out
}
