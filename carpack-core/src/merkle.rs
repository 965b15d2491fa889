//! Binary Merkle tree over 32-byte nodes, using the piece-commitment
//! compression function.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

pub type Node = [u8; 32];

/// Deepest tree supported: 2^64 bytes of padded piece.
const MAX_LEVEL: usize = 59;

/// Parent of two children: SHA-256 over `left || right`, top two bits of the
/// final byte cleared so the node stays inside the field.
pub fn combine(left: &Node, right: &Node) -> Node {
    let mut h = Sha256::new();
    h.update(left);
    h.update(right);
    let mut out: Node = h.finalize().into();
    out[31] &= 0x3f;
    out
}

/// Root of an all-zero subtree holding `2^level` leaves.
pub fn zero_commitment(level: usize) -> Node {
    static TABLE: OnceLock<Vec<Node>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut t = Vec::with_capacity(MAX_LEVEL + 1);
        let mut n = [0u8; 32];
        t.push(n);
        for _ in 0..MAX_LEVEL {
            n = combine(&n, &n);
            t.push(n);
        }
        t
    });
    table[level.min(MAX_LEVEL)]
}

/// Compute the root over `leaves`, treating the layer as zero-padded up to the
/// next power of two.
pub fn root(leaves: &[Node]) -> Node {
    if leaves.is_empty() {
        return zero_commitment(0);
    }
    let mut layer: Vec<Node> = leaves.to_vec();
    let mut level = 0usize;
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let right = if pair.len() == 2 { pair[1] } else { zero_commitment(level) };
            next.push(combine(&pair[0], &right));
        }
        layer = next;
        level += 1;
    }
    layer[0]
}
