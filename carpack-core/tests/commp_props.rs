use carpack_core::commp::{self, fr32_expand, natural_size, CommpCalc, QUAD_IN};
use carpack_core::merkle::{self, Node};
use carpack_core::ErrorKind;
use proptest::prelude::*;

fn commit(data: &[u8]) -> carpack_core::Commitment {
    let mut c = CommpCalc::new();
    c.update(data);
    c.finish().unwrap()
}

/// Reference: expand everything up front and hash the full tree at once.
fn reference_root(data: &[u8], size: u64) -> Node {
    let mut leaves: Vec<Node> = Vec::new();
    for quad in data.chunks(QUAD_IN) {
        let mut q = [0u8; QUAD_IN];
        q[..quad.len()].copy_from_slice(quad);
        for leaf in fr32_expand(&q).chunks_exact(32) {
            leaves.push(leaf.try_into().unwrap());
        }
    }
    leaves.resize((size / 32) as usize, [0u8; 32]);
    merkle::root(&leaves)
}

#[test]
fn streaming_matches_reference_tree() {
    let mut rng = fastrand::Rng::with_seed(7);
    for len in [1usize, 126, 127, 128, 254, 255, 1000, 127 * 64, 127 * 64 + 1] {
        let data: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
        let c = commit(&data);
        assert_eq!(c.size, natural_size(len as u64));
        assert_eq!(c.digest, reference_root(&data, c.size), "len {len}");
    }
}

#[test]
fn write_granularity_does_not_matter() {
    let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();
    let whole = commit(&data);
    let mut c = CommpCalc::new();
    for piece in data.chunks(13) {
        c.update(piece);
    }
    assert_eq!(c.finish().unwrap(), whole);
}

#[test]
fn zero_data_is_the_zero_commitment() {
    let c = commit(&[0u8; 127 * 8]);
    assert_eq!(c.size, 1024);
    assert_eq!(c.digest, merkle::zero_commitment(5));
}

#[test]
fn zero_piece_has_the_network_cid() {
    let c = commit(&[0u8; 127]);
    assert_eq!(c.size, 128);
    assert_eq!(
        c.cid().to_string(),
        "baga6ea4seaqdomn3tgwgrh3g532zopskstnbrd2n3sxfqbze7rxt7vqn7veigmy"
    );
}

#[test]
fn fr32_leaves_two_zero_bits_per_leaf() {
    let out = fr32_expand(&[0xff; QUAD_IN]);
    for leaf in out.chunks_exact(32) {
        assert_eq!(&leaf[..31], &[0xff; 31][..]);
        assert_eq!(leaf[31], 0x3f);
    }
}

#[test]
fn known_piece_cids() {
    let hello = commit(b"hello world");
    assert_eq!(hello.size, 128);
    assert_eq!(
        hello.cid().to_string(),
        "baga6ea4seaqo4xahwtvbmhunywt2yhzjebhylq4yei73dmrzu7bky4lnev6ukgq"
    );

    let counting: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let c = commit(&counting);
    assert_eq!(c.size, 512);
    assert_eq!(
        c.cid().to_string(),
        "baga6ea4seaqbna2cxi3rehc36dtblm36odiguq2w7u5bvi3wy5xl73xvblyxkgy"
    );
}

#[test]
fn piece_cid_prefix() {
    let c = commit(b"some archive bytes");
    let s = c.cid().to_string();
    assert!(s.starts_with("baga6ea4sea"), "{s}");
    assert_eq!(s.parse::<carpack_core::Cid>().unwrap(), c.cid());
}

#[test]
fn finish_at_too_small_is_invalid_size() {
    let mut c = CommpCalc::new();
    c.update(&[1u8; 300]);
    let err = c.finish_at(256).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSize);
    let mut c = CommpCalc::new();
    c.update(&[1u8; 3]);
    assert_eq!(c.finish_at(1000).unwrap_err().kind(), ErrorKind::InvalidSize);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn padding_matches_direct_accumulation(
        data in proptest::collection::vec(any::<u8>(), 0..3000),
        doublings in 0u32..6,
    ) {
        let natural = commit(&data);
        let target = natural.size << doublings;
        let padded = commp::pad(&natural.digest, natural.size, target).unwrap();
        let mut direct = CommpCalc::new();
        direct.update(&data);
        let direct = direct.finish_at(target).unwrap();
        prop_assert_eq!(padded, direct.digest);
        prop_assert_eq!(natural.padded_to(target).unwrap(), direct);
    }

    #[test]
    fn size_class_holds_the_data(bytes in 0u64..(1u64 << 40)) {
        let s = natural_size(bytes);
        prop_assert!(s.is_power_of_two());
        prop_assert!(s >= commp::MIN_PIECE_SIZE);
        prop_assert!(s / 128 * 127 >= bytes);
        if s > commp::MIN_PIECE_SIZE {
            prop_assert!((s / 2) / 128 * 127 < bytes);
        }
    }
}
