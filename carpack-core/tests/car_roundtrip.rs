use carpack_core::car::{verify_archive, write_car, CarHeader, CarReader};
use carpack_core::cbor;
use carpack_core::graph::build;
use carpack_core::{Cid, ErrorKind, FileSpan, Manifest};
use std::path::Path;

fn fill(path: &Path, len: usize, seed: u64) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let data: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn sample(root: &Path) -> Manifest {
    let files = [("docs/a.txt", 700), ("docs/deep/b.bin", 5000), ("c.bin", 64), ("docs/e.bin", 0)];
    let mut spans = Vec::new();
    for (i, (rel, len)) in files.iter().enumerate() {
        let p = root.join(rel);
        fill(&p, *len, i as u64);
        spans.push(FileSpan::whole(p.to_string_lossy(), *len as u64));
    }
    Manifest::new(spans)
}

#[test]
fn replay_reconstructs_the_graph() {
    let td = tempfile::tempdir().unwrap();
    let m = sample(td.path());
    // small chunks so b.bin spans several records
    let out = build(&m, td.path(), 1024).unwrap();
    let mut bytes: Vec<u8> = Vec::new();
    let layout = write_car(&out.graph, &mut bytes).unwrap();
    assert_eq!(layout.size, bytes.len() as u64);

    let mut reader = CarReader::new(bytes.as_slice()).unwrap();
    assert_eq!(reader.header(), &CarHeader::new(out.graph.root_cid().clone()));

    let expected: Vec<(Cid, u64)> = out
        .graph
        .emission_order()
        .map(|(id, n)| (n.cid.clone(), layout.offsets[id].unwrap()))
        .collect();
    let mut seen = Vec::new();
    loop {
        let at = reader.position();
        match reader.next_record().unwrap() {
            Some((cid, _)) => seen.push((cid, at)),
            None => break,
        }
    }
    assert_eq!(seen, expected);
    assert_eq!(seen.last().unwrap().0, *out.graph.root_cid());

    let summary = verify_archive(bytes.as_slice()).unwrap();
    assert_eq!(summary.root, *out.graph.root_cid());
    assert_eq!(summary.records, layout.records);
    assert_eq!(summary.size, layout.size);
}

#[test]
fn header_is_dag_cbor_with_one_root() {
    let td = tempfile::tempdir().unwrap();
    let m = sample(td.path());
    let out = build(&m, td.path(), 4096).unwrap();
    let mut bytes: Vec<u8> = Vec::new();
    write_car(&out.graph, &mut bytes).unwrap();

    let len = bytes[0] as usize;
    assert!(len < 0x80);
    let header = cbor::decode(&bytes[1..1 + len]).unwrap();
    assert_eq!(header.get("version").and_then(cbor::Value::as_uint), Some(1));
    let roots = header.get("roots").and_then(cbor::Value::as_array).unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].as_link(), Some(out.graph.root_cid()));
}

#[test]
fn same_manifest_same_bytes() {
    let td = tempfile::tempdir().unwrap();
    let m = sample(td.path());
    let encode = || {
        let out = build(&m, td.path(), 2048).unwrap();
        let mut bytes: Vec<u8> = Vec::new();
        write_car(&out.graph, &mut bytes).unwrap();
        bytes
    };
    assert_eq!(encode(), encode());
}

#[test]
fn source_modified_after_build_is_detected() {
    let td = tempfile::tempdir().unwrap();
    let m = sample(td.path());
    let out = build(&m, td.path(), 1024).unwrap();

    let victim = td.path().join("docs/deep/b.bin");
    let mut data = std::fs::read(&victim).unwrap();
    data[3000] ^= 0xff;
    std::fs::write(&victim, &data).unwrap();

    let err = write_car(&out.graph, &mut Vec::<u8>::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(err.to_string().contains("source changed"), "{err}");
}

#[test]
fn damaged_archives_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let m = sample(td.path());
    let out = build(&m, td.path(), 1024).unwrap();
    let mut bytes: Vec<u8> = Vec::new();
    write_car(&out.graph, &mut bytes).unwrap();

    let truncated = &bytes[..bytes.len() - 5];
    assert_eq!(verify_archive(truncated).unwrap_err().kind(), ErrorKind::Archive);

    let mut flipped = bytes.clone();
    let n = flipped.len();
    flipped[n - 40] ^= 0x01;
    assert_eq!(verify_archive(flipped.as_slice()).unwrap_err().kind(), ErrorKind::Archive);

    assert_eq!(verify_archive(&[0u8; 0][..]).unwrap_err().kind(), ErrorKind::Archive);
}
