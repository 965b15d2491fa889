use carpack_core::publish::{self, HttpPublisher, PublishConfig, Publisher};
use carpack_core::{run_job, BatchConfig, ErrorKind, FileSpan, Manifest, Scheduler};
use std::path::Path;

fn write_config(dir: &Path, json: &str) -> std::path::PathBuf {
    let p = dir.join("publish.json");
    std::fs::write(&p, json).unwrap();
    p
}

fn car_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".car"))
        .collect();
    names.sort();
    names
}

/// One manifest over a single file of `len` bytes under `base`.
fn one_file(base: &Path, len: usize) -> Manifest {
    let p = base.join("payload.bin");
    std::fs::create_dir_all(base).unwrap();
    std::fs::write(&p, (0..len).map(|i| (i * 31 % 256) as u8).collect::<Vec<u8>>()).unwrap();
    Manifest::new(vec![FileSpan::whole(p.to_string_lossy(), len as u64)])
}

#[test]
fn missing_config_is_a_publish_error() {
    let td = tempfile::tempdir().unwrap();
    let err = PublishConfig::load(&td.path().join("nope.json")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Publish);
}

#[test]
fn config_without_endpoint_needs_sim() {
    let td = tempfile::tempdir().unwrap();
    let p = write_config(td.path(), r#"{"token": "t"}"#);
    assert_eq!(PublishConfig::load(&p).unwrap_err().kind(), ErrorKind::Publish);

    let p = write_config(td.path(), "not json");
    assert_eq!(PublishConfig::load(&p).unwrap_err().kind(), ErrorKind::Publish);
}

#[test]
fn sim_config_loads() {
    let td = tempfile::tempdir().unwrap();
    let p = write_config(td.path(), r#"{"endpoint": "http://store.invalid/cars/", "sim": true}"#);
    let cfg = PublishConfig::load(&p).unwrap();
    assert!(cfg.sim);
    assert_eq!(cfg.endpoint, "http://store.invalid/cars/");
    assert_eq!(cfg.token, None);
}

#[test]
fn sim_publish_returns_url_and_keeps_scratch() {
    let td = tempfile::tempdir().unwrap();
    let local = td.path().join("scratch.car");
    std::fs::write(&local, b"car").unwrap();
    let out = td.path().join("out");
    std::fs::create_dir(&out).unwrap();

    // nothing listens on the discard port; an actual upload would fail
    let p = HttpPublisher::new(PublishConfig {
        endpoint: "http://127.0.0.1:9/cars/".into(),
        token: Some("secret".into()),
        sim: true,
    });
    let url = p.publish(&local, &out, "piece.car").unwrap();
    assert_eq!(url, "http://127.0.0.1:9/cars/piece.car");
    assert_eq!(std::fs::read(&local).unwrap(), b"car");
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
}

#[test]
fn publisher_from_config_path() {
    let td = tempfile::tempdir().unwrap();
    assert_eq!(publish::from_config_path(None).unwrap().describe(), "local rename");

    let p = write_config(td.path(), r#"{"endpoint": "http://store.invalid", "sim": true}"#);
    let remote = publish::from_config_path(Some(p)).unwrap();
    assert!(remote.describe().contains("simulated"), "{}", remote.describe());

    let err = publish::from_config_path(Some(td.path().join("absent.json"))).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Publish);
}

#[test]
fn sim_publisher_through_a_job() {
    let td = tempfile::tempdir().unwrap();
    let base = td.path().join("data");
    let m = one_file(&base, 3000);
    let out = td.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let p = write_config(td.path(), r#"{"endpoint": "http://store.invalid/cars", "sim": true}"#);

    let mut cfg = BatchConfig::new(&base, &out);
    cfg.publisher = publish::from_config_path(Some(p)).unwrap();
    let r = run_job(&m, &cfg).unwrap();
    assert_eq!(r.location, format!("http://store.invalid/cars/{}", r.file_name));
    // the archive stays under its scratch name
    let names = car_names(&out);
    assert_eq!(names.len(), 1);
    assert_ne!(names[0], r.file_name);
}

#[test]
fn failed_promotion_leaves_scratch_in_place() {
    let td = tempfile::tempdir().unwrap();
    let base = td.path().join("data");
    let m = one_file(&base, 5000);
    let scratch = td.path().join("scratch");
    std::fs::create_dir(&scratch).unwrap();
    let out = td.path().join("missing-out");

    let mut cfg = BatchConfig::new(&base, &out);
    cfg.scratch_dir = Some(scratch.clone());
    let err = run_job(&m, &cfg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    let left = car_names(&scratch);
    assert_eq!(left.len(), 1);
    assert!(!left[0].starts_with("baga"));
    assert!(!out.exists());
}

#[test]
fn scratch_on_another_filesystem() {
    let shm = Path::new("/dev/shm");
    if !shm.is_dir() {
        return;
    }
    let scratch = tempfile::tempdir_in(shm).unwrap();
    let td = tempfile::tempdir_in(std::env::temp_dir()).unwrap();
    let base = td.path().join("data");
    let m = one_file(&base, 5000);
    let out = td.path().join("out");
    std::fs::create_dir(&out).unwrap();

    let mut cfg = BatchConfig::new(&base, &out);
    cfg.scratch_dir = Some(scratch.path().to_path_buf());
    let results = Scheduler::new(cfg).run([m]).unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];

    assert_eq!(car_names(&out), vec![r.file_name.clone()]);
    let bytes = std::fs::read(out.join(&r.file_name)).unwrap();
    assert_eq!(bytes.len() as u64, r.car_size);
    assert_eq!(carpack_core::car::verify_archive(bytes.as_slice()).unwrap().root, r.data_cid);
    assert!(car_names(scratch.path()).is_empty());
    // no hidden staging copies left behind
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
}
