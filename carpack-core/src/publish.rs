//! Promotion of a finished archive to its canonical name: a local rename by
//! default, or a hand-off to a remote store.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Environment variable naming the remote publish config file.
pub const PUBLISH_CONFIG_ENV: &str = "CARPACK_PUBLISH_CONFIG";

pub trait Publisher: Send + Sync {
    /// Make the archive at `local` available as `file_name`. Returns where
    /// it ended up.
    fn publish(&self, local: &Path, out_dir: &Path, file_name: &str) -> Result<String>;

    fn describe(&self) -> String;
}

/// Rename the scratch file to `out_dir/file_name`. When the two directories
/// sit on different filesystems the archive is copied into `out_dir` under a
/// hidden staging name first, so the piece name only ever refers to a
/// complete file.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalRename;

impl Publisher for LocalRename {
    fn publish(&self, local: &Path, out_dir: &Path, file_name: &str) -> Result<String> {
        let dest = out_dir.join(file_name);
        // Identical content always maps to the same name, so replacing an
        // existing file is harmless.
        match std::fs::rename(local, &dest) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                tracing::debug!(
                    scratch = %local.display(),
                    dest = %dest.display(),
                    "scratch is on another filesystem, copying"
                );
                copy_across(local, out_dir, &dest)?;
            }
            Err(e) => {
                return Err(Error::io(
                    format!("rename {} to {}", local.display(), dest.display()),
                    e,
                ))
            }
        }
        Ok(dest.display().to_string())
    }

    fn describe(&self) -> String {
        "local rename".into()
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Copy `local` to `<out_dir>/.<uuid>.car`, sync it, rename it onto `dest`
/// and drop the scratch file.
fn copy_across(local: &Path, out_dir: &Path, dest: &Path) -> Result<()> {
    let staging = out_dir.join(format!(".{}.car", Uuid::new_v4()));
    let copied = (|| -> io::Result<()> {
        let mut src = File::open(local)?;
        let mut dst = File::create(&staging)?;
        io::copy(&mut src, &mut dst)?;
        dst.sync_all()?;
        std::fs::rename(&staging, dest)
    })();
    if let Err(e) = copied {
        if let Err(cleanup) = std::fs::remove_file(&staging) {
            tracing::debug!(staging = %staging.display(), error = %cleanup, "staging copy not removed");
        }
        return Err(Error::io(format!("copy {} to {}", local.display(), dest.display()), e));
    }
    if let Err(e) = std::fs::remove_file(local) {
        tracing::warn!(scratch = %local.display(), error = %e, "archive published but scratch file not removed");
    }
    Ok(())
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Base URL; the archive is PUT to `<endpoint>/<file_name>`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Simulation mode: accept every hand-off without uploading.
    #[serde(default)]
    pub sim: bool,
}

impl PublishConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path)
            .map_err(|e| Error::Publish(format!("load publish config {}: {e}", path.display())))?;
        let cfg: PublishConfig = serde_json::from_reader(f)
            .map_err(|e| Error::Publish(format!("parse publish config {}: {e}", path.display())))?;
        if !cfg.sim && cfg.endpoint.is_empty() {
            return Err(Error::Publish(format!(
                "publish config {} has no endpoint and is not in simulation mode",
                path.display()
            )));
        }
        Ok(cfg)
    }
}

/// Upload over HTTP PUT. The scratch file is left where it is.
#[derive(Clone, Debug)]
pub struct HttpPublisher {
    cfg: PublishConfig,
}

impl HttpPublisher {
    pub fn new(cfg: PublishConfig) -> Self {
        Self { cfg }
    }

    fn url(&self, file_name: &str) -> String {
        format!("{}/{}", self.cfg.endpoint.trim_end_matches('/'), file_name)
    }
}

impl Publisher for HttpPublisher {
    fn publish(&self, local: &Path, _out_dir: &Path, file_name: &str) -> Result<String> {
        let url = self.url(file_name);
        if self.cfg.sim {
            tracing::info!(%url, local = %local.display(), "simulated publish");
            return Ok(url);
        }
        let f = File::open(local)
            .map_err(|e| Error::io(format!("open {} for upload", local.display()), e))?;
        let len = f.metadata().map_err(|e| Error::io("stat upload", e))?.len();
        let mut req = ureq::put(&url)
            .set("Content-Type", "application/vnd.ipld.car")
            .set("Content-Length", &len.to_string());
        if let Some(token) = &self.cfg.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        req.send(f).map_err(|e| Error::Publish(format!("upload to {url}: {e}")))?;
        Ok(url)
    }

    fn describe(&self) -> String {
        if self.cfg.sim {
            format!("simulated upload to {}", self.cfg.endpoint)
        } else {
            format!("upload to {}", self.cfg.endpoint)
        }
    }
}

/// Publisher selected by an optional config file path.
pub fn from_config_path(path: Option<PathBuf>) -> Result<std::sync::Arc<dyn Publisher>> {
    match path {
        Some(p) => Ok(std::sync::Arc::new(HttpPublisher::new(PublishConfig::load(&p)?))),
        None => Ok(std::sync::Arc::new(LocalRename)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_across_replaces_scratch_with_canonical_file() {
        let td = tempfile::tempdir().unwrap();
        let scratch = td.path().join("scratch.car");
        std::fs::write(&scratch, b"archive bytes").unwrap();
        let out = td.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let dest = out.join("piece.car");

        copy_across(&scratch, &out, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive bytes");
        assert!(!scratch.exists());
        let names: Vec<_> = std::fs::read_dir(&out).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("piece.car")]);
    }

    #[test]
    fn failed_copy_leaves_no_staging_file() {
        let td = tempfile::tempdir().unwrap();
        let out = td.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let err = copy_across(&td.path().join("missing.car"), &out, &out.join("piece.car")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn exdev_is_cross_device() {
        assert!(is_cross_device(&io::Error::from_raw_os_error(libc::EXDEV)));
        assert!(!is_cross_device(&io::Error::from_raw_os_error(libc::ENOENT)));
        assert!(!is_cross_device(&io::Error::new(io::ErrorKind::Other, "x")));
    }
}
