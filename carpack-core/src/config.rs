use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commp;
use crate::error::{Error, Result};
use crate::publish::{LocalRename, Publisher};

/// Default leaf chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 256 << 10;
/// Largest chunk a CAR block may carry.
pub const MAX_CHUNK_SIZE: usize = 2 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Verbosity {
    #[default]
    Compact,
    Verbose,
}

/// Settings shared read-only by every job of a batch.
#[derive(Clone)]
pub struct BatchConfig {
    /// Span paths are placed in the tree relative to this directory.
    pub base_dir: PathBuf,
    /// Where archives are written before they get their final name;
    /// `None` means `out_dir`.
    pub scratch_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
    /// Piece size to commit at; 0 keeps the natural size class.
    pub target_size: u64,
    pub workers: usize,
    pub verbosity: Verbosity,
    pub chunk_size: usize,
    /// Periodic progress lines on the log.
    pub progress: bool,
    pub publisher: Arc<dyn Publisher>,
}

impl BatchConfig {
    pub fn new(base_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            scratch_dir: None,
            out_dir: out_dir.into(),
            target_size: 0,
            workers: 1,
            verbosity: Verbosity::Compact,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress: false,
            publisher: Arc::new(LocalRename),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch_dir.as_deref().unwrap_or(&self.out_dir)
    }

    /// Batch-level checks that do not depend on any manifest.
    pub fn validate(&self) -> Result<()> {
        if self.target_size != 0 {
            commp::validate_size(self.target_size)?;
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Manifest(format!(
                "chunk size {} must be between 1 and {MAX_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("base_dir", &self.base_dir)
            .field("scratch_dir", &self.scratch_dir())
            .field("out_dir", &self.out_dir)
            .field("target_size", &self.target_size)
            .field("workers", &self.workers)
            .field("verbosity", &self.verbosity)
            .field("chunk_size", &self.chunk_size)
            .field("publisher", &self.publisher.describe())
            .finish()
    }
}
