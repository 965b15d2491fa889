//! Error taxonomy shared by every stage of a job.

use std::path::PathBuf;

/// Coarse classification of an [`Error`], stable across message changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Manifest,
    Io,
    InvalidSize,
    Publish,
    Archive,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-bounds manifest input.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Source unreadable or scratch/output directory unwritable.
    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Requested piece size is not a valid size class for the data.
    #[error("invalid piece size: {0}")]
    InvalidSize(String),

    /// Remote hand-off failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Archive bytes could not be decoded.
    #[error("archive error: {0}")]
    Archive(String),

    /// A source file changed between hashing and emission.
    #[error("source changed while archiving: {path:?} at offset {offset}")]
    SourceChanged { path: PathBuf, offset: u64 },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Manifest(_) => ErrorKind::Manifest,
            Error::Io { .. } | Error::SourceChanged { .. } => ErrorKind::Io,
            Error::InvalidSize(_) => ErrorKind::InvalidSize,
            Error::Publish(_) => ErrorKind::Publish,
            Error::Archive(_) => ErrorKind::Archive,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach a context string to `std::io::Result`, in the spirit of
/// `anyhow::Context` but producing a typed [`Error::Io`].
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::io(f(), e))
    }
}
