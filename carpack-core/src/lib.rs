//! Content-addressed archives with piece commitments.
//!
//! A [`Manifest`] of file spans is turned into an object graph, streamed out
//! as a CAR archive, and digested into a piece commitment on the way. The
//! [`Scheduler`] runs many such jobs on a fixed pool of workers.

pub mod car;
pub mod cbor;
pub mod cid;
pub mod commp;
pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod manifest;
pub mod merkle;
pub mod path_safety;
pub mod progress;
pub mod publish;
pub mod scheduler;

pub use cid::Cid;
pub use commp::{Commitment, CommpCalc};
pub use config::{BatchConfig, Verbosity};
pub use error::{Error, ErrorKind, Result};
pub use job::{run_job, JobResult};
pub use manifest::{FileSpan, Manifest, WalkFilter};
pub use scheduler::{CancelToken, Scheduler};
