//! One manifest in, one named archive out.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use serde::Serialize;
use uuid::Uuid;

use crate::car;
use crate::cid::Cid;
use crate::commp::{CommpCalc, QUAD_IN, QUAD_OUT};
use crate::config::{BatchConfig, Verbosity};
use crate::error::{Error, IoContext, Result};
use crate::graph::{self, BuildOutput, FsNode, PathIndex};
use crate::manifest::Manifest;

/// Archive write buffer: a whole number of fr32 quads, about 4 MiB.
pub const WRITE_BUFFER: usize = (4 << 20) / QUAD_OUT * QUAD_IN;

/// Writes every byte to both `a` and `b`.
pub struct Tee<A, B> {
    pub a: A,
    pub b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.a.write(buf)?;
        self.b.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone, Debug)]
pub struct JobResult {
    pub data_cid: Cid,
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub car_size: u64,
    /// `<piece cid>.car`
    pub file_name: String,
    /// Where the publisher put the archive.
    pub location: String,
    pub payload_bytes: u64,
    pub tree: FsNode,
    pub path_index: PathIndex,
}

/// Serialised form of a [`JobResult`]; the verbose form adds the tree and
/// the path index.
#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ResultRecord<'a> {
    pub data_cid: &'a Cid,
    pub piece_cid: &'a Cid,
    pub piece_size: u64,
    pub car_size: u64,
    pub file_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipld: Option<&'a FsNode>,
    #[serde(rename = "CidMap", skip_serializing_if = "Option::is_none")]
    pub cid_map: Option<&'a PathIndex>,
}

impl JobResult {
    pub fn record(&self, verbosity: Verbosity) -> ResultRecord<'_> {
        let verbose = verbosity == Verbosity::Verbose;
        ResultRecord {
            data_cid: &self.data_cid,
            piece_cid: &self.piece_cid,
            piece_size: self.piece_size,
            car_size: self.car_size,
            file_name: &self.file_name,
            ipld: verbose.then_some(&self.tree),
            cid_map: verbose.then_some(&self.path_index),
        }
    }
}

/// Build, encode and commit one manifest, then hand the archive to the
/// configured publisher under its piece name.
///
/// A manifest problem fails before the scratch file exists. Any later
/// failure leaves the scratch file where it is.
pub fn run_job(manifest: &Manifest, cfg: &BatchConfig) -> Result<JobResult> {
    let BuildOutput { graph, mut path_index } =
        graph::build(manifest, &cfg.base_dir, cfg.chunk_size)?;

    let scratch = cfg.scratch_dir().join(format!("{}.car", Uuid::new_v4()));
    let file = File::create(&scratch).io_context(|| format!("create {}", scratch.display()))?;
    tracing::debug!(scratch = %scratch.display(), nodes = graph.len(), "encoding archive");

    let mut calc = CommpCalc::new();
    let layout = {
        let mut sink = BufWriter::with_capacity(WRITE_BUFFER, Tee { a: file, b: &mut calc });
        let layout = car::write_car(&graph, &mut sink)?;
        let tee = sink
            .into_inner()
            .map_err(|e| Error::io(format!("flush {}", scratch.display()), e.into_error()))?;
        tee.a.sync_all().io_context(|| format!("sync {}", scratch.display()))?;
        layout
    };
    debug_assert_eq!(layout.size, calc.bytes_written());

    let natural = calc.finish()?;
    let piece = match cfg.target_size {
        0 => natural,
        t if t == natural.size => natural,
        t if t < natural.size => {
            return Err(Error::InvalidSize(format!(
                "requested piece size {t} is smaller than the natural size {} of a {} byte archive",
                natural.size, layout.size
            )))
        }
        t => natural.padded_to(t)?,
    };

    let piece_cid = piece.cid();
    let file_name = format!("{piece_cid}.car");
    let location = cfg.publisher.publish(&scratch, &cfg.out_dir, &file_name)?;

    for entry in path_index.values_mut() {
        entry.offset = layout.offsets.get(entry.node).copied().flatten();
    }
    let data_cid = graph.root_cid().clone();
    tracing::info!(
        data_cid = %data_cid,
        piece_cid = %piece_cid,
        piece_size = piece.size,
        car_size = layout.size,
        location = %location,
        "archive ready"
    );
    Ok(JobResult {
        data_cid,
        piece_cid,
        piece_size: piece.size,
        car_size: layout.size,
        file_name,
        location,
        payload_bytes: manifest.payload_bytes(),
        tree: graph.fs_tree(),
        path_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_feeds_both_sinks() {
        let mut a: Vec<u8> = Vec::new();
        let mut b: Vec<u8> = Vec::new();
        {
            let mut t = Tee { a: &mut a, b: &mut b };
            t.write_all(b"hello ").unwrap();
            t.write_all(b"world").unwrap();
        }
        assert_eq!(a, b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn write_buffer_is_whole_quads() {
        assert_eq!(WRITE_BUFFER % QUAD_IN, 0);
    }
}
