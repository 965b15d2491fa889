//! CARv1 archive encoding.
//!
//! Layout: `varint(len) || dag-cbor {roots, version}` followed by one record
//! per emitted graph node, each `varint(len(cid) + len(data)) || cid || data`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::cbor::{self, Value};
use crate::cid::{self, Cid, CODEC_DAG_CBOR};
use crate::error::{Error, IoContext, Result};
use crate::graph::{Graph, NodeKind};

pub const CAR_VERSION: u64 = 1;

/// Largest header or record accepted when reading.
const MAX_RECORD_LEN: u64 = 64 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

impl CarHeader {
    pub fn new(root: Cid) -> Self {
        Self { roots: vec![root], version: CAR_VERSION }
    }

    pub fn to_cbor(&self) -> Vec<u8> {
        cbor::encode(&Value::map([
            ("roots", Value::Array(self.roots.iter().cloned().map(Value::Link).collect())),
            ("version", Value::Uint(self.version)),
        ]))
    }

    pub fn from_cbor(buf: &[u8]) -> Result<Self> {
        let v = cbor::decode(buf)?;
        let version = v
            .get("version")
            .and_then(Value::as_uint)
            .ok_or_else(|| Error::Archive("header has no version".into()))?;
        if version != CAR_VERSION {
            return Err(Error::Archive(format!("unsupported CAR version {version}")));
        }
        let roots = v
            .get("roots")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Archive("header has no roots".into()))?
            .iter()
            .map(|r| r.as_link().cloned().ok_or_else(|| Error::Archive("root is not a CID".into())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { roots, version })
    }
}

/// Where things landed in an encoded archive.
#[derive(Clone, Debug, Default)]
pub struct CarLayout {
    /// Total archive bytes.
    pub size: u64,
    pub records: u64,
    /// Record offset by node id; `None` for nodes without a record.
    pub offsets: Vec<Option<u64>>,
}

/// Stream `graph` into `sink` in emission order.
///
/// Node bodies are produced one at a time, so memory use is bounded by the
/// largest single node, not the archive.
pub fn write_car<W: Write>(graph: &Graph, sink: &mut W) -> Result<CarLayout> {
    let mut layout = CarLayout { offsets: vec![None; graph.len()], ..Default::default() };
    let header = CarHeader::new(graph.root_cid().clone()).to_cbor();
    let mut prefix = Vec::with_capacity(10);
    cid::write_varint(&mut prefix, header.len() as u64);
    sink.write_all(&prefix).io_context(|| "write archive header")?;
    sink.write_all(&header).io_context(|| "write archive header")?;
    layout.size = (prefix.len() + header.len()) as u64;

    let mut sources = SourceReader::default();
    for (id, node) in graph.emission_order() {
        let at = layout.size;
        let written = match &node.kind {
            NodeKind::Chunk { source, offset } => {
                let data = sources.read(source, *offset, node.size)?;
                if !node.cid.verifies(data) {
                    return Err(Error::SourceChanged { path: source.to_path_buf(), offset: *offset });
                }
                write_record(sink, &node.cid, data)?
            }
            NodeKind::File { .. } | NodeKind::Dir { .. } => {
                write_record(sink, &node.cid, node.encoded().unwrap_or_default())?
            }
            NodeKind::Empty => continue,
        };
        layout.offsets[id] = Some(at);
        layout.size += written;
        layout.records += 1;
    }
    tracing::debug!(records = layout.records, bytes = layout.size, "archive encoded");
    Ok(layout)
}

/// Write one framed record; returns the bytes written.
pub fn write_record<W: Write>(sink: &mut W, cid: &Cid, data: &[u8]) -> Result<u64> {
    let cid_bytes = cid.to_bytes();
    let body_len = (cid_bytes.len() + data.len()) as u64;
    let mut prefix = Vec::with_capacity(10);
    cid::write_varint(&mut prefix, body_len);
    sink.write_all(&prefix).io_context(|| format!("write record {cid}"))?;
    sink.write_all(&cid_bytes).io_context(|| format!("write record {cid}"))?;
    sink.write_all(data).io_context(|| format!("write record {cid}"))?;
    Ok(prefix.len() as u64 + body_len)
}

/// Keeps the most recently used source open; chunks of one span are
/// emitted consecutively.
#[derive(Default)]
struct SourceReader {
    open: Option<(Arc<Path>, File)>,
    buf: Vec<u8>,
}

impl SourceReader {
    fn read(&mut self, source: &Arc<Path>, offset: u64, len: u64) -> Result<&[u8]> {
        let reopen = match &self.open {
            Some((p, _)) => !(Arc::ptr_eq(p, source) || **p == **source),
            None => true,
        };
        if reopen {
            let f = File::open(source).io_context(|| format!("open {}", source.display()))?;
            self.open = Some((source.clone(), f));
        }
        let Some((_, f)) = self.open.as_mut() else {
            return Err(Error::Archive("source reader lost its file".into()));
        };
        self.buf.resize(len as usize, 0);
        f.seek(SeekFrom::Start(offset)).io_context(|| format!("seek {}", source.display()))?;
        f.read_exact(&mut self.buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::SourceChanged { path: source.to_path_buf(), offset }
            } else {
                Error::io(format!("read {} at {offset}", source.display()), e)
            }
        })?;
        Ok(&self.buf)
    }
}

/// Sequential reader over an archive's records.
pub struct CarReader<R> {
    inner: R,
    header: CarHeader,
    position: u64,
}

impl<R: Read> CarReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let (len, prefix) = read_stream_varint(&mut inner)?
            .ok_or_else(|| Error::Archive("empty archive".into()))?;
        let header_bytes = read_body(&mut inner, len)?;
        let header = CarHeader::from_cbor(&header_bytes)?;
        Ok(Self { inner, header, position: prefix + len })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next `(cid, data)` record, with the identifier checked against the
    /// data. `Ok(None)` at a clean end of archive.
    pub fn next_record(&mut self) -> Result<Option<(Cid, Vec<u8>)>> {
        let Some((len, prefix)) = read_stream_varint(&mut self.inner)? else {
            return Ok(None);
        };
        let body = read_body(&mut self.inner, len)?;
        let (cid, used) = Cid::read_bytes(&body)?;
        let data = body[used..].to_vec();
        if !cid.verifies(&data) {
            return Err(Error::Archive(format!(
                "record at offset {} does not match its identifier {cid}",
                self.position
            )));
        }
        self.position += prefix + len;
        Ok(Some((cid, data)))
    }
}

impl<R: Read> Iterator for CarReader<R> {
    type Item = Result<(Cid, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Outcome of replaying an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub root: Cid,
    pub records: u64,
    pub size: u64,
}

/// Replay an archive, checking that every link points at a record already
/// seen (or an inline identifier) and that the declared root was emitted.
pub fn verify_archive<R: Read>(reader: R) -> Result<ArchiveSummary> {
    let mut car = CarReader::new(reader)?;
    let root = match car.header().roots.as_slice() {
        [root] => root.clone(),
        roots => return Err(Error::Archive(format!("expected one root, found {}", roots.len()))),
    };
    let mut seen: HashSet<Cid> = HashSet::new();
    let mut records = 0u64;
    while let Some((cid, data)) = car.next_record()? {
        if cid.codec() == CODEC_DAG_CBOR {
            let node = cbor::decode(&data)?;
            for link in links_of(&node) {
                if !link.is_inline() && !seen.contains(link) {
                    return Err(Error::Archive(format!(
                        "{cid} links to {link} before it appears in the archive"
                    )));
                }
            }
        }
        seen.insert(cid);
        records += 1;
    }
    if !seen.contains(&root) {
        return Err(Error::Archive(format!("root {root} has no record")));
    }
    Ok(ArchiveSummary { root, records, size: car.position() })
}

/// Every CID link inside a decoded node, in encounter order.
pub fn links_of(value: &Value) -> Vec<&Cid> {
    let mut out = Vec::new();
    collect_links(value, &mut out);
    out
}

fn collect_links<'a>(value: &'a Value, out: &mut Vec<&'a Cid>) {
    match value {
        Value::Link(c) => out.push(c),
        Value::Array(items) => items.iter().for_each(|v| collect_links(v, out)),
        Value::Map(entries) => entries.iter().for_each(|(_, v)| collect_links(v, out)),
        _ => {}
    }
}

/// Returns `(value, bytes consumed)`, or `None` at EOF before the first byte.
fn read_stream_varint<R: Read>(r: &mut R) -> Result<Option<(u64, u64)>> {
    let mut bytes = Vec::with_capacity(10);
    loop {
        let mut b = [0u8; 1];
        let n = r.read(&mut b).io_context(|| "read archive")?;
        if n == 0 {
            if bytes.is_empty() {
                return Ok(None);
            }
            return Err(Error::Archive("archive ends inside a length prefix".into()));
        }
        bytes.push(b[0]);
        if b[0] & 0x80 == 0 {
            break;
        }
        if bytes.len() >= 10 {
            return Err(Error::Archive("length prefix too long".into()));
        }
    }
    let mut pos = 0;
    let v = cid::read_varint(&bytes, &mut pos)?;
    Ok(Some((v, bytes.len() as u64)))
}

fn read_body<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>> {
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(Error::Archive(format!("invalid record length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::Archive("archive truncated".into()),
        _ => Error::io("read archive", e),
    })?;
    Ok(body)
}

/// Open and replay an archive on disk.
pub fn verify_file(path: &Path) -> Result<ArchiveSummary> {
    let f = File::open(path).io_context(|| format!("open {}", path.display()))?;
    verify_archive(std::io::BufReader::new(f))
}
