//! Object graph builder.
//!
//! A manifest becomes a tree of directories, files and raw chunks. Nodes live
//! in an arena and are pushed strictly bottom-up while walking the tree
//! depth-first, so arena order is already a valid emission order: every node
//! appears after all of its children.
//!
//! Chunk bytes are hashed here but not retained; the archive encoder reads
//! them again from the source files when it emits the chunk records.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::cbor::{self, Value};
use crate::cid::Cid;
use crate::config::MAX_CHUNK_SIZE;
use crate::error::{Error, IoContext, Result};
use crate::manifest::{FileSpan, Manifest};
use crate::path_safety::{absolute_base, resolve_under, ResolvedPath};

pub type NodeId = usize;

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Raw chunk whose bytes are `[offset, offset + size)` of `source`.
    Chunk { source: Arc<Path>, offset: u64 },
    /// Zero-length leaf. Its identifier is inline, so it is never emitted.
    Empty,
    /// Ordered parts of a file: chunks, or per-span file nodes.
    File { parts: Vec<NodeId> },
    Dir { entries: Vec<(String, NodeId)> },
}

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub cid: Cid,
    /// Content bytes below this node.
    pub size: u64,
    pub kind: NodeKind,
    /// DAG-CBOR body for file and directory nodes.
    encoded: Option<Vec<u8>>,
}

impl GraphNode {
    /// Whether the node gets its own archive record.
    pub fn is_emitted(&self) -> bool {
        !matches!(self.kind, NodeKind::Empty)
    }

    pub fn encoded(&self) -> Option<&[u8]> {
        self.encoded.as_deref()
    }
}

#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    root: NodeId,
    root_name: String,
}

impl Graph {
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> &GraphNode {
        &self.nodes[self.root]
    }

    pub fn root_cid(&self) -> &Cid {
        &self.nodes[self.root].cid
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that get an archive record, children before parents.
    pub fn emission_order(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> + '_ {
        self.nodes.iter().enumerate().filter(|(_, n)| n.is_emitted())
    }

    /// Directory/file view of the graph for verbose result records.
    pub fn fs_tree(&self) -> FsNode {
        self.fs_node(self.root, self.root_name.clone(), String::new())
    }

    fn fs_node(&self, id: NodeId, name: String, path: String) -> FsNode {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Dir { entries } => {
                let children = entries
                    .iter()
                    .map(|(child_name, child)| {
                        let child_path = if path.is_empty() {
                            child_name.clone()
                        } else {
                            format!("{path}/{child_name}")
                        };
                        self.fs_node(*child, child_name.clone(), child_path)
                    })
                    .collect();
                FsNode { name, path, size: node.size, cid: node.cid.clone(), kind: "dir", children }
            }
            _ => FsNode {
                name,
                path,
                size: node.size,
                cid: node.cid.clone(),
                kind: "file",
                children: Vec::new(),
            },
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FsNode {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub cid: Cid,
    #[serde(rename = "Type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FsNode>,
}

/// Where one path (or one span of a multi-span path) ended up.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PathEntry {
    pub cid: Cid,
    pub is_dir: bool,
    pub size: u64,
    /// Byte offset of the node's record in the archive; `None` for inline
    /// nodes and until the archive has been written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip)]
    pub node: NodeId,
}

/// Keyed by path relative to the base directory; a path with several spans
/// also gets one `path#start-end` entry per span.
pub type PathIndex = BTreeMap<String, PathEntry>;

#[derive(Clone, Debug)]
pub struct BuildOutput {
    pub graph: Graph,
    pub path_index: PathIndex,
}

/// Build the graph for `manifest`, resolving span paths under `base_dir`.
///
/// Every span is validated before any file content is read, so a bad
/// manifest fails without side effects.
pub fn build(manifest: &Manifest, base_dir: &Path, chunk_size: usize) -> Result<BuildOutput> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::Manifest(format!(
            "chunk size {chunk_size} must be between 1 and {MAX_CHUNK_SIZE}"
        )));
    }
    let abs_base = absolute_base(base_dir)?;
    let resolved: Vec<ResolvedPath> = manifest
        .spans
        .iter()
        .map(|span| {
            span.check_bounds()?;
            resolve_under(&abs_base, &span.path)
        })
        .collect::<Result<_>>()?;

    let mut tree = DirBuilder::default();
    for (idx, r) in resolved.iter().enumerate() {
        tree.insert(&r.segments, idx)?;
    }

    let sources: Vec<Arc<Path>> = resolved.iter().map(|r| Arc::from(r.full.as_path())).collect();
    for (span, source) in manifest.spans.iter().zip(&sources) {
        check_on_disk(span, source)?;
    }

    let hashed: Vec<Vec<(u64, u64, Cid)>> = manifest
        .spans
        .par_iter()
        .zip(sources.par_iter())
        .map(|(span, source)| hash_span(span, source, chunk_size))
        .collect::<Result<_>>()?;
    tracing::debug!(spans = manifest.spans.len(), "hashed manifest spans");

    let mut asm = Assembler {
        nodes: Vec::new(),
        index: PathIndex::new(),
        spans: &manifest.spans,
        sources: &sources,
        hashed,
    };
    let root = asm.dir(&tree, "");
    let root_name =
        abs_base.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    Ok(BuildOutput { graph: Graph { nodes: asm.nodes, root, root_name }, path_index: asm.index })
}

fn check_on_disk(span: &FileSpan, source: &Path) -> Result<()> {
    let actual = std::fs::metadata(source)
        .map_err(|e| Error::Manifest(format!("cannot stat {}: {e}", source.display())))?;
    if !actual.is_file() {
        return Err(Error::Manifest(format!("{} is not a regular file", source.display())));
    }
    if span.end > actual.len() {
        return Err(Error::Manifest(format!(
            "span [{}, {}) of {} exceeds its size on disk ({} bytes)",
            span.start,
            span.end,
            source.display(),
            actual.len()
        )));
    }
    Ok(())
}

/// Read exactly `[start, end)` in `chunk_size` pieces and name each piece.
fn hash_span(span: &FileSpan, source: &Path, chunk_size: usize) -> Result<Vec<(u64, u64, Cid)>> {
    if span.is_empty() {
        return Ok(Vec::new());
    }
    let mut f = File::open(source).io_context(|| format!("open {}", source.display()))?;
    f.seek(SeekFrom::Start(span.start)).io_context(|| format!("seek {}", source.display()))?;
    let mut buf = vec![0u8; chunk_size];
    let mut out = Vec::with_capacity(span.len().div_ceil(chunk_size as u64) as usize);
    let mut offset = span.start;
    while offset < span.end {
        let n = (span.end - offset).min(chunk_size as u64) as usize;
        f.read_exact(&mut buf[..n])
            .io_context(|| format!("read {} at {offset}", source.display()))?;
        out.push((offset, n as u64, Cid::raw(&buf[..n])));
        offset += n as u64;
    }
    Ok(out)
}

#[derive(Default)]
struct DirBuilder {
    entries: Vec<(String, Entry)>,
    by_name: HashMap<String, usize>,
}

enum Entry {
    Dir(DirBuilder),
    /// Span indices in manifest order.
    File(Vec<usize>),
}

impl DirBuilder {
    fn insert(&mut self, segments: &[String], span: usize) -> Result<()> {
        let (name, rest) = match segments.split_first() {
            Some(x) => x,
            None => return Err(Error::Manifest("empty span path".into())),
        };
        let pos = match self.by_name.get(name) {
            Some(&pos) => pos,
            None => {
                let entry = if rest.is_empty() {
                    Entry::File(Vec::new())
                } else {
                    Entry::Dir(DirBuilder::default())
                };
                self.entries.push((name.clone(), entry));
                self.by_name.insert(name.clone(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        match (&mut self.entries[pos].1, rest.is_empty()) {
            (Entry::File(spans), true) => {
                spans.push(span);
                Ok(())
            }
            (Entry::Dir(sub), false) => sub.insert(rest, span),
            _ => Err(Error::Manifest(format!(
                "{name:?} is used both as a file and as a directory"
            ))),
        }
    }
}

struct Assembler<'a> {
    nodes: Vec<GraphNode>,
    index: PathIndex,
    spans: &'a [FileSpan],
    sources: &'a [Arc<Path>],
    hashed: Vec<Vec<(u64, u64, Cid)>>,
}

impl Assembler<'_> {
    fn push(&mut self, node: GraphNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn dir(&mut self, dir: &DirBuilder, path: &str) -> NodeId {
        let mut entries = Vec::with_capacity(dir.entries.len());
        for (name, entry) in &dir.entries {
            let child_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
            let id = match entry {
                Entry::Dir(sub) => self.dir(sub, &child_path),
                Entry::File(spans) => self.file(spans, &child_path),
            };
            entries.push((name.clone(), id));
        }
        let links: Vec<Value> = entries
            .iter()
            .map(|(name, id)| {
                let child = &self.nodes[*id];
                Value::map([
                    ("cid", Value::Link(child.cid.clone())),
                    ("name", Value::Text(name.clone())),
                    ("size", Value::Uint(child.size)),
                ])
            })
            .collect();
        let size: u64 = entries.iter().map(|(_, id)| self.nodes[*id].size).sum();
        let body = cbor::encode(&Value::map([
            ("kind", Value::Text("dir".into())),
            ("links", Value::Array(links)),
        ]));
        let id = self.push(GraphNode {
            cid: Cid::dag_cbor(&body),
            size,
            kind: NodeKind::Dir { entries },
            encoded: Some(body),
        });
        if !path.is_empty() {
            self.record(path.to_string(), id, true);
        }
        id
    }

    fn file(&mut self, spans: &[usize], path: &str) -> NodeId {
        if let [only] = spans {
            let id = self.span(*only);
            self.record(path.to_string(), id, false);
            return id;
        }
        let mut parts = Vec::with_capacity(spans.len());
        for &s in spans {
            let id = self.span(s);
            let (start, end) = (self.spans[s].start, self.spans[s].end);
            self.record(format!("{path}#{start}-{end}"), id, false);
            parts.push(id);
        }
        let id = self.file_node(parts);
        self.record(path.to_string(), id, false);
        id
    }

    /// Node for one span: nothing, a single chunk, or a file over its chunks.
    fn span(&mut self, span: usize) -> NodeId {
        let chunks = std::mem::take(&mut self.hashed[span]);
        let source = self.sources[span].clone();
        let mut ids: Vec<NodeId> = chunks
            .into_iter()
            .map(|(offset, size, cid)| {
                self.push(GraphNode {
                    cid,
                    size,
                    kind: NodeKind::Chunk { source: source.clone(), offset },
                    encoded: None,
                })
            })
            .collect();
        match ids.len() {
            0 => self.push(GraphNode {
                cid: Cid::empty_leaf(),
                size: 0,
                kind: NodeKind::Empty,
                encoded: None,
            }),
            1 => ids.remove(0),
            _ => self.file_node(ids),
        }
    }

    fn file_node(&mut self, parts: Vec<NodeId>) -> NodeId {
        let size: u64 = parts.iter().map(|id| self.nodes[*id].size).sum();
        let chunks: Vec<Value> = parts
            .iter()
            .map(|id| {
                let part = &self.nodes[*id];
                Value::map([("cid", Value::Link(part.cid.clone())), ("size", Value::Uint(part.size))])
            })
            .collect();
        let body = cbor::encode(&Value::map([
            ("kind", Value::Text("file".into())),
            ("size", Value::Uint(size)),
            ("chunks", Value::Array(chunks)),
        ]));
        self.push(GraphNode {
            cid: Cid::dag_cbor(&body),
            size,
            kind: NodeKind::File { parts },
            encoded: Some(body),
        })
    }

    fn record(&mut self, key: String, id: NodeId, is_dir: bool) {
        let node = &self.nodes[id];
        self.index.insert(
            key,
            PathEntry { cid: node.cid.clone(), is_dir, size: node.size, offset: None, node: id },
        );
    }
}
