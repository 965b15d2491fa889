use std::io::{BufRead, Read};
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};

/// A byte range `[start, end)` of the file at `path`.
///
/// Field names follow the JSON that existing manifest producers emit
/// (`Path`, `Size`, `Start`, `End`); lower-case spellings are accepted too.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FileSpan {
    #[serde(alias = "path")]
    pub path: String,
    #[serde(alias = "size")]
    pub size: u64,
    #[serde(alias = "start")]
    pub start: u64,
    #[serde(alias = "end")]
    pub end: u64,
}

impl FileSpan {
    /// Span covering a whole file.
    pub fn whole(path: impl Into<String>, size: u64) -> Self {
        Self { path: path.into(), size, start: 0, end: size }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `0 <= start <= end <= size`.
    pub fn check_bounds(&self) -> Result<()> {
        if self.start > self.end || self.end > self.size {
            return Err(Error::Manifest(format!(
                "span [{}, {}) of {:?} is out of bounds for declared size {}",
                self.start, self.end, self.path, self.size
            )));
        }
        Ok(())
    }
}

/// Ordered spans making up one archive. Order decides both tree shape and
/// byte order in the output.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    pub spans: Vec<FileSpan>,
}

impl Manifest {
    pub fn new(spans: Vec<FileSpan>) -> Self {
        Self { spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total payload bytes across all spans.
    pub fn payload_bytes(&self) -> u64 {
        self.spans.iter().map(FileSpan::len).sum()
    }

    /// Parse a single JSON array of spans.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Manifest(format!("parse manifest JSON: {e}")))
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text).io_context(|| "read manifest")?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Manifest(format!("encode manifest: {e}")))
    }

    /// Parse newline-delimited JSON: every non-blank line is a full manifest.
    pub fn parse_json_lines<R: BufRead>(reader: R) -> Result<Vec<Manifest>> {
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.io_context(|| format!("read manifest line {}", lineno + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let m = serde_json::from_str(&line).map_err(|e| {
                Error::Manifest(format!("parse manifest on line {}: {e}", lineno + 1))
            })?;
            out.push(m);
        }
        Ok(out)
    }

    /// One manifest covering every regular file under `input` (or `input`
    /// itself when it is a file), each span covering the whole file.
    /// Directory entries are visited in file-name order.
    pub fn walk(input: &Path, filter: &WalkFilter) -> Result<Self> {
        let md = std::fs::metadata(input).io_context(|| format!("stat {}", input.display()))?;
        if md.is_file() {
            return Ok(Self::new(vec![FileSpan::whole(input.to_string_lossy(), md.len())]));
        }
        let mut spans = Vec::new();
        for ent in WalkDir::new(input).sort_by_file_name() {
            let ent = ent.map_err(|e| {
                let context = format!("walk {}", input.display());
                match e.into_io_error() {
                    Some(io) => Error::io(context, io),
                    None => Error::Manifest(format!("{context}: filesystem loop")),
                }
            })?;
            if !ent.file_type().is_file() {
                continue;
            }
            let rel = pathdiff::diff_paths(ent.path(), input)
                .unwrap_or_else(|| ent.path().to_path_buf());
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !filter.accepts(&rel) {
                continue;
            }
            let size = ent
                .metadata()
                .map_err(|e| Error::Manifest(format!("stat {}: {e}", ent.path().display())))?
                .len();
            spans.push(FileSpan::whole(ent.path().to_string_lossy(), size));
        }
        Ok(Self::new(spans))
    }
}

/// Include/exclude globs for walk mode, matched against paths relative to
/// the walk root.
#[derive(Clone, Debug)]
pub struct WalkFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl Default for WalkFilter {
    fn default() -> Self {
        Self { include: GlobSet::empty(), exclude: GlobSet::empty() }
    }
}

impl WalkFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        let mut incb = GlobSetBuilder::new();
        let mut excb = GlobSetBuilder::new();
        for g in includes {
            incb.add(Glob::new(g).map_err(|e| Error::Manifest(format!("bad include glob: {e}")))?);
        }
        for g in excludes {
            excb.add(Glob::new(g).map_err(|e| Error::Manifest(format!("bad exclude glob: {e}")))?);
        }
        let include = incb.build().map_err(|e| Error::Manifest(e.to_string()))?;
        let exclude = excb.build().map_err(|e| Error::Manifest(e.to_string()))?;
        Ok(Self { include, exclude })
    }

    pub fn accepts(&self, rel: &str) -> bool {
        (self.include.is_empty() || self.include.is_match(rel)) && !self.exclude.is_match(rel)
    }
}
