use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use carpack_core::car;
use carpack_core::config::{BatchConfig, Verbosity, DEFAULT_CHUNK_SIZE};
use carpack_core::manifest::{Manifest, WalkFilter};
use carpack_core::publish::{self, PUBLISH_CONFIG_ENV};
use carpack_core::{CommpCalc, Scheduler};

#[derive(Parser)]
#[command(name = "carpack", version, about = "Pack files into CAR archives named by their piece commitment")]
struct Cli {
    /// Log more (-v debug, -vv trace); RUST_LOG overrides.
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    log_level: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate archives from manifests (or a single file/directory)
    Generate {
        /// Treat --input as one file or directory to pack whole
        #[arg(long, default_value_t = false)]
        single: bool,
        /// Manifest file, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Input holds one manifest per line
        #[arg(long, default_value_t = false)]
        input_json: bool,
        /// Target piece size (0 = natural size); accepts K/M/G/T suffixes
        #[arg(short = 's', long, default_value = "0", value_parser = parse_size)]
        piece_size: u64,
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// Scratch directory (defaults to the output directory)
        #[arg(short, long)]
        tmp_dir: Option<PathBuf>,
        /// Base directory span paths are placed under
        #[arg(short, long)]
        parent: PathBuf,
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Include the object tree and path index in each result
        #[arg(long, default_value_t = false)]
        verbose: bool,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_chunk_size)]
        chunk_size: usize,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long, default_value_t = false)]
        progress: bool,
        /// Remote publish config (JSON)
        #[arg(long, env = PUBLISH_CONFIG_ENV)]
        publish_config: Option<PathBuf>,
    },
    /// Check an archive and print its root and record count
    Inspect { archive: PathBuf },
    /// Piece commitment of a file's bytes
    Commp {
        file: PathBuf,
        #[arg(short = 's', long, default_value = "0", value_parser = parse_size)]
        piece_size: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    match cli.cmd {
        Cmd::Generate {
            single,
            input,
            input_json,
            piece_size,
            out_dir,
            tmp_dir,
            parent,
            parallel,
            verbose,
            chunk_size,
            include,
            exclude,
            progress,
            publish_config,
        } => {
            let manifests = read_manifests(&input, single, input_json, &include, &exclude)?;
            let mut cfg = BatchConfig::new(parent, out_dir);
            cfg.scratch_dir = tmp_dir;
            cfg.target_size = piece_size;
            cfg.workers = parallel;
            cfg.verbosity = if verbose { Verbosity::Verbose } else { Verbosity::Compact };
            cfg.chunk_size = chunk_size;
            cfg.progress = progress;
            cfg.publisher = publish::from_config_path(publish_config)?;
            generate(cfg, manifests)?;
        }
        Cmd::Inspect { archive } => inspect(&archive)?,
        Cmd::Commp { file, piece_size } => commp(&file, piece_size)?,
    }
    Ok(())
}

fn init_logging(level: u8) {
    let default = match level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn parse_size(s: &str) -> Result<u64> {
    let t = s.trim().to_uppercase();
    let t = t.strip_suffix("IB").or_else(|| t.strip_suffix('B')).unwrap_or(&t);
    let (num, shift) = match t.chars().last() {
        Some('K') => (&t[..t.len() - 1], 10),
        Some('M') => (&t[..t.len() - 1], 20),
        Some('G') => (&t[..t.len() - 1], 30),
        Some('T') => (&t[..t.len() - 1], 40),
        _ => (t, 0),
    };
    let v: u64 = num.trim().parse().map_err(|_| anyhow!("bad size {s}"))?;
    v.checked_mul(1u64 << shift).ok_or_else(|| anyhow!("size {s} is too large"))
}

fn parse_chunk_size(s: &str) -> Result<usize> {
    Ok(usize::try_from(parse_size(s)?)?)
}

fn read_manifests(
    input: &Path,
    single: bool,
    json_lines: bool,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<Manifest>> {
    if single {
        if input == Path::new("-") {
            bail!("--single needs a file or directory as --input");
        }
        let filter = WalkFilter::new(include, exclude)?;
        let m = Manifest::walk(input, &filter).with_context(|| format!("walk {}", input.display()))?;
        return Ok(vec![m]);
    }
    let reader: Box<dyn io::BufRead> = if input == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let f = File::open(input).with_context(|| format!("open {}", input.display()))?;
        Box::new(BufReader::new(f))
    };
    if json_lines {
        Ok(Manifest::parse_json_lines(reader)?)
    } else {
        Ok(vec![Manifest::from_reader(reader)?])
    }
}

fn generate(cfg: BatchConfig, manifests: Vec<Manifest>) -> Result<()> {
    fs::create_dir_all(&cfg.out_dir)
        .with_context(|| format!("create output dir {}", cfg.out_dir.display()))?;
    fs::create_dir_all(cfg.scratch_dir())
        .with_context(|| format!("create scratch dir {}", cfg.scratch_dir().display()))?;
    let verbosity = cfg.verbosity;
    let jobs = manifests.len();
    tracing::debug!(?cfg, jobs, "generate");

    let scheduler = Scheduler::new(cfg);
    let cancel = scheduler.cancel_token();
    let mut out = io::stdout().lock();
    let mut print_err: Option<anyhow::Error> = None;
    let done = scheduler.run_with(manifests, |r| {
        if print_err.is_some() {
            return;
        }
        if let Err(e) = print_json(&mut out, &r.record(verbosity)) {
            cancel.cancel();
            print_err = Some(e);
        }
    });
    if let Some(e) = print_err {
        return Err(e.context("write result"));
    }
    let done = done?;
    tracing::info!(done, jobs, "batch finished");
    Ok(())
}

fn print_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InspectReport {
    root: String,
    records: u64,
    car_size: u64,
}

fn inspect(archive: &Path) -> Result<()> {
    let summary =
        car::verify_file(archive).with_context(|| format!("inspect {}", archive.display()))?;
    let report = InspectReport {
        root: summary.root.to_string(),
        records: summary.records,
        car_size: summary.size,
    };
    print_json(&mut io::stdout().lock(), &report)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CommpReport {
    piece_cid: String,
    piece_size: u64,
    payload_size: u64,
}

fn commp(file: &Path, piece_size: u64) -> Result<()> {
    let mut f = File::open(file).with_context(|| format!("open {}", file.display()))?;
    let mut calc = CommpCalc::new();
    io::copy(&mut f, &mut calc).with_context(|| format!("read {}", file.display()))?;
    let payload_size = calc.bytes_written();
    let c = if piece_size == 0 { calc.finish()? } else { calc.finish_at(piece_size)? };
    let report = CommpReport { piece_cid: c.cid().to_string(), piece_size: c.size, payload_size };
    print_json(&mut io::stdout().lock(), &report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert_eq!(parse_size("32G").unwrap(), 32 << 30);
        assert_eq!(parse_size("64GiB").unwrap(), 64 << 30);
        assert_eq!(parse_size("256k").unwrap(), 256 << 10);
        assert!(parse_size("ten").is_err());
    }
}
