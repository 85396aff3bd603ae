use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use gmdata_core::analysis::{analyze_all, analyze_entry, EntryReport};
use gmdata_core::{Container, LoadOptions, Loaded, Warnings};

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkSummary {
    tag: String,
    kind: String,
    align: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntrySummary {
    name: String,
    listing: Option<PathBuf>,
    blocks: usize,
    edges: usize,
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Summary {
    source_len: usize,
    bytecode_version: Option<u8>,
    chunks: Vec<ChunkSummary>,
    entries: Vec<EntrySummary>,
    warnings: Vec<String>,
}

fn load(input: &Path, options: &LoadOptions) -> Result<Loaded> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let loaded = Container::parse_with(&bytes, options)
        .with_context(|| format!("parsing {}", input.display()))?;
    log::info!(
        "loaded {} ({} chunks, {} warnings)",
        input.display(),
        loaded.container.chunks().len(),
        loaded.warnings.len()
    );
    Ok(loaded)
}

fn warning_lines(warnings: &Warnings) -> Vec<String> {
    let mut lines: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();
    if warnings.dropped() > 0 {
        lines.push(format!("... {} more", warnings.dropped()));
    }
    lines
}

fn chunk_summaries(container: &Container) -> Vec<ChunkSummary> {
    container
        .chunks()
        .iter()
        .map(|c| ChunkSummary {
            tag: c.tag.to_string(),
            kind: c.body.kind_name().to_string(),
            align: c.align,
        })
        .collect()
}

fn file_name_for(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '_' })
        .collect()
}

fn info(input: &Path, options: &LoadOptions) -> Result<()> {
    let Loaded { container, warnings } = load(input, options)?;
    println!("source: {} bytes", container.source_len());
    match container.bytecode_version() {
        Some(v) => println!("bytecode version: {v}"),
        None => println!("bytecode version: unknown"),
    }
    for c in chunk_summaries(&container) {
        println!("  {} {:<10} align {}", c.tag, c.kind, c.align);
    }
    if let Some(s) = container.strings() {
        println!("strings: {}", s.items.len());
    }
    if let Some(code) = container.code() {
        let roots = code.entries.values().filter(|e| e.is_root()).count();
        println!("code entries: {} ({} roots)", code.entries.len(), roots);
    }
    if let Some(v) = container.variables() {
        println!("variables: {}", v.items.len());
    }
    if let Some(f) = container.functions() {
        println!("functions: {}", f.items.len());
    }
    for line in warning_lines(&warnings) {
        println!("warning: {line}");
    }
    Ok(())
}

fn disasm(input: &Path, output: &Path, options: &LoadOptions) -> Result<()> {
    let Loaded { container, warnings } = load(input, options)?;
    if container.code().is_none() {
        bail!("{} has no decoded CODE chunk", input.display());
    }
    std::fs::create_dir_all(output)
        .with_context(|| format!("creating {}", output.display()))?;

    let reports: Vec<EntryReport> = analyze_all(&container);
    let mut entries = Vec::with_capacity(reports.len());
    for report in reports {
        let summary = match report.result {
            Ok(analysis) => {
                let file = PathBuf::from(format!("{}.asm", file_name_for(&report.name)));
                std::fs::write(output.join(&file), &analysis.listing)
                    .with_context(|| format!("writing {}", file.display()))?;
                EntrySummary {
                    name: report.name,
                    listing: Some(file),
                    blocks: analysis.cfg.len(),
                    edges: analysis.cfg.edges().count(),
                    error: None,
                }
            }
            Err(e) => EntrySummary {
                name: report.name,
                listing: None,
                blocks: 0,
                edges: 0,
                error: Some(e.to_string()),
            },
        };
        entries.push(summary);
    }

    let failed = entries.iter().filter(|e| e.error.is_some()).count();
    let summary = Summary {
        source_len: container.source_len(),
        bytecode_version: container.bytecode_version(),
        chunks: chunk_summaries(&container),
        entries,
        warnings: warning_lines(&warnings),
    };
    let summary_path = output.join("summary.yaml");
    let mut writer = std::fs::File::create(&summary_path)
        .with_context(|| format!("creating {}", summary_path.display()))?;
    serde_yaml::to_writer(&mut writer, &summary)?;

    log::info!(
        "disassembled {} entries into {} ({failed} failed)",
        summary.entries.len(),
        output.display()
    );
    Ok(())
}

fn cfg(input: &Path, entry: &str, options: &LoadOptions) -> Result<()> {
    let Loaded { container, .. } = load(input, options)?;
    let code = container.code().context("no decoded CODE chunk")?;
    let id = code
        .entries
        .iter()
        .map(|(id, _)| id)
        .find(|&id| container.entry_name(id).is_some_and(|n| n == entry))
        .with_context(|| format!("no code entry named {entry}"))?;

    let analysis = analyze_entry(&container, id)?;
    print!("{}", analysis.listing);
    println!();
    for block in analysis.cfg.blocks.values() {
        println!(
            "block {:#x}..{:#x} ({} instructions) preds {:x?} succs {:x?}",
            block.start,
            block.end,
            block.instructions.len(),
            block.predecessors,
            block.successors
        );
    }
    Ok(())
}

fn roundtrip(input: &Path, output: Option<&Path>, options: &LoadOptions) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let Loaded { container, warnings } = Container::parse_with(&bytes, options)?;
    for line in warning_lines(&warnings) {
        println!("warning: {line}");
    }

    let written = container.serialize()?;
    if written.bytes != bytes {
        let at = written
            .bytes
            .iter()
            .zip(&bytes)
            .position(|(a, b)| a != b)
            .unwrap_or(written.bytes.len().min(bytes.len()));
        bail!(
            "output differs from input at byte {at:#x} ({} vs {} bytes)",
            written.bytes.len(),
            bytes.len()
        );
    }
    println!("identical: {} bytes", bytes.len());

    if let Some(output) = output {
        container
            .save(output)
            .with_context(|| format!("writing {}", output.display()))?;
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List chunks, table sizes and load warnings
    Info {
        #[arg(short, long, required = true)]
        input: PathBuf,
    },
    /// Write one listing per code entry plus summary.yaml
    Disasm {
        #[arg(short, long, required = true)]
        input: PathBuf,

        #[arg(short, long, required = true)]
        output: PathBuf,
    },
    /// Print the listing and basic blocks of one code entry
    Cfg {
        #[arg(short, long, required = true)]
        input: PathBuf,

        #[arg(short, long, required = true)]
        entry: String,
    },
    /// Parse and re-serialize, failing if the bytes differ
    Roundtrip {
        #[arg(short, long, required = true)]
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Inspect GameMaker data.win files
#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Skip the load-time re-serialization check
    #[arg(long)]
    no_verify: bool,

    #[arg(long, default_value_t = 1024)]
    warning_limit: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let options = LoadOptions {
        verify_round_trip: !args.no_verify,
        warning_limit: args.warning_limit,
    };

    match &args.command {
        Command::Info { input } => info(input, &options),
        Command::Disasm { input, output } => disasm(input, output, &options),
        Command::Cfg { input, entry } => cfg(input, entry, &options),
        Command::Roundtrip { input, output } => roundtrip(input, output.as_deref(), &options),
    }
}
