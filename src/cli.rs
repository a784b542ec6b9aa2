use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::genome::Genome;
use crate::ingest::{self, IngestMode, IngestOptions};
use crate::reader::{Butlr, DenseMatrix, QueryUnit};
use crate::utils;
use crate::writer::{write_butlr, WriteOptions};
use crate::homer;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "butlr")]
#[command(about = "BUTLR Hi-C contact matrix container tools")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a BUTLR container from a matrix list
    Convert(ConvertArgs),
    /// Dump a BUTLR container's directory or a dense sub-matrix
    Extract(ExtractArgs),
    /// Split a whole-genome dense matrix into per-pair files
    Split(SplitArgs),
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Genome assembly name recorded in the header, e.g. hg19
    #[arg(short, long)]
    pub assembly: String,

    /// Chromosome sizes file (name<ws>size per line)
    #[arg(short, long, value_name = "CHROM_SIZE")]
    pub genome_sizes: PathBuf,

    /// Matrix list: chr<TAB>path or chrA<TAB>chrB<TAB>path per line
    #[arg(short, long, value_name = "MATRIX_LIST")]
    pub matrix_list: PathBuf,

    /// Bin resolution in bp; k/m suffixes accepted (10k, 1m)
    #[arg(short, long)]
    pub resolution: String,

    /// Output path (default: <matrix-list-basename>.<resolution>.btr)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Leading header rows to skip in every source matrix
    #[arg(long, default_value_t = 0)]
    pub skip: usize,

    /// Read sources as coordinate lists; 0-based columns for i,j,value
    #[arg(long, value_name = "I,J,V")]
    pub columns: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Input BUTLR file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Base-pair query: CHR[:START-END][,CHR2[:START-END]]
    #[arg(short, long, conflicts_with = "bins")]
    pub location: Option<String>,

    /// Bin-index query, same syntax as --location
    #[arg(short, long)]
    pub bins: Option<String>,

    /// Output file for the dense matrix (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SplitArgs {
    /// Whole-genome dense matrix with chrom-position region labels
    #[arg(short, long)]
    pub matrix: PathBuf,

    /// Chromosome sizes file (name<ws>size per line)
    #[arg(short, long, value_name = "CHROM_SIZE")]
    pub genome_sizes: PathBuf,

    /// Prefix for the split matrices and the generated matrix list
    #[arg(short, long)]
    pub prefix: String,
}

pub fn run() -> Result<()> {
    match Cli::parse().cmd {
        Commands::Convert(args) => run_convert(&args),
        Commands::Extract(args) => run_extract(&args),
        Commands::Split(args) => run_split(&args),
    }
}

fn run_convert(args: &ConvertArgs) -> Result<()> {
    let resolution = utils::parse_resolution(&args.resolution)?;
    let genome = Genome::load(&args.genome_sizes)?;
    let manifest = ingest::load_manifest(&args.matrix_list)?;

    let mode = match &args.columns {
        Some(spec) => parse_columns(spec)?,
        None => IngestMode::Dense,
    };
    let ingest_opts = IngestOptions { mode, skip_rows: args.skip };

    let output = match &args.output {
        Some(path) => path.clone(),
        None => default_output(&args.matrix_list, resolution),
    };

    println!("BUTLR convert");
    println!("Assembly: {}", args.assembly);
    println!("Resolution: {} bp", resolution);
    println!("Matrices: {}", manifest.len());

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")?
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );

    let opts = WriteOptions::new(&args.assembly, resolution);
    write_butlr(&genome, &manifest, &opts, &ingest_opts, &output, Some(&pb))?;
    pb.finish_and_clear();

    println!("Wrote {}", output.display());
    Ok(())
}

fn run_extract(args: &ExtractArgs) -> Result<()> {
    let mut butlr = Butlr::open(&args.input)?;

    let (query, unit) = match (&args.location, &args.bins) {
        (Some(q), None) => (Some(q), QueryUnit::BasePairs),
        (None, Some(q)) => (Some(q), QueryUnit::Bins),
        (None, None) => (None, QueryUnit::BasePairs),
        (Some(_), Some(_)) => bail!("--location and --bins are mutually exclusive"),
    };

    let Some(query) = query else {
        print_directory(&butlr, &args.input);
        return Ok(());
    };

    let (a, b) = utils::parse_query(query)?;
    let matrix = butlr.query(&a, b.as_ref(), unit)?;

    match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Create {:?}", path))?;
            let mut w = BufWriter::new(file);
            write_dense(&mut w, &matrix, butlr.resolution)?;
            w.flush()?;
            println!("Wrote {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut w = BufWriter::new(stdout.lock());
            write_dense(&mut w, &matrix, butlr.resolution)?;
            w.flush()?;
        }
    }
    Ok(())
}

fn run_split(args: &SplitArgs) -> Result<()> {
    let genome = Genome::load(&args.genome_sizes)?;
    let manifest = homer::split_homer_matrix(&args.matrix, &genome, &args.prefix)?;
    println!("Wrote {}", manifest.display());
    Ok(())
}

fn print_directory(butlr: &Butlr, path: &std::path::Path) {
    println!("# File: {}", path.display());
    println!("# Version: {}", butlr.version);
    println!("# Assembly: {}", butlr.assembly);
    println!("# Resolution: {} bp", butlr.resolution);
    println!("# Chromosomes (name\tsize)");
    for entry in butlr.chromosomes() {
        println!("{}\t{}", entry.name, entry.size);
    }
    if !butlr.pairs().is_empty() {
        println!("# Pairs (row\tcolumn)");
        for pair in butlr.pairs() {
            println!("{}\t{}", pair.row, pair.col);
        }
    }
}

/// Tab-delimited dense dump: a label header row, then one labelled line
/// per requested row bin.
fn write_dense<W: Write>(w: &mut W, m: &DenseMatrix, resolution: u32) -> Result<()> {
    for col in m.col_bins.0..=m.col_bins.1 {
        write!(w, "\t{}:{}", m.col_chrom, col as u64 * resolution as u64)?;
    }
    writeln!(w)?;
    for (i, row) in m.values.iter().enumerate() {
        write!(
            w,
            "{}:{}",
            m.row_chrom,
            (m.row_bins.0 as u64 + i as u64) * resolution as u64
        )?;
        for value in row {
            write!(w, "\t{}", value)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn parse_columns(spec: &str) -> Result<IngestMode> {
    let fields: Vec<&str> = spec.split(',').collect();
    if fields.len() != 3 {
        bail!("--columns expects three comma-separated indices, got {:?}", spec);
    }
    let parse = |s: &str| -> Result<usize> {
        s.trim()
            .parse()
            .map_err(|_| anyhow!("bad column index {:?} in {:?}", s, spec))
    };
    Ok(IngestMode::Coords {
        i: parse(fields[0])?,
        j: parse(fields[1])?,
        v: parse(fields[2])?,
    })
}

fn default_output(matrix_list: &std::path::Path, resolution: u32) -> PathBuf {
    let stem = matrix_list
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "matrix".to_string());
    PathBuf::from(format!("{}.{}.btr", stem, resolution))
}
