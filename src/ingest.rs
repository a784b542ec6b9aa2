//! Matrix manifest and the two source-matrix ingestion strategies:
//! coordinate lists and dense tab-delimited matrices. Both feed the same
//! sparse-store pipeline; the mode is chosen per invocation.

use crate::genome::{bin_of, Genome};
use crate::sparse::{SortedCells, SparseRows};
use anyhow::{anyhow, bail, Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Values beyond f32 range are clamped to this magnitude.
const INF_SUBSTITUTE: f32 = 1.0e38;

/// How many malformed tokens to report per file before going quiet.
const MAX_SHOWN_WARNINGS: u64 = 5;

#[derive(Clone, Debug)]
pub struct ManifestEntry {
    /// Chromosome the source file's first coordinate / rows belong to.
    pub row_chrom: String,
    /// Second coordinate / columns; equals `row_chrom` for intra entries.
    pub col_chrom: String,
    pub path: PathBuf,
}

impl ManifestEntry {
    pub fn is_intra(&self) -> bool {
        self.row_chrom == self.col_chrom
    }
}

/// Parse the matrix manifest: `chr<tab>path` or `chrA<tab>chrB<tab>path`
/// per line.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(path).with_context(|| format!("Open matrix list {:?}", path))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Read {:?}", path))?;
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let entry = match fields.as_slice() {
            [chrom, file] => ManifestEntry {
                row_chrom: chrom.to_string(),
                col_chrom: chrom.to_string(),
                path: PathBuf::from(file),
            },
            [a, b, file] => ManifestEntry {
                row_chrom: a.to_string(),
                col_chrom: b.to_string(),
                path: PathBuf::from(file),
            },
            _ => bail!(
                "{:?}:{}: expected 2 or 3 tab-delimited fields, got {}",
                path,
                lineno + 1,
                fields.len()
            ),
        };
        entries.push(entry);
    }

    if entries.is_empty() {
        bail!("matrix list {:?} names no matrices", path);
    }
    Ok(entries)
}

#[derive(Clone, Copy, Debug)]
pub enum IngestMode {
    /// Dense tab-delimited matrix, one line per row.
    Dense,
    /// Coordinate list with 0-based column indices for (i, j, value).
    Coords { i: usize, j: usize, v: usize },
}

#[derive(Clone, Copy, Debug)]
pub struct IngestOptions {
    pub mode: IngestMode,
    /// Leading header lines to discard from each source file.
    pub skip_rows: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { mode: IngestMode::Dense, skip_rows: 0 }
    }
}

/// Open a text source, decompressing transparently when the path ends in
/// `.gz`.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Open {:?}", path))?;
    let is_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gz {
        Ok(Box::new(BufReader::with_capacity(
            256 * 1024,
            MultiGzDecoder::new(file),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(256 * 1024, file)))
    }
}

/// Load one source matrix into a sorted sparse store.
///
/// `listed` is the (row, col) orientation the manifest declares for the
/// file; `canonical` is the orientation the container stores. When they
/// differ (an interchromosomal pair listed backwards) every cell is
/// re-swapped into canonical orientation.
pub fn load_matrix(
    path: &Path,
    listed: (&str, &str),
    canonical: (&str, &str),
    genome: &Genome,
    resolution: u32,
    opts: &IngestOptions,
) -> Result<SortedCells> {
    let intra = listed.0 == listed.1;
    let swapped = !intra && listed != canonical;
    let store = if intra { SparseRows::new_intra() } else { SparseRows::new_inter() };

    let reader = open_text(path)?;
    let mut warnings = Warnings::new(path);
    let store = match opts.mode {
        IngestMode::Coords { i, j, v } => read_coords(
            reader, path, store, listed, genome, resolution, opts.skip_rows,
            (i, j, v), swapped, &mut warnings,
        )?,
        IngestMode::Dense => read_dense(
            reader, path, store, listed, genome, resolution, opts.skip_rows,
            intra, swapped, &mut warnings,
        )?,
    };
    warnings.summarise();

    store
        .finish()
        .with_context(|| format!("matrix {:?}", path))
}

#[allow(clippy::too_many_arguments)]
fn read_coords(
    mut reader: Box<dyn BufRead>,
    path: &Path,
    mut store: SparseRows,
    listed: (&str, &str),
    genome: &Genome,
    resolution: u32,
    skip_rows: usize,
    columns: (usize, usize, usize),
    swapped: bool,
    warnings: &mut Warnings,
) -> Result<SparseRows> {
    let (ci, cj, cv) = columns;
    let needed = ci.max(cj).max(cv);
    let row_bins = genome.bin_count(listed.0, resolution)?;
    let col_bins = genome.bin_count(listed.1, resolution)?;

    let mut buffer = String::with_capacity(256);
    let mut lineno = 0usize;
    loop {
        buffer.clear();
        if reader.read_line(&mut buffer).with_context(|| format!("Read {:?}", path))? == 0 {
            break;
        }
        lineno += 1;
        if lineno <= skip_rows {
            continue;
        }
        let line = buffer.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= needed {
            bail!(
                "{:?}:{}: expected at least {} fields, got {}",
                path, lineno, needed + 1, fields.len()
            );
        }
        let pos_i: u32 = fields[ci]
            .parse()
            .map_err(|_| anyhow!("{:?}:{}: bad coordinate {:?}", path, lineno, fields[ci]))?;
        let pos_j: u32 = fields[cj]
            .parse()
            .map_err(|_| anyhow!("{:?}:{}: bad coordinate {:?}", path, lineno, fields[cj]))?;
        let value = clean_value(fields[cv], lineno, warnings);
        if value == 0.0 {
            continue;
        }

        let bi = bin_of(pos_i, resolution);
        let bj = bin_of(pos_j, resolution);
        if bi >= row_bins {
            bail!(
                "{:?}:{}: coordinate {} maps to bin {} but {} has only {} bins",
                path, lineno, pos_i, bi, listed.0, row_bins
            );
        }
        if bj >= col_bins {
            bail!(
                "{:?}:{}: coordinate {} maps to bin {} but {} has only {} bins",
                path, lineno, pos_j, bj, listed.1, col_bins
            );
        }

        if swapped {
            store.push(bj, bi, value);
        } else {
            store.push(bi, bj, value);
        }
    }

    Ok(store)
}

#[allow(clippy::too_many_arguments)]
fn read_dense(
    mut reader: Box<dyn BufRead>,
    path: &Path,
    mut store: SparseRows,
    listed: (&str, &str),
    genome: &Genome,
    resolution: u32,
    skip_rows: usize,
    intra: bool,
    swapped: bool,
    warnings: &mut Warnings,
) -> Result<SparseRows> {
    let nrows = genome.bin_count(listed.0, resolution)? as usize;
    let ncols = genome.bin_count(listed.1, resolution)? as usize;

    let mut buffer = String::with_capacity(4096);
    let mut lineno = 0usize;
    let mut row = 0usize;
    loop {
        buffer.clear();
        if reader.read_line(&mut buffer).with_context(|| format!("Read {:?}", path))? == 0 {
            break;
        }
        lineno += 1;
        if lineno <= skip_rows {
            continue;
        }
        let line = buffer.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }
        if row >= nrows {
            warnings.extra_rows();
            break;
        }

        let fields = tab_fields(line);
        if fields.len() < ncols {
            bail!(
                "{:?}:{}: row {} has {} columns but {} requires {}",
                path, lineno, row, fields.len(), listed.1, ncols
            );
        }
        let extra = fields.len() - ncols;
        if extra > 0 {
            warnings.extra_columns(extra);
        }

        let first_col = if intra { row } else { 0 };
        for col in first_col..ncols {
            let value = clean_value(fields[extra + col], lineno, warnings);
            if value == 0.0 {
                continue;
            }
            if swapped {
                store.push(col as u32, row as u32, value);
            } else {
                store.push(row as u32, col as u32, value);
            }
        }
        row += 1;
    }

    if row < nrows {
        bail!(
            "{:?}: {} rows of data but {} requires {}",
            path, row, listed.0, nrows
        );
    }
    Ok(store)
}

/// Split a line on tabs. memchr keeps this off the std split path in the
/// dense hot loop.
fn tab_fields(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut fields = Vec::with_capacity(64);
    let mut start = 0usize;
    for tab in memchr::memchr_iter(b'\t', bytes) {
        fields.push(&line[start..tab]);
        start = tab + 1;
    }
    fields.push(&line[start..]);
    fields
}

/// Numeric cleanup shared by both ingest modes: NaN becomes 0.0,
/// infinities clamp to +-1.0e38, unparseable tokens become 0.0 with a
/// warning.
fn clean_value(token: &str, lineno: usize, warnings: &mut Warnings) -> f32 {
    match token.parse::<f32>() {
        Ok(v) if v.is_nan() => 0.0,
        Ok(v) if v.is_infinite() => {
            if v > 0.0 { INF_SUBSTITUTE } else { -INF_SUBSTITUTE }
        }
        Ok(v) => v,
        Err(_) => {
            warnings.non_numeric(token, lineno);
            0.0
        }
    }
}

/// Per-file warning sink: prints the first few occurrences, then a count.
struct Warnings {
    label: String,
    non_numeric: u64,
    extra_columns: Option<usize>,
    extra_rows: bool,
}

impl Warnings {
    fn new(path: &Path) -> Self {
        Self {
            label: path.display().to_string(),
            non_numeric: 0,
            extra_columns: None,
            extra_rows: false,
        }
    }

    fn non_numeric(&mut self, token: &str, lineno: usize) {
        self.non_numeric += 1;
        if self.non_numeric <= MAX_SHOWN_WARNINGS {
            eprintln!(
                "Warning: {}:{}: non-numeric value {:?} treated as 0.0",
                self.label, lineno, token
            );
        }
    }

    fn extra_columns(&mut self, n: usize) {
        if self.extra_columns.is_none() {
            eprintln!(
                "Warning: {}: {} leading column(s) beyond the expected width, discarding",
                self.label, n
            );
        }
        self.extra_columns = Some(n);
    }

    fn extra_rows(&mut self) {
        if !self.extra_rows {
            eprintln!(
                "Warning: {}: more rows than the chromosome has bins, ignoring the excess",
                self.label
            );
        }
        self.extra_rows = true;
    }

    fn summarise(&self) {
        if self.non_numeric > MAX_SHOWN_WARNINGS {
            eprintln!(
                "Warning: {}: {} non-numeric values in total, all treated as 0.0",
                self.label, self.non_numeric
            );
        }
    }
}
