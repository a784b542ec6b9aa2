//! BUTLR reader: header and directory parsing, then random-access
//! range queries reconstructing dense sub-matrices.

use crate::format::{self, CELL_BYTES, OFFSET_BYTES, VERSION_FIELD_LEN};
use crate::genome::{bin_count_for, bin_of};
use crate::utils::Region;
use anyhow::{anyhow, bail, Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct ChromEntry {
    pub name: String,
    pub size: u32,
    pub body: u64,
}

#[derive(Clone, Debug)]
pub struct PairEntry {
    pub row: String,
    pub col: String,
    pub body: u64,
}

/// Whether query coordinates are base pairs or bin indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryUnit {
    BasePairs,
    Bins,
}

/// A reconstructed dense sub-matrix with its bin window.
pub struct DenseMatrix {
    pub row_chrom: String,
    pub col_chrom: String,
    /// Inclusive bin range covered by the rows.
    pub row_bins: (u32, u32),
    /// Inclusive bin range covered by the columns.
    pub col_bins: (u32, u32),
    pub values: Vec<Vec<f32>>,
}

pub struct Butlr {
    file: BufReader<File>,
    path: PathBuf,
    pub header_size: u32,
    pub version: String,
    pub assembly: String,
    pub resolution: u32,
    pub mcv: f32,
    chroms: Vec<ChromEntry>,
    chrom_index: FxHashMap<String, usize>,
    pairs: Vec<PairEntry>,
    pair_index: FxHashMap<(String, String), usize>,
}

impl Butlr {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Open {:?}", path))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header_size = format::read_u32(&mut reader)?;
        let mut version_raw = [0u8; VERSION_FIELD_LEN];
        reader.read_exact(&mut version_raw)?;
        let version = format::parse_version_field(&version_raw)?;
        let intra_dir = format::read_u32(&mut reader)? as u64;
        let inter_dir = format::read_u32(&mut reader)? as u64;
        let assembly = format::read_cstring(&mut reader)?;
        let resolution = format::read_u32(&mut reader)?;
        let mcv = format::read_f32(&mut reader)?;
        for _ in 0..format::RESERVED_FIELDS {
            let _ = format::read_u32(&mut reader)?; // reserved, ignored
        }

        if resolution == 0 {
            bail!("{:?}: zero resolution in header", path);
        }
        let fixed_end = reader.stream_position()?;
        let header_size_u64 = header_size as u64;
        if header_size_u64 > file_len || intra_dir < fixed_end || intra_dir > header_size_u64 {
            bail!("{:?}: impossible header offsets", path);
        }
        if inter_dir != 0 && (inter_dir < intra_dir || inter_dir > header_size_u64) {
            bail!("{:?}: impossible interchromosomal directory offset", path);
        }

        let intra_end = if inter_dir != 0 { inter_dir } else { header_size_u64 };
        let mut chroms = Vec::new();
        let mut chrom_index = FxHashMap::default();
        reader.seek(SeekFrom::Start(intra_dir))?;
        let mut pos = intra_dir;
        while pos < intra_end {
            let name = format::read_cstring(&mut reader)
                .with_context(|| format!("{:?}: truncated chromosome directory", path))?;
            let size = format::read_u32(&mut reader)?;
            let body = format::read_u64(&mut reader)?;
            pos += name.len() as u64 + 1 + 4 + 8;
            if pos > intra_end {
                bail!("{:?}: chromosome directory overruns the header", path);
            }
            if body == 0 || body > file_len {
                bail!("{:?}: chromosome {} has an invalid body offset", path, name);
            }
            if chrom_index.insert(name.clone(), chroms.len()).is_some() {
                bail!("{:?}: chromosome {} listed twice", path, name);
            }
            chroms.push(ChromEntry { name, size, body });
        }

        let mut pairs = Vec::new();
        let mut pair_index = FxHashMap::default();
        if inter_dir != 0 {
            reader.seek(SeekFrom::Start(inter_dir))?;
            let mut pos = inter_dir;
            while pos < header_size_u64 {
                let key = format::read_cstring(&mut reader)
                    .with_context(|| format!("{:?}: truncated pair directory", path))?;
                let body = format::read_u64(&mut reader)?;
                pos += key.len() as u64 + 1 + 8;
                if pos > header_size_u64 {
                    bail!("{:?}: pair directory overruns the header", path);
                }
                let Some((row, col)) = key.split_once('\t') else {
                    bail!("{:?}: malformed pair key {:?}", path, key);
                };
                if body == 0 || body > file_len {
                    bail!("{:?}: pair {} / {} has an invalid body offset", path, row, col);
                }
                let row_size = chrom_index
                    .get(row)
                    .map(|&i| chroms[i].size)
                    .ok_or_else(|| anyhow!("{:?}: pair row {:?} missing from directory", path, row))?;
                let col_size = chrom_index
                    .get(col)
                    .map(|&i| chroms[i].size)
                    .ok_or_else(|| anyhow!("{:?}: pair column {:?} missing from directory", path, col))?;
                // Canonical orientation: the column outranks the row.
                if !(col_size > row_size || (col_size == row_size && col < row)) {
                    bail!(
                        "{:?}: pair {} / {} is not stored in canonical orientation",
                        path, row, col
                    );
                }
                let k = (row.to_string(), col.to_string());
                if pair_index.insert(k, pairs.len()).is_some() {
                    bail!("{:?}: pair {} / {} listed twice", path, row, col);
                }
                pairs.push(PairEntry {
                    row: row.to_string(),
                    col: col.to_string(),
                    body,
                });
            }
        }

        Ok(Self {
            file: reader,
            path: path.to_path_buf(),
            header_size,
            version,
            assembly,
            resolution,
            mcv,
            chroms,
            chrom_index,
            pairs,
            pair_index,
        })
    }

    pub fn chromosomes(&self) -> &[ChromEntry] {
        &self.chroms
    }

    pub fn pairs(&self) -> &[PairEntry] {
        &self.pairs
    }

    fn chrom(&self, name: &str) -> Result<&ChromEntry> {
        self.chrom_index
            .get(name)
            .map(|&i| &self.chroms[i])
            .ok_or_else(|| anyhow!("{:?}: chromosome {:?} not present", self.path, name))
    }

    pub fn bin_count(&self, name: &str) -> Result<u32> {
        Ok(bin_count_for(self.chrom(name)?.size, self.resolution))
    }

    /// Resolve one query region to an inclusive bin range.
    fn resolve(&self, region: &Region, unit: QueryUnit) -> Result<(String, u32, u32)> {
        let nbins = self.bin_count(&region.chrom)?;
        let (lo, hi) = match (region.start, region.end) {
            (None, None) => (0, nbins - 1),
            (Some(s), Some(e)) => match unit {
                QueryUnit::BasePairs => (bin_of(s, self.resolution), bin_of(e, self.resolution)),
                QueryUnit::Bins => (s, e),
            },
            _ => bail!("query on {} has only one bound", region.chrom),
        };
        if lo > hi {
            bail!("query on {} has an inverted range", region.chrom);
        }
        if hi >= nbins {
            bail!(
                "query end (bin {}) is past the end of {} ({} bins)",
                hi, region.chrom, nbins
            );
        }
        Ok((region.chrom.clone(), lo, hi))
    }

    /// Answer a query: one region for a symmetric intrachromosomal
    /// window, two for a rectangle (same chromosome) or a pair matrix.
    pub fn query(
        &mut self,
        a: &Region,
        b: Option<&Region>,
        unit: QueryUnit,
    ) -> Result<DenseMatrix> {
        let (row_chrom, row_lo, row_hi) = self.resolve(a, unit)?;
        match b {
            None => self.get_intra(&row_chrom, (row_lo, row_hi), (row_lo, row_hi)),
            Some(b) => {
                let (col_chrom, col_lo, col_hi) = self.resolve(b, unit)?;
                if col_chrom == row_chrom {
                    self.get_intra(&row_chrom, (row_lo, row_hi), (col_lo, col_hi))
                } else {
                    self.get_pair(&row_chrom, (row_lo, row_hi), &col_chrom, (col_lo, col_hi))
                }
            }
        }
    }

    /// Dense window of an intrachromosomal matrix. Cells are stored
    /// upper-triangular only, so (i, j) with i > j is read from (j, i).
    fn get_intra(
        &mut self,
        chrom: &str,
        rows: (u32, u32),
        cols: (u32, u32),
    ) -> Result<DenseMatrix> {
        let entry = self.chrom(chrom)?;
        let body = entry.body;
        let nbins = bin_count_for(entry.size, self.resolution);
        let name = entry.name.clone();

        let nrows_out = (rows.1 - rows.0 + 1) as usize;
        let ncols_out = (cols.1 - cols.0 + 1) as usize;
        let mut values = vec![vec![self.mcv; ncols_out]; nrows_out];

        // A stored cell (r, c) with r <= c serves the window directly and
        // through its mirror image.
        let scan_lo = rows.0.min(cols.0);
        let scan_hi = rows.1.max(cols.1);
        for r in scan_lo..=scan_hi {
            let Some(span) = self.row_span(body, nbins, r)? else {
                continue;
            };
            for (c, v) in self.read_row_cells(span, scan_hi)? {
                if r >= rows.0 && r <= rows.1 && c >= cols.0 && c <= cols.1 {
                    values[(r - rows.0) as usize][(c - cols.0) as usize] = v;
                }
                if c >= rows.0 && c <= rows.1 && r >= cols.0 && r <= cols.1 {
                    values[(c - rows.0) as usize][(r - cols.0) as usize] = v;
                }
            }
        }

        Ok(DenseMatrix {
            row_chrom: name.clone(),
            col_chrom: name,
            row_bins: rows,
            col_bins: cols,
            values,
        })
    }

    /// Dense window of an interchromosomal matrix. When the query orders
    /// the chromosomes opposite to storage, the canonical rows are walked
    /// and scattered into the transposed output.
    fn get_pair(
        &mut self,
        a_chrom: &str,
        a_range: (u32, u32),
        b_chrom: &str,
        b_range: (u32, u32),
    ) -> Result<DenseMatrix> {
        let (body, transposed) = if let Some(&i) =
            self.pair_index.get(&(a_chrom.to_string(), b_chrom.to_string()))
        {
            (self.pairs[i].body, false)
        } else if let Some(&i) =
            self.pair_index.get(&(b_chrom.to_string(), a_chrom.to_string()))
        {
            (self.pairs[i].body, true)
        } else {
            bail!(
                "{:?}: no interchromosomal matrix for {} / {}",
                self.path, a_chrom, b_chrom
            );
        };

        let nrows_out = (a_range.1 - a_range.0 + 1) as usize;
        let ncols_out = (b_range.1 - b_range.0 + 1) as usize;
        let mut values = vec![vec![self.mcv; ncols_out]; nrows_out];

        if !transposed {
            // Query rows are the stored rows.
            let stored_rows = self.bin_count(a_chrom)?;
            for r in a_range.0..=a_range.1 {
                let Some(span) = self.row_span(body, stored_rows, r)? else {
                    continue;
                };
                for (c, v) in self.read_row_cells(span, b_range.1)? {
                    if c >= b_range.0 {
                        values[(r - a_range.0) as usize][(c - b_range.0) as usize] = v;
                    }
                }
            }
        } else {
            // Stored rows run along the query columns; scatter transposed.
            let stored_rows = self.bin_count(b_chrom)?;
            for r in b_range.0..=b_range.1 {
                let Some(span) = self.row_span(body, stored_rows, r)? else {
                    continue;
                };
                for (c, v) in self.read_row_cells(span, a_range.1)? {
                    if c >= a_range.0 {
                        values[(c - a_range.0) as usize][(r - b_range.0) as usize] = v;
                    }
                }
            }
        }

        Ok(DenseMatrix {
            row_chrom: a_chrom.to_string(),
            col_chrom: b_chrom.to_string(),
            row_bins: a_range,
            col_bins: b_range,
            values,
        })
    }

    /// Byte span of one row's cells, or None for a row with no cells.
    /// `body` is the row-offset table start recorded in the directory.
    fn row_span(&mut self, body: u64, nrows: u32, row: u32) -> Result<Option<(u64, u64)>> {
        if row >= nrows {
            bail!(
                "{:?}: row {} beyond the row-offset table ({} rows)",
                self.path, row, nrows
            );
        }
        self.file
            .seek(SeekFrom::Start(body + OFFSET_BYTES * row as u64))?;
        let start = format::read_u64(&mut self.file)
            .with_context(|| format!("{:?}: truncated row-offset table", self.path))?;
        if start == 0 {
            return Ok(None);
        }

        // The end is the next non-zero entry; the sentinel guarantees one.
        let mut end = 0u64;
        for _ in row + 1..=nrows {
            let e = format::read_u64(&mut self.file)
                .with_context(|| format!("{:?}: truncated row-offset table", self.path))?;
            if e != 0 {
                end = e;
                break;
            }
        }
        if end < start {
            bail!("{:?}: row-offset table not ascending", self.path);
        }
        Ok(Some((start, end)))
    }

    /// Cells of one span, stopping early once past `col_hi` (columns are
    /// stored ascending).
    fn read_row_cells(&mut self, span: (u64, u64), col_hi: u32) -> Result<Vec<(u32, f32)>> {
        let (start, end) = span;
        if (end - start) % CELL_BYTES != 0 {
            bail!("{:?}: cell span is not a whole number of cells", self.path);
        }
        let count = (end - start) / CELL_BYTES;
        self.file.seek(SeekFrom::Start(start))?;
        let mut cells = Vec::new();
        for _ in 0..count {
            let col = format::read_u32(&mut self.file)
                .with_context(|| format!("{:?}: truncated cell region", self.path))?;
            let value = format::read_f32(&mut self.file)
                .with_context(|| format!("{:?}: truncated cell region", self.path))?;
            if col > col_hi {
                break;
            }
            cells.push((col, value));
        }
        Ok(cells)
    }
}
