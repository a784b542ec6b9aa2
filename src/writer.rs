//! BUTLR writer: two-pass, single-handle, placeholder-and-backpatch.
//!
//! The header and both directories are laid down first with zeroed
//! offsets, then each matrix body is streamed and its directory entry
//! patched in place. A failure on any path unlinks the partial output.

use crate::format::{
    self, CELL_BYTES, FORMAT_VERSION, HEADER_SIZE_POS, INTER_DIR_POS, INTRA_DIR_POS,
};
use crate::genome::Genome;
use crate::ingest::{self, IngestOptions, ManifestEntry};
use crate::sparse::{SortedCells, SparseRows};
use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct WriteOptions {
    pub assembly: String,
    pub resolution: u32,
    pub version: String,
    /// Implicit value of absent cells. The writer always stores 0.0.
    pub mcv: f32,
}

impl WriteOptions {
    pub fn new(assembly: &str, resolution: u32) -> Self {
        Self {
            assembly: assembly.to_string(),
            resolution,
            version: FORMAT_VERSION.to_string(),
            mcv: 0.0,
        }
    }
}

/// One matrix to emit: a directory slot plus its source file, if any.
/// A chromosome referenced only by pair entries has no source and gets
/// an empty body so its directory entry can still be backpatched.
struct MatrixJob {
    row_chrom: String,
    col_chrom: String,
    source: Option<ManifestEntry>,
}

impl MatrixJob {
    fn is_intra(&self) -> bool {
        self.row_chrom == self.col_chrom
    }

    fn label(&self) -> String {
        if self.is_intra() {
            self.row_chrom.clone()
        } else {
            format!("{}\t{}", self.row_chrom, self.col_chrom)
        }
    }
}

/// Removes the output file on drop unless the write committed.
struct OutputGuard {
    path: PathBuf,
    committed: bool,
}

impl OutputGuard {
    fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf(), committed: false }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Produce a complete BUTLR file from a genome, a manifest and an
/// ingestion strategy.
pub fn write_butlr(
    genome: &Genome,
    manifest: &[ManifestEntry],
    opts: &WriteOptions,
    ingest_opts: &IngestOptions,
    out_path: &Path,
    progress: Option<&ProgressBar>,
) -> Result<()> {
    let (intra_jobs, pair_jobs) = plan_jobs(genome, manifest)?;

    let mut guard = OutputGuard::new(out_path);
    let file = File::create(out_path).with_context(|| format!("Create {:?}", out_path))?;
    let mut w = BufWriter::new(file);

    // Pass one: fixed header with zeroed offsets, then both directories.
    format::write_u32(&mut w, 0)?; // header size, patched last
    format::write_version_field(&mut w, &opts.version)?;
    format::write_u32(&mut w, 0)?; // intra directory offset
    format::write_u32(&mut w, 0)?; // inter directory offset
    format::write_cstring(&mut w, &opts.assembly)?;
    format::write_u32(&mut w, opts.resolution)?;
    format::write_f32(&mut w, opts.mcv)?;
    for _ in 0..format::RESERVED_FIELDS {
        format::write_u32(&mut w, 0)?;
    }

    let intra_dir = w.stream_position()?;
    patch_u32(&mut w, INTRA_DIR_POS, cast_header_offset(intra_dir)?)?;
    let mut intra_slots = Vec::with_capacity(intra_jobs.len());
    for job in &intra_jobs {
        format::write_cstring(&mut w, &job.row_chrom)?;
        format::write_u32(&mut w, genome.size(&job.row_chrom)?)?;
        intra_slots.push(w.stream_position()?);
        format::write_u64(&mut w, 0)?;
    }

    let mut pair_slots = Vec::with_capacity(pair_jobs.len());
    if !pair_jobs.is_empty() {
        let inter_dir = w.stream_position()?;
        patch_u32(&mut w, INTER_DIR_POS, cast_header_offset(inter_dir)?)?;
        for job in &pair_jobs {
            format::write_cstring(&mut w, &job.label())?;
            pair_slots.push(w.stream_position()?);
            format::write_u64(&mut w, 0)?;
        }
    }

    let header_size = w.stream_position()?;
    patch_u32(&mut w, HEADER_SIZE_POS, cast_header_offset(header_size)?)?;

    // Pass two: stream each body and patch its directory entry.
    for (job, slot) in intra_jobs.iter().zip(&intra_slots) {
        write_job(&mut w, genome, opts, ingest_opts, job, *slot, progress)?;
    }
    for (job, slot) in pair_jobs.iter().zip(&pair_slots) {
        write_job(&mut w, genome, opts, ingest_opts, job, *slot, progress)?;
    }

    w.flush().with_context(|| format!("Flush {:?}", out_path))?;
    guard.commit();
    Ok(())
}

/// Validate the manifest against the genome and lay out the directory
/// order: canonical chromosomes first, then canonical pairs (outranked
/// chromosome as row), each stored exactly once.
fn plan_jobs(
    genome: &Genome,
    manifest: &[ManifestEntry],
) -> Result<(Vec<MatrixJob>, Vec<MatrixJob>)> {
    let mut intra_sources: FxHashMap<&str, &ManifestEntry> = FxHashMap::default();
    let mut pair_sources: FxHashMap<(&str, &str), &ManifestEntry> = FxHashMap::default();
    let mut referenced: FxHashMap<&str, ()> = FxHashMap::default();

    for entry in manifest {
        for chrom in [&entry.row_chrom, &entry.col_chrom] {
            if !genome.contains(chrom) {
                bail!(
                    "matrix list references {:?}, absent from the genome size table",
                    chrom
                );
            }
            referenced.insert(chrom.as_str(), ());
        }
        if entry.is_intra() {
            if intra_sources.insert(entry.row_chrom.as_str(), entry).is_some() {
                bail!("matrix list names {} more than once", entry.row_chrom);
            }
        } else {
            let key = genome.canonical_orientation(&entry.row_chrom, &entry.col_chrom)?;
            if pair_sources.insert(key, entry).is_some() {
                bail!(
                    "matrix list names the pair {} / {} more than once",
                    key.0, key.1
                );
            }
        }
    }

    let sorted = genome.sorted_chromosomes();
    let intra_jobs: Vec<MatrixJob> = sorted
        .iter()
        .filter(|c| referenced.contains_key(c.as_str()))
        .map(|c| MatrixJob {
            row_chrom: c.clone(),
            col_chrom: c.clone(),
            source: intra_sources.get(c.as_str()).map(|e| (*e).clone()),
        })
        .collect();

    let mut pair_jobs = Vec::new();
    for i in 0..sorted.len() {
        for j in 0..i {
            // sorted[i] is outranked by sorted[j], so it is the row.
            let key = (sorted[i].as_str(), sorted[j].as_str());
            if let Some(entry) = pair_sources.get(&key) {
                pair_jobs.push(MatrixJob {
                    row_chrom: key.0.to_string(),
                    col_chrom: key.1.to_string(),
                    source: Some((*entry).clone()),
                });
            }
        }
    }

    Ok((intra_jobs, pair_jobs))
}

fn write_job(
    w: &mut BufWriter<File>,
    genome: &Genome,
    opts: &WriteOptions,
    ingest_opts: &IngestOptions,
    job: &MatrixJob,
    slot: u64,
    progress: Option<&ProgressBar>,
) -> Result<()> {
    if let Some(pb) = progress {
        pb.set_message(format!("Writing {}", job.label().replace('\t', " x ")));
    }

    let cells = match &job.source {
        Some(entry) => ingest::load_matrix(
            &entry.path,
            (&entry.row_chrom, &entry.col_chrom),
            (&job.row_chrom, &job.col_chrom),
            genome,
            opts.resolution,
            ingest_opts,
        )?,
        None => SparseRows::new_intra().finish()?,
    };

    let nrows = genome.bin_count(&job.row_chrom, opts.resolution)?;
    let ncols = genome.bin_count(&job.col_chrom, opts.resolution)?;
    let body = write_matrix_body(w, &cells, nrows, ncols)
        .with_context(|| format!("matrix {}", job.label().replace('\t', " x ")))?;
    patch_u64(w, slot, body)?;
    Ok(())
}

/// Stream one matrix: the cell region followed by its row-offset table.
/// Returns the absolute offset of the table, which is what the directory
/// entry records.
fn write_matrix_body(
    w: &mut BufWriter<File>,
    cells: &SortedCells,
    nrows: u32,
    ncols: u32,
) -> Result<u64> {
    let mut table = vec![0u64; nrows as usize + 1];
    let mut cursor = w.stream_position()?;

    for (row, group) in cells.rows() {
        if row >= nrows {
            bail!("row bin {} out of range ({} rows)", row, nrows);
        }
        table[row as usize] = cursor;
        for cell in group {
            if cell.col >= ncols {
                bail!("column bin {} out of range ({} columns)", cell.col, ncols);
            }
            format::write_u32(w, cell.col)?;
            format::write_f32(w, cell.value)?;
        }
        cursor += CELL_BYTES * group.len() as u64;
        // End of this run; the next non-empty row starts here anyway.
        table[row as usize + 1] = cursor;
    }

    table[nrows as usize] = cursor;
    for offset in &table {
        format::write_u64(w, *offset)?;
    }
    Ok(cursor)
}

fn cast_header_offset(pos: u64) -> Result<u32> {
    u32::try_from(pos).map_err(|_| anyhow::anyhow!("header grew past 4 GiB"))
}

fn patch_u32(w: &mut BufWriter<File>, pos: u64, value: u32) -> Result<()> {
    let here = w.stream_position()?;
    w.seek(SeekFrom::Start(pos))?;
    format::write_u32(w, value)?;
    w.seek(SeekFrom::Start(here))?;
    Ok(())
}

fn patch_u64(w: &mut BufWriter<File>, pos: u64, value: u64) -> Result<()> {
    let here = w.stream_position()?;
    w.seek(SeekFrom::Start(pos))?;
    format::write_u64(w, value)?;
    w.seek(SeekFrom::Start(here))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestMode;
    use std::io::Write as _;

    fn coords_opts() -> IngestOptions {
        IngestOptions { mode: IngestMode::Coords { i: 0, j: 1, v: 2 }, skip_rows: 0 }
    }

    fn write_source(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn u32_at(bytes: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], pos: usize) -> u64 {
        u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap())
    }

    fn f32_at(bytes: &[u8], pos: usize) -> f32 {
        f32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
    }

    #[test]
    fn tiny_diagonal_layout_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![("chr1".to_string(), 100)]).unwrap();
        let src = write_source(dir.path(), "m.txt", "0 0 1.0\n0 50 2.0\n50 50 3.0\n");
        let manifest = vec![ManifestEntry {
            row_chrom: "chr1".to_string(),
            col_chrom: "chr1".to_string(),
            path: src,
        }];
        let out = dir.path().join("out.btr");
        write_butlr(
            &genome,
            &manifest,
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out,
            None,
        )
        .unwrap();

        let bytes = fs::read(&out).unwrap();
        assert_eq!(bytes.len(), 130);

        // Fixed header.
        assert_eq!(u32_at(&bytes, 0), 74); // header size
        assert_eq!(&bytes[4..8], b"1.3\0");
        assert!(bytes[8..20].iter().all(|&b| b == 0));
        assert_eq!(u32_at(&bytes, 20), 57); // intra directory
        assert_eq!(u32_at(&bytes, 24), 0); // no inter directory
        assert_eq!(&bytes[28..33], b"test\0");
        assert_eq!(u32_at(&bytes, 33), 50); // resolution
        assert_eq!(f32_at(&bytes, 37), 0.0); // mcv
        assert!(bytes[41..57].iter().all(|&b| b == 0)); // reserved

        // Directory entry.
        assert_eq!(&bytes[57..62], b"chr1\0");
        assert_eq!(u32_at(&bytes, 62), 100); // size
        assert_eq!(u64_at(&bytes, 66), 98); // body offset = table start

        // Cell region: row 0 -> (0, 1.0), (1, 2.0); row 1 -> (1, 3.0).
        assert_eq!(u32_at(&bytes, 74), 0);
        assert_eq!(f32_at(&bytes, 78), 1.0);
        assert_eq!(u32_at(&bytes, 82), 1);
        assert_eq!(f32_at(&bytes, 86), 2.0);
        assert_eq!(u32_at(&bytes, 90), 1);
        assert_eq!(f32_at(&bytes, 94), 3.0);

        // Row-offset table for 3 bins: 4 entries ending in the sentinel.
        assert_eq!(u64_at(&bytes, 98), 74);
        assert_eq!(u64_at(&bytes, 106), 90);
        assert_eq!(u64_at(&bytes, 114), 98);
        assert_eq!(u64_at(&bytes, 122), 98);
    }

    #[test]
    fn empty_rows_inherit_the_previous_run_end() {
        // 4 bins, single cell at (2, 3): table [0, 0, B, B+8, B+8].
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![("chr1".to_string(), 150)]).unwrap();
        let src = write_source(dir.path(), "m.txt", "100 150 9.0\n");
        let manifest = vec![ManifestEntry {
            row_chrom: "chr1".to_string(),
            col_chrom: "chr1".to_string(),
            path: src,
        }];
        let out = dir.path().join("out.btr");
        write_butlr(
            &genome,
            &manifest,
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out,
            None,
        )
        .unwrap();

        let bytes = fs::read(&out).unwrap();
        let header_size = u32_at(&bytes, 0) as usize;
        let body = u64_at(&bytes, header_size - 8);
        let cell_start = header_size as u64;
        assert_eq!(body, cell_start + 8); // one cell precedes the table

        let t = body as usize;
        let table: Vec<u64> = (0..5).map(|i| u64_at(&bytes, t + i * 8)).collect();
        assert_eq!(table, vec![0, 0, cell_start, cell_start + 8, cell_start + 8]);
    }

    #[test]
    fn pair_orientation_is_canonical_regardless_of_listing() {
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![
            ("chr1".to_string(), 500),
            ("chr2".to_string(), 1000),
        ])
        .unwrap();

        // Same contacts, listed in both orientations: coordinates swap
        // with the listing so the physical matrix is identical.
        let fwd = write_source(dir.path(), "fwd.txt", "100 200 4.0\n0 950 2.5\n");
        let rev = write_source(dir.path(), "rev.txt", "200 100 4.0\n950 0 2.5\n");

        let out_a = dir.path().join("a.btr");
        write_butlr(
            &genome,
            &[ManifestEntry {
                row_chrom: "chr1".to_string(),
                col_chrom: "chr2".to_string(),
                path: fwd,
            }],
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out_a,
            None,
        )
        .unwrap();

        let out_b = dir.path().join("b.btr");
        write_butlr(
            &genome,
            &[ManifestEntry {
                row_chrom: "chr2".to_string(),
                col_chrom: "chr1".to_string(),
                path: rev,
            }],
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out_b,
            None,
        )
        .unwrap();

        assert_eq!(fs::read(&out_a).unwrap(), fs::read(&out_b).unwrap());

        // The stored key is the canonical one: chr2 outranks, chr1 rows.
        let bytes = fs::read(&out_a).unwrap();
        let inter_dir = u32_at(&bytes, 24) as usize;
        assert_ne!(inter_dir, 0);
        let key_end = bytes[inter_dir..].iter().position(|&b| b == 0).unwrap();
        assert_eq!(&bytes[inter_dir..inter_dir + key_end], b"chr1\tchr2");
        assert_ne!(u64_at(&bytes, inter_dir + key_end + 1), 0);
    }

    #[test]
    fn failure_unlinks_the_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![("chr1".to_string(), 100)]).unwrap();
        let manifest = vec![ManifestEntry {
            row_chrom: "chr1".to_string(),
            col_chrom: "chr1".to_string(),
            path: dir.path().join("missing.txt"),
        }];
        let out = dir.path().join("out.btr");
        assert!(write_butlr(
            &genome,
            &manifest,
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out,
            None,
        )
        .is_err());
        assert!(!out.exists(), "failed write left {:?} behind", out);
    }

    #[test]
    fn duplicate_manifest_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![
            ("chr1".to_string(), 500),
            ("chr2".to_string(), 1000),
        ])
        .unwrap();
        let src = write_source(dir.path(), "m.txt", "0 0 1.0\n");
        let out = dir.path().join("out.btr");

        // Same pair under both orientations collapses to one canonical
        // key, which may only be stored once.
        let manifest = vec![
            ManifestEntry {
                row_chrom: "chr1".to_string(),
                col_chrom: "chr2".to_string(),
                path: src.clone(),
            },
            ManifestEntry {
                row_chrom: "chr2".to_string(),
                col_chrom: "chr1".to_string(),
                path: src,
            },
        ];
        assert!(write_butlr(
            &genome,
            &manifest,
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out,
            None,
        )
        .is_err());
        assert!(!out.exists());
    }

    #[test]
    fn unknown_chromosome_in_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let genome = Genome::from_entries(vec![("chr1".to_string(), 100)]).unwrap();
        let src = write_source(dir.path(), "m.txt", "0 0 1.0\n");
        let manifest = vec![ManifestEntry {
            row_chrom: "chr9".to_string(),
            col_chrom: "chr9".to_string(),
            path: src,
        }];
        let out = dir.path().join("out.btr");
        assert!(write_butlr(
            &genome,
            &manifest,
            &WriteOptions::new("test", 50),
            &coords_opts(),
            &out,
            None,
        )
        .is_err());
        assert!(!out.exists());
    }
}
