//! Splits a Homer-style whole-genome dense matrix into per-chromosome
//! and per-pair dense files plus a matrix list for `convert`.
//!
//! This is a textual transformation: values pass through verbatim and
//! no binning is done here. The genome size table is only needed to
//! orient pairs canonically.

use crate::genome::Genome;
use crate::ingest::open_text;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Homer matrices carry this many leading label columns.
const LABEL_COLUMNS: usize = 2;

/// A contiguous run of header columns belonging to one chromosome.
struct Segment {
    chrom: String,
    /// Field range within a data row, label columns included.
    start: usize,
    end: usize,
}

struct PairFile {
    row_chrom: String,
    col_chrom: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Split `matrix_path` into `<prefix>.<chrom>.matrix.txt` /
/// `<prefix>.<row>.<col>.matrix.txt` files and write
/// `<prefix>.matrix.list`. Returns the manifest path.
pub fn split_homer_matrix(matrix_path: &Path, genome: &Genome, prefix: &str) -> Result<PathBuf> {
    let mut reader = open_text(matrix_path)?;

    let mut header = String::new();
    if reader
        .read_line(&mut header)
        .with_context(|| format!("Read {:?}", matrix_path))?
        == 0
    {
        bail!("{:?} is empty", matrix_path);
    }
    let segments = parse_header(header.trim_end(), genome)
        .with_context(|| format!("{:?}: header", matrix_path))?;

    let mut outputs: Vec<PairFile> = Vec::new();
    let mut seen_rows: Vec<String> = Vec::new();
    let mut current_row: Option<String> = None;

    let mut buffer = String::with_capacity(4096);
    let mut lineno = 1usize;
    loop {
        buffer.clear();
        if reader
            .read_line(&mut buffer)
            .with_context(|| format!("Read {:?}", matrix_path))?
            == 0
        {
            break;
        }
        lineno += 1;
        let line = buffer.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let width = segments.last().map(|s| s.end).unwrap_or(LABEL_COLUMNS);
        if fields.len() < width {
            bail!(
                "{:?}:{}: row has {} fields, header defines {}",
                matrix_path, lineno, fields.len(), width
            );
        }
        let (row_chrom, _) = parse_label(fields[1])
            .ok_or_else(|| anyhow!("{:?}:{}: bad region label {:?}", matrix_path, lineno, fields[1]))?;
        if !genome.contains(row_chrom) {
            bail!(
                "{:?}:{}: chromosome {:?} not in the genome size table",
                matrix_path, lineno, row_chrom
            );
        }

        // Rows must arrive grouped by chromosome for the per-file blocks
        // to come out contiguous.
        if current_row.as_deref() != Some(row_chrom) {
            if seen_rows.iter().any(|c| c == row_chrom) {
                bail!(
                    "{:?}:{}: rows for {} are not contiguous",
                    matrix_path, lineno, row_chrom
                );
            }
            seen_rows.push(row_chrom.to_string());
            current_row = Some(row_chrom.to_string());
        }

        for seg in &segments {
            let emit = if seg.chrom == row_chrom {
                true
            } else {
                // Keep only the canonical block; the symmetric input
                // carries its mirror image elsewhere.
                let (canon_row, _) = genome.canonical_orientation(row_chrom, &seg.chrom)?;
                canon_row == row_chrom
            };
            if !emit {
                continue;
            }
            let out = output_for(&mut outputs, row_chrom, &seg.chrom, prefix)?;
            let mut first = true;
            for value in &fields[seg.start..seg.end] {
                if !first {
                    out.write_all(b"\t")?;
                }
                out.write_all(value.as_bytes())?;
                first = false;
            }
            out.write_all(b"\n")?;
        }
    }

    if seen_rows.is_empty() {
        bail!("{:?} has no data rows", matrix_path);
    }

    let manifest_path = PathBuf::from(format!("{}.matrix.list", prefix));
    let mut manifest = BufWriter::new(
        File::create(&manifest_path).with_context(|| format!("Create {:?}", manifest_path))?,
    );
    for out in &mut outputs {
        out.writer.flush()?;
        if out.row_chrom == out.col_chrom {
            writeln!(manifest, "{}\t{}", out.row_chrom, out.path.display())?;
        } else {
            writeln!(
                manifest,
                "{}\t{}\t{}",
                out.row_chrom,
                out.col_chrom,
                out.path.display()
            )?;
        }
    }
    manifest.flush()?;
    Ok(manifest_path)
}

/// Header fields after the label columns are `chrom-position` region
/// labels; collapse them into contiguous per-chromosome runs.
fn parse_header(header: &str, genome: &Genome) -> Result<Vec<Segment>> {
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() <= LABEL_COLUMNS {
        bail!("no region columns in header");
    }

    let mut segments: Vec<Segment> = Vec::new();
    for (idx, label) in fields.iter().enumerate().skip(LABEL_COLUMNS) {
        let (chrom, _) =
            parse_label(label).ok_or_else(|| anyhow!("bad region label {:?}", label))?;
        if !genome.contains(chrom) {
            bail!("chromosome {:?} not in the genome size table", chrom);
        }
        match segments.last_mut() {
            Some(seg) if seg.chrom == chrom => seg.end = idx + 1,
            _ => {
                if segments.iter().any(|s| s.chrom == chrom) {
                    bail!("columns for {} are not contiguous", chrom);
                }
                segments.push(Segment {
                    chrom: chrom.to_string(),
                    start: idx,
                    end: idx + 1,
                });
            }
        }
    }
    Ok(segments)
}

/// `chr1-50000` -> ("chr1", 50000). The position is only validated, the
/// split point is the last dash so dashed chromosome names survive.
fn parse_label(label: &str) -> Option<(&str, u64)> {
    let (chrom, pos) = label.rsplit_once('-')?;
    if chrom.is_empty() {
        return None;
    }
    let pos: u64 = pos.parse().ok()?;
    Some((chrom, pos))
}

fn output_for<'a>(
    outputs: &'a mut Vec<PairFile>,
    row_chrom: &str,
    col_chrom: &str,
    prefix: &str,
) -> Result<&'a mut BufWriter<File>> {
    if let Some(i) = outputs
        .iter()
        .position(|o| o.row_chrom == row_chrom && o.col_chrom == col_chrom)
    {
        return Ok(&mut outputs[i].writer);
    }
    let path = if row_chrom == col_chrom {
        PathBuf::from(format!("{}.{}.matrix.txt", prefix, row_chrom))
    } else {
        PathBuf::from(format!("{}.{}.{}.matrix.txt", prefix, row_chrom, col_chrom))
    };
    let file = File::create(&path).with_context(|| format!("Create {:?}", path))?;
    outputs.push(PairFile {
        row_chrom: row_chrom.to_string(),
        col_chrom: col_chrom.to_string(),
        path,
        writer: BufWriter::new(file),
    });
    Ok(&mut outputs.last_mut().unwrap().writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;

    fn genome() -> Genome {
        Genome::from_entries(vec![
            ("chr1".to_string(), 50),
            ("chr2".to_string(), 99),
        ])
        .unwrap()
    }

    fn write_matrix(dir: &Path) -> PathBuf {
        // Header order matches genome rank: chr2 (99 bp) outranks chr1.
        let path = dir.join("homer.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "HiCMatrix\tRegions\tchr2-0\tchr2-50\tchr1-0\tchr1-50").unwrap();
        writeln!(f, "chr2-0\tchr2-0\t1\t2\t10\t11").unwrap();
        writeln!(f, "chr2-50\tchr2-50\t2\t3\t12\t13").unwrap();
        writeln!(f, "chr1-0\tchr1-0\t10\t12\t5\t6").unwrap();
        writeln!(f, "chr1-50\tchr1-50\t11\t13\t6\t7").unwrap();
        path
    }

    #[test]
    fn splits_into_canonical_blocks_and_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let matrix = write_matrix(dir.path());
        let prefix = dir.path().join("out").to_string_lossy().into_owned();
        let manifest = split_homer_matrix(&matrix, &genome(), &prefix).unwrap();

        let listed = fs::read_to_string(&manifest).unwrap();
        let lines: Vec<&str> = listed.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("chr2\t"));
        // Canonical pair: chr2 outranks, so chr1 rows.
        assert!(lines.iter().any(|l| l.starts_with("chr1\tchr2\t")));

        let intra2 = fs::read_to_string(format!("{}.chr2.matrix.txt", prefix)).unwrap();
        assert_eq!(intra2, "1\t2\n2\t3\n");
        let intra1 = fs::read_to_string(format!("{}.chr1.matrix.txt", prefix)).unwrap();
        assert_eq!(intra1, "5\t6\n6\t7\n");
        // Pair block: chr1 rows x chr2 columns; the chr2-row mirror block
        // was skipped.
        let pair = fs::read_to_string(format!("{}.chr1.chr2.matrix.txt", prefix)).unwrap();
        assert_eq!(pair, "10\t12\n11\t13\n");
    }

    #[test]
    fn unknown_chromosome_labels_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homer.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "HiCMatrix\tRegions\tchr9-0").unwrap();
        writeln!(f, "chr9-0\tchr9-0\t1").unwrap();
        let prefix = dir.path().join("out").to_string_lossy().into_owned();
        assert!(split_homer_matrix(&path, &genome(), &prefix).is_err());
    }

    #[test]
    fn scattered_rows_for_one_chromosome_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homer.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "HiCMatrix\tRegions\tchr1-0\tchr1-50").unwrap();
        writeln!(f, "chr1-0\tchr1-0\t1\t2").unwrap();
        writeln!(f, "chr2-0\tchr2-0\t0\t0").unwrap();
        writeln!(f, "chr1-50\tchr1-50\t2\t3").unwrap();
        let prefix = dir.path().join("out").to_string_lossy().into_owned();
        assert!(split_homer_matrix(&path, &genome(), &prefix).is_err());
    }

    #[test]
    fn labels_with_dashed_names_parse() {
        assert_eq!(parse_label("chr1-50000"), Some(("chr1", 50000)));
        assert_eq!(parse_label("scaffold-2-100"), Some(("scaffold-2", 100)));
        assert_eq!(parse_label("chr1"), None);
        assert_eq!(parse_label("chr1-x"), None);
    }
}
