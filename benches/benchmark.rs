use butlr_rs::genome::Genome;
use butlr_rs::ingest::{IngestMode, IngestOptions, ManifestEntry};
use butlr_rs::reader::{Butlr, QueryUnit};
use butlr_rs::utils::Region;
use butlr_rs::writer::{write_butlr, WriteOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const RESOLUTION: u32 = 10_000;
const CHROM_SIZE: u32 = 10_000_000;

fn coords_opts() -> IngestOptions {
    IngestOptions {
        mode: IngestMode::Coords { i: 0, j: 1, v: 2 },
        skip_rows: 0,
    }
}

/// Deterministic upper-triangle coordinate list, ~77k cells over 1001 bins.
fn synthetic_source(dir: &Path) -> PathBuf {
    let path = dir.join("m.txt");
    let mut f = BufWriter::new(File::create(&path).unwrap());
    let bins = CHROM_SIZE / RESOLUTION;
    for r in 0..bins {
        for c in (r..bins).step_by(13) {
            writeln!(
                f,
                "{} {} {}",
                r * RESOLUTION,
                c * RESOLUTION,
                (r % 97 + c % 89 + 1) as f32
            )
            .unwrap();
        }
    }
    f.flush().unwrap();
    path
}

fn manifest(src: &Path) -> Vec<ManifestEntry> {
    vec![ManifestEntry {
        row_chrom: "chr1".to_string(),
        col_chrom: "chr1".to_string(),
        path: src.to_path_buf(),
    }]
}

fn benchmark_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let genome = Genome::from_entries(vec![("chr1".to_string(), CHROM_SIZE)]).unwrap();
    let src = synthetic_source(dir.path());
    let entries = manifest(&src);
    let out = dir.path().join("bench.btr");

    let mut group = c.benchmark_group("writer");
    group.sample_size(10);
    group.bench_function("write_77k_cells", |b| {
        b.iter(|| {
            write_butlr(
                &genome,
                &entries,
                &WriteOptions::new("bench", RESOLUTION),
                &coords_opts(),
                &out,
                None,
            )
            .unwrap();
            black_box(&out);
        })
    });
    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let genome = Genome::from_entries(vec![("chr1".to_string(), CHROM_SIZE)]).unwrap();
    let src = synthetic_source(dir.path());
    let out = dir.path().join("bench.btr");
    write_butlr(
        &genome,
        &manifest(&src),
        &WriteOptions::new("bench", RESOLUTION),
        &coords_opts(),
        &out,
        None,
    )
    .unwrap();

    let region = Region {
        chrom: "chr1".to_string(),
        start: None,
        end: None,
    };
    c.bench_function("read_full_range", |b| {
        let mut butlr = Butlr::open(&out).unwrap();
        b.iter(|| {
            let m = butlr.query(&region, None, QueryUnit::BasePairs).unwrap();
            black_box(m.values.len())
        })
    });
}

criterion_group!(benches, benchmark_write, benchmark_read);
criterion_main!(benches);
