//! Genome model: chromosome name to size mapping and the canonical
//! ordering used to orient chromosome pairs.

use anyhow::{anyhow, bail, Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Base-pair coordinate to bin index at the given resolution.
#[inline]
pub fn bin_of(pos: u32, resolution: u32) -> u32 {
    pos / resolution
}

/// Number of bins for a chromosome of `size` bp.
#[inline]
pub fn bin_count_for(size: u32, resolution: u32) -> u32 {
    size / resolution + 1
}

pub struct Genome {
    sizes: FxHashMap<String, u32>,
    /// Names in canonical order: descending size, then ascending name.
    ordered: Vec<String>,
}

impl Genome {
    /// Read a whitespace-delimited `name size` file. Blank lines and `#`
    /// comments are skipped; duplicate names and bad sizes are fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Open genome size file {:?}", path))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Read {:?}", path))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| anyhow!("{:?}:{}: empty entry", path, lineno + 1))?;
            let size = fields
                .next()
                .ok_or_else(|| anyhow!("{:?}:{}: missing size for {}", path, lineno + 1, name))?;
            let size: u32 = size.parse().with_context(|| {
                format!("{:?}:{}: size of {} is not a non-negative integer", path, lineno + 1, name)
            })?;
            entries.push((name.to_string(), size));
        }

        Self::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<(String, u32)>) -> Result<Self> {
        let mut sizes = FxHashMap::default();
        for (name, size) in &entries {
            if !name.is_ascii() || name.contains('\t') {
                bail!("chromosome name {:?} must be ASCII without tabs", name);
            }
            if sizes.insert(name.clone(), *size).is_some() {
                bail!("duplicate chromosome {:?} in genome size table", name);
            }
        }
        let mut ordered: Vec<String> = entries.into_iter().map(|(n, _)| n).collect();
        ordered.sort_by(|a, b| {
            let sa = sizes[a.as_str()];
            let sb = sizes[b.as_str()];
            sb.cmp(&sa).then_with(|| a.cmp(b))
        });
        Ok(Self { sizes, ordered })
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sizes.contains_key(name)
    }

    pub fn size(&self, name: &str) -> Result<u32> {
        self.sizes
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("chromosome {:?} not in genome size table", name))
    }

    pub fn bin_count(&self, name: &str, resolution: u32) -> Result<u32> {
        Ok(bin_count_for(self.size(name)?, resolution))
    }

    /// Chromosomes by descending size, ties broken by ascending name.
    pub fn sorted_chromosomes(&self) -> &[String] {
        &self.ordered
    }

    /// True iff `a` outranks `b`: larger, or equal size and `a < b`.
    pub fn is_chrom_ahead(&self, a: &str, b: &str) -> Result<bool> {
        let sa = self.size(a)?;
        let sb = self.size(b)?;
        Ok(sa > sb || (sa == sb && a < b))
    }

    /// Canonical (row, col) orientation of an unordered pair: the
    /// outranked chromosome is the row.
    pub fn canonical_orientation<'a>(&self, a: &'a str, b: &'a str) -> Result<(&'a str, &'a str)> {
        if self.is_chrom_ahead(a, b)? {
            Ok((b, a))
        } else {
            Ok((a, b))
        }
    }
}
