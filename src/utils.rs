//! Small shared parsers: resolution strings and genomic region queries.

use anyhow::{anyhow, Result};

/// Parse a resolution string: a decimal number with an optional
/// case-insensitive `k` (x1000) or `m` (x1000000) suffix. The product
/// must be a positive integer, so `"5000"`, `"5k"` and `"0.005m"` agree.
pub fn parse_resolution(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty resolution"));
    }

    let (prefix, multiplier) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[..s.len() - 1], 1_000f64),
        'm' | 'M' => (&s[..s.len() - 1], 1_000_000f64),
        _ => (s, 1f64),
    };

    let value: f64 = prefix
        .parse()
        .map_err(|_| anyhow!("invalid resolution {:?}", s))?;
    let bp = value * multiplier;
    if !bp.is_finite() || bp < 1.0 || bp > u32::MAX as f64 || bp.fract() != 0.0 {
        return Err(anyhow!(
            "resolution {:?} must be a positive whole number of base pairs",
            s
        ));
    }
    Ok(bp as u32)
}

/// One side of a query: a chromosome with an optional inclusive span.
/// The span is in base pairs or bin indices depending on the query mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub chrom: String,
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl Region {
    /// Accept `CHR` or `CHR:START-END` (also `START..END`).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("empty region"));
        }
        let Some((chrom, span)) = s.split_once(':') else {
            return Ok(Region { chrom: s.to_string(), start: None, end: None });
        };
        if chrom.is_empty() {
            return Err(anyhow!("region {:?} has no chromosome", s));
        }
        let (start, end) = parse_span(span)?;
        if start > end {
            return Err(anyhow!("region {:?}: start exceeds end", s));
        }
        Ok(Region { chrom: chrom.to_string(), start: Some(start), end: Some(end) })
    }
}

fn parse_span(span: &str) -> Result<(u32, u32)> {
    let (a, b) = if let Some((a, b)) = span.split_once("..") {
        (a, b)
    } else if let Some((a, b)) = span.split_once('-') {
        (a, b)
    } else {
        return Err(anyhow!("invalid span {:?}: expected START-END", span));
    };
    let start: u32 = a.trim().parse().map_err(|_| anyhow!("invalid span start {:?}", a))?;
    let end: u32 = b.trim().parse().map_err(|_| anyhow!("invalid span end {:?}", b))?;
    Ok((start, end))
}

/// A full query: one region, or two separated by a comma for a
/// chromosome-pair request.
pub fn parse_query(s: &str) -> Result<(Region, Option<Region>)> {
    match s.split_once(',') {
        None => Ok((Region::parse(s)?, None)),
        Some((a, b)) => Ok((Region::parse(a)?, Some(Region::parse(b)?))),
    }
}
