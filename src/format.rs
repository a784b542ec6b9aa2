//! BUTLR wire-level constants and fixed-width little-endian primitives.

use anyhow::{anyhow, Result};
use std::io::{Read, Write};

/// Byte positions of the patched header fields.
pub const HEADER_SIZE_POS: u64 = 0;
pub const INTRA_DIR_POS: u64 = 20;
pub const INTER_DIR_POS: u64 = 24;

/// The version string occupies exactly this many bytes, NUL-padded.
pub const VERSION_FIELD_LEN: usize = 16;

/// Reserved u32 slots after the MCV field, written as zeros.
pub const RESERVED_FIELDS: usize = 4;

/// One sparse cell on disk: colBin:u32 + value:f32.
pub const CELL_BYTES: u64 = 8;

/// One row-offset table entry.
pub const OFFSET_BYTES: u64 = 8;

/// Format version stamped by this writer.
pub const FORMAT_VERSION: &str = "1.3";

// ----------------- low-level readers -----------------

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> { let mut b=[0u8;4]; r.read_exact(&mut b)?; Ok(u32::from_le_bytes(b)) }
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> { let mut b=[0u8;8]; r.read_exact(&mut b)?; Ok(u64::from_le_bytes(b)) }
pub fn read_f32<R: Read>(r: &mut R) -> Result<f32> { let mut b=[0u8;4]; r.read_exact(&mut b)?; Ok(f32::from_le_bytes(b)) }

/// Read bytes up to a 0x00 terminator and decode as ASCII.
pub fn read_cstring<R: Read>(r: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == 0 { break; }
        buf.push(byte[0]);
    }
    if !buf.is_ascii() {
        return Err(anyhow!("non-ASCII bytes in string field"));
    }
    String::from_utf8(buf).map_err(|_| anyhow!("invalid string field"))
}

// ----------------- low-level writers -----------------

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> { w.write_all(&v.to_le_bytes())?; Ok(()) }
pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> { w.write_all(&v.to_le_bytes())?; Ok(()) }
pub fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> { w.write_all(&v.to_le_bytes())?; Ok(()) }

/// Write an ASCII string with a single 0x00 terminator.
pub fn write_cstring<W: Write>(w: &mut W, s: &str) -> Result<()> {
    if !s.is_ascii() || s.as_bytes().contains(&0) {
        return Err(anyhow!("string field must be ASCII without NUL: {:?}", s));
    }
    w.write_all(s.as_bytes())?;
    w.write_all(&[0u8])?;
    Ok(())
}

/// Write the version string NUL-terminated and zero-padded to 16 bytes.
pub fn write_version_field<W: Write>(w: &mut W, version: &str) -> Result<()> {
    let bytes = version.as_bytes();
    if !version.is_ascii() || bytes.contains(&0) {
        return Err(anyhow!("version must be ASCII without NUL: {:?}", version));
    }
    if bytes.len() >= VERSION_FIELD_LEN {
        return Err(anyhow!(
            "version {:?} does not fit the {}-byte header field",
            version,
            VERSION_FIELD_LEN
        ));
    }
    w.write_all(bytes)?;
    w.write_all(&vec![0u8; VERSION_FIELD_LEN - bytes.len()])?;
    Ok(())
}

/// Decode the fixed-width version field back to a string.
pub fn parse_version_field(raw: &[u8; VERSION_FIELD_LEN]) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(VERSION_FIELD_LEN);
    let s = &raw[..end];
    if !s.is_ascii() {
        return Err(anyhow!("non-ASCII version field"));
    }
    Ok(String::from_utf8_lossy(s).into_owned())
}
