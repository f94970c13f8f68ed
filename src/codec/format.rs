//! Low-level format constants and little-endian I/O helpers.
//!
//! # File layout
//!
//! ```text
//! {segment}.meta-segann                 {segment}.data-segann
//! ┌──────────────────────────┐          ┌──────────────────────────┐
//! │ magic (4B) "SGMT"        │          │ magic (4B) "SGDT"        │
//! │ version (4B)             │          │ version (4B)             │
//! ├──────────────────────────┤          ├──────────────────────────┤
//! │ field records ...        │          │ field 0 graph region     │
//! │ -1 end-of-fields marker  │          │ field 0 PQ region (opt.) │
//! ├──────────────────────────┤          │ field 1 graph region ... │
//! │ footer: magic, CRC32     │          ├──────────────────────────┤
//! └──────────────────────────┘          │ footer: magic, CRC32     │
//!                                       └──────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian.

use crate::error::{IndexError, Result};
use std::io::{self, Write};

/// Magic bytes of the metadata file.
pub const META_MAGIC: [u8; 4] = *b"SGMT";
/// Magic bytes of the data file.
pub const DATA_MAGIC: [u8; 4] = *b"SGDT";
/// Magic bytes opening every graph region.
pub const GRAPH_MAGIC: u32 = 0x5347_4752; // "SGGR"
/// Magic bytes opening every PQ region.
pub const PQ_MAGIC: u32 = 0x5347_5051; // "SGPQ"
/// Magic bytes of file footers.
pub const FOOTER_MAGIC: [u8; 4] = *b"SGFT";

pub const VERSION_START: u32 = 0;
pub const VERSION_CURRENT: u32 = VERSION_START;

/// Metadata file extension.
pub const META_EXTENSION: &str = "meta-segann";
/// Data file extension.
pub const DATA_EXTENSION: &str = "data-segann";

/// Footer size: magic + CRC32.
pub const FOOTER_LEN: usize = 8;

/// Sentinel for omitted ordinals and neighbor padding.
pub const NO_NODE: i32 = -1;

/// `Write` adapter that tracks the byte position and a running CRC32.
pub struct TrackingWriter<W: Write> {
    inner: W,
    position: u64,
    hasher: crc32fast::Hasher,
}

impl<W: Write> TrackingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            position: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the footer (magic + CRC32 of everything before it) and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_all(&FOOTER_MAGIC)?;
        let crc = self.hasher.clone().finalize();
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for TrackingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Little-endian primitive writes.
pub trait WriteLe: Write {
    fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_i32_le(&mut self, v: i32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u64_le(&mut self, v: u64) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_f32_le(&mut self, v: f32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_f32s_le(&mut self, values: &[f32]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.write_all(&buf)
    }

    /// Zero bytes, used for omitted fixed-size payloads.
    fn write_zeros(&mut self, len: usize) -> io::Result<()> {
        const ZEROS: [u8; 256] = [0; 256];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            self.write_all(&ZEROS[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteLe for W {}

/// Cursor over a byte slice (usually a mapped region).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                IndexError::format(format!(
                    "truncated region: need {len} bytes at offset {}, {} available",
                    self.pos,
                    self.remaining()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f32s(&mut self, count: usize) -> Result<Vec<f32>> {
        let bytes = self.read_bytes(count * 4)?;
        Ok(decode_f32s(bytes))
    }

    /// Non-negative count stored as `u32`, bounded to guard against corrupt input.
    pub fn read_len(&mut self, what: &str, max: usize) -> Result<usize> {
        let v = self.read_u32()? as usize;
        if v > max {
            return Err(IndexError::format(format!(
                "{what} {v} exceeds limit {max}"
            )));
        }
        Ok(v)
    }
}

/// Decode little-endian `f32`s.
pub fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Read a little-endian `i32` at `offset` without bounds-checked cursors.
#[inline]
pub fn i32_at(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Check a file's magic/version header and footer checksum; returns the body
/// between header and footer.
pub fn verify_file<'a>(bytes: &'a [u8], magic: [u8; 4], what: &str) -> Result<&'a [u8]> {
    if bytes.len() < 8 + FOOTER_LEN {
        return Err(IndexError::format(format!("{what} file is truncated")));
    }
    if bytes[..4] != magic {
        return Err(IndexError::format(format!("{what} file has invalid magic")));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    check_version(version, what)?;

    let footer_start = bytes.len() - FOOTER_LEN;
    if bytes[footer_start..footer_start + 4] != FOOTER_MAGIC {
        return Err(IndexError::format(format!("{what} file has invalid footer")));
    }
    let expected = u32::from_le_bytes([
        bytes[footer_start + 4],
        bytes[footer_start + 5],
        bytes[footer_start + 6],
        bytes[footer_start + 7],
    ]);
    // The checksum covers the footer magic as well.
    let actual = crc32fast::hash(&bytes[..footer_start + 4]);
    if expected != actual {
        return Err(IndexError::ChecksumMismatch { expected, actual });
    }
    Ok(&bytes[8..footer_start])
}

/// Reject versions this reader does not understand.
pub fn check_version(version: u32, what: &str) -> Result<()> {
    if !(VERSION_START..=VERSION_CURRENT).contains(&version) {
        return Err(IndexError::Unsupported(format!(
            "{what} format version {version} (supported {VERSION_START}..={VERSION_CURRENT})"
        )));
    }
    Ok(())
}

/// Write a file header.
pub fn write_header<W: Write>(w: &mut W, magic: [u8; 4]) -> io::Result<()> {
    w.write_all(&magic)?;
    w.write_u32_le(VERSION_CURRENT)
}
