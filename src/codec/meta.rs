//! Per-field metadata records of the `.meta-segann` file.

use super::doc_map::OrdToDocMap;
use super::format::{verify_file, write_header, ByteReader, TrackingWriter, WriteLe, META_MAGIC};
use crate::config::MAX_DIMENSIONS;
use crate::error::{IndexError, Result};
use crate::similarity::Similarity;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Marks the end of the field records.
const END_OF_FIELDS: i32 = -1;
/// Upper bound on a field name, in bytes.
const MAX_FIELD_NAME_LEN: usize = 4096;

/// Element type of a vector field. Only `Float32` can be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorEncoding {
    #[default]
    Float32 = 0,
    Byte = 1,
}

impl VectorEncoding {
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    pub fn from_ordinal(ord: u32) -> Result<Self> {
        match ord {
            0 => Ok(Self::Float32),
            1 => Ok(Self::Byte),
            other => Err(IndexError::format(format!("unknown vector encoding {other}"))),
        }
    }
}

/// Schema of one vector field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    /// Field number, unique within a segment and `>= 0`.
    pub number: i32,
    pub dimension: usize,
    pub similarity: Similarity,
    pub encoding: VectorEncoding,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, number: i32, dimension: usize, similarity: Similarity) -> Self {
        Self {
            name: name.into(),
            number,
            dimension,
            similarity,
            encoding: VectorEncoding::Float32,
        }
    }

    /// Reject fields this format cannot index.
    pub fn validate(&self) -> Result<()> {
        if self.encoding != VectorEncoding::Float32 {
            return Err(IndexError::Unsupported(format!(
                "field {:?}: {:?} vectors cannot be indexed",
                self.name, self.encoding
            )));
        }
        if self.dimension == 0 || self.dimension > MAX_DIMENSIONS {
            return Err(IndexError::config(format!(
                "field {:?}: dimension must be in 1..={MAX_DIMENSIONS}, got {}",
                self.name, self.dimension
            )));
        }
        if self.number < 0 {
            return Err(IndexError::config(format!(
                "field {:?}: field number must be >= 0, got {}",
                self.name, self.number
            )));
        }
        if self.name.is_empty() || self.name.len() > MAX_FIELD_NAME_LEN {
            return Err(IndexError::config(format!(
                "field name must be 1..={MAX_FIELD_NAME_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Where a field's regions live in the data file, plus its ordinal map.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMetadata {
    pub info: FieldInfo,
    /// Offset of the graph region from the start of the data file.
    pub graph_offset: u64,
    pub graph_length: u64,
    /// Zero length when the field is not quantized.
    pub pq_offset: u64,
    pub pq_length: u64,
    pub neighbor_overflow: f32,
    pub doc_map: OrdToDocMap,
}

impl FieldMetadata {
    pub fn has_pq(&self) -> bool {
        self.pq_length > 0
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let name = self.info.name.as_bytes();
        w.write_i32_le(self.info.number)?;
        w.write_u32_le(name.len() as u32)?;
        w.write_all(name)?;
        w.write_u32_le(self.info.encoding.ordinal())?;
        w.write_i32_le(self.info.similarity.ordinal())?;
        w.write_u32_le(self.info.dimension as u32)?;
        w.write_u64_le(self.graph_offset)?;
        w.write_u64_le(self.graph_length)?;
        w.write_u64_le(self.pq_offset)?;
        w.write_u64_le(self.pq_length)?;
        w.write_f32_le(self.neighbor_overflow)?;
        self.doc_map.write(w)
    }

    fn read(number: i32, r: &mut ByteReader<'_>) -> Result<Self> {
        let name_len = r.read_len("field name length", MAX_FIELD_NAME_LEN)?;
        let name = std::str::from_utf8(r.read_bytes(name_len)?)
            .map_err(|e| IndexError::format(format!("field name is not UTF-8: {e}")))?
            .to_owned();
        let encoding = VectorEncoding::from_ordinal(r.read_u32()?)?;
        let similarity = Similarity::from_ordinal(r.read_i32()?)?;
        let dimension = r.read_len("dimension", MAX_DIMENSIONS)?;
        let graph_offset = r.read_u64()?;
        let graph_length = r.read_u64()?;
        let pq_offset = r.read_u64()?;
        let pq_length = r.read_u64()?;
        let neighbor_overflow = r.read_f32()?;
        let doc_map = OrdToDocMap::read(r)?;
        Ok(Self {
            info: FieldInfo {
                name,
                number,
                dimension,
                similarity,
                encoding,
            },
            graph_offset,
            graph_length,
            pq_offset,
            pq_length,
            neighbor_overflow,
            doc_map,
        })
    }
}

/// Write a complete metadata file (header, records, end marker, footer).
pub fn write_meta<W: Write>(w: W, fields: &[FieldMetadata]) -> Result<W> {
    let mut w = TrackingWriter::new(w);
    write_header(&mut w, META_MAGIC)?;
    for field in fields {
        field.write(&mut w)?;
    }
    w.write_i32_le(END_OF_FIELDS)?;
    Ok(w.finish()?)
}

/// Parse a metadata file, verifying its checksum first.
pub fn read_meta(bytes: &[u8]) -> Result<Vec<FieldMetadata>> {
    let body = verify_file(bytes, META_MAGIC, "metadata")?;
    let mut r = ByteReader::new(body);
    let mut fields: Vec<FieldMetadata> = Vec::new();
    loop {
        let number = r.read_i32()?;
        if number == END_OF_FIELDS {
            break;
        }
        if number < 0 {
            return Err(IndexError::format(format!("invalid field number {number}")));
        }
        let field = FieldMetadata::read(number, &mut r)?;
        if fields
            .iter()
            .any(|f| f.info.number == number || f.info.name == field.info.name)
        {
            return Err(IndexError::format(format!(
                "field {:?} ({number}) appears twice",
                field.info.name
            )));
        }
        fields.push(field);
    }
    if r.remaining() != 0 {
        return Err(IndexError::format(format!(
            "{} trailing bytes after the field records",
            r.remaining()
        )));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, number: i32) -> FieldMetadata {
        FieldMetadata {
            info: FieldInfo::new(name, number, 16, Similarity::Cosine),
            graph_offset: 8,
            graph_length: 1234,
            pq_offset: 0,
            pq_length: 0,
            neighbor_overflow: 1.2,
            doc_map: OrdToDocMap::new(vec![4, -1, 0]).unwrap(),
        }
    }

    #[test]
    fn records_round_trip() {
        let mut quantized = field("body", 3);
        quantized.pq_offset = 1242;
        quantized.pq_length = 99;
        let fields = vec![field("title", 0), quantized];
        let bytes = write_meta(Vec::new(), &fields).unwrap();
        let read = read_meta(&bytes).unwrap();
        assert_eq!(read, fields);
        assert!(!read[0].has_pq());
        assert!(read[1].has_pq());
    }

    #[test]
    fn empty_segment_has_only_end_marker() {
        let bytes = write_meta(Vec::new(), &[]).unwrap();
        assert!(read_meta(&bytes).unwrap().is_empty());
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = write_meta(Vec::new(), &[field("title", 0)]).unwrap();
        bytes[14] ^= 0x01;
        assert!(matches!(
            read_meta(&bytes),
            Err(IndexError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_fields_rejected() {
        let bytes = write_meta(Vec::new(), &[field("a", 0), field("a", 1)]).unwrap();
        assert!(matches!(read_meta(&bytes), Err(IndexError::Format(_))));
    }

    #[test]
    fn byte_encoding_is_unsupported() {
        let mut info = FieldInfo::new("img", 0, 8, Similarity::Euclidean);
        info.validate().unwrap();
        info.encoding = VectorEncoding::Byte;
        assert!(matches!(info.validate(), Err(IndexError::Unsupported(_))));
        info.encoding = VectorEncoding::Float32;
        info.dimension = MAX_DIMENSIONS + 1;
        assert!(info.validate().unwrap_err().is_configuration());
    }
}
