//! Encoded vector set: one codebook plus one code per ordinal.

use super::{AdcTable, ProductQuantizer};
use crate::codec::format::{ByteReader, WriteLe, PQ_MAGIC};
use crate::config::{MAX_DIMENSIONS, MAX_PQ_CENTROIDS};
use crate::error::{IndexError, Result};
use crate::similarity::Similarity;
use crate::store::VectorValues;
use rayon::prelude::*;
use std::io::Write;

/// PQ codes for ordinals `[0, count)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PqVectors {
    pq: ProductQuantizer,
    codes: Vec<u8>,
    count: usize,
}

impl PqVectors {
    /// Encode `count` vectors; code `i` encodes `vectors.vector(ords[i])`.
    ///
    /// Runs on the caller's installed rayon pool.
    pub fn encode_all(pq: ProductQuantizer, vectors: &dyn VectorValues, ords: &[u32]) -> Result<Self> {
        let m = pq.subspaces();
        let mut codes = vec![0u8; ords.len() * m];
        codes
            .par_chunks_exact_mut(m)
            .zip(ords.par_iter())
            .try_for_each(|(code, &ord)| pq.encode_into(&vectors.vector(ord)?, code))?;
        Ok(Self {
            pq,
            count: ords.len(),
            codes,
        })
    }

    pub fn quantizer(&self) -> &ProductQuantizer {
        &self.pq
    }

    pub fn into_quantizer(self) -> ProductQuantizer {
        self.pq
    }

    /// Number of encoded ordinals.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Code of `ord`.
    #[inline]
    pub fn code(&self, ord: u32) -> Result<&[u8]> {
        let m = self.pq.subspaces();
        let start = ord as usize * m;
        self.codes.get(start..start + m).ok_or_else(|| {
            IndexError::integrity(format!(
                "PQ ordinal {ord} out of bounds (count {})",
                self.count
            ))
        })
    }

    /// Approximate scorer for a query.
    pub fn scorer(&self, query: &[f32], similarity: Similarity) -> Result<PqScorer<'_>> {
        Ok(PqScorer {
            table: self.pq.score_table(query, similarity)?,
            vectors: self,
        })
    }

    /// Uncompressed size in bytes.
    pub fn original_size(&self) -> usize {
        self.count * self.pq.dimension() * std::mem::size_of::<f32>()
    }

    /// Compressed size in bytes (codes only).
    pub fn compressed_size(&self) -> usize {
        self.codes.len()
    }

    /// Serialize as a PQ region.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let pq = &self.pq;
        w.write_u32_le(PQ_MAGIC)?;
        w.write_u32_le(pq.dimension() as u32)?;
        w.write_u32_le(pq.subspaces() as u32)?;
        w.write_u32_le(pq.centroids_per_subspace() as u32)?;
        match pq.global_centroid() {
            Some(mean) => {
                w.write_u32_le(1)?;
                w.write_f32s_le(mean)?;
            }
            None => w.write_u32_le(0)?,
        }
        w.write_f32s_le(pq.codebooks())?;
        w.write_u32_le(self.count as u32)?;
        w.write_all(&self.codes)?;
        Ok(())
    }

    /// Parse a PQ region.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        if r.read_u32()? != PQ_MAGIC {
            return Err(IndexError::format("invalid PQ region magic"));
        }
        let dimension = r.read_len("PQ dimension", MAX_DIMENSIONS)?;
        let subspaces = r.read_len("PQ subspaces", MAX_DIMENSIONS)?;
        let k = r.read_len("PQ centroids", MAX_PQ_CENTROIDS)?;
        let global_centroid = match r.read_u32()? {
            0 => None,
            1 => Some(r.read_f32s(dimension)?),
            other => return Err(IndexError::format(format!("invalid centering flag {other}"))),
        };
        let codebooks = r.read_f32s(dimension * k)?;
        let pq = ProductQuantizer::from_parts(dimension, subspaces, k, codebooks, global_centroid)?;

        let count = r.read_len("PQ vector count", i32::MAX as usize)?;
        let codes = r.read_bytes(count * subspaces)?.to_vec();
        if codes.iter().any(|&c| c as usize >= k) {
            return Err(IndexError::format("PQ code references a missing centroid"));
        }
        Ok(Self { pq, codes, count })
    }
}

/// Query-bound approximate scorer over a [`PqVectors`].
pub struct PqScorer<'a> {
    table: AdcTable,
    vectors: &'a PqVectors,
}

impl PqScorer<'_> {
    #[inline]
    pub fn score(&self, ord: u32) -> Result<f32> {
        Ok(self.table.score(self.vectors.code(ord)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantizationConfig;
    use crate::store::VectorStore;

    fn store() -> VectorStore {
        let mut s = VectorStore::new(4);
        for i in 0..40 {
            let x = i as f32 / 40.0;
            s.add(&[x, 1.0 - x, x * x, 0.5]).unwrap();
        }
        s
    }

    #[test]
    fn encode_follows_ordinal_table() {
        let s = store();
        let pq = ProductQuantizer::train(&s, 2, 8, true, &QuantizationConfig::default()).unwrap();
        let ords = [39u32, 0, 20];
        let pqv = PqVectors::encode_all(pq.clone(), &s, &ords).unwrap();
        assert_eq!(pqv.len(), 3);
        assert_eq!(pqv.code(0).unwrap(), &pq.encode(s.get(39).unwrap()).unwrap()[..]);
        assert_eq!(pqv.code(2).unwrap(), &pq.encode(s.get(20).unwrap()).unwrap()[..]);
        assert!(pqv.code(3).is_err());
    }

    #[test]
    fn region_round_trip() {
        let s = store();
        let pq = ProductQuantizer::train(&s, 4, 16, true, &QuantizationConfig::default()).unwrap();
        let ords: Vec<u32> = (0..40).collect();
        let pqv = PqVectors::encode_all(pq, &s, &ords).unwrap();

        let mut buf = Vec::new();
        pqv.write(&mut buf).unwrap();
        let back = PqVectors::read(&buf).unwrap();
        assert_eq!(back, pqv);
        assert!(back.compressed_size() < back.original_size());
    }

    #[test]
    fn truncated_region_is_format_error() {
        let s = store();
        let pq = ProductQuantizer::train(&s, 2, 4, false, &QuantizationConfig::default()).unwrap();
        let pqv = PqVectors::encode_all(pq, &s, &[0, 1, 2]).unwrap();
        let mut buf = Vec::new();
        pqv.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(PqVectors::read(&buf), Err(IndexError::Format(_))));
    }
}
