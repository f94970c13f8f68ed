//! Ordinal to external id map persisted with every field.

use super::format::{ByteReader, WriteLe, NO_NODE};
use crate::error::{IndexError, Result};
use std::io::Write;

/// `ordinal -> external id`, with `-1` for ordinals that hold no vector, plus
/// the reverse lookup.
///
/// The reverse lookup holds one `(external id, ordinal)` pair per live
/// ordinal, sorted by external id, so its size follows the vector count no
/// matter how large the ids are.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrdToDocMap {
    ord_to_doc: Vec<i32>,
    doc_to_ord: Vec<(u32, u32)>,
}

impl OrdToDocMap {
    /// Build from the forward table. Every external id may appear once.
    pub fn new(ord_to_doc: Vec<i32>) -> Result<Self> {
        let mut doc_to_ord = Vec::with_capacity(ord_to_doc.len());
        for (ord, &doc) in ord_to_doc.iter().enumerate() {
            if doc == NO_NODE {
                continue;
            }
            if doc < 0 {
                return Err(IndexError::integrity(format!(
                    "ordinal {ord} maps to invalid external id {doc}"
                )));
            }
            doc_to_ord.push((doc as u32, ord as u32));
        }
        doc_to_ord.sort_unstable();
        if let Some(pair) = doc_to_ord.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(IndexError::integrity(format!(
                "external id {} is mapped by ordinals {} and {}",
                pair[0].0, pair[0].1, pair[1].1
            )));
        }
        Ok(Self {
            ord_to_doc,
            doc_to_ord,
        })
    }

    /// External id of `ord`, or `None` for a hole.
    pub fn external_id(&self, ord: u32) -> Option<u32> {
        match self.ord_to_doc.get(ord as usize) {
            Some(&doc) if doc >= 0 => Some(doc as u32),
            _ => None,
        }
    }

    /// Ordinal holding `external_id`.
    pub fn ordinal(&self, external_id: u32) -> Option<u32> {
        self.doc_to_ord
            .binary_search_by_key(&external_id, |&(doc, _)| doc)
            .ok()
            .map(|i| self.doc_to_ord[i].1)
    }

    /// Ordinals with an external id.
    pub fn live_count(&self) -> usize {
        self.doc_to_ord.len()
    }

    /// Ordinal slots, holes included.
    pub fn len(&self) -> usize {
        self.ord_to_doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ord_to_doc.is_empty()
    }

    /// Ordinals with an external id, ascending.
    pub fn live_ordinals(&self) -> impl Iterator<Item = u32> + '_ {
        self.ord_to_doc
            .iter()
            .enumerate()
            .filter(|&(_, &doc)| doc >= 0)
            .map(|(ord, _)| ord as u32)
    }

    /// Map every external id through `doc_map`; ids it drops become holes.
    pub fn remap<F>(&self, doc_map: F) -> Result<Self>
    where
        F: Fn(u32) -> Option<u32>,
    {
        let mut forward = Vec::with_capacity(self.ord_to_doc.len());
        for &doc in &self.ord_to_doc {
            let mapped = if doc >= 0 { doc_map(doc as u32) } else { None };
            forward.push(match mapped {
                Some(d) => i32::try_from(d).map_err(|_| {
                    IndexError::integrity(format!("external id {d} exceeds the format limit"))
                })?,
                None => NO_NODE,
            });
        }
        Self::new(forward)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.ord_to_doc.len() as u32)?;
        for &doc in &self.ord_to_doc {
            w.write_i32_le(doc)?;
        }
        Ok(())
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let len = r.read_len("ordinal map length", i32::MAX as usize)?;
        let bytes = r.read_bytes(len * 4)?;
        let forward = bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(forward).map_err(|e| IndexError::format(format!("corrupt ordinal map: {e}")))
    }
}
