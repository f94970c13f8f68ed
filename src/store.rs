//! Ordinal-addressed vector storage.
//!
//! [`VectorValues`] is the random-access view everything else reads from: the
//! graph builder, the quantizer and the codec writer. Three implementations:
//!
//! - [`VectorStore`]: append-only in-memory store that backs a segment under construction.
//! - [`MergedVectorValues`]: one ordinal space over several sources, with reads
//!   serialized per source.
//! - [`MappedVectorValues`]: re-addresses another view through an ordinal table.

use crate::error::{IndexError, Result};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;

/// Random access to vectors by ordinal.
pub trait VectorValues: Send + Sync {
    /// Dimension of every vector.
    fn dimension(&self) -> usize;

    /// Number of addressable ordinals (`[0, size)`).
    fn size(&self) -> usize;

    /// Vector at `ord`.
    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>>;
}

impl<T: VectorValues + ?Sized> VectorValues for Arc<T> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        (**self).vector(ord)
    }
}

/// Append-only vector storage (structure of arrays).
#[derive(Debug, Clone)]
pub struct VectorStore {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            data: Vec::with_capacity(dimension * capacity),
        }
    }

    /// Append a vector and return its ordinal.
    pub fn add(&mut self, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let ord = self.len();
        if ord >= i32::MAX as usize {
            return Err(IndexError::Capacity {
                required: ord as u64 + 1,
                limit: i32::MAX as u64,
            });
        }
        self.data.extend_from_slice(vector);
        Ok(ord as u32)
    }

    /// Borrow the vector at `ord`.
    #[inline]
    pub fn get(&self, ord: u32) -> Option<&[f32]> {
        let start = ord as usize * self.dimension;
        self.data.get(start..start + self.dimension)
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat `len * dimension` buffer.
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }
}

impl VectorValues for VectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        self.get(ord)
            .map(Cow::Borrowed)
            .ok_or_else(|| out_of_bounds(ord, self.len()))
    }
}

struct Source {
    values: Arc<dyn VectorValues>,
    // A source backed by a positional reader is not safe for concurrent reads.
    lock: Mutex<()>,
}

/// Concatenation of several sources into one ordinal space.
///
/// Ordinal `base[i] + local` addresses vector `local` of source `i`. Every read
/// takes that source's lock and returns an owned copy.
pub struct MergedVectorValues {
    sources: Vec<Source>,
    bases: Vec<u32>,
    dimension: usize,
    size: usize,
}

impl MergedVectorValues {
    pub fn new(sources: Vec<Arc<dyn VectorValues>>) -> Result<Self> {
        let dimension = sources.first().map(|s| s.dimension()).unwrap_or(0);
        let mut bases = Vec::with_capacity(sources.len());
        let mut size = 0usize;
        for source in &sources {
            if source.dimension() != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: source.dimension(),
                });
            }
            bases.push(size as u32);
            size += source.size();
            if size > i32::MAX as usize {
                return Err(IndexError::Capacity {
                    required: size as u64,
                    limit: i32::MAX as u64,
                });
            }
        }
        Ok(Self {
            sources: sources
                .into_iter()
                .map(|values| Source {
                    values,
                    lock: Mutex::new(()),
                })
                .collect(),
            bases,
            dimension,
            size,
        })
    }

    /// First ordinal of each source.
    pub fn bases(&self) -> &[u32] {
        &self.bases
    }

    /// Split an ordinal into `(source, local ordinal)`.
    pub fn locate(&self, ord: u32) -> Result<(usize, u32)> {
        if ord as usize >= self.size {
            return Err(out_of_bounds(ord, self.size));
        }
        // partition_point gives the first base > ord; the owning source is the one before.
        let source = self.bases.partition_point(|&b| b <= ord) - 1;
        Ok((source, ord - self.bases[source]))
    }
}

impl VectorValues for MergedVectorValues {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn size(&self) -> usize {
        self.size
    }

    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        let (idx, local) = self.locate(ord)?;
        let source = &self.sources[idx];
        let _guard = source.lock.lock();
        let v = source.values.vector(local)?.into_owned();
        Ok(Cow::Owned(v))
    }
}

/// Marker for ordinals without a backing vector in [`MappedVectorValues`].
pub const NO_ORDINAL: u32 = u32::MAX;

/// View of `inner` addressed through `ords[new] = inner ordinal`.
pub struct MappedVectorValues {
    inner: Arc<dyn VectorValues>,
    ords: Arc<[u32]>,
}

impl MappedVectorValues {
    pub fn new(inner: Arc<dyn VectorValues>, ords: Arc<[u32]>) -> Self {
        Self { inner, ords }
    }
}

impl VectorValues for MappedVectorValues {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn size(&self) -> usize {
        self.ords.len()
    }

    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        match self.ords.get(ord as usize) {
            Some(&inner) if inner != NO_ORDINAL => self.inner.vector(inner),
            Some(_) => Err(IndexError::integrity(format!(
                "ordinal {ord} has no backing vector"
            ))),
            None => Err(out_of_bounds(ord, self.ords.len())),
        }
    }
}

fn out_of_bounds(ord: u32, size: usize) -> IndexError {
    IndexError::integrity(format!("ordinal {ord} out of bounds (size {size})"))
}
