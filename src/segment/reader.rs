//! Read-only access to a published segment.
//!
//! The data file is memory-mapped once and shared by every field; graph and PQ
//! regions are parsed in place. Searches take `&self` and need no locking.

use super::{data_path, meta_path};
use crate::codec::format::{verify_file, DATA_MAGIC};
use crate::codec::{read_meta, FieldInfo, FieldMetadata, OnDiskGraph, OrdToDocMap, SharedBytes};
use crate::config::SearchParams;
use crate::error::{IndexError, Result};
use crate::graph::{FilterPredicate, GraphSearcher, GraphView, SearchResult};
use crate::pq::PqVectors;
use crate::store::VectorValues;
use memmap2::Mmap;
use std::borrow::Cow;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One field of an open segment.
pub struct FieldReader {
    meta: FieldMetadata,
    graph: Arc<OnDiskGraph>,
    pq: Option<Arc<PqVectors>>,
}

impl FieldReader {
    fn open(bytes: &SharedBytes, meta: FieldMetadata) -> Result<Self> {
        let to_usize = |v: u64| {
            usize::try_from(v).map_err(|_| IndexError::format(format!("region offset {v} overflows")))
        };
        let graph = OnDiskGraph::load(
            bytes.clone(),
            to_usize(meta.graph_offset)?,
            to_usize(meta.graph_length)?,
        )?;
        if graph.dimension() != meta.info.dimension {
            return Err(IndexError::format(format!(
                "field {:?}: graph dimension {} differs from field dimension {}",
                meta.info.name,
                graph.dimension(),
                meta.info.dimension
            )));
        }
        if meta.doc_map.len() != graph.id_upper_bound() {
            return Err(IndexError::integrity(format!(
                "field {:?}: ordinal map has {} slots, graph has {}",
                meta.info.name,
                meta.doc_map.len(),
                graph.id_upper_bound()
            )));
        }

        let pq = if meta.has_pq() {
            let start = to_usize(meta.pq_offset)?;
            let end = start
                .checked_add(to_usize(meta.pq_length)?)
                .ok_or_else(|| IndexError::format("PQ region overflows"))?;
            let region = (**bytes)
                .as_ref()
                .get(start..end)
                .ok_or_else(|| IndexError::format("PQ region lies outside the data file"))?;
            let pq = PqVectors::read(region)?;
            if pq.len() != graph.id_upper_bound() || pq.quantizer().dimension() != meta.info.dimension {
                return Err(IndexError::integrity(format!(
                    "field {:?}: PQ region does not cover the graph",
                    meta.info.name
                )));
            }
            Some(Arc::new(pq))
        } else {
            None
        };

        Ok(Self {
            meta,
            graph: Arc::new(graph),
            pq,
        })
    }

    pub fn info(&self) -> &FieldInfo {
        &self.meta.info
    }

    pub fn metadata(&self) -> &FieldMetadata {
        &self.meta
    }

    pub fn graph(&self) -> &Arc<OnDiskGraph> {
        &self.graph
    }

    /// Full-precision vectors, addressed by ordinal.
    pub fn vectors(&self) -> Arc<dyn VectorValues> {
        self.graph.clone()
    }

    pub fn pq(&self) -> Option<&Arc<PqVectors>> {
        self.pq.as_ref()
    }

    pub fn doc_map(&self) -> &OrdToDocMap {
        &self.meta.doc_map
    }

    /// Number of live vectors.
    pub fn live_count(&self) -> usize {
        self.graph.size()
    }

    pub fn external_id(&self, ord: u32) -> Option<u32> {
        self.meta.doc_map.external_id(ord)
    }

    pub fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        self.graph.vector(ord)
    }

    /// Top-`k` ordinals for `query`.
    ///
    /// Quantized fields are traversed with PQ scores and the candidates are
    /// reranked against the stored vectors; other fields are scored exactly.
    pub fn search<F>(&self, query: &[f32], params: &SearchParams, filter: &F) -> Result<SearchResult>
    where
        F: FilterPredicate + ?Sized,
    {
        let dimension = self.meta.info.dimension;
        if query.len() != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }
        let similarity = self.meta.info.similarity;
        let graph = self.graph.as_ref();
        let exact = |node: u32| -> Result<f32> { Ok(similarity.score(query, &graph.vector(node)?)) };
        let searcher = GraphSearcher::new(graph);
        match &self.pq {
            Some(pq) => {
                let approximate = pq.scorer(query, similarity)?;
                searcher.search(|node| approximate.score(node), Some(&exact), params, filter)
            }
            None => searcher.search(exact, None, params, filter),
        }
    }
}

impl std::fmt::Debug for FieldReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldReader")
            .field("info", &self.meta.info)
            .field("graph", &self.graph)
            .field("pq", &self.pq.is_some())
            .finish()
    }
}

/// An open, published segment.
#[derive(Debug)]
pub struct SegmentReader {
    name: String,
    fields: Vec<FieldReader>,
}

impl SegmentReader {
    /// Open `{name}.meta-segann` and map `{name}.data-segann` from `dir`.
    ///
    /// Both files' checksums are verified before any region is parsed.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = std::fs::read(meta_path(dir, name))?;
        let fields = read_meta(&meta)?;

        let file = File::open(data_path(dir, name))?;
        // SAFETY: published segment files are never modified in place.
        let mmap = unsafe { Mmap::map(&file)? };
        verify_file(&mmap, DATA_MAGIC, "data")?;
        let bytes: SharedBytes = Arc::new(mmap);

        let fields = fields
            .into_iter()
            .map(|meta| FieldReader::open(&bytes, meta))
            .collect::<Result<Vec<_>>>()?;
        debug!(segment = name, fields = fields.len(), "opened segment");
        Ok(Self {
            name: name.to_owned(),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldReader] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldReader> {
        self.fields.iter().find(|f| f.meta.info.name == name)
    }

    fn require_field(&self, name: &str) -> Result<&FieldReader> {
        self.field(name).ok_or_else(|| {
            IndexError::config(format!("segment {} has no field {name:?}", self.name))
        })
    }

    /// Search one field. See [`FieldReader::search`].
    pub fn search<F>(&self, field: &str, query: &[f32], params: &SearchParams, filter: &F) -> Result<SearchResult>
    where
        F: FilterPredicate + ?Sized,
    {
        self.require_field(field)?.search(query, params, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldInfo;
    use crate::config::{IndexConfig, VectorPlacement};
    use crate::graph::{FnFilter, NoFilter};
    use crate::pool::BuildPools;
    use crate::segment::SegmentWriter;
    use crate::similarity::Similarity;

    fn write_line(dir: &Path, name: &str, placement: VectorPlacement) {
        let mut config = IndexConfig::default();
        config.graph.max_degree = 6;
        config.graph.vector_placement = placement;
        let mut w = SegmentWriter::new(dir, name, config, BuildPools::new(2, 1).unwrap()).unwrap();
        let field = w.add_field(FieldInfo::new("v", 0, 2, Similarity::Euclidean)).unwrap();
        for i in 0..50u32 {
            field.add(1000 + i, &[i as f32, 0.0]).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn search_maps_back_to_external_ids() {
        let dir = tempfile::tempdir().unwrap();
        write_line(dir.path(), "seg", VectorPlacement::Separated);
        let reader = SegmentReader::open(dir.path(), "seg").unwrap();
        let field = reader.field("v").unwrap();
        assert_eq!(field.live_count(), 50);
        assert_eq!(field.vector(7).unwrap().to_vec(), vec![7.0, 0.0]);

        let result = reader
            .search("v", &[20.2, 0.0], &SearchParams::new(3), &NoFilter)
            .unwrap();
        let ids: Vec<u32> = result
            .nodes
            .iter()
            .map(|n| field.external_id(n.node).unwrap())
            .collect();
        assert_eq!(ids, vec![1020, 1021, 1019]);
        assert!(result.visited >= 3);
    }

    #[test]
    fn filter_and_unknown_field() {
        let dir = tempfile::tempdir().unwrap();
        write_line(dir.path(), "seg", VectorPlacement::Inline);
        let reader = SegmentReader::open(dir.path(), "seg").unwrap();
        let even = FnFilter(|n: u32| n % 2 == 0);
        let result = reader
            .search("v", &[21.0, 0.0], &SearchParams::new(2), &even)
            .unwrap();
        assert_eq!(
            result.nodes.iter().map(|n| n.node).collect::<Vec<_>>(),
            vec![20, 22]
        );
        assert!(reader
            .search("missing", &[0.0, 0.0], &SearchParams::new(1), &NoFilter)
            .unwrap_err()
            .is_configuration());
        assert!(matches!(
            reader.search("v", &[0.0], &SearchParams::new(1), &NoFilter),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_data_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_line(dir.path(), "seg", VectorPlacement::Inline);
        let path = data_path(dir.path(), "seg");
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            SegmentReader::open(dir.path(), "seg"),
            Err(IndexError::ChecksumMismatch { .. })
        ));
    }
}
