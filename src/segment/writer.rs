//! Flush path: accumulate `(external id, vector)` pairs per field, then build
//! and persist every field's graph.

use super::{PersistedField, SegmentFiles};
use crate::codec::{FieldInfo, FieldMetadata, IdentityMapper, OrdToDocMap};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::graph::{GraphBuilder, ScoreProvider};
use crate::pool::BuildPools;
use crate::pq::{PqVectors, ProductQuantizer};
use crate::store::VectorStore;
use roaring::RoaringBitmap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Vectors of one field of a segment under construction.
#[derive(Debug)]
pub struct FieldWriter {
    info: FieldInfo,
    vectors: VectorStore,
    /// `external_ids[ord]`
    external_ids: Vec<i32>,
    seen: RoaringBitmap,
}

impl FieldWriter {
    fn new(info: FieldInfo) -> Self {
        Self {
            vectors: VectorStore::new(info.dimension),
            info,
            external_ids: Vec::new(),
            seen: RoaringBitmap::new(),
        }
    }

    pub fn info(&self) -> &FieldInfo {
        &self.info
    }

    /// Buffer a vector. Its ordinal is the number of vectors added before it.
    pub fn add(&mut self, external_id: u32, vector: &[f32]) -> Result<u32> {
        let doc = i32::try_from(external_id).map_err(|_| {
            IndexError::config(format!("external id {external_id} exceeds {}", i32::MAX))
        })?;
        if self.seen.contains(external_id) {
            return Err(IndexError::illegal_state(format!(
                "field {:?} already holds a vector for external id {external_id}",
                self.info.name
            )));
        }
        let ord = self.vectors.add(vector)?;
        self.external_ids.push(doc);
        self.seen.insert(external_id);
        Ok(ord)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

enum State {
    Open(Vec<FieldWriter>),
    Flushed(SegmentFiles),
    /// A flush failed; the buffered vectors are gone.
    Failed,
}

/// Writes one segment.
///
/// Fields are added up front, vectors are buffered, and [`flush`](Self::flush)
/// builds every graph and writes the data. Nothing is visible under the
/// segment's final file names until [`finish`](Self::finish).
pub struct SegmentWriter {
    dir: PathBuf,
    name: String,
    config: IndexConfig,
    pools: BuildPools,
    state: State,
}

impl SegmentWriter {
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>, config: IndexConfig, pools: BuildPools) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.into(),
            config,
            pools,
            state: State::Open(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn open_fields(&mut self) -> Result<&mut Vec<FieldWriter>> {
        match &mut self.state {
            State::Open(fields) => Ok(fields),
            State::Flushed(_) => Err(IndexError::illegal_state(format!(
                "segment {} was already flushed",
                self.name
            ))),
            State::Failed => Err(failed(&self.name)),
        }
    }

    /// Register a field. Byte fields and out-of-range dimensions are rejected.
    pub fn add_field(&mut self, info: FieldInfo) -> Result<&mut FieldWriter> {
        info.validate()?;
        let fields = self.open_fields()?;
        if fields
            .iter()
            .any(|f| f.info.name == info.name || f.info.number == info.number)
        {
            return Err(IndexError::config(format!(
                "field {:?} ({}) is already registered",
                info.name, info.number
            )));
        }
        fields.push(FieldWriter::new(info));
        fields
            .last_mut()
            .ok_or_else(|| IndexError::illegal_state("field list is empty"))
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldWriter> {
        match &mut self.state {
            State::Open(fields) => fields.iter_mut().find(|f| f.info.name == name),
            State::Flushed(_) | State::Failed => None,
        }
    }

    /// Build every field's graph (and PQ codes when the field is large enough)
    /// and write them to the segment's temporary files.
    ///
    /// A failed flush discards the temporary files and leaves the writer
    /// unusable: later `flush` and `finish` calls fail.
    #[instrument(skip_all, fields(segment = %self.name))]
    pub fn flush(&mut self) -> Result<&[FieldMetadata]> {
        self.open_fields()?;
        let State::Open(fields) = std::mem::replace(&mut self.state, State::Failed) else {
            return Err(failed(&self.name));
        };
        info!(fields = fields.len(), "flushing segment");
        let files = self.write_fields(fields).inspect_err(|e| {
            warn!(error = %e, "segment flush failed");
        })?;
        self.state = State::Flushed(files);
        match &self.state {
            State::Flushed(files) => Ok(files.fields()),
            _ => Err(failed(&self.name)),
        }
    }

    fn write_fields(&self, fields: Vec<FieldWriter>) -> Result<SegmentFiles> {
        let mut files = SegmentFiles::create(&self.dir, &self.name)?;
        for field in fields {
            self.flush_field(&mut files, field)?;
        }
        Ok(files)
    }

    fn flush_field(&self, files: &mut SegmentFiles, field: FieldWriter) -> Result<()> {
        let FieldWriter {
            info,
            vectors,
            external_ids,
            ..
        } = field;
        let compute = self.pools.compute();
        let n = vectors.len();
        let vectors: Arc<VectorStore> = Arc::new(vectors);
        let ords: Vec<u32> = (0..n as u32).collect();
        info!(field = %info.name, vectors = n, "flushing field");

        let pq = compute.install(|| {
            ProductQuantizer::train_for_batch(vectors.as_ref(), info.similarity, &self.config.quantization)
        })?;
        let pq = match pq {
            Some(pq) => Some(Arc::new(
                compute.install(|| PqVectors::encode_all(pq, vectors.as_ref(), &ords))?,
            )),
            None => None,
        };
        let scores = match &pq {
            Some(pq) => ScoreProvider::pq(pq.clone(), info.similarity),
            None => ScoreProvider::exact(vectors.clone(), info.similarity),
        };

        let builder = GraphBuilder::new(scores, n, self.config.graph.clone())?;
        builder.build(compute, vectors.as_ref(), &ords)?;
        builder.cleanup(compute)?;
        let graph = builder.into_graph();

        files.write_field(PersistedField {
            info: &info,
            graph: &graph,
            vectors: vectors.as_ref(),
            mapper: &IdentityMapper::for_graph(&graph),
            pq: pq.as_deref(),
            doc_map: OrdToDocMap::new(external_ids)?,
        })?;
        Ok(())
    }

    /// Flush if needed, then publish the segment under its final file names.
    #[instrument(skip_all, fields(segment = %self.name))]
    pub fn finish(mut self) -> Result<Vec<FieldMetadata>> {
        if let State::Open(_) = self.state {
            self.flush()?;
        }
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Flushed(files) => {
                let fields = files.commit()?;
                info!(fields = fields.len(), "segment published");
                Ok(fields)
            }
            _ => Err(failed(&self.name)),
        }
    }
}

fn failed(name: &str) -> IndexError {
    IndexError::illegal_state(format!("segment {name} failed to flush"))
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("flushed", &matches!(self.state, State::Flushed(_)))
            .field("failed", &matches!(self.state, State::Failed))
            .finish()
    }
}
