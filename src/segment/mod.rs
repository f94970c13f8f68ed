//! Segment files: one metadata file and one data file per segment.
//!
//! Both flush ([`SegmentWriter`]) and merge write through [`SegmentFiles`],
//! which streams field regions into a temporary data file and only renames
//! both files into place once every field was written.

pub mod reader;
pub mod writer;

pub use reader::{FieldReader, SegmentReader};
pub use writer::{FieldWriter, SegmentWriter};

use crate::codec::format::{write_header, TrackingWriter, DATA_EXTENSION, DATA_MAGIC, META_EXTENSION};
use crate::codec::{write_meta, FieldInfo, FieldMetadata, GraphWriter, OrdToDocMap, OrdinalMapper};
use crate::error::{IndexError, Result};
use crate::graph::{GraphView, OnHeapGraph};
use crate::pq::PqVectors;
use crate::store::VectorValues;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Path of a segment's metadata file.
pub fn meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{META_EXTENSION}"))
}

/// Path of a segment's data file.
pub fn data_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{DATA_EXTENSION}"))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// A finished in-memory field ready to be persisted.
pub(crate) struct PersistedField<'a> {
    pub info: &'a FieldInfo,
    pub graph: &'a OnHeapGraph,
    /// Addressed by in-memory node id.
    pub vectors: &'a dyn VectorValues,
    pub mapper: &'a dyn OrdinalMapper,
    /// Addressed by persisted ordinal.
    pub pq: Option<&'a PqVectors>,
    /// Addressed by persisted ordinal.
    pub doc_map: OrdToDocMap,
}

/// Temporary files of a segment being written.
pub(crate) struct SegmentFiles {
    name: String,
    meta_path: PathBuf,
    data_path: PathBuf,
    data: Option<TrackingWriter<BufWriter<File>>>,
    fields: Vec<FieldMetadata>,
    committed: bool,
}

impl SegmentFiles {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(std::path::is_separator) {
            return Err(IndexError::config(format!("invalid segment name {name:?}")));
        }
        let meta_path = meta_path(dir, name);
        let data_path = data_path(dir, name);
        if meta_path.exists() || data_path.exists() {
            return Err(IndexError::illegal_state(format!(
                "segment {name} already exists in {}",
                dir.display()
            )));
        }
        let file = File::create(temp_path(&data_path))?;
        let mut data = TrackingWriter::new(BufWriter::new(file));
        write_header(&mut data, DATA_MAGIC)?;
        Ok(Self {
            name: name.to_owned(),
            meta_path,
            data_path,
            data: Some(data),
            fields: Vec::new(),
            committed: false,
        })
    }

    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Append a field's graph and PQ regions to the data file.
    pub fn write_field(&mut self, field: PersistedField<'_>) -> Result<&FieldMetadata> {
        let PersistedField {
            info,
            graph,
            vectors,
            mapper,
            pq,
            doc_map,
        } = field;
        if self.fields.iter().any(|f| f.info.name == info.name) {
            return Err(IndexError::illegal_state(format!(
                "field {:?} written twice",
                info.name
            )));
        }
        check_live_mapping(info, graph, mapper, &doc_map)?;
        let slots = mapper.max_ordinal().map_or(0, |m| m as usize + 1);
        if let Some(pq) = pq {
            if pq.len() != slots {
                return Err(IndexError::integrity(format!(
                    "field {:?}: {} PQ codes for {slots} ordinals",
                    info.name,
                    pq.len()
                )));
            }
        }

        let data = self
            .data
            .as_mut()
            .ok_or_else(|| IndexError::illegal_state("segment files already committed"))?;
        let graph_offset = data.position();
        GraphWriter::new(graph, vectors, graph.config().vector_placement).write(data, mapper)?;
        let graph_length = data.position() - graph_offset;

        let (pq_offset, pq_length) = match pq {
            Some(pq) => {
                let offset = data.position();
                pq.write(data)?;
                (offset, data.position() - offset)
            }
            None => (0, 0),
        };

        info!(
            segment = %self.name,
            field = %info.name,
            nodes = graph.size(),
            graph_bytes = graph_length,
            pq_bytes = pq_length,
            "wrote field"
        );
        self.fields.push(FieldMetadata {
            info: info.clone(),
            graph_offset,
            graph_length,
            pq_offset,
            pq_length,
            neighbor_overflow: graph.config().neighbor_overflow,
            doc_map,
        });
        Ok(&self.fields[self.fields.len() - 1])
    }

    /// Seal the data file, write the metadata file and move both into place.
    pub fn commit(mut self) -> Result<Vec<FieldMetadata>> {
        let data = self
            .data
            .take()
            .ok_or_else(|| IndexError::illegal_state("segment files already committed"))?;
        let data = data.finish()?;
        data.into_inner()
            .map_err(|e| IndexError::Io(e.into_error()))?
            .sync_all()?;

        let meta_tmp = temp_path(&self.meta_path);
        let mut meta = write_meta(BufWriter::new(File::create(&meta_tmp)?), &self.fields)?;
        meta.flush()?;
        meta.into_inner()
            .map_err(|e| IndexError::Io(e.into_error()))?
            .sync_all()?;

        std::fs::rename(temp_path(&self.data_path), &self.data_path)?;
        std::fs::rename(&meta_tmp, &self.meta_path)?;
        self.committed = true;
        debug!(segment = %self.name, fields = self.fields.len(), "committed segment");
        Ok(std::mem::take(&mut self.fields))
    }
}

impl Drop for SegmentFiles {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.data.take();
        for path in [temp_path(&self.data_path), temp_path(&self.meta_path)] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove temporary segment file");
                }
            }
        }
    }
}

/// Every persisted graph ordinal has exactly one external id and vice versa.
fn check_live_mapping(
    info: &FieldInfo,
    graph: &OnHeapGraph,
    mapper: &dyn OrdinalMapper,
    doc_map: &OrdToDocMap,
) -> Result<()> {
    let slots = mapper.max_ordinal().map_or(0, |m| m as usize + 1);
    if doc_map.len() != slots || doc_map.live_count() != graph.size() {
        return Err(IndexError::integrity(format!(
            "field {:?}: ordinal map covers {} slots with {} ids, graph has {slots} slots and {} nodes",
            info.name,
            doc_map.len(),
            doc_map.live_count(),
            graph.size()
        )));
    }
    for new in 0..slots as u32 {
        let persisted = mapper.new_to_old(new).is_some_and(|old| graph.contains(old));
        if persisted != doc_map.external_id(new).is_some() {
            return Err(IndexError::integrity(format!(
                "field {:?}: ordinal {new} is {} but {} an external id",
                info.name,
                if persisted { "live" } else { "a hole" },
                if persisted { "lacks" } else { "has" }
            )));
        }
    }
    Ok(())
}
