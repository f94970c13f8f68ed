//! Merge coordinator: consolidate several published segments into one.
//!
//! Per field, the source with the most live vectors leads. Without product
//! quantization the leading graph is loaded and extended with the other
//! sources' live vectors, provided the extended node-id space stays within
//! [`MergeConfig::max_graph_ordinals`](crate::config::MergeConfig); otherwise
//! (PQ in play, capacity exceeded, or incompatible graph parameters) the graph
//! is rebuilt over the live vectors only.
//!
//! Quantization: a codebook carried by the leading source (or the first source
//! that has one) is refined with the other sources' live vectors; without any
//! codebook a new one is trained once the live count reaches the minimum batch
//! size.

pub mod spaces;

pub use spaces::{CompactOrd, GlobalOrd, GraphNodeOrd, GraphNodeSpace, OrdinalSpaces};

use crate::codec::format::NO_NODE;
use crate::codec::{FieldInfo, FieldMetadata, IdentityMapper, OrdToDocMap, OrdinalMapper};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::graph::{GraphBuilder, GraphView, OnHeapGraph, ScoreProvider};
use crate::pool::BuildPools;
use crate::pq::{PqVectors, ProductQuantizer};
use crate::segment::{FieldReader, PersistedField, SegmentFiles, SegmentReader};
use crate::store::{MappedVectorValues, MergedVectorValues, VectorValues};
use roaring::RoaringBitmap;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Renumbering of external ids applied by a merge.
pub trait DocMap: Send + Sync {
    /// New external id of `doc`, or `None` if the document is dropped.
    fn map(&self, doc: u32) -> Option<u32>;
}

impl<F: Fn(u32) -> Option<u32> + Send + Sync> DocMap for F {
    fn map(&self, doc: u32) -> Option<u32> {
        self(doc)
    }
}

/// Keeps every external id.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDocMap;

impl DocMap for IdentityDocMap {
    fn map(&self, doc: u32) -> Option<u32> {
        Some(doc)
    }
}

/// One segment taking part in a merge.
pub struct MergeSource<'a> {
    segment: &'a SegmentReader,
    live_docs: Option<RoaringBitmap>,
    doc_map: Arc<dyn DocMap>,
}

impl<'a> MergeSource<'a> {
    /// Every document live, external ids unchanged.
    pub fn new(segment: &'a SegmentReader) -> Self {
        Self {
            segment,
            live_docs: None,
            doc_map: Arc::new(IdentityDocMap),
        }
    }

    /// Only the external ids in `live_docs` survive.
    pub fn with_live_docs(mut self, live_docs: RoaringBitmap) -> Self {
        self.live_docs = Some(live_docs);
        self
    }

    pub fn with_doc_map(mut self, doc_map: Arc<dyn DocMap>) -> Self {
        self.doc_map = doc_map;
        self
    }

    pub fn segment(&self) -> &SegmentReader {
        self.segment
    }

    fn is_live(&self, doc: u32) -> bool {
        self.live_docs.as_ref().map_or(true, |live| live.contains(doc))
    }
}

/// How a field's graph was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeStrategy {
    /// The leading source's graph was extended.
    Incremental,
    /// A new graph was built over the live vectors.
    Rebuild,
}

/// What happened to a field's quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuantizationDecision {
    None,
    /// An existing codebook was refined.
    Refined,
    /// A codebook was trained from scratch.
    Trained,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMergeStats {
    pub name: String,
    pub strategy: MergeStrategy,
    pub quantization: QuantizationDecision,
    pub live_vectors: usize,
    /// Index into the merge's sources.
    pub leading_source: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    pub fields: Vec<FieldMergeStats>,
}

impl MergeStats {
    pub fn field(&self, name: &str) -> Option<&FieldMergeStats> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Metadata of the merged segment plus what the merge decided.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub fields: Vec<FieldMetadata>,
    pub stats: MergeStats,
}

/// A field as seen by one source.
struct SourceField<'a> {
    /// Index into the merge's sources.
    source: usize,
    reader: &'a FieldReader,
    /// New external id per local ordinal; `-1` unless live.
    new_docs: Vec<i32>,
    live: RoaringBitmap,
}

/// Runs merges on caller-owned pools.
#[derive(Debug, Clone)]
pub struct Merger {
    config: IndexConfig,
    pools: BuildPools,
}

impl Merger {
    pub fn new(config: IndexConfig, pools: BuildPools) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, pools })
    }

    /// Merge `sources` into a new segment `name` in `dir`.
    ///
    /// Runs on the orchestration pool; graph and PQ work is submitted to the
    /// compute pool. The segment only becomes visible once every field was
    /// written.
    #[instrument(skip_all, fields(segment = name, sources = sources.len()))]
    pub fn merge(&self, sources: &[MergeSource<'_>], dir: &Path, name: &str) -> Result<MergeOutput> {
        self.pools
            .orchestration()
            .install(|| self.merge_segments(sources, dir, name))
    }

    fn merge_segments(&self, sources: &[MergeSource<'_>], dir: &Path, name: &str) -> Result<MergeOutput> {
        if sources.is_empty() {
            return Err(IndexError::config("a merge needs at least one source"));
        }
        let fields = merged_fields(sources)?;
        info!(fields = fields.len(), "merging segments");

        let mut files = SegmentFiles::create(dir, name)?;
        let mut stats = MergeStats::default();
        for info in &fields {
            stats.fields.push(self.merge_field(sources, info, &mut files)?);
        }
        let fields = files.commit()?;
        Ok(MergeOutput { fields, stats })
    }

    fn merge_field(
        &self,
        sources: &[MergeSource<'_>],
        info: &FieldInfo,
        files: &mut SegmentFiles,
    ) -> Result<FieldMergeStats> {
        let inputs = collect_live(sources, info)?;
        // Most live vectors; ties go to the earliest source.
        let leading = inputs
            .iter()
            .enumerate()
            .fold(None::<(usize, u64)>, |best, (i, input)| match best {
                Some((_, n)) if n >= input.live.len() => best,
                _ => Some((i, input.live.len())),
            })
            .map_or(0, |(i, _)| i);
        let slots: Vec<u32> = inputs
            .iter()
            .map(|i| i.reader.graph().id_upper_bound() as u32)
            .collect();
        let spaces = OrdinalSpaces::new(
            &slots,
            inputs.iter().map(|i| i.live.clone()).collect(),
            leading,
            self.config.merge.max_graph_ordinals,
        )?;
        info!(
            field = %info.name,
            live_vectors = spaces.compact_len(),
            leading_source = inputs.get(leading).map_or(0, |i| i.source),
            leading_live = spaces.live_count(leading),
            "merging field"
        );

        let merged: Arc<dyn VectorValues> = Arc::new(MergedVectorValues::new(
            inputs.iter().map(|i| i.reader.vectors()).collect(),
        )?);
        let compact: Arc<dyn VectorValues> =
            Arc::new(MappedVectorValues::new(merged.clone(), spaces.compact_table()));

        let (pq, quantization) = self.quantize(info, &inputs, &spaces, &merged, &compact)?;

        let doc_for = |global: GlobalOrd| -> Result<i32> {
            let (s, local) = spaces.locate(global)?;
            Ok(inputs[s].new_docs[local as usize])
        };

        let strategy = match &pq {
            None => match self.incremental_space(info, &inputs, &spaces) {
                Ok(Some(space)) => {
                    let table = space.global_table();
                    let vectors: Arc<dyn VectorValues> =
                        Arc::new(MappedVectorValues::new(merged.clone(), table));
                    let graph = self.extend_leading(info, &inputs[leading], &spaces, &space, &vectors)?;
                    let doc_map = persisted_doc_map(&graph, |node| {
                        doc_for(space.to_global(GraphNodeOrd::new(node))?)
                    })?;
                    files.write_field(PersistedField {
                        info,
                        graph: &graph,
                        vectors: vectors.as_ref(),
                        mapper: &IdentityMapper::for_graph(&graph),
                        pq: None,
                        doc_map,
                    })?;
                    MergeStrategy::Incremental
                }
                Ok(None) => MergeStrategy::Rebuild,
                Err(e) if e.is_capacity() => {
                    info!(field = %info.name, error = %e, "ordinal space too large to extend, rebuilding");
                    MergeStrategy::Rebuild
                }
                Err(e) => return Err(e),
            },
            Some(_) => MergeStrategy::Rebuild,
        };

        if strategy == MergeStrategy::Rebuild {
            let graph = self.rebuild(info, &compact, pq.as_ref())?;
            let doc_map = persisted_doc_map(&graph, |node| {
                doc_for(spaces.compact_to_global(CompactOrd::new(node))?)
            })?;
            files.write_field(PersistedField {
                info,
                graph: &graph,
                vectors: compact.as_ref(),
                mapper: &IdentityMapper::for_graph(&graph),
                pq: pq.as_deref(),
                doc_map,
            })?;
        }

        Ok(FieldMergeStats {
            name: info.name.clone(),
            strategy,
            quantization,
            live_vectors: spaces.compact_len(),
            leading_source: inputs.get(leading).map_or(0, |i| i.source),
        })
    }

    /// Refine, train or skip PQ. Codes are addressed by compact ordinal.
    fn quantize(
        &self,
        info: &FieldInfo,
        inputs: &[SourceField<'_>],
        spaces: &OrdinalSpaces,
        merged: &Arc<dyn VectorValues>,
        compact: &Arc<dyn VectorValues>,
    ) -> Result<(Option<Arc<PqVectors>>, QuantizationDecision)> {
        let compute = self.pools.compute();
        let qconfig = &self.config.quantization;
        let carrier = std::iter::once(spaces.leading())
            .chain(0..inputs.len())
            .find(|&i| inputs.get(i).is_some_and(|input| input.reader.pq().is_some()));

        let (pq, decision) = match carrier {
            Some(carrier) => {
                let Some(existing) = inputs[carrier].reader.pq() else {
                    return Err(IndexError::illegal_state("codebook disappeared during merge"));
                };
                let mut pq = existing.quantizer().clone();
                let others = spaces.live_globals_except(carrier);
                if !others.is_empty() && qconfig.refine_rounds > 0 {
                    let view = MappedVectorValues::new(merged.clone(), others.into());
                    compute.install(|| pq.refine(&view, qconfig.refine_rounds))?;
                }
                info!(
                    field = %info.name,
                    source = inputs[carrier].source,
                    "refining existing codebook"
                );
                (Some(pq), QuantizationDecision::Refined)
            }
            None => {
                match compute.install(|| {
                    ProductQuantizer::train_for_batch(compact.as_ref(), info.similarity, qconfig)
                })? {
                    Some(pq) => (Some(pq), QuantizationDecision::Trained),
                    None => (None, QuantizationDecision::None),
                }
            }
        };

        let Some(pq) = pq else {
            return Ok((None, decision));
        };
        let ords: Vec<u32> = (0..spaces.compact_len() as u32).collect();
        let codes = compute.install(|| PqVectors::encode_all(pq, compact.as_ref(), &ords))?;
        Ok((Some(Arc::new(codes)), decision))
    }

    /// Graph-node space for extending the leading graph, or `None` when the
    /// leading graph cannot be reused as is.
    fn incremental_space(
        &self,
        info: &FieldInfo,
        inputs: &[SourceField<'_>],
        spaces: &OrdinalSpaces,
    ) -> Result<Option<GraphNodeSpace>> {
        let Some(leading) = inputs.get(spaces.leading()) else {
            return Ok(None);
        };
        let graph = leading.reader.graph();
        if leading.live.is_empty() {
            return Ok(None);
        }
        let degree = graph.max_degree(0);
        if degree > self.config.graph.max_degree {
            info!(
                field = %info.name,
                persisted_degree = degree,
                max_degree = self.config.graph.max_degree,
                "leading graph exceeds the configured degree, rebuilding"
            );
            return Ok(None);
        }
        spaces
            .graph_node_space(self.config.merge.max_graph_ordinals)
            .map(Some)
    }

    fn extend_leading(
        &self,
        info: &FieldInfo,
        leading: &SourceField<'_>,
        spaces: &OrdinalSpaces,
        space: &GraphNodeSpace,
        vectors: &Arc<dyn VectorValues>,
    ) -> Result<OnHeapGraph> {
        let compute = self.pools.compute();
        let disk = leading.reader.graph();
        let heap = disk.to_heap(space.capacity(), self.config.graph.clone())?;
        let builder = GraphBuilder::from_graph(
            heap,
            ScoreProvider::exact(vectors.clone(), info.similarity),
            compute,
        )?;

        let mut deleted = 0usize;
        for node in disk.layer_nodes(0) {
            if !leading.live.contains(node) {
                builder.mark_deleted(node)?;
                deleted += 1;
            }
        }
        let appended: Vec<u32> = space.appended().map(GraphNodeOrd::get).collect();
        info!(
            field = %info.name,
            kept = disk.size() - deleted,
            deleted,
            appended = appended.len(),
            "extending leading graph"
        );
        debug_assert!(appended
            .iter()
            .all(|&n| space.to_global(GraphNodeOrd::new(n)).is_ok_and(|g| spaces.is_live(g))));
        builder.build(compute, vectors.as_ref(), &appended)?;
        builder.cleanup(compute)?;
        Ok(builder.into_graph())
    }

    fn rebuild(
        &self,
        info: &FieldInfo,
        compact: &Arc<dyn VectorValues>,
        pq: Option<&Arc<PqVectors>>,
    ) -> Result<OnHeapGraph> {
        let compute = self.pools.compute();
        let n = compact.size();
        let scores = match pq {
            Some(pq) => ScoreProvider::pq(pq.clone(), info.similarity),
            None => ScoreProvider::exact(compact.clone(), info.similarity),
        };
        info!(field = %info.name, vectors = n, quantized = pq.is_some(), "rebuilding graph");
        let builder = GraphBuilder::new(scores, n, self.config.graph.clone())?;
        let nodes: Vec<u32> = (0..n as u32).collect();
        builder.build(compute, compact.as_ref(), &nodes)?;
        builder.cleanup(compute)?;
        Ok(builder.into_graph())
    }
}

/// Union of the sources' fields. Fields of the same name must agree on
/// dimension and similarity.
fn merged_fields(sources: &[MergeSource<'_>]) -> Result<Vec<FieldInfo>> {
    let mut fields: Vec<FieldInfo> = Vec::new();
    for source in sources {
        for field in source.segment.fields() {
            let info = field.info();
            match fields.iter().find(|f| f.name == info.name) {
                Some(known) if known.dimension != info.dimension || known.similarity != info.similarity => {
                    return Err(IndexError::config(format!(
                        "field {:?} is {}-dimensional {:?} in one source and {}-dimensional {:?} in another",
                        info.name, known.dimension, known.similarity, info.dimension, info.similarity
                    )));
                }
                Some(_) => {}
                None => {
                    if fields.iter().any(|f| f.number == info.number) {
                        return Err(IndexError::config(format!(
                            "field number {} names different fields across sources",
                            info.number
                        )));
                    }
                    fields.push(info.clone());
                }
            }
        }
    }
    Ok(fields)
}

/// Live ordinals and their new external ids, for every source holding the field.
fn collect_live<'a>(sources: &'a [MergeSource<'_>], info: &FieldInfo) -> Result<Vec<SourceField<'a>>> {
    let mut inputs = Vec::new();
    for (source_idx, source) in sources.iter().enumerate() {
        let Some(reader) = source.segment.field(&info.name) else {
            continue;
        };
        let doc_map = reader.doc_map();
        let mut new_docs = vec![NO_NODE; doc_map.len()];
        let mut live = RoaringBitmap::new();
        for ord in doc_map.live_ordinals() {
            let Some(doc) = doc_map.external_id(ord) else {
                continue;
            };
            if !source.is_live(doc) {
                continue;
            }
            match source.doc_map.map(doc) {
                Some(new_doc) => {
                    new_docs[ord as usize] = i32::try_from(new_doc).map_err(|_| {
                        IndexError::integrity(format!("external id {new_doc} exceeds the format limit"))
                    })?;
                    live.insert(ord);
                }
                None => warn!(
                    field = %info.name,
                    source = source_idx,
                    doc,
                    "document dropped by merge doc map"
                ),
            }
        }
        debug!(
            field = %info.name,
            source = source_idx,
            live = live.len(),
            slots = doc_map.len(),
            "collected live vectors"
        );
        inputs.push(SourceField {
            source: source_idx,
            reader,
            new_docs,
            live,
        });
    }
    Ok(inputs)
}

/// Ordinal map of a graph written with [`IdentityMapper::for_graph`].
fn persisted_doc_map<F>(graph: &OnHeapGraph, doc_of: F) -> Result<OrdToDocMap>
where
    F: Fn(u32) -> Result<i32>,
{
    let slots = IdentityMapper::for_graph(graph)
        .max_ordinal()
        .map_or(0, |m| m as usize + 1);
    let mut forward = Vec::with_capacity(slots);
    for node in 0..slots as u32 {
        if !graph.contains(node) {
            forward.push(NO_NODE);
            continue;
        }
        let doc = doc_of(node)?;
        if doc < 0 {
            return Err(IndexError::integrity(format!(
                "graph node {node} is live but has no external id"
            )));
        }
        forward.push(doc);
    }
    OrdToDocMap::new(forward)
}
