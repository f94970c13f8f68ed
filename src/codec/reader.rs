//! Random-access view over a persisted graph region.
//!
//! Nothing is materialized on load except the header and the sorted node list
//! of each upper layer. Base-layer records have a fixed size, so the record of
//! ordinal `o` sits at `base + o * record_len`.

use super::format::{i32_at, ByteReader, GRAPH_MAGIC, NO_NODE};
use crate::config::{GraphConfig, VectorPlacement, MAX_DIMENSIONS};
use crate::error::{IndexError, Result};
use crate::graph::{DiversityPolicy, EntryNode, GraphView, Neighbor, NeighborIds, OnHeapGraph, MAX_LEVEL};
use crate::store::VectorValues;
use std::borrow::Cow;
use std::sync::Arc;

/// Shared, immutable bytes backing a region (a memory map or a buffer).
pub type SharedBytes = Arc<dyn AsRef<[u8]> + Send + Sync>;

#[derive(Debug, Clone)]
struct UpperLayer {
    offset: usize,
    record_len: usize,
    max_degree: usize,
    /// Ascending.
    nodes: Vec<u32>,
}

/// Persisted graph, read in place.
pub struct OnDiskGraph {
    bytes: SharedBytes,
    start: usize,
    len: usize,
    size: usize,
    dimension: usize,
    entry: Option<EntryNode>,
    layer_counts: Vec<usize>,
    base_degree: usize,
    slots: usize,
    placement: VectorPlacement,
    base_offset: usize,
    base_record_len: usize,
    upper: Vec<UpperLayer>,
    separated_offset: usize,
}

impl OnDiskGraph {
    /// Parse the region `[offset, offset + len)` of `bytes`.
    pub fn load(bytes: SharedBytes, offset: usize, len: usize) -> Result<Self> {
        let all = (*bytes).as_ref();
        let region = offset
            .checked_add(len)
            .and_then(|end| all.get(offset..end))
            .ok_or_else(|| IndexError::format("graph region lies outside the data file"))?;
        let mut r = ByteReader::new(region);

        if r.read_u32()? != GRAPH_MAGIC {
            return Err(IndexError::format("invalid graph region magic"));
        }
        super::format::check_version(r.read_u32()?, "graph region")?;
        let size = r.read_len("graph size", i32::MAX as usize)?;
        let dimension = r.read_len("dimension", MAX_DIMENSIONS)?;
        let entry_ord = r.read_i32()?;
        let num_layers = r.read_len("layer count", MAX_LEVEL + 1)?;
        let mut layer_counts = Vec::with_capacity(num_layers);
        let mut degrees = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layer_counts.push(r.read_len("layer node count", i32::MAX as usize)?);
            degrees.push(r.read_len("layer degree", u16::MAX as usize)?);
        }
        let max_ordinal = r.read_i32()?;
        let placement = match r.read_u32()? {
            0 => VectorPlacement::Inline,
            1 => VectorPlacement::Separated,
            other => {
                return Err(IndexError::format(format!(
                    "unknown vector placement {other}"
                )))
            }
        };

        let slots = if max_ordinal < 0 { 0 } else { max_ordinal as usize + 1 };
        let base_degree = degrees.first().copied().unwrap_or(0);
        let inline_len = if placement == VectorPlacement::Inline {
            dimension * 4
        } else {
            0
        };
        let base_record_len = 4 + inline_len + 4 + base_degree * 4;
        let base_offset = r.position();

        let mut cursor = base_offset + slots * base_record_len;
        let mut upper = Vec::with_capacity(num_layers.saturating_sub(1));
        for l in 1..num_layers {
            let record_len = 8 + degrees[l] * 4;
            let count = layer_counts[l];
            let layer_len = count * record_len;
            let layer_bytes = region
                .get(cursor..cursor + layer_len)
                .ok_or_else(|| IndexError::format(format!("layer {l} is truncated")))?;
            let mut nodes = Vec::with_capacity(count);
            for i in 0..count {
                let ord = i32_at(layer_bytes, i * record_len);
                if ord < 0 || ord as usize >= slots {
                    return Err(IndexError::format(format!(
                        "layer {l} lists ordinal {ord} outside [0, {slots})"
                    )));
                }
                if nodes.last().is_some_and(|&prev| prev >= ord as u32) {
                    return Err(IndexError::format(format!("layer {l} is not sorted")));
                }
                nodes.push(ord as u32);
            }
            upper.push(UpperLayer {
                offset: cursor,
                record_len,
                max_degree: degrees[l],
                nodes,
            });
            cursor += layer_len;
        }

        let separated_offset = cursor;
        if placement == VectorPlacement::Separated {
            cursor += slots * dimension * 4;
        }
        if cursor != region.len() {
            return Err(IndexError::format(format!(
                "graph region length {} does not match its header ({cursor})",
                region.len()
            )));
        }

        let entry = if entry_ord == NO_NODE {
            None
        } else {
            if entry_ord < 0 || entry_ord as usize >= slots {
                return Err(IndexError::format(format!(
                    "entry node {entry_ord} outside [0, {slots})"
                )));
            }
            Some(EntryNode {
                node: entry_ord as u32,
                level: num_layers.saturating_sub(1),
            })
        };

        Ok(Self {
            bytes,
            start: offset,
            len,
            size,
            dimension,
            entry,
            layer_counts,
            base_degree,
            slots,
            placement,
            base_offset,
            base_record_len,
            upper,
            separated_offset,
        })
    }

    fn region(&self) -> &[u8] {
        &(*self.bytes).as_ref()[self.start..self.start + self.len]
    }

    /// Live node count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_layers(&self) -> usize {
        self.layer_counts.len()
    }

    /// Node count of every layer.
    pub fn layer_counts(&self) -> &[usize] {
        &self.layer_counts
    }

    /// Degree bound of `level`.
    pub fn max_degree(&self, level: usize) -> usize {
        match level {
            0 => self.base_degree,
            l => self.upper.get(l - 1).map_or(0, |u| u.max_degree),
        }
    }

    pub fn placement(&self) -> VectorPlacement {
        self.placement
    }

    fn base_record(&self, node: u32) -> Option<&[u8]> {
        if node as usize >= self.slots {
            return None;
        }
        let start = self.base_offset + node as usize * self.base_record_len;
        self.region().get(start..start + self.base_record_len)
    }

    /// Nodes on `level`, ascending.
    pub fn layer_nodes(&self, level: usize) -> Vec<u32> {
        match level {
            0 => (0..self.slots as u32).filter(|&n| self.contains(n)).collect(),
            l => self.upper.get(l - 1).map(|u| u.nodes.clone()).unwrap_or_default(),
        }
    }

    /// Highest layer holding `node`.
    pub fn level_of(&self, node: u32) -> Option<usize> {
        if !self.contains(node) {
            return None;
        }
        let mut level = 0;
        for (i, layer) in self.upper.iter().enumerate() {
            if layer.nodes.binary_search(&node).is_ok() {
                level = i + 1;
            } else {
                break;
            }
        }
        Some(level)
    }

    fn parse_neighbors(&self, record: &[u8], at: usize, degree: usize, node: u32) -> Result<NeighborIds> {
        let count = i32_at(record, at);
        if count < 0 || count as usize > degree {
            return Err(IndexError::integrity(format!(
                "node {node} stores {count} neighbors, bound is {degree}"
            )));
        }
        let mut out = NeighborIds::with_capacity(count as usize);
        for i in 0..count as usize {
            let target = i32_at(record, at + 4 + i * 4);
            if target < 0 || target as usize >= self.slots {
                return Err(IndexError::integrity(format!(
                    "node {node} links to ordinal {target} outside [0, {})",
                    self.slots
                )));
            }
            out.push(target as u32);
        }
        Ok(out)
    }

    /// Copy the structure into a mutable graph with room for `capacity` nodes.
    ///
    /// Edge distances are unknown until a diversity policy is supplied, so the
    /// graph comes back uninitialized; see `GraphBuilder::from_graph`.
    pub fn to_heap(&self, capacity: usize, config: GraphConfig) -> Result<OnHeapGraph> {
        if capacity < self.slots {
            return Err(IndexError::Capacity {
                required: self.slots as u64,
                limit: capacity as u64,
            });
        }
        if self.num_layers() > 0 && config.max_degree < self.base_degree {
            return Err(IndexError::config(format!(
                "graph was written with degree {} but max_degree is {}",
                self.base_degree, config.max_degree
            )));
        }
        let graph = OnHeapGraph::new(capacity, config, DiversityPolicy::Uninitialized);
        for node in self.layer_nodes(0) {
            let level = self.level_of(node).unwrap_or(0);
            graph.add_node(node, level)?;
            for l in 0..=level {
                let edges = self
                    .neighbors(l, node)?
                    .into_iter()
                    .map(|n| Neighbor {
                        node: n,
                        distance: f32::NAN,
                    })
                    .collect();
                graph.set_neighbors(l, node, edges)?;
            }
        }
        graph.set_entry(self.entry);
        Ok(graph)
    }
}

impl GraphView for OnDiskGraph {
    fn entry_node(&self) -> Option<EntryNode> {
        self.entry
    }

    fn id_upper_bound(&self) -> usize {
        self.slots
    }

    fn contains(&self, node: u32) -> bool {
        self.base_record(node)
            .is_some_and(|rec| i32_at(rec, 0) != NO_NODE)
    }

    fn neighbors(&self, level: usize, node: u32) -> Result<NeighborIds> {
        if level == 0 {
            let record = self.base_record(node).ok_or_else(|| {
                IndexError::integrity(format!("ordinal {node} outside [0, {})", self.slots))
            })?;
            let inline_len = if self.placement == VectorPlacement::Inline {
                self.dimension * 4
            } else {
                0
            };
            return self.parse_neighbors(record, 4 + inline_len, self.base_degree, node);
        }
        let Some(layer) = self.upper.get(level - 1) else {
            return Ok(NeighborIds::new());
        };
        let Ok(idx) = layer.nodes.binary_search(&node) else {
            return Ok(NeighborIds::new());
        };
        let start = layer.offset + idx * layer.record_len;
        let record = &self.region()[start..start + layer.record_len];
        self.parse_neighbors(record, 4, layer.max_degree, node)
    }
}

impl VectorValues for OnDiskGraph {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn size(&self) -> usize {
        self.slots
    }

    fn vector(&self, ord: u32) -> Result<Cow<'_, [f32]>> {
        if !self.contains(ord) {
            return Err(IndexError::integrity(format!(
                "ordinal {ord} has no stored vector"
            )));
        }
        let width = self.dimension * 4;
        let start = match self.placement {
            VectorPlacement::Inline => self.base_offset + ord as usize * self.base_record_len + 4,
            VectorPlacement::Separated => self.separated_offset + ord as usize * width,
        };
        let bytes = &self.region()[start..start + width];
        if cfg!(target_endian = "little") {
            if let Ok(floats) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
                return Ok(Cow::Borrowed(floats));
            }
        }
        Ok(Cow::Owned(super::format::decode_f32s(bytes)))
    }
}

impl std::fmt::Debug for OnDiskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDiskGraph")
            .field("size", &self.size)
            .field("slots", &self.slots)
            .field("dimension", &self.dimension)
            .field("entry", &self.entry)
            .field("layer_counts", &self.layer_counts)
            .field("placement", &self.placement)
            .finish()
    }
}
