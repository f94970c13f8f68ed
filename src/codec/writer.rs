//! Graph region writer.

use super::format::{WriteLe, GRAPH_MAGIC, NO_NODE, VERSION_CURRENT};
use super::mapper::OrdinalMapper;
use crate::config::VectorPlacement;
use crate::error::{IndexError, Result};
use crate::graph::{GraphView, OnHeapGraph};
use crate::store::VectorValues;
use std::io::Write;
use tracing::debug;

/// Streams an [`OnHeapGraph`] and its vectors as one graph region.
pub struct GraphWriter<'a> {
    graph: &'a OnHeapGraph,
    /// Addressed by in-memory node id.
    vectors: &'a dyn VectorValues,
    placement: VectorPlacement,
}

impl<'a> GraphWriter<'a> {
    pub fn new(graph: &'a OnHeapGraph, vectors: &'a dyn VectorValues, placement: VectorPlacement) -> Self {
        Self {
            graph,
            vectors,
            placement,
        }
    }

    /// Check that the graph can be persisted under `mapper`.
    ///
    /// Deleted nodes or over-full lists mean cleanup has not run (illegal
    /// state); anything unmapped or dangling is an integrity error.
    pub fn validate(&self, mapper: &dyn OrdinalMapper) -> Result<()> {
        let graph = self.graph;
        let deleted = graph.deleted_count();
        if deleted > 0 {
            return Err(IndexError::illegal_state(format!(
                "graph still has {deleted} deleted nodes; run cleanup before writing"
            )));
        }

        for node in graph.nodes_at_level(0) {
            if mapper.old_to_new(node).is_none() {
                return Err(IndexError::integrity(format!(
                    "node {node} has no persisted ordinal"
                )));
            }
            let level = graph.level_of(node).unwrap_or(0);
            for l in 0..=level {
                let neighbors = graph.neighbors(l, node)?;
                let max_degree = graph.config().max_degree_for_layer(l);
                if neighbors.len() > max_degree {
                    return Err(IndexError::illegal_state(format!(
                        "node {node} has {} neighbors on layer {l}, bound is {max_degree}",
                        neighbors.len()
                    )));
                }
                for &target in &neighbors {
                    let on_layer = graph.level_of(target).is_some_and(|t| t >= l);
                    if !on_layer || mapper.old_to_new(target).is_none() {
                        return Err(IndexError::integrity(format!(
                            "node {node} links to {target}, which is not persisted on layer {l}"
                        )));
                    }
                }
            }
        }

        if let Some(entry) = graph.entry_node() {
            if mapper.old_to_new(entry.node).is_none() || !graph.contains(entry.node) {
                return Err(IndexError::integrity(format!(
                    "entry node {} is not persisted",
                    entry.node
                )));
            }
        }
        Ok(())
    }

    /// Write the region. Validates first, so nothing is written for a graph
    /// that cannot be persisted.
    pub fn write<W: Write>(&self, w: &mut W, mapper: &dyn OrdinalMapper) -> Result<()> {
        self.validate(mapper)?;

        let graph = self.graph;
        let config = graph.config();
        let dimension = self.vectors.dimension();
        let num_layers = graph.num_layers();
        let layers: Vec<Vec<u32>> = (0..num_layers).map(|l| graph.nodes_at_level(l)).collect();
        let slots = mapper.max_ordinal().map_or(0, |m| m as usize + 1);
        let map = |old: u32| mapper.old_to_new(old).map_or(NO_NODE, |n| n as i32);

        w.write_u32_le(GRAPH_MAGIC)?;
        w.write_u32_le(VERSION_CURRENT)?;
        w.write_u32_le(graph.size() as u32)?;
        w.write_u32_le(dimension as u32)?;
        w.write_i32_le(graph.entry_node().map_or(NO_NODE, |e| map(e.node)))?;
        w.write_u32_le(num_layers as u32)?;
        for (l, nodes) in layers.iter().enumerate() {
            w.write_u32_le(nodes.len() as u32)?;
            w.write_u32_le(config.max_degree_for_layer(l) as u32)?;
        }
        w.write_i32_le(mapper.max_ordinal().map_or(NO_NODE, |m| m as i32))?;
        w.write_u32_le(placement_code(self.placement))?;

        let base_degree = config.max_degree_for_layer(0);
        let inline = self.placement == VectorPlacement::Inline;
        let mut record = Vec::with_capacity(8 + dimension * 4 + base_degree * 4);
        for new in 0..slots as u32 {
            record.clear();
            match mapper.new_to_old(new).filter(|&old| graph.contains(old)) {
                Some(old) => {
                    record.write_i32_le(new as i32)?;
                    if inline {
                        record.write_f32s_le(&self.vectors.vector(old)?)?;
                    }
                    write_neighbors(&mut record, &graph.neighbors(0, old)?, base_degree, map)?;
                }
                None => {
                    record.write_i32_le(NO_NODE)?;
                    if inline {
                        record.write_zeros(dimension * 4)?;
                    }
                    write_neighbors(&mut record, &[], base_degree, map)?;
                }
            }
            w.write_all(&record)?;
        }

        for (l, nodes) in layers.iter().enumerate().skip(1) {
            let degree = config.max_degree_for_layer(l);
            let mut ordered: Vec<(i32, u32)> = nodes.iter().map(|&old| (map(old), old)).collect();
            ordered.sort_unstable();
            for (new, old) in ordered {
                record.clear();
                record.write_i32_le(new)?;
                write_neighbors(&mut record, &graph.neighbors(l, old)?, degree, map)?;
                w.write_all(&record)?;
            }
        }

        if !inline {
            for new in 0..slots as u32 {
                match mapper.new_to_old(new).filter(|&old| graph.contains(old)) {
                    Some(old) => w.write_f32s_le(&self.vectors.vector(old)?)?,
                    None => w.write_zeros(dimension * 4)?,
                }
            }
        }

        debug!(
            nodes = graph.size(),
            slots,
            layers = num_layers,
            placement = ?self.placement,
            "wrote graph region"
        );
        Ok(())
    }
}

fn write_neighbors<F>(record: &mut Vec<u8>, neighbors: &[u32], degree: usize, map: F) -> Result<()>
where
    F: Fn(u32) -> i32,
{
    record.write_u32_le(neighbors.len() as u32)?;
    for &n in neighbors {
        record.write_i32_le(map(n))?;
    }
    for _ in neighbors.len()..degree {
        record.write_i32_le(NO_NODE)?;
    }
    Ok(())
}

pub(crate) fn placement_code(placement: VectorPlacement) -> u32 {
    match placement {
        VectorPlacement::Inline => 0,
        VectorPlacement::Separated => 1,
    }
}
