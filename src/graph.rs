use geo::Coord;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

use crate::common::{Result, RoutingError};

/// Input row for the node table.
#[derive(Debug, Clone, Copy)]
pub struct NodeRecord {
    pub node_id: i64,
    pub x: f64,
    pub y: f64,
}

/// Input row for the edge table. `weight` is a physical distance or travel
/// time and must be non-negative.
#[derive(Debug, Clone, Copy)]
pub struct EdgeRecord {
    pub source: i64,
    pub target: i64,
    pub weight: f32,
}

/// Payload for a network node.
#[derive(Debug, Clone, Copy)]
pub struct NodePayload {
    pub node_id: i64,
    pub coord: Coord<f64>,
}

/// Payload for a network edge.
#[derive(Debug, Clone, Copy)]
pub struct EdgePayload {
    pub weight: f32,
}

/// Immutable weighted road-network graph.
///
/// Built once from node and edge tables in a single planar coordinate system.
/// Undirected edge tables are mirrored at construction so that traversal code
/// never needs to assume symmetry.
#[derive(Clone)]
pub struct NetworkGraph {
    pub(crate) graph: DiGraph<NodePayload, EdgePayload>,
    node_lookup: HashMap<i64, NodeIndex>,
    directed: bool,
}

impl NetworkGraph {
    /// Builds the graph from cleaned node and edge tables.
    ///
    /// Exact duplicate node rows are tolerated; a node id mapping to two
    /// different coordinates is rejected. Edge endpoints must reference
    /// existing node ids and weights must be finite and non-negative.
    pub fn from_tables(
        nodes: &[NodeRecord],
        edges: &[EdgeRecord],
        directed: bool,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RoutingError::InvalidInput(
                "node table is empty".to_string(),
            ));
        }
        if edges.is_empty() {
            return Err(RoutingError::InvalidInput(
                "edge table is empty".to_string(),
            ));
        }
        let mut graph: DiGraph<NodePayload, EdgePayload> =
            DiGraph::with_capacity(nodes.len(), edges.len());
        let mut node_lookup: HashMap<i64, NodeIndex> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if !node.x.is_finite() || !node.y.is_finite() {
                return Err(RoutingError::InvalidInput(format!(
                    "node {} has non-finite coordinates ({}, {})",
                    node.node_id, node.x, node.y
                )));
            }
            let coord = Coord {
                x: node.x,
                y: node.y,
            };
            if let Some(&existing) = node_lookup.get(&node.node_id) {
                if graph[existing].coord != coord {
                    return Err(RoutingError::InvalidInput(format!(
                        "node id {} maps to conflicting coordinates",
                        node.node_id
                    )));
                }
                continue;
            }
            let idx = graph.add_node(NodePayload {
                node_id: node.node_id,
                coord,
            });
            node_lookup.insert(node.node_id, idx);
        }
        for edge in edges {
            if !edge.weight.is_finite() || edge.weight < 0.0 {
                return Err(RoutingError::InvalidInput(format!(
                    "edge {}->{} has invalid weight {}",
                    edge.source, edge.target, edge.weight
                )));
            }
            let source_idx = node_lookup.get(&edge.source).copied().ok_or_else(|| {
                RoutingError::InvalidInput(format!(
                    "edge references unknown source node {}",
                    edge.source
                ))
            })?;
            let target_idx = node_lookup.get(&edge.target).copied().ok_or_else(|| {
                RoutingError::InvalidInput(format!(
                    "edge references unknown target node {}",
                    edge.target
                ))
            })?;
            let payload = EdgePayload {
                weight: edge.weight,
            };
            graph.add_edge(source_idx, target_idx, payload);
            if !directed && source_idx != target_idx {
                graph.add_edge(target_idx, source_idx, payload);
            }
        }
        Ok(Self {
            graph,
            node_lookup,
            directed,
        })
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[inline]
    pub fn contains_node(&self, node_id: i64) -> bool {
        self.node_lookup.contains_key(&node_id)
    }

    #[inline]
    pub(crate) fn node_index(&self, node_id: i64) -> Option<NodeIndex> {
        self.node_lookup.get(&node_id).copied()
    }

    pub fn coord(&self, node_id: i64) -> Option<Coord<f64>> {
        self.node_index(node_id).map(|idx| self.graph[idx].coord)
    }

    /// Node payloads sorted by ascending node id. Used to seed the spatial
    /// index so that equal-distance snapping ties resolve to the smaller id.
    pub fn nodes_sorted_by_id(&self) -> Vec<NodePayload> {
        let mut payloads: Vec<NodePayload> = self
            .graph
            .node_indices()
            .map(|idx| self.graph[idx])
            .collect();
        payloads.sort_by_key(|payload| payload.node_id);
        payloads
    }

    /// Induced subgraph for an axis-aligned box: all nodes whose coordinates
    /// lie within `[min, max]` per axis, every edge with at least one endpoint
    /// in that node set, plus the outside endpoints of those edges.
    pub fn box_subgraph(&self, min: Coord<f64>, max: Coord<f64>) -> NetworkGraph {
        let mut sub_graph = DiGraph::new();
        let mut sub_lookup: HashMap<i64, NodeIndex> = HashMap::new();
        let in_box = |coord: &Coord<f64>| {
            coord.x >= min.x && coord.x <= max.x && coord.y >= min.y && coord.y <= max.y
        };
        fn copy_node(
            sub_graph: &mut DiGraph<NodePayload, EdgePayload>,
            sub_lookup: &mut HashMap<i64, NodeIndex>,
            payload: NodePayload,
        ) -> NodeIndex {
            *sub_lookup
                .entry(payload.node_id)
                .or_insert_with(|| sub_graph.add_node(payload))
        }
        for edge_ref in self.graph.edge_references() {
            let source_payload = self.graph[edge_ref.source()];
            let target_payload = self.graph[edge_ref.target()];
            if !in_box(&source_payload.coord) && !in_box(&target_payload.coord) {
                continue;
            }
            let source_idx = copy_node(&mut sub_graph, &mut sub_lookup, source_payload);
            let target_idx = copy_node(&mut sub_graph, &mut sub_lookup, target_payload);
            sub_graph.add_edge(source_idx, target_idx, *edge_ref.weight());
        }
        // Isolated in-box nodes carry no edges but still belong to the subset.
        for idx in self.graph.node_indices() {
            let payload = self.graph[idx];
            if in_box(&payload.coord) {
                copy_node(&mut sub_graph, &mut sub_lookup, payload);
            }
        }
        NetworkGraph {
            graph: sub_graph,
            node_lookup: sub_lookup,
            directed: self.directed,
        }
    }
}
