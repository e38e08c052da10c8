use geo::{Coord, LineString};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::common::{Result, RoutingConfig, RoutingError};
use crate::graph::NetworkGraph;
use crate::snap::Poi;

/// Output of one shortest-path invocation for a single node. Nodes that are
/// unreachable from the source are absent from the tree altogether, so a
/// finite distance here is always a real network distance.
#[derive(Debug, Clone, Copy)]
pub struct DistanceRecord {
    pub distance: f32,
    /// Previous node id on the shortest path; `None` marks the source node.
    pub predecessor: Option<i64>,
}

/// A reconstructed shortest path from a POI's node to one reference point.
#[derive(Debug, Clone)]
pub struct Route {
    pub poi_id: String,
    pub ref_id: String,
    pub distance: f32,
    /// Coordinates in source-to-destination order.
    pub geometry: LineString<f64>,
}

// Heap entry ordered for a min-queue on tentative distance; equal distances
// pop in ascending node id order so results are reproducible.
struct NodeDistance {
    node_id: i64,
    node_idx: petgraph::graph::NodeIndex,
    metric: f32,
}

impl PartialOrd for NodeDistance {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDistance {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .metric
            .partial_cmp(&self.metric)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node_id.cmp(&self.node_id))
    }
}

impl PartialEq for NodeDistance {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NodeDistance {}

/// Single-source shortest paths via binary-heap Dijkstra.
///
/// Operates identically on the full graph or any extracted subgraph. The
/// result maps node id to its distance record; unreachable nodes are
/// excluded rather than reported with an infinite distance.
pub fn shortest_path_tree(
    graph: &NetworkGraph,
    source: i64,
) -> Result<HashMap<i64, DistanceRecord>> {
    let source_idx = graph.node_index(source).ok_or_else(|| {
        RoutingError::InvalidInput(format!("source node {} is not in the graph", source))
    })?;
    let node_count = graph.node_count();
    let mut dist = vec![f32::INFINITY; node_count];
    let mut pred: Vec<Option<i64>> = vec![None; node_count];
    let mut visited = vec![false; node_count];

    let mut active = BinaryHeap::new();
    dist[source_idx.index()] = 0.0;
    active.push(NodeDistance {
        node_id: source,
        node_idx: source_idx,
        metric: 0.0,
    });

    while let Some(NodeDistance {
        node_idx, metric, ..
    }) = active.pop()
    {
        if visited[node_idx.index()] {
            continue;
        }
        visited[node_idx.index()] = true;
        for edge_ref in graph.graph.edges_directed(node_idx, Direction::Outgoing) {
            let nb_idx = edge_ref.target();
            if visited[nb_idx.index()] {
                continue;
            }
            let total = metric + edge_ref.weight().weight;
            if total < dist[nb_idx.index()] {
                dist[nb_idx.index()] = total;
                pred[nb_idx.index()] = Some(graph.graph[node_idx].node_id);
                active.push(NodeDistance {
                    node_id: graph.graph[nb_idx].node_id,
                    node_idx: nb_idx,
                    metric: total,
                });
            }
        }
    }

    let mut tree = HashMap::with_capacity(node_count);
    for idx in graph.graph.node_indices() {
        if visited[idx.index()] {
            tree.insert(
                graph.graph[idx].node_id,
                DistanceRecord {
                    distance: dist[idx.index()],
                    predecessor: pred[idx.index()],
                },
            );
        }
    }
    Ok(tree)
}

/// An accepted local subgraph around a POI, together with the shortest-path
/// tree rooted at the POI's node.
pub struct PoiTree {
    pub subgraph: NetworkGraph,
    pub tree: HashMap<i64, DistanceRecord>,
    /// Buffer half-width at which the subgraph was accepted.
    pub buffer: f64,
    /// Extraction attempts consumed, including the accepted one.
    pub attempts: usize,
}

/// Carves a bounded local subgraph around a POI and roots a shortest-path
/// tree at its node, growing the box adaptively until the required
/// destination nodes are covered.
///
/// Containment of the POI node and every required node is checked first as a
/// cheap proxy; when `require_reachability` is set the subgraph is only
/// accepted once every required node actually appears in the shortest-path
/// tree. Exceeding the attempt bound fails this POI only.
pub fn extract_poi_tree(
    graph: &NetworkGraph,
    poi: &Poi,
    required_nodes: &[i64],
    config: &RoutingConfig,
) -> Result<PoiTree> {
    let mut buffer = poi.buffer;
    for attempt in 1..=config.max_expansion_attempts {
        let min = Coord {
            x: poi.x - buffer,
            y: poi.y - buffer,
        };
        let max = Coord {
            x: poi.x + buffer,
            y: poi.y + buffer,
        };
        let subgraph = graph.box_subgraph(min, max);
        let contained = subgraph.contains_node(poi.node_id)
            && required_nodes
                .iter()
                .all(|&node_id| subgraph.contains_node(node_id));
        if contained {
            let tree = shortest_path_tree(&subgraph, poi.node_id)?;
            let reached = !config.require_reachability
                || required_nodes.iter().all(|node_id| tree.contains_key(node_id));
            if reached {
                return Ok(PoiTree {
                    subgraph,
                    tree,
                    buffer,
                    attempts: attempt,
                });
            }
        }
        buffer = config.grow_buffer(buffer);
        log::debug!(
            "POI '{}': attempt {} did not cover required nodes, growing buffer to {}",
            poi.poi_id,
            attempt,
            buffer
        );
    }
    Err(RoutingError::SubgraphExpansionExceeded {
        poi_id: poi.poi_id.clone(),
        attempts: config.max_expansion_attempts,
        buffer,
    })
}

/// Walks predecessor links backward from `destination` to the tree root and
/// returns the path geometry in source-to-destination order. Length-1 paths
/// (destination equals the source) and destinations missing from the tree
/// yield `None`.
pub fn reconstruct_route(
    subgraph: &NetworkGraph,
    tree: &HashMap<i64, DistanceRecord>,
    destination: i64,
) -> Option<LineString<f64>> {
    let mut node_ids = Vec::new();
    let mut current = destination;
    loop {
        let record = tree.get(&current)?;
        node_ids.push(current);
        match record.predecessor {
            Some(pred) => current = pred,
            None => break,
        }
    }
    if node_ids.len() <= 1 {
        return None;
    }
    node_ids.reverse();
    let coords: Vec<Coord<f64>> = node_ids
        .iter()
        .filter_map(|&node_id| subgraph.coord(node_id))
        .collect();
    if coords.len() != node_ids.len() {
        // Tree and subgraph out of step; treat as no route.
        return None;
    }
    Some(LineString::new(coords))
}
