use geo::Coord;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::common::{Result, RoutingError};
use crate::graph::NetworkGraph;

/// Raw POI or reference-point row: an identifier plus planar coordinates.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// A reference point (postcode) snapped onto the network. `node_id` is set
/// once here and never changed afterward.
#[derive(Debug, Clone)]
pub struct ReferencePoint {
    pub ref_id: String,
    pub x: f64,
    pub y: f64,
    pub node_id: i64,
}

/// A POI prepared for routing: snapped node, seeded buffer radius, and the
/// reference points its subgraph must reach.
#[derive(Debug, Clone)]
pub struct Poi {
    pub poi_id: String,
    pub x: f64,
    pub y: f64,
    pub node_id: i64,
    /// Half-width of the initial extraction box: the planar distance to this
    /// POI's k-th nearest reference point.
    pub buffer: f64,
    /// Ids of the k nearest reference points, ascending by distance.
    pub required_refs: Vec<String>,
}

/// A point with its position in the supplied slice, for R-tree queries.
#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    idx: usize,
    x: f64,
    y: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// A nearest-neighbour match: position in the indexed slice plus planar
/// Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub idx: usize,
    pub distance: f64,
}

/// Nearest-neighbour lookup over a fixed point set, built once and queried
/// many times.
///
/// Ties on distance resolve to the lower slice position, so callers that need
/// id-ordered tie-breaks supply their points sorted by id.
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
    len: usize,
}

impl PointIndex {
    pub fn build(coords: &[Coord<f64>]) -> Result<Self> {
        if coords.is_empty() {
            return Err(RoutingError::InvalidInput(
                "cannot build a spatial index over an empty point set".to_string(),
            ));
        }
        for (idx, coord) in coords.iter().enumerate() {
            if !coord.x.is_finite() || !coord.y.is_finite() {
                return Err(RoutingError::InvalidInput(format!(
                    "point {} has non-finite coordinates ({}, {})",
                    idx, coord.x, coord.y
                )));
            }
        }
        let indexed: Vec<IndexedPoint> = coords
            .iter()
            .enumerate()
            .map(|(idx, coord)| IndexedPoint {
                idx,
                x: coord.x,
                y: coord.y,
            })
            .collect();
        Ok(Self {
            tree: RTree::bulk_load(indexed),
            len: coords.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The k nearest indexed points to `query`, ascending by distance with
    /// ties broken by ascending slice position.
    pub fn nearest(&self, query: Coord<f64>, k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 || k > self.len {
            return Err(RoutingError::InvalidInput(format!(
                "k must be between 1 and the indexed point count ({}), got {}",
                self.len, k
            )));
        }
        if !query.x.is_finite() || !query.y.is_finite() {
            return Err(RoutingError::InvalidInput(format!(
                "query point has non-finite coordinates ({}, {})",
                query.x, query.y
            )));
        }
        // Pull candidates past the k-th entry while they remain tied on
        // distance, then order deterministically.
        let mut candidates: Vec<(usize, f64)> = Vec::with_capacity(k + 1);
        let mut kth_dist2 = f64::INFINITY;
        for (point, dist2) in self
            .tree
            .nearest_neighbor_iter_with_distance_2(&[query.x, query.y])
        {
            if candidates.len() >= k && dist2 > kth_dist2 {
                break;
            }
            candidates.push((point.idx, dist2));
            if candidates.len() == k {
                kth_dist2 = dist2;
            }
        }
        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        candidates.truncate(k);
        Ok(candidates
            .into_iter()
            .map(|(idx, dist2)| Neighbor {
                idx,
                distance: dist2.sqrt(),
            })
            .collect())
    }
}

/// Snaps each point to its nearest graph node by planar Euclidean distance.
/// Ties resolve to the smaller node id.
pub fn snap_to_network(graph: &NetworkGraph, points: &[PointRecord]) -> Result<Vec<ReferencePoint>> {
    if points.is_empty() {
        return Err(RoutingError::InvalidInput(
            "cannot snap an empty point set".to_string(),
        ));
    }
    let node_payloads = graph.nodes_sorted_by_id();
    let node_coords: Vec<Coord<f64>> = node_payloads.iter().map(|payload| payload.coord).collect();
    let index = PointIndex::build(&node_coords)?;
    let mut snapped = Vec::with_capacity(points.len());
    for point in points {
        let nearest = index.nearest(
            Coord {
                x: point.x,
                y: point.y,
            },
            1,
        )?;
        snapped.push(ReferencePoint {
            ref_id: point.id.clone(),
            x: point.x,
            y: point.y,
            node_id: node_payloads[nearest[0].idx].node_id,
        });
    }
    Ok(snapped)
}

/// Prepares a POI table for routing: snaps each POI to its nearest graph
/// node, then seeds its buffer radius with the distance to its k-th nearest
/// reference point and records those k reference ids as the destinations its
/// subgraph must reach.
pub fn prepare_pois(
    graph: &NetworkGraph,
    pois: &[PointRecord],
    reference_points: &[ReferencePoint],
    k: usize,
) -> Result<Vec<Poi>> {
    if pois.is_empty() {
        return Err(RoutingError::InvalidInput("POI table is empty".to_string()));
    }
    if reference_points.is_empty() {
        return Err(RoutingError::InvalidInput(
            "reference point set is empty".to_string(),
        ));
    }
    if k == 0 || k > reference_points.len() {
        return Err(RoutingError::InvalidInput(format!(
            "k must be between 1 and the reference point count ({}), got {}",
            reference_points.len(),
            k
        )));
    }
    let snapped = snap_to_network(graph, pois)?;

    // Index reference points in ascending ref_id order so equal-distance ties
    // resolve to the smaller reference id.
    let mut ref_order: Vec<usize> = (0..reference_points.len()).collect();
    ref_order.sort_by(|&a, &b| reference_points[a].ref_id.cmp(&reference_points[b].ref_id));
    let ref_coords: Vec<Coord<f64>> = ref_order
        .iter()
        .map(|&idx| Coord {
            x: reference_points[idx].x,
            y: reference_points[idx].y,
        })
        .collect();
    let ref_index = PointIndex::build(&ref_coords)?;

    let mut prepared = Vec::with_capacity(pois.len());
    for (point, snap) in pois.iter().zip(snapped) {
        let neighbors = ref_index.nearest(
            Coord {
                x: point.x,
                y: point.y,
            },
            k,
        )?;
        let buffer = neighbors[k - 1].distance;
        let required_refs = neighbors
            .iter()
            .map(|neighbor| reference_points[ref_order[neighbor.idx]].ref_id.clone())
            .collect();
        prepared.push(Poi {
            poi_id: point.id.clone(),
            x: point.x,
            y: point.y,
            node_id: snap.node_id,
            buffer,
            required_refs,
        });
    }
    log::debug!(
        "prepared {} POIs against {} reference points (k={})",
        prepared.len(),
        reference_points.len(),
        k
    );
    Ok(prepared)
}
