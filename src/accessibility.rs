use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::common::{Result, RoutingConfig, RoutingError};
use crate::graph::NetworkGraph;
use crate::routing::{extract_poi_tree, reconstruct_route, Route};
use crate::snap::{prepare_pois, snap_to_network, Poi, PointRecord, ReferencePoint};

/// Aggregated output row: one per reference point, in the order the
/// reference points were supplied. `None` means no POI in the category could
/// reach this reference point.
#[derive(Debug, Clone)]
pub struct RefDistance {
    pub ref_id: String,
    pub distance: Option<f32>,
    /// POI achieving the minimum; on exactly equal distances the smaller POI
    /// id wins, so the value is independent of processing order.
    pub nearest_poi: Option<String>,
}

/// A POI dropped from the batch, with the error that isolated it.
#[derive(Debug, Clone)]
pub struct SkippedPoi {
    pub poi_id: String,
    pub error: RoutingError,
}

/// Result of evaluating one POI category.
pub struct CategoryResult {
    pub distances: Vec<RefDistance>,
    pub routes: Vec<Route>,
    pub skipped: Vec<SkippedPoi>,
}

/// Running minimum network distance per reference point across a POI batch.
///
/// Values start at infinity and only ever decrease; folding is commutative,
/// so the final state is independent of the order POIs are merged in.
pub struct DistanceAggregator {
    best: Vec<(f32, Option<String>)>,
}

impl DistanceAggregator {
    pub fn new(reference_count: usize) -> Self {
        Self {
            best: vec![(f32::INFINITY, None); reference_count],
        }
    }

    /// Folds one POI's reference-point distances into the running minima.
    /// Larger distances for an already-settled reference point are discarded.
    pub fn fold(&mut self, poi_id: &str, ref_dists: &[(usize, f32)]) {
        for &(ref_idx, distance) in ref_dists {
            let (current, current_poi) = &mut self.best[ref_idx];
            let wins = distance < *current
                || (distance == *current
                    && current_poi
                        .as_deref()
                        .map_or(true, |existing| poi_id < existing));
            if wins {
                *current = distance;
                *current_poi = Some(poi_id.to_string());
            }
        }
    }

    /// Minimum distance currently held for a reference point.
    pub fn distance(&self, ref_idx: usize) -> f32 {
        self.best[ref_idx].0
    }

    /// One row per reference point; unreachable points are reported with
    /// `distance: None` rather than omitted.
    pub fn finish(self, reference_points: &[ReferencePoint]) -> Vec<RefDistance> {
        self.best
            .into_iter()
            .zip(reference_points)
            .map(|((distance, nearest_poi), reference)| RefDistance {
                ref_id: reference.ref_id.clone(),
                distance: distance.is_finite().then_some(distance),
                nearest_poi,
            })
            .collect()
    }
}

// Per-POI result produced by the parallel map phase, merged sequentially.
struct PoiOutcome {
    poi_id: String,
    ref_dists: Vec<(usize, f32)>,
    routes: Vec<Route>,
}

/// Accessibility engine: computes, per POI category, the shortest network
/// distance from every reference point to its nearest POI.
///
/// The graph and reference set are snapped once at construction; each POI's
/// pipeline (extract subgraph, shortest paths, optional routes) is a pure
/// function of that immutable state, run on rayon workers and merged into the
/// aggregator in a sequential reduction pass.
pub struct AccessibilityEngine {
    graph: NetworkGraph,
    reference_points: Vec<ReferencePoint>,
    node_to_refs: HashMap<i64, Vec<usize>>,
    ref_id_to_node: HashMap<String, i64>,
    config: RoutingConfig,
    progress: Arc<AtomicUsize>,
}

impl AccessibilityEngine {
    pub fn new(
        graph: NetworkGraph,
        reference_points: &[PointRecord],
        config: RoutingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let reference_points = snap_to_network(&graph, reference_points)?;
        let mut node_to_refs: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut ref_id_to_node = HashMap::with_capacity(reference_points.len());
        for (ref_idx, reference) in reference_points.iter().enumerate() {
            node_to_refs
                .entry(reference.node_id)
                .or_default()
                .push(ref_idx);
            if ref_id_to_node
                .insert(reference.ref_id.clone(), reference.node_id)
                .is_some()
            {
                return Err(RoutingError::InvalidInput(format!(
                    "duplicate reference point id '{}'",
                    reference.ref_id
                )));
            }
        }
        log::info!(
            "engine ready: {} nodes, {} edges, {} reference points",
            graph.node_count(),
            graph.edge_count(),
            reference_points.len()
        );
        Ok(Self {
            graph,
            reference_points,
            node_to_refs,
            ref_id_to_node,
            config,
            progress: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn reference_points(&self) -> &[ReferencePoint] {
        &self.reference_points
    }

    /// Snaps a raw POI table and seeds buffers from the k-th nearest
    /// reference point.
    pub fn prepare_pois(&self, pois: &[PointRecord], k: usize) -> Result<Vec<Poi>> {
        prepare_pois(&self.graph, pois, &self.reference_points, k)
    }

    pub fn progress_init(&self) {
        self.progress.store(0, AtomicOrdering::Relaxed);
    }

    /// POIs processed so far in the current batch.
    pub fn progress(&self) -> usize {
        self.progress.load(AtomicOrdering::Relaxed)
    }

    /// Evaluates one POI category: shortest-path distances from every POI,
    /// folded into per-reference-point minima. POIs whose subgraph expansion
    /// exceeds the retry bound are skipped and reported; structural input
    /// errors abort before any per-POI work.
    pub fn evaluate_category(&self, pois: &[Poi], with_routes: bool) -> Result<CategoryResult> {
        if pois.is_empty() {
            return Err(RoutingError::InvalidInput("POI batch is empty".to_string()));
        }
        for poi in pois {
            if !self.graph.contains_node(poi.node_id) {
                return Err(RoutingError::InvalidInput(format!(
                    "POI '{}' snapped to node {} which is not in the graph",
                    poi.poi_id, poi.node_id
                )));
            }
            for ref_id in &poi.required_refs {
                if !self.ref_id_to_node.contains_key(ref_id) {
                    return Err(RoutingError::InvalidInput(format!(
                        "POI '{}' requires unknown reference point '{}'",
                        poi.poi_id, ref_id
                    )));
                }
            }
        }
        let pois = self.merge_by_node(pois);
        self.progress_init();

        // Parallel map phase: each POI pipeline reads only immutable state.
        let outcomes: Vec<Result<PoiOutcome>> = pois
            .par_iter()
            .map(|poi| {
                self.progress.fetch_add(1, AtomicOrdering::Relaxed);
                self.process_poi(poi, with_routes)
            })
            .collect();

        // Sequential reduction phase: the single writer to the aggregator.
        let mut aggregator = DistanceAggregator::new(self.reference_points.len());
        let mut routes = Vec::new();
        let mut skipped = Vec::new();
        for (poi, outcome) in pois.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    aggregator.fold(&outcome.poi_id, &outcome.ref_dists);
                    routes.extend(outcome.routes);
                }
                Err(error @ RoutingError::SubgraphExpansionExceeded { .. }) => {
                    log::warn!("skipping POI '{}': {}", poi.poi_id, error);
                    skipped.push(SkippedPoi {
                        poi_id: poi.poi_id.clone(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
        }
        Ok(CategoryResult {
            distances: aggregator.finish(&self.reference_points),
            routes,
            skipped,
        })
    }

    // POIs sharing a snapped node are interchangeable for routing; merge them
    // keeping the smallest poi_id, the widest buffer, and the union of
    // required reference ids.
    fn merge_by_node(&self, pois: &[Poi]) -> Vec<Poi> {
        let mut sorted: Vec<&Poi> = pois.iter().collect();
        sorted.sort_by(|a, b| a.poi_id.cmp(&b.poi_id));
        let mut merged: Vec<Poi> = Vec::with_capacity(sorted.len());
        let mut by_node: HashMap<i64, usize> = HashMap::with_capacity(sorted.len());
        for poi in sorted {
            match by_node.get(&poi.node_id) {
                Some(&slot) => {
                    let kept = &mut merged[slot];
                    kept.buffer = kept.buffer.max(poi.buffer);
                    let seen: HashSet<&String> = kept.required_refs.iter().collect();
                    let extra: Vec<String> = poi
                        .required_refs
                        .iter()
                        .filter(|ref_id| !seen.contains(ref_id))
                        .cloned()
                        .collect();
                    kept.required_refs.extend(extra);
                }
                None => {
                    by_node.insert(poi.node_id, merged.len());
                    merged.push(poi.clone());
                }
            }
        }
        if merged.len() < pois.len() {
            log::debug!(
                "merged {} POIs sharing snapped nodes; {} remain",
                pois.len() - merged.len(),
                merged.len()
            );
        }
        merged
    }

    fn process_poi(&self, poi: &Poi, with_routes: bool) -> Result<PoiOutcome> {
        let required_nodes: Vec<i64> = poi
            .required_refs
            .iter()
            .map(|ref_id| self.ref_id_to_node[ref_id])
            .collect();
        let result = extract_poi_tree(&self.graph, poi, &required_nodes, &self.config)?;

        let mut ref_dists: Vec<(usize, f32)> = Vec::new();
        for (node_id, record) in &result.tree {
            if let Some(ref_indices) = self.node_to_refs.get(node_id) {
                for &ref_idx in ref_indices {
                    ref_dists.push((ref_idx, record.distance));
                }
            }
        }

        let routes = if with_routes {
            let mut candidates = ref_dists.clone();
            candidates.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        self.reference_points[a.0]
                            .ref_id
                            .cmp(&self.reference_points[b.0].ref_id)
                    })
            });
            candidates
                .into_iter()
                .take(self.config.num_routes)
                .filter_map(|(ref_idx, distance)| {
                    let reference = &self.reference_points[ref_idx];
                    reconstruct_route(&result.subgraph, &result.tree, reference.node_id).map(
                        |geometry| Route {
                            poi_id: poi.poi_id.clone(),
                            ref_id: reference.ref_id.clone(),
                            distance,
                            geometry,
                        },
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(PoiOutcome {
            poi_id: poi.poi_id.clone(),
            ref_dists,
            routes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeRecord, NodeRecord};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn point(id: &str, x: f64, y: f64) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            x,
            y,
        }
    }

    // A--B--C--D--E with unit weights, nodes 100 apart on the x axis.
    fn path_graph() -> NetworkGraph {
        let nodes: Vec<NodeRecord> = (0..5)
            .map(|i| NodeRecord {
                node_id: i,
                x: i as f64 * 100.0,
                y: 0.0,
            })
            .collect();
        let edges: Vec<EdgeRecord> = (0..4)
            .map(|i| EdgeRecord {
                source: i,
                target: i + 1,
                weight: 1.0,
            })
            .collect();
        NetworkGraph::from_tables(&nodes, &edges, false).unwrap()
    }

    fn path_engine() -> AccessibilityEngine {
        // Reference points at nodes B and D.
        AccessibilityEngine::new(
            path_graph(),
            &[point("rB", 100.0, 0.0), point("rD", 300.0, 0.0)],
            RoutingConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_aggregator_monotonic_and_order_independent() {
        let folds: Vec<(&str, Vec<(usize, f32)>)> = vec![
            ("p1", vec![(0, 5.0), (1, 2.0)]),
            ("p2", vec![(0, 3.0), (2, 9.0)]),
            ("p3", vec![(0, 7.0), (1, 2.5), (2, 4.0)]),
        ];
        let mut baseline = DistanceAggregator::new(3);
        for (poi_id, dists) in &folds {
            let before: Vec<f32> = (0..3).map(|i| baseline.distance(i)).collect();
            baseline.fold(poi_id, dists);
            for i in 0..3 {
                assert!(baseline.distance(i) <= before[i]);
            }
        }
        let expected: Vec<f32> = (0..3).map(|i| baseline.distance(i)).collect();
        assert_eq!(expected, vec![3.0, 2.0, 4.0]);

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let mut shuffled = folds.clone();
            shuffled.shuffle(&mut rng);
            let mut aggregator = DistanceAggregator::new(3);
            for (poi_id, dists) in &shuffled {
                aggregator.fold(poi_id, dists);
            }
            let got: Vec<f32> = (0..3).map(|i| aggregator.distance(i)).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_aggregator_equal_distance_smaller_poi_id_wins() {
        let refs = vec![ReferencePoint {
            ref_id: "r".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
        }];
        for order in [["pb", "pa"], ["pa", "pb"]] {
            let mut aggregator = DistanceAggregator::new(1);
            for poi_id in order {
                aggregator.fold(poi_id, &[(0, 4.0)]);
            }
            let rows = aggregator.finish(&refs);
            assert_eq!(rows[0].distance, Some(4.0));
            assert_eq!(rows[0].nearest_poi.as_deref(), Some("pa"));
        }
    }

    #[test]
    fn test_end_to_end_buffer_expansion() {
        let engine = path_engine();
        // Initial buffer covers only A-B; first extraction misses D, the
        // second succeeds after one growth step.
        let poi = Poi {
            poi_id: "gp1".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
            buffer: 120.0,
            required_refs: vec!["rB".to_string(), "rD".to_string()],
        };
        let result = engine.evaluate_category(&[poi], false).unwrap();
        assert!(result.skipped.is_empty());
        let by_id: HashMap<&str, &RefDistance> = result
            .distances
            .iter()
            .map(|row| (row.ref_id.as_str(), row))
            .collect();
        assert_eq!(by_id["rB"].distance, Some(1.0));
        assert_eq!(by_id["rD"].distance, Some(3.0));
    }

    #[test]
    fn test_minimum_across_pois_retained() {
        // POI at A reaches rD at distance 3 via the network; POI at E reaches
        // rD at distance 1. The aggregate keeps 1, never 3.
        let engine = path_engine();
        let pois = engine
            .prepare_pois(&[point("pA", 0.0, 0.0), point("pE", 400.0, 0.0)], 2)
            .unwrap();
        let result = engine.evaluate_category(&pois, false).unwrap();
        let by_id: HashMap<&str, &RefDistance> = result
            .distances
            .iter()
            .map(|row| (row.ref_id.as_str(), row))
            .collect();
        assert_eq!(by_id["rD"].distance, Some(1.0));
        assert_eq!(by_id["rD"].nearest_poi.as_deref(), Some("pE"));
        assert_eq!(by_id["rB"].distance, Some(1.0));
        assert_eq!(by_id["rB"].nearest_poi.as_deref(), Some("pA"));
    }

    #[test]
    fn test_unreachable_reference_reported_not_omitted() {
        // Disconnected pair F--G carrying a reference point no POI can reach.
        let nodes: Vec<NodeRecord> = vec![
            NodeRecord {
                node_id: 0,
                x: 0.0,
                y: 0.0,
            },
            NodeRecord {
                node_id: 1,
                x: 100.0,
                y: 0.0,
            },
            NodeRecord {
                node_id: 2,
                x: 0.0,
                y: 500.0,
            },
            NodeRecord {
                node_id: 3,
                x: 100.0,
                y: 500.0,
            },
        ];
        let edges = vec![
            EdgeRecord {
                source: 0,
                target: 1,
                weight: 1.0,
            },
            EdgeRecord {
                source: 2,
                target: 3,
                weight: 1.0,
            },
        ];
        let graph = NetworkGraph::from_tables(&nodes, &edges, false).unwrap();
        let engine = AccessibilityEngine::new(
            graph,
            &[point("near", 100.0, 0.0), point("far", 100.0, 500.0)],
            RoutingConfig::default(),
        )
        .unwrap();
        let poi = Poi {
            poi_id: "p1".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
            buffer: 150.0,
            required_refs: vec!["near".to_string()],
        };
        let result = engine.evaluate_category(&[poi], false).unwrap();
        assert_eq!(result.distances.len(), 2);
        let by_id: HashMap<&str, &RefDistance> = result
            .distances
            .iter()
            .map(|row| (row.ref_id.as_str(), row))
            .collect();
        assert_eq!(by_id["near"].distance, Some(1.0));
        assert_eq!(by_id["far"].distance, None);
        assert!(by_id["far"].nearest_poi.is_none());
    }

    #[test]
    fn test_expansion_failure_skips_poi_but_batch_continues() {
        let good = Poi {
            poi_id: "good".to_string(),
            x: 400.0,
            y: 0.0,
            node_id: 4,
            buffer: 500.0,
            required_refs: vec!["rB".to_string(), "rD".to_string()],
        };
        // Requires rD but its buffer cannot grow far enough within the bound.
        let doomed = Poi {
            poi_id: "doomed".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
            buffer: 1.0,
            required_refs: vec!["rD".to_string()],
        };
        let config = RoutingConfig {
            buffer_increment: 1.0,
            buffer_growth: 1.5,
            max_expansion_attempts: 2,
            ..RoutingConfig::default()
        };
        let engine = AccessibilityEngine::new(
            path_graph(),
            &[point("rB", 100.0, 0.0), point("rD", 300.0, 0.0)],
            config,
        )
        .unwrap();
        let result = engine.evaluate_category(&[good, doomed], false).unwrap();
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].poi_id, "doomed");
        let by_id: HashMap<&str, &RefDistance> = result
            .distances
            .iter()
            .map(|row| (row.ref_id.as_str(), row))
            .collect();
        // The good POI still contributes.
        assert_eq!(by_id["rD"].distance, Some(1.0));
        assert_eq!(by_id["rB"].distance, Some(3.0));
    }

    #[test]
    fn test_routes_for_nearest_references() {
        let engine = path_engine();
        let pois = engine.prepare_pois(&[point("pA", 0.0, 0.0)], 2).unwrap();
        let result = engine.evaluate_category(&pois, true).unwrap();
        assert_eq!(result.routes.len(), 2);
        // Ranked ascending by distance: rB before rD.
        assert_eq!(result.routes[0].ref_id, "rB");
        assert_eq!(result.routes[1].ref_id, "rD");
        let xs: Vec<f64> = result.routes[1].geometry.coords().map(|c| c.x).collect();
        assert_eq!(xs, vec![0.0, 100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_route_to_own_node_excluded() {
        // Reference point colocated with the POI's node: distance 0 but the
        // length-1 path is dropped from route output.
        let engine = AccessibilityEngine::new(
            path_graph(),
            &[point("rA", 0.0, 0.0), point("rB", 100.0, 0.0)],
            RoutingConfig::default(),
        )
        .unwrap();
        let pois = engine.prepare_pois(&[point("pA", 0.0, 0.0)], 2).unwrap();
        let result = engine.evaluate_category(&pois, true).unwrap();
        let by_id: HashMap<&str, &RefDistance> = result
            .distances
            .iter()
            .map(|row| (row.ref_id.as_str(), row))
            .collect();
        assert_eq!(by_id["rA"].distance, Some(0.0));
        assert!(result.routes.iter().all(|route| route.ref_id != "rA"));
        assert!(result.routes.iter().any(|route| route.ref_id == "rB"));
    }

    #[test]
    fn test_pois_sharing_node_merged() {
        let engine = path_engine();
        let make = |id: &str, buffer: f64, refs: &[&str]| Poi {
            poi_id: id.to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
            buffer,
            required_refs: refs.iter().map(|s| s.to_string()).collect(),
        };
        let merged = engine.merge_by_node(&[
            make("p2", 150.0, &["rD"]),
            make("p1", 120.0, &["rB"]),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].poi_id, "p1");
        assert_eq!(merged[0].buffer, 150.0);
        assert_eq!(merged[0].required_refs, vec!["rB", "rD"]);
    }

    #[test]
    fn test_structural_errors_abort_batch() {
        let engine = path_engine();
        assert!(matches!(
            engine.evaluate_category(&[], false),
            Err(RoutingError::InvalidInput(_))
        ));
        let bad_ref = Poi {
            poi_id: "p".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 0,
            buffer: 100.0,
            required_refs: vec!["nope".to_string()],
        };
        assert!(matches!(
            engine.evaluate_category(&[bad_ref], false),
            Err(RoutingError::InvalidInput(_))
        ));
        let bad_node = Poi {
            poi_id: "p".to_string(),
            x: 0.0,
            y: 0.0,
            node_id: 99,
            buffer: 100.0,
            required_refs: Vec::new(),
        };
        assert!(matches!(
            engine.evaluate_category(&[bad_node], false),
            Err(RoutingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_batch_order_independent() {
        let engine = path_engine();
        let pois = engine
            .prepare_pois(
                &[
                    point("pA", 0.0, 0.0),
                    point("pC", 200.0, 0.0),
                    point("pE", 400.0, 0.0),
                ],
                2,
            )
            .unwrap();
        let forward = engine.evaluate_category(&pois, false).unwrap();
        let mut reversed_pois = pois.clone();
        reversed_pois.reverse();
        let reversed = engine.evaluate_category(&reversed_pois, false).unwrap();
        for (a, b) in forward.distances.iter().zip(&reversed.distances) {
            assert_eq!(a.ref_id, b.ref_id);
            assert_eq!(a.distance, b.distance);
            assert_eq!(a.nearest_poi, b.nearest_poi);
        }
    }
}
