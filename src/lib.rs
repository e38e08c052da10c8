//! Road-network accessibility routing.
//!
//! Computes, for a large set of residential reference points (postcodes)
//! spread across a national road network, the shortest network distance to
//! the nearest instance of each of several POI categories (GPs, dentists,
//! retail centres): one minimum-distance value per reference point per
//! category.
//!
//! The pipeline per POI is snap, extract a bounded local subgraph, run
//! single-source Dijkstra, fold the resulting reference-point distances into
//! a running minimum, and optionally reconstruct route geometry for the k
//! nearest reference points. Inputs are clean in-memory node/edge/point
//! tables in a single planar coordinate system; file I/O, reprojection and
//! orchestration live with the callers.

mod accessibility;
mod common;
mod graph;
mod routing;
mod snap;

pub use accessibility::{
    AccessibilityEngine, CategoryResult, DistanceAggregator, RefDistance, SkippedPoi,
};
pub use common::{Result, RoutingConfig, RoutingError};
pub use graph::{EdgeRecord, NetworkGraph, NodeRecord};
pub use routing::{
    extract_poi_tree, reconstruct_route, shortest_path_tree, DistanceRecord, PoiTree, Route,
};
pub use snap::{prepare_pois, snap_to_network, Neighbor, Poi, PointIndex, PointRecord, ReferencePoint};
