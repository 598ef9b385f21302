//! Per-run conflation context.
//!
//! The conflator owns every store of a run: the way graph, the segment
//! arena, the cell index, the match index and the observer registry. All
//! structural changes go through it, so each change event reaches exactly
//! the observers registered for the changed container.

use geo::Coord;
use indicatif::ProgressBar;
use log::{debug, info, trace, warn};
use petgraph::algo::has_path_connecting;
use petgraph::prelude::UnGraphMap;
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::cell_index::CellIndex;
use crate::config::ConflatorConfig;
use crate::debug::DebugVisualizer;
use crate::error::{ConflationError, Result};
use crate::geometry::{LocalProjection, Region, distance_meters, project_onto_segment};
use crate::io::{RouteInput, StopInput};
use crate::line_match::{IndexChanges, MatchIndex};
use crate::network::{NodeId, OsmNode, OsmWay, WayGraph, WayId};
use crate::observer::{ContainerEvent, Observer, ObserverRegistry};
use crate::path_segment::LegContext;
use crate::path_tree::{PathTree, WayTraversal};
use crate::segments::{ContainerId, SegmentId, SegmentKind, SegmentStore};

type NodePoint = GeomWithData<[f64; 2], NodeId>;

/// Why a leg has no path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegFailure {
    /// One of the two stops could not be tied to the network
    UnattachedStop,
    /// Both stops sit on the same node
    DegenerateLeg,
    /// No chain of ways connects the two stops
    Unreachable,
    /// The search found no path following the route line
    NoPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LegOutcome {
    Found { ways: Vec<WayTraversal>, score: f64 },
    Failed { reason: LegFailure },
}

impl LegOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, LegOutcome::Found { .. })
    }

    pub fn ways(&self) -> &[WayTraversal] {
        match self {
            LegOutcome::Found { ways, .. } => ways,
            LegOutcome::Failed { .. } => &[],
        }
    }

    pub fn failure(&self) -> Option<LegFailure> {
        match self {
            LegOutcome::Found { .. } => None,
            LegOutcome::Failed { reason } => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LegResult {
    pub from_stop: String,
    pub to_stop: String,
    #[serde(flatten)]
    pub outcome: LegOutcome,
}

/// Aggregate match quality of one way against one route line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WayMatchQuality {
    pub way_id: WayId,
    pub matched_route_segments: usize,
    pub mean_dot_product: f64,
    pub mean_orthogonal_distance: f64,
    pub mean_mid_point_distance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub route_id: String,
    /// Set when the route could not be processed at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub legs: Vec<LegResult>,
    pub way_quality: Vec<WayMatchQuality>,
}

impl RouteResult {
    fn failed(route: &RouteInput, error: &ConflationError) -> Self {
        Self {
            route_id: route.id.clone(),
            error: Some(error.to_string()),
            legs: Vec::new(),
            way_quality: Vec::new(),
        }
    }

    pub fn found_legs(&self) -> usize {
        self.legs.iter().filter(|l| l.outcome.is_found()).count()
    }
}

/// Nodes created and ways changed during the run
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkChanges {
    pub new_nodes: Vec<OsmNode>,
    pub ways: Vec<OsmWay>,
}

pub struct Conflator {
    config: ConflatorConfig,
    graph: WayGraph,
    store: SegmentStore,
    cells: CellIndex,
    matches: MatchIndex,
    registry: ObserverRegistry,
    /// Path trees of the route being conflated, one per searched leg
    trees: HashMap<ContainerId, Vec<PathTree>>,
    projection: LocalProjection,
    node_tree: RTree<NodePoint>,
    created_nodes: Vec<NodeId>,
    changed_ways: BTreeSet<WayId>,
    capture_debug: bool,
    debug_features: Vec<serde_json::Value>,
}

impl Conflator {
    /// Segments every eligible way of `graph` and indexes it
    pub fn new(graph: WayGraph, config: ConflatorConfig) -> Result<Self> {
        config.validate()?;
        let start = Instant::now();

        let mut store = SegmentStore::new(
            config.comparison.max_segment_length,
            config.comparison.bounding_box_size,
        );
        let eligible: Vec<WayId> = graph
            .ways()
            .filter(|w| config.way_filter.accepts(w))
            .map(|w| w.id)
            .collect();
        let mut containers = Vec::with_capacity(eligible.len());
        for way in &eligible {
            containers.push(store.create_network_container(&graph, *way)?);
        }

        let bounds = containers
            .iter()
            .filter_map(|c| store.container(*c))
            .map(|c| c.bounds())
            .reduce(|a, b| a.union(&b))
            .unwrap_or_else(|| {
                let anywhere = graph.nodes().next().map(|n| n.coord());
                Region::around(anywhere.unwrap_or(Coord { x: 0.0, y: 0.0 }))
            });
        let mut cells = CellIndex::new(bounds, config.cell_size, config.cell_search_buffer);
        let mut registry = ObserverRegistry::new();
        for id in &containers {
            if let Some(container) = store.container(*id) {
                cells.add_container(*id, container.search_bounds());
            }
            registry.register(*id, Observer::CellIndex);
        }

        let projection = LocalProjection::at_latitude(bounds.centroid().y);
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        for way in eligible.iter().filter_map(|w| graph.way(*w)) {
            for node in &way.nodes {
                if !seen.insert(*node) {
                    continue;
                }
                if let Some(coord) = graph.coord(*node) {
                    let p = projection.to_local(coord);
                    points.push(NodePoint::new([p.x, p.y], *node));
                }
            }
        }
        let node_tree = RTree::bulk_load(points);

        info!(
            "Indexed {} of {} ways ({} nodes) in {:.2?}",
            containers.len(),
            graph.way_count(),
            seen.len(),
            start.elapsed()
        );
        let matches = MatchIndex::new(config.comparison.clone());
        Ok(Self {
            config,
            graph,
            store,
            cells,
            matches,
            registry,
            trees: HashMap::new(),
            projection,
            node_tree,
            created_nodes: Vec::new(),
            changed_ways: BTreeSet::new(),
            capture_debug: false,
            debug_features: Vec::new(),
        })
    }

    pub fn config(&self) -> &ConflatorConfig {
        &self.config
    }

    pub fn graph(&self) -> &WayGraph {
        &self.graph
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn cells(&self) -> &CellIndex {
        &self.cells
    }

    pub fn matches(&self) -> &MatchIndex {
        &self.matches
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    /// Keeps GeoJSON features of every route's best matches
    pub fn set_capture_debug(&mut self, enabled: bool) {
        self.capture_debug = enabled;
    }

    pub fn debug_features(&self) -> &[serde_json::Value] {
        &self.debug_features
    }

    pub fn network_changes(&self) -> NetworkChanges {
        NetworkChanges {
            new_nodes: self
                .created_nodes
                .iter()
                .filter_map(|n| self.graph.node(*n))
                .cloned()
                .collect(),
            ways: self
                .changed_ways
                .iter()
                .filter_map(|w| self.graph.way(*w))
                .cloned()
                .collect(),
        }
    }

    /// Conflates every route in turn; a failing route never stops the batch
    pub fn conflate_all(&mut self, routes: &[RouteInput], progress: Option<&ProgressBar>) -> Vec<RouteResult> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(routes.len());
        for route in routes {
            results.push(self.conflate_route(route));
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        let legs: usize = results.iter().map(|r| r.legs.len()).sum();
        let found: usize = results.iter().map(|r| r.found_legs()).sum();
        info!(
            "Conflated {} routes, {}/{} legs matched in {:.2?}",
            results.len(),
            found,
            legs,
            start.elapsed()
        );
        results
    }

    /// Matches one route against the network and resolves a way path for
    /// every leg between consecutive stops
    pub fn conflate_route(&mut self, route: &RouteInput) -> RouteResult {
        let start = Instant::now();
        let container = match self.open_route(route) {
            Ok(container) => container,
            Err(e) => {
                warn!("Route {} skipped: {}", route.id, e);
                return RouteResult::failed(route, &e);
            }
        };

        let result = self.run_route(route, container);
        if self.capture_debug {
            let features = DebugVisualizer::match_features(&self.store, &self.matches, container, &route.id);
            self.debug_features.extend(features);
        }
        let released = self.release_route(container);

        match result.and_then(|r| released.map(|_| r)) {
            Ok(result) => {
                info!(
                    "Route {}: {}/{} legs matched in {:.2?}",
                    route.id,
                    result.found_legs(),
                    result.legs.len(),
                    start.elapsed()
                );
                result
            }
            Err(e) => {
                warn!("Route {} failed: {}", route.id, e);
                RouteResult::failed(route, &e)
            }
        }
    }

    fn open_route(&mut self, route: &RouteInput) -> Result<ContainerId> {
        let invalid = |reason: &str| ConflationError::InvalidRoute {
            route: route.id.clone(),
            reason: reason.to_string(),
        };
        if route.shape.len() < 2 {
            return Err(invalid("shape needs at least two points"));
        }
        if route.shape.iter().flatten().any(|v| !v.is_finite()) {
            return Err(invalid("shape has a non-finite coordinate"));
        }
        if route.stops.iter().any(|s| !s.lon.is_finite() || !s.lat.is_finite()) {
            return Err(invalid("stop has a non-finite coordinate"));
        }
        let container = self
            .store
            .create_route_container(&route.id, &route.shape_coords())?;
        self.registry
            .register(container, Observer::RouteLine(container));
        Ok(container)
    }

    fn run_route(&mut self, route: &RouteInput, container: ContainerId) -> Result<RouteResult> {
        // Step 1: match the route line against the network
        let start = Instant::now();
        let changes = self
            .matches
            .match_route(container, &self.store, &self.cells)?;
        self.apply_changes(&changes);
        if self.config.check_integrity {
            self.verify_integrity()?;
        }
        debug!(
            "Route {} matched against {} ways in {:.2?}",
            route.id,
            self.matches.line_matches_for_route(container).len(),
            start.elapsed()
        );

        // Step 2: tie every stop to a network node
        let mut stop_nodes = Vec::with_capacity(route.stops.len());
        for stop in &route.stops {
            stop_nodes.push(self.attach_stop(stop)?);
        }

        // Step 3: locate the stops along the route line
        let route_segments = self
            .store
            .container(container)
            .ok_or(ConflationError::UnknownContainer(container))?
            .segment_ids()
            .to_vec();
        let positions = self.locate_stops(&route.stops, &route_segments);

        // Step 4: search every leg
        let connectivity = self.connectivity();
        let k = self.config.comparison.future_vector_segments;
        let mut trees = Vec::new();
        let mut leg_states: Vec<std::result::Result<usize, LegFailure>> = Vec::new();
        for i in 0..route.stops.len().saturating_sub(1) {
            let state = match (stop_nodes[i], stop_nodes[i + 1]) {
                (None, _) | (_, None) => Err(LegFailure::UnattachedStop),
                (Some(a), Some(b)) if a == b => Err(LegFailure::DegenerateLeg),
                (Some(a), Some(b)) if !reachable(&connectivity, a, b) => Err(LegFailure::Unreachable),
                (Some(a), Some(b)) => {
                    let end = (positions[i + 1] + k + 1).min(route_segments.len());
                    let mut tree = PathTree::new(container, a, b, positions[i]..end);
                    let ctx = LegContext {
                        store: &self.store,
                        graph: &self.graph,
                        matches: &self.matches,
                        config: &self.config,
                        route: container,
                        route_segments: &route_segments,
                        destination_node: b,
                    };
                    tree.search(&ctx);
                    trees.push(tree);
                    Ok(trees.len() - 1)
                }
            };
            leg_states.push(state);
        }
        self.trees.insert(container, trees);

        // Step 5: split ways where the paths enter or leave them mid-way
        if self.config.split_ways_at_path_ends {
            self.split_at_path_ends(container);
        }

        // Step 6: collect the results, with post-split way ids
        let trees = self.trees.get(&container);
        let mut legs = Vec::with_capacity(leg_states.len());
        for (i, state) in leg_states.iter().enumerate() {
            let found = state.as_ref().ok().and_then(|t| {
                let tree = trees?.get(*t)?;
                let path = tree.best_path()?;
                Some((tree.traversals(path, &self.store), tree.best_score()?))
            });
            let outcome = match (state, found) {
                (Err(reason), _) => LegOutcome::Failed { reason: *reason },
                (Ok(_), Some((ways, score))) if !ways.is_empty() => LegOutcome::Found { ways, score },
                (Ok(_), _) => LegOutcome::Failed {
                    reason: LegFailure::NoPath,
                },
            };
            if let Some(reason) = outcome.failure() {
                warn!(
                    "Route {} leg {} -> {}: {:?}",
                    route.id, route.stops[i].id, route.stops[i + 1].id, reason
                );
            }
            legs.push(LegResult {
                from_stop: route.stops[i].id.clone(),
                to_stop: route.stops[i + 1].id.clone(),
                outcome,
            });
        }

        Ok(RouteResult {
            route_id: route.id.clone(),
            error: None,
            legs,
            way_quality: self.way_quality(container),
        })
    }

    fn way_quality(&self, route: ContainerId) -> Vec<WayMatchQuality> {
        let mut quality: Vec<WayMatchQuality> = self
            .matches
            .line_matches_for_route(route)
            .into_iter()
            .filter_map(|line| {
                let way_id = self.store.container(line.way)?.way_id()?;
                let summary = line.summary();
                Some(WayMatchQuality {
                    way_id,
                    matched_route_segments: summary.matched_route_segments,
                    mean_dot_product: summary.mean_dot_product,
                    mean_orthogonal_distance: summary.mean_orthogonal_distance,
                    mean_mid_point_distance: summary.mean_mid_point_distance,
                })
            })
            .collect();
        quality.sort_by_key(|q| q.way_id);
        quality
    }

    /// Drops everything the route left behind in the shared indexes
    fn release_route(&mut self, route: ContainerId) -> Result<()> {
        let changes = self.matches.release_route(route);
        self.apply_changes(&changes);
        self.registry
            .deregister_everywhere(Observer::RouteLine(route));
        self.registry
            .deregister_everywhere(Observer::PathSearch(route));
        self.trees.remove(&route);
        if let Some(event) = self.store.remove_container(route) {
            self.dispatch(event)?;
        }
        Ok(())
    }

    /// Keeps `RouteLine` subscriptions in step with the line matches
    fn apply_changes(&mut self, changes: &IndexChanges) {
        for (route, way) in changes.iter() {
            if self.matches.line_match(route, way).is_some() {
                self.registry.register(way, Observer::RouteLine(route));
            } else {
                self.registry.deregister(way, Observer::RouteLine(route));
            }
        }
    }

    /// Delivers a container change to every observer registered for it
    fn dispatch(&mut self, event: ContainerEvent) -> Result<()> {
        let observers = self.registry.snapshot(event.container());
        trace!(
            "Dispatching change of {:?} to {} observers",
            event.container(),
            observers.len()
        );
        if let ContainerEvent::Split {
            original, results, ..
        } = &event
        {
            self.registry.inherit(*original, results);
        }

        for observer in observers {
            match observer {
                Observer::CellIndex => self.cells.handle_event(&event, &self.store),
                Observer::RouteLine(route) => {
                    let changes = self.matches.handle_event(route, &event, &self.store);
                    self.apply_changes(&changes);
                }
                Observer::PathSearch(route) => {
                    if !matches!(event, ContainerEvent::Split { .. }) {
                        continue;
                    }
                    if let Some(trees) = self.trees.get_mut(&route) {
                        for tree in trees.iter_mut() {
                            tree.handle_split(&self.store);
                        }
                    }
                }
            }
        }

        if let ContainerEvent::Removed { container, .. } = &event {
            self.registry.forget(*container);
        }
        if self.config.check_integrity {
            self.verify_integrity()?;
        }
        Ok(())
    }

    /// Inserts a new node into the way behind `segment` at `coord`
    pub fn insert_node(&mut self, segment: SegmentId, coord: Coord<f64>) -> Result<NodeId> {
        let container = self
            .store
            .segment(segment)
            .ok_or(ConflationError::UnknownSegment(segment))?
            .container;
        let way = self
            .store
            .container(container)
            .and_then(|c| c.way_id())
            .ok_or(ConflationError::NotAWayContainer(container))?;

        let node = self.graph.new_node(coord);
        let event = self
            .store
            .insert_node(&mut self.graph, segment, node, coord)?;
        self.created_nodes.push(node);
        self.changed_ways.insert(way);
        let p = self.projection.to_local(coord);
        self.node_tree.insert(NodePoint::new([p.x, p.y], node));
        self.dispatch(event)?;
        Ok(node)
    }

    /// Splits `way` at `nodes`; returns the resulting way ids in way order
    pub fn split_way(&mut self, way: WayId, nodes: &[NodeId]) -> Result<Vec<WayId>> {
        let container = self
            .store
            .container_for_way(way)
            .ok_or(ConflationError::UnknownWay(way))?;
        let event = self.store.split(&mut self.graph, container, nodes)?;
        let ways: Vec<WayId> = match &event {
            ContainerEvent::Split { results, .. } => results
                .iter()
                .filter_map(|c| self.store.container(*c).and_then(|w| w.way_id()))
                .collect(),
            _ => Vec::new(),
        };
        self.changed_ways.extend(ways.iter().copied());
        self.dispatch(event)?;
        Ok(ways)
    }

    /// Takes a way out of matching and path search. The way itself stays
    /// in the graph.
    pub fn remove_way(&mut self, way: WayId) -> Result<()> {
        let container = self
            .store
            .container_for_way(way)
            .ok_or(ConflationError::UnknownWay(way))?;
        if let Some(event) = self.store.remove_container(container) {
            self.dispatch(event)?;
        }
        Ok(())
    }

    /// Cross-checks the match index, the cell index and the observer
    /// registry against the segment store
    pub fn verify_integrity(&self) -> Result<()> {
        self.matches.verify_consistency(&self.store)?;

        let mut network = 0;
        for container in self.store.containers() {
            self.store.assert_chain(container.id);
            match container.kind {
                SegmentKind::Network => {
                    network += 1;
                    if !self.cells.contains(container.id) {
                        return Err(ConflationError::IndexInconsistency(format!(
                            "container {:?} is missing from the cell index",
                            container.id
                        )));
                    }
                }
                SegmentKind::Route => {
                    for line in self.matches.line_matches_for_route(container.id) {
                        if !self
                            .registry
                            .is_registered(line.way, Observer::RouteLine(container.id))
                        {
                            return Err(ConflationError::IndexInconsistency(format!(
                                "route {:?} does not observe matched way container {:?}",
                                container.id, line.way
                            )));
                        }
                    }
                }
            }
        }
        if self.cells.container_count() != network {
            return Err(ConflationError::IndexInconsistency(format!(
                "cell index holds {} containers, store has {}",
                self.cells.container_count(),
                network
            )));
        }
        Ok(())
    }

    fn is_network_node(&self, node: NodeId) -> bool {
        self.graph
            .ways_at(node)
            .iter()
            .any(|w| self.store.container_for_way(*w).is_some())
    }

    /// Resolves the network node a stop is served at, inserting one when
    /// the stop lies next to a way but away from its nodes
    fn attach_stop(&mut self, stop: &StopInput) -> Result<Option<NodeId>> {
        if let Some(node) = stop.node {
            if self.is_network_node(node) {
                return Ok(Some(node));
            }
            warn!(
                "Stop {} references node {} outside the matched network, attaching by position",
                stop.id, node
            );
        }
        let coord = stop.coord();
        if let Some(node) = self.nearest_node(coord) {
            trace!("Stop {} snapped to node {}", stop.id, node);
            return Ok(Some(node));
        }
        let Some((segment, point)) = self.nearest_way_point(coord) else {
            warn!(
                "Stop {} has no way within {} m",
                stop.id, self.config.stop_way_search_distance
            );
            return Ok(None);
        };
        let node = self.insert_node(segment, point)?;
        debug!("Stop {} attached to new node {}", stop.id, node);
        Ok(Some(node))
    }

    fn nearest_node(&self, coord: Coord<f64>) -> Option<NodeId> {
        let limit = self.config.stop_node_snap_distance;
        // The tree's projection is fixed at the network centre
        let stretch = self.projection.stretch_at(coord.y).max(1.0);
        let radius = limit * stretch * 1.1 + 1.0;
        let p = self.projection.to_local(coord);
        self.node_tree
            .locate_within_distance([p.x, p.y], radius * radius)
            .filter(|point| self.is_network_node(point.data))
            .filter_map(|point| {
                let position = self.graph.coord(point.data)?;
                Some((point.data, distance_meters(coord, position)))
            })
            .filter(|(_, d)| *d <= limit)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(node, _)| node)
    }

    /// Closest point on any network segment within the way search distance,
    /// kept clear of the segment ends
    fn nearest_way_point(&self, coord: Coord<f64>) -> Option<(SegmentId, Coord<f64>)> {
        let limit = self.config.stop_way_search_distance;
        let query = Region::around(coord).buffered(limit);
        let mut best: Option<(f64, SegmentId, Coord<f64>)> = None;
        for container in self.cells.candidate_containers(&query) {
            for segment in self.store.segments_of(container) {
                if !segment.bounds.intersects(&query) {
                    continue;
                }
                let projection = project_onto_segment(coord, segment.origin, segment.destination);
                if projection.distance > limit {
                    continue;
                }
                if best.is_none_or(|(d, _, _)| projection.distance < d) {
                    let t = projection.t.clamp(0.01, 0.99);
                    let point = Coord {
                        x: segment.origin.x + (segment.destination.x - segment.origin.x) * t,
                        y: segment.origin.y + (segment.destination.y - segment.origin.y) * t,
                    };
                    best = Some((projection.distance, segment.id, point));
                }
            }
        }
        best.map(|(_, segment, point)| (segment, point))
    }

    /// Position of every stop on the route line, searched forward from the
    /// previous stop
    fn locate_stops(&self, stops: &[StopInput], route_segments: &[SegmentId]) -> Vec<usize> {
        let mut from = 0;
        stops
            .iter()
            .map(|stop| {
                let coord = stop.coord();
                let mut best: Option<(usize, f64)> = None;
                for (i, id) in route_segments.iter().enumerate().skip(from) {
                    let Some(segment) = self.store.segment(*id) else {
                        continue;
                    };
                    let d = project_onto_segment(coord, segment.origin, segment.destination).distance;
                    if best.is_none_or(|(_, bd)| d < bd) {
                        best = Some((i, d));
                    }
                }
                from = best.map(|(i, _)| i).unwrap_or(from);
                from
            })
            .collect()
    }

    /// Node adjacency of every way still taking part in matching
    fn connectivity(&self) -> UnGraphMap<NodeId, ()> {
        let mut graph = UnGraphMap::new();
        for container in self.store.containers() {
            let Some(way) = container.way_id().and_then(|w| self.graph.way(w)) else {
                continue;
            };
            for pair in way.nodes.windows(2) {
                graph.add_edge(pair[0], pair[1], ());
            }
        }
        graph
    }

    /// Splits every way a best path enters or leaves at one of its interior
    /// nodes
    fn split_at_path_ends(&mut self, route: ContainerId) {
        let Some(trees) = self.trees.get(&route) else {
            return;
        };
        let mut requests: BTreeMap<ContainerId, BTreeSet<NodeId>> = BTreeMap::new();
        for tree in trees {
            for (container, entry, exit) in tree.best_path_spans() {
                requests
                    .entry(container)
                    .or_default()
                    .extend(std::iter::once(entry).chain(exit));
            }
        }

        let mut split = 0;
        for (container, nodes) in requests {
            let Some(way_id) = self.store.container(container).and_then(|c| c.way_id()) else {
                continue;
            };
            let Some(way) = self.graph.way(way_id) else {
                continue;
            };
            let interior: Vec<NodeId> = nodes
                .into_iter()
                .filter(|n| way.nodes.contains(n) && !way.is_endpoint(*n))
                .collect();
            if interior.is_empty() || (way.is_closed() && interior.len() < 2) {
                continue;
            }
            self.registry.register(container, Observer::PathSearch(route));
            match self.split_way(way_id, &interior) {
                Ok(pieces) => {
                    split += 1;
                    debug!("Way {} split at {:?} into {:?}", way_id, interior, pieces);
                }
                Err(e) => warn!("Could not split way {} at {:?}: {}", way_id, interior, e),
            }
        }
        if split > 0 {
            debug!("Split {} ways at path ends", split);
        }
    }
}

fn reachable(graph: &UnGraphMap<NodeId, ()>, from: NodeId, to: NodeId) -> bool {
    graph.contains_node(from) && graph.contains_node(to) && has_path_connecting(graph, from, to, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{meters_to_lat_delta, meters_to_lon_delta};
    use crate::network::Tags;

    const LAT: f64 = 50.85;
    const LON: f64 = 4.35;

    fn at(east: f64, north: f64) -> Coord<f64> {
        Coord {
            x: LON + meters_to_lon_delta(east, LAT),
            y: LAT + meters_to_lat_delta(north),
        }
    }

    fn node(id: NodeId, east: f64, north: f64) -> OsmNode {
        let c = at(east, north);
        OsmNode {
            id,
            lon: c.x,
            lat: c.y,
            tags: Tags::new(),
        }
    }

    fn way(id: WayId, nodes: &[NodeId], highway: &str) -> OsmWay {
        let mut tags = Tags::new();
        tags.insert("highway".to_string(), highway.to_string());
        OsmWay {
            id,
            nodes: nodes.to_vec(),
            tags,
        }
    }

    fn stop(id: &str, east: f64, north: f64) -> StopInput {
        let c = at(east, north);
        StopInput {
            id: id.to_string(),
            name: None,
            lon: c.x,
            lat: c.y,
            node: None,
        }
    }

    fn config() -> ConflatorConfig {
        let mut config = ConflatorConfig::default();
        config.comparison.max_segment_length = 5.0;
        config.check_integrity = true;
        config
    }

    /// Straight 100 m street plus an unrelated building outline
    fn street() -> Conflator {
        let nodes = vec![
            node(1, 0.0, 0.0),
            node(2, 50.0, 0.0),
            node(3, 100.0, 0.0),
            node(4, 50.0, 30.0),
            node(5, 60.0, 30.0),
            node(6, 60.0, 40.0),
        ];
        let ways = vec![way(10, &[1, 2, 3], "residential"), {
            let mut w = way(11, &[4, 5, 6, 4], "residential");
            w.tags.remove("highway");
            w.tags.insert("building".to_string(), "yes".to_string());
            w
        }];
        Conflator::new(WayGraph::from_parts(nodes, ways), config()).unwrap()
    }

    #[test]
    fn test_only_eligible_ways_are_indexed() {
        let conflator = street();
        assert!(conflator.store().container_for_way(10).is_some());
        assert!(conflator.store().container_for_way(11).is_none());
        assert_eq!(conflator.cells().container_count(), 1);
        conflator.verify_integrity().unwrap();
    }

    #[test]
    fn test_stop_snaps_to_close_node() {
        let mut conflator = street();
        assert_eq!(conflator.attach_stop(&stop("s", 49.0, 3.0)).unwrap(), Some(2));
        assert!(conflator.network_changes().new_nodes.is_empty());
    }

    #[test]
    fn test_stop_inserts_node_next_to_way() {
        let mut conflator = street();
        let node = conflator.attach_stop(&stop("s", 25.0, 6.0)).unwrap().unwrap();
        assert!(node < 0);
        let way = conflator.graph().way(10).unwrap();
        assert_eq!(way.nodes, vec![1, node, 2, 3]);
        let position = conflator.graph().coord(node).unwrap();
        assert!(distance_meters(position, at(25.0, 0.0)) < 0.5);

        // a second stop right there snaps to the inserted node
        assert_eq!(conflator.attach_stop(&stop("t", 25.5, 2.0)).unwrap(), Some(node));
        let changes = conflator.network_changes();
        assert_eq!(changes.new_nodes.len(), 1);
        assert_eq!(changes.ways.len(), 1);
    }

    #[test]
    fn test_stop_snaps_far_north_of_network_centre() {
        let place = |lat: f64, east: f64| OsmNode {
            id: 0,
            lon: 10.0 + meters_to_lon_delta(east, lat),
            lat,
            tags: Tags::new(),
        };
        let nodes = vec![
            OsmNode { id: 1, ..place(58.0, 0.0) },
            OsmNode { id: 2, ..place(58.0, 60.0) },
            OsmNode { id: 3, ..place(72.0, 0.0) },
            OsmNode { id: 4, ..place(72.0, 60.0) },
        ];
        let ways = vec![way(10, &[1, 2], "residential"), way(20, &[3, 4], "residential")];
        let mut config = config();
        config.cell_size = 50_000.0;
        let mut conflator = Conflator::new(WayGraph::from_parts(nodes, ways), config).unwrap();

        let near = place(72.0, 67.5);
        let stop = StopInput {
            id: "s".to_string(),
            name: None,
            lon: near.lon,
            lat: near.lat,
            node: None,
        };
        assert_eq!(conflator.attach_stop(&stop).unwrap(), Some(4));
        assert!(conflator.network_changes().new_nodes.is_empty());
    }

    #[test]
    fn test_far_stop_stays_unattached() {
        let mut conflator = street();
        assert_eq!(conflator.attach_stop(&stop("s", 50.0, -80.0)).unwrap(), None);
    }

    #[test]
    fn test_invalid_route_reported() {
        let mut conflator = street();
        let route = RouteInput {
            id: "bad".to_string(),
            name: None,
            shape: vec![[LON, LAT]],
            stops: Vec::new(),
        };
        let result = conflator.conflate_route(&route);
        assert!(result.error.is_some());
        assert!(result.legs.is_empty());
    }

    #[test]
    fn test_route_released_after_run() {
        let mut conflator = street();
        let a = at(0.0, 2.0);
        let b = at(100.0, 2.0);
        let route = RouteInput {
            id: "r".to_string(),
            name: None,
            shape: vec![[a.x, a.y], [b.x, b.y]],
            stops: vec![stop("a", 0.0, 2.0), stop("b", 100.0, 2.0)],
        };
        let result = conflator.conflate_route(&route);
        assert!(result.error.is_none());
        assert!(!result.way_quality.is_empty());
        assert!(conflator.matches().is_empty());
        for container in conflator.store().containers() {
            assert_eq!(container.kind, SegmentKind::Network);
            assert_eq!(
                conflator.registry().snapshot(container.id),
                vec![Observer::CellIndex]
            );
        }
        conflator.verify_integrity().unwrap();
    }

    #[test]
    fn test_split_and_remove_keep_indexes_consistent() {
        let mut conflator = street();
        let pieces = conflator.split_way(10, &[2]).unwrap();
        assert_eq!(pieces.len(), 2);
        assert!(pieces.contains(&10));
        assert_eq!(conflator.cells().container_count(), 2);

        let err = conflator.split_way(10, &[1]).unwrap_err();
        assert!(matches!(err, ConflationError::SplitAtEndpoint { .. }));

        let other = pieces.iter().copied().find(|w| *w != 10).unwrap();
        conflator.remove_way(other).unwrap();
        assert_eq!(conflator.cells().container_count(), 1);
        assert!(conflator.store().container_for_way(other).is_none());
        conflator.verify_integrity().unwrap();
    }
}
