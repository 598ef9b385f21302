//! Line segment model.
//!
//! Every way (and every route polyline) is cut into short directed
//! [`LineSegment`]s owned by a [`WaySegments`] container. Segments and
//! containers live in the [`SegmentStore`] arena and are addressed by ids that
//! stay valid across node insertion and splitting, so the match and cell
//! indexes can be repaired incrementally instead of rebuilt.

use geo::Coord;
use log::{debug, trace};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{ConflationError, Result};
use crate::geometry::{LocalProjection, Region};
use crate::network::{NodeId, Oneway, WayGraph, WayId};
use crate::observer::ContainerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContainerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SegmentKind {
    /// Piece of a real map way
    Network,
    /// Piece of a route polyline
    Route,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerSource {
    Way(WayId),
    RouteLine(String),
}

/// Directed micro-edge of a way or route line
#[derive(Debug, Clone)]
pub struct LineSegment {
    pub id: SegmentId,
    pub kind: SegmentKind,
    pub container: ContainerId,
    pub origin: Coord<f64>,
    pub destination: Coord<f64>,
    pub origin_node: Option<NodeId>,
    pub destination_node: Option<NodeId>,
    /// The destination is a vertex of the source line: a real node for
    /// network segments, a shape point for route segments
    pub ends_at_vertex: bool,
    pub segment_index: usize,
    /// Position of the last vertex at or before the origin
    pub node_index: usize,
    /// Direction in meters
    pub vector: Coord<f64>,
    /// `vector` rotated a quarter turn counter-clockwise
    pub orthogonal: Coord<f64>,
    pub length: f64,
    pub midpoint: Coord<f64>,
    pub bounds: Region,
    /// `bounds` grown by the segment search buffer
    pub search_bounds: Region,
}

impl LineSegment {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: SegmentId,
        kind: SegmentKind,
        container: ContainerId,
        origin: Coord<f64>,
        destination: Coord<f64>,
        origin_node: Option<NodeId>,
        destination_node: Option<NodeId>,
        ends_at_vertex: bool,
        search_buffer: f64,
    ) -> Self {
        let projection = LocalProjection::around(origin, destination);
        let vector = projection.vector(origin, destination);
        let bounds = Region::new(origin, destination);
        Self {
            id,
            kind,
            container,
            origin,
            destination,
            origin_node,
            destination_node,
            ends_at_vertex,
            segment_index: 0,
            node_index: 0,
            vector,
            orthogonal: Coord {
                x: -vector.y,
                y: vector.x,
            },
            length: vector.x.hypot(vector.y),
            midpoint: Coord {
                x: (origin.x + destination.x) / 2.0,
                y: (origin.y + destination.y) / 2.0,
            },
            bounds,
            search_bounds: bounds.buffered(search_buffer),
        }
    }
}

/// Ordered chain of line segments covering one way or route line
#[derive(Debug, Clone)]
pub struct WaySegments {
    pub id: ContainerId,
    pub kind: SegmentKind,
    pub source: ContainerSource,
    pub oneway: Oneway,
    segments: Vec<SegmentId>,
    bounds: Region,
    search_bounds: Region,
}

impl WaySegments {
    pub fn segment_ids(&self) -> &[SegmentId] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn bounds(&self) -> Region {
        self.bounds
    }

    /// Union of the segments' search boxes
    pub fn search_bounds(&self) -> Region {
        self.search_bounds
    }

    pub fn way_id(&self) -> Option<WayId> {
        match self.source {
            ContainerSource::Way(id) => Some(id),
            ContainerSource::RouteLine(_) => None,
        }
    }
}

/// Arena owning every container and segment of one conflation run
#[derive(Debug)]
pub struct SegmentStore {
    segments: HashMap<SegmentId, LineSegment>,
    containers: BTreeMap<ContainerId, WaySegments>,
    way_containers: HashMap<WayId, ContainerId>,
    next_segment: u64,
    next_container: u64,
    max_segment_length: f64,
    search_buffer: f64,
}

impl SegmentStore {
    pub fn new(max_segment_length: f64, search_buffer: f64) -> Self {
        Self {
            segments: HashMap::new(),
            containers: BTreeMap::new(),
            way_containers: HashMap::new(),
            next_segment: 1,
            next_container: 1,
            max_segment_length,
            search_buffer,
        }
    }

    pub fn segment(&self, id: SegmentId) -> Option<&LineSegment> {
        self.segments.get(&id)
    }

    pub fn container(&self, id: ContainerId) -> Option<&WaySegments> {
        self.containers.get(&id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &WaySegments> {
        self.containers.values()
    }

    pub fn container_for_way(&self, way: WayId) -> Option<ContainerId> {
        self.way_containers.get(&way).copied()
    }

    /// Segments of `container` in chain order
    pub fn segments_of(&self, container: ContainerId) -> Vec<&LineSegment> {
        self.containers
            .get(&container)
            .map(|c| c.segments.iter().filter_map(|id| self.segments.get(id)).collect())
            .unwrap_or_default()
    }

    /// Neighbour of `segment` inside its container, one step forward or backward
    pub fn neighbour(&self, segment: SegmentId, forward: bool) -> Option<&LineSegment> {
        let seg = self.segments.get(&segment)?;
        let container = self.containers.get(&seg.container)?;
        let index = if forward {
            seg.segment_index + 1
        } else {
            seg.segment_index.checked_sub(1)?
        };
        container.segments.get(index).and_then(|id| self.segments.get(id))
    }

    fn allocate_segment(&mut self) -> SegmentId {
        let id = SegmentId(self.next_segment);
        self.next_segment += 1;
        id
    }

    fn allocate_container(&mut self) -> ContainerId {
        let id = ContainerId(self.next_container);
        self.next_container += 1;
        id
    }

    /// Cuts a vertex chain into segments no longer than the maximum segment
    /// length; oversized gaps are divided evenly and only their outer pieces
    /// carry the real nodes
    fn build_chain(
        &mut self,
        container: ContainerId,
        kind: SegmentKind,
        vertices: &[(Coord<f64>, Option<NodeId>)],
    ) -> Vec<SegmentId> {
        let mut ids = Vec::new();
        for pair in vertices.windows(2) {
            let (a, a_node) = pair[0];
            let (b, b_node) = pair[1];
            let length = LocalProjection::around(a, b).distance(a, b);
            let pieces = ((length / self.max_segment_length) - 1e-9).ceil().max(1.0) as usize;
            let points: Vec<Coord<f64>> = (0..=pieces)
                .map(|j| {
                    if j == 0 {
                        a
                    } else if j == pieces {
                        b
                    } else {
                        let t = j as f64 / pieces as f64;
                        Coord {
                            x: a.x + (b.x - a.x) * t,
                            y: a.y + (b.y - a.y) * t,
                        }
                    }
                })
                .collect();
            for j in 0..pieces {
                let id = self.allocate_segment();
                let segment = LineSegment::new(
                    id,
                    kind,
                    container,
                    points[j],
                    points[j + 1],
                    if j == 0 { a_node } else { None },
                    if j == pieces - 1 { b_node } else { None },
                    j == pieces - 1,
                    self.search_buffer,
                );
                self.segments.insert(id, segment);
                ids.push(id);
            }
        }
        ids
    }

    fn install(&mut self, container: WaySegments) -> ContainerId {
        let id = container.id;
        if let Some(way) = container.way_id() {
            self.way_containers.insert(way, id);
        }
        self.containers.insert(id, container);
        self.renumber(id);
        id
    }

    /// Segments a way of `graph` into a new network container
    pub fn create_network_container(&mut self, graph: &WayGraph, way: WayId) -> Result<ContainerId> {
        let osm_way = graph.way(way).ok_or(ConflationError::UnknownWay(way))?;
        let coords = graph.way_coords(way)?;
        let vertices: Vec<(Coord<f64>, Option<NodeId>)> = coords
            .into_iter()
            .zip(osm_way.nodes.iter().map(|n| Some(*n)))
            .collect();
        let id = self.allocate_container();
        let segments = self.build_chain(id, SegmentKind::Network, &vertices);
        let (bounds, search_bounds) = self.chain_bounds(&segments);
        trace!("Way {} segmented into {} line segments", way, segments.len());
        Ok(self.install(WaySegments {
            id,
            kind: SegmentKind::Network,
            source: ContainerSource::Way(way),
            oneway: graph.oneway(way),
            segments,
            bounds,
            search_bounds,
        }))
    }

    /// Segments a route polyline; consecutive duplicate points are skipped
    pub fn create_route_container(&mut self, route: &str, shape: &[Coord<f64>]) -> Result<ContainerId> {
        let mut vertices: Vec<(Coord<f64>, Option<NodeId>)> = Vec::with_capacity(shape.len());
        for c in shape {
            if vertices.last().is_none_or(|(last, _)| last != c) {
                vertices.push((*c, None));
            }
        }
        if vertices.len() < 2 {
            return Err(ConflationError::InvalidRoute {
                route: route.to_string(),
                reason: "shape needs at least two distinct points".to_string(),
            });
        }
        let id = self.allocate_container();
        let segments = self.build_chain(id, SegmentKind::Route, &vertices);
        let (bounds, search_bounds) = self.chain_bounds(&segments);
        Ok(self.install(WaySegments {
            id,
            kind: SegmentKind::Route,
            source: ContainerSource::RouteLine(route.to_string()),
            oneway: Oneway::Forward,
            segments,
            bounds,
            search_bounds,
        }))
    }

    /// Drops a container and its segments
    pub fn remove_container(&mut self, id: ContainerId) -> Option<ContainerEvent> {
        let container = self.containers.remove(&id)?;
        if let Some(way) = container.way_id() {
            if self.way_containers.get(&way) == Some(&id) {
                self.way_containers.remove(&way);
            }
        }
        for segment in &container.segments {
            self.segments.remove(segment);
        }
        Some(ContainerEvent::Removed {
            container: id,
            segments: container.segments,
        })
    }

    /// Plain and search bounds of a chain
    fn chain_bounds(&self, segments: &[SegmentId]) -> (Region, Region) {
        segments
            .iter()
            .filter_map(|id| self.segments.get(id))
            .map(|s| (s.bounds, s.search_bounds))
            .reduce(|a, b| (a.0.union(&b.0), a.1.union(&b.1)))
            .unwrap_or_else(|| {
                let empty = Region::around(Coord { x: 0.0, y: 0.0 });
                (empty, empty)
            })
    }

    /// Re-derives segment/node indices, ownership and bounds of a container,
    /// then asserts the chain is still contiguous
    fn renumber(&mut self, id: ContainerId) {
        let Some(container) = self.containers.get(&id) else {
            return;
        };
        let ids = container.segments.clone();
        let mut node_index = 0;
        for (i, seg_id) in ids.iter().enumerate() {
            if let Some(seg) = self.segments.get_mut(seg_id) {
                seg.container = id;
                seg.segment_index = i;
                seg.node_index = node_index;
                if seg.ends_at_vertex {
                    node_index += 1;
                }
            }
        }
        let (bounds, search_bounds) = self.chain_bounds(&ids);
        if let Some(container) = self.containers.get_mut(&id) {
            container.bounds = bounds;
            container.search_bounds = search_bounds;
        }
        self.assert_chain(id);
    }

    /// Panics when segment `i`'s destination differs from segment `i + 1`'s
    /// origin; a broken chain means the index repair protocol is broken
    pub fn assert_chain(&self, id: ContainerId) {
        let segments = self.segments_of(id);
        for pair in segments.windows(2) {
            assert!(
                pair[0].destination == pair[1].origin,
                "container {:?} chain broken between segments {:?} and {:?}",
                id,
                pair[0].id,
                pair[1].id
            );
        }
    }

    /// Splits `segment` in two at `coord`, recording `node` as the new
    /// boundary; the node is inserted into the underlying way as well.
    ///
    /// The old segment is removed from the store and handed back inside the
    /// event so observers can find everything that referenced it.
    pub fn insert_node(
        &mut self,
        graph: &mut WayGraph,
        segment: SegmentId,
        node: NodeId,
        coord: Coord<f64>,
    ) -> Result<ContainerEvent> {
        let old = self
            .segments
            .get(&segment)
            .cloned()
            .ok_or(ConflationError::UnknownSegment(segment))?;
        let container_id = old.container;
        let container = self
            .containers
            .get(&container_id)
            .ok_or(ConflationError::UnknownContainer(container_id))?;
        if let Some(way) = container.way_id() {
            graph.insert_node_into_way(way, old.node_index + 1, node)?;
        }

        let first_id = self.allocate_segment();
        let second_id = self.allocate_segment();
        let first = LineSegment::new(
            first_id,
            old.kind,
            container_id,
            old.origin,
            coord,
            old.origin_node,
            Some(node),
            true,
            self.search_buffer,
        );
        let second = LineSegment::new(
            second_id,
            old.kind,
            container_id,
            coord,
            old.destination,
            Some(node),
            old.destination_node,
            old.ends_at_vertex,
            self.search_buffer,
        );
        self.segments.remove(&segment);
        self.segments.insert(first_id, first);
        self.segments.insert(second_id, second);
        if let Some(container) = self.containers.get_mut(&container_id) {
            container
                .segments
                .splice(old.segment_index..=old.segment_index, [first_id, second_id]);
        }
        self.renumber(container_id);
        debug!(
            "Inserted node {} into container {:?} at segment {}",
            node, container_id, old.segment_index
        );

        Ok(ContainerEvent::NodeInserted {
            container: container_id,
            node,
            old_segment: old,
            new_segments: [first_id, second_id],
        })
    }

    /// Splits the way behind a network container at `split_nodes` and deals
    /// the existing segments out to one container per resulting way.
    ///
    /// The container whose way keeps the original id (the piece with the most
    /// nodes) keeps its container id too. Segments move, they are never
    /// recreated.
    pub fn split(
        &mut self,
        graph: &mut WayGraph,
        container: ContainerId,
        split_nodes: &[NodeId],
    ) -> Result<ContainerEvent> {
        let original = self
            .containers
            .get(&container)
            .ok_or(ConflationError::UnknownContainer(container))?;
        let way = original
            .way_id()
            .ok_or(ConflationError::NotAWayContainer(container))?;
        let closed = graph.way(way).is_some_and(|w| w.is_closed());
        let segment_ids = original.segments.clone();
        let kind = original.kind;
        let oneway = original.oneway;

        let pieces = graph.split_way(way, split_nodes)?;

        let mut results = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            let node_indices = |seg: &&SegmentId| -> Option<usize> {
                self.segments.get(seg).map(|s| s.node_index)
            };
            let owned: Vec<SegmentId> = if closed && piece.end <= piece.start {
                let tail = segment_ids
                    .iter()
                    .filter(|s| node_indices(s).is_some_and(|k| k >= piece.start));
                let head = segment_ids
                    .iter()
                    .filter(|s| node_indices(s).is_some_and(|k| k < piece.end));
                tail.chain(head).copied().collect()
            } else {
                segment_ids
                    .iter()
                    .filter(|s| node_indices(s).is_some_and(|k| k >= piece.start && k < piece.end))
                    .copied()
                    .collect()
            };

            let id = if piece.way == way {
                container
            } else {
                self.allocate_container()
            };
            let (bounds, search_bounds) = self.chain_bounds(&owned);
            let entry = WaySegments {
                id,
                kind,
                source: ContainerSource::Way(piece.way),
                oneway,
                segments: owned,
                bounds,
                search_bounds,
            };
            self.containers.insert(id, entry);
            self.way_containers.insert(piece.way, id);
            results.push(id);
        }
        for id in &results {
            self.renumber(*id);
        }
        debug!(
            "Split container {:?} (way {}) into {:?}",
            container, way, results
        );

        Ok(ContainerEvent::Split {
            original: container,
            split_nodes: split_nodes.to_vec(),
            results,
        })
    }
}
