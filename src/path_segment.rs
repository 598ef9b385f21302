use geo::Coord;
use log::{trace, warn};
use serde::Serialize;

use crate::config::ConflatorConfig;
use crate::geometry::Region;
use crate::line_match::MatchIndex;
use crate::network::{NodeId, WayGraph, WayId};
use crate::segment_match::{MatchMask, SegmentMatch};
use crate::segments::{ContainerId, LineSegment, SegmentId, SegmentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PathSegmentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelDirection {
    Forward,
    Backward,
}

impl TravelDirection {
    pub fn sign(&self) -> f64 {
        match self {
            TravelDirection::Forward => 1.0,
            TravelDirection::Backward => -1.0,
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, TravelDirection::Forward)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SegmentStatus {
    InProcess,
    /// The route has not come near the origin node yet
    PendingActivation,
    /// The route's upcoming heading does not agree with this way yet
    PendingAdvance,
    Complete,
    ReachedDestination,
    NoFirstSegment,
    ZeroMatches,
    FailedSegmentMatch,
}

impl SegmentStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SegmentStatus::PendingActivation | SegmentStatus::PendingAdvance
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SegmentStatus::Complete | SegmentStatus::ReachedDestination
        )
    }

    pub fn is_dead_end(&self) -> bool {
        matches!(
            self,
            SegmentStatus::NoFirstSegment
                | SegmentStatus::ZeroMatches
                | SegmentStatus::FailedSegmentMatch
        )
    }
}

/// Everything one advancement step reads
pub struct LegContext<'a> {
    pub store: &'a SegmentStore,
    pub graph: &'a WayGraph,
    pub matches: &'a MatchIndex,
    pub config: &'a ConflatorConfig,
    pub route: ContainerId,
    /// The whole route line, in order
    pub route_segments: &'a [SegmentId],
    pub destination_node: NodeId,
}

impl LegContext<'_> {
    fn route_segment(&self, position: usize) -> Option<&LineSegment> {
        self.route_segments
            .get(position)
            .and_then(|id| self.store.segment(*id))
    }

    /// Summed direction of up to `future_vector_segments` route segments
    /// starting at `step`
    fn future_vector(&self, step: usize) -> Coord<f64> {
        let k = self.config.comparison.future_vector_segments;
        (step..step + k)
            .filter_map(|i| self.route_segment(i))
            .fold(Coord { x: 0.0, y: 0.0 }, |acc, s| Coord {
                x: acc.x + s.vector.x,
                y: acc.y + s.vector.y,
            })
    }
}

/// One directional traversal of one way, starting at a real node
#[derive(Debug, Clone)]
pub struct PathSegment {
    pub id: PathSegmentId,
    pub container: ContainerId,
    pub direction: TravelDirection,
    pub origin_node: NodeId,
    pub end_node: Option<NodeId>,
    pub score: f64,
    /// Meters traveled
    pub traveled: f64,
    pub status: SegmentStatus,
    traversed: Vec<SegmentId>,
    next_segment: Option<SegmentId>,
    activated: bool,
    pub pending_steps: usize,
}

impl PathSegment {
    /// Starts a traversal of `container` from `origin_node`. Without a
    /// micro-segment leaving the node in that direction the segment is
    /// dead from the start.
    pub fn new(
        id: PathSegmentId,
        store: &SegmentStore,
        container: ContainerId,
        origin_node: NodeId,
        direction: TravelDirection,
    ) -> Self {
        let first = store.segments_of(container).into_iter().find(|s| match direction {
            TravelDirection::Forward => s.origin_node == Some(origin_node),
            TravelDirection::Backward => s.destination_node == Some(origin_node),
        });
        Self {
            id,
            container,
            direction,
            origin_node,
            end_node: None,
            score: 0.0,
            traveled: 0.0,
            status: if first.is_some() {
                SegmentStatus::InProcess
            } else {
                SegmentStatus::NoFirstSegment
            },
            traversed: Vec::new(),
            next_segment: first.map(|s| s.id),
            activated: false,
            pending_steps: 0,
        }
    }

    pub fn traversed(&self) -> &[SegmentId] {
        &self.traversed
    }

    pub fn way_id(&self, store: &SegmentStore) -> Option<WayId> {
        store.container(self.container).and_then(|c| c.way_id())
    }

    fn node_reached(&self, segment: &LineSegment) -> Option<NodeId> {
        match self.direction {
            TravelDirection::Forward => segment.destination_node,
            TravelDirection::Backward => segment.origin_node,
        }
    }

    /// Next micro-segment in travel direction, wrapping around rings
    fn following(&self, store: &SegmentStore, segment: &LineSegment) -> Option<SegmentId> {
        if let Some(next) = store.neighbour(segment.id, self.direction.is_forward()) {
            return Some(next.id);
        }
        let chain = store.container(segment.container)?.segment_ids();
        let first = store.segment(*chain.first()?)?;
        let last = store.segment(*chain.last()?)?;
        let ring = first.origin_node.is_some() && first.origin_node == last.destination_node;
        if !ring {
            return None;
        }
        Some(if self.direction.is_forward() {
            first.id
        } else {
            last.id
        })
    }

    /// The route's local heading must be close to this way's heading
    fn future_agrees(&self, ctx: &LegContext, step: usize, first: &LineSegment) -> bool {
        let future = ctx.future_vector(step);
        let sign = self.direction.sign();
        let heading = Coord {
            x: first.vector.x * sign,
            y: first.vector.y * sign,
        };
        let lf = future.x.hypot(future.y);
        let lh = heading.x.hypot(heading.y);
        if lf == 0.0 || lh == 0.0 {
            return true;
        }
        let cos = (future.x * heading.x + future.y * heading.y) / (lf * lh);
        cos >= ctx.config.comparison.min_future_vector_dot_product
    }

    fn is_activated(&self, ctx: &LegContext, step: usize) -> bool {
        let Some(origin) = ctx.graph.coord(self.origin_node) else {
            return false;
        };
        let buffer = Region::around(origin).buffered(ctx.config.comparison.bounding_box_size);
        let k = ctx.config.comparison.future_vector_segments;
        (step.saturating_sub(k)..=step)
            .filter_map(|i| ctx.route_segment(i))
            .any(|s| s.bounds.intersects(&buffer))
    }

    /// Match of `segment` to use at `step`, or why there is none.
    ///
    /// `Ok(None)` means the matching route segment lies ahead: the walk waits
    /// for the route to catch up.
    fn usable_match<'m>(
        &self,
        ctx: &'m LegContext,
        segment: &LineSegment,
        step: usize,
    ) -> Result<Option<&'m SegmentMatch>, ()> {
        let k = ctx.config.comparison.future_vector_segments;
        let sign = self.direction.sign();
        let positioned: Vec<(usize, &SegmentMatch)> = ctx
            .matches
            .matches_for_network_segment(ctx.route, segment.id)
            .into_iter()
            .filter(|m| m.is_full() && m.dot_product * sign > 0.0)
            .filter_map(|m| {
                ctx.store
                    .segment(m.route_segment)
                    .map(|s| (s.segment_index, m))
            })
            .collect();

        let strongest = |range: &dyn Fn(usize) -> bool| {
            positioned
                .iter()
                .filter(|(p, _)| range(*p))
                .fold(None::<(usize, &SegmentMatch)>, |best, (p, m)| match best {
                    Some((bp, bm)) if (bp, bm.dot_product.abs()) >= (*p, m.dot_product.abs()) => {
                        Some((bp, bm))
                    }
                    _ => Some((*p, *m)),
                })
                .map(|(_, m)| m)
        };

        if let Some(m) = strongest(&|p| p == step) {
            return Ok(Some(m));
        }
        if positioned.iter().any(|(p, _)| *p > step && *p <= step + k) {
            return Ok(None);
        }
        if let Some(m) = strongest(&|p| p < step && p + k >= step) {
            return Ok(Some(m));
        }
        Err(())
    }

    /// Advances the traversal against route segment `step` of the line
    pub fn advance(&mut self, ctx: &LegContext, step: usize) -> SegmentStatus {
        if self.status.is_finished() || self.status.is_dead_end() {
            return self.status;
        }
        let Some(first_id) = self.next_segment else {
            self.status = SegmentStatus::NoFirstSegment;
            return self.status;
        };
        if ctx.matches.line_match(ctx.route, self.container).is_none() {
            self.status = SegmentStatus::ZeroMatches;
            return self.status;
        }

        if !self.activated {
            if !self.is_activated(ctx, step) {
                self.pending_steps += 1;
                self.status = SegmentStatus::PendingActivation;
                return self.status;
            }
            self.activated = true;
        }

        if self.traversed.is_empty() {
            let Some(first) = ctx.store.segment(first_id) else {
                warn!("Path segment {:?} lost its first micro-segment", self.id);
                self.status = SegmentStatus::FailedSegmentMatch;
                return self.status;
            };
            if !self.future_agrees(ctx, step, first) {
                self.pending_steps += 1;
                self.status = SegmentStatus::PendingAdvance;
                return self.status;
            }
        }
        self.status = SegmentStatus::InProcess;

        let weight = ctx.config.path_score_weight;
        let bonus = ctx.config.direction_bonus;
        while let Some(segment_id) = self.next_segment {
            let Some(segment) = ctx.store.segment(segment_id) else {
                warn!(
                    "Micro-segment {:?} of path segment {:?} is gone",
                    segment_id, self.id
                );
                self.status = SegmentStatus::FailedSegmentMatch;
                return self.status;
            };
            let m = match self.usable_match(ctx, segment, step) {
                Ok(Some(m)) => m,
                Ok(None) => return self.status,
                Err(()) => {
                    trace!(
                        "Path segment {:?} has no match for {:?} at step {}",
                        self.id, segment_id, step
                    );
                    self.status = SegmentStatus::FailedSegmentMatch;
                    return self.status;
                }
            };

            self.score += weight * segment.length * m.dot_product.powi(4);
            if m.mask.contains(MatchMask::DOT_PRODUCT) {
                self.score += bonus;
            }
            self.traveled += segment.length;
            self.traversed.push(segment_id);
            self.container = segment.container;

            let next = self.following(ctx.store, segment);
            if let Some(node) = self.node_reached(segment) {
                if node == ctx.destination_node {
                    self.end_node = Some(node);
                    self.status = SegmentStatus::ReachedDestination;
                    return self.status;
                }
                if next.is_none() || node == self.origin_node || ctx.graph.is_junction(node) {
                    self.end_node = Some(node);
                    self.status = SegmentStatus::Complete;
                    return self.status;
                }
            } else if next.is_none() {
                warn!("Way container {:?} ends without a node", segment.container);
                self.status = SegmentStatus::FailedSegmentMatch;
                return self.status;
            }
            self.next_segment = next;
        }
        self.status
    }

    /// Follows the micro-segments into whatever container owns them now
    pub fn refresh_container(&mut self, store: &SegmentStore) {
        let current = self
            .next_segment
            .or_else(|| self.traversed.last().copied())
            .and_then(|id| store.segment(id));
        if let Some(segment) = current {
            self.container = segment.container;
        }
    }

    /// Splits a finished traversal whose micro-segments now belong to several
    /// containers into one traversal per container, in travel order.
    ///
    /// Score is shared out by traveled length; the last piece keeps the final
    /// status. Returns `None` when the traversal still lies in one container
    /// (its container id is refreshed in that case).
    pub fn decompose(
        &mut self,
        store: &SegmentStore,
        next_id: &mut u64,
    ) -> Option<Vec<PathSegment>> {
        let mut groups: Vec<(ContainerId, Vec<&LineSegment>)> = Vec::new();
        for segment in self.traversed.iter().filter_map(|id| store.segment(*id)) {
            match groups.last_mut() {
                Some((container, list)) if *container == segment.container => list.push(segment),
                _ => groups.push((segment.container, vec![segment])),
            }
        }
        if groups.len() <= 1 {
            if let Some((container, _)) = groups.first() {
                self.container = *container;
            }
            return None;
        }

        let total: f64 = self.traveled.max(f64::EPSILON);
        let count = groups.len();
        let mut origin = self.origin_node;
        let mut pieces = Vec::with_capacity(count);
        for (i, (container, segments)) in groups.into_iter().enumerate() {
            let last_piece = i + 1 == count;
            let length: f64 = segments.iter().map(|s| s.length).sum();
            let end_node = if last_piece {
                self.end_node
            } else {
                segments.last().and_then(|s| self.node_reached(s))
            };
            let id = PathSegmentId(*next_id);
            *next_id += 1;
            pieces.push(PathSegment {
                id,
                container,
                direction: self.direction,
                origin_node: origin,
                end_node,
                score: self.score * length / total,
                traveled: length,
                status: if last_piece {
                    self.status
                } else {
                    SegmentStatus::Complete
                },
                traversed: segments.iter().map(|s| s.id).collect(),
                next_segment: None,
                activated: true,
                pending_steps: 0,
            });
            if let Some(node) = end_node {
                origin = node;
            }
        }
        Some(pieces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell_index::CellIndex;
    use crate::config::ConflatorConfig;
    use crate::geometry::{meters_to_lat_delta, meters_to_lon_delta};
    use crate::network::{OsmNode, OsmWay, Tags};

    const LAT: f64 = 50.85;
    const LON: f64 = 4.35;

    fn at(east: f64, north: f64) -> Coord<f64> {
        Coord {
            x: LON + meters_to_lon_delta(east, LAT),
            y: LAT + meters_to_lat_delta(north),
        }
    }

    struct Setup {
        graph: WayGraph,
        store: SegmentStore,
        matches: MatchIndex,
        config: ConflatorConfig,
        route: ContainerId,
        way: ContainerId,
    }

    /// Way 1-2-3 along the x axis (0, 50, 100 m) and a route 2 m north of it
    fn setup(route_shape: &[(f64, f64)]) -> Setup {
        let nodes = [(1, 0.0), (2, 50.0), (3, 100.0)]
            .iter()
            .map(|(id, east)| {
                let c = at(*east, 0.0);
                OsmNode {
                    id: *id,
                    lon: c.x,
                    lat: c.y,
                    tags: Tags::new(),
                }
            })
            .collect();
        let graph = WayGraph::from_parts(
            nodes,
            vec![OsmWay {
                id: 10,
                nodes: vec![1, 2, 3],
                tags: Tags::new(),
            }],
        );
        let mut config = ConflatorConfig::default();
        config.comparison.max_segment_length = 5.0;
        let mut store = SegmentStore::new(5.0, config.comparison.bounding_box_size);
        let way = store.create_network_container(&graph, 10).unwrap();
        let shape: Vec<Coord<f64>> = route_shape.iter().map(|(e, n)| at(*e, *n)).collect();
        let route = store.create_route_container("r", &shape).unwrap();
        let mut cells = CellIndex::new(store.container(way).unwrap().bounds(), 500.0, 20.0);
        cells.add_container(way, store.container(way).unwrap().search_bounds());
        let mut matches = MatchIndex::new(config.comparison.clone());
        matches.match_route(route, &store, &cells).unwrap();
        Setup {
            graph,
            store,
            matches,
            config,
            route,
            way,
        }
    }

    fn run(setup: &Setup, segment: &mut PathSegment, destination: NodeId) -> Vec<SegmentStatus> {
        let route_segments = setup.store.container(setup.route).unwrap().segment_ids().to_vec();
        let ctx = LegContext {
            store: &setup.store,
            graph: &setup.graph,
            matches: &setup.matches,
            config: &setup.config,
            route: setup.route,
            route_segments: &route_segments,
            destination_node: destination,
        };
        let mut statuses = Vec::new();
        for step in 0..route_segments.len() {
            let status = segment.advance(&ctx, step);
            statuses.push(status);
            if status.is_finished() || status.is_dead_end() {
                break;
            }
        }
        statuses
    }

    #[test]
    fn test_forward_traversal_reaches_destination() {
        let setup = setup(&[(0.0, 2.0), (100.0, 2.0)]);
        let mut segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 1, TravelDirection::Forward);
        let statuses = run(&setup, &mut segment, 3);
        assert_eq!(statuses.last(), Some(&SegmentStatus::ReachedDestination));
        assert_eq!(segment.end_node, Some(3));
        assert_eq!(segment.traversed().len(), 20);
        assert!((segment.traveled - 100.0).abs() < 1e-6);
        // full alignment: length * 1 + bonus per micro-segment
        assert!((segment.score - (100.0 + 20.0)).abs() < 1e-3);
    }

    #[test]
    fn test_backward_against_route_fails() {
        let setup = setup(&[(0.0, 2.0), (100.0, 2.0)]);
        let mut segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 3, TravelDirection::Backward);
        let statuses = run(&setup, &mut segment, 1);
        assert!(!statuses.iter().any(|s| s.is_finished()));
        assert!(segment.traversed().is_empty());
    }

    #[test]
    fn test_missing_first_segment() {
        let setup = setup(&[(0.0, 2.0), (100.0, 2.0)]);
        let segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 3, TravelDirection::Forward);
        assert_eq!(segment.status, SegmentStatus::NoFirstSegment);
    }

    #[test]
    fn test_waits_until_route_arrives() {
        // route starts 40 m west of the way
        let setup = setup(&[(-40.0, 2.0), (100.0, 2.0)]);
        let mut segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 1, TravelDirection::Forward);
        let statuses = run(&setup, &mut segment, 3);
        assert_eq!(statuses[0], SegmentStatus::PendingActivation);
        assert_eq!(statuses.last(), Some(&SegmentStatus::ReachedDestination));
    }

    #[test]
    fn test_holds_until_route_turns_onto_the_way() {
        // route comes up from the south and turns east at node 1
        let setup = setup(&[(0.0, -30.0), (0.0, 2.0), (100.0, 2.0)]);
        let mut segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 1, TravelDirection::Forward);
        let statuses = run(&setup, &mut segment, 3);
        let held = statuses
            .iter()
            .position(|s| *s == SegmentStatus::PendingAdvance)
            .expect("the northbound approach holds the traversal back");
        let moving = statuses
            .iter()
            .position(|s| *s == SegmentStatus::InProcess || s.is_finished())
            .unwrap();
        assert!(held < moving);
        assert!(statuses[..held].iter().all(|s| *s == SegmentStatus::PendingActivation));
        assert_eq!(statuses.last(), Some(&SegmentStatus::ReachedDestination));
        assert_eq!(segment.traversed().len(), 20);
    }

    #[test]
    fn test_decompose_after_split() {
        let mut setup = setup(&[(0.0, 2.0), (100.0, 2.0)]);
        let mut segment = PathSegment::new(PathSegmentId(1), &setup.store, setup.way, 1, TravelDirection::Forward);
        run(&setup, &mut segment, 3);
        let score = segment.score;

        setup.store.split(&mut setup.graph, setup.way, &[2]).unwrap();
        let mut next_id = 2;
        let pieces = segment.decompose(&setup.store, &mut next_id).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].origin_node, 1);
        assert_eq!(pieces[0].end_node, Some(2));
        assert_eq!(pieces[0].status, SegmentStatus::Complete);
        assert_eq!(pieces[1].origin_node, 2);
        assert_eq!(pieces[1].end_node, Some(3));
        assert_eq!(pieces[1].status, SegmentStatus::ReachedDestination);
        assert!((pieces[0].score + pieces[1].score - score).abs() < 1e-9);
        assert_ne!(pieces[0].container, pieces[1].container);
        assert_eq!(next_id, 4);
    }
}
