//! Branching stop-to-stop search over the way graph.
//!
//! All paths of a leg advance in lockstep, one route segment at a time. A
//! path whose last traversal completes at a junction continues on the first
//! outgoing option and forks one new path per further option; forks are
//! queued and advanced within the same pass.

use log::{debug, trace};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;

use crate::network::{NodeId, Oneway, WayId};
use crate::path_segment::{LegContext, PathSegment, PathSegmentId, SegmentStatus, TravelDirection};
use crate::segments::{ContainerId, SegmentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathOutcome {
    Unknown,
    DeadEnded,
    WaypointReached,
    /// Waited too long for the route to agree with its next way
    Stalled,
}

/// Ordered chain of connected traversals
#[derive(Debug, Clone)]
pub struct Path {
    segments: Vec<PathSegmentId>,
    pub outcome: PathOutcome,
}

impl Path {
    pub fn segment_ids(&self) -> &[PathSegmentId] {
        &self.segments
    }
}

/// One way traveled in one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WayTraversal {
    pub way_id: WayId,
    pub direction: TravelDirection,
}

/// Ways a path may continue on from `node`, given how it arrived.
///
/// Continuing along the arrival way comes first, then every other way in id
/// order, forward before backward. Oneway restrictions apply and the exact
/// reversal of the arrival is never offered.
pub fn outgoing_options(
    ctx: &LegContext,
    node: NodeId,
    arrival: Option<(ContainerId, TravelDirection)>,
) -> Vec<(ContainerId, TravelDirection)> {
    let mut options = Vec::new();
    for way in ctx.graph.ways_at(node) {
        let Some(container_id) = ctx.store.container_for_way(way) else {
            continue;
        };
        let Some(container) = ctx.store.container(container_id) else {
            continue;
        };
        let segments = ctx.store.segments_of(container_id);
        let leaves_forward = container.oneway != Oneway::Backward
            && segments.iter().any(|s| s.origin_node == Some(node));
        let leaves_backward = container.oneway != Oneway::Forward
            && segments.iter().any(|s| s.destination_node == Some(node));
        if leaves_forward {
            options.push((container_id, TravelDirection::Forward));
        }
        if leaves_backward {
            options.push((container_id, TravelDirection::Backward));
        }
    }

    if let Some((container, direction)) = arrival {
        let reverse = match direction {
            TravelDirection::Forward => TravelDirection::Backward,
            TravelDirection::Backward => TravelDirection::Forward,
        };
        options.retain(|o| *o != (container, reverse));
        if let Some(i) = options.iter().position(|o| *o == (container, direction)) {
            let same = options.remove(i);
            options.insert(0, same);
        }
    }
    options
}

/// Every path explored between two consecutive stops
#[derive(Debug)]
pub struct PathTree {
    pub route: ContainerId,
    pub origin_node: NodeId,
    pub destination_node: NodeId,
    /// Route segment positions this leg advances over
    pub slice: Range<usize>,
    segments: HashMap<PathSegmentId, PathSegment>,
    paths: Vec<Path>,
    /// Index and score of the best path, as chosen
    best: Option<(usize, f64)>,
    next_segment_id: u64,
}

impl PathTree {
    pub fn new(route: ContainerId, origin_node: NodeId, destination_node: NodeId, slice: Range<usize>) -> Self {
        Self {
            route,
            origin_node,
            destination_node,
            slice,
            segments: HashMap::new(),
            paths: Vec::new(),
            best: None,
            next_segment_id: 1,
        }
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn segment(&self, id: PathSegmentId) -> Option<&PathSegment> {
        self.segments.get(&id)
    }

    pub fn best_path(&self) -> Option<&Path> {
        self.best.and_then(|(i, _)| self.paths.get(i))
    }

    fn new_segment(
        &mut self,
        store: &SegmentStore,
        container: ContainerId,
        node: NodeId,
        direction: TravelDirection,
    ) -> PathSegmentId {
        let id = PathSegmentId(self.next_segment_id);
        self.next_segment_id += 1;
        self.segments
            .insert(id, PathSegment::new(id, store, container, node, direction));
        id
    }

    fn active(&self) -> Vec<usize> {
        self.paths
            .iter()
            .enumerate()
            .filter(|(_, p)| p.outcome == PathOutcome::Unknown)
            .map(|(i, _)| i)
            .collect()
    }

    /// Paths still being advanced
    fn live_count(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| p.outcome == PathOutcome::Unknown)
            .count()
    }

    /// Seeds the tree and advances it across the whole slice
    pub fn search(&mut self, ctx: &LegContext) {
        for (container, direction) in outgoing_options(ctx, self.origin_node, None) {
            let id = self.new_segment(ctx.store, container, self.origin_node, direction);
            self.paths.push(Path {
                segments: vec![id],
                outcome: PathOutcome::Unknown,
            });
        }
        debug!(
            "Leg {} -> {} seeded with {} paths over route segments {:?}",
            self.origin_node,
            self.destination_node,
            self.paths.len(),
            self.slice
        );

        for step in self.slice.clone() {
            if self.active().is_empty() {
                break;
            }
            self.step(ctx, step);
        }
        self.best = self.choose_best();
        debug!(
            "Leg {} -> {}: {} paths, {} reached the destination",
            self.origin_node,
            self.destination_node,
            self.paths.len(),
            self.paths
                .iter()
                .filter(|p| p.outcome == PathOutcome::WaypointReached)
                .count()
        );
    }

    /// One advancement pass of every unresolved path against route segment
    /// `step`, forks included
    fn step(&mut self, ctx: &LegContext, step: usize) {
        let mut queue: VecDeque<usize> = self.active().into();
        let mut visited: HashMap<usize, HashSet<NodeId>> = HashMap::new();

        while let Some(pi) = queue.pop_front() {
            let Some(&last) = self.paths[pi].segments.last() else {
                self.paths[pi].outcome = PathOutcome::DeadEnded;
                continue;
            };
            let Some(segment) = self.segments.get_mut(&last) else {
                self.paths[pi].outcome = PathOutcome::DeadEnded;
                continue;
            };
            visited.entry(pi).or_insert_with(|| HashSet::from([segment.origin_node]));

            let status = segment.advance(ctx, step);
            let arrival = (segment.container, segment.direction);
            let end_node = segment.end_node;
            let pending_steps = segment.pending_steps;

            match status {
                SegmentStatus::ReachedDestination => {
                    self.paths[pi].outcome = PathOutcome::WaypointReached;
                }
                SegmentStatus::NoFirstSegment
                | SegmentStatus::ZeroMatches
                | SegmentStatus::FailedSegmentMatch => {
                    self.paths[pi].outcome = PathOutcome::DeadEnded;
                }
                SegmentStatus::PendingActivation | SegmentStatus::PendingAdvance => {
                    if pending_steps > ctx.config.max_pending_steps {
                        self.paths[pi].outcome = PathOutcome::Stalled;
                    }
                }
                SegmentStatus::InProcess => {}
                SegmentStatus::Complete => {
                    let Some(node) = end_node else {
                        self.paths[pi].outcome = PathOutcome::DeadEnded;
                        continue;
                    };
                    let seen = visited.entry(pi).or_default();
                    if !seen.insert(node) {
                        trace!("Path {} revisited node {} at step {}", pi, node, step);
                        self.paths[pi].outcome = PathOutcome::DeadEnded;
                        continue;
                    }
                    let seen = seen.clone();

                    let options = outgoing_options(ctx, node, Some(arrival));
                    let Some((&first, rest)) = options.split_first() else {
                        self.paths[pi].outcome = PathOutcome::DeadEnded;
                        continue;
                    };
                    let mut live = self.live_count();
                    for &(container, direction) in rest {
                        if live >= ctx.config.max_paths_per_leg {
                            debug!(
                                "Path cap of {} reached at node {}",
                                ctx.config.max_paths_per_leg, node
                            );
                            break;
                        }
                        live += 1;
                        let id = self.new_segment(ctx.store, container, node, direction);
                        let mut segments = self.paths[pi].segments.clone();
                        segments.push(id);
                        self.paths.push(Path {
                            segments,
                            outcome: PathOutcome::Unknown,
                        });
                        let fork = self.paths.len() - 1;
                        visited.insert(fork, seen.clone());
                        queue.push_back(fork);
                    }
                    let id = self.new_segment(ctx.store, first.0, node, first.1);
                    self.paths[pi].segments.push(id);
                    queue.push_front(pi);
                }
            }
        }
    }

    /// Mean PathSegment score of a path
    pub fn path_score(&self, path: &Path) -> f64 {
        if path.segments.is_empty() {
            return 0.0;
        }
        let total: f64 = path
            .segments
            .iter()
            .filter_map(|id| self.segments.get(id))
            .map(|s| s.score)
            .sum();
        total / path.segments.len() as f64
    }

    fn choose_best(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, path) in self.paths.iter().enumerate() {
            if path.outcome != PathOutcome::WaypointReached {
                continue;
            }
            let score = self.path_score(path);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        best
    }

    /// Splits traversals of split ways into per-way pieces and refreshes
    /// the containers of unfinished ones
    pub fn handle_split(&mut self, store: &SegmentStore) {
        let mut replacements: HashMap<PathSegmentId, Vec<PathSegmentId>> = HashMap::new();
        let ids: Vec<PathSegmentId> = self.segments.keys().copied().collect();
        for id in ids {
            let Some(segment) = self.segments.get_mut(&id) else {
                continue;
            };
            if !segment.status.is_finished() {
                segment.refresh_container(store);
                continue;
            }
            let Some(pieces) = segment.decompose(store, &mut self.next_segment_id) else {
                continue;
            };
            let piece_ids: Vec<PathSegmentId> = pieces.iter().map(|p| p.id).collect();
            for piece in pieces {
                self.segments.insert(piece.id, piece);
            }
            self.segments.remove(&id);
            replacements.insert(id, piece_ids);
        }
        if replacements.is_empty() {
            return;
        }
        for path in &mut self.paths {
            path.segments = path
                .segments
                .iter()
                .flat_map(|id| replacements.get(id).cloned().unwrap_or_else(|| vec![*id]))
                .collect();
        }
        debug!(
            "Decomposed {} path segments after a way split",
            replacements.len()
        );
    }

    /// Traversals of `path` as (way, direction), consecutive repeats merged
    pub fn traversals(&self, path: &Path, store: &SegmentStore) -> Vec<WayTraversal> {
        let mut result: Vec<WayTraversal> = Vec::new();
        for segment in path.segments.iter().filter_map(|id| self.segments.get(id)) {
            let Some(way_id) = segment.way_id(store) else {
                continue;
            };
            let traversal = WayTraversal {
                way_id,
                direction: segment.direction,
            };
            if result.last() != Some(&traversal) {
                result.push(traversal);
            }
        }
        result
    }

    /// (container, entry node, exit node) per traversal of the best path
    pub fn best_path_spans(&self) -> Vec<(ContainerId, NodeId, Option<NodeId>)> {
        self.best_path()
            .map(|path| {
                path.segments
                    .iter()
                    .filter_map(|id| self.segments.get(id))
                    .map(|s| (s.container, s.origin_node, s.end_node))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Score the best path was chosen with. Later decomposition after way
    /// splits does not change it.
    pub fn best_score(&self) -> Option<f64> {
        self.best.map(|(_, score)| score)
    }
}
