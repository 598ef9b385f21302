//! Match bookkeeping between route lines and network ways.
//!
//! The match table is the only owner of [`SegmentMatch`] values. The
//! per-segment, per-pair and per-line maps are secondary indexes over match
//! ids and are patched in place whenever a container changes.

use log::{debug, info, trace, warn};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crate::cell_index::CellIndex;
use crate::config::LineComparisonOptions;
use crate::error::{ConflationError, Result};
use crate::observer::ContainerEvent;
use crate::segment_match::{SegmentMatch, compare_segments};
use crate::segments::{ContainerId, LineSegment, SegmentId, SegmentKind, SegmentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MatchId(pub u64);

/// Aggregate quality of the best matches between one route line and one way
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineMatchSummary {
    pub matched_route_segments: usize,
    pub mean_dot_product: f64,
    pub mean_orthogonal_distance: f64,
    pub mean_mid_point_distance: f64,
}

/// All matches between one route line and one network way
#[derive(Debug, Clone)]
pub struct LineMatch {
    pub route: ContainerId,
    pub way: ContainerId,
    matches: BTreeSet<MatchId>,
    /// Best match per route segment
    best: BTreeMap<SegmentId, MatchId>,
    summary: LineMatchSummary,
}

impl LineMatch {
    fn new(route: ContainerId, way: ContainerId) -> Self {
        Self {
            route,
            way,
            matches: BTreeSet::new(),
            best: BTreeMap::new(),
            summary: LineMatchSummary::default(),
        }
    }

    pub fn best_matches(&self) -> impl Iterator<Item = (&SegmentId, &MatchId)> {
        self.best.iter()
    }

    pub fn summary(&self) -> &LineMatchSummary {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// (route container, way container) pairs whose line match was touched
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IndexChanges {
    touched: BTreeSet<(ContainerId, ContainerId)>,
}

impl IndexChanges {
    pub fn touch(&mut self, route: ContainerId, way: ContainerId) {
        self.touched.insert((route, way));
    }

    pub fn extend(&mut self, other: IndexChanges) {
        self.touched.extend(other.touched);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContainerId, ContainerId)> + '_ {
        self.touched.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }
}

/// Picks the best match of one route segment: nearest midpoint-distance band
/// first, then the strongest alignment inside that band. The band starts at a
/// quarter of the segment length and doubles up to the midpoint limit.
pub fn choose_best(candidates: &[&SegmentMatch], options: &LineComparisonOptions) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|i| OrderedFloat(candidates[*i].mid_point_distance));

    let limit = options.max_segment_mid_point_distance;
    let mut threshold = (options.max_segment_length / 4.0).min(limit);
    loop {
        let mut best: Option<usize> = None;
        for i in order.iter().take_while(|i| candidates[**i].mid_point_distance <= threshold) {
            let better = best.is_none_or(|b| {
                candidates[*i].dot_product.abs() > candidates[b].dot_product.abs()
            });
            if better {
                best = Some(*i);
            }
        }
        if best.is_some() || threshold >= limit {
            return best;
        }
        threshold = (threshold * 2.0).min(limit);
    }
}

/// Match table plus the secondary indexes derived from it
#[derive(Debug)]
pub struct MatchIndex {
    options: LineComparisonOptions,
    next_id: u64,
    table: HashMap<MatchId, SegmentMatch>,
    by_route_segment: HashMap<SegmentId, BTreeSet<MatchId>>,
    by_network_segment: HashMap<SegmentId, BTreeSet<MatchId>>,
    pairs: HashMap<(SegmentId, SegmentId), MatchId>,
    /// Line match each match is filed under
    filed_under: HashMap<MatchId, (ContainerId, ContainerId)>,
    line_matches: BTreeMap<(ContainerId, ContainerId), LineMatch>,
    lines_by_route: HashMap<ContainerId, BTreeSet<ContainerId>>,
    /// Best match per route segment, per way container
    best_by_route_segment: HashMap<SegmentId, BTreeMap<ContainerId, MatchId>>,
}

impl MatchIndex {
    pub fn new(options: LineComparisonOptions) -> Self {
        Self {
            options,
            next_id: 1,
            table: HashMap::new(),
            by_route_segment: HashMap::new(),
            by_network_segment: HashMap::new(),
            pairs: HashMap::new(),
            filed_under: HashMap::new(),
            line_matches: BTreeMap::new(),
            lines_by_route: HashMap::new(),
            best_by_route_segment: HashMap::new(),
        }
    }

    pub fn options(&self) -> &LineComparisonOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, id: MatchId) -> Option<&SegmentMatch> {
        self.table.get(&id)
    }

    pub fn line_match(&self, route: ContainerId, way: ContainerId) -> Option<&LineMatch> {
        self.line_matches.get(&(route, way))
    }

    /// Line matches of a route, in way container order
    pub fn line_matches_for_route(&self, route: ContainerId) -> Vec<&LineMatch> {
        self.lines_by_route
            .get(&route)
            .map(|ways| {
                ways.iter()
                    .filter_map(|way| self.line_matches.get(&(route, *way)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn match_for_pair(&self, route_segment: SegmentId, network_segment: SegmentId) -> Option<&SegmentMatch> {
        self.pairs
            .get(&(route_segment, network_segment))
            .and_then(|id| self.table.get(id))
    }

    /// Matches of a network segment against segments of one route line
    pub fn matches_for_network_segment(&self, route: ContainerId, segment: SegmentId) -> Vec<&SegmentMatch> {
        self.by_network_segment
            .get(&segment)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.filed_under.get(id).is_some_and(|(r, _)| *r == route))
                    .filter_map(|id| self.table.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Best match of a route segment per way container
    pub fn best_for_route_segment(&self, segment: SegmentId) -> Vec<(ContainerId, &SegmentMatch)> {
        self.best_by_route_segment
            .get(&segment)
            .map(|ways| {
                ways.iter()
                    .filter_map(|(way, id)| self.table.get(id).map(|m| (*way, m)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Files a new match under (`route`, `way`); a pair that is already
    /// matched is left alone
    fn insert_match(&mut self, route: ContainerId, way: ContainerId, m: SegmentMatch) -> Option<MatchId> {
        let key = (m.route_segment, m.network_segment);
        if self.pairs.contains_key(&key) {
            return None;
        }
        let id = MatchId(self.next_id);
        self.next_id += 1;
        self.pairs.insert(key, id);
        self.by_route_segment.entry(m.route_segment).or_default().insert(id);
        self.by_network_segment.entry(m.network_segment).or_default().insert(id);
        self.file(id, route, way);
        self.table.insert(id, m);
        Some(id)
    }

    fn file(&mut self, id: MatchId, route: ContainerId, way: ContainerId) {
        self.filed_under.insert(id, (route, way));
        self.line_matches
            .entry((route, way))
            .or_insert_with(|| LineMatch::new(route, way))
            .matches
            .insert(id);
        self.lines_by_route.entry(route).or_default().insert(way);
    }

    fn unfile(&mut self, id: MatchId) -> Option<(ContainerId, ContainerId)> {
        let key = self.filed_under.remove(&id)?;
        if let Some(line) = self.line_matches.get_mut(&key) {
            line.matches.remove(&id);
        }
        Some(key)
    }

    fn remove_match(&mut self, id: MatchId) -> Option<(ContainerId, ContainerId)> {
        let m = self.table.remove(&id)?;
        self.pairs.remove(&(m.route_segment, m.network_segment));
        if let Some(ids) = self.by_route_segment.get_mut(&m.route_segment) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_route_segment.remove(&m.route_segment);
            }
        }
        if let Some(ids) = self.by_network_segment.get_mut(&m.network_segment) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_network_segment.remove(&m.network_segment);
            }
        }
        self.unfile(id)
    }

    fn clear_best(&mut self, route: ContainerId, way: ContainerId) {
        let Some(line) = self.line_matches.get_mut(&(route, way)) else {
            return;
        };
        for segment in std::mem::take(&mut line.best).into_keys() {
            if let Some(ways) = self.best_by_route_segment.get_mut(&segment) {
                ways.remove(&way);
                if ways.is_empty() {
                    self.best_by_route_segment.remove(&segment);
                }
            }
        }
    }

    /// Recomputes the best match per route segment and the summary of one
    /// line match; an empty line match is dropped
    pub fn summarize(&mut self, route: ContainerId, way: ContainerId) {
        self.clear_best(route, way);
        let Some(line) = self.line_matches.get(&(route, way)) else {
            return;
        };
        if line.matches.is_empty() {
            self.line_matches.remove(&(route, way));
            if let Some(ways) = self.lines_by_route.get_mut(&route) {
                ways.remove(&way);
                if ways.is_empty() {
                    self.lines_by_route.remove(&route);
                }
            }
            trace!("Line match {:?}/{:?} dropped", route, way);
            return;
        }

        let mut per_segment: BTreeMap<SegmentId, Vec<MatchId>> = BTreeMap::new();
        for id in &line.matches {
            if let Some(m) = self.table.get(id) {
                per_segment.entry(m.route_segment).or_default().push(*id);
            }
        }
        let mut best = BTreeMap::new();
        for (segment, ids) in per_segment {
            let candidates: Vec<&SegmentMatch> = ids.iter().filter_map(|id| self.table.get(id)).collect();
            if let Some(i) = choose_best(&candidates, &self.options) {
                best.insert(segment, ids[i]);
            }
        }

        let chosen: Vec<&SegmentMatch> = best.values().filter_map(|id| self.table.get(id)).collect();
        let count = chosen.len();
        let finite: Vec<f64> = chosen
            .iter()
            .map(|m| m.orthogonal_distance)
            .filter(|d| d.is_finite())
            .collect();
        let summary = if count == 0 {
            LineMatchSummary::default()
        } else {
            LineMatchSummary {
                matched_route_segments: count,
                mean_dot_product: chosen.iter().map(|m| m.dot_product.abs()).sum::<f64>() / count as f64,
                mean_orthogonal_distance: if finite.is_empty() {
                    0.0
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                },
                mean_mid_point_distance: chosen.iter().map(|m| m.mid_point_distance).sum::<f64>()
                    / count as f64,
            }
        };

        for (segment, id) in &best {
            self.best_by_route_segment
                .entry(*segment)
                .or_default()
                .insert(way, *id);
        }
        if let Some(line) = self.line_matches.get_mut(&(route, way)) {
            line.best = best;
            line.summary = summary;
        }
    }

    /// Scores `pairs` on the rayon pool and files the results sequentially
    fn register_pairs(
        &mut self,
        route: ContainerId,
        pairs: &[(&LineSegment, &LineSegment)],
    ) -> IndexChanges {
        let options = &self.options;
        let found: Vec<(ContainerId, SegmentMatch)> = pairs
            .par_iter()
            .filter_map(|(route_segment, network_segment)| {
                compare_segments(route_segment, network_segment, options).map(|c| {
                    (
                        network_segment.container,
                        SegmentMatch::new(route_segment.id, network_segment.id, c),
                    )
                })
            })
            .collect();
        let mut changes = IndexChanges::default();
        for (way, m) in found {
            if self.insert_match(route, way, m).is_some() {
                changes.touch(route, way);
            }
        }
        changes
    }

    /// Matches every segment of a route line against the network segments
    /// the cell index returns for it
    pub fn match_route(&mut self, route: ContainerId, store: &SegmentStore, cells: &CellIndex) -> Result<IndexChanges> {
        let start_time = Instant::now();
        let container = store
            .container(route)
            .ok_or(ConflationError::UnknownContainer(route))?;
        if container.kind != SegmentKind::Route {
            return Err(ConflationError::UnknownContainer(route));
        }

        let route_segments = store.segments_of(route);
        let mut pairs = Vec::new();
        for route_segment in &route_segments {
            for way in cells.candidate_containers(&route_segment.search_bounds) {
                for network_segment in store.segments_of(way) {
                    if network_segment.search_bounds.intersects(&route_segment.search_bounds) {
                        pairs.push((*route_segment, network_segment));
                    }
                }
            }
        }
        let changes = self.register_pairs(route, &pairs);
        for (r, w) in changes.iter() {
            self.summarize(r, w);
        }
        info!(
            "Matched {} route segments against {} ways ({} candidate pairs) in {:.2?}",
            route_segments.len(),
            self.lines_by_route.get(&route).map_or(0, |w| w.len()),
            pairs.len(),
            start_time.elapsed()
        );
        Ok(changes)
    }

    /// Repairs the matches of `route` after a change to a container it
    /// matches against (or to its own line)
    pub fn handle_event(&mut self, route: ContainerId, event: &ContainerEvent, store: &SegmentStore) -> IndexChanges {
        match event {
            ContainerEvent::NodeInserted {
                old_segment,
                new_segments,
                ..
            } => self.handle_node_inserted(route, old_segment, new_segments, store),
            ContainerEvent::Split {
                original, results, ..
            } => self.handle_split(route, *original, results, store),
            ContainerEvent::Removed { container, .. } => self.handle_removed(route, *container),
        }
    }

    fn handle_node_inserted(
        &mut self,
        route: ContainerId,
        old_segment: &LineSegment,
        new_segments: &[SegmentId; 2],
        store: &SegmentStore,
    ) -> IndexChanges {
        let route_side = old_segment.kind == SegmentKind::Route;
        let index = if route_side {
            &self.by_route_segment
        } else {
            &self.by_network_segment
        };
        let stale: Vec<MatchId> = index
            .get(&old_segment.id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.filed_under.get(id).is_some_and(|(r, _)| *r == route))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let mut changes = IndexChanges::default();
        let mut opposing = BTreeSet::new();
        for id in stale {
            if let Some(m) = self.table.get(&id) {
                opposing.insert(if route_side {
                    m.network_segment
                } else {
                    m.route_segment
                });
            }
            if let Some((r, w)) = self.remove_match(id) {
                changes.touch(r, w);
            }
        }

        let fresh: Vec<&LineSegment> = new_segments.iter().filter_map(|id| store.segment(*id)).collect();
        let mut pairs = Vec::new();
        for other in opposing.iter().filter_map(|id| store.segment(*id)) {
            for segment in &fresh {
                if route_side {
                    pairs.push((*segment, other));
                } else {
                    pairs.push((other, *segment));
                }
            }
        }
        changes.extend(self.register_pairs(route, &pairs));
        for (r, w) in changes.iter() {
            self.summarize(r, w);
        }
        trace!(
            "Node insertion on {:?} repaired {} pairs for route {:?}",
            old_segment.container,
            pairs.len(),
            route
        );
        changes
    }

    fn handle_split(
        &mut self,
        route: ContainerId,
        original: ContainerId,
        results: &[ContainerId],
        store: &SegmentStore,
    ) -> IndexChanges {
        let mut changes = IndexChanges::default();
        let filed: Vec<MatchId> = self
            .line_matches
            .get(&(route, original))
            .map(|line| line.matches.iter().copied().collect())
            .unwrap_or_default();

        // Re-file by the container that owns the network segment now
        let mut affected = BTreeSet::new();
        for id in filed {
            let Some(m) = self.table.get(&id).copied() else {
                continue;
            };
            affected.insert(m.route_segment);
            match store.segment(m.network_segment) {
                Some(segment) => {
                    self.unfile(id);
                    self.file(id, route, segment.container);
                    changes.touch(route, segment.container);
                }
                None => {
                    warn!(
                        "Network segment {:?} vanished during split of {:?}",
                        m.network_segment, original
                    );
                    self.remove_match(id);
                }
            }
        }
        changes.touch(route, original);

        // Fresh matching of the affected route segments against every piece
        let mut pairs = Vec::new();
        for route_segment in affected.iter().filter_map(|id| store.segment(*id)) {
            for result in results {
                for network_segment in store.segments_of(*result) {
                    if !self.pairs.contains_key(&(route_segment.id, network_segment.id))
                        && network_segment.search_bounds.intersects(&route_segment.search_bounds)
                    {
                        pairs.push((route_segment, network_segment));
                    }
                }
            }
        }
        changes.extend(self.register_pairs(route, &pairs));
        for result in results {
            changes.touch(route, *result);
        }
        for (r, w) in changes.iter() {
            self.summarize(r, w);
        }
        debug!(
            "Split of {:?} refiled matches of route {:?} over {} containers",
            original,
            route,
            results.len()
        );
        changes
    }

    fn handle_removed(&mut self, route: ContainerId, container: ContainerId) -> IndexChanges {
        let mut changes = IndexChanges::default();
        let ids: Vec<MatchId> = if container == route {
            self.filed_under
                .iter()
                .filter(|(_, (r, _))| *r == route)
                .map(|(id, _)| *id)
                .collect()
        } else {
            self.line_matches
                .get(&(route, container))
                .map(|line| line.matches.iter().copied().collect())
                .unwrap_or_default()
        };
        for id in ids {
            if let Some((r, w)) = self.remove_match(id) {
                changes.touch(r, w);
            }
        }
        for (r, w) in changes.iter() {
            self.summarize(r, w);
        }
        changes
    }

    /// Drops every match of a route line
    pub fn release_route(&mut self, route: ContainerId) -> IndexChanges {
        let changes = self.handle_removed(route, route);
        self.lines_by_route.remove(&route);
        debug!("Released matches of route {:?}", route);
        changes
    }

    /// Cross-checks the match table against every secondary index and the
    /// store; any difference means a repair step lost or duplicated a match
    pub fn verify_consistency(&self, store: &SegmentStore) -> Result<()> {
        let inconsistency = |message: String| Err(ConflationError::IndexInconsistency(message));

        let mut from_table: Vec<MatchId> = self.table.keys().copied().collect();
        from_table.sort_unstable();
        let mut from_lines: Vec<MatchId> = self
            .line_matches
            .values()
            .flat_map(|line| line.matches.iter().copied())
            .collect();
        from_lines.sort_unstable();
        let mut from_route_segments: Vec<MatchId> =
            self.by_route_segment.values().flatten().copied().collect();
        from_route_segments.sort_unstable();
        let mut from_network_segments: Vec<MatchId> =
            self.by_network_segment.values().flatten().copied().collect();
        from_network_segments.sort_unstable();

        if from_lines != from_table {
            return inconsistency(format!(
                "{} matches in line index, {} in table",
                from_lines.len(),
                from_table.len()
            ));
        }
        if from_route_segments != from_table {
            return inconsistency(format!(
                "{} matches in route segment index, {} in table",
                from_route_segments.len(),
                from_table.len()
            ));
        }
        if from_network_segments != from_table {
            return inconsistency(format!(
                "{} matches in network segment index, {} in table",
                from_network_segments.len(),
                from_table.len()
            ));
        }
        if self.pairs.len() != self.table.len() {
            return inconsistency(format!(
                "{} pairs for {} matches",
                self.pairs.len(),
                self.table.len()
            ));
        }

        for (id, m) in &self.table {
            let Some((route, way)) = self.filed_under.get(id) else {
                return inconsistency(format!("match {:?} is not filed", id));
            };
            let route_owner = store.segment(m.route_segment).map(|s| s.container);
            let way_owner = store.segment(m.network_segment).map(|s| s.container);
            if route_owner != Some(*route) || way_owner != Some(*way) {
                return inconsistency(format!(
                    "match {:?} filed under {:?}/{:?} but segments belong to {:?}/{:?}",
                    id, route, way, route_owner, way_owner
                ));
            }
            if self.pairs.get(&(m.route_segment, m.network_segment)) != Some(id) {
                return inconsistency(format!("pair index disagrees for match {:?}", id));
            }
        }

        for ((route, way), line) in &self.line_matches {
            if line.matches.is_empty() {
                return inconsistency(format!("empty line match {:?}/{:?}", route, way));
            }
            if !self.lines_by_route.get(route).is_some_and(|w| w.contains(way)) {
                return inconsistency(format!("line match {:?}/{:?} missing from route index", route, way));
            }
            for (segment, id) in &line.best {
                if !line.matches.contains(id)
                    || self.best_by_route_segment.get(segment).and_then(|w| w.get(way)) != Some(id)
                {
                    return inconsistency(format!("stale best match {:?} for segment {:?}", id, segment));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{meters_to_lat_delta, meters_to_lon_delta};
    use crate::network::{NodeId, OsmNode, OsmWay, Tags, WayGraph};
    use geo::Coord;

    const LAT: f64 = 50.85;
    const LON: f64 = 4.35;

    fn at(east: f64, north: f64) -> Coord<f64> {
        Coord {
            x: LON + meters_to_lon_delta(east, LAT),
            y: LAT + meters_to_lat_delta(north),
        }
    }

    fn comparison(mid: f64, dot: f64) -> SegmentMatch {
        SegmentMatch {
            route_segment: SegmentId(1),
            network_segment: SegmentId(2),
            dot_product: dot,
            orthogonal_distance: mid,
            mid_point_distance: mid,
            mask: crate::segment_match::MatchMask::ALL,
        }
    }

    #[test]
    fn test_choose_best_prefers_near_band() {
        let options = LineComparisonOptions::default();
        let near = comparison(1.0, 0.8);
        let nearer = comparison(0.5, 0.7);
        let far = comparison(15.0, 1.0);
        assert_eq!(choose_best(&[&far, &near, &nearer], &options), Some(1));

        let only_far = comparison(18.0, 0.9);
        let farther = comparison(19.0, 0.95);
        assert_eq!(choose_best(&[&only_far, &farther], &options), Some(1));

        let beyond = comparison(30.0, 1.0);
        assert_eq!(choose_best(&[&beyond], &options), None);
        assert_eq!(choose_best(&[], &options), None);
    }

    struct Fixture {
        graph: WayGraph,
        store: SegmentStore,
        cells: CellIndex,
        index: MatchIndex,
        route: ContainerId,
        way: ContainerId,
    }

    fn fixture() -> Fixture {
        let nodes = [(1, 0.0), (2, 40.0), (3, 80.0)]
            .iter()
            .map(|(id, east)| {
                let c = at(*east, 0.0);
                OsmNode {
                    id: *id as NodeId,
                    lon: c.x,
                    lat: c.y,
                    tags: Tags::new(),
                }
            })
            .collect();
        let graph = WayGraph::from_parts(
            nodes,
            vec![OsmWay {
                id: 500,
                nodes: vec![1, 2, 3],
                tags: Tags::new(),
            }],
        );
        let options = LineComparisonOptions {
            max_segment_length: 5.0,
            ..Default::default()
        };
        let mut store = SegmentStore::new(options.max_segment_length, options.bounding_box_size);
        let way = store.create_network_container(&graph, 500).unwrap();
        let route = store
            .create_route_container("r", &[at(-5.0, 2.0), at(85.0, 2.0)])
            .unwrap();
        let region = store.container(way).unwrap().bounds();
        let mut cells = CellIndex::new(region, 200.0, options.bounding_box_size);
        cells.add_container(way, store.container(way).unwrap().search_bounds());
        let index = MatchIndex::new(options);
        Fixture {
            graph,
            store,
            cells,
            index,
            route,
            way,
        }
    }

    fn count_by_lines(index: &MatchIndex, route: ContainerId) -> usize {
        index.line_matches_for_route(route).iter().map(|l| l.len()).sum()
    }

    #[test]
    fn test_match_route_fills_every_index() {
        let mut f = fixture();
        let changes = f.index.match_route(f.route, &f.store, &f.cells).unwrap();
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec![(f.route, f.way)]);
        assert!(!f.index.is_empty());
        f.index.verify_consistency(&f.store).unwrap();

        let line = f.index.line_match(f.route, f.way).unwrap();
        // every route segment has some network segment within reach
        assert_eq!(line.summary().matched_route_segments, f.store.segments_of(f.route).len());
        assert!(line.summary().mean_dot_product > 0.99);
        for (segment, _) in line.best_matches() {
            let best = f.index.best_for_route_segment(*segment);
            assert_eq!(best.len(), 1);
            assert!(best[0].1.is_full() || best[0].1.mid_point_distance > 2.5);
        }
    }

    #[test]
    fn test_insert_and_split_keep_indexes_consistent() {
        let mut f = fixture();
        f.index.match_route(f.route, &f.store, &f.cells).unwrap();
        let before = f.index.len();

        let target = f.store.segments_of(f.way)[3].id;
        let coord = at(17.5, 0.0);
        let node = f.graph.new_node(coord);
        let event = f.store.insert_node(&mut f.graph, target, node, coord).unwrap();
        f.cells.handle_event(&event, &f.store);
        f.index.handle_event(f.route, &event, &f.store);
        f.index.verify_consistency(&f.store).unwrap();
        assert!(f.index.matches_for_network_segment(f.route, target).is_empty());
        assert_eq!(count_by_lines(&f.index, f.route), f.index.len());
        assert!(f.index.len() >= before);

        let event = f.store.split(&mut f.graph, f.way, &[2]).unwrap();
        f.cells.handle_event(&event, &f.store);
        f.index.handle_event(f.route, &event, &f.store);
        f.index.verify_consistency(&f.store).unwrap();
        let ContainerEvent::Split { results, .. } = &event else {
            panic!("expected split");
        };
        for result in results {
            assert!(f.index.line_match(f.route, *result).is_some());
        }
        assert_eq!(count_by_lines(&f.index, f.route), f.index.len());

        let changes = f.index.release_route(f.route);
        assert!(!changes.is_empty());
        assert!(f.index.is_empty());
        assert!(f.index.line_matches_for_route(f.route).is_empty());
        f.index.verify_consistency(&f.store).unwrap();
    }
}
