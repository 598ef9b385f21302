use geo::Coord;
use log::{debug, info, warn};
use osmpbf::{Element, ElementReader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::error::{ConflationError, Result};
use crate::geometry::Region;

pub type NodeId = i64;
pub type WayId = i64;
pub type Tags = BTreeMap<String, String>;

/// A real point of the network graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OsmNode {
    pub id: NodeId,
    pub lon: f64,
    pub lat: f64,
    #[serde(default)]
    pub tags: Tags,
}

impl OsmNode {
    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// A real network edge: ordered node references plus tags
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OsmWay {
    pub id: WayId,
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub tags: Tags,
}

impl OsmWay {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 2 && self.nodes.first() == self.nodes.last()
    }

    /// True when `node` is the first or last node of an open way
    pub fn is_endpoint(&self, node: NodeId) -> bool {
        !self.is_closed() && (self.nodes.first() == Some(&node) || self.nodes.last() == Some(&node))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Oneway {
    No,
    Forward,
    Backward,
}

/// Tag predicates deciding which ways take part in matching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WayFilter {
    pub highways: Vec<String>,
    pub railways: Vec<String>,
    /// Ways tagged `<ignore_tag>=yes` are never matched
    pub ignore_tag: String,
}

impl Default for WayFilter {
    fn default() -> Self {
        let highways = [
            "motorway",
            "trunk",
            "primary",
            "secondary",
            "tertiary",
            "motorway_link",
            "trunk_link",
            "primary_link",
            "secondary_link",
            "tertiary_link",
            "residential",
            "unclassified",
            "service",
            "living_street",
            "busway",
            "bus_guideway",
        ];
        let railways = [
            "rail",
            "light_rail",
            "subway",
            "tram",
            "narrow_gauge",
            "monorail",
            "funicular",
        ];
        Self {
            highways: highways.iter().map(|s| s.to_string()).collect(),
            railways: railways.iter().map(|s| s.to_string()).collect(),
            ignore_tag: "conflation:ignore".to_string(),
        }
    }
}

impl WayFilter {
    pub fn accepts(&self, way: &OsmWay) -> bool {
        if way.tag(&self.ignore_tag) == Some("yes") {
            return false;
        }
        let highway = way
            .tag("highway")
            .is_some_and(|v| self.highways.iter().any(|h| h == v));
        let railway = way
            .tag("railway")
            .is_some_and(|v| self.railways.iter().any(|r| r == v));
        highway || railway
    }
}

/// One piece produced by [`WayGraph::split_way`].
///
/// `start` and `end` are node positions in the way as it was before the
/// split. For closed ways the positions index the ring without its closing
/// node and `end < start` marks a piece wrapping past the ring start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WayPiece {
    pub way: WayId,
    pub start: usize,
    pub end: usize,
}

/// In-memory way/node graph with node -> way adjacency
#[derive(Debug, Default, Clone)]
pub struct WayGraph {
    nodes: HashMap<NodeId, OsmNode>,
    ways: BTreeMap<WayId, OsmWay>,
    node_ways: HashMap<NodeId, Vec<WayId>>,
    next_new_id: i64,
}

impl WayGraph {
    /// Builds the graph, dropping dangling node references and ways left
    /// with fewer than two nodes
    pub fn from_parts(nodes: Vec<OsmNode>, ways: Vec<OsmWay>) -> Self {
        let mut graph = WayGraph {
            next_new_id: -1,
            ..Default::default()
        };
        for node in nodes {
            graph.add_node(node);
        }
        let mut dropped = 0;
        for mut way in ways {
            let before = way.nodes.len();
            way.nodes.retain(|n| graph.nodes.contains_key(n));
            if way.nodes.len() != before {
                warn!(
                    "Way {} references {} unknown nodes, dropping them",
                    way.id,
                    before - way.nodes.len()
                );
            }
            if way.nodes.len() < 2 {
                dropped += 1;
                continue;
            }
            graph.add_way(way);
        }
        if dropped > 0 {
            warn!("Dropped {} ways with fewer than two known nodes", dropped);
        }
        debug!(
            "Way graph built with {} nodes and {} ways",
            graph.nodes.len(),
            graph.ways.len()
        );
        graph
    }

    pub fn add_node(&mut self, node: OsmNode) {
        self.next_new_id = self.next_new_id.min(node.id - 1);
        self.nodes.insert(node.id, node);
    }

    pub fn add_way(&mut self, way: OsmWay) {
        self.next_new_id = self.next_new_id.min(way.id - 1);
        self.index_way(&way);
        self.ways.insert(way.id, way);
    }

    fn index_way(&mut self, way: &OsmWay) {
        for node in &way.nodes {
            let entry = self.node_ways.entry(*node).or_default();
            if !entry.contains(&way.id) {
                entry.push(way.id);
            }
        }
    }

    fn unindex_way(&mut self, way: &OsmWay) {
        for node in &way.nodes {
            if let Some(entry) = self.node_ways.get_mut(node) {
                entry.retain(|w| *w != way.id);
            }
        }
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_new_id;
        self.next_new_id -= 1;
        id
    }

    /// Creates a new untagged node with a fresh negative id
    pub fn new_node(&mut self, coord: Coord<f64>) -> NodeId {
        let id = self.allocate_id();
        self.nodes.insert(
            id,
            OsmNode {
                id,
                lon: coord.x,
                lat: coord.y,
                tags: Tags::new(),
            },
        );
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&OsmNode> {
        self.nodes.get(&id)
    }

    pub fn coord(&self, id: NodeId) -> Option<Coord<f64>> {
        self.nodes.get(&id).map(OsmNode::coord)
    }

    pub fn way(&self, id: WayId) -> Option<&OsmWay> {
        self.ways.get(&id)
    }

    pub fn ways(&self) -> impl Iterator<Item = &OsmWay> {
        self.ways.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OsmNode> {
        self.nodes.values()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    /// Ways touching `node`, in ascending id order
    pub fn ways_at(&self, node: NodeId) -> Vec<WayId> {
        let mut ways = self.node_ways.get(&node).cloned().unwrap_or_default();
        ways.sort_unstable();
        ways
    }

    /// A node shared by two or more ways, or visited twice by one way
    /// (other than the closing node of a ring)
    pub fn is_junction(&self, node: NodeId) -> bool {
        let Some(ways) = self.node_ways.get(&node) else {
            return false;
        };
        if ways.len() > 1 {
            return true;
        }
        ways.iter().filter_map(|w| self.ways.get(w)).any(|way| {
            let visits = way.nodes.iter().filter(|n| **n == node).count();
            let closing = usize::from(way.is_closed() && way.nodes.first() == Some(&node));
            visits - closing > 1
        })
    }

    pub fn way_coords(&self, id: WayId) -> Result<Vec<Coord<f64>>> {
        let way = self.ways.get(&id).ok_or(ConflationError::UnknownWay(id))?;
        way.nodes
            .iter()
            .map(|n| self.coord(*n).ok_or(ConflationError::UnknownNode(*n)))
            .collect()
    }

    pub fn way_bounds(&self, id: WayId) -> Result<Region> {
        let coords = self.way_coords(id)?;
        Region::from_coords(coords).ok_or(ConflationError::UnknownWay(id))
    }

    pub fn oneway(&self, id: WayId) -> Oneway {
        let Some(way) = self.ways.get(&id) else {
            return Oneway::No;
        };
        match way.tag("oneway") {
            Some("yes") | Some("true") | Some("1") => Oneway::Forward,
            Some("-1") | Some("reverse") => Oneway::Backward,
            Some(_) => Oneway::No,
            None if way.tag("junction") == Some("roundabout") => Oneway::Forward,
            None => Oneway::No,
        }
    }

    /// Inserts `node` into `way` so it becomes the node at `position`
    pub fn insert_node_into_way(&mut self, way: WayId, position: usize, node: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&node) {
            return Err(ConflationError::UnknownNode(node));
        }
        let w = self.ways.get_mut(&way).ok_or(ConflationError::UnknownWay(way))?;
        let position = position.min(w.nodes.len());
        w.nodes.insert(position, node);
        let entry = self.node_ways.entry(node).or_default();
        if !entry.contains(&way) {
            entry.push(way);
        }
        Ok(())
    }

    /// Splits `way` at `split_nodes`.
    ///
    /// All preconditions are checked before anything is mutated. The piece
    /// with the most nodes keeps the original way id; the others receive new
    /// negative ids. Pieces are returned in way order.
    pub fn split_way(&mut self, way_id: WayId, split_nodes: &[NodeId]) -> Result<Vec<WayPiece>> {
        let way = self
            .ways
            .get(&way_id)
            .ok_or(ConflationError::UnknownWay(way_id))?
            .clone();
        if split_nodes.is_empty() {
            return Err(ConflationError::NothingToSplit(way_id));
        }

        let closed = way.is_closed();
        let n = way.nodes.len();
        let mut cuts = BTreeSet::new();
        for &node in split_nodes {
            let positions: Vec<usize> = way
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, id)| **id == node)
                .map(|(i, _)| i)
                .collect();
            if positions.is_empty() {
                return Err(ConflationError::NodeNotOnWay { way: way_id, node });
            }
            if closed {
                cuts.extend(positions.into_iter().map(|p| if p == n - 1 { 0 } else { p }));
            } else {
                let interior: Vec<usize> =
                    positions.into_iter().filter(|p| *p > 0 && *p < n - 1).collect();
                if interior.is_empty() {
                    return Err(ConflationError::SplitAtEndpoint { way: way_id, node });
                }
                cuts.extend(interior);
            }
        }

        let cuts: Vec<usize> = cuts.into_iter().collect();
        let spans: Vec<(usize, usize, Vec<NodeId>)> = if closed {
            if cuts.len() < 2 {
                return Err(ConflationError::ClosedWayNeedsTwoSplitNodes {
                    way: way_id,
                    given: cuts.len(),
                });
            }
            let ring = n - 1;
            (0..cuts.len())
                .map(|i| {
                    let start = cuts[i];
                    let end = cuts[(i + 1) % cuts.len()];
                    let len = if end > start { end - start } else { ring - start + end };
                    let nodes = (0..=len).map(|k| way.nodes[(start + k) % ring]).collect();
                    (start, end, nodes)
                })
                .collect()
        } else {
            let mut bounds = vec![0];
            bounds.extend(cuts.iter().copied());
            bounds.push(n - 1);
            bounds
                .windows(2)
                .map(|w| (w[0], w[1], way.nodes[w[0]..=w[1]].to_vec()))
                .collect()
        };

        // Largest piece keeps the identity, first one wins ties
        let keeper = spans
            .iter()
            .enumerate()
            .fold(0, |best, (i, s)| if s.2.len() > spans[best].2.len() { i } else { best });

        self.unindex_way(&way);
        self.ways.remove(&way_id);
        let mut pieces = Vec::with_capacity(spans.len());
        for (i, (start, end, nodes)) in spans.into_iter().enumerate() {
            let id = if i == keeper { way_id } else { self.allocate_id() };
            let piece = OsmWay {
                id,
                nodes,
                tags: way.tags.clone(),
            };
            self.index_way(&piece);
            self.ways.insert(id, piece);
            pieces.push(WayPiece { way: id, start, end });
        }
        debug!(
            "Split way {} at {:?} into {:?}",
            way_id,
            split_nodes,
            pieces.iter().map(|p| p.way).collect::<Vec<_>>()
        );
        Ok(pieces)
    }

    /// Loads highway/railway ways from an OSM PBF file, keeping ways with at
    /// least one node inside `clip` (when given)
    pub fn from_pbf(path: &Path, filter: &WayFilter, clip: Option<Region>) -> Result<Self> {
        let start_time = Instant::now();
        info!("Reading ways from {}", path.display());

        let mut ways = Vec::new();
        ElementReader::from_path(path)?.for_each(|element| {
            if let Element::Way(way) = element {
                let candidate = OsmWay {
                    id: way.id(),
                    nodes: way.refs().collect(),
                    tags: way
                        .tags()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                };
                if filter.accepts(&candidate) {
                    ways.push(candidate);
                }
            }
        })?;

        let wanted: HashSet<NodeId> = ways.iter().flat_map(|w| w.nodes.iter().copied()).collect();
        let mut nodes = Vec::with_capacity(wanted.len());
        ElementReader::from_path(path)?.for_each(|element| {
            let (id, lon, lat) = match element {
                Element::Node(node) => (node.id(), node.lon(), node.lat()),
                Element::DenseNode(node) => (node.id(), node.lon(), node.lat()),
                _ => return,
            };
            if wanted.contains(&id) {
                nodes.push(OsmNode {
                    id,
                    lon,
                    lat,
                    tags: Tags::new(),
                });
            }
        })?;

        if let Some(clip) = clip {
            let inside: HashSet<NodeId> = nodes
                .iter()
                .filter(|n| clip.contains(n.coord()))
                .map(|n| n.id)
                .collect();
            ways.retain(|w| w.nodes.iter().any(|n| inside.contains(n)));
        }

        info!(
            "Loaded {} ways and {} nodes in {:.2?}",
            ways.len(),
            nodes.len(),
            start_time.elapsed()
        );
        Ok(Self::from_parts(nodes, ways))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, lon: f64, lat: f64) -> OsmNode {
        OsmNode {
            id,
            lon,
            lat,
            tags: Tags::new(),
        }
    }

    fn way(id: WayId, nodes: &[NodeId], tags: &[(&str, &str)]) -> OsmWay {
        OsmWay {
            id,
            nodes: nodes.to_vec(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn line_graph() -> WayGraph {
        let nodes = (1..=5).map(|i| node(i, i as f64 * 0.001, 0.0)).collect();
        WayGraph::from_parts(nodes, vec![way(10, &[1, 2, 3, 4, 5], &[("highway", "primary")])])
    }

    #[test]
    fn test_split_open_way_keeps_identity_on_largest_piece() {
        let mut graph = line_graph();
        let pieces = graph.split_way(10, &[2]).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].way, 10);
        assert!(pieces[0].way < 0);
        assert_eq!(graph.way(pieces[0].way).unwrap().nodes, vec![1, 2]);
        assert_eq!(graph.way(10).unwrap().nodes, vec![2, 3, 4, 5]);
        assert_eq!(graph.ways_at(2), vec![pieces[0].way, 10]);
        assert_eq!(graph.ways_at(1), vec![pieces[0].way]);
    }

    #[test]
    fn test_split_rejects_without_mutation() {
        let mut graph = line_graph();
        assert!(matches!(
            graph.split_way(10, &[1]),
            Err(ConflationError::SplitAtEndpoint { .. })
        ));
        assert!(matches!(
            graph.split_way(10, &[3, 99]),
            Err(ConflationError::NodeNotOnWay { node: 99, .. })
        ));
        assert!(matches!(
            graph.split_way(10, &[]),
            Err(ConflationError::NothingToSplit(10))
        ));
        assert_eq!(graph.way(10).unwrap().nodes, vec![1, 2, 3, 4, 5]);
        assert_eq!(graph.way_count(), 1);
    }

    #[test]
    fn test_split_closed_way_needs_two_nodes() {
        let nodes = vec![
            node(1, 0.0, 0.0),
            node(2, 0.001, 0.0),
            node(3, 0.001, 0.001),
            node(4, 0.0, 0.001),
        ];
        let mut graph = WayGraph::from_parts(
            nodes,
            vec![way(7, &[1, 2, 3, 4, 1], &[("highway", "residential")])],
        );
        assert!(matches!(
            graph.split_way(7, &[3]),
            Err(ConflationError::ClosedWayNeedsTwoSplitNodes { given: 1, .. })
        ));

        let pieces = graph.split_way(7, &[4, 2]).unwrap();
        assert_eq!(pieces.len(), 2);
        let first = graph.way(pieces[0].way).unwrap();
        let second = graph.way(pieces[1].way).unwrap();
        assert_eq!(first.nodes, vec![2, 3, 4]);
        assert_eq!(second.nodes, vec![4, 1, 2]);
        assert_eq!(pieces[1].start, 3);
        assert_eq!(pieces[1].end, 1);
    }

    #[test]
    fn test_filter_and_oneway() {
        let filter = WayFilter::default();
        assert!(filter.accepts(&way(1, &[1, 2], &[("highway", "primary")])));
        assert!(filter.accepts(&way(1, &[1, 2], &[("railway", "tram")])));
        assert!(!filter.accepts(&way(1, &[1, 2], &[("highway", "footway")])));
        assert!(!filter.accepts(&way(
            1,
            &[1, 2],
            &[("highway", "primary"), ("conflation:ignore", "yes")]
        )));

        let nodes = vec![node(1, 0.0, 0.0), node(2, 0.001, 0.0)];
        let graph = WayGraph::from_parts(
            nodes,
            vec![
                way(1, &[1, 2], &[("oneway", "yes")]),
                way(2, &[1, 2], &[("oneway", "-1")]),
                way(3, &[1, 2], &[("junction", "roundabout")]),
                way(4, &[1, 2], &[]),
            ],
        );
        assert_eq!(graph.oneway(1), Oneway::Forward);
        assert_eq!(graph.oneway(2), Oneway::Backward);
        assert_eq!(graph.oneway(3), Oneway::Forward);
        assert_eq!(graph.oneway(4), Oneway::No);
    }

    #[test]
    fn test_new_ids_do_not_collide_with_input() {
        let mut graph = WayGraph::from_parts(
            vec![node(-5, 0.0, 0.0), node(1, 0.001, 0.0)],
            vec![way(3, &[-5, 1], &[])],
        );
        let id = graph.new_node(Coord { x: 0.0005, y: 0.0 });
        assert!(id < -5);
        graph.insert_node_into_way(3, 1, id).unwrap();
        assert_eq!(graph.way(3).unwrap().nodes, vec![-5, id, 1]);
        assert_eq!(graph.ways_at(id), vec![3]);
    }
}
