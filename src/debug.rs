use geo::Coord;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::conflator::{LegOutcome, RouteResult};
use crate::io::RouteInput;
use crate::line_match::MatchIndex;
use crate::network::{WayGraph, WayId};
use crate::segments::{ContainerId, SegmentStore};

const LEG_COLORS: [&str; 6] = ["#e41a1c", "#4daf4a", "#984ea3", "#ff7f00", "#a65628", "#f781bf"];

/// GeoJSON output for inspecting conflation results
pub struct DebugVisualizer;

impl DebugVisualizer {
    fn line_feature(coords: &[Coord<f64>], properties: serde_json::Map<String, Value>) -> Value {
        let coordinates: Vec<Vec<f64>> = coords.iter().map(|c| vec![c.x, c.y]).collect();
        json!({
            "type": "Feature",
            "properties": properties,
            "geometry": {
                "type": "LineString",
                "coordinates": coordinates
            }
        })
    }

    fn style(props: &mut serde_json::Map<String, Value>, defaults: &HashMap<&str, Value>) {
        for (key, value) in defaults {
            props.insert(key.to_string(), value.clone());
        }
    }

    /// The route shape plus one point per stop
    pub fn route_features(route: &RouteInput) -> Vec<Value> {
        let mut features = Vec::new();

        let mut defaults = HashMap::new();
        defaults.insert("color", json!("#3388ff"));
        defaults.insert("weight", json!(6));
        defaults.insert("opacity", json!(0.5));

        let mut props = serde_json::Map::new();
        props.insert("type".to_string(), json!("route_shape"));
        props.insert("route_id".to_string(), json!(route.id));
        Self::style(&mut props, &defaults);
        props.insert(
            "description".to_string(),
            json!(format!(
                "Route {} ({}), {} shape points, {} stops",
                route.id,
                route.name.as_deref().unwrap_or("Unnamed"),
                route.shape.len(),
                route.stops.len()
            )),
        );
        features.push(Self::line_feature(&route.shape_coords(), props));

        for (i, stop) in route.stops.iter().enumerate() {
            features.push(json!({
                "type": "Feature",
                "properties": {
                    "type": "stop",
                    "route_id": route.id,
                    "stop_id": stop.id,
                    "sequence": i,
                    "node": stop.node,
                    "color": "#000000",
                    "description": format!(
                        "Stop {} of route {}: {}",
                        i,
                        route.id,
                        stop.name.as_deref().unwrap_or(&stop.id)
                    )
                },
                "geometry": {
                    "type": "Point",
                    "coordinates": [stop.lon, stop.lat]
                }
            }));
        }
        features
    }

    /// The current geometry of a way
    pub fn way_feature(graph: &WayGraph, way_id: WayId, properties: serde_json::Map<String, Value>) -> Option<Value> {
        let coords = graph.way_coords(way_id).ok()?;
        let mut props = properties;
        props.insert("osm_way_id".to_string(), json!(way_id));
        if let Some(name) = graph.way(way_id).and_then(|w| w.tag("name")) {
            props.insert("name".to_string(), json!(name));
        }
        Some(Self::line_feature(&coords, props))
    }

    /// Ways chosen for every found leg, one color per leg
    pub fn leg_features(graph: &WayGraph, result: &RouteResult) -> Vec<Value> {
        let mut features = Vec::new();
        for (i, leg) in result.legs.iter().enumerate() {
            let LegOutcome::Found { ways, score } = &leg.outcome else {
                continue;
            };
            for (position, traversal) in ways.iter().enumerate() {
                let mut props = serde_json::Map::new();
                props.insert("type".to_string(), json!("leg_way"));
                props.insert("route_id".to_string(), json!(result.route_id));
                props.insert("leg".to_string(), json!(i));
                props.insert("position".to_string(), json!(position));
                props.insert("direction".to_string(), json!(traversal.direction));
                props.insert("score".to_string(), json!(score));
                props.insert("color".to_string(), json!(LEG_COLORS[i % LEG_COLORS.len()]));
                props.insert("weight".to_string(), json!(4));
                props.insert("opacity".to_string(), json!(0.9));
                props.insert(
                    "description".to_string(),
                    json!(format!(
                        "Route {} leg {} -> {}: way {} ({:?}), path score {:.2}",
                        result.route_id, leg.from_stop, leg.to_stop, traversal.way_id, traversal.direction, score
                    )),
                );
                if let Some(feature) = Self::way_feature(graph, traversal.way_id, props) {
                    features.push(feature);
                }
            }
        }
        features
    }

    /// Connector lines between each route segment and its best network
    /// segment per way
    pub fn match_features(
        store: &SegmentStore,
        matches: &MatchIndex,
        route: ContainerId,
        route_id: &str,
    ) -> Vec<Value> {
        let mut features = Vec::new();
        for line in matches.line_matches_for_route(route) {
            let way_id = store.container(line.way).and_then(|c| c.way_id());
            for (_, match_id) in line.best_matches() {
                let Some(m) = matches.get(*match_id) else {
                    continue;
                };
                let (Some(a), Some(b)) = (store.segment(m.route_segment), store.segment(m.network_segment)) else {
                    continue;
                };
                let color = if m.is_full() { "#1a9641" } else { "#d7191c" };
                features.push(json!({
                    "type": "Feature",
                    "properties": {
                        "type": "segment_match",
                        "route_id": route_id,
                        "osm_way_id": way_id,
                        "dot_product": m.dot_product,
                        "orthogonal_distance": m.orthogonal_distance,
                        "mid_point_distance": m.mid_point_distance,
                        "mask": m.mask.bits(),
                        "color": color,
                        "weight": 1,
                        "opacity": 0.7,
                        "description": format!(
                            "{:?} dot {:.3}, orthogonal {:.1} m, mid point {:.1} m",
                            m.mask, m.dot_product, m.orthogonal_distance, m.mid_point_distance
                        )
                    },
                    "geometry": {
                        "type": "LineString",
                        "coordinates": [[a.midpoint.x, a.midpoint.y], [b.midpoint.x, b.midpoint.y]]
                    }
                }));
            }
        }
        features
    }

    /// Everything of a run in one collection
    pub fn results_geojson(graph: &WayGraph, routes: &[RouteInput], results: &[RouteResult], extra: &[Value]) -> Value {
        let mut features = Vec::new();
        for route in routes {
            features.extend(Self::route_features(route));
        }
        for result in results {
            features.extend(Self::leg_features(graph, result));
        }
        features.extend(extra.iter().cloned());

        json!({
            "type": "FeatureCollection",
            "features": features
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflator::{LegFailure, LegResult};
    use crate::network::{OsmNode, OsmWay, Tags};
    use crate::path_segment::TravelDirection;
    use crate::path_tree::WayTraversal;

    fn graph() -> WayGraph {
        let nodes = vec![
            OsmNode {
                id: 1,
                lon: 4.0,
                lat: 50.0,
                tags: Tags::new(),
            },
            OsmNode {
                id: 2,
                lon: 4.001,
                lat: 50.0,
                tags: Tags::new(),
            },
        ];
        let mut tags = Tags::new();
        tags.insert("name".to_string(), "Main Street".to_string());
        WayGraph::from_parts(nodes, vec![OsmWay { id: 7, nodes: vec![1, 2], tags }])
    }

    #[test]
    fn test_results_collection() {
        let route = RouteInput {
            id: "r".to_string(),
            name: None,
            shape: vec![[4.0, 50.0], [4.001, 50.0]],
            stops: Vec::new(),
        };
        let result = RouteResult {
            route_id: "r".to_string(),
            error: None,
            legs: vec![
                LegResult {
                    from_stop: "a".to_string(),
                    to_stop: "b".to_string(),
                    outcome: LegOutcome::Found {
                        ways: vec![WayTraversal {
                            way_id: 7,
                            direction: TravelDirection::Forward,
                        }],
                        score: 12.0,
                    },
                },
                LegResult {
                    from_stop: "b".to_string(),
                    to_stop: "c".to_string(),
                    outcome: LegOutcome::Failed {
                        reason: LegFailure::NoPath,
                    },
                },
            ],
            way_quality: Vec::new(),
        };
        let geojson = DebugVisualizer::results_geojson(&graph(), &[route], &[result], &[]);
        let features = geojson["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[1]["properties"]["osm_way_id"], json!(7));
        assert_eq!(features[1]["properties"]["name"], json!("Main Street"));
        assert_eq!(features[1]["properties"]["direction"], json!("forward"));
    }
}
