use geo::Coord;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::conflator::{NetworkChanges, RouteResult};
use crate::error::Result;
use crate::geometry::Region;
use crate::network::{NodeId, OsmNode, OsmWay};

/// A stop the route must pass, optionally already tied to a network node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopInput {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lon: f64,
    pub lat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
}

impl StopInput {
    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInput {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `[lon, lat]` pairs in travel order
    pub shape: Vec<[f64; 2]>,
    #[serde(default)]
    pub stops: Vec<StopInput>,
}

impl RouteInput {
    pub fn shape_coords(&self) -> Vec<Coord<f64>> {
        self.shape
            .iter()
            .map(|[lon, lat]| Coord { x: *lon, y: *lat })
            .collect()
    }

    /// Box around the shape and every stop
    pub fn bounds(&self) -> Option<Region> {
        Region::from_coords(
            self.shape_coords()
                .into_iter()
                .chain(self.stops.iter().map(|s| s.coord())),
        )
    }
}

/// Input document: the network (unless loaded from PBF) and the routes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflationInput {
    #[serde(default)]
    pub nodes: Vec<OsmNode>,
    #[serde(default)]
    pub ways: Vec<OsmWay>,
    #[serde(default)]
    pub routes: Vec<RouteInput>,
}

impl ConflationInput {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let input: ConflationInput = serde_json::from_reader(reader)?;
        debug!(
            "Read {} nodes, {} ways and {} routes from {:?}",
            input.nodes.len(),
            input.ways.len(),
            input.routes.len(),
            path
        );
        Ok(input)
    }

    /// Box around every route
    pub fn routes_bounds(&self) -> Option<Region> {
        self.routes
            .iter()
            .filter_map(|r| r.bounds())
            .reduce(|a, b| a.union(&b))
    }
}

/// Output document
#[derive(Debug, Clone, Serialize)]
pub struct ConflationOutput {
    pub routes: Vec<RouteResult>,
    pub network_changes: NetworkChanges,
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}
