//! Conflation of transit route shapes with an OpenStreetMap way network.
//!
//! Ways and route polylines are cut into short line segments, matched pair
//! by pair, and each stop-to-stop leg is resolved to the sequence of ways
//! that best follows the route line. Way splits and node insertions repair
//! every dependent index incrementally through [`observer`] events.

pub mod cell_index;
pub mod config;
pub mod conflator;
pub mod debug;
pub mod error;
pub mod geometry;
pub mod io;
pub mod line_match;
pub mod network;
pub mod observer;
pub mod path_segment;
pub mod path_tree;
pub mod segment_match;
pub mod segments;

pub use config::{ConflatorConfig, LineComparisonOptions};
pub use conflator::{Conflator, LegFailure, LegOutcome, LegResult, RouteResult, WayMatchQuality};
pub use error::{ConflationError, Result};
pub use io::{ConflationInput, RouteInput, StopInput};
pub use network::{NodeId, OsmNode, OsmWay, WayGraph, WayId};
