use crate::network::{NodeId, WayId};
use crate::segments::{ContainerId, SegmentId};

/// Errors raised by the conflation library
#[derive(Debug, thiserror::Error)]
pub enum ConflationError {
    #[error("node {node} is not part of way {way}")]
    NodeNotOnWay { way: WayId, node: NodeId },

    #[error("way {way} cannot be split at its endpoint node {node}")]
    SplitAtEndpoint { way: WayId, node: NodeId },

    #[error("closed way {way} needs at least two distinct split nodes, got {given}")]
    ClosedWayNeedsTwoSplitNodes { way: WayId, given: usize },

    #[error("no split nodes given for way {0}")]
    NothingToSplit(WayId),

    #[error("unknown way {0}")]
    UnknownWay(WayId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown segment container {0:?}")]
    UnknownContainer(ContainerId),

    #[error("unknown line segment {0:?}")]
    UnknownSegment(SegmentId),

    #[error("container {0:?} does not belong to a way")]
    NotAWayContainer(ContainerId),

    #[error("invalid route {route}: {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("match index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("PBF error: {0}")]
    Pbf(#[from] osmpbf::Error),
}

pub type Result<T> = std::result::Result<T, ConflationError>;
