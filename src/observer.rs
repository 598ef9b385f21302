//! Change notifications for segment containers.
//!
//! Containers never call into their dependents directly. Every structural
//! change produces a [`ContainerEvent`]; the registry answers who must see it
//! and the conflator routes the event to those observers. Handlers take the
//! event by reference, so no observer can hold a live borrow of the store
//! while another one mutates it.

use log::trace;
use std::collections::{BTreeMap, BTreeSet};

use crate::network::NodeId;
use crate::segments::{ContainerId, LineSegment, SegmentId};

#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// `old_segment` was replaced by `new_segments` with `node` between them
    NodeInserted {
        container: ContainerId,
        node: NodeId,
        old_segment: LineSegment,
        new_segments: [SegmentId; 2],
    },
    /// `original` was split; `results` lists every resulting container in
    /// way order, `original` among them
    Split {
        original: ContainerId,
        split_nodes: Vec<NodeId>,
        results: Vec<ContainerId>,
    },
    /// The container and all of its segments are gone
    Removed {
        container: ContainerId,
        segments: Vec<SegmentId>,
    },
}

impl ContainerEvent {
    pub fn container(&self) -> ContainerId {
        match self {
            ContainerEvent::NodeInserted { container, .. } => *container,
            ContainerEvent::Split { original, .. } => *original,
            ContainerEvent::Removed { container, .. } => *container,
        }
    }
}

/// Something that keeps derived state about containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Observer {
    /// The spatial cell index
    CellIndex,
    /// The line matches of one route container
    RouteLine(ContainerId),
    /// The path search running for one route container
    PathSearch(ContainerId),
}

/// Container -> observer subscriptions
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    observers: BTreeMap<ContainerId, BTreeSet<Observer>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `observer` to `container`; repeated calls are no-ops
    pub fn register(&mut self, container: ContainerId, observer: Observer) -> bool {
        let added = self.observers.entry(container).or_default().insert(observer);
        if added {
            trace!("{:?} now observes {:?}", observer, container);
        }
        added
    }

    pub fn deregister(&mut self, container: ContainerId, observer: Observer) -> bool {
        let Some(set) = self.observers.get_mut(&container) else {
            return false;
        };
        let removed = set.remove(&observer);
        if set.is_empty() {
            self.observers.remove(&container);
        }
        removed
    }

    /// Removes `observer` from every container it watches
    pub fn deregister_everywhere(&mut self, observer: Observer) {
        self.observers.retain(|_, set| {
            set.remove(&observer);
            !set.is_empty()
        });
    }

    pub fn is_registered(&self, container: ContainerId, observer: Observer) -> bool {
        self.observers
            .get(&container)
            .is_some_and(|set| set.contains(&observer))
    }

    /// Observers of `container` at this moment. Dispatch iterates this copy,
    /// so handlers may register or deregister freely.
    pub fn snapshot(&self, container: ContainerId) -> Vec<Observer> {
        self.observers
            .get(&container)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Gives every container produced by a split the observers of the original
    pub fn inherit(&mut self, from: ContainerId, to: &[ContainerId]) {
        let inherited = self.snapshot(from);
        for container in to {
            for observer in &inherited {
                self.register(*container, *observer);
            }
        }
    }

    pub fn forget(&mut self, container: ContainerId) {
        self.observers.remove(&container);
    }

    pub fn observed_containers(&self, observer: Observer) -> Vec<ContainerId> {
        self.observers
            .iter()
            .filter(|(_, set)| set.contains(&observer))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_is_idempotent() {
        let mut registry = ObserverRegistry::new();
        let way = ContainerId(1);
        let route = Observer::RouteLine(ContainerId(9));
        assert!(registry.register(way, route));
        assert!(!registry.register(way, route));
        assert_eq!(registry.snapshot(way), vec![route]);
        assert!(registry.deregister(way, route));
        assert!(!registry.deregister(way, route));
        assert!(registry.snapshot(way).is_empty());
    }

    #[test]
    fn test_inherit_and_deregister_everywhere() {
        let mut registry = ObserverRegistry::new();
        let route = Observer::RouteLine(ContainerId(9));
        let search = Observer::PathSearch(ContainerId(9));
        registry.register(ContainerId(1), Observer::CellIndex);
        registry.register(ContainerId(1), route);
        registry.register(ContainerId(1), search);

        registry.inherit(ContainerId(1), &[ContainerId(1), ContainerId(2)]);
        assert_eq!(registry.snapshot(ContainerId(2)).len(), 3);

        registry.deregister_everywhere(route);
        assert!(!registry.is_registered(ContainerId(1), route));
        assert!(!registry.is_registered(ContainerId(2), route));
        assert_eq!(
            registry.observed_containers(search),
            vec![ContainerId(1), ContainerId(2)]
        );
    }
}
