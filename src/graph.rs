use itertools::Itertools;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    data::*,
    error::GraphError,
    scheduler::ServicePlan,
};

/// Directed multigraph of stops and legs. Parallel edges between the same
/// pair of stops are allowed as long as their ids differ.
#[derive(Debug, Clone, Default)]
pub struct TransitGraph {
    version: u64,
    topology_version: u64,
    stops: BTreeMap<StopId, Arc<Stop>>,
    edges: BTreeMap<EdgeId, EdgeRef>,
    outgoing: HashMap<StopId, Vec<EdgeRef>>,
}

impl TransitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented on every successful mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Incremented when stops or edges are added or removed, but not when
    /// only frequencies change.
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    fn topology_changed(&mut self) {
        self.version += 1;
        self.topology_version += 1;
    }

    pub fn add_stop(&mut self, stop: Stop) -> Result<Arc<Stop>, GraphError> {
        if self.stops.contains_key(&stop.id) {
            return Err(GraphError::InvalidTopology(format!(
                "duplicate stop id {}",
                stop.id
            )));
        }
        if !(stop.location.lat.is_finite() && stop.location.lon.is_finite()) {
            return Err(GraphError::InvalidTopology(format!(
                "stop {} has a non-finite location",
                stop.id
            )));
        }
        let stop = Arc::new(stop);
        self.stops.insert(stop.id.clone(), Arc::clone(&stop));
        self.topology_changed();
        Ok(stop)
    }

    pub fn add_edge(&mut self, mut edge: Edge) -> Result<EdgeRef, GraphError> {
        if self.edges.contains_key(&edge.id) {
            return Err(GraphError::InvalidTopology(format!(
                "duplicate edge id {}",
                edge.id
            )));
        }
        for endpoint in [&edge.from, &edge.to] {
            if !self.stops.contains_key(endpoint) {
                return Err(GraphError::InvalidTopology(format!(
                    "edge {} references unknown stop {}",
                    edge.id, endpoint
                )));
            }
        }
        if !(edge.base_duration.is_finite() && edge.base_duration > 0.0) {
            return Err(GraphError::InvalidTopology(format!(
                "edge {} has non-positive duration {}",
                edge.id, edge.base_duration
            )));
        }
        if edge.base_distance.is_nan() || edge.base_distance < 0.0 {
            return Err(GraphError::InvalidTopology(format!(
                "edge {} has negative distance {}",
                edge.id, edge.base_distance
            )));
        }
        if edge.capacity.is_nan() || edge.capacity <= 0.0 || edge.frequency.is_nan() || edge.frequency < 0.0 {
            return Err(GraphError::InvalidTopology(format!(
                "edge {} has invalid service (capacity {}, frequency {})",
                edge.id, edge.capacity, edge.frequency
            )));
        }

        if let (Some(from), Some(to)) = (self.stops.get(&edge.from), self.stops.get(&edge.to)) {
            edge.midpoint = Some(from.location.midpoint(&to.location));
        }
        let edge = Arc::new(edge);
        self.edges.insert(edge.id.clone(), Arc::clone(&edge));
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .push(Arc::clone(&edge));
        self.topology_changed();
        Ok(edge)
    }

    pub fn neighbors(&self, stop_id: &StopId) -> &[EdgeRef] {
        self.outgoing
            .get(stop_id)
            .map(|edges| edges.as_slice())
            .unwrap_or_default()
    }

    pub fn stop(&self, stop_id: &StopId) -> Option<&Arc<Stop>> {
        self.stops.get(stop_id)
    }

    pub fn edge(&self, edge_id: &EdgeId) -> Option<&EdgeRef> {
        self.edges.get(edge_id)
    }

    pub fn all_stops(&self) -> impl Iterator<Item = &Arc<Stop>> {
        self.stops.values()
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &EdgeRef> {
        self.edges.values()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges leaving or entering `stop_id`.
    pub fn incident_edges(&self, stop_id: &StopId) -> Vec<EdgeRef> {
        self.edges
            .values()
            .filter(|edge| &edge.from == stop_id || &edge.to == stop_id)
            .cloned()
            .collect()
    }

    /// Removes a stop. Without `cascade`, a stop that still has incident edges
    /// is rejected; with it, those edges are removed first.
    pub fn remove_stop(&mut self, stop_id: &StopId, cascade: bool) -> Result<Arc<Stop>, GraphError> {
        if !self.stops.contains_key(stop_id) {
            return Err(GraphError::UnknownStop(stop_id.clone()));
        }
        let incident = self.incident_edges(stop_id);
        if !incident.is_empty() {
            if !cascade {
                return Err(GraphError::DanglingReference {
                    stop_id: stop_id.clone(),
                    edge_count: incident.len(),
                });
            }
            for edge in incident {
                self.remove_edge(&edge.id)?;
            }
        }
        let removed = self
            .stops
            .remove(stop_id)
            .ok_or_else(|| GraphError::UnknownStop(stop_id.clone()))?;
        self.outgoing.remove(stop_id);
        self.topology_changed();
        Ok(removed)
    }

    pub fn remove_edge(&mut self, edge_id: &EdgeId) -> Result<EdgeRef, GraphError> {
        let edge = self
            .edges
            .remove(edge_id)
            .ok_or_else(|| GraphError::UnknownEdge(edge_id.clone()))?;
        if let Some(list) = self.outgoing.get_mut(&edge.from) {
            list.retain(|e| &e.id != edge_id);
        }
        self.topology_changed();
        Ok(edge)
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::around(self.stops.values().map(|stop| &stop.location))
    }

    /// Adds a walk leg in both directions between every pair of stops closer
    /// than `max_meters`, unless a walk leg already connects them.
    /// Returns the number of legs added.
    pub fn connect_walking_transfers(
        &mut self,
        max_meters: f64,
        walk_speed_mps: f64,
    ) -> Result<usize, GraphError> {
        if !(walk_speed_mps > 0.0) {
            return Err(GraphError::InvalidTopology(format!(
                "walking speed must be positive, got {walk_speed_mps}"
            )));
        }
        let candidates = self
            .stops
            .values()
            .tuple_combinations()
            .filter_map(|(a, b)| {
                let meters = a.location.distance_to(&b.location);
                (meters > 0.0 && meters <= max_meters).then_some((Arc::clone(a), Arc::clone(b), meters))
            })
            .flat_map(|(a, b, meters)| [(Arc::clone(&a), Arc::clone(&b), meters), (b, a, meters)])
            .filter(|(from, to, _)| {
                !self
                    .neighbors(&from.id)
                    .iter()
                    .any(|edge| edge.mode == Mode::Walk && edge.to == to.id)
            })
            .collect_vec();

        let mut added = 0;
        for (from, to, meters) in candidates {
            let id = format!("walk:{}->{}", from.id, to.id);
            if self.edges.contains_key(&EdgeId(id.clone())) {
                continue;
            }
            self.add_edge(Edge::new(
                id,
                from.id.0.clone(),
                to.id.0.clone(),
                Mode::Walk,
                meters / walk_speed_mps,
                meters,
            ))?;
            added += 1;
        }
        log::debug!("added {added} walking transfers within {max_meters}m");
        Ok(added)
    }

    /// Builds the next graph version with the plan's frequencies applied.
    /// Edges the plan does not mention keep their current frequency.
    pub fn with_service_plan(&self, plan: &ServicePlan) -> Result<TransitGraph, GraphError> {
        let mut next = self.clone();
        for (edge_id, &frequency) in plan.frequencies.iter() {
            let current = next
                .edges
                .get(edge_id)
                .ok_or_else(|| GraphError::UnknownEdge(edge_id.clone()))?;
            let mut updated = Edge::clone(current);
            updated.frequency = frequency;
            let updated = Arc::new(updated);
            next.edges.insert(edge_id.clone(), Arc::clone(&updated));
            if let Some(list) = next.outgoing.get_mut(&updated.from) {
                for slot in list.iter_mut().filter(|e| &e.id == edge_id) {
                    *slot = Arc::clone(&updated);
                }
            }
        }
        next.version += 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> TransitGraph {
        let mut graph = TransitGraph::new();
        graph.add_stop(Stop::new("A", "Alpha", Coordinate::new(19.00, 72.80))).unwrap();
        graph.add_stop(Stop::new("B", "Bravo", Coordinate::new(19.02, 72.82))).unwrap();
        graph.add_stop(Stop::new("C", "Charlie", Coordinate::new(19.04, 72.84))).unwrap();
        graph
            .add_edge(Edge::new("ab", "A", "B", Mode::Bus, 600.0, 3000.0).with_service(60.0, 6.0))
            .unwrap();
        graph
            .add_edge(Edge::new("bc", "B", "C", Mode::Metro, 300.0, 3000.0).with_service(300.0, 12.0))
            .unwrap();
        graph
            .add_edge(Edge::new("ac", "A", "C", Mode::Walk, 2400.0, 6000.0))
            .unwrap();
        graph
    }

    #[test]
    fn test_edge_to_unknown_stop_is_invalid_topology() {
        let mut graph = triangle();
        let result = graph.add_edge(Edge::new("az", "A", "Z", Mode::Bus, 60.0, 100.0));
        assert!(matches!(result, Err(GraphError::InvalidTopology(_))));
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut graph = triangle();
        let dup_stop = graph.add_stop(Stop::new("A", "again", Coordinate::new(0.0, 0.0)));
        assert!(matches!(dup_stop, Err(GraphError::InvalidTopology(_))));
        let dup_edge = graph.add_edge(Edge::new("ab", "B", "A", Mode::Walk, 60.0, 100.0));
        assert!(matches!(dup_edge, Err(GraphError::InvalidTopology(_))));
    }

    #[test]
    fn test_parallel_edges_in_distinct_modes() {
        let mut graph = triangle();
        graph
            .add_edge(Edge::new("ab-walk", "A", "B", Mode::Walk, 1500.0, 3000.0))
            .unwrap();
        let modes = graph
            .neighbors(&StopId::from("A"))
            .iter()
            .filter(|edge| edge.to == StopId::from("B"))
            .map(|edge| edge.mode)
            .sorted()
            .collect_vec();
        assert_eq!(modes, vec![Mode::Bus, Mode::Walk]);
    }

    #[test]
    fn test_remove_referenced_stop_requires_cascade() {
        let mut graph = triangle();
        let result = graph.remove_stop(&StopId::from("B"), false);
        assert_eq!(
            result,
            Err(GraphError::DanglingReference {
                stop_id: StopId::from("B"),
                edge_count: 2
            })
        );
        assert_eq!(graph.stop_count(), 3);

        graph.remove_stop(&StopId::from("B"), true).unwrap();
        assert_eq!(graph.stop_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.neighbors(&StopId::from("A")).iter().all(|e| e.id == EdgeId::from("ac")));
    }

    #[test]
    fn test_neighbors_of_unknown_stop_is_empty() {
        let graph = triangle();
        assert!(graph.neighbors(&StopId::from("nowhere")).is_empty());
    }

    #[test]
    fn test_walking_transfers_connect_nearby_stops_only() {
        let mut graph = TransitGraph::new();
        graph.add_stop(Stop::new("x", "x", Coordinate::new(28.6333, 77.2195))).unwrap();
        graph.add_stop(Stop::new("y", "y", Coordinate::new(28.6340, 77.2200))).unwrap();
        graph.add_stop(Stop::new("far", "far", Coordinate::new(28.5432, 77.2044))).unwrap();
        let added = graph.connect_walking_transfers(500.0, 1.3).unwrap();
        assert_eq!(added, 2);
        assert_eq!(graph.neighbors(&StopId::from("x")).len(), 1);
        assert!(graph.neighbors(&StopId::from("far")).is_empty());

        // idempotent
        assert_eq!(graph.connect_walking_transfers(500.0, 1.3).unwrap(), 0);
    }

    #[test]
    fn test_version_increases_on_mutation() {
        let mut graph = triangle();
        let before = graph.version();
        graph.remove_edge(&EdgeId::from("ac")).unwrap();
        assert!(graph.version() > before);
    }

    #[test]
    fn test_frequency_change_keeps_topology_version() {
        let graph = triangle();
        let plan = ServicePlan {
            topology_version: graph.topology_version(),
            demand_version: None,
            window: None,
            frequencies: BTreeMap::from([(EdgeId::from("ab"), 7.0), (EdgeId::from("bc"), 11.0)]),
            total_cost: 0.0,
            iterations: 0,
            status: crate::scheduler::ServiceStatus::Converged,
            hotspots: Vec::new(),
        };
        let next = graph.with_service_plan(&plan).unwrap();
        assert!(next.version() > graph.version());
        assert_eq!(next.topology_version(), graph.topology_version());
        assert_eq!(next.edge(&EdgeId::from("ab")).map(|e| e.frequency), Some(7.0));

        let mut changed = next.clone();
        changed.remove_edge(&EdgeId::from("ac")).unwrap();
        assert!(changed.topology_version() > next.topology_version());
    }
}
