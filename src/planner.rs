use chrono::{Duration, NaiveDateTime};
use itertools::Itertools;
use std::{
    cmp::Ordering,
    collections::{BTreeSet, BinaryHeap, HashMap},
    sync::Arc,
};

use crate::{
    cancel::Cancellation,
    config::PlannerConfig,
    cost::{DynamicWeight, EdgeCostProvider},
    data::*,
    demand::{DemandForecast, DemandTarget},
    error::{PlanError, StaleDataWarning, StaleSource},
    graph::TransitGraph,
    shared::Versioned,
    signal::SignalSnapshot,
};

/// Labels popped between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criterion {
    Time,
    Transfers,
    Fare,
}

impl Criterion {
    pub const DEFAULT_ORDER: [Criterion; 3] = [Criterion::Time, Criterion::Transfers, Criterion::Fare];
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    /// lexicographic ranking, most important first
    pub order: [Criterion; 3],
    pub modes: BTreeSet<Mode>,
    /// overrides the configured maximum journey duration
    pub max_duration_minutes: Option<f64>,
    pub max_journeys: Option<usize>,
    /// riders may pick up a bicycle after leaving a vehicle
    pub allow_cycle_after_transit: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            order: Criterion::DEFAULT_ORDER,
            modes: Mode::ALL.into_iter().collect(),
            max_duration_minutes: None,
            max_journeys: None,
            allow_cycle_after_transit: false,
        }
    }
}

impl Preferences {
    /// `primary` first, the remaining criteria in the default order.
    pub fn minimize(primary: Criterion) -> Self {
        let mut order = [primary; 3];
        for (slot, criterion) in order
            .iter_mut()
            .skip(1)
            .zip(Criterion::DEFAULT_ORDER.into_iter().filter(|c| *c != primary))
        {
            *slot = criterion;
        }
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: [Criterion; 3]) -> Self {
        self.order = order;
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = Mode>) -> Self {
        self.modes = modes.into_iter().collect();
        self
    }

    pub fn with_max_duration_minutes(mut self, minutes: f64) -> Self {
        self.max_duration_minutes = Some(minutes);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JourneyLeg {
    pub edge: EdgeRef,
    /// time spent at the boarding stop before this leg, dwell plus headway wait
    pub wait: Seconds,
    pub depart_at: NaiveDateTime,
    pub arrive_at: NaiveDateTime,
    pub weight: DynamicWeight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Journey {
    pub origin: StopId,
    pub destination: StopId,
    pub departure: NaiveDateTime,
    pub legs: Vec<JourneyLeg>,
    pub total_duration: Seconds,
    pub transfers: u32,
    pub fare: f64,
    /// meters
    pub distance: f64,
    /// kg CO2
    pub emissions: f64,
}

impl Journey {
    fn stay(stop: &StopId, departure: NaiveDateTime) -> Self {
        Self {
            origin: stop.clone(),
            destination: stop.clone(),
            departure,
            legs: Vec::new(),
            total_duration: 0.0,
            transfers: 0,
            fare: 0.0,
            distance: 0.0,
            emissions: 0.0,
        }
    }

    pub fn arrival(&self) -> NaiveDateTime {
        offset(self.departure, self.total_duration)
    }

    pub fn stops(&self) -> Vec<StopId> {
        std::iter::once(self.origin.clone())
            .chain(self.legs.iter().map(|leg| leg.edge.to.clone()))
            .collect()
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.legs.iter().map(|leg| leg.edge.mode).dedup().collect()
    }

    pub fn is_stale(&self) -> bool {
        self.legs.iter().any(|leg| leg.weight.stale)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    /// best first
    pub journeys: Vec<Journey>,
    pub warnings: Vec<StaleDataWarning>,
}

#[derive(Debug, Clone)]
struct Leg {
    edge: EdgeRef,
    wait: Seconds,
    depart_offset: Seconds,
    weight: DynamicWeight,
}

#[derive(Debug, Clone)]
struct Label {
    stop: StopId,
    elapsed: Seconds,
    transfers: u32,
    boardings: u32,
    fare: f64,
    vehicle: Option<VehicleKey>,
    parent: Option<usize>,
    leg: Option<Leg>,
    dominated: bool,
}

impl Label {
    fn dominates(&self, other: &Label) -> bool {
        self.elapsed <= other.elapsed && self.transfers <= other.transfers && self.fare <= other.fare
    }

    fn cost(&self, criterion: Criterion) -> f64 {
        match criterion {
            Criterion::Time => self.elapsed,
            Criterion::Transfers => self.transfers as f64,
            Criterion::Fare => self.fare,
        }
    }

    fn key(&self, order: &[Criterion; 3]) -> [f64; 3] {
        order.map(|criterion| self.cost(criterion))
    }
}

/// Labels that can only be compared when they continue in the same way:
/// same stop, same vehicle, same bicycle eligibility.
type BagKey = (StopId, Option<VehicleKey>, bool);

#[derive(Debug)]
struct QueueEntry {
    key: [f64; 3],
    seq: usize,
    label: usize,
}

impl Ord for QueueEntry {
    // reversed: BinaryHeap pops the lexicographically smallest key first
    fn cmp(&self, other: &Self) -> Ordering {
        lexicographic(&other.key, &self.key).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

fn lexicographic(a: &[f64; 3], b: &[f64; 3]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn offset(at: NaiveDateTime, seconds: Seconds) -> NaiveDateTime {
    at + Duration::milliseconds((seconds * 1000.0).round() as i64)
}

/// Multi-criteria journey search over one graph version, one signal
/// snapshot and optionally one demand forecast. All are held by `Arc`, so
/// updates published while a query runs do not affect it.
pub struct RoutePlanner {
    graph: Arc<TransitGraph>,
    signals: Option<Arc<Versioned<SignalSnapshot>>>,
    signals_refresh_failed: bool,
    demand: Option<Arc<Versioned<DemandForecast>>>,
    costs: EdgeCostProvider,
    config: PlannerConfig,
    max_signal_age: Duration,
}

impl RoutePlanner {
    pub fn new(
        graph: Arc<TransitGraph>,
        signals: Option<Arc<Versioned<SignalSnapshot>>>,
        costs: EdgeCostProvider,
        config: PlannerConfig,
        max_signal_age: Duration,
    ) -> Self {
        Self {
            graph,
            signals,
            signals_refresh_failed: false,
            demand: None,
            costs,
            config,
            max_signal_age,
        }
    }

    pub fn with_refresh_failed(mut self, failed: bool) -> Self {
        self.signals_refresh_failed = failed;
        self
    }

    /// Forecast ridership makes full vehicles slower to board and less reliable.
    pub fn with_demand(mut self, demand: Option<Arc<Versioned<DemandForecast>>>) -> Self {
        self.demand = demand;
        self
    }

    pub fn graph(&self) -> &TransitGraph {
        &self.graph
    }

    /// Forecast riders over hourly capacity for `edge` at `at`, when known.
    fn load_factor(&self, edge: &Edge, at: NaiveDateTime) -> Option<f64> {
        let demand = self.demand.as_ref()?;
        let capacity = edge.hourly_capacity();
        if !(capacity.is_finite() && capacity > 0.0) {
            return None;
        }
        demand
            .value
            .riders_at(&DemandTarget::Edge(edge.id.clone()), at)
            .map(|riders| riders / capacity)
    }

    pub fn plan(
        &self,
        origin: &StopId,
        destination: &StopId,
        departure: NaiveDateTime,
        preferences: &Preferences,
        cancel: &Cancellation,
    ) -> Result<PlanOutcome, PlanError> {
        for stop in [origin, destination] {
            if self.graph.stop(stop).is_none() {
                return Err(PlanError::UnknownStop(stop.clone()));
            }
        }
        if origin == destination {
            return Ok(PlanOutcome {
                journeys: vec![Journey::stay(origin, departure)],
                warnings: Vec::new(),
            });
        }

        let max_duration_minutes = preferences
            .max_duration_minutes
            .unwrap_or(self.config.max_duration_minutes);
        let max_journeys = preferences.max_journeys.unwrap_or(self.config.max_journeys).max(1);

        let found = self.search(
            origin,
            destination,
            departure,
            preferences,
            max_duration_minutes * 60.0,
            cancel,
        )?;
        let mut journeys = found
            .into_iter()
            .map(|labels| self.journey(origin, destination, departure, &labels))
            .collect_vec();
        if journeys.is_empty() {
            log::debug!("no route from {origin} to {destination} within {max_duration_minutes} min");
            return Err(PlanError::NoRouteFound {
                origin: origin.clone(),
                destination: destination.clone(),
                max_duration_minutes,
            });
        }
        journeys.truncate(max_journeys);

        let warnings = if self.signals_refresh_failed || journeys.iter().any(Journey::is_stale) {
            let warning = StaleDataWarning {
                source: StaleSource::Signals,
                age: self
                    .signals
                    .as_ref()
                    .map(|s| departure.signed_duration_since(s.value.timestamp()).abs()),
                max_age: self.max_signal_age,
                refresh_failed: self.signals_refresh_failed,
            };
            log::warn!("journeys from {origin} to {destination} use stale signals: {warning}");
            vec![warning]
        } else {
            Vec::new()
        };

        Ok(PlanOutcome { journeys, warnings })
    }

    /// Returns the chain of labels (origin first) for every ranked journey.
    fn search(
        &self,
        origin: &StopId,
        destination: &StopId,
        departure: NaiveDateTime,
        preferences: &Preferences,
        max_elapsed: Seconds,
        cancel: &Cancellation,
    ) -> Result<Vec<Vec<Label>>, PlanError> {
        let snapshot = self.signals.as_ref().map(|s| &s.value);
        let mut arena: Vec<Label> = Vec::new();
        let mut bags: HashMap<BagKey, Vec<usize>> = HashMap::new();
        let mut arrived: Vec<usize> = Vec::new();
        let mut heap = BinaryHeap::new();

        arena.push(Label {
            stop: origin.clone(),
            elapsed: 0.0,
            transfers: 0,
            boardings: 0,
            fare: 0.0,
            vehicle: None,
            parent: None,
            leg: None,
            dominated: false,
        });
        bags.insert((origin.clone(), None, false), vec![0]);
        heap.push(QueueEntry {
            key: arena[0].key(&preferences.order),
            seq: 0,
            label: 0,
        });

        let mut popped = 0usize;
        while let Some(entry) = heap.pop() {
            popped += 1;
            if popped % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                log::debug!("planning cancelled after {popped} labels");
                return Err(PlanError::Cancelled);
            }
            let current = arena[entry.label].clone();
            if current.dominated {
                continue;
            }
            if arrived.iter().any(|&idx| arena[idx].dominates(&current)) {
                continue;
            }
            if &current.stop == destination {
                arrived.push(entry.label);
                continue;
            }

            for edge in self.graph.neighbors(&current.stop) {
                let Some(next) = self.extend(&current, entry.label, edge, departure, preferences, snapshot)
                else {
                    continue;
                };
                if next.elapsed > max_elapsed {
                    continue;
                }
                if arrived.iter().any(|&idx| arena[idx].dominates(&next)) {
                    continue;
                }

                let bag_key = (next.stop.clone(), next.vehicle.clone(), next.boardings > 0);
                let bag = bags.entry(bag_key).or_default();
                if bag.iter().any(|&idx| arena[idx].dominates(&next)) {
                    continue;
                }
                bag.retain(|&idx| {
                    if next.dominates(&arena[idx]) {
                        arena[idx].dominated = true;
                        false
                    } else {
                        true
                    }
                });
                if bag.len() >= self.config.max_labels_per_stop {
                    continue;
                }

                let idx = arena.len();
                bag.push(idx);
                heap.push(QueueEntry {
                    key: next.key(&preferences.order),
                    seq: idx,
                    label: idx,
                });
                arena.push(next);
            }
        }

        // labels reaching the destination in different vehicles may still dominate each other
        let pareto = arrived
            .iter()
            .copied()
            .filter(|&idx| !arena[idx].dominated)
            .filter(|&idx| {
                !arrived.iter().any(|&other| {
                    other != idx
                        && arena[other].dominates(&arena[idx])
                        && (!arena[idx].dominates(&arena[other]) || other < idx)
                })
            })
            .sorted_by(|&a, &b| {
                lexicographic(&arena[a].key(&preferences.order), &arena[b].key(&preferences.order))
                    .then(a.cmp(&b))
            })
            .collect_vec();
        log::debug!(
            "search from {origin} to {destination} settled {popped} labels, {} pareto-optimal",
            pareto.len()
        );

        Ok(pareto
            .into_iter()
            .map(|idx| {
                let mut chain = Vec::new();
                let mut cursor = Some(idx);
                while let Some(i) = cursor {
                    chain.push(arena[i].clone());
                    cursor = arena[i].parent;
                }
                chain.reverse();
                chain
            })
            .collect())
    }

    /// Label reached by traversing `edge` from `label`, or None when the rider
    /// cannot use the edge in their current context.
    fn extend(
        &self,
        label: &Label,
        parent: usize,
        edge: &EdgeRef,
        departure: NaiveDateTime,
        preferences: &Preferences,
        snapshot: Option<&SignalSnapshot>,
    ) -> Option<Label> {
        if !preferences.modes.contains(&edge.mode) {
            return None;
        }
        if edge.mode == Mode::Cycle && label.boardings > 0 && !preferences.allow_cycle_after_transit {
            return None;
        }

        let vehicle = edge.vehicle_key();
        let load = self.load_factor(edge, offset(departure, label.elapsed)).unwrap_or(0.0);
        let mut wait = 0.0;
        let mut transfers = label.transfers;
        let mut boardings = label.boardings;
        let mut fare = label.fare;
        let stays_aboard = matches!((&label.vehicle, &vehicle), (Some(current), Some(next)) if current == next);
        if vehicle.is_some() && !stays_aboard {
            if boardings > 0 {
                transfers += 1;
                wait += self.config.min_transfer_seconds;
            }
            if self.config.include_boarding_wait {
                wait += self.costs.boarding_wait(edge);
            }
            if load > 1.0 {
                // riders left behind wait for the following vehicles
                let headway = edge.headway_minutes().unwrap_or(0.0) * 60.0;
                wait += self.config.crowding_wait_weight * (load - 1.0) * headway;
            }
            boardings += 1;
            fare += self.config.boarding_fare.get(edge.mode);
        }
        fare += self.config.fare_per_km.get(edge.mode) * edge.base_distance / 1000.0;

        let depart_offset = label.elapsed + wait;
        let weight = self
            .costs
            .weight(edge, offset(departure, depart_offset), snapshot)
            .crowded(load);
        let elapsed = depart_offset + weight.effective_duration;

        Some(Label {
            stop: edge.to.clone(),
            elapsed,
            transfers,
            boardings,
            fare,
            vehicle,
            parent: Some(parent),
            leg: Some(Leg {
                edge: Arc::clone(edge),
                wait,
                depart_offset,
                weight,
            }),
            dominated: false,
        })
    }

    fn journey(
        &self,
        origin: &StopId,
        destination: &StopId,
        departure: NaiveDateTime,
        chain: &[Label],
    ) -> Journey {
        let legs = chain
            .iter()
            .filter_map(|label| label.leg.as_ref())
            .map(|leg| JourneyLeg {
                edge: Arc::clone(&leg.edge),
                wait: leg.wait,
                depart_at: offset(departure, leg.depart_offset),
                arrive_at: offset(departure, leg.depart_offset + leg.weight.effective_duration),
                weight: leg.weight.clone(),
            })
            .collect_vec();
        let last = chain.last();
        let distance = legs.iter().map(|leg| leg.edge.base_distance).sum::<f64>();
        let emissions = legs
            .iter()
            .map(|leg| leg.edge.mode.emissions_per_km() * leg.edge.base_distance / 1000.0)
            .sum::<f64>();
        Journey {
            origin: origin.clone(),
            destination: destination.clone(),
            departure,
            legs,
            total_duration: last.map(|l| l.elapsed).unwrap_or(0.0),
            transfers: last.map(|l| l.transfers).unwrap_or(0),
            fare: last.map(|l| l.fare).unwrap_or(0.0),
            distance,
            emissions,
        }
    }
}
