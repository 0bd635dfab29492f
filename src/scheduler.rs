use itertools::Itertools;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::{collections::BTreeMap, fmt};

use crate::{
    cancel::Cancellation,
    config::SchedulerConfig,
    cost::EdgeCostProvider,
    data::*,
    demand::{DemandForecast, DemandRecord, TimeWindow},
    error::ScheduleError,
    graph::TransitGraph,
    signal::WeatherKind,
};

/// Floor used when a frequency of zero would make the headway infinite.
const MIN_EFFECTIVE_FREQUENCY: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Converged,
    /// iteration limit reached; the plan is the best found so far
    Partial,
}

/// Edge whose riders keep exceeding capacity even after optimisation.
#[derive(Debug, Clone, PartialEq)]
pub struct Hotspot {
    pub edge: EdgeId,
    pub overcrowding_cost: f64,
    /// peak riders / hourly capacity
    pub load_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServicePlan {
    /// topology the plan was computed for; frequency changes do not move it
    pub topology_version: u64,
    pub demand_version: Option<u64>,
    pub window: Option<TimeWindow>,
    /// vehicle-trips per hour per scheduled edge
    pub frequencies: BTreeMap<EdgeId, f64>,
    pub total_cost: f64,
    pub iterations: usize,
    pub status: ServiceStatus,
    pub hotspots: Vec<Hotspot>,
}

impl ServicePlan {
    /// A plan is only meaningful for the topology and forecast it was computed from.
    pub fn is_valid_for(&self, topology_version: u64, demand_version: Option<u64>) -> bool {
        self.topology_version == topology_version && self.demand_version == demand_version
    }

    pub fn total_frequency(&self) -> f64 {
        self.frequencies.values().sum()
    }

    pub fn frequency(&self, edge: &EdgeId) -> Option<f64> {
        self.frequencies.get(edge).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub wait: f64,
    pub overcrowding: f64,
    pub operating: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.wait + self.overcrowding + self.operating
    }
}

impl std::ops::AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.wait += rhs.wait;
        self.overcrowding += rhs.overcrowding;
        self.operating += rhs.operating;
    }
}

/// What-if conditions applied on top of a forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scenario {
    /// change in ridership in percent, -50 halves every prediction
    pub passenger_change_pct: f64,
    /// 1.0 = congestion as forecast, 2.0 = twice as congested
    pub congestion_factor: f64,
    pub weather: WeatherKind,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            passenger_change_pct: 0.0,
            congestion_factor: 1.0,
            weather: WeatherKind::Clear,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recommendation {
    IncreaseFrequency { edge: EdgeId, load_factor: f64 },
    AvoidCongestedSegments { edges: Vec<EdgeId> },
    AddTravelTimeBuffer { percent: f64 },
    HeatPrecautions,
    NoChange,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::IncreaseFrequency { edge, load_factor } => write!(
                f,
                "increase frequency on {edge} (load factor {:.0}%)",
                load_factor * 100.0
            ),
            Recommendation::AvoidCongestedSegments { edges } => write!(
                f,
                "run express or diverted service around congested segments {}",
                edges.iter().join(", ")
            ),
            Recommendation::AddTravelTimeBuffer { percent } => {
                write!(f, "add a {percent:.0}% travel time buffer on exposed routes")
            }
            Recommendation::HeatPrecautions => {
                write!(f, "check vehicle air conditioning and water supply on long routes")
            }
            Recommendation::NoChange => write!(f, "no adjustments needed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub scenario: Scenario,
    pub load_factors: BTreeMap<EdgeId, f64>,
    pub baseline_cost: f64,
    pub total_cost: f64,
    pub hotspots: Vec<Hotspot>,
    pub recommendations: Vec<Recommendation>,
}

/// Rider growth above which extra service is recommended.
const GROWTH_ALERT_PCT: f64 = 20.0;
const CONGESTION_ALERT_FACTOR: f64 = 1.5;
const WEATHER_BUFFER_PCT: f64 = 15.0;

/// State of one scheduled edge during optimisation.
struct EdgeState<'a> {
    edge: &'a EdgeRef,
    records: Vec<&'a DemandRecord>,
    frequency: f64,
    low: f64,
    high: f64,
}

struct Move {
    donor: usize,
    receiver: usize,
    improvement: f64,
}

pub struct ServiceScheduler {
    config: SchedulerConfig,
}

impl ServiceScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Redistributes the fleet budget over the scheduled edges of `graph`.
    /// No edge moves more than `max_change` away from the frequency it runs
    /// at today, taken from `current` or else from the graph.
    pub fn optimize(
        &self,
        graph: &TransitGraph,
        demand: &DemandForecast,
        demand_version: Option<u64>,
        current: Option<&ServicePlan>,
        cancel: &Cancellation,
    ) -> Result<ServicePlan, ScheduleError> {
        let scheduled = graph.all_edges().filter(|e| e.mode.is_scheduled()).collect_vec();
        if scheduled.is_empty() {
            return Err(ScheduleError::NothingToSchedule);
        }
        let running = current_frequencies(&scheduled, current);
        let in_service: f64 = running.iter().sum();
        let budget = self.config.fleet_budget.unwrap_or(in_service);
        if !(budget.is_finite() && budget > 0.0) {
            return Err(ScheduleError::InvalidBudget(budget));
        }

        // nothing runs yet: the first allocation is a uniform split
        let anchors = if in_service > 0.0 {
            running
        } else {
            vec![budget / scheduled.len() as f64; scheduled.len()]
        };
        let bounds = anchors.iter().map(|&a| self.envelope(a)).collect_vec();
        let starts = reconcile(&anchors, &bounds, budget)?;

        let hours = window_hours(demand);
        let mut slots = scheduled
            .iter()
            .zip(starts)
            .zip(bounds)
            .map(|((&edge, start), (low, high))| EdgeState {
                edge,
                records: demand.edge_records(&edge.id).collect(),
                frequency: start,
                low,
                high,
            })
            .collect_vec();

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut order = (0..slots.len()).collect_vec();
        let mut step = (self.config.initial_step_fraction * budget / slots.len() as f64).max(self.config.min_step);
        let mut iterations = 0;
        let status = loop {
            if iterations >= self.config.max_iterations {
                break ServiceStatus::Partial;
            }
            if cancel.is_cancelled() {
                log::debug!("schedule optimisation cancelled after {iterations} iterations");
                return Err(ScheduleError::Cancelled);
            }
            iterations += 1;

            order.shuffle(&mut rng);
            match self.best_move(&slots, &order, step, hours) {
                Some(best) if best.improvement > self.config.convergence_threshold => {
                    slots[best.donor].frequency -= step;
                    slots[best.receiver].frequency += step;
                    log::debug!(
                        "moved {step:.3} trips/h from {} to {} (gain {:.3})",
                        slots[best.donor].edge.id,
                        slots[best.receiver].edge.id,
                        best.improvement
                    );
                }
                _ if step > self.config.min_step => {
                    step = (step / 2.0).max(self.config.min_step);
                }
                _ => break ServiceStatus::Converged,
            }
        };

        let total_cost = slots
            .iter()
            .map(|s| self.edge_cost(s.edge, s.frequency, &s.records, hours).total())
            .sum();
        let hotspots = self.hotspots(slots.iter().map(|s| (s.edge, s.frequency, s.records.as_slice())), hours);
        let frequencies: BTreeMap<EdgeId, f64> = slots
            .iter()
            .map(|s| (s.edge.id.clone(), s.frequency))
            .collect();

        if status == ServiceStatus::Partial {
            log::warn!(
                "schedule optimisation stopped at {} iterations without converging, returning best plan found",
                self.config.max_iterations
            );
        }
        log::info!(
            "optimised {} edge(s) in {iterations} iteration(s): cost {total_cost:.1}, {} hotspot(s)",
            frequencies.len(),
            hotspots.len()
        );

        Ok(ServicePlan {
            topology_version: graph.topology_version(),
            demand_version,
            window: demand.window(),
            frequencies,
            total_cost,
            iterations,
            status,
            hotspots,
        })
    }

    /// Re-costs `plan` under `scenario`. Congestion and weather stretch cycle
    /// times, so the same fleet delivers fewer trips per hour.
    pub fn simulate(
        &self,
        graph: &TransitGraph,
        demand: &DemandForecast,
        plan: &ServicePlan,
        scenario: &Scenario,
        costs: &EdgeCostProvider,
    ) -> SimulationReport {
        let scaled = demand.scaled((1.0 + scenario.passenger_change_pct / 100.0).max(0.0));
        let hours = window_hours(demand);
        let extra_congestion = (scenario.congestion_factor - 1.0).clamp(0.0, 1.0);
        let severity = scenario.weather.typical_severity();

        let edges = graph
            .all_edges()
            .filter(|e| e.mode.is_scheduled())
            .map(|edge| {
                let frequency = plan.frequency(&edge.id).unwrap_or(edge.frequency);
                let stretch = costs.congestion_multiplier(edge.mode, extra_congestion)
                    + costs.weather_penalty(edge.mode, severity);
                (edge, frequency, frequency / stretch)
            })
            .collect_vec();

        let mut baseline_cost = 0.0;
        let mut total_cost = 0.0;
        let mut load_factors = BTreeMap::new();
        let mut stressed = Vec::new();
        for (edge, frequency, effective) in edges.iter() {
            let baseline_records = demand.edge_records(&edge.id).collect_vec();
            let records = scaled.edge_records(&edge.id).collect_vec();
            baseline_cost += self.edge_cost(edge, *frequency, &baseline_records, hours).total();
            total_cost += self.edge_cost(edge, *effective, &records, hours).total();
            load_factors.insert(edge.id.clone(), load_factor(edge, *effective, &records));
            stressed.push((*edge, *effective, records));
        }
        let hotspots = self.hotspots(stressed.iter().map(|(e, f, r)| (*e, *f, r.as_slice())), hours);

        let mut recommendations = Vec::new();
        if scenario.passenger_change_pct > GROWTH_ALERT_PCT {
            recommendations.extend(
                load_factors
                    .iter()
                    .filter(|(_, lf)| **lf > 1.0)
                    .sorted_by(|a, b| b.1.total_cmp(a.1))
                    .map(|(edge, lf)| Recommendation::IncreaseFrequency {
                        edge: edge.clone(),
                        load_factor: *lf,
                    }),
            );
        }
        if scenario.congestion_factor > CONGESTION_ALERT_FACTOR {
            let exposed = edges
                .iter()
                .filter(|(e, _, _)| costs.congestion_multiplier(e.mode, 1.0) > 1.0)
                .map(|(e, _, _)| e.id.clone())
                .collect_vec();
            if !exposed.is_empty() {
                recommendations.push(Recommendation::AvoidCongestedSegments { edges: exposed });
            }
        }
        match scenario.weather {
            WeatherKind::Rain | WeatherKind::Fog => recommendations.push(Recommendation::AddTravelTimeBuffer {
                percent: WEATHER_BUFFER_PCT,
            }),
            WeatherKind::ExtremeHeat => recommendations.push(Recommendation::HeatPrecautions),
            WeatherKind::Clear => {}
        }
        if recommendations.is_empty() {
            recommendations.push(Recommendation::NoChange);
        }

        log::info!(
            "simulated {:?}: cost {baseline_cost:.1} -> {total_cost:.1}, {} hotspot(s)",
            scenario,
            hotspots.len()
        );
        SimulationReport {
            scenario: *scenario,
            load_factors,
            baseline_cost,
            total_cost,
            hotspots,
            recommendations,
        }
    }

    /// Cost of running `edge` at `frequency` against its demand records,
    /// accumulated over the forecast window.
    pub fn edge_cost(&self, edge: &Edge, frequency: f64, records: &[&DemandRecord], hours: f64) -> CostBreakdown {
        let effective = frequency.max(MIN_EFFECTIVE_FREQUENCY);
        let half_headway_minutes = 30.0 / effective;
        let capacity = edge.capacity * frequency;
        let mut cost = CostBreakdown {
            operating: frequency * hours * edge.base_duration / 3600.0 * self.config.operating_cost_per_vehicle_hour,
            ..CostBreakdown::default()
        };
        for record in records {
            let slot_hours = record.slot.minutes as f64 / 60.0;
            let riders = record.predicted_riders * slot_hours;
            cost += CostBreakdown {
                wait: riders * half_headway_minutes * self.config.wait_weight,
                overcrowding: (record.predicted_riders - capacity).max(0.0) * slot_hours * self.config.overcrowding_weight,
                operating: 0.0,
            };
        }
        cost
    }

    /// Frequencies an edge running at `anchor` may take in one run.
    fn envelope(&self, anchor: f64) -> (f64, f64) {
        let floor = self.config.min_frequency.min(anchor);
        (
            (anchor * (1.0 - self.config.max_change)).max(floor),
            anchor * (1.0 + self.config.max_change),
        )
    }

    /// Cheapest donor and most rewarding receiver for a move of `step`.
    fn best_move(&self, slots: &[EdgeState<'_>], order: &[usize], step: f64, hours: f64) -> Option<Move> {
        let delta = |idx: usize, change: f64| {
            let slot = &slots[idx];
            self.edge_cost(slot.edge, slot.frequency + change, &slot.records, hours).total()
                - self.edge_cost(slot.edge, slot.frequency, &slot.records, hours).total()
        };

        let gains = order
            .iter()
            .copied()
            .filter(|&idx| slots[idx].frequency + step <= slots[idx].high + 1e-9)
            .map(|idx| (idx, delta(idx, step)))
            .collect_vec();
        let losses = order
            .iter()
            .copied()
            .filter(|&idx| slots[idx].frequency - step >= slots[idx].low - 1e-9)
            .map(|idx| (idx, delta(idx, -step)))
            .collect_vec();

        let mut best: Option<Move> = None;
        for &(receiver, gain) in gains.iter() {
            for &(donor, loss) in losses.iter() {
                if donor == receiver {
                    continue;
                }
                let improvement = -(gain + loss);
                if best.as_ref().map(|b| improvement > b.improvement).unwrap_or(true) {
                    best = Some(Move {
                        donor,
                        receiver,
                        improvement,
                    });
                }
            }
        }
        best
    }

    fn hotspots<'a>(
        &self,
        edges: impl Iterator<Item = (&'a EdgeRef, f64, &'a [&'a DemandRecord])>,
        hours: f64,
    ) -> Vec<Hotspot> {
        edges
            .filter_map(|(edge, frequency, records)| {
                let overcrowding_cost = self.edge_cost(edge, frequency, records, hours).overcrowding;
                (overcrowding_cost > self.config.hotspot_threshold).then(|| Hotspot {
                    edge: edge.id.clone(),
                    overcrowding_cost,
                    load_factor: load_factor(edge, frequency, records),
                })
            })
            .sorted_by(|a, b| b.overcrowding_cost.total_cmp(&a.overcrowding_cost))
            .collect()
    }
}

/// What each scheduled edge runs at today: the current plan where it names
/// the edge, the graph's frequency otherwise.
fn current_frequencies(scheduled: &[&EdgeRef], current: Option<&ServicePlan>) -> Vec<f64> {
    scheduled
        .iter()
        .map(|edge| {
            current
                .and_then(|plan| plan.frequency(&edge.id))
                .unwrap_or(edge.frequency)
                .max(0.0)
        })
        .collect()
}

/// Moves `anchors` to sum to `budget`, sharing the difference in proportion
/// to each edge's remaining room inside its bounds.
fn reconcile(anchors: &[f64], bounds: &[(f64, f64)], budget: f64) -> Result<Vec<f64>, ScheduleError> {
    let gap = budget - anchors.iter().sum::<f64>();
    if gap.abs() <= 1e-9 {
        return Ok(anchors.to_vec());
    }
    let room = anchors
        .iter()
        .zip(bounds)
        .map(|(&a, &(low, high))| {
            let room = if gap > 0.0 { high - a } else { a - low };
            room.max(0.0)
        })
        .collect_vec();
    let total_room: f64 = room.iter().sum();
    if total_room + 1e-9 < gap.abs() {
        return Err(ScheduleError::BudgetOutsideEnvelope {
            budget,
            min: bounds.iter().map(|b| b.0).sum(),
            max: bounds.iter().map(|b| b.1).sum(),
        });
    }
    log::debug!("reconciling {:.3} trips/h to a fleet budget of {budget:.3}", budget - gap);
    Ok(anchors
        .iter()
        .zip(room)
        .map(|(&a, r)| a + gap * r / total_room)
        .collect())
}

/// Length of the forecast window in hours; one hour when the forecast is empty.
fn window_hours(demand: &DemandForecast) -> f64 {
    demand
        .window()
        .map(|w| w.end.signed_duration_since(w.start).num_minutes() as f64 / 60.0)
        .filter(|h| *h > 0.0)
        .unwrap_or(1.0)
}

fn load_factor(edge: &Edge, frequency: f64, records: &[&DemandRecord]) -> f64 {
    let peak = records.iter().map(|r| r.predicted_riders).fold(0.0, f64::max);
    let capacity = edge.capacity * frequency;
    if capacity > 0.0 {
        peak / capacity
    } else if peak > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}
