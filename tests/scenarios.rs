use approx::assert_relative_eq;
use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools;
use std::{collections::BTreeMap, sync::Arc};

use smart_transit::{
    config::{CostConfig, PlannerConfig},
    cost::EdgeCostProvider,
    data::{BoundingBox, Coordinate, Edge, EdgeId, Mode, Stop, StopId},
    demand::{
        DemandForecaster, DemandSource, DemandTarget, ForecastContext, LinearDemandModel, Observation,
        SeasonalBaseline, TargetCoefficients, TimeWindow,
    },
    error::{PlanError, ScheduleError},
    planner::RoutePlanner,
    scheduler::{ServiceScheduler, ServiceStatus},
    shared::Versioned,
    signal::{CellSignal, SignalSnapshot, Weather, WeatherKind},
    Cancellation, Criterion, EngineConfig, Preferences, ServicePlan, TransitEngine, TransitGraph,
};

fn seven_am() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 4)
        .and_then(|d| d.and_hms_opt(7, 0, 0))
        .expect("valid test datetime")
}

fn stop(id: &str) -> StopId {
    StopId::from(id)
}

fn edge(id: &str) -> EdgeId {
    EdgeId::from(id)
}

/// A -bus 10 min-> B -metro 5 min-> C, and a 40 min walk A -> C
fn triangle() -> TransitGraph {
    let mut graph = TransitGraph::new();
    for (id, lat) in [("A", 19.00), ("B", 19.02), ("C", 19.04)] {
        graph.add_stop(Stop::new(id, id, Coordinate::new(lat, 72.85))).unwrap();
    }
    graph
        .add_edge(Edge::new("ab", "A", "B", Mode::Bus, 600.0, 2200.0).with_service(60.0, 6.0))
        .unwrap();
    graph
        .add_edge(Edge::new("bc", "B", "C", Mode::Metro, 300.0, 2200.0).with_service(300.0, 12.0))
        .unwrap();
    graph
        .add_edge(Edge::new("ac", "A", "C", Mode::Walk, 2400.0, 4400.0))
        .unwrap();
    graph
}

fn snapshot(congestion: f64, weather: Weather) -> Arc<Versioned<SignalSnapshot>> {
    let region = BoundingBox {
        min: Coordinate::new(18.9, 72.8),
        max: Coordinate::new(19.1, 72.9),
    };
    Arc::new(Versioned {
        version: 1,
        published_at: seven_am(),
        value: SignalSnapshot::uniform(seven_am(), region, CellSignal::new(congestion, weather)).unwrap(),
    })
}

/// Timetable-free boarding so durations match the base edge durations.
fn planner_config() -> PlannerConfig {
    PlannerConfig {
        min_transfer_seconds: 0.0,
        include_boarding_wait: false,
        ..PlannerConfig::default()
    }
}

fn planner(graph: TransitGraph, signals: Arc<Versioned<SignalSnapshot>>, cost: CostConfig) -> RoutePlanner {
    let config = EngineConfig {
        cost,
        ..EngineConfig::default()
    };
    RoutePlanner::new(
        Arc::new(graph),
        Some(signals),
        EdgeCostProvider::from_config(&config),
        planner_config(),
        config.freshness.max_signal_age(),
    )
}

#[test]
fn test_journeys_never_undercut_their_leg_weights() {
    let mut graph = triangle();
    graph.add_stop(Stop::new("D", "D", Coordinate::new(19.05, 72.86))).unwrap();
    graph
        .add_edge(Edge::new("cd", "C", "D", Mode::Cycle, 400.0, 1500.0))
        .unwrap();
    graph
        .add_edge(Edge::new("bd", "B", "D", Mode::Train, 900.0, 5000.0).with_service(800.0, 4.0))
        .unwrap();
    graph.connect_walking_transfers(2_500.0, 1.3).unwrap();
    let stops = graph.all_stops().map(|s| s.id.clone()).collect_vec();

    let planner = RoutePlanner::new(
        Arc::new(graph),
        Some(snapshot(0.6, Weather::of_kind(WeatherKind::Rain))),
        EdgeCostProvider::from_config(&EngineConfig::default()),
        PlannerConfig::default(),
        EngineConfig::default().freshness.max_signal_age(),
    );
    for (origin, destination) in stops.iter().cartesian_product(stops.iter()) {
        match planner.plan(origin, destination, seven_am(), &Preferences::default(), &Cancellation::none()) {
            Ok(outcome) => {
                assert!(!outcome.journeys.is_empty());
                for journey in outcome.journeys {
                    let legs: f64 = journey.legs.iter().map(|l| l.weight.effective_duration).sum();
                    assert!(
                        journey.total_duration + 1e-9 >= legs,
                        "{origin} -> {destination}: {} < {legs}",
                        journey.total_duration
                    );
                }
            }
            Err(PlanError::NoRouteFound { .. }) => {}
            Err(err) => panic!("{origin} -> {destination}: {err}"),
        }
    }
}

#[test]
fn test_origin_to_itself_is_a_zero_leg_journey() {
    let planner = planner(triangle(), snapshot(0.0, Weather::clear()), CostConfig::default());
    for id in ["A", "B", "C"] {
        let outcome = planner
            .plan(&stop(id), &stop(id), seven_am(), &Preferences::default(), &Cancellation::none())
            .unwrap();
        assert_eq!(outcome.journeys.len(), 1);
        assert!(outcome.journeys[0].legs.is_empty());
    }
}

#[test]
fn test_weight_is_monotone_in_congestion_and_severity() {
    let costs = EdgeCostProvider::from_config(&EngineConfig::default());
    let graph = triangle();
    let levels = (0..=20).map(|i| i as f64 / 20.0).collect_vec();
    for edge in graph.all_edges() {
        for (&low, &high) in levels.iter().tuple_windows() {
            for fixed in [0.0, 0.5, 1.0] {
                let weather = |severity| Weather {
                    kind: WeatherKind::Rain,
                    severity,
                };
                let by_congestion = |c: f64| {
                    costs
                        .weight(edge, seven_am(), Some(&snapshot(c, weather(fixed)).value))
                        .effective_duration
                };
                assert!(by_congestion(low) <= by_congestion(high));
                let by_severity = |s: f64| {
                    costs
                        .weight(edge, seven_am(), Some(&snapshot(fixed, weather(s)).value))
                        .effective_duration
                };
                assert!(by_severity(low) <= by_severity(high));
            }
        }
    }
}

#[test]
fn test_low_confidence_forecast_equals_seasonal_baseline() {
    let target = DemandTarget::Edge(edge("bc"));
    let history = (1..=4)
        .map(|weeks| Observation {
            target: target.clone(),
            at: seven_am() - chrono::Duration::weeks(weeks),
            riders: 100.0 + 10.0 * weeks as f64,
        })
        .collect_vec();
    let baseline = Arc::new(SeasonalBaseline::from_observations(history));
    // residuals as large as the prediction itself: confidence 0.5
    let model = LinearDemandModel::new(vec![TargetCoefficients {
        target: target.clone(),
        intercept: 400.0,
        hourly: vec![1.0; 24],
        weekend_factor: 1.0,
        weather_coefficient: 0.0,
        event_coefficient: 0.0,
        residual_std: 400.0,
    }]);
    let forecaster = DemandForecaster::new(
        Arc::new(model),
        Arc::clone(&baseline),
        EngineConfig::default().forecast,
    );
    let window = TimeWindow::hours(seven_am(), 1);
    let forecast = forecaster
        .forecast(window, &ForecastContext::default(), &[target.clone()], &Cancellation::none())
        .unwrap();
    let slot = window.slots(60)[0];
    let record = forecast.records_for(&target).next().expect("one record");
    assert_eq!(record.source, DemandSource::SeasonalBaseline);
    assert_relative_eq!(record.predicted_riders, baseline.estimate(&target, &slot).riders);
    assert_relative_eq!(record.predicted_riders, 125.0);
}

fn spike_forecast() -> smart_transit::demand::DemandForecast {
    let model = LinearDemandModel::new(vec![
        TargetCoefficients {
            target: DemandTarget::Edge(edge("ab")),
            intercept: 10.0,
            hourly: vec![1.0; 24],
            weekend_factor: 1.0,
            weather_coefficient: 0.0,
            event_coefficient: 0.0,
            residual_std: 1.0,
        },
        TargetCoefficients {
            target: DemandTarget::Edge(edge("bc")),
            intercept: 6000.0,
            hourly: vec![1.0; 24],
            weekend_factor: 1.0,
            weather_coefficient: 0.0,
            event_coefficient: 0.0,
            residual_std: 50.0,
        },
    ]);
    DemandForecaster::new(
        Arc::new(model),
        Arc::new(SeasonalBaseline::default()),
        EngineConfig::default().forecast,
    )
    .forecast(
        TimeWindow::hours(seven_am(), 3),
        &ForecastContext::default(),
        &DemandTarget::all_in(&triangle()),
        &Cancellation::none(),
    )
    .unwrap()
}

fn scheduler(budget: f64) -> ServiceScheduler {
    let mut config = EngineConfig::default().scheduler;
    config.fleet_budget = Some(budget);
    ServiceScheduler::new(config)
}

#[test]
fn test_optimisation_is_deterministic_for_a_seed() {
    let demand = spike_forecast();
    let graph = triangle();
    let first = scheduler(18.0)
        .optimize(&graph, &demand, Some(3), None, &Cancellation::none())
        .unwrap();
    let second = scheduler(18.0)
        .optimize(&graph, &demand, Some(3), None, &Cancellation::none())
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_fleet_budget_is_conserved() {
    let demand = spike_forecast();
    let graph = triangle();
    for budget in [13.5, 16.0, 18.0, 21.25, 22.5] {
        let plan = scheduler(budget)
            .optimize(&graph, &demand, None, None, &Cancellation::none())
            .unwrap();
        assert_relative_eq!(plan.total_frequency(), budget, epsilon = 1e-6);
    }
    for budget in [5.0, 40.0] {
        let result = scheduler(budget).optimize(&graph, &demand, None, None, &Cancellation::none());
        assert!(matches!(result, Err(ScheduleError::BudgetOutsideEnvelope { .. })));
    }
}

#[test]
fn test_clear_conditions_prefer_transit_over_walking() {
    let planner = planner(triangle(), snapshot(0.0, Weather::clear()), CostConfig::default());
    let outcome = planner
        .plan(
            &stop("A"),
            &stop("C"),
            seven_am(),
            &Preferences::minimize(Criterion::Time),
            &Cancellation::none(),
        )
        .unwrap();
    let best = &outcome.journeys[0];
    assert_eq!(best.stops(), vec![stop("A"), stop("B"), stop("C")]);
    assert_relative_eq!(best.total_duration, 15.0 * 60.0, epsilon = 1e-6);
    let walk_rank = outcome
        .journeys
        .iter()
        .position(|j| j.modes() == vec![Mode::Walk])
        .expect("the walk is pareto-optimal on fare");
    assert!(walk_rank > 0);
    assert!(outcome.warnings.is_empty());
}

#[test]
fn test_severe_weather_keeps_the_transit_journey() {
    let mut cost = CostConfig::default();
    let doubled = cost.weather_sensitivity.get(Mode::Walk) * 2.0;
    cost.weather_sensitivity.set(Mode::Walk, doubled);
    let storm = Weather {
        kind: WeatherKind::Rain,
        severity: 1.0,
    };
    let clear = planner(triangle(), snapshot(0.0, Weather::clear()), cost.clone())
        .plan(&stop("A"), &stop("C"), seven_am(), &Preferences::default(), &Cancellation::none())
        .unwrap();
    let severe = planner(triangle(), snapshot(0.0, storm), cost)
        .plan(&stop("A"), &stop("C"), seven_am(), &Preferences::default(), &Cancellation::none())
        .unwrap();
    assert_eq!(severe.journeys[0].stops(), vec![stop("A"), stop("B"), stop("C")]);

    let walk_duration = |journeys: &[smart_transit::Journey]| {
        journeys
            .iter()
            .find(|j| j.modes() == vec![Mode::Walk])
            .map(|j| j.total_duration)
    };
    let clear_walk = walk_duration(&clear.journeys).expect("walk alternative");
    let severe_walk = walk_duration(&severe.journeys).expect("walk alternative");
    assert!(severe_walk > clear_walk);
}

#[test]
fn test_demand_spike_shifts_service_within_envelope() {
    let graph = triangle();
    let current = ServicePlan {
        topology_version: graph.topology_version(),
        demand_version: None,
        window: None,
        frequencies: BTreeMap::from([(edge("ab"), 6.0), (edge("bc"), 12.0)]),
        total_cost: 0.0,
        iterations: 0,
        status: ServiceStatus::Converged,
        hotspots: Vec::new(),
    };
    let config = EngineConfig::default().scheduler;
    let plan = scheduler(18.0)
        .optimize(&graph, &spike_forecast(), Some(1), Some(&current), &Cancellation::none())
        .unwrap();

    let ab = plan.frequency(&edge("ab")).unwrap();
    let bc = plan.frequency(&edge("bc")).unwrap();
    assert!(bc > 12.0);
    assert!(ab < 6.0);
    assert_relative_eq!(bc - 12.0, 6.0 - ab, epsilon = 1e-6);
    assert!(bc <= 12.0 * (1.0 + config.max_change) + 1e-6);
    assert!(ab >= 6.0 * (1.0 - config.max_change) - 1e-6);
    assert!(plan.hotspots.iter().any(|h| h.edge == edge("bc")));
}

#[test]
fn test_default_budget_never_leaves_the_envelope() {
    let graph = triangle();
    let current = ServicePlan {
        topology_version: graph.topology_version(),
        demand_version: None,
        window: None,
        frequencies: BTreeMap::from([(edge("ab"), 6.0), (edge("bc"), 12.0)]),
        total_cost: 0.0,
        iterations: 0,
        status: ServiceStatus::Converged,
        hotspots: Vec::new(),
    };
    let config = EngineConfig::default().scheduler;
    let plan = ServiceScheduler::new(config.clone())
        .optimize(&graph, &spike_forecast(), None, Some(&current), &Cancellation::none())
        .unwrap();
    assert_relative_eq!(plan.total_frequency(), 18.0, epsilon = 1e-6);
    for (id, running) in [("ab", 6.0), ("bc", 12.0)] {
        let f = plan.frequency(&edge(id)).unwrap();
        assert!(f >= running * (1.0 - config.max_change) - 1e-6, "{id} = {f}");
        assert!(f <= running * (1.0 + config.max_change) + 1e-6, "{id} = {f}");
    }
}

#[test]
fn test_engine_end_to_end() {
    let model = LinearDemandModel::new(vec![TargetCoefficients {
        target: DemandTarget::Edge(edge("bc")),
        intercept: 6000.0,
        hourly: vec![1.0; 24],
        weekend_factor: 1.0,
        weather_coefficient: 0.0,
        event_coefficient: 0.0,
        residual_std: 50.0,
    }]);
    let forecaster = DemandForecaster::new(
        Arc::new(model),
        Arc::new(SeasonalBaseline::default()),
        EngineConfig::default().forecast,
    );
    let mut config = EngineConfig::default();
    config.planner = planner_config();
    config.scheduler.fleet_budget = Some(18.0);
    let now = seven_am();
    let engine = TransitEngine::new(triangle(), forecaster, config).with_clock(Arc::new(move || now));

    engine.publish_signals(snapshot(0.0, Weather::clear()).value.clone());
    let outcome = engine
        .plan(&stop("A"), &stop("C"), now, &Preferences::default(), &Cancellation::none())
        .unwrap();
    assert_relative_eq!(outcome.journeys[0].total_duration, 900.0, epsilon = 1e-6);

    let scheduled = engine
        .optimize_schedule(TimeWindow::hours(now, 2), &Cancellation::none())
        .unwrap();
    let version = engine.apply_service_plan(&scheduled.plan.value).unwrap();
    assert_eq!(engine.network().version(), version);
    assert!(engine.network().edge(&edge("bc")).map(|e| e.frequency).unwrap_or(0.0) > 12.0);
    assert!(engine.current_plan().is_some());
    assert!(engine.simulate(&smart_transit::Scenario::default()).is_some());
}
