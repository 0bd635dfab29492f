use chrono::NaiveDateTime;
use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    thread::{self, JoinHandle},
};

use crate::{
    cancel::Cancellation,
    config::EngineConfig,
    cost::EdgeCostProvider,
    data::StopId,
    demand::{DemandForecast, DemandForecaster, DemandTarget, ForecastContext, TimeWindow},
    error::{ForecastError, GraphError, PlanError, ScheduleError, StaleDataWarning, StaleSource},
    graph::TransitGraph,
    planner::{PlanOutcome, Preferences, RoutePlanner},
    scheduler::{Scenario, ServicePlan, ServiceScheduler, SimulationReport},
    shared::{SharedState, Versioned},
    signal::SignalSnapshot,
};

/// Source of "now" for publish instants and freshness checks.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().naive_utc())
}

#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub plan: Arc<Versioned<ServicePlan>>,
    pub warnings: Vec<StaleDataWarning>,
}

/// Owns the published network, signal snapshot, demand forecast and service
/// plan. Queries read whatever is published when they start and keep it until
/// they finish; writers publish complete new values.
pub struct TransitEngine {
    config: EngineConfig,
    costs: EdgeCostProvider,
    network: RwLock<Arc<TransitGraph>>,
    network_writer: Mutex<()>,
    signals: SharedState<SignalSnapshot>,
    demand: SharedState<DemandForecast>,
    plans: SharedState<ServicePlan>,
    context: RwLock<ForecastContext>,
    forecaster: DemandForecaster,
    scheduler: ServiceScheduler,
    clock: Clock,
}

impl TransitEngine {
    pub fn new(graph: TransitGraph, forecaster: DemandForecaster, config: EngineConfig) -> Self {
        log::info!(
            "engine starts with {} stops and {} edges",
            graph.stop_count(),
            graph.edge_count()
        );
        Self {
            costs: EdgeCostProvider::from_config(&config),
            scheduler: ServiceScheduler::new(config.scheduler.clone()),
            config,
            network: RwLock::new(Arc::new(graph)),
            network_writer: Mutex::new(()),
            signals: SharedState::empty(),
            demand: SharedState::empty(),
            plans: SharedState::empty(),
            context: RwLock::new(ForecastContext::default()),
            forecaster,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn network(&self) -> Arc<TransitGraph> {
        Arc::clone(&self.network.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Applies `change` to a copy of the network and publishes the copy if the
    /// change succeeds. Updates are applied one at a time; queries already
    /// running keep the version they started with.
    pub fn update_network<T>(
        &self,
        change: impl FnOnce(&mut TransitGraph) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let _writer = self.network_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = TransitGraph::clone(&self.network());
        let result = change(&mut next)?;
        let version = next.version();
        *self.network.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        log::info!("published network version {version}");
        Ok(result)
    }

    /// Publishes the plan's frequencies as a new network version.
    pub fn apply_service_plan(&self, plan: &ServicePlan) -> Result<u64, GraphError> {
        self.update_network(|graph| {
            *graph = graph.with_service_plan(plan)?;
            Ok(graph.version())
        })
    }

    pub fn publish_signals(&self, snapshot: SignalSnapshot) -> u64 {
        let network = self.network();
        if let Some(bbox) = network.bounding_box() {
            if !snapshot.covers(&bbox) {
                log::warn!("signal snapshot at {} covers only part of the network", snapshot.timestamp());
            }
        }
        let at = snapshot.timestamp();
        let version = self.signals.publish(snapshot, at).version;
        log::info!("published signal snapshot {version} taken at {at}");
        version
    }

    /// The last good snapshot stays in use; queries report it as stale.
    pub fn signal_refresh_failed(&self) {
        log::warn!("signal refresh failed, keeping last snapshot");
        self.signals.mark_refresh_failed();
    }

    pub fn signals(&self) -> Option<Arc<Versioned<SignalSnapshot>>> {
        self.signals.current()
    }

    pub fn plan(
        &self,
        origin: &StopId,
        destination: &StopId,
        departure: NaiveDateTime,
        preferences: &Preferences,
        cancel: &Cancellation,
    ) -> Result<PlanOutcome, PlanError> {
        RoutePlanner::new(
            self.network(),
            self.signals.current(),
            self.costs.clone(),
            self.config.planner.clone(),
            self.config.freshness.max_signal_age(),
        )
        .with_refresh_failed(self.signals.refresh_failed())
        .with_demand(self.demand.current())
        .plan(origin, destination, departure, preferences, cancel)
    }

    /// Forecasts every scheduled edge and stop of the current network over
    /// `window` and publishes the result. The context is remembered for
    /// re-forecasts triggered by [`TransitEngine::optimize_schedule`].
    pub fn forecast_demand(
        &self,
        window: TimeWindow,
        context: ForecastContext,
        cancel: &Cancellation,
    ) -> Result<Arc<Versioned<DemandForecast>>, ForecastError> {
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = context.clone();
        self.run_forecast(window, &context, cancel)
    }

    fn run_forecast(
        &self,
        window: TimeWindow,
        context: &ForecastContext,
        cancel: &Cancellation,
    ) -> Result<Arc<Versioned<DemandForecast>>, ForecastError> {
        let targets = DemandTarget::all_in(&self.network());
        match self.forecaster.forecast(window, context, &targets, cancel) {
            Ok(forecast) => {
                let published = self.demand.publish(forecast, (self.clock)());
                log::info!("published demand forecast {}", published.version);
                Ok(published)
            }
            Err(ForecastError::Cancelled) => Err(ForecastError::Cancelled),
            Err(err) => {
                log::warn!("demand refresh failed: {err}");
                self.demand.mark_refresh_failed();
                Err(err)
            }
        }
    }

    pub fn demand(&self) -> Option<Arc<Versioned<DemandForecast>>> {
        self.demand.current()
    }

    /// Optimises service for `window` against the latest forecast. A forecast
    /// that does not cover the window, or is older than the freshness limit,
    /// is refreshed first; if that refresh fails an old covering forecast is
    /// still used and reported as stale.
    pub fn optimize_schedule(
        &self,
        window: TimeWindow,
        cancel: &Cancellation,
    ) -> Result<ScheduleOutcome, ScheduleError> {
        let now = (self.clock)();
        let max_age = self.config.freshness.max_demand_age();
        let current = self.demand.current();
        let covering = current
            .filter(|d| d.value.window().map(|w| w.covers(&window)).unwrap_or(false));
        let fresh = covering.as_ref().filter(|d| d.age(now) <= max_age).cloned();

        let mut warnings = Vec::new();
        let demand = match fresh {
            Some(demand) => demand,
            None => {
                let context = self.context.read().unwrap_or_else(PoisonError::into_inner).clone();
                match (self.run_forecast(window, &context, cancel), covering) {
                    (Ok(demand), _) => demand,
                    (Err(ForecastError::Cancelled), _) => return Err(ScheduleError::Cancelled),
                    (Err(err), Some(stale)) => {
                        let warning = StaleDataWarning {
                            source: StaleSource::Demand,
                            age: Some(stale.age(now)),
                            max_age,
                            refresh_failed: self.demand.refresh_failed(),
                        };
                        log::warn!("optimising against old forecast after {err}: {warning}");
                        warnings.push(warning);
                        stale
                    }
                    (Err(err), None) => return Err(err.into()),
                }
            }
        };

        let network = self.network();
        let previous = self.plans.current();
        let plan = self.scheduler.optimize(
            &network,
            &demand.value,
            Some(demand.version),
            previous.as_ref().map(|p| &p.value),
            cancel,
        )?;
        let plan = self.plans.publish(plan, now);
        log::info!(
            "published service plan {} for network topology {}",
            plan.version,
            plan.value.topology_version
        );
        Ok(ScheduleOutcome { plan, warnings })
    }

    /// Runs [`TransitEngine::optimize_schedule`] on its own thread so planning
    /// queries are never blocked by it.
    pub fn optimize_schedule_in_background(
        self: &Arc<Self>,
        window: TimeWindow,
        cancel: Cancellation,
    ) -> JoinHandle<Result<ScheduleOutcome, ScheduleError>> {
        let engine = Arc::clone(self);
        thread::spawn(move || engine.optimize_schedule(window, &cancel))
    }

    /// Latest plan, as long as the network topology and the forecast it was
    /// computed from are still the published ones. Applying a plan changes
    /// frequencies only and keeps it current.
    pub fn current_plan(&self) -> Option<Arc<Versioned<ServicePlan>>> {
        let topology_version = self.network().topology_version();
        let demand_version = self.demand.version();
        self.plans
            .current()
            .filter(|plan| plan.value.is_valid_for(topology_version, demand_version))
    }

    /// What-if run of the current plan; None until a plan has been published.
    pub fn simulate(&self, scenario: &Scenario) -> Option<SimulationReport> {
        let plan = self.current_plan()?;
        let demand = self.demand.current()?;
        Some(
            self.scheduler
                .simulate(&self.network(), &demand.value, &plan.value, scenario, &self.costs),
        )
    }
}
