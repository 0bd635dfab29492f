use chrono::{Datelike, Duration, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use crate::{
    cancel::Cancellation,
    config::ForecastConfig,
    data::{EdgeId, StopId},
    error::{FeedError, ForecastError},
    graph::TransitGraph,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DemandTarget {
    Edge(EdgeId),
    Stop(StopId),
}

impl DemandTarget {
    /// Every scheduled edge and every stop of the graph.
    pub fn all_in(graph: &TransitGraph) -> Vec<DemandTarget> {
        graph
            .all_edges()
            .filter(|edge| edge.mode.is_scheduled())
            .map(|edge| DemandTarget::Edge(edge.id.clone()))
            .chain(graph.all_stops().map(|stop| DemandTarget::Stop(stop.id.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn hours(start: NaiveDateTime, hours: i64) -> Self {
        Self::new(start, start + Duration::hours(hours))
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at >= self.start && at < self.end
    }

    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Consecutive slots from `start`; the last one is cut at `end`.
    pub fn slots(&self, slot_minutes: i64) -> Vec<TimeSlot> {
        let mut slots = Vec::new();
        let mut start = self.start;
        while start < self.end && slot_minutes > 0 {
            let next = (start + Duration::minutes(slot_minutes)).min(self.end);
            slots.push(TimeSlot {
                start,
                minutes: next.signed_duration_since(start).num_minutes(),
            });
            start = next;
        }
        slots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeSlot {
    pub start: NaiveDateTime,
    pub minutes: i64,
}

impl TimeSlot {
    pub fn weekday(&self) -> Weekday {
        self.start.weekday()
    }

    pub fn hour(&self) -> u32 {
        self.start.hour()
    }

    pub fn is_weekend(&self) -> bool {
        matches!(self.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialEvent {
    pub name: String,
    pub window: TimeWindow,
    /// 0 = no effect, 1 = the largest events seen in training
    pub intensity: f64,
    /// targets affected by the event, empty for city-wide events
    pub targets: Vec<DemandTarget>,
}

impl SpecialEvent {
    fn affects(&self, target: &DemandTarget, slot: &TimeSlot) -> bool {
        self.window.contains(slot.start) && (self.targets.is_empty() || self.targets.contains(target))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastContext {
    pub weather_severity: f64,
    pub events: Vec<SpecialEvent>,
    /// expected change in ridership versus the training period, in percent
    pub passenger_growth_pct: f64,
}

/// Inputs of the demand model for one target and slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub hour: u32,
    pub weekend: bool,
    pub weather_severity: f64,
    pub event_intensity: f64,
    pub growth: f64,
}

impl Features {
    pub fn for_slot(target: &DemandTarget, slot: &TimeSlot, context: &ForecastContext) -> Self {
        let event_intensity = context
            .events
            .iter()
            .filter(|event| event.affects(target, slot))
            .map(|event| event.intensity)
            .fold(0.0, f64::max);
        Self {
            hour: slot.hour(),
            weekend: slot.is_weekend(),
            weather_severity: context.weather_severity,
            event_intensity,
            growth: 1.0 + context.passenger_growth_pct / 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// riders per hour
    pub riders: f64,
    pub std_dev: f64,
    pub confidence: f64,
}

/// Inference side of an offline-trained ridership model.
pub trait DemandModel: Send + Sync {
    /// `Ok(None)` when the model knows nothing about `target`; an error when
    /// the model cannot answer at all, which fails the whole forecast run.
    fn predict(&self, target: &DemandTarget, features: &Features) -> Result<Option<Prediction>, ForecastError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCoefficients {
    pub target: DemandTarget,
    /// riders per hour under reference conditions
    pub intercept: f64,
    /// multiplicative hour-of-day profile, 24 entries
    #[serde(default = "flat_profile")]
    pub hourly: Vec<f64>,
    #[serde(default = "one")]
    pub weekend_factor: f64,
    /// relative change per unit of weather severity
    #[serde(default)]
    pub weather_coefficient: f64,
    /// relative change per unit of event intensity
    #[serde(default)]
    pub event_coefficient: f64,
    /// standard deviation of training residuals, riders per hour
    pub residual_std: f64,
}

fn flat_profile() -> Vec<f64> {
    vec![1.0; 24]
}

fn one() -> f64 {
    1.0
}

/// Multiplicative model with one coefficient set per target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearDemandModel {
    targets: Vec<TargetCoefficients>,
    #[serde(skip)]
    index: HashMap<DemandTarget, usize>,
}

impl LinearDemandModel {
    pub fn new(targets: Vec<TargetCoefficients>) -> Self {
        let mut model = Self {
            targets,
            index: HashMap::new(),
        };
        model.reindex();
        model
    }

    pub fn from_json_file(path: &Path) -> Result<Self, FeedError> {
        let file = std::fs::File::open(path)?;
        let mut model: LinearDemandModel = serde_json::from_reader(std::io::BufReader::new(file))?;
        model.reindex();
        Ok(model)
    }

    pub fn from_json_str(text: &str) -> Result<Self, FeedError> {
        let mut model: LinearDemandModel = serde_json::from_str(text)?;
        model.reindex();
        Ok(model)
    }

    fn reindex(&mut self) {
        self.index = self
            .targets
            .iter()
            .enumerate()
            .map(|(idx, coefficients)| (coefficients.target.clone(), idx))
            .collect();
    }
}

impl DemandModel for LinearDemandModel {
    fn predict(&self, target: &DemandTarget, features: &Features) -> Result<Option<Prediction>, ForecastError> {
        let Some(c) = self.index.get(target).and_then(|&idx| self.targets.get(idx)) else {
            return Ok(None);
        };
        let hourly = c.hourly.get(features.hour as usize).copied().unwrap_or(1.0);
        let weekend = if features.weekend { c.weekend_factor } else { 1.0 };
        let riders = (c.intercept
            * hourly
            * weekend
            * (1.0 + c.weather_coefficient * features.weather_severity)
            * (1.0 + c.event_coefficient * features.event_intensity)
            * features.growth)
            .max(0.0);
        let confidence = 1.0 / (1.0 + c.residual_std / riders.max(1.0));
        Ok(Some(Prediction {
            riders,
            std_dev: c.residual_std,
            confidence,
        }))
    }
}

/// One historical boarding count.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub target: DemandTarget,
    pub at: NaiveDateTime,
    /// riders per hour
    pub riders: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Moments {
    count: f64,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn add(&mut self, value: f64) {
        self.count += 1.0;
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn mean(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2.0 {
            return 0.0;
        }
        let mean = self.mean();
        ((self.sum_sq / self.count - mean * mean).max(0.0) * self.count / (self.count - 1.0)).sqrt()
    }
}

/// Historical average per (target, weekday, hour).
#[derive(Debug, Clone, Default)]
pub struct SeasonalBaseline {
    slots: HashMap<(DemandTarget, Weekday, u32), Moments>,
    overall: HashMap<DemandTarget, Moments>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineEstimate {
    pub riders: f64,
    pub std_dev: f64,
}

impl SeasonalBaseline {
    pub fn from_observations(observations: impl IntoIterator<Item = Observation>) -> Self {
        let mut baseline = Self::default();
        for obs in observations {
            let key = (obs.target.clone(), obs.at.weekday(), obs.at.hour());
            baseline.slots.entry(key).or_default().add(obs.riders);
            baseline.overall.entry(obs.target).or_default().add(obs.riders);
        }
        baseline
    }

    /// Mean for the slot's weekday and hour, else the target's overall mean, else zero.
    pub fn estimate(&self, target: &DemandTarget, slot: &TimeSlot) -> BaselineEstimate {
        self.slots
            .get(&(target.clone(), slot.weekday(), slot.hour()))
            .or_else(|| self.overall.get(target))
            .map(|m| BaselineEstimate {
                riders: m.mean(),
                std_dev: m.std_dev(),
            })
            .unwrap_or(BaselineEstimate {
                riders: 0.0,
                std_dev: 0.0,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandSource {
    Model,
    SeasonalBaseline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemandRecord {
    pub target: DemandTarget,
    pub slot: TimeSlot,
    /// riders per hour during the slot
    pub predicted_riders: f64,
    /// confidence of the model, also kept when the baseline was used instead
    pub confidence: f64,
    pub interval: (f64, f64),
    pub source: DemandSource,
}

/// Output of one forecast run. Superseded by the next run, never edited.
#[derive(Debug, Clone, Default)]
pub struct DemandForecast {
    window: Option<TimeWindow>,
    records: Vec<DemandRecord>,
    by_target: BTreeMap<DemandTarget, Vec<usize>>,
}

impl DemandForecast {
    pub fn new(window: TimeWindow, records: Vec<DemandRecord>) -> Self {
        let mut by_target: BTreeMap<DemandTarget, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            by_target.entry(record.target.clone()).or_default().push(idx);
        }
        Self {
            window: Some(window),
            records,
            by_target,
        }
    }

    pub fn window(&self) -> Option<TimeWindow> {
        self.window
    }

    pub fn records(&self) -> &[DemandRecord] {
        &self.records
    }

    pub fn records_for<'a>(&'a self, target: &DemandTarget) -> impl Iterator<Item = &'a DemandRecord> + 'a {
        self.by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|&idx| self.records.get(idx))
    }

    pub fn edge_records<'a>(&'a self, edge: &EdgeId) -> impl Iterator<Item = &'a DemandRecord> + 'a {
        self.records_for(&DemandTarget::Edge(edge.clone()))
    }

    /// Riders per hour forecast for `target` in the slot containing `at`.
    pub fn riders_at(&self, target: &DemandTarget, at: NaiveDateTime) -> Option<f64> {
        self.records_for(target)
            .find(|r| at >= r.slot.start && at < r.slot.start + Duration::minutes(r.slot.minutes))
            .map(|r| r.predicted_riders)
    }

    pub fn peak_riders(&self, target: &DemandTarget) -> f64 {
        self.records_for(target)
            .map(|r| r.predicted_riders)
            .fold(0.0, f64::max)
    }

    pub fn mean_riders(&self, target: &DemandTarget) -> f64 {
        let (sum, n) = self
            .records_for(target)
            .fold((0.0, 0usize), |(sum, n), r| (sum + r.predicted_riders, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    pub fn baseline_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.source == DemandSource::SeasonalBaseline)
            .count()
    }

    /// Copy with every prediction scaled, used for what-if runs.
    pub fn scaled(&self, factor: f64) -> DemandForecast {
        let records = self
            .records
            .iter()
            .map(|r| DemandRecord {
                predicted_riders: r.predicted_riders * factor,
                interval: (r.interval.0 * factor, r.interval.1 * factor),
                ..r.clone()
            })
            .collect();
        DemandForecast {
            window: self.window,
            records,
            by_target: self.by_target.clone(),
        }
    }
}

pub struct DemandForecaster {
    model: Arc<dyn DemandModel>,
    baseline: Arc<SeasonalBaseline>,
    config: ForecastConfig,
}

impl DemandForecaster {
    pub fn new(model: Arc<dyn DemandModel>, baseline: Arc<SeasonalBaseline>, config: ForecastConfig) -> Self {
        Self {
            model,
            baseline,
            config,
        }
    }

    pub fn forecast(
        &self,
        window: TimeWindow,
        context: &ForecastContext,
        targets: &[DemandTarget],
        cancel: &Cancellation,
    ) -> Result<DemandForecast, ForecastError> {
        if self.config.slot_minutes <= 0 {
            return Err(ForecastError::InvalidSlotLength(self.config.slot_minutes));
        }
        if window.is_empty() {
            return Err(ForecastError::EmptyWindow(window.start));
        }

        let slots = window.slots(self.config.slot_minutes);
        let mut records = Vec::with_capacity(slots.len() * targets.len());
        for slot in slots.iter() {
            if cancel.is_cancelled() {
                log::debug!("forecast cancelled at slot {}", slot.start);
                return Err(ForecastError::Cancelled);
            }
            for target in targets {
                records.push(self.record(target, slot, context)?);
            }
        }

        let forecast = DemandForecast::new(window, records);
        let fallbacks = forecast.baseline_count();
        if fallbacks > 0 {
            log::warn!(
                "{fallbacks} of {} demand records fell back to the seasonal baseline",
                forecast.records().len()
            );
        }
        log::info!(
            "forecast {} slot(s) x {} target(s) from {} to {}",
            slots.len(),
            targets.len(),
            window.start,
            window.end
        );
        Ok(forecast)
    }

    fn record(
        &self,
        target: &DemandTarget,
        slot: &TimeSlot,
        context: &ForecastContext,
    ) -> Result<DemandRecord, ForecastError> {
        let features = Features::for_slot(target, slot, context);
        let record = match self.model.predict(target, &features)? {
            Some(p) if p.confidence >= self.config.confidence_threshold => DemandRecord {
                target: target.clone(),
                slot: *slot,
                predicted_riders: p.riders,
                confidence: p.confidence,
                interval: interval(p.riders, p.std_dev),
                source: DemandSource::Model,
            },
            prediction => {
                let baseline = self.baseline.estimate(target, slot);
                log::debug!(
                    "using seasonal baseline for {target:?} at {} (model confidence {:?})",
                    slot.start,
                    prediction.map(|p| p.confidence)
                );
                DemandRecord {
                    target: target.clone(),
                    slot: *slot,
                    predicted_riders: baseline.riders,
                    confidence: prediction.map(|p| p.confidence).unwrap_or(0.0),
                    interval: interval(baseline.riders, baseline.std_dev),
                    source: DemandSource::SeasonalBaseline,
                }
            }
        };
        Ok(record)
    }
}

/// 95% interval, floored at zero riders
fn interval(mean: f64, std_dev: f64) -> (f64, f64) {
    ((mean - 1.96 * std_dev).max(0.0), mean + 1.96 * std_dev)
}
