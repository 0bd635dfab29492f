use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{data::Mode, error::ConfigError};

/// One value per transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerMode {
    pub bus: f64,
    pub metro: f64,
    pub train: f64,
    pub walk: f64,
    pub cycle: f64,
}

impl PerMode {
    pub fn get(&self, mode: Mode) -> f64 {
        match mode {
            Mode::Bus => self.bus,
            Mode::Metro => self.metro,
            Mode::Train => self.train,
            Mode::Walk => self.walk,
            Mode::Cycle => self.cycle,
        }
    }

    pub fn set(&mut self, mode: Mode, value: f64) {
        match mode {
            Mode::Bus => self.bus = value,
            Mode::Metro => self.metro = value,
            Mode::Train => self.train = value,
            Mode::Walk => self.walk = value,
            Mode::Cycle => self.cycle = value,
        }
    }

    pub fn uniform(value: f64) -> Self {
        Self {
            bus: value,
            metro: value,
            train: value,
            walk: value,
            cycle: value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    /// multiplier slope per unit of congestion
    #[serde(default = "default_congestion_exposure")]
    pub congestion_exposure: PerMode,

    /// additive penalty, as a fraction of base duration, per unit of weather severity
    #[serde(default = "default_weather_sensitivity")]
    pub weather_sensitivity: PerMode,

    /// reliability assigned to weights computed without a usable snapshot
    #[serde(default = "default_stale_reliability")]
    pub stale_reliability: f64,
}

pub fn default_congestion_exposure() -> PerMode {
    PerMode {
        bus: 1.0,
        metro: 0.0,
        train: 0.1,
        walk: 0.0,
        cycle: 0.3,
    }
}

pub fn default_weather_sensitivity() -> PerMode {
    PerMode {
        bus: 0.15,
        metro: 0.02,
        train: 0.05,
        walk: 0.6,
        cycle: 0.8,
    }
}

pub fn default_stale_reliability() -> f64 {
    0.5
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            congestion_exposure: default_congestion_exposure(),
            weather_sensitivity: default_weather_sensitivity(),
            stale_reliability: default_stale_reliability(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// predictions below this confidence are replaced by the seasonal baseline
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: i64,
}

pub fn default_confidence_threshold() -> f64 {
    0.6
}

pub fn default_slot_minutes() -> i64 {
    60
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            slot_minutes: default_slot_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// dwell imposed when changing from one vehicle to another
    #[serde(default = "default_min_transfer_seconds")]
    pub min_transfer_seconds: f64,

    /// charge half the headway whenever a vehicle is boarded
    #[serde(default = "default_include_boarding_wait")]
    pub include_boarding_wait: bool,

    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: f64,

    #[serde(default = "default_max_journeys")]
    pub max_journeys: usize,

    #[serde(default = "default_max_labels_per_stop")]
    pub max_labels_per_stop: usize,

    #[serde(default = "default_boarding_fare")]
    pub boarding_fare: PerMode,

    #[serde(default = "default_fare_per_km")]
    pub fare_per_km: PerMode,

    /// headways waited per unit of load above capacity when boarding a full
    /// vehicle; zero ignores forecast crowding
    #[serde(default = "default_crowding_wait_weight")]
    pub crowding_wait_weight: f64,
}

pub fn default_min_transfer_seconds() -> f64 {
    120.0
}

pub fn default_include_boarding_wait() -> bool {
    true
}

pub fn default_max_duration_minutes() -> f64 {
    180.0
}

pub fn default_max_journeys() -> usize {
    5
}

pub fn default_max_labels_per_stop() -> usize {
    16
}

pub fn default_boarding_fare() -> PerMode {
    PerMode {
        bus: 10.0,
        metro: 10.0,
        train: 5.0,
        walk: 0.0,
        cycle: 0.0,
    }
}

pub fn default_fare_per_km() -> PerMode {
    PerMode {
        bus: 5.0,
        metro: 4.0,
        train: 3.0,
        walk: 0.0,
        cycle: 0.0,
    }
}

pub fn default_crowding_wait_weight() -> f64 {
    1.0
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_transfer_seconds: default_min_transfer_seconds(),
            include_boarding_wait: default_include_boarding_wait(),
            max_duration_minutes: default_max_duration_minutes(),
            max_journeys: default_max_journeys(),
            max_labels_per_stop: default_max_labels_per_stop(),
            boarding_fare: default_boarding_fare(),
            fare_per_km: default_fare_per_km(),
            crowding_wait_weight: default_crowding_wait_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// total vehicle-trips per hour shared by all scheduled edges; unset keeps
    /// the total the network runs today
    #[serde(default = "default_fleet_budget")]
    pub fleet_budget: Option<f64>,

    /// safety envelope: max relative frequency change per edge per run
    #[serde(default = "default_max_change")]
    pub max_change: f64,

    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// first move size as a fraction of the mean edge frequency
    #[serde(default = "default_initial_step_fraction")]
    pub initial_step_fraction: f64,

    /// smallest move size, in vehicle-trips per hour
    #[serde(default = "default_min_step")]
    pub min_step: f64,

    #[serde(default = "default_min_frequency")]
    pub min_frequency: f64,

    /// cost per rider-minute of waiting
    #[serde(default = "default_wait_weight")]
    pub wait_weight: f64,

    /// cost per rider that does not fit on the scheduled vehicles
    #[serde(default = "default_overcrowding_weight")]
    pub overcrowding_weight: f64,

    #[serde(default = "default_operating_cost_per_vehicle_hour")]
    pub operating_cost_per_vehicle_hour: f64,

    #[serde(default = "default_hotspot_threshold")]
    pub hotspot_threshold: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

pub fn default_fleet_budget() -> Option<f64> {
    None
}

pub fn default_max_change() -> f64 {
    0.25
}

pub fn default_convergence_threshold() -> f64 {
    1e-3
}

pub fn default_max_iterations() -> usize {
    500
}

pub fn default_initial_step_fraction() -> f64 {
    0.05
}

pub fn default_min_step() -> f64 {
    0.01
}

pub fn default_min_frequency() -> f64 {
    0.5
}

pub fn default_wait_weight() -> f64 {
    1.0
}

pub fn default_overcrowding_weight() -> f64 {
    5.0
}

pub fn default_operating_cost_per_vehicle_hour() -> f64 {
    20.0
}

pub fn default_hotspot_threshold() -> f64 {
    50.0
}

pub fn default_seed() -> u64 {
    42
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fleet_budget: default_fleet_budget(),
            max_change: default_max_change(),
            convergence_threshold: default_convergence_threshold(),
            max_iterations: default_max_iterations(),
            initial_step_fraction: default_initial_step_fraction(),
            min_step: default_min_step(),
            min_frequency: default_min_frequency(),
            wait_weight: default_wait_weight(),
            overcrowding_weight: default_overcrowding_weight(),
            operating_cost_per_vehicle_hour: default_operating_cost_per_vehicle_hour(),
            hotspot_threshold: default_hotspot_threshold(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_max_signal_age_minutes")]
    pub max_signal_age_minutes: i64,

    #[serde(default = "default_max_demand_age_minutes")]
    pub max_demand_age_minutes: i64,
}

pub fn default_max_signal_age_minutes() -> i64 {
    15
}

pub fn default_max_demand_age_minutes() -> i64 {
    120
}

impl FreshnessConfig {
    pub fn max_signal_age(&self) -> Duration {
        Duration::minutes(self.max_signal_age_minutes)
    }

    pub fn max_demand_age(&self) -> Duration {
        Duration::minutes(self.max_demand_age_minutes)
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_signal_age_minutes: default_max_signal_age_minutes(),
            max_demand_age_minutes: default_max_demand_age_minutes(),
        }
    }
}
