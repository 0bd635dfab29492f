use chrono::{Duration, NaiveDateTime};
use thiserror::Error;

use crate::data::{EdgeId, StopId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Stop {stop_id} is still referenced by {edge_count} edge(s)")]
    DanglingReference { stop_id: StopId, edge_count: usize },

    #[error("No such Stop {0}")]
    UnknownStop(StopId),

    #[error("No such Edge {0}")]
    UnknownEdge(EdgeId),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("signal grid must have at least one row and one column")]
    EmptyGrid,

    #[error("signal grid expects {expected} cells but {found} were provided")]
    IncompleteCoverage { expected: usize, found: usize },

    #[error("{field} value {value} is outside of [0, 1]")]
    OutOfRange { field: &'static str, value: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("No such Stop {0}")]
    UnknownStop(StopId),

    #[error("no route from {origin} to {destination} within {max_duration_minutes} minutes")]
    NoRouteFound {
        origin: StopId,
        destination: StopId,
        max_duration_minutes: f64,
    },

    #[error("planning was cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("forecast window starting at {0} is empty")]
    EmptyWindow(NaiveDateTime),

    #[error("slot length must be positive, got {0} minutes")]
    InvalidSlotLength(i64),

    #[error("demand model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("forecast was cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("the network has no scheduled edges to allocate service to")]
    NothingToSchedule,

    #[error("fleet budget must be positive and finite, got {0}")]
    InvalidBudget(f64),

    #[error("fleet budget {budget} cannot be reached within the safety envelope ({min:.2} to {max:.2} trips/h)")]
    BudgetOutsideEnvelope { budget: f64, min: f64, max: f64 },

    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error("schedule optimization was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed reading '{path}': {source}")]
    Csv { path: String, source: csv::Error },

    #[error("unknown mode '{mode}' on {edge_id}")]
    UnknownMode { edge_id: String, mode: String },

    #[error("row {row} of '{path}' names neither an edge nor a stop")]
    MissingTarget { path: String, row: usize },

    #[error("failed to parse demand model: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed reading config '{path}': {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Which published input was too old to be trusted at full confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleSource {
    Signals,
    Demand,
}

/// Non-fatal: returned next to a result computed from data past its freshness threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleDataWarning {
    pub source: StaleSource,
    /// None when no data was ever published
    pub age: Option<Duration>,
    pub max_age: Duration,
    pub refresh_failed: bool,
}

impl std::fmt::Display for StaleDataWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.source {
            StaleSource::Signals => "signal snapshot",
            StaleSource::Demand => "demand forecast",
        };
        match self.age {
            Some(age) => write!(
                f,
                "{what} is {}s old (threshold {}s)",
                age.num_seconds(),
                self.max_age.num_seconds()
            )?,
            None => write!(f, "no {what} available")?,
        }
        if self.refresh_failed {
            write!(f, ", last refresh failed")?;
        }
        Ok(())
    }
}
