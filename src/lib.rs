pub mod cancel;
pub mod config;
pub mod cost;
pub mod data;
pub mod demand;
pub mod engine;
pub mod error;
pub mod feed;
pub mod graph;
pub mod planner;
pub mod scheduler;
pub mod shared;
pub mod signal;

pub use cancel::Cancellation;
pub use config::EngineConfig;
pub use engine::{ScheduleOutcome, TransitEngine};
pub use graph::TransitGraph;
pub use planner::{Criterion, Journey, PlanOutcome, Preferences};
pub use scheduler::{Scenario, ServicePlan, ServiceStatus};
