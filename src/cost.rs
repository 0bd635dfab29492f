use chrono::{Duration, NaiveDateTime};

use crate::{
    config::{CostConfig, EngineConfig},
    data::{Edge, EdgeId, Mode, Seconds},
    signal::{CellSignal, SignalSnapshot},
};

/// Travel cost of one edge evaluated at one instant under one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicWeight {
    pub edge: EdgeId,
    pub at: NaiveDateTime,
    pub effective_duration: Seconds,
    /// 0 = unpredictable, 1 = runs exactly as scheduled
    pub reliability: f64,
    /// true when no usable snapshot covered the edge or the snapshot was too old
    pub stale: bool,
}

impl DynamicWeight {
    /// Reliability drops in proportion to how far riders exceed capacity.
    pub fn crowded(mut self, load_factor: f64) -> Self {
        if load_factor > 1.0 {
            self.reliability /= load_factor;
        }
        self
    }
}

/// Turns signal snapshots into edge weights. Holds configuration only, so a
/// weight depends on nothing but the edge, the instant and the snapshot.
#[derive(Debug, Clone)]
pub struct EdgeCostProvider {
    config: CostConfig,
    max_signal_age: Duration,
}

impl EdgeCostProvider {
    pub fn new(config: CostConfig, max_signal_age: Duration) -> Self {
        Self {
            config,
            max_signal_age,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cost.clone(), config.freshness.max_signal_age())
    }

    pub fn weight(
        &self,
        edge: &Edge,
        at: NaiveDateTime,
        snapshot: Option<&SignalSnapshot>,
    ) -> DynamicWeight {
        let sampled = snapshot.zip(edge.midpoint).and_then(|(snapshot, location)| {
            snapshot
                .signal_at(&location)
                .map(|signal| (snapshot.timestamp(), *signal))
        });

        match sampled {
            None => DynamicWeight {
                edge: edge.id.clone(),
                at,
                effective_duration: edge.base_duration,
                reliability: self.config.stale_reliability * service_reliability(edge),
                stale: true,
            },
            Some((timestamp, signal)) => {
                let age = at.signed_duration_since(timestamp).abs();
                let stale = age > self.max_signal_age;
                let mut reliability = self.signal_reliability(edge.mode, &signal) * service_reliability(edge);
                if stale {
                    reliability *= self.config.stale_reliability;
                }
                DynamicWeight {
                    edge: edge.id.clone(),
                    at,
                    effective_duration: self.effective_duration(edge, &signal),
                    reliability,
                    stale,
                }
            }
        }
    }

    /// base × congestion multiplier + additive weather penalty
    pub fn effective_duration(&self, edge: &Edge, signal: &CellSignal) -> Seconds {
        let multiplier = self.congestion_multiplier(edge.mode, signal.congestion);
        let penalty = self.weather_penalty(edge.mode, signal.weather.severity) * edge.base_duration;
        edge.base_duration * multiplier + penalty
    }

    /// Never below 1 and non-decreasing in `congestion`.
    pub fn congestion_multiplier(&self, mode: Mode, congestion: f64) -> f64 {
        1.0 + self.config.congestion_exposure.get(mode).max(0.0) * congestion.max(0.0)
    }

    /// Fraction of the base duration added under `severity`.
    pub fn weather_penalty(&self, mode: Mode, severity: f64) -> f64 {
        self.config.weather_sensitivity.get(mode).max(0.0) * severity.max(0.0)
    }

    /// Expected wait for the next vehicle when boarding without a timetable.
    pub fn boarding_wait(&self, edge: &Edge) -> Seconds {
        edge.headway_minutes()
            .map(|headway| headway * 60.0 / 2.0)
            .unwrap_or(0.0)
    }

    fn signal_reliability(&self, mode: Mode, signal: &CellSignal) -> f64 {
        let exposure = self.config.congestion_exposure.get(mode).max(0.0) * signal.congestion;
        let sensitivity = self.config.weather_sensitivity.get(mode).max(0.0) * signal.weather.severity;
        1.0 / (1.0 + exposure + sensitivity)
    }
}

/// Frequent services recover from disruption faster than sparse ones.
fn service_reliability(edge: &Edge) -> f64 {
    if edge.mode.is_scheduled() && edge.frequency > 0.0 {
        edge.frequency / (edge.frequency + 2.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{BoundingBox, Coordinate},
        signal::{Weather, WeatherKind},
    };
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid test datetime")
    }

    fn region() -> BoundingBox {
        BoundingBox {
            min: Coordinate::new(19.0, 72.8),
            max: Coordinate::new(19.2, 73.0),
        }
    }

    fn located(edge: Edge) -> Edge {
        Edge {
            midpoint: Some(Coordinate::new(19.1, 72.9)),
            ..edge
        }
    }

    fn snapshot(congestion: f64, severity: f64) -> SignalSnapshot {
        let weather = Weather {
            kind: WeatherKind::Rain,
            severity,
        };
        SignalSnapshot::uniform(at(8, 0), region(), CellSignal::new(congestion, weather))
            .expect("valid snapshot")
    }

    fn provider() -> EdgeCostProvider {
        EdgeCostProvider::from_config(&EngineConfig::default())
    }

    #[test]
    fn test_clear_free_flow_equals_base_duration() {
        let edge = located(Edge::new("e", "a", "b", Mode::Bus, 600.0, 3000.0).with_service(60.0, 6.0));
        let weight = provider().weight(&edge, at(8, 5), Some(&snapshot(0.0, 0.0)));
        assert_relative_eq!(weight.effective_duration, 600.0);
        assert!(!weight.stale);
    }

    #[test]
    fn test_weight_is_monotone_in_congestion_and_weather() {
        let provider = provider();
        for mode in Mode::ALL {
            let edge = located(Edge::new("e", "a", "b", mode, 600.0, 3000.0));
            let mut previous = 0.0;
            for step in 0..=10 {
                let level = step as f64 / 10.0;
                let d = provider
                    .weight(&edge, at(8, 0), Some(&snapshot(level, 0.2)))
                    .effective_duration;
                assert!(d >= previous, "{mode} congestion {level}: {d} < {previous}");
                previous = d;
            }
            let mut previous = 0.0;
            for step in 0..=10 {
                let level = step as f64 / 10.0;
                let d = provider
                    .weight(&edge, at(8, 0), Some(&snapshot(0.3, level)))
                    .effective_duration;
                assert!(d >= previous, "{mode} severity {level}: {d} < {previous}");
                previous = d;
            }
        }
    }

    #[test]
    fn test_weather_hits_walking_harder_than_metro() {
        let provider = provider();
        let walk = located(Edge::new("w", "a", "b", Mode::Walk, 600.0, 800.0));
        let metro = located(Edge::new("m", "a", "b", Mode::Metro, 600.0, 8000.0));
        let storm = snapshot(0.0, 1.0);
        let walk_extra = provider.weight(&walk, at(8, 0), Some(&storm)).effective_duration - 600.0;
        let metro_extra = provider.weight(&metro, at(8, 0), Some(&storm)).effective_duration - 600.0;
        assert!(walk_extra > metro_extra);
    }

    #[test]
    fn test_missing_snapshot_falls_back_to_base_and_is_stale() {
        let edge = located(Edge::new("e", "a", "b", Mode::Bus, 600.0, 3000.0));
        let weight = provider().weight(&edge, at(8, 0), None);
        assert_eq!(weight.effective_duration, 600.0);
        assert!(weight.stale);
    }

    #[test]
    fn test_edge_outside_snapshot_region_is_stale() {
        let edge = Edge {
            midpoint: Some(Coordinate::new(28.6, 77.2)),
            ..Edge::new("e", "a", "b", Mode::Bus, 600.0, 3000.0)
        };
        let weight = provider().weight(&edge, at(8, 0), Some(&snapshot(0.9, 0.9)));
        assert_eq!(weight.effective_duration, 600.0);
        assert!(weight.stale);
    }

    #[test]
    fn test_old_snapshot_is_used_but_flagged() {
        let edge = located(Edge::new("e", "a", "b", Mode::Bus, 600.0, 3000.0));
        let fresh = provider().weight(&edge, at(8, 10), Some(&snapshot(0.5, 0.0)));
        let old = provider().weight(&edge, at(11, 0), Some(&snapshot(0.5, 0.0)));
        assert!(!fresh.stale);
        assert!(old.stale);
        assert_relative_eq!(fresh.effective_duration, old.effective_duration);
        assert!(old.reliability < fresh.reliability);
    }

    #[test]
    fn test_boarding_wait_is_half_headway() {
        let edge = Edge::new("e", "a", "b", Mode::Bus, 600.0, 3000.0).with_service(60.0, 6.0);
        assert_relative_eq!(provider().boarding_wait(&edge), 300.0);
        let walk = Edge::new("w", "a", "b", Mode::Walk, 600.0, 800.0);
        assert_eq!(provider().boarding_wait(&walk), 0.0);
    }
}
