use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    data::{BoundingBox, Coordinate},
    error::SignalError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherKind {
    Clear,
    Rain,
    Fog,
    ExtremeHeat,
}

impl WeatherKind {
    /// Severity assumed when a provider reports only the condition.
    pub fn typical_severity(&self) -> f64 {
        match self {
            WeatherKind::Clear => 0.0,
            WeatherKind::Rain => 0.6,
            WeatherKind::Fog => 0.6,
            WeatherKind::ExtremeHeat => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub kind: WeatherKind,
    /// 0 = harmless, 1 = worst conditions the network is operated in
    pub severity: f64,
}

impl Weather {
    pub fn clear() -> Self {
        Self {
            kind: WeatherKind::Clear,
            severity: 0.0,
        }
    }

    pub fn of_kind(kind: WeatherKind) -> Self {
        Self {
            kind,
            severity: kind.typical_severity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellSignal {
    /// 0 = free flow, 1 = gridlock
    pub congestion: f64,
    pub weather: Weather,
}

impl CellSignal {
    pub fn new(congestion: f64, weather: Weather) -> Self {
        Self { congestion, weather }
    }
}

/// Point-in-time traffic and weather conditions over a regular lat/lon grid.
/// Every cell of the grid is populated, so a snapshot covers its whole region.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshot {
    timestamp: NaiveDateTime,
    region: BoundingBox,
    rows: usize,
    cols: usize,
    cells: Vec<CellSignal>,
}

impl SignalSnapshot {
    /// `cells` are given row-major, rows running south to north.
    pub fn new(
        timestamp: NaiveDateTime,
        region: BoundingBox,
        rows: usize,
        cols: usize,
        cells: Vec<CellSignal>,
    ) -> Result<Self, SignalError> {
        if rows == 0 || cols == 0 {
            return Err(SignalError::EmptyGrid);
        }
        if cells.len() != rows * cols {
            return Err(SignalError::IncompleteCoverage {
                expected: rows * cols,
                found: cells.len(),
            });
        }
        for cell in cells.iter() {
            check_unit("congestion", cell.congestion)?;
            check_unit("weather severity", cell.weather.severity)?;
        }
        Ok(Self {
            timestamp,
            region,
            rows,
            cols,
            cells,
        })
    }

    pub fn uniform(
        timestamp: NaiveDateTime,
        region: BoundingBox,
        signal: CellSignal,
    ) -> Result<Self, SignalError> {
        Self::new(timestamp, region, 1, 1, vec![signal])
    }

    /// Builds a grid by evaluating `f(row, col, cell_center)` for every cell.
    pub fn from_fn(
        timestamp: NaiveDateTime,
        region: BoundingBox,
        rows: usize,
        cols: usize,
        f: impl Fn(usize, usize, Coordinate) -> CellSignal,
    ) -> Result<Self, SignalError> {
        let (lat_step, lon_step) = steps(&region, rows.max(1), cols.max(1));
        let cells = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (row, col)))
            .map(|(row, col)| {
                let center = Coordinate::new(
                    region.min.lat + (row as f64 + 0.5) * lat_step,
                    region.min.lon + (col as f64 + 0.5) * lon_step,
                );
                f(row, col, center)
            })
            .collect();
        Self::new(timestamp, region, rows, cols, cells)
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn region(&self) -> &BoundingBox {
        &self.region
    }

    pub fn covers(&self, bbox: &BoundingBox) -> bool {
        self.region.contains_box(bbox)
    }

    /// The signal of the cell containing `location`, or None outside the region.
    pub fn signal_at(&self, location: &Coordinate) -> Option<&CellSignal> {
        if !self.region.contains(location) {
            return None;
        }
        let (lat_step, lon_step) = steps(&self.region, self.rows, self.cols);
        let row = cell_index(location.lat - self.region.min.lat, lat_step, self.rows);
        let col = cell_index(location.lon - self.region.min.lon, lon_step, self.cols);
        self.cells.get(row * self.cols + col)
    }

    /// Copy of this snapshot with every cell transformed, used for what-if runs.
    pub fn map_cells(&self, f: impl Fn(&CellSignal) -> CellSignal) -> Result<Self, SignalError> {
        Self::new(
            self.timestamp,
            self.region,
            self.rows,
            self.cols,
            self.cells.iter().map(f).collect(),
        )
    }
}

fn steps(region: &BoundingBox, rows: usize, cols: usize) -> (f64, f64) {
    (
        (region.max.lat - region.min.lat) / rows as f64,
        (region.max.lon - region.min.lon) / cols as f64,
    )
}

fn cell_index(offset: f64, step: f64, count: usize) -> usize {
    if step <= 0.0 {
        return 0;
    }
    ((offset / step).floor() as usize).min(count - 1)
}

fn check_unit(field: &'static str, value: f64) -> Result<(), SignalError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SignalError::OutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid test datetime")
    }

    fn region() -> BoundingBox {
        BoundingBox {
            min: Coordinate::new(19.0, 72.8),
            max: Coordinate::new(19.2, 73.0),
        }
    }

    #[test]
    fn test_incomplete_grid_is_rejected() {
        let cells = vec![CellSignal::new(0.1, Weather::clear()); 3];
        let result = SignalSnapshot::new(noon(), region(), 2, 2, cells);
        assert_eq!(
            result,
            Err(SignalError::IncompleteCoverage {
                expected: 4,
                found: 3
            })
        );
    }

    #[test]
    fn test_out_of_range_congestion_is_rejected() {
        let result = SignalSnapshot::uniform(noon(), region(), CellSignal::new(1.5, Weather::clear()));
        assert!(matches!(result, Err(SignalError::OutOfRange { .. })));
    }

    #[test]
    fn test_signal_lookup_picks_the_enclosing_cell() {
        let snapshot = SignalSnapshot::from_fn(noon(), region(), 2, 2, |row, col, _| {
            CellSignal::new((row * 2 + col) as f64 / 4.0, Weather::clear())
        })
        .unwrap();
        let south_west = snapshot.signal_at(&Coordinate::new(19.01, 72.81)).unwrap();
        let north_east = snapshot.signal_at(&Coordinate::new(19.19, 72.99)).unwrap();
        let corner = snapshot.signal_at(&Coordinate::new(19.2, 73.0)).unwrap();
        assert_eq!(south_west.congestion, 0.0);
        assert_eq!(north_east.congestion, 0.75);
        assert_eq!(corner.congestion, 0.75);
        assert!(snapshot.signal_at(&Coordinate::new(18.9, 72.9)).is_none());
    }

    #[test]
    fn test_rain_is_more_severe_than_heat() {
        assert!(WeatherKind::Rain.typical_severity() > WeatherKind::ExtremeHeat.typical_severity());
        assert_eq!(Weather::of_kind(WeatherKind::Clear), Weather::clear());
    }
}
