use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, sync::Arc};

/// Durations are carried as seconds.
pub type Seconds = f64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl From<&str> for StopId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&str> for EdgeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for StopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Bus,
    Metro,
    Train,
    Walk,
    Cycle,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Bus, Mode::Metro, Mode::Train, Mode::Walk, Mode::Cycle];

    /// Modes that run vehicles on a headway and therefore carry a frequency.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Mode::Bus | Mode::Metro | Mode::Train)
    }

    /// Modes where the rider is exposed to the weather for the whole leg.
    pub fn is_active(&self) -> bool {
        matches!(self, Mode::Walk | Mode::Cycle)
    }

    pub fn parse(value: &str) -> Option<Mode> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bus" => Some(Mode::Bus),
            "metro" | "subway" => Some(Mode::Metro),
            "train" | "rail" => Some(Mode::Train),
            "walk" | "walking" => Some(Mode::Walk),
            "cycle" | "cycling" | "bike" => Some(Mode::Cycle),
            _ => None,
        }
    }

    /// kg of CO2 per passenger-km
    pub fn emissions_per_km(&self) -> f64 {
        match self {
            Mode::Bus => 0.7,
            Mode::Train => 0.4,
            Mode::Metro => 0.2,
            Mode::Walk | Mode::Cycle => 0.0,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Bus => "bus",
            Mode::Metro => "metro",
            Mode::Train => "train",
            Mode::Walk => "walk",
            Mode::Cycle => "cycle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn as_point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    /// great-circle distance in meters
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        Haversine.distance(self.as_point(), other.as_point())
    }

    pub fn midpoint(&self, other: &Coordinate) -> Coordinate {
        Coordinate::new((self.lat + other.lat) / 2.0, (self.lon + other.lon) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Coordinate,
    pub max: Coordinate,
}

impl BoundingBox {
    pub fn around<'a>(coordinates: impl IntoIterator<Item = &'a Coordinate>) -> Option<Self> {
        coordinates.into_iter().fold(None, |acc, c| {
            Some(match acc {
                None => BoundingBox { min: *c, max: *c },
                Some(bbox) => BoundingBox {
                    min: Coordinate::new(bbox.min.lat.min(c.lat), bbox.min.lon.min(c.lon)),
                    max: Coordinate::new(bbox.max.lat.max(c.lat), bbox.max.lon.max(c.lon)),
                },
            })
        })
    }

    pub fn contains(&self, c: &Coordinate) -> bool {
        c.lat >= self.min.lat && c.lat <= self.max.lat && c.lon >= self.min.lon && c.lon <= self.max.lon
    }

    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        self.contains(&other.min) && self.contains(&other.max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub id: StopId,
    pub name: String,
    pub location: Coordinate,
    pub modes: BTreeSet<Mode>,
}

impl Stop {
    pub fn new(id: impl Into<String>, name: impl Into<String>, location: Coordinate) -> Self {
        Self {
            id: StopId(id.into()),
            name: name.into(),
            location,
            modes: BTreeSet::new(),
        }
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = Mode>) -> Self {
        self.modes.extend(modes);
        self
    }
}

/// A directed leg between two stops in a single mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub from: StopId,
    pub to: StopId,
    pub mode: Mode,
    /// vehicles on the same line continue through a stop without a transfer
    pub line: Option<String>,
    pub base_duration: Seconds,
    pub base_distance: f64,
    /// riders per vehicle-trip
    pub capacity: f64,
    /// vehicle-trips per hour, zero for walk/cycle legs
    pub frequency: f64,
    /// where signals are sampled for this leg, filled in by the graph
    pub midpoint: Option<Coordinate>,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        mode: Mode,
        base_duration: Seconds,
        base_distance: f64,
    ) -> Self {
        Self {
            id: EdgeId(id.into()),
            from: StopId(from.into()),
            to: StopId(to.into()),
            mode,
            line: None,
            base_duration,
            base_distance,
            capacity: f64::INFINITY,
            frequency: 0.0,
            midpoint: None,
        }
    }

    pub fn on_line(mut self, line: impl Into<String>) -> Self {
        self.line = Some(line.into());
        self
    }

    pub fn with_service(mut self, capacity: f64, frequency: f64) -> Self {
        self.capacity = capacity;
        self.frequency = frequency;
        self
    }

    /// riders per hour the edge can carry at its scheduled frequency
    pub fn hourly_capacity(&self) -> f64 {
        if self.mode.is_scheduled() {
            self.capacity * self.frequency
        } else {
            f64::INFINITY
        }
    }

    /// minutes between vehicles, if the edge runs on a headway
    pub fn headway_minutes(&self) -> Option<f64> {
        (self.mode.is_scheduled() && self.frequency > 0.0).then(|| 60.0 / self.frequency)
    }

    /// Key identifying the vehicle a rider is on after boarding this edge.
    pub fn vehicle_key(&self) -> Option<VehicleKey> {
        self.mode.is_scheduled().then(|| VehicleKey {
            mode: self.mode,
            line: self.line.clone().unwrap_or_else(|| self.id.0.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehicleKey {
    pub mode: Mode,
    pub line: String,
}

pub type EdgeRef = Arc<Edge>;
