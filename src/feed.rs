use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize};
use std::{io, path::Path};

use crate::{
    data::*,
    demand::{DemandTarget, Observation},
    error::FeedError,
    graph::TransitGraph,
};

#[derive(Deserialize, Debug)]
pub struct StopRow {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
    /// modes served, separated by `|`
    #[serde(default)]
    pub modes: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct EdgeRow {
    pub edge_id: String,
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub mode: String,
    #[serde(default)]
    pub line: Option<String>,
    pub duration_seconds: f64,
    /// great-circle distance between the stops when empty
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub frequency_per_hour: Option<f64>,
}

#[derive(Deserialize, Debug)]
pub struct HistoryRow {
    #[serde(default)]
    pub edge_id: Option<String>,
    #[serde(default)]
    pub stop_id: Option<String>,
    pub timestamp: NaiveDateTime,
    pub riders: f64,
}

#[derive(Debug)]
pub struct NetworkFeed {
    pub stops: Vec<StopRow>,
    pub edges: Vec<EdgeRow>,
}

fn deserialize_into<T: DeserializeOwned, R: io::Read>(reader: R, path: &str) -> Result<Vec<T>, FeedError> {
    let csv_error = |source| FeedError::Csv {
        path: path.to_owned(),
        source,
    };
    csv::Reader::from_reader(reader)
        .deserialize()
        .map(|row| row.map_err(csv_error))
        .collect()
}

fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, FeedError> {
    let label = path.display().to_string();
    let file = std::fs::File::open(path).map_err(|err| FeedError::Csv {
        path: label.clone(),
        source: err.into(),
    })?;
    deserialize_into(io::BufReader::new(file), &label)
}

impl NetworkFeed {
    pub fn from_files(stops: &Path, edges: &Path) -> Result<Self, FeedError> {
        log::info!("reading stops from {}", stops.display());
        let stops = deserialize_file(stops)?;
        log::info!("reading edges from {}", edges.display());
        let edges = deserialize_file(edges)?;
        Ok(Self { stops, edges })
    }

    pub fn from_readers(stops: impl io::Read, edges: impl io::Read) -> Result<Self, FeedError> {
        Ok(Self {
            stops: deserialize_into(stops, "stops")?,
            edges: deserialize_into(edges, "edges")?,
        })
    }
}

impl TryFrom<NetworkFeed> for TransitGraph {
    type Error = FeedError;

    fn try_from(feed: NetworkFeed) -> Result<Self, Self::Error> {
        let mut graph = TransitGraph::new();

        for row in feed.stops {
            let modes = row
                .modes
                .as_deref()
                .unwrap_or_default()
                .split('|')
                .filter(|m| !m.trim().is_empty())
                .map(|m| {
                    Mode::parse(m).ok_or_else(|| FeedError::UnknownMode {
                        edge_id: row.stop_id.clone(),
                        mode: m.to_owned(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let stop = Stop::new(row.stop_id, row.stop_name, Coordinate::new(row.stop_lat, row.stop_lon))
                .with_modes(modes);
            graph.add_stop(stop)?;
        }

        for row in feed.edges {
            let mode = Mode::parse(&row.mode).ok_or_else(|| FeedError::UnknownMode {
                edge_id: row.edge_id.clone(),
                mode: row.mode.clone(),
            })?;
            let distance = match row.distance_meters {
                Some(meters) => meters,
                None => {
                    let from = graph.stop(&StopId(row.from_stop_id.clone()));
                    let to = graph.stop(&StopId(row.to_stop_id.clone()));
                    // unknown stops are reported by add_edge below
                    from.zip(to)
                        .map(|(a, b)| a.location.distance_to(&b.location))
                        .unwrap_or(0.0)
                }
            };
            let mut edge = Edge::new(row.edge_id, row.from_stop_id, row.to_stop_id, mode, row.duration_seconds, distance)
                .with_service(
                    row.capacity.unwrap_or(f64::INFINITY),
                    row.frequency_per_hour.unwrap_or(0.0),
                );
            edge.line = row.line.filter(|l| !l.is_empty());
            graph.add_edge(edge)?;
        }

        log::info!(
            "built network with {} stops and {} edges",
            graph.stop_count(),
            graph.edge_count()
        );
        Ok(graph)
    }
}

pub fn load_history(path: &Path) -> Result<Vec<Observation>, FeedError> {
    log::info!("reading ridership history from {}", path.display());
    observations(deserialize_file(path)?, &path.display().to_string())
}

pub fn read_history(reader: impl io::Read) -> Result<Vec<Observation>, FeedError> {
    observations(deserialize_into(reader, "history")?, "history")
}

fn observations(rows: Vec<HistoryRow>, path: &str) -> Result<Vec<Observation>, FeedError> {
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| {
            let target = match (row.edge_id.filter(|s| !s.is_empty()), row.stop_id.filter(|s| !s.is_empty())) {
                (Some(edge), _) => DemandTarget::Edge(EdgeId(edge)),
                (None, Some(stop)) => DemandTarget::Stop(StopId(stop)),
                (None, None) => {
                    return Err(FeedError::MissingTarget {
                        path: path.to_owned(),
                        row: idx + 1,
                    })
                }
            };
            Ok(Observation {
                target,
                at: row.timestamp,
                riders: row.riders,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    const STOPS: &str = "\
stop_id,stop_name,stop_lat,stop_lon,modes
A,Andheri,19.1197,72.8464,bus|metro
B,Bandra,19.0544,72.8402,bus
C,Churchgate,18.9322,72.8264,train
";

    #[test]
    fn test_feed_builds_graph() {
        let edges = "\
edge_id,from_stop_id,to_stop_id,mode,line,duration_seconds,distance_meters,capacity,frequency_per_hour
ab,A,B,bus,201,900,,60,6
bc,B,C,rail,,1200,13500,1500,10
ca,C,A,walk,,3600,,,
";
        let graph = TransitGraph::try_from(NetworkFeed::from_readers(STOPS.as_bytes(), edges.as_bytes()).unwrap())
            .unwrap();
        assert_eq!(graph.stop_count(), 3);
        assert_eq!(graph.edge_count(), 3);

        let ab = graph.edge(&EdgeId::from("ab")).unwrap();
        assert_eq!(ab.line.as_deref(), Some("201"));
        assert!(ab.base_distance > 7_000.0 && ab.base_distance < 7_600.0);
        assert_eq!(ab.frequency, 6.0);

        let bc = graph.edge(&EdgeId::from("bc")).unwrap();
        assert_eq!(bc.mode, Mode::Train);
        assert_eq!(bc.line, None);

        let ca = graph.edge(&EdgeId::from("ca")).unwrap();
        assert!(ca.capacity.is_infinite());
        assert!(graph
            .stop(&StopId::from("A"))
            .map(|s| s.modes.contains(&Mode::Metro))
            .unwrap_or(false));
    }

    #[test]
    fn test_unknown_mode_fails_fast() {
        let edges = "\
edge_id,from_stop_id,to_stop_id,mode,line,duration_seconds,distance_meters,capacity,frequency_per_hour
ab,A,B,ferry,,900,,,
";
        let result = TransitGraph::try_from(NetworkFeed::from_readers(STOPS.as_bytes(), edges.as_bytes()).unwrap());
        assert!(matches!(result, Err(FeedError::UnknownMode { .. })));
    }

    #[test]
    fn test_edge_to_missing_stop_is_a_graph_error() {
        let edges = "\
edge_id,from_stop_id,to_stop_id,mode,line,duration_seconds,distance_meters,capacity,frequency_per_hour
az,A,Z,bus,,900,,60,6
";
        let result = TransitGraph::try_from(NetworkFeed::from_readers(STOPS.as_bytes(), edges.as_bytes()).unwrap());
        assert!(matches!(result, Err(FeedError::Graph(GraphError::InvalidTopology(_)))));
    }

    #[test]
    fn test_malformed_row_names_the_source() {
        let edges = "\
edge_id,from_stop_id,to_stop_id,mode,line,duration_seconds,distance_meters,capacity,frequency_per_hour
ab,A,B,bus,,soon,,,
";
        let result = NetworkFeed::from_readers(STOPS.as_bytes(), edges.as_bytes());
        assert!(matches!(result, Err(FeedError::Csv { ref path, .. }) if path == "edges"));
    }

    #[test]
    fn test_history_rows_become_observations() {
        let history = "\
edge_id,stop_id,timestamp,riders
bc,,2024-02-26T08:00:00,120
,B,2024-02-26T08:00:00,40
";
        let observations = read_history(history.as_bytes()).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].target, DemandTarget::Edge(EdgeId::from("bc")));
        assert_eq!(observations[1].target, DemandTarget::Stop(StopId::from("B")));
        assert_eq!(observations[0].riders, 120.0);

        let orphan = "edge_id,stop_id,timestamp,riders\n,,2024-02-26T08:00:00,3\n";
        assert!(matches!(
            read_history(orphan.as_bytes()),
            Err(FeedError::MissingTarget { row: 1, .. })
        ));
    }
}
