use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, sync::Arc};

use smart_transit::{
    data::StopId,
    demand::{DemandForecaster, ForecastContext, LinearDemandModel, SeasonalBaseline, TimeWindow},
    feed::{self, NetworkFeed},
    signal::WeatherKind,
    Cancellation, Criterion, EngineConfig, Preferences, Scenario, TransitEngine, TransitGraph,
};

/// journey planning and service scheduling over a multimodal transit network
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct CliArguments {
    #[command(subcommand)]
    op: Operation,
}

#[derive(Args, Debug, Clone)]
struct NetworkArgs {
    /// stops CSV: stop_id,stop_name,stop_lat,stop_lon[,modes]
    #[arg(long)]
    stops: PathBuf,
    /// edges CSV: edge_id,from_stop_id,to_stop_id,mode,line,duration_seconds,...
    #[arg(long)]
    edges: PathBuf,
    /// engine configuration, defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// connect stops closer than this many meters with walking legs
    #[arg(long)]
    walk_radius: Option<f64>,
}

#[derive(Args, Debug, Clone)]
struct DemandArgs {
    /// ridership history CSV: edge_id,stop_id,timestamp,riders
    #[arg(long)]
    history: PathBuf,
    /// trained demand model coefficients (JSON); the seasonal baseline is used alone when omitted
    #[arg(long)]
    model: Option<PathBuf>,
    /// start of the planning window, e.g. 2024-03-04T07:00:00
    #[arg(long, value_parser = parse_datetime)]
    from: NaiveDateTime,
    #[arg(long, default_value_t = 1)]
    hours: i64,
    /// expected ridership change versus history, in percent
    #[arg(long, default_value_t = 0.0)]
    growth: f64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Objective {
    Time,
    Transfers,
    Fare,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WeatherArg {
    Clear,
    Rain,
    Fog,
    ExtremeHeat,
}

#[derive(Subcommand, Debug)]
enum Operation {
    /// ranks journeys between two stops
    Plan {
        #[command(flatten)]
        network: NetworkArgs,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// departure time, now when omitted
        #[arg(long, value_parser = parse_datetime)]
        at: Option<NaiveDateTime>,
        #[arg(long, value_enum, default_value_t = Objective::Time)]
        objective: Objective,
    },
    /// forecasts demand and redistributes service frequencies
    Optimize {
        #[command(flatten)]
        network: NetworkArgs,
        #[command(flatten)]
        demand: DemandArgs,
    },
    /// optimizes, then re-costs the plan under what-if conditions
    Simulate {
        #[command(flatten)]
        network: NetworkArgs,
        #[command(flatten)]
        demand: DemandArgs,
        #[arg(long, default_value_t = 0.0)]
        passenger_change: f64,
        #[arg(long, default_value_t = 1.0)]
        congestion: f64,
        #[arg(long, value_enum, default_value_t = WeatherArg::Clear)]
        weather: WeatherArg,
    },
}

impl Operation {
    fn run(&self) -> Result<(), String> {
        match self {
            Operation::Plan {
                network,
                from,
                to,
                at,
                objective,
            } => {
                // without history there is no forecast, so crowding is not considered
                let forecaster = DemandForecaster::new(
                    Arc::new(LinearDemandModel::default()),
                    Arc::new(SeasonalBaseline::default()),
                    load_config(network)?.forecast,
                );
                let engine = build_engine(network, forecaster)?;
                let criterion = match objective {
                    Objective::Time => Criterion::Time,
                    Objective::Transfers => Criterion::Transfers,
                    Objective::Fare => Criterion::Fare,
                };
                let departure = at.unwrap_or_else(|| chrono::Local::now().naive_local());
                let outcome = engine
                    .plan(
                        &StopId(from.clone()),
                        &StopId(to.clone()),
                        departure,
                        &Preferences::minimize(criterion),
                        &Cancellation::none(),
                    )
                    .map_err(|e| e.to_string())?;
                for warning in outcome.warnings.iter() {
                    log::warn!("{warning}");
                }
                for (rank, journey) in outcome.journeys.iter().enumerate() {
                    println!(
                        "{}. {:.1} min, {} transfer(s), fare {:.2}, {:.2} kg CO2",
                        rank + 1,
                        journey.total_duration / 60.0,
                        journey.transfers,
                        journey.fare,
                        journey.emissions
                    );
                    for leg in journey.legs.iter() {
                        println!(
                            "   {} {} -> {} ({} - {})",
                            leg.edge.mode,
                            leg.edge.from,
                            leg.edge.to,
                            leg.depart_at.format("%H:%M"),
                            leg.arrive_at.format("%H:%M")
                        );
                    }
                }
                Ok(())
            }
            Operation::Optimize { network, demand } => {
                let engine = build_engine(network, build_forecaster(network, demand)?)?;
                optimize(&engine, demand)?;
                Ok(())
            }
            Operation::Simulate {
                network,
                demand,
                passenger_change,
                congestion,
                weather,
            } => {
                let engine = build_engine(network, build_forecaster(network, demand)?)?;
                optimize(&engine, demand)?;
                let scenario = Scenario {
                    passenger_change_pct: *passenger_change,
                    congestion_factor: *congestion,
                    weather: match weather {
                        WeatherArg::Clear => WeatherKind::Clear,
                        WeatherArg::Rain => WeatherKind::Rain,
                        WeatherArg::Fog => WeatherKind::Fog,
                        WeatherArg::ExtremeHeat => WeatherKind::ExtremeHeat,
                    },
                };
                let report = engine
                    .simulate(&scenario)
                    .ok_or_else(|| String::from("no service plan to simulate"))?;
                println!("cost {:.1} -> {:.1}", report.baseline_cost, report.total_cost);
                for (edge, load) in report.load_factors.iter() {
                    println!("{edge}: load factor {:.2}", load);
                }
                for (idx, recommendation) in report.recommendations.iter().enumerate() {
                    println!("{}. {recommendation}", idx + 1);
                }
                Ok(())
            }
        }
    }
}

fn load_config(network: &NetworkArgs) -> Result<EngineConfig, String> {
    match &network.config {
        Some(path) => EngineConfig::from_toml_file(path).map_err(|e| e.to_string()),
        None => Ok(EngineConfig::default()),
    }
}

fn build_engine(network: &NetworkArgs, forecaster: DemandForecaster) -> Result<TransitEngine, String> {
    let config = load_config(network)?;
    let rows = NetworkFeed::from_files(&network.stops, &network.edges).map_err(|e| e.to_string())?;
    let mut graph = TransitGraph::try_from(rows).map_err(|e| e.to_string())?;
    if let Some(radius) = network.walk_radius {
        graph
            .connect_walking_transfers(radius, WALK_SPEED_MPS)
            .map_err(|e| e.to_string())?;
    }
    Ok(TransitEngine::new(graph, forecaster, config))
}

fn build_forecaster(network: &NetworkArgs, demand: &DemandArgs) -> Result<DemandForecaster, String> {
    let history = feed::load_history(&demand.history).map_err(|e| e.to_string())?;
    let model = match &demand.model {
        Some(path) => LinearDemandModel::from_json_file(path).map_err(|e| e.to_string())?,
        None => LinearDemandModel::default(),
    };
    Ok(DemandForecaster::new(
        Arc::new(model),
        Arc::new(SeasonalBaseline::from_observations(history)),
        load_config(network)?.forecast,
    ))
}

fn optimize(engine: &TransitEngine, demand: &DemandArgs) -> Result<(), String> {
    let window = TimeWindow::hours(demand.from, demand.hours);
    let context = ForecastContext {
        passenger_growth_pct: demand.growth,
        ..ForecastContext::default()
    };
    let cancel = Cancellation::none();
    engine
        .forecast_demand(window, context, &cancel)
        .map_err(|e| e.to_string())?;
    let outcome = engine.optimize_schedule(window, &cancel).map_err(|e| e.to_string())?;
    for warning in outcome.warnings.iter() {
        log::warn!("{warning}");
    }
    let plan = &outcome.plan.value;
    println!(
        "plan {} ({:?}, {} iterations, cost {:.1})",
        outcome.plan.version, plan.status, plan.iterations, plan.total_cost
    );
    for (edge, frequency) in plan.frequencies.iter() {
        println!("{edge}: {frequency:.2} trips/h");
    }
    for hotspot in plan.hotspots.iter() {
        println!(
            "hotspot {}: load factor {:.2}, overcrowding cost {:.1}",
            hotspot.edge, hotspot.load_factor, hotspot.overcrowding_cost
        );
    }
    Ok(())
}

const WALK_SPEED_MPS: f64 = 1.3;

fn parse_datetime(s: &str) -> Result<NaiveDateTime, String> {
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .ok_or_else(|| format!("invalid date-time '{s}', expected e.g. 2024-03-04T07:30"))
}

fn main() {
    env_logger::init();
    let args = CliArguments::parse();
    match args.op.run() {
        Ok(_) => log::info!("finished."),
        Err(e) => {
            log::error!("failed running smart-transit: {e}");
            std::process::exit(1);
        }
    }
}
