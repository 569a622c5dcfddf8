//! CAN Telemetry CLI Application
//!
//! Command-line front end for the can-telemetry-core library:
//! - Loads DBC signal definitions
//! - Runs the telemetry engine against a simulated replay or a live bus
//! - Writes the frame store and optional structured/trace logs
//! - Prints health counters and the most recent stored frames

use anyhow::{bail, Context, Result};
use can_telemetry_core::{
    CanFilter, EngineConfig, ReplayTiming, SignalDatabase, StoreRecord, TelemetryEngine,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod config;

/// How often the main thread checks whether the engine has finished
const WAIT_POLL: Duration = Duration::from_millis(50);

/// CAN Telemetry - Acquire, decode and store CAN frames
#[derive(Parser, Debug)]
#[command(name = "can-telemetry-cli")]
#[command(about = "Acquire, decode and store CAN bus frames", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to DBC file(s) (can be repeated)
    #[arg(long, value_name = "FILE")]
    dbc: Vec<PathBuf>,

    /// Replay frames from a JSON file through the simulated interface
    #[arg(long, value_name = "FILE")]
    sim: Option<PathBuf>,

    /// Only acquire messages whose DBC name contains NAME (can be repeated)
    #[arg(long, value_name = "NAME")]
    filter: Vec<String>,

    /// Replay timing for simulated frames
    #[arg(long, value_enum, value_name = "MODE")]
    replay: Option<ReplayArg>,

    /// Base path for the store and log files
    #[arg(long, value_name = "PATH")]
    log_base: Option<PathBuf>,

    /// Write decoded frames as JSON Lines
    #[arg(long)]
    structured: bool,

    /// Write a human-readable trace log
    #[arg(long)]
    trace: bool,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Number of recent frames to print after the run
    #[arg(long, value_name = "N")]
    recent: Option<usize>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReplayArg {
    Relative,
    Absolute,
    Immediate,
}

impl From<ReplayArg> for ReplayTiming {
    fn from(arg: ReplayArg) -> Self {
        match arg {
            ReplayArg::Relative => ReplayTiming::Relative,
            ReplayArg::Absolute => ReplayTiming::Absolute,
            ReplayArg::Immediate => ReplayTiming::Immediate,
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using telemetry library v{}", can_telemetry_core::VERSION);

    let mut app = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => config::AppConfig::default(),
    };
    apply_args(&args, &mut app)?;

    if args.config.is_none() && app.input.dbc_files.is_empty() && args.sim.is_none() {
        println!("CAN Telemetry - No input specified");
        println!("\nQuick Start:");
        println!("  can-telemetry-cli --dbc signals.dbc --sim frames.json");
        println!("  can-telemetry-cli --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    run(&app)
}

/// Command-line flags override the configuration file
fn apply_args(args: &Args, app: &mut config::AppConfig) -> Result<()> {
    app.input.dbc_files.extend(args.dbc.iter().cloned());
    app.input.filter_messages.extend(args.filter.iter().cloned());

    let sim_path = args.sim.as_ref().or(app.input.sim_frames.as_ref());
    if let Some(path) = sim_path {
        let frames = config::load_sim_frames(path)?;
        log::info!("Loaded {} frames from {:?}", frames.len(), path);
        app.engine = std::mem::take(&mut app.engine).with_sim_messages(frames);
    }

    let engine: &mut EngineConfig = &mut app.engine;
    if let Some(replay) = args.replay {
        engine.source.replay_timing = replay.into();
    }
    if let Some(base) = &args.log_base {
        engine.logging.base_log_path = Some(base.clone());
    }
    if args.structured {
        engine.logging.structured.enabled = true;
    }
    if args.trace {
        engine.logging.trace.enabled = true;
    }
    if let Some(duration) = args.duration {
        app.query.duration_secs = Some(duration);
    }
    if let Some(recent) = args.recent {
        app.query.recent = recent;
    }
    Ok(())
}

fn run(app: &config::AppConfig) -> Result<()> {
    let mut db = SignalDatabase::new();
    for dbc_path in &app.input.dbc_files {
        db.add_dbc(dbc_path)
            .with_context(|| format!("Error loading DBC: {:?}", dbc_path))?;
    }
    let stats = db.stats();
    println!("Signal Database:");
    println!("  Messages: {}", stats.num_messages);
    println!("  Signals:  {}", stats.num_signals);

    let mut engine_config = app.engine.clone();
    engine_config
        .source
        .filters
        .extend(message_filters(&db, &app.input.filter_messages)?);

    let mut engine = TelemetryEngine::from_config(&engine_config, Arc::new(db))
        .context("Failed to set up telemetry engine")?;
    engine.start()?;

    let deadline = app
        .query
        .duration_secs
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|limit| Instant::now() + limit);
    while engine.is_running() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("Run time limit reached");
            break;
        }
        thread::sleep(WAIT_POLL);
    }
    engine.stop();
    let outcome = engine.join();

    let health = engine.health();
    println!("\nEngine Health:");
    println!("  Frames received:   {}", health.frames_received);
    println!("  Frames persisted:  {}", health.frames_persisted);
    println!("  Source faults:     {}", health.source_faults);
    println!("  Unknown IDs:       {}", health.unknown_ids);
    println!("  Malformed frames:  {}", health.malformed_frames);
    println!("  Sink overflows:    {}", health.sink_overflows);
    println!("  Sink write errors: {}", health.sink_write_errors);

    match engine.read_recent(app.query.recent) {
        Ok(records) => print_records(&records),
        Err(e) => eprintln!("Query failed: {}", e),
    }

    outcome.context("Acquisition ended with a fatal fault")?;
    Ok(())
}

/// Receive filters for every message whose name contains one of `names`
fn message_filters(db: &SignalDatabase, names: &[String]) -> Result<Vec<CanFilter>> {
    let mut filters = Vec::new();
    for name in names {
        let ids = db.message_ids_matching(name);
        if ids.is_empty() {
            bail!("No message in the signal database matches filter {:?}", name);
        }
        log::info!("Filter {:?} selects {} message IDs", name, ids.len());
        filters.extend(ids.into_iter().map(CanFilter::exact));
    }
    Ok(filters)
}

fn print_records(records: &[StoreRecord]) {
    println!("\nRecent Frames ({}):", records.len());
    println!(
        "{:>6}  {:>17}  {:>8}  {:<23}  {:<10}  Signals",
        "Seq", "Timestamp", "ID", "Data", "Status"
    );
    for record in records {
        let data = record
            .payload()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let signals = record
            .signals()
            .iter()
            .map(|s| match &s.unit {
                Some(unit) => format!("{}={} {}", s.name, s.value, unit),
                None => format!("{}={}", s.name, s.value),
            })
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:>6}  {:>17.6}  {:>8}  {:<23}  {:<10}  {}",
            record.sequence,
            record.timestamp(),
            format!("0x{:03X}", record.arbitration_id()),
            data,
            record.status().as_str(),
            signals
        );
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_telemetry_core::MessageDefinition;

    fn powertrain() -> SignalDatabase {
        let mut db = SignalDatabase::new();
        db.add_message(MessageDefinition::new(0x100, "EngineData", 8, vec![]));
        db.add_message(MessageDefinition::new(0x101, "EngineTemps", 8, vec![]));
        db.add_message(MessageDefinition::new(0x200, "Battery", 8, vec![]));
        db
    }

    #[test]
    fn test_message_filters_resolve_names() {
        let filters = message_filters(&powertrain(), &["Engine".to_string()]).unwrap();
        assert_eq!(filters, vec![CanFilter::exact(0x100), CanFilter::exact(0x101)]);

        assert!(message_filters(&powertrain(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_filter_name_is_an_error() {
        let err = message_filters(&powertrain(), &["Brake".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Brake"));
    }

    #[test]
    fn test_filter_flag_is_repeatable() {
        let args = Args::parse_from(["can-telemetry-cli", "--filter", "Engine", "--filter", "Battery"]);
        let mut app = config::AppConfig::default();
        apply_args(&args, &mut app).unwrap();
        assert_eq!(app.input.filter_messages, vec!["Engine", "Battery"]);
    }
}
