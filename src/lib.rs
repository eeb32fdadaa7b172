pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod explain;
pub mod features;
pub mod forest;
pub mod migrations;
pub mod sample;
pub mod store;
pub mod types;

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use detect::Detector;
pub use error::{DetectError, StoreError};
pub use store::RunStore;

/// Initialize structured logging with tracing.
/// Respects RUST_LOG env var; defaults to `info` level for the logsense crate.
/// Logs go to stderr so stdout stays machine-readable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("logsense=info,logsense_lib=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Open the run store at `db_path` and build a detector from the layered configuration.
pub fn open_detector(db_path: &Path) -> Result<Detector, Box<dyn std::error::Error>> {
    let store = RunStore::open(db_path)?;
    let config = config::load_detector_config(store.pool())?;
    Ok(Detector::new(store, config)?)
}

const USAGE: &str = "usage: logsense <command>

commands:
  detect [FILE]      detect anomalies in a JSON batch (array of points or
                     {\"points\": [...], \"contamination\": 0.05}); reads stdin without FILE
  runs [LIMIT]       list saved runs, newest first
  run <ID>           show one run with its anomalies
  sample <N> [SEED]  print N synthetic metric points and the spiked rows
  config             show the effective detector settings
  config set <JSON>  merge a JSON object into the stored detector settings";

/// Entry point for the `logsense` binary. Returns the process exit code.
pub fn run() -> i32 {
    config::load_dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match dispatch(&args) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {}", e);
            1
        }
    }
}

fn dispatch(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let command = args.first().map(String::as_str);
    match command {
        Some("detect") => {
            let input = match args.get(1) {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let request = parse_request(&input)?;
            let detector = open_detector(&db::default_db_path())?;
            let result = detector.detect_request(&request)?;
            print_json(&result)
        }
        Some("runs") => {
            let detector = open_detector(&db::default_db_path())?;
            let runs = match args.get(1) {
                Some(limit) => detector.list_recent_runs(limit.parse()?)?,
                None => detector.list_runs()?,
            };
            print_json(&runs)
        }
        Some("run") => {
            let id: i64 = args.get(1).ok_or(USAGE)?.parse()?;
            let detector = open_detector(&db::default_db_path())?;
            match detector.get_run(id)? {
                Some(run) => print_json(&run),
                None => Err(format!("run {} not found", id).into()),
            }
        }
        Some("sample") => {
            let n: usize = args.get(1).ok_or(USAGE)?.parse()?;
            let seed: u64 = match args.get(2) {
                Some(s) => s.parse()?,
                None => 42,
            };
            let batch = sample::generate(n, 5, seed, chrono::Utc::now().naive_utc())?;
            info!(n, seed, spikes = ?batch.spikes, "Generated sample metrics");
            print_json(&batch)
        }
        Some("config") => {
            let store = RunStore::open(&db::default_db_path())?;
            let config = config_command(store.pool(), &args[1..])?;
            print_json(&config)
        }
        _ => Err(USAGE.into()),
    }
}

/// `config` shows the effective settings; `config set <JSON>` merges a patch
/// into the stored ones and returns the result.
fn config_command(
    pool: &db::DbPool,
    args: &[String],
) -> Result<types::config::DetectorConfig, Box<dyn std::error::Error>> {
    match args.first().map(String::as_str) {
        None => Ok(config::load_detector_config(pool)?),
        Some("set") => {
            let patch: serde_json::Value = serde_json::from_str(args.get(1).ok_or(USAGE)?)?;
            let updated = config::config_update_db(pool, &patch)?;
            info!("Stored detector settings updated");
            Ok(updated)
        }
        Some(_) => Err(USAGE.into()),
    }
}

/// Accept either a bare array of points or a `{points, contamination}` object.
pub fn parse_request(input: &str) -> Result<types::run::DetectRequest, DetectError> {
    let value: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| DetectError::MalformedBatch(format!("invalid JSON: {}", e)))?;

    let (points_value, contamination) = match &value {
        serde_json::Value::Object(obj) => {
            let points = obj.get("points").ok_or_else(|| {
                DetectError::MalformedBatch("missing 'points' array".to_string())
            })?;
            let contamination = match obj.get("contamination") {
                None | Some(serde_json::Value::Null) => None,
                Some(v) => Some(v.as_f64().ok_or_else(|| DetectError::InvalidConfig {
                    name: "contamination".to_string(),
                    reason: "must be a number".to_string(),
                })?),
            };
            (points, contamination)
        }
        other => (other, None),
    };

    Ok(types::run::DetectRequest {
        points: features::parse_points(points_value)?,
        contamination,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
