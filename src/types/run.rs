use serde::{Deserialize, Serialize};

use crate::types::metric::MetricPoint;

/// A flagged row, as returned to callers and persisted with its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub ts: String,
    /// Decision score; more negative means more anomalous.
    pub score: f64,
    /// Suspicious field names, most suspicious first.
    pub fields: Vec<String>,
    pub note: String,
}

/// Size information about a detection batch, written as the `runs` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_points: usize,
    pub anomalies_found: usize,
}

/// Row of the run history, without its anomalies.
/// Returned by `RunStore::list_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: i64,
    /// RFC 3339 UTC timestamp of when the run was saved.
    pub created_at: String,
    pub total_points: usize,
    pub anomalies_found: usize,
}

/// A persisted run with all of its anomaly records, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    pub created_at: String,
    pub total_points: usize,
    pub anomalies_found: usize,
    pub anomalies: Vec<AnomalyRecord>,
}

/// Outcome of one `detect` call.
///
/// `run_id` is `None` only while the result has not been persisted, e.g. inside
/// `DetectError::NotSaved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Option<i64>,
    pub total_points: usize,
    pub anomalies_found: usize,
    pub anomalies: Vec<AnomalyRecord>,
}

impl RunResult {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total_points: self.total_points,
            anomalies_found: self.anomalies_found,
        }
    }
}

/// Request body accepted by the API layer: the points plus an optional
/// per-request contamination override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub points: Vec<MetricPoint>,
    #[serde(default)]
    pub contamination: Option<f64>,
}
