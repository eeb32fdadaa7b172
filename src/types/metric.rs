use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four metric columns. The declaration order is the feature
/// matrix column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Cpu,
    Ram,
    Disk,
    LatencyMs,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Cpu, Field::Ram, Field::Disk, Field::LatencyMs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Cpu => "cpu",
            Field::Ram => "ram",
            Field::Disk => "disk",
            Field::LatencyMs => "latency_ms",
        }
    }

    /// Column index in the feature matrix.
    pub fn column(&self) -> usize {
        match self {
            Field::Cpu => 0,
            Field::Ram => 1,
            Field::Disk => 2,
            Field::LatencyMs => 3,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Field::Cpu),
            "ram" => Ok(Field::Ram),
            "disk" => Ok(Field::Disk),
            "latency_ms" => Ok(Field::LatencyMs),
            other => Err(format!(
                "Unknown metric field: '{}'. Must be one of cpu, ram, disk, latency_ms",
                other
            )),
        }
    }
}

/// A single metric observation as received from the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub ts: String,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub latency_ms: f64,
}

impl MetricPoint {
    pub fn value(&self, field: Field) -> f64 {
        match field {
            Field::Cpu => self.cpu,
            Field::Ram => self.ram,
            Field::Disk => self.disk,
            Field::LatencyMs => self.latency_ms,
        }
    }
}
