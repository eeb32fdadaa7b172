use serde::{Deserialize, Serialize};

use crate::types::metric::Field;

/// Tunables for the scorer and explainer. Stored as JSON under the `detector`
/// key of the `config` table; see `crate::config` for the layering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Expected anomaly fraction, in `(0, 0.5]`.
    pub contamination: f64,
    /// Seed for the isolation forest's random partitioning.
    pub seed: u64,
    pub n_estimators: usize,
    /// Rows sampled per tree, capped at the batch size.
    pub max_samples: usize,
    /// Weight of leave-one-out magnitude evidence added to the isolation
    /// score; 0 scores with the isolation forest alone.
    pub magnitude_weight: f64,
    /// Maximum number of fields cited per anomaly.
    pub max_fields: usize,
    /// |z| at or above which a field is reported as "far" from the average.
    /// Capped per batch at `0.8 * sqrt(n - 1)`, the reachable range of |z|.
    pub far_z: f64,
    /// Tie-break order for fields with equal deviation, highest priority first.
    pub field_priority: Vec<Field>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            seed: 42,
            n_estimators: 200,
            max_samples: 256,
            magnitude_weight: 0.5,
            max_fields: 2,
            far_z: 3.0,
            field_priority: vec![Field::LatencyMs, Field::Cpu, Field::Ram, Field::Disk],
        }
    }
}
