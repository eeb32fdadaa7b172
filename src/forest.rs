use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::features::FeatureMatrix;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Leave-one-out |z| below which a row gets no magnitude evidence.
const MAGNITUDE_FLOOR: f64 = 3.0;
/// Stand-in for an infinite leave-one-out |z| (value differs from identical peers).
const MAGNITUDE_CAP: f64 = 1e6;

/// Per-row scorer output, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    /// Decision scores; negative means inside the contamination tail.
    pub scores: Vec<f64>,
    pub is_anomaly: Vec<bool>,
}

impl Scores {
    fn unflagged(scores: Vec<f64>) -> Self {
        let n = scores.len();
        Self {
            scores,
            is_anomaly: vec![false; n],
        }
    }

    pub fn anomalies_found(&self) -> usize {
        self.is_anomaly.iter().filter(|&&flag| flag).count()
    }
}

/// Isolation forest parameters for a single fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
    /// Weight of the magnitude evidence added to the isolation score; 0 disables it.
    pub magnitude_weight: f64,
}

#[derive(Debug)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// A fitted forest. Built fresh for every batch and dropped afterwards.
#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(matrix: &FeatureMatrix, n_estimators: usize, max_samples: usize, seed: u64) -> Self {
        let n = matrix.n_rows();
        let sample_size = max_samples.clamp(1, n.max(1));
        let height_limit = (sample_size as f64).log2().ceil().max(0.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_estimators.max(1))
            .map(|_| {
                let rows = sample(&mut rng, n, sample_size).into_vec();
                build_tree(matrix, rows, 0, height_limit, &mut rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Average-path-length anomaly score in `[-1, 0)`; lower is more anomalous.
    pub fn score_samples(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        let norm = average_path_length(self.sample_size);
        matrix
            .rows()
            .iter()
            .map(|row| {
                let total: f64 = self.trees.iter().map(|t| path_length(t, row, 0)).sum();
                let mean_depth = total / self.trees.len() as f64;
                if norm > 0.0 {
                    -(2f64).powf(-mean_depth / norm)
                } else {
                    -0.5
                }
            })
            .collect()
    }
}

fn build_tree(
    matrix: &FeatureMatrix,
    rows: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    // Only features that still vary inside this node can separate it.
    let candidates: Vec<(usize, f64, f64)> = (0..matrix.n_cols())
        .filter_map(|col| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                let v = matrix.get(r, col);
                (lo.min(v), hi.max(v))
            });
            (hi > lo).then_some((col, lo, hi))
        })
        .collect();

    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    // Interpolate instead of sampling `lo..hi` directly so huge spans cannot overflow.
    let u: f64 = rng.gen();
    let threshold = lo * (1.0 - u) + hi * u;

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.into_iter().partition(|&r| matrix.get(r, feature) < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(matrix, left_rows, depth + 1, height_limit, rng)),
        right: Box::new(build_tree(matrix, right_rows, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &Node, row: &[f64; 4], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if row[*feature] < *threshold {
                path_length(left, row, depth + 1)
            } else {
                path_length(right, row, depth + 1)
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Largest leave-one-out |z| of each row across all columns.
///
/// Each value is standardized against the mean and population standard
/// deviation of the other rows of its column, so a single extreme value
/// cannot mask itself by inflating the spread.
pub fn leave_one_out_z(matrix: &FeatureMatrix) -> Vec<f64> {
    let n = matrix.n_rows();
    let mut best = vec![0.0; n];
    if n < 2 {
        return best;
    }
    let nf = n as f64;

    for col in 0..matrix.n_cols() {
        let first = matrix.get(0, col);
        if matrix.column(col).all(|v| v == first) {
            continue;
        }
        let mean = matrix.column(col).sum::<f64>() / nf;
        let m2: f64 = matrix.column(col).map(|v| (v - mean).powi(2)).sum();

        for (row, slot) in best.iter_mut().enumerate() {
            let d = matrix.get(row, col) - mean;
            let rest_var = ((m2 - d * d * nf / (nf - 1.0)) / (nf - 1.0)).max(0.0);
            let rest_dev = (d * nf / (nf - 1.0)).abs();
            let z = if rest_dev == 0.0 {
                0.0
            } else if rest_var > 0.0 {
                rest_dev / rest_var.sqrt()
            } else {
                MAGNITUDE_CAP
            };
            let z = if z.is_nan() { 0.0 } else { z.min(MAGNITUDE_CAP) };
            if z > *slot {
                *slot = z;
            }
        }
    }
    best
}

/// Score penalty for rows whose leave-one-out |z| passes `MAGNITUDE_FLOOR`.
/// Grows with the log of the excess, so ordinary rows are ranked by the forest alone.
fn magnitude_evidence(z: f64) -> f64 {
    if z > MAGNITUDE_FLOOR {
        (z / MAGNITUDE_FLOOR).ln()
    } else {
        0.0
    }
}

/// Linear-interpolated percentile, `q` in `[0, 1]`.
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Fit a fresh isolation forest on `matrix` and score every row of it.
///
/// The isolation score is lowered by `magnitude_weight` times the row's
/// magnitude evidence. Isolation trees split uniformly inside each column's
/// range and so ignore how far a value sits outside the rest of its column;
/// on small batches a row that is mildly extreme in several columns can
/// otherwise isolate as fast as one that is orders of magnitude off in one.
///
/// Never fails: a single row, an all-constant matrix, or a non-finite
/// intermediate all resolve to "nothing flagged".
pub fn score(matrix: &FeatureMatrix, params: &ForestParams) -> Scores {
    let n = matrix.n_rows();
    if n == 0 {
        return Scores::unflagged(Vec::new());
    }
    if n == 1 {
        debug!("Single-row batch; no outlier boundary, nothing flagged");
        return Scores::unflagged(vec![0.0]);
    }

    let constant = (0..matrix.n_cols()).all(|col| {
        let first = matrix.get(0, col);
        matrix.column(col).all(|v| v == first)
    });
    if constant {
        debug!(rows = n, "All feature columns are constant; nothing flagged");
        return Scores::unflagged(vec![0.0; n]);
    }

    let forest = IsolationForest::fit(matrix, params.n_estimators, params.max_samples, params.seed);
    let magnitude = leave_one_out_z(matrix);
    let raw: Vec<f64> = forest
        .score_samples(matrix)
        .into_iter()
        .zip(&magnitude)
        .map(|(s, &z)| s - params.magnitude_weight * magnitude_evidence(z))
        .collect();
    if raw.iter().any(|s| !s.is_finite()) {
        warn!(rows = n, "Non-finite isolation scores; failing open");
        return Scores::unflagged(vec![0.0; n]);
    }

    let offset = percentile(&raw, params.contamination);
    let scores: Vec<f64> = raw.iter().map(|s| s - offset).collect();
    let is_anomaly = scores.iter().map(|&s| s < 0.0).collect();

    let result = Scores { scores, is_anomaly };
    debug!(
        rows = n,
        anomalies = result.anomalies_found(),
        offset,
        "Scored batch with isolation forest"
    );
    result
}
