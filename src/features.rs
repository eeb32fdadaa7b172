use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use tracing::debug;

use crate::error::{DetectError, Result};
use crate::types::metric::{Field, MetricPoint};

const NAIVE_TS_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Row-major N x 4 matrix, columns in `Field::ALL` order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: Vec<[f64; 4]>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: Vec<[f64; 4]>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[[f64; 4]] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        Field::ALL.len()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows[row][col]
    }

    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |r| r[col])
    }
}

/// Mean and population standard deviation of one column over the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl ColumnStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, std_dev: 0.0 };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// Standardized deviation of `value`, or `None` for a zero-variance column.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev > 0.0 && self.std_dev.is_finite() {
            Some((value - self.mean) / self.std_dev)
        } else {
            None
        }
    }
}

/// Raw per-field values of every row, kept for the explainer, along with
/// the batch statistics of each field.
#[derive(Debug, Clone)]
pub struct FieldTable {
    ts: Vec<String>,
    values: Vec<[f64; 4]>,
    stats: [ColumnStats; 4],
}

impl FieldTable {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ts(&self, row: usize) -> &str {
        &self.ts[row]
    }

    pub fn value(&self, row: usize, field: Field) -> f64 {
        self.values[row][field.column()]
    }

    pub fn stats(&self, field: Field) -> ColumnStats {
        self.stats[field.column()]
    }
}

/// Convert a batch into the scorer's feature matrix and the explainer's field table.
pub fn extract(batch: &[MetricPoint]) -> Result<(FeatureMatrix, FieldTable)> {
    if batch.is_empty() {
        return Err(DetectError::EmptyBatch);
    }

    let mut rows = Vec::with_capacity(batch.len());
    let mut ts = Vec::with_capacity(batch.len());

    for (i, point) in batch.iter().enumerate() {
        validate_ts(i, &point.ts)?;
        let mut row = [0.0; 4];
        for field in Field::ALL {
            let v = point.value(field);
            if !v.is_finite() {
                return Err(DetectError::malformed(
                    i,
                    field.as_str(),
                    format!("is not a finite number ({})", v),
                ));
            }
            row[field.column()] = v;
        }
        rows.push(row);
        ts.push(point.ts.clone());
    }

    let stats = Field::ALL.map(|field| {
        let column: Vec<f64> = rows.iter().map(|r| r[field.column()]).collect();
        ColumnStats::from_values(&column)
    });

    debug!(rows = rows.len(), "Extracted feature matrix");

    Ok((
        FeatureMatrix::from_rows(rows.clone()),
        FieldTable {
            ts,
            values: rows,
            stats,
        },
    ))
}

/// Validate a loosely-typed JSON payload into metric points.
///
/// Accepts a JSON array of objects. Extra keys are ignored; every required key
/// must be present with the right type. Numbers encoded as strings are rejected.
pub fn parse_points(payload: &Value) -> Result<Vec<MetricPoint>> {
    let records = payload
        .as_array()
        .ok_or_else(|| DetectError::MalformedBatch("expected a JSON array of points".to_string()))?;

    records
        .iter()
        .enumerate()
        .map(|(i, record)| parse_point(i, record))
        .collect()
}

fn parse_point(row: usize, record: &Value) -> Result<MetricPoint> {
    let obj = record.as_object().ok_or_else(|| {
        DetectError::MalformedBatch(format!("row {} is not a JSON object", row))
    })?;

    let ts = match obj.get("ts") {
        None | Some(Value::Null) => return Err(DetectError::malformed(row, "ts", "is missing")),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(DetectError::malformed(
                row,
                "ts",
                format!("must be a string, got {}", json_kind(other)),
            ))
        }
    };
    validate_ts(row, &ts)?;

    let number = |field: Field| -> Result<f64> {
        match obj.get(field.as_str()) {
            None | Some(Value::Null) => {
                Err(DetectError::malformed(row, field.as_str(), "is missing"))
            }
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                DetectError::malformed(row, field.as_str(), "is not representable as f64")
            }),
            Some(other) => Err(DetectError::malformed(
                row,
                field.as_str(),
                format!("must be a number, got {}", json_kind(other)),
            )),
        }
    };

    Ok(MetricPoint {
        ts,
        cpu: number(Field::Cpu)?,
        ram: number(Field::Ram)?,
        disk: number(Field::Disk)?,
        latency_ms: number(Field::LatencyMs)?,
    })
}

fn validate_ts(row: usize, ts: &str) -> Result<()> {
    let trimmed = ts.trim();
    if trimmed.is_empty() {
        return Err(DetectError::malformed(row, "ts", "is empty"));
    }
    if DateTime::parse_from_rfc3339(trimmed).is_ok() {
        return Ok(());
    }
    if NAIVE_TS_FORMATS
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).is_ok())
    {
        return Ok(());
    }
    Err(DetectError::malformed(
        row,
        "ts",
        format!("is not a parseable timestamp: '{}'", ts),
    ))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
