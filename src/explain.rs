use std::cmp::Ordering;

use crate::features::FieldTable;
use crate::types::config::DetectorConfig;
use crate::types::metric::Field;

const NO_STANDOUT_NOTE: &str = "Unusual combination of metrics; no single field stands out";

/// Ranking and wording rules for explanations.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainRules {
    /// Tie-break order, highest priority first.
    pub field_priority: Vec<Field>,
    pub max_fields: usize,
    pub far_z: f64,
}

impl ExplainRules {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            field_priority: config.field_priority.clone(),
            max_fields: config.max_fields.max(1),
            far_z: config.far_z,
        }
    }

    /// "far" threshold for a batch of `n` rows. Population |z| cannot exceed
    /// `sqrt(n - 1)`, so small batches get a proportionally lower bar.
    pub fn far_threshold(&self, n: usize) -> f64 {
        let reachable = 0.8 * (n.saturating_sub(1) as f64).sqrt();
        self.far_z.min(reachable)
    }

    fn priority(&self, field: Field) -> usize {
        self.field_priority
            .iter()
            .position(|f| *f == field)
            .unwrap_or(self.field_priority.len() + field.column())
    }
}

impl Default for ExplainRules {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

/// A field's standardized deviation for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDeviation {
    pub field: Field,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub fields: Vec<String>,
    pub note: String,
}

/// Rank the fields of `row` by |z| against the batch, descending.
/// Zero-variance fields and fields exactly at the mean are left out.
pub fn rank_fields(row: usize, table: &FieldTable, rules: &ExplainRules) -> Vec<FieldDeviation> {
    let mut ranked: Vec<FieldDeviation> = Field::ALL
        .iter()
        .filter_map(|&field| {
            let z = table.stats(field).z_score(table.value(row, field))?;
            (z != 0.0 && z.is_finite()).then_some(FieldDeviation { field, z })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.z.abs()
            .partial_cmp(&a.z.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| rules.priority(a.field).cmp(&rules.priority(b.field)))
    });
    ranked
}

/// Varying fields in priority order, for a row sitting on the mean of each.
fn at_mean_fields(table: &FieldTable, rules: &ExplainRules) -> Vec<FieldDeviation> {
    let mut fields: Vec<Field> = Field::ALL
        .iter()
        .copied()
        .filter(|&field| table.stats(field).z_score(0.0).is_some())
        .collect();
    fields.sort_by_key(|&field| rules.priority(field));
    fields
        .into_iter()
        .map(|field| FieldDeviation { field, z: 0.0 })
        .collect()
}

/// Explain why `row` was flagged: the most deviant fields and a short note.
///
/// A row that sits exactly on the batch mean of every varying field (e.g.
/// between two clusters) cites those fields in priority order instead.
pub fn explain(row: usize, table: &FieldTable, rules: &ExplainRules) -> Explanation {
    let mut ranked = rank_fields(row, table, rules);
    if ranked.is_empty() {
        ranked = at_mean_fields(table, rules);
    }
    let top: Vec<FieldDeviation> = ranked.into_iter().take(rules.max_fields).collect();

    if top.is_empty() {
        return Explanation {
            fields: Vec::new(),
            note: NO_STANDOUT_NOTE.to_string(),
        };
    }

    let far_z = rules.far_threshold(table.len());
    let note = top
        .iter()
        .map(|d| describe(d, far_z))
        .collect::<Vec<_>>()
        .join("; ");

    Explanation {
        fields: top.iter().map(|d| d.field.as_str().to_string()).collect(),
        note,
    }
}

fn describe(deviation: &FieldDeviation, far_z: f64) -> String {
    if deviation.z == 0.0 {
        return format!("{} at batch average, between the other rows", deviation.field);
    }
    let far = if deviation.z.abs() >= far_z { "far " } else { "" };
    let direction = if deviation.z > 0.0 { "above" } else { "below" };
    format!("{} {}{} batch average", deviation.field, far, direction)
}
