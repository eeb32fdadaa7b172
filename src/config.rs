use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::db::DbPool;
use crate::error::{DetectError, StoreError};
use crate::types::config::DetectorConfig;
use crate::types::metric::Field;

const DETECTOR_KEY: &str = "detector";

/// Load `.env` from the working directory, if present.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        debug!(path = %path.display(), "Loaded .env");
    }
}

/// Stored detector settings as a JSON object; `{}` when nothing is stored.
pub fn config_get_db(pool: &DbPool) -> Result<Value, StoreError> {
    let conn = pool.get()?;
    let result: Option<String> = match conn.query_row(
        "SELECT value FROM config WHERE key = ?1",
        [DETECTOR_KEY],
        |row| row.get(0),
    ) {
        Ok(json) => Some(json),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    match result {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Value::Object(Default::default())),
    }
}

pub fn config_set_db(pool: &DbPool, value: &Value) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        [DETECTOR_KEY, json.as_str()],
    )?;
    Ok(())
}

/// Merge `patch` into the stored settings and persist them, refusing patches
/// that would produce an invalid configuration.
pub fn config_update_db(pool: &DbPool, patch: &Value) -> Result<DetectorConfig, DetectError> {
    let mut current = config_get_db(pool).map_err(invalid_store)?;
    merge_json(&mut current, patch);
    let config = from_stored(&current)?;
    validate(&config)?;
    config_set_db(pool, &current).map_err(invalid_store)?;
    Ok(config)
}

fn invalid_store(e: StoreError) -> DetectError {
    DetectError::InvalidConfig {
        name: DETECTOR_KEY.to_string(),
        reason: e.to_string(),
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    if let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) {
        for (key, value) in patch_map {
            if value.is_object() && base_map.get(key).is_some_and(|v| v.is_object()) {
                if let Some(existing) = base_map.get_mut(key) {
                    merge_json(existing, value);
                }
            } else {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

fn from_stored(stored: &Value) -> Result<DetectorConfig, DetectError> {
    serde_json::from_value(stored.clone()).map_err(|e| DetectError::InvalidConfig {
        name: DETECTOR_KEY.to_string(),
        reason: e.to_string(),
    })
}

/// Defaults, then stored settings, then `LOGSENSE_*` environment variables.
pub fn load_detector_config(pool: &DbPool) -> Result<DetectorConfig, DetectError> {
    let stored = config_get_db(pool).map_err(invalid_store)?;
    let config = from_stored(&stored)?;
    let config = apply_env_overrides(config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply `LOGSENSE_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(mut config: DetectorConfig, lookup: F) -> Result<DetectorConfig, DetectError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("LOGSENSE_CONTAMINATION") {
        config.contamination = parse_env("LOGSENSE_CONTAMINATION", &v)?;
    }
    if let Some(v) = lookup("LOGSENSE_SEED") {
        config.seed = parse_env("LOGSENSE_SEED", &v)?;
    }
    if let Some(v) = lookup("LOGSENSE_N_ESTIMATORS") {
        config.n_estimators = parse_env("LOGSENSE_N_ESTIMATORS", &v)?;
    }
    if let Some(v) = lookup("LOGSENSE_MAX_SAMPLES") {
        config.max_samples = parse_env("LOGSENSE_MAX_SAMPLES", &v)?;
    }
    if let Some(v) = lookup("LOGSENSE_MAX_FIELDS") {
        config.max_fields = parse_env("LOGSENSE_MAX_FIELDS", &v)?;
    }
    if let Some(v) = lookup("LOGSENSE_FIELD_PRIORITY") {
        config.field_priority = v
            .split(',')
            .map(|s| s.parse::<Field>())
            .collect::<Result<_, _>>()
            .map_err(|reason| DetectError::InvalidConfig {
                name: "LOGSENSE_FIELD_PRIORITY".to_string(),
                reason,
            })?;
    }
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, DetectError> {
    value.trim().parse().map_err(|_| DetectError::InvalidConfig {
        name: name.to_string(),
        reason: format!("cannot parse '{}'", value),
    })
}

pub fn validate_contamination(contamination: f64) -> Result<(), DetectError> {
    if contamination > 0.0 && contamination <= 0.5 {
        Ok(())
    } else {
        Err(DetectError::InvalidConfig {
            name: "contamination".to_string(),
            reason: format!("must be in (0, 0.5], got {}", contamination),
        })
    }
}

pub fn validate(config: &DetectorConfig) -> Result<(), DetectError> {
    validate_contamination(config.contamination)?;

    let positive = [
        ("n_estimators", config.n_estimators),
        ("max_samples", config.max_samples),
        ("max_fields", config.max_fields),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(DetectError::InvalidConfig {
                name: name.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
    }

    if !(config.magnitude_weight.is_finite() && config.magnitude_weight >= 0.0) {
        return Err(DetectError::InvalidConfig {
            name: "magnitude_weight".to_string(),
            reason: "must be a non-negative number".to_string(),
        });
    }

    if !(config.far_z.is_finite() && config.far_z > 0.0) {
        return Err(DetectError::InvalidConfig {
            name: "far_z".to_string(),
            reason: "must be a positive number".to_string(),
        });
    }

    let distinct: HashSet<Field> = config.field_priority.iter().copied().collect();
    if config.field_priority.len() != Field::ALL.len() || distinct.len() != Field::ALL.len() {
        return Err(DetectError::InvalidConfig {
            name: "field_priority".to_string(),
            reason: "must list each of cpu, ram, disk, latency_ms exactly once".to_string(),
        });
    }

    Ok(())
}
