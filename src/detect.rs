use tracing::{debug, info, warn};

use crate::config;
use crate::error::{DetectError, Result, StoreError};
use crate::explain::{self, ExplainRules};
use crate::features;
use crate::forest::{self, ForestParams};
use crate::store::RunStore;
use crate::types::config::DetectorConfig;
use crate::types::metric::MetricPoint;
use crate::types::run::{AnomalyRecord, DetectRequest, Run, RunResult, RunSummary};

/// Run extraction, scoring and explanation over one batch without persisting it.
///
/// A fresh forest is fitted per call; nothing is carried between batches.
pub fn run_detection(batch: &[MetricPoint], config: &DetectorConfig) -> Result<RunResult> {
    let (matrix, table) = features::extract(batch)?;

    let params = ForestParams {
        n_estimators: config.n_estimators,
        max_samples: config.max_samples,
        contamination: config.contamination,
        seed: config.seed,
        magnitude_weight: config.magnitude_weight,
    };
    let scored = forest::score(&matrix, &params);
    let rules = ExplainRules::from_config(config);

    let anomalies: Vec<AnomalyRecord> = scored
        .is_anomaly
        .iter()
        .enumerate()
        .filter(|&(_, &flagged)| flagged)
        .map(|(row, _)| {
            let explanation = explain::explain(row, &table, &rules);
            debug!(row, fields = ?explanation.fields, "Explained anomaly");
            AnomalyRecord {
                ts: table.ts(row).to_string(),
                score: scored.scores[row],
                fields: explanation.fields,
                note: explanation.note,
            }
        })
        .collect();

    Ok(RunResult {
        run_id: None,
        total_points: batch.len(),
        anomalies_found: anomalies.len(),
        anomalies,
    })
}

/// Detection entry point used by the API layer: computes, explains and
/// records each batch as a run.
///
/// Holds no model state, so one `Detector` can serve concurrent callers.
#[derive(Clone)]
pub struct Detector {
    store: RunStore,
    config: DetectorConfig,
}

impl Detector {
    pub fn new(store: RunStore, config: DetectorConfig) -> Result<Self> {
        config::validate(&config)?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Detect without saving.
    pub fn compute(&self, batch: &[MetricPoint]) -> Result<RunResult> {
        run_detection(batch, &self.config)
    }

    /// Detect and save the batch as a new run.
    ///
    /// Input errors are returned before anything is written. When only the
    /// save fails, `DetectError::NotSaved` carries the computed result.
    pub fn detect(&self, batch: &[MetricPoint]) -> Result<RunResult> {
        self.detect_with(batch, &self.config)
    }

    /// Like `detect`, honouring the request's contamination override.
    pub fn detect_request(&self, request: &DetectRequest) -> Result<RunResult> {
        match request.contamination {
            Some(contamination) => {
                config::validate_contamination(contamination)?;
                let overridden = DetectorConfig {
                    contamination,
                    ..self.config.clone()
                };
                self.detect_with(&request.points, &overridden)
            }
            None => self.detect(&request.points),
        }
    }

    fn detect_with(&self, batch: &[MetricPoint], config: &DetectorConfig) -> Result<RunResult> {
        let result = match run_detection(batch, config) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, points = batch.len(), "Detection rejected input");
                return Err(e);
            }
        };

        match self.save_result(&result) {
            Ok(saved) => {
                info!(
                    run_id = saved.run_id,
                    total_points = saved.total_points,
                    anomalies_found = saved.anomalies_found,
                    "Detection complete"
                );
                Ok(saved)
            }
            Err(source) => {
                warn!(error = %source, "Detection computed but not saved");
                Err(DetectError::NotSaved {
                    result: Box::new(result),
                    source,
                })
            }
        }
    }

    /// Persist a computed result as a new run and return it with its id.
    /// Saving the same result twice creates two runs.
    pub fn save_result(&self, result: &RunResult) -> std::result::Result<RunResult, StoreError> {
        let run_id = self.store.save(result.summary(), &result.anomalies)?;
        Ok(RunResult {
            run_id: Some(run_id),
            ..result.clone()
        })
    }

    pub fn list_runs(&self) -> std::result::Result<Vec<RunSummary>, StoreError> {
        self.store.list_runs()
    }

    pub fn list_recent_runs(&self, limit: usize) -> std::result::Result<Vec<RunSummary>, StoreError> {
        self.store.list_recent_runs(limit)
    }

    pub fn get_run(&self, run_id: i64) -> std::result::Result<Option<Run>, StoreError> {
        self.store.get_run(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: usize, cpu: f64, ram: f64, disk: f64, latency_ms: f64) -> MetricPoint {
        MetricPoint {
            ts: format!("2024-02-01T10:{:02}:00", i),
            cpu,
            ram,
            disk,
            latency_ms,
        }
    }

    fn five_point_batch() -> Vec<MetricPoint> {
        vec![
            point(0, 25.0, 30.0, 22.0, 31.0),
            point(1, 27.0, 32.0, 24.0, 35.0),
            point(2, 26.0, 31.0, 23.0, 950.0),
            point(3, 28.0, 33.0, 21.0, 29.0),
            point(4, 24.0, 29.0, 25.0, 33.0),
        ]
    }

    fn test_detector() -> (tempfile::TempDir, Detector) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("test.sqlite")).unwrap();
        let detector = Detector::new(store, DetectorConfig::default()).unwrap();
        (dir, detector)
    }

    #[test]
    fn five_point_latency_spike_yields_one_anomaly() {
        let result = run_detection(&five_point_batch(), &DetectorConfig::default()).unwrap();
        assert_eq!(result.total_points, 5);
        assert_eq!(result.anomalies_found, 1);
        assert_eq!(result.anomalies[0].ts, "2024-02-01T10:02:00");
        assert_eq!(result.anomalies[0].fields[0], "latency_ms");
        assert!(result.anomalies[0].note.contains("latency_ms far above batch average"));
        assert!(result.anomalies[0].score < 0.0);
    }

    #[test]
    fn random_five_point_batches_flag_only_the_spike() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let config = DetectorConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for trial in 0..200 {
            let spike = trial % 5;
            let batch: Vec<MetricPoint> = (0..5)
                .map(|i| {
                    let latency = if i == spike { 950.0 } else { rng.gen_range(20.0..40.0) };
                    point(
                        i,
                        rng.gen_range(20.0..40.0),
                        rng.gen_range(20.0..40.0),
                        rng.gen_range(20.0..40.0),
                        latency,
                    )
                })
                .collect();

            let result = run_detection(&batch, &config).unwrap();
            assert_eq!(result.anomalies_found, 1, "trial {}: {:?}", trial, batch);
            let anomaly = &result.anomalies[0];
            assert_eq!(anomaly.ts, batch[spike].ts, "trial {}", trial);
            assert_eq!(anomaly.fields[0], "latency_ms", "trial {}", trial);
            assert!(
                anomaly.note.contains("latency_ms far above batch average"),
                "trial {}: {}",
                trial,
                anomaly.note
            );
        }
    }

    #[test]
    fn single_point_batch_has_no_anomalies() {
        let result =
            run_detection(&[point(0, 99.0, 99.0, 99.0, 5000.0)], &DetectorConfig::default())
                .unwrap();
        assert_eq!(result.total_points, 1);
        assert_eq!(result.anomalies_found, 0);
    }

    #[test]
    fn empty_batch_is_rejected_before_saving() {
        let (_dir, detector) = test_detector();
        let err = detector.detect(&[]).unwrap_err();
        assert!(matches!(err, DetectError::EmptyBatch));
        assert!(detector.list_runs().unwrap().is_empty());
    }

    #[test]
    fn malformed_point_is_rejected_before_saving() {
        let (_dir, detector) = test_detector();
        let mut batch = five_point_batch();
        batch[3].disk = f64::INFINITY;
        let err = detector.detect(&batch).unwrap_err();
        match err {
            DetectError::MalformedPoint { row, field, .. } => {
                assert_eq!(row, 3);
                assert_eq!(field, "disk");
            }
            other => panic!("expected MalformedPoint, got {:?}", other),
        }
        assert!(detector.list_runs().unwrap().is_empty());
    }

    #[test]
    fn detect_persists_run() {
        let (_dir, detector) = test_detector();
        let result = detector.detect(&five_point_batch()).unwrap();
        let run_id = result.run_id.expect("saved result has an id");
        let run = detector.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.total_points, 5);
        assert_eq!(run.anomalies_found, result.anomalies_found);
        assert_eq!(run.anomalies, result.anomalies);
    }

    #[test]
    fn request_contamination_override_is_validated() {
        let (_dir, detector) = test_detector();
        let request = DetectRequest {
            points: five_point_batch(),
            contamination: Some(0.9),
        };
        assert!(matches!(
            detector.detect_request(&request),
            Err(DetectError::InvalidConfig { .. })
        ));

        let request = DetectRequest {
            points: five_point_batch(),
            contamination: Some(0.05),
        };
        let result = detector.detect_request(&request).unwrap();
        assert_eq!(result.anomalies_found, 1);
    }

    #[test]
    fn store_failure_returns_unsaved_result() {
        let (_dir, detector) = test_detector();
        {
            let conn = detector.store().pool().get().unwrap();
            conn.execute_batch("DROP TABLE anomalies; DROP TABLE runs;").unwrap();
        }
        match detector.detect(&five_point_batch()) {
            Err(DetectError::NotSaved { result, .. }) => {
                assert!(result.run_id.is_none());
                assert_eq!(result.anomalies_found, 1);
            }
            other => panic!("expected NotSaved, got {:?}", other),
        }
    }

    #[test]
    fn saving_same_result_twice_gives_two_runs() {
        let (_dir, detector) = test_detector();
        let computed = detector.compute(&five_point_batch()).unwrap();
        let a = detector.save_result(&computed).unwrap();
        let b = detector.save_result(&computed).unwrap();
        assert_ne!(a.run_id, b.run_id);

        let listed: Vec<Option<i64>> = detector
            .list_runs()
            .unwrap()
            .iter()
            .map(|r| Some(r.run_id))
            .collect();
        assert_eq!(listed, vec![b.run_id, a.run_id]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("test.sqlite")).unwrap();
        let config = DetectorConfig {
            contamination: 0.0,
            ..DetectorConfig::default()
        };
        assert!(Detector::new(store, config).is_err());
    }
}
