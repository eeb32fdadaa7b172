use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::db::{self, DbPool};
use crate::error::StoreError;
use crate::migrations;
use crate::types::run::{AnomalyRecord, BatchSummary, Run, RunSummary};

/// Append-only history of detection runs backed by SQLite.
#[derive(Clone)]
pub struct RunStore {
    pool: DbPool,
}

impl RunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `db_path` and bring its schema up to date.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let pool = db::create_pool(db_path)?;
        db::init_db(&pool)?;
        let applied = migrations::run_pending(&pool)?;
        if !applied.is_empty() {
            debug!(count = applied.len(), "Run store schema migrated");
        }
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Persist a run and all of its anomaly records in a single transaction.
    ///
    /// The transaction takes SQLite's write lock up front, so concurrent saves
    /// are serialized and each gets its own freshly assigned id.
    pub fn save(&self, summary: BatchSummary, records: &[AnomalyRecord]) -> Result<i64, StoreError> {
        if summary.anomalies_found != records.len() {
            return Err(StoreError::Invariant(format!(
                "anomalies_found is {} but {} records were given",
                summary.anomalies_found,
                records.len()
            )));
        }
        if summary.anomalies_found > summary.total_points {
            return Err(StoreError::Invariant(format!(
                "anomalies_found ({}) exceeds total_points ({})",
                summary.anomalies_found, summary.total_points
            )));
        }

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO runs (created_at, total_points, anomalies_found) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                created_at,
                summary.total_points as i64,
                summary.anomalies_found as i64
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO anomalies (run_id, position, ts, score, fields, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, record) in records.iter().enumerate() {
                let fields_json = serde_json::to_string(&record.fields)?;
                stmt.execute(rusqlite::params![
                    run_id,
                    position as i64,
                    record.ts,
                    record.score,
                    fields_json,
                    record.note,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            run_id,
            total_points = summary.total_points,
            anomalies_found = summary.anomalies_found,
            "Saved detection run"
        );
        Ok(run_id)
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        self.query_summaries(None)
    }

    /// The `limit` newest runs, newest first.
    pub fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        self.query_summaries(Some(limit))
    }

    fn query_summaries(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, StoreError> {
        let conn = self.pool.get()?;
        // Ids are assigned in commit order, so id order is creation order.
        let mut stmt = conn.prepare(
            "SELECT id, created_at, total_points, anomalies_found FROM runs
             ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = stmt.query_map([limit], |row| {
            Ok(RunSummary {
                run_id: row.get(0)?,
                created_at: row.get(1)?,
                total_points: row.get::<_, i64>(2)? as usize,
                anomalies_found: row.get::<_, i64>(3)? as usize,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// A run with its anomalies in batch order, or `None` for an unknown id.
    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        let conn = self.pool.get()?;
        // One read transaction so the run row and its anomalies come from the same snapshot.
        let tx = conn.unchecked_transaction()?;

        let summary = tx
            .query_row(
                "SELECT id, created_at, total_points, anomalies_found FROM runs WHERE id = ?1",
                [run_id],
                |row| {
                    Ok(RunSummary {
                        run_id: row.get(0)?,
                        created_at: row.get(1)?,
                        total_points: row.get::<_, i64>(2)? as usize,
                        anomalies_found: row.get::<_, i64>(3)? as usize,
                    })
                },
            )
            .optional()?;

        let Some(summary) = summary else {
            debug!(run_id, "Run not found");
            return Ok(None);
        };

        let mut stmt = tx.prepare(
            "SELECT ts, score, fields, note FROM anomalies WHERE run_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut anomalies = Vec::new();
        for row in rows {
            let (ts, score, fields_json, note) = row?;
            let fields: Vec<String> = serde_json::from_str(&fields_json)?;
            anomalies.push(AnomalyRecord {
                ts,
                score,
                fields,
                note,
            });
        }
        drop(stmt);
        tx.finish()?;

        Ok(Some(Run {
            run_id: summary.run_id,
            created_at: summary.created_at,
            total_points: summary.total_points,
            anomalies_found: summary.anomalies_found,
            anomalies,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(&dir.path().join("test.sqlite")).unwrap();
        (dir, store)
    }

    fn record(ts: &str, score: f64, fields: &[&str]) -> AnomalyRecord {
        AnomalyRecord {
            ts: ts.to_string(),
            score,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            note: format!("{} far above batch average", fields[0]),
        }
    }

    fn summary(total_points: usize, anomalies_found: usize) -> BatchSummary {
        BatchSummary {
            total_points,
            anomalies_found,
        }
    }

    #[test]
    fn save_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let records = vec![
            record("2024-02-01T10:00:00", -0.05, &["latency_ms", "cpu"]),
            record("2024-02-01T10:05:00", -0.12, &["disk"]),
        ];
        let id = store.save(summary(10, 2), &records).unwrap();

        let run = store.get_run(id).unwrap().expect("run should exist");
        assert_eq!(run.run_id, id);
        assert_eq!(run.total_points, 10);
        assert_eq!(run.anomalies_found, 2);
        assert_eq!(run.anomalies, records);
        assert!(!run.created_at.is_empty());
    }

    #[test]
    fn anomalies_keep_batch_order_not_score_order() {
        let (_dir, store) = test_store();
        let records = vec![
            record("2024-02-01T10:00:00", -0.01, &["cpu"]),
            record("2024-02-01T10:01:00", -0.30, &["ram"]),
            record("2024-02-01T10:02:00", -0.10, &["disk"]),
        ];
        let id = store.save(summary(3, 3), &records).unwrap();
        let run = store.get_run(id).unwrap().unwrap();
        let ts: Vec<&str> = run.anomalies.iter().map(|a| a.ts.as_str()).collect();
        assert_eq!(
            ts,
            vec!["2024-02-01T10:00:00", "2024-02-01T10:01:00", "2024-02-01T10:02:00"]
        );
    }

    #[test]
    fn get_unknown_run_is_none() {
        let (_dir, store) = test_store();
        store.save(summary(1, 0), &[]).unwrap();
        assert!(store.get_run(9999).unwrap().is_none());
        assert!(store.get_run(-1).unwrap().is_none());
    }

    #[test]
    fn saving_twice_yields_distinct_ids() {
        let (_dir, store) = test_store();
        let records = vec![record("2024-02-01T10:00:00", -0.2, &["latency_ms"])];
        let first = store.save(summary(5, 1), &records).unwrap();
        let second = store.save(summary(5, 1), &records).unwrap();
        assert_ne!(first, second);

        let runs = store.list_runs().unwrap();
        let ids: Vec<i64> = runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(store.get_run(first).unwrap().unwrap().anomalies, records);
        assert_eq!(store.get_run(second).unwrap().unwrap().anomalies, records);
    }

    #[test]
    fn list_recent_runs_limits() {
        let (_dir, store) = test_store();
        let ids: Vec<i64> = (0..5).map(|_| store.save(summary(1, 0), &[]).unwrap()).collect();
        let recent = store.list_recent_runs(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, ids[4]);
        assert_eq!(recent[1].run_id, ids[3]);
        assert_eq!(store.list_runs().unwrap().len(), 5);
    }

    #[test]
    fn mismatched_count_is_rejected_and_nothing_written() {
        let (_dir, store) = test_store();
        let records = vec![record("2024-02-01T10:00:00", -0.2, &["cpu"])];
        let err = store.save(summary(5, 2), &records).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn more_anomalies_than_points_is_rejected() {
        let (_dir, store) = test_store();
        let records = vec![
            record("2024-02-01T10:00:00", -0.2, &["cpu"]),
            record("2024-02-01T10:01:00", -0.2, &["cpu"]),
        ];
        let err = store.save(summary(1, 2), &records).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
    }

    #[test]
    fn failed_insert_rolls_back_whole_run() {
        let (_dir, store) = test_store();
        {
            let conn = store.pool().get().unwrap();
            // Make the second anomaly insert fail.
            conn.execute_batch(
                "CREATE TRIGGER reject_second BEFORE INSERT ON anomalies
                 WHEN NEW.position = 1
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        }
        let records = vec![
            record("2024-02-01T10:00:00", -0.2, &["cpu"]),
            record("2024-02-01T10:01:00", -0.3, &["ram"]),
        ];
        assert!(store.save(summary(4, 2), &records).is_err());
        assert!(store.list_runs().unwrap().is_empty());

        let conn = store.pool().get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn corrupt_fields_column_is_an_error() {
        let (_dir, store) = test_store();
        let id = store
            .save(summary(4, 1), &[record("2024-02-01T10:00:00", -0.2, &["cpu"])])
            .unwrap();
        {
            let conn = store.pool().get().unwrap();
            conn.execute("UPDATE anomalies SET fields = 'not json' WHERE run_id = ?1", [id])
                .unwrap();
        }
        assert!(matches!(store.get_run(id), Err(StoreError::Encoding(_))));
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let (_dir, store) = test_store();
        let first = store.save(summary(1, 0), &[]).unwrap();
        {
            let conn = store.pool().get().unwrap();
            conn.execute("DELETE FROM runs WHERE id = ?1", [first]).unwrap();
        }
        let second = store.save(summary(1, 0), &[]).unwrap();
        assert!(second > first);
    }

    #[test]
    fn concurrent_saves_do_not_interleave() {
        let (_dir, store) = test_store();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let records: Vec<AnomalyRecord> = (0..=t)
                        .map(|i| record(&format!("2024-02-01T10:{:02}:00", i), -0.1, &["cpu"]))
                        .collect();
                    let id = store.save(summary(20, records.len()), &records).unwrap();
                    (id, records)
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            let (id, records) = handle.join().unwrap();
            let run = store.get_run(id).unwrap().unwrap();
            assert_eq!(run.anomalies, records);
            assert_eq!(run.anomalies_found, records.len());
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
