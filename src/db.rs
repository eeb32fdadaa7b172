use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::StoreError;

pub type DbPool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `~/.logsense`, falling back to the working directory when no home is known.
pub fn logsense_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".logsense")
}

/// Database location: `LOGSENSE_DB_PATH` if set, else `~/.logsense/state/logsense.sqlite`.
pub fn default_db_path() -> PathBuf {
    match std::env::var("LOGSENSE_DB_PATH") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => logsense_data_dir().join("state").join("logsense.sqlite"),
    }
}

pub fn create_pool(db_path: &Path) -> Result<DbPool, StoreError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Pragmas are per connection, so every pooled connection gets them.
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    // WAL lets readers see the last committed run while a save is in flight
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    Ok(pool)
}

pub fn init_db(pool: &DbPool) -> Result<(), StoreError> {
    let conn = pool.get()?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            total_points INTEGER NOT NULL CHECK(total_points >= 0),
            anomalies_found INTEGER NOT NULL CHECK(anomalies_found >= 0 AND anomalies_found <= total_points)
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            position INTEGER NOT NULL,
            ts TEXT NOT NULL,
            score REAL NOT NULL,
            fields TEXT NOT NULL,
            note TEXT NOT NULL,
            UNIQUE(run_id, position)
        );",
    )?;

    Ok(())
}
