use std::collections::HashSet;

use tracing::info;

use crate::db::DbPool;
use crate::error::StoreError;

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            name: "001_initial_schema",
            sql: "-- initial schema created by init_db, this is a placeholder
                  SELECT 1;",
        },
        Migration {
            name: "002_config_detector_seed",
            sql: "INSERT OR IGNORE INTO config (key, value) VALUES ('detector', '{}');",
        },
    ]
}

/// Apply every migration not yet recorded in the `migrations` table.
/// Returns the names applied by this call.
pub fn run_pending(pool: &DbPool) -> Result<Vec<String>, StoreError> {
    let applied_set: HashSet<String> = applied(pool)?.into_iter().collect();
    let mut conn = pool.get()?;

    let mut newly_applied = Vec::new();

    for migration in all_migrations() {
        if applied_set.contains(migration.name) {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute("INSERT INTO migrations (name) VALUES (?1)", [migration.name])?;
        tx.commit()?;
        info!(migration = migration.name, "Applied migration");
        newly_applied.push(migration.name.to_string());
    }

    Ok(newly_applied)
}

/// Names of the migrations already recorded, oldest first.
pub fn applied(pool: &DbPool) -> Result<Vec<String>, StoreError> {
    let conn = pool.get()?;
    let names = conn
        .prepare("SELECT name FROM migrations ORDER BY id")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}
