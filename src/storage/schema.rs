//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomaly_detection_models (
            series_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            model_ref TEXT,
            data_ref TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (series_id, version)
        );
        CREATE INDEX IF NOT EXISTS ix_anomaly_detection_models_series_id
            ON anomaly_detection_models(series_id);

        CREATE TABLE IF NOT EXISTS series_versions (
            series_id TEXT PRIMARY KEY,
            last_version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS operation_latencies (
            id INTEGER PRIMARY KEY,
            operation TEXT NOT NULL,
            duration_ms REAL NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_operation_latencies_op
            ON operation_latencies(operation, id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        INSERT OR IGNORE INTO schema_version (version) VALUES (2);
        INSERT OR IGNORE INTO schema_version (version) VALUES (3);",
    )?;

    Ok(())
}
