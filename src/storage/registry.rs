//! Model registry: (series, version) -> artifact references.
//!
//! Rows are inserted with null references and filled in exactly once before
//! the surrounding transaction commits. Readers on other connections only
//! ever see committed rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::series::SeriesId;

const COLUMNS: &str = "series_id, version, model_ref, data_ref, created_at, updated_at";

/// One registry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelVersionRecord {
    pub series_id: String,
    pub version: u32,
    pub model_ref: Option<String>,
    pub data_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelVersionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            series_id: row.get(0)?,
            version: row.get(1)?,
            model_ref: row.get(2)?,
            data_ref: row.get(3)?,
            created_at: parse_ts(row, 4)?,
            updated_at: parse_ts(row, 5)?,
        })
    }

    /// Model artifact reference, or InconsistentState if a committed row lacks it.
    pub fn require_model_ref(&self) -> Result<&str> {
        self.model_ref.as_deref().ok_or_else(|| self.missing("model"))
    }

    pub fn require_data_ref(&self) -> Result<&str> {
        self.data_ref.as_deref().ok_or_else(|| self.missing("data"))
    }

    fn missing(&self, kind: &str) -> Error {
        Error::InconsistentState(format!(
            "{kind} artifact reference is missing for series '{}' version {}",
            self.series_id, self.version
        ))
    }
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Insert a row for a freshly allocated version with no artifacts yet.
pub fn create_pending(conn: &Connection, series_id: &SeriesId, version: u32) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let res = conn.execute(
        "INSERT INTO anomaly_detection_models
            (series_id, version, model_ref, data_ref, created_at, updated_at)
         VALUES (?1, ?2, NULL, NULL, ?3, ?3)",
        params![series_id.as_str(), version, now],
    );
    match res {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(Error::InconsistentState(format!(
                "version {version} of series '{series_id}' is already registered"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Fill in artifact references on a pending row. Succeeds at most once per row.
pub fn attach_artifacts(
    conn: &Connection,
    series_id: &SeriesId,
    version: u32,
    model_ref: &str,
    data_ref: &str,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE anomaly_detection_models
         SET model_ref = ?3, data_ref = ?4, updated_at = ?5
         WHERE series_id = ?1 AND version = ?2
           AND model_ref IS NULL AND data_ref IS NULL",
        params![
            series_id.as_str(),
            version,
            model_ref,
            data_ref,
            Utc::now().to_rfc3339()
        ],
    )?;
    if changed == 0 {
        return Err(Error::InconsistentState(format!(
            "no pending record for series '{series_id}' version {version}"
        )));
    }
    Ok(())
}

/// Highest-versioned visible record for a series.
pub fn get_latest(conn: &Connection, series_id: &SeriesId) -> Result<Option<ModelVersionRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM anomaly_detection_models
         WHERE series_id = ?1 ORDER BY version DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![series_id.as_str()], ModelVersionRecord::from_row)
        .optional()?)
}

pub fn get_version(
    conn: &Connection,
    series_id: &SeriesId,
    version: u32,
) -> Result<Option<ModelVersionRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM anomaly_detection_models
         WHERE series_id = ?1 AND version = ?2"
    );
    Ok(conn
        .query_row(&sql, params![series_id.as_str(), version], ModelVersionRecord::from_row)
        .optional()?)
}

/// All visible versions of a series, oldest first.
pub fn list_versions(conn: &Connection, series_id: &SeriesId) -> Result<Vec<ModelVersionRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM anomaly_detection_models
         WHERE series_id = ?1 ORDER BY version ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![series_id.as_str()], ModelVersionRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_distinct_series(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT series_id) FROM anomaly_detection_models",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::migrate;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    fn sid(s: &str) -> SeriesId {
        SeriesId::parse(s).unwrap()
    }

    #[test]
    fn test_pending_then_attach() {
        let conn = conn();
        let id = sid("cpu");
        create_pending(&conn, &id, 1).unwrap();

        let rec = get_version(&conn, &id, 1).unwrap().unwrap();
        assert!(rec.model_ref.is_none());
        assert!(matches!(rec.require_model_ref(), Err(Error::InconsistentState(_))));

        attach_artifacts(&conn, &id, 1, "m", "d").unwrap();
        let rec = get_version(&conn, &id, 1).unwrap().unwrap();
        assert_eq!(rec.require_model_ref().unwrap(), "m");
        assert_eq!(rec.require_data_ref().unwrap(), "d");
        assert!(rec.updated_at >= rec.created_at);
    }

    #[test]
    fn test_attach_only_once() {
        let conn = conn();
        let id = sid("cpu");
        create_pending(&conn, &id, 1).unwrap();
        attach_artifacts(&conn, &id, 1, "m", "d").unwrap();
        let err = attach_artifacts(&conn, &id, 1, "m2", "d2").unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
        assert!(attach_artifacts(&conn, &id, 9, "m", "d").is_err());
    }

    #[test]
    fn test_duplicate_pending_is_rejected() {
        let conn = conn();
        let id = sid("cpu");
        create_pending(&conn, &id, 1).unwrap();
        assert!(matches!(
            create_pending(&conn, &id, 1),
            Err(Error::InconsistentState(_))
        ));
    }

    #[test]
    fn test_latest_and_count() {
        let conn = conn();
        assert!(get_latest(&conn, &sid("cpu")).unwrap().is_none());
        assert_eq!(count_distinct_series(&conn).unwrap(), 0);

        for v in 1..=3 {
            create_pending(&conn, &sid("cpu"), v).unwrap();
        }
        create_pending(&conn, &sid("mem"), 1).unwrap();

        assert_eq!(get_latest(&conn, &sid("cpu")).unwrap().unwrap().version, 3);
        assert_eq!(list_versions(&conn, &sid("cpu")).unwrap().len(), 3);
        assert_eq!(count_distinct_series(&conn).unwrap(), 2);
        assert!(get_version(&conn, &sid("cpu"), 7).unwrap().is_none());
    }
}
