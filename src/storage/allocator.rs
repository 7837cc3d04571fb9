//! Per-series version allocation.
//!
//! The counter row in `series_versions` is the only source of truth. A single
//! upsert-and-increment statement both creates the row on first training and
//! bumps it afterwards, so two trainers of one series can never read the same
//! value. Call it inside the training transaction: a rollback also undoes the
//! increment, which keeps committed versions gap-free.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::series::SeriesId;

/// Atomically allocate the next version number for `series_id`.
pub fn allocate_next(conn: &Connection, series_id: &SeriesId) -> Result<u32> {
    let version: u32 = conn.query_row(
        "INSERT INTO series_versions (series_id, last_version) VALUES (?1, 1)
         ON CONFLICT(series_id) DO UPDATE SET last_version = last_version + 1
         RETURNING last_version",
        params![series_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Last allocated version, or `None` for a series never trained.
pub fn last_allocated(conn: &Connection, series_id: &SeriesId) -> Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT last_version FROM series_versions WHERE series_id = ?1")?;
    let mut rows = stmt.query(params![series_id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}
