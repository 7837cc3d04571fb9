//! SQLite storage layer -- pool, schema, version allocation and the model registry.

pub mod allocator;
pub mod registry;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub use self::allocator::allocate_next;
pub use self::registry::ModelVersionRecord;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Pool tuning knobs, usually taken from `[storage]` in the config file.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_size: u32,
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path, opts: PoolOptions) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let busy_ms = opts.busy_timeout.as_millis();
    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        c.execute_batch(&format!(
            "PRAGMA busy_timeout = {busy_ms};
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;"
        ))
    });

    let pool = R2D2Pool::builder()
        .max_size(opts.max_size)
        .build(manager)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
