//! Best-effort latency telemetry for train and predict calls.
//!
//! The service hands samples to a [`MetricsReporter`] after the core
//! operation has finished and never waits for them to be stored. A failing
//! sink is logged and otherwise ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Train,
    Predict,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Predict => "predict",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, op: OperationKind, elapsed: Duration) -> Result<()>;

    fn record_batch(&self, samples: &[(OperationKind, Duration)]) -> Result<()> {
        for &(op, elapsed) in samples {
            self.record(op, elapsed)?;
        }
        Ok(())
    }

    /// Retained samples in milliseconds, oldest first.
    fn latencies(&self, op: OperationKind) -> Result<Vec<f64>>;
}

/// Used when telemetry is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _op: OperationKind, _elapsed: Duration) -> Result<()> {
        Ok(())
    }

    fn latencies(&self, _op: OperationKind) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// Latency history kept in the shared database so every instance reports
/// the same numbers. Only the newest `history_limit` rows per operation
/// are retained.
#[derive(Clone)]
pub struct SqliteLatencyLog {
    pool: Pool,
    history_limit: usize,
}

impl SqliteLatencyLog {
    pub fn new(pool: Pool, history_limit: usize) -> Result<Self> {
        if history_limit < 1 {
            return Err(Error::validation("history_limit must be greater than or equal to 1"));
        }
        Ok(Self { pool, history_limit })
    }
}

impl MetricsSink for SqliteLatencyLog {
    fn record(&self, op: OperationKind, elapsed: Duration) -> Result<()> {
        self.record_batch(&[(op, elapsed)])
    }

    /// One transaction for the whole batch, trimming each touched operation.
    fn record_batch(&self, samples: &[(OperationKind, Duration)]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut touched = Vec::new();
        for &(op, elapsed) in samples {
            let ms = elapsed.as_micros() as f64 / 1000.0;
            if !ms.is_finite() {
                return Err(Error::validation("latency must be a finite number"));
            }
            tx.execute(
                "INSERT INTO operation_latencies (operation, duration_ms) VALUES (?1, ?2)",
                params![op.as_str(), ms],
            )?;
            if !touched.contains(&op) {
                touched.push(op);
            }
        }
        for op in touched {
            tx.execute(
                "DELETE FROM operation_latencies
                 WHERE operation = ?1 AND id NOT IN (
                    SELECT id FROM operation_latencies WHERE operation = ?1
                    ORDER BY id DESC LIMIT ?2
                 )",
                params![op.as_str(), self.history_limit as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn latencies(&self, op: OperationKind) -> Result<Vec<f64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT duration_ms FROM operation_latencies WHERE operation = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![op.as_str()], |row| row.get::<_, f64>(0))?;
        let mut out = Vec::new();
        for r in rows {
            let v = r?;
            if v.is_finite() {
                out.push(v);
            }
        }
        Ok(out)
    }
}

/// Queued samples before new ones are dropped.
pub const REPORT_QUEUE_CAPACITY: usize = 1024;
const MAX_BATCH: usize = 256;

enum Report {
    Sample(OperationKind, Duration),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front for a [`MetricsSink`]. Samples go through a bounded
/// channel to one background task that writes them in batches, so callers
/// never wait on the sink's storage.
#[derive(Clone)]
pub struct MetricsReporter {
    tx: mpsc::Sender<Report>,
}

impl MetricsReporter {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn MetricsSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(drain(sink, rx));
        Self { tx }
    }

    /// Queue one sample. Drops it if the queue is full.
    pub fn report(&self, op: OperationKind, elapsed: Duration) {
        match self.tx.try_send(Report::Sample(op, elapsed)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(operation = %op, "latency queue full, dropping sample")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(operation = %op, "latency writer has stopped, dropping sample")
            }
        }
    }

    /// Resolves once every sample queued before the call has been handed to
    /// the sink.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Report::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

async fn drain(sink: Arc<dyn MetricsSink>, mut rx: mpsc::Receiver<Report>) {
    while let Some(first) = rx.recv().await {
        let mut samples = Vec::new();
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(report) = next.take() {
            match report {
                Report::Sample(op, elapsed) => samples.push((op, elapsed)),
                Report::Flush(done) => waiters.push(done),
            }
            if samples.len() < MAX_BATCH {
                next = rx.try_recv().ok();
            }
        }

        if !samples.is_empty() {
            let count = samples.len();
            let sink = sink.clone();
            match tokio::task::spawn_blocking(move || sink.record_batch(&samples)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(samples = count, error = %e, "failed to record latencies"),
                Err(e) => warn!(samples = count, error = %e, "latency writer panicked"),
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
}

/// Average and p95 of a latency sample, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub p95: f64,
}

impl LatencySummary {
    /// Nearest-rank p95. Empty input yields zeros.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((0.95 * sorted.len() as f64).ceil() as usize).max(1);
        Self {
            avg,
            p95: sorted[rank - 1],
        }
    }
}
