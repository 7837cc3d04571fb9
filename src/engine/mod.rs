//! Versioned model lifecycle: the train and predict orchestrators plus the
//! async service that runs them.
//!
//! Store I/O is blocking, so each call runs on tokio's blocking pool with its
//! own pooled connection. Nothing in process decides versions or visibility;
//! that is left to the database. Latency samples are queued to a background
//! writer and never awaited by the request.

pub mod predict;
pub mod train;

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::artifact::{self, ArtifactStore};
use crate::config::Config;
use crate::error::Result;
use crate::health::{HealthFailurePolicy, HealthReport};
use crate::model::{self, Detector};
use crate::series::{DataPoint, SeriesId, TrainingDataset, TrainingPolicy};
use crate::storage::{self, registry, ModelVersionRecord, Pool};
use crate::telemetry::{
    MetricsReporter, MetricsSink, NoopSink, OperationKind, SqliteLatencyLog, REPORT_QUEUE_CAPACITY,
};

pub use self::predict::{Prediction, VersionSelector};
pub use self::train::{TrainOutcome, TrainingAttempt, TrainingPhase};

#[derive(Clone)]
pub struct ModelEngine {
    pool: Pool,
    store: Arc<dyn ArtifactStore>,
    detector: Arc<dyn Detector>,
    policy: TrainingPolicy,
    sink: Arc<dyn MetricsSink>,
    reporter: Arc<OnceLock<MetricsReporter>>,
    health_policy: HealthFailurePolicy,
}

impl ModelEngine {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ArtifactStore>,
        detector: Arc<dyn Detector>,
        policy: TrainingPolicy,
    ) -> Self {
        Self {
            pool,
            store,
            detector,
            policy,
            sink: Arc::new(NoopSink),
            reporter: Arc::new(OnceLock::new()),
            health_policy: HealthFailurePolicy::default(),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>, policy: HealthFailurePolicy) -> Self {
        self.sink = sink;
        self.reporter = Arc::new(OnceLock::new());
        self.health_policy = policy;
        self
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        cfg.validate()?;
        let pool = storage::open_pool(&cfg.storage.database_path, cfg.storage.pool_options())?;
        let backend = cfg.storage.backend.parse()?;
        let store = artifact::open_store(backend, &cfg.storage.artifact_root, &cfg.storage.s3)?;
        let detector = model::build_detector(cfg.model.kind, cfg.model.sigma_multiplier);

        let sink: Arc<dyn MetricsSink> = if cfg.telemetry.enabled {
            Arc::new(SqliteLatencyLog::new(pool.clone(), cfg.telemetry.history_limit)?)
        } else {
            Arc::new(NoopSink)
        };

        Ok(Self::new(pool, store, detector, cfg.training.policy())
            .with_metrics(sink, cfg.telemetry.health_failure_policy))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Train and commit the next version of `series_id`.
    pub async fn train(&self, series_id: &SeriesId, dataset: TrainingDataset) -> Result<TrainOutcome> {
        let store = self.store.clone();
        let detector = self.detector.clone();
        let policy = self.policy;
        let sid = series_id.clone();

        let started = Instant::now();
        let result = self
            .with_conn(move |conn| {
                train::train(conn, store.as_ref(), detector.as_ref(), &policy, &sid, &dataset)
            })
            .await;
        self.report(OperationKind::Train, started.elapsed());
        result
    }

    /// Score one point against the selected version.
    pub async fn predict(
        &self,
        series_id: &SeriesId,
        point: DataPoint,
        selector: VersionSelector,
    ) -> Result<Prediction> {
        let store = self.store.clone();
        let detector = self.detector.clone();
        let sid = series_id.clone();

        let started = Instant::now();
        let result = self
            .with_conn(move |conn| {
                predict::predict(conn, store.as_ref(), detector.as_ref(), &sid, &point, selector)
            })
            .await;
        self.report(OperationKind::Predict, started.elapsed());
        result
    }

    pub async fn resolve(&self, series_id: &SeriesId, selector: VersionSelector) -> Result<ModelVersionRecord> {
        let sid = series_id.clone();
        self.with_conn(move |conn| predict::resolve(conn, &sid, selector))
            .await
    }

    pub async fn latest(&self, series_id: &SeriesId) -> Result<ModelVersionRecord> {
        self.resolve(series_id, VersionSelector::Latest).await
    }

    pub async fn version(&self, series_id: &SeriesId, version: u32) -> Result<ModelVersionRecord> {
        self.resolve(series_id, VersionSelector::Exact(version)).await
    }

    pub async fn versions(&self, series_id: &SeriesId) -> Result<Vec<ModelVersionRecord>> {
        let sid = series_id.clone();
        self.with_conn(move |conn| registry::list_versions(conn, &sid))
            .await
    }

    pub async fn series_count(&self) -> Result<u64> {
        self.with_conn(|conn| registry::count_distinct_series(conn))
            .await
    }

    /// Stored training dataset behind a version.
    pub async fn training_data(
        &self,
        series_id: &SeriesId,
        selector: VersionSelector,
    ) -> Result<(ModelVersionRecord, TrainingDataset)> {
        let store = self.store.clone();
        let sid = series_id.clone();
        self.with_conn(move |conn| predict::training_data(conn, store.as_ref(), &sid, selector))
            .await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let series_trained = self.series_count().await?;
        let sink = self.sink.clone();
        let policy = self.health_policy;
        tokio::task::spawn_blocking(move || HealthReport::build(series_trained, sink.as_ref(), policy))
            .await?
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }

    /// Wait for queued latency samples to reach the sink. Used before exit
    /// and by callers that read latencies right after an operation.
    pub async fn flush_metrics(&self) {
        if let Some(reporter) = self.reporter.get() {
            reporter.flush().await;
        }
    }

    /// Queues the sample and returns at once. The writer task starts on first
    /// use, inside the runtime serving the request.
    fn report(&self, op: OperationKind, elapsed: Duration) {
        self.reporter
            .get_or_init(|| MetricsReporter::spawn(self.sink.clone(), REPORT_QUEUE_CAPACITY))
            .report(op, elapsed);
    }
}
