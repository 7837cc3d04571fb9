//! End-to-end tests of the versioned train / predict lifecycle against a
//! real SQLite file and a temp artifact directory.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anomalyd::artifact::{ArtifactKey, ArtifactKind, ArtifactStore, LocalArtifactStore};
use anomalyd::config::Config;
use anomalyd::model::{build_detector, DetectorKind};
use anomalyd::series::TrainingPolicy;
use anomalyd::storage::{allocator, open_pool, PoolOptions};
use anomalyd::telemetry::{MetricsSink, OperationKind};
use anomalyd::{DataPoint, Error, ModelEngine, SeriesId, TrainingDataset, VersionSelector};
use bytes::Bytes;
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.storage.database_path = dir.path().join("registry.db");
    cfg.storage.artifact_root = dir.path().join("artifacts");
    cfg
}

fn engine_in(dir: &TempDir) -> ModelEngine {
    ModelEngine::from_config(&config_in(dir)).unwrap()
}

fn sid(s: &str) -> SeriesId {
    SeriesId::parse(s).unwrap()
}

fn dataset(raw: &[(i64, f64)]) -> TrainingDataset {
    TrainingDataset::new(
        raw.iter()
            .map(|&(timestamp, value)| DataPoint { timestamp, value })
            .collect(),
    )
    .unwrap()
}

fn spike() -> TrainingDataset {
    dataset(&[(0, 10.0), (1, 10.0), (2, 10.0), (3, 50.0)])
}

fn pt(timestamp: i64, value: f64) -> DataPoint {
    DataPoint::new(timestamp, value).unwrap()
}

#[tokio::test]
async fn test_reference_model_flags_spike() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");

    let outcome = engine.train(&id, spike()).await.unwrap();
    assert_eq!(outcome.version, 1);
    assert_eq!(outcome.points_used, 4);

    let high = engine.predict(&id, pt(4, 50.0), VersionSelector::Latest).await.unwrap();
    assert!(high.anomaly);
    assert_eq!(high.version, 1);

    let normal = engine.predict(&id, pt(4, 10.0), VersionSelector::Latest).await.unwrap();
    assert!(!normal.anomaly);
}

#[tokio::test]
async fn test_prediction_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("latency");
    engine
        .train(&id, dataset(&[(0, 3.0), (1, 7.5), (2, 1.25), (3, 9.0)]))
        .await
        .unwrap();

    for value in [0.0, 5.0, 11.0, 14.5] {
        let first = engine.predict(&id, pt(9, value), VersionSelector::Latest).await.unwrap();
        for _ in 0..3 {
            let again = engine.predict(&id, pt(9, value), VersionSelector::Latest).await.unwrap();
            assert_eq!(first, again);
        }
    }
}

#[tokio::test]
async fn test_versions_increase_and_old_versions_stay_usable() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");

    // v1 learns a tight band around 10; v2 a wide band around 100.
    engine.train(&id, dataset(&[(0, 9.0), (1, 10.0), (2, 11.0)])).await.unwrap();
    let v2 = engine
        .train(&id, dataset(&[(0, 50.0), (1, 100.0), (2, 150.0)]))
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let on_v1 = engine.predict(&id, pt(5, 100.0), VersionSelector::Exact(1)).await.unwrap();
    assert!(on_v1.anomaly);
    assert_eq!(on_v1.version, 1);

    let on_latest = engine.predict(&id, pt(5, 100.0), VersionSelector::Latest).await.unwrap();
    assert!(!on_latest.anomaly);
    assert_eq!(on_latest.version, 2);

    assert_eq!(engine.latest(&id).await.unwrap().version, 2);
    assert_eq!(engine.versions(&id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_selector_spellings_resolve_same_record() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");
    engine.train(&id, spike()).await.unwrap();
    engine.train(&id, spike()).await.unwrap();

    let mut records = Vec::new();
    for raw in ["v1", "1", "V1"] {
        let selector: VersionSelector = raw.parse().unwrap();
        records.push(engine.resolve(&id, selector).await.unwrap());
    }
    assert_eq!(records[0].version, 1);
    assert_eq!(records[0], records[1]);
    assert_eq!(records[1], records[2]);
}

#[tokio::test]
async fn test_unknown_series_and_version_are_not_found() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);

    let err = engine
        .predict(&sid("ghost"), pt(1, 1.0), VersionSelector::Latest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    engine.train(&sid("cpu"), spike()).await.unwrap();
    let err = engine
        .predict(&sid("cpu"), pt(1, 1.0), VersionSelector::Exact(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_below_floor_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let cfg = config_in(&dir);
    let engine = ModelEngine::from_config(&cfg).unwrap();
    let id = sid("cpu");

    let err = engine
        .train(&id, dataset(&[(0, 1.0), (1, 2.0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert!(matches!(engine.latest(&id).await, Err(Error::NotFound(_))));
    assert_eq!(engine.series_count().await.unwrap(), 0);
    let conn = engine.pool().get().unwrap();
    assert_eq!(allocator::last_allocated(&conn, &id).unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_trainers_get_contiguous_versions() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("busy-series");

    engine.train(&id, spike()).await.unwrap();

    let calls = (0..8).map(|_| {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.train(&id, spike()).await })
    });
    let results = futures::future::join_all(calls).await;

    let versions: BTreeSet<u32> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().version)
        .collect();
    assert_eq!(versions, (2..=9).collect::<BTreeSet<u32>>());
    assert_eq!(engine.latest(&id).await.unwrap().version, 9);
    assert_eq!(engine.versions(&id).await.unwrap().len(), 9);
}

#[tokio::test]
async fn test_independent_series_train_in_parallel() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);

    let calls = (0..6).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.train(&sid(&format!("s{i}")), spike()).await })
    });
    for r in futures::future::join_all(calls).await {
        assert_eq!(r.unwrap().unwrap().version, 1);
    }
    assert_eq!(engine.series_count().await.unwrap(), 6);
}

/// Delegates to a local store but refuses to write one artifact kind.
struct FailingStore {
    inner: LocalArtifactStore,
    fail_on: ArtifactKind,
}

impl ArtifactStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    fn resolve(&self, key: &ArtifactKey) -> String {
        self.inner.resolve(key)
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> anomalyd::Result<String> {
        if key.kind == self.fail_on {
            return Err(Error::Storage("disk full".into()));
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, reference: &str) -> anomalyd::Result<Bytes> {
        self.inner.get(reference)
    }

    fn exists(&self, reference: &str) -> anomalyd::Result<bool> {
        self.inner.exists(reference)
    }
}

fn engine_with_store(dir: &TempDir, store: Arc<dyn ArtifactStore>) -> ModelEngine {
    let pool = open_pool(&dir.path().join("registry.db"), PoolOptions::default()).unwrap();
    ModelEngine::new(
        pool,
        store,
        build_detector(DetectorKind::MeanStd, 1.5),
        TrainingPolicy::default(),
    )
}

#[tokio::test]
async fn test_artifact_failure_rolls_back_and_skips_orphans() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("artifacts");
    let id = sid("cpu");

    // Model artifact lands, data artifact fails: v1 keys hold an orphan.
    let failing = engine_with_store(
        &dir,
        Arc::new(FailingStore {
            inner: LocalArtifactStore::new(&root).unwrap(),
            fail_on: ArtifactKind::Data,
        }),
    );
    let err = failing.train(&id, spike()).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(matches!(failing.latest(&id).await, Err(Error::NotFound(_))));
    assert!(matches!(
        failing.predict(&id, pt(4, 1.0), VersionSelector::Exact(1)).await,
        Err(Error::NotFound(_))
    ));

    let healthy = engine_with_store(&dir, Arc::new(LocalArtifactStore::new(&root).unwrap()));
    let outcome = healthy.train(&id, spike()).await.unwrap();
    assert_eq!(outcome.version, 2);
    assert!(matches!(healthy.version(&id, 1).await, Err(Error::NotFound(_))));
    assert!(healthy.predict(&id, pt(4, 50.0), VersionSelector::Latest).await.unwrap().anomaly);
}

#[tokio::test]
async fn test_failure_before_any_write_does_not_burn_version() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("artifacts");
    let id = sid("cpu");

    let failing = engine_with_store(
        &dir,
        Arc::new(FailingStore {
            inner: LocalArtifactStore::new(&root).unwrap(),
            fail_on: ArtifactKind::Model,
        }),
    );
    assert!(failing.train(&id, spike()).await.is_err());

    let healthy = engine_with_store(&dir, Arc::new(LocalArtifactStore::new(&root).unwrap()));
    assert_eq!(healthy.train(&id, spike()).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_dangling_reference_is_inconsistent_not_missing() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");
    engine.train(&id, spike()).await.unwrap();

    let record = engine.latest(&id).await.unwrap();
    std::fs::remove_file(record.model_ref.as_deref().unwrap()).unwrap();

    let err = engine
        .predict(&id, pt(4, 1.0), VersionSelector::Latest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentState(_)));
}

#[tokio::test]
async fn test_null_reference_is_inconsistent_state() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");
    {
        // Simulate a corrupted committed row.
        let conn = engine.pool().get().unwrap();
        anomalyd::storage::registry::create_pending(&conn, &id, 1).unwrap();
    }
    let err = engine
        .predict(&id, pt(4, 1.0), VersionSelector::Latest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentState(_)));
}

#[tokio::test]
async fn test_training_data_is_stored_verbatim() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");
    engine.train(&id, spike()).await.unwrap();

    let (record, data) = engine.training_data(&id, VersionSelector::Exact(1)).await.unwrap();
    assert_eq!(data, spike());
    let data_ref = record.data_ref.unwrap();
    assert!(data_ref.ends_with("data/cpu/cpu_data_v1"));
    assert!(record.model_ref.unwrap().ends_with("model/cpu/cpu_model_v1"));
}

#[tokio::test]
async fn test_artifact_keys_are_write_once() {
    let dir = TempDir::new().unwrap();
    let store = LocalArtifactStore::new(dir.path()).unwrap();
    let key = ArtifactKey::new(&sid("cpu"), 1, ArtifactKind::Model);
    store.put(&key, b"a").unwrap();
    assert!(matches!(store.put(&key, b"b"), Err(Error::ArtifactConflict { .. })));
}

/// Sink that always fails, to prove telemetry cannot break a request.
struct BrokenSink;

impl MetricsSink for BrokenSink {
    fn record(&self, _op: OperationKind, _elapsed: Duration) -> anomalyd::Result<()> {
        Err(Error::Storage("metrics down".into()))
    }

    fn latencies(&self, _op: OperationKind) -> anomalyd::Result<Vec<f64>> {
        Err(Error::Storage("metrics down".into()))
    }
}

#[tokio::test]
async fn test_broken_telemetry_never_fails_requests() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir).with_metrics(
        Arc::new(BrokenSink),
        anomalyd::health::HealthFailurePolicy::Zeroed,
    );
    let id = sid("cpu");

    assert_eq!(engine.train(&id, spike()).await.unwrap().version, 1);
    assert!(engine.predict(&id, pt(4, 50.0), VersionSelector::Latest).await.unwrap().anomaly);

    let report = engine.health().await.unwrap();
    assert_eq!(report.series_trained, 1);
    assert_eq!(report.training_latency_ms.avg, 0.0);

    let strict = engine.with_metrics(
        Arc::new(BrokenSink),
        anomalyd::health::HealthFailurePolicy::Unavailable,
    );
    assert!(matches!(strict.health().await, Err(Error::Storage(_))));
}

#[tokio::test]
async fn test_health_reports_latencies() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("cpu");
    engine.train(&id, spike()).await.unwrap();
    engine.predict(&id, pt(4, 1.0), VersionSelector::Latest).await.unwrap();
    engine.flush_metrics().await;

    let report = engine.health().await.unwrap();
    assert_eq!(report.series_trained, 1);
    assert!(report.training_latency_ms.avg > 0.0);
    assert!(report.inference_latency_ms.p95 >= 0.0);
}

#[tokio::test]
async fn test_predict_does_not_wait_on_database_writers() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config_in(&dir);
    cfg.storage.busy_timeout_ms = 3000;
    let engine = ModelEngine::from_config(&cfg).unwrap();
    let id = sid("cpu");
    engine.train(&id, spike()).await.unwrap();
    engine.flush_metrics().await;

    // Another process holds the write lock for the whole prediction.
    let writer = rusqlite::Connection::open(&cfg.storage.database_path).unwrap();
    writer.execute_batch("BEGIN IMMEDIATE").unwrap();

    let started = Instant::now();
    let prediction = engine
        .predict(&id, pt(4, 50.0), VersionSelector::Latest)
        .await
        .unwrap();
    let took = started.elapsed();
    assert!(prediction.anomaly);
    assert!(took < Duration::from_millis(1500), "predict took {took:?}");

    writer.execute_batch("COMMIT").unwrap();
    engine.flush_metrics().await;
}

#[tokio::test]
async fn test_predictions_during_training_see_committed_versions() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let id = sid("busy-series");
    engine.train(&id, spike()).await.unwrap();

    let trainers = (0..6).map(|_| {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.train(&id, spike()).await })
    });
    let readers = (0..24i64).map(|i| {
        let engine = engine.clone();
        let id = id.clone();
        let selector = if i % 3 == 0 {
            VersionSelector::Exact(1)
        } else {
            VersionSelector::Latest
        };
        tokio::spawn(async move { engine.predict(&id, pt(10 + i, 50.0), selector).await })
    });
    let (trained, read) = tokio::join!(
        futures::future::join_all(trainers),
        futures::future::join_all(readers)
    );

    let mut committed: BTreeSet<u32> = trained
        .into_iter()
        .map(|r| r.unwrap().unwrap().version)
        .collect();
    committed.insert(1);
    assert_eq!(committed, (1..=7).collect::<BTreeSet<u32>>());

    for r in read {
        let prediction = r.unwrap().unwrap();
        assert!(committed.contains(&prediction.version));
        assert!(prediction.anomaly);
    }
    for version in committed {
        let record = engine.version(&id, version).await.unwrap();
        assert!(record.model_ref.is_some());
        assert!(record.data_ref.is_some());
    }
}
