//! Write path: fit, allocate, persist artifacts, commit.
//!
//! Every attempt walks `Allocated -> ArtifactsWritten -> Committed` inside a
//! single IMMEDIATE transaction. Until the commit, the registry row and the
//! counter bump exist only in that transaction. A failure or crash before
//! commit rolls both back; artifacts already written under the allocated
//! version stay on disk as orphans. Allocation skips any version whose keys
//! are occupied, so orphaned keys are never written again. Writers hold the
//! database write lock, which makes that check race-free.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactKey, ArtifactKind, ArtifactStore};
use crate::error::{Error, Result};
use crate::model::Detector;
use crate::series::{SeriesId, TrainingDataset, TrainingPolicy};
use crate::storage::{allocate_next, registry};

/// Result of a committed training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainOutcome {
    pub series_id: String,
    pub version: u32,
    pub points_used: usize,
}

/// Where an attempt currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingPhase {
    Pending,
    Allocated {
        version: u32,
    },
    ArtifactsWritten {
        version: u32,
        model_ref: String,
        data_ref: String,
    },
    Committed {
        version: u32,
    },
}

/// One training attempt and its phase. Transitions are only legal in order.
#[derive(Debug)]
pub struct TrainingAttempt {
    pub id: Uuid,
    pub series_id: SeriesId,
    phase: TrainingPhase,
}

impl TrainingAttempt {
    pub fn new(series_id: SeriesId) -> Self {
        Self {
            id: Uuid::new_v4(),
            series_id,
            phase: TrainingPhase::Pending,
        }
    }

    pub fn phase(&self) -> &TrainingPhase {
        &self.phase
    }

    pub fn allocated(&mut self, version: u32) -> Result<()> {
        match self.phase {
            TrainingPhase::Pending => {
                self.phase = TrainingPhase::Allocated { version };
                Ok(())
            }
            _ => Err(self.out_of_order("Allocated")),
        }
    }

    pub fn artifacts_written(&mut self, model_ref: String, data_ref: String) -> Result<()> {
        match self.phase {
            TrainingPhase::Allocated { version } => {
                self.phase = TrainingPhase::ArtifactsWritten {
                    version,
                    model_ref,
                    data_ref,
                };
                Ok(())
            }
            _ => Err(self.out_of_order("ArtifactsWritten")),
        }
    }

    pub fn committed(&mut self) -> Result<u32> {
        match self.phase {
            TrainingPhase::ArtifactsWritten { version, .. } => {
                self.phase = TrainingPhase::Committed { version };
                Ok(version)
            }
            _ => Err(self.out_of_order("Committed")),
        }
    }

    /// Version allocated so far, if any.
    pub fn version(&self) -> Option<u32> {
        match &self.phase {
            TrainingPhase::Pending => None,
            TrainingPhase::Allocated { version }
            | TrainingPhase::ArtifactsWritten { version, .. }
            | TrainingPhase::Committed { version } => Some(*version),
        }
    }

    fn out_of_order(&self, to: &str) -> Error {
        Error::InconsistentState(format!(
            "training attempt {} cannot move from {:?} to {to}",
            self.id, self.phase
        ))
    }
}

/// Train `dataset` for `series_id` and commit a new version.
///
/// Blocking: runs store I/O on the calling thread and holds `conn` for the
/// whole transaction.
pub fn train(
    conn: &mut Connection,
    store: &dyn ArtifactStore,
    detector: &dyn Detector,
    policy: &TrainingPolicy,
    series_id: &SeriesId,
    dataset: &TrainingDataset,
) -> Result<TrainOutcome> {
    if let Err(e) = policy.check(dataset) {
        warn!(series_id = %series_id, error = %e, "training rejected");
        return Err(e);
    }

    // Fit and encode before taking the write lock.
    let state = detector.fit(dataset)?;
    let model_bytes = detector.serialize(&state)?;
    let data_bytes = dataset.to_json_bytes()?;

    let mut attempt = TrainingAttempt::new(series_id.clone());
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // A failed COMMIT drops `tx`, which rolls it back.
    let settled = match write_version(&tx, store, &mut attempt, &model_bytes, &data_bytes) {
        Ok(()) => tx.commit().map_err(Error::from),
        Err(e) => {
            if let Err(rb) = tx.rollback() {
                error!(attempt = %attempt.id, error = %rb, "rollback failed");
            }
            Err(e)
        }
    };

    match settled.and_then(|()| attempt.committed()) {
        Ok(version) => {
            info!(
                series_id = %series_id,
                version,
                attempt = %attempt.id,
                points = dataset.len(),
                "training committed"
            );
            Ok(TrainOutcome {
                series_id: series_id.to_string(),
                version,
                points_used: dataset.len(),
            })
        }
        Err(e) => {
            warn!(
                series_id = %series_id,
                attempt = %attempt.id,
                phase = ?attempt.phase(),
                error = %e,
                "training rolled back"
            );
            Err(e)
        }
    }
}

fn write_version(
    conn: &Connection,
    store: &dyn ArtifactStore,
    attempt: &mut TrainingAttempt,
    model_bytes: &[u8],
    data_bytes: &[u8],
) -> Result<()> {
    let series_id = attempt.series_id.clone();

    // A number whose keys already hold orphans from an aborted attempt is
    // burned: allocate past it so an artifact key is never written twice.
    let version = loop {
        let candidate = allocate_next(conn, &series_id)?;
        if !has_orphans(store, &series_id, candidate)? {
            break candidate;
        }
        warn!(
            series_id = %series_id,
            version = candidate,
            attempt = %attempt.id,
            "skipping version with orphaned artifacts"
        );
    };
    attempt.allocated(version)?;
    registry::create_pending(conn, &series_id, version)?;
    debug!(series_id = %series_id, version, attempt = %attempt.id, "version allocated");

    let model_ref = store.put(&ArtifactKey::new(&series_id, version, ArtifactKind::Model), model_bytes)?;
    let data_ref = store.put(&ArtifactKey::new(&series_id, version, ArtifactKind::Data), data_bytes)?;
    attempt.artifacts_written(model_ref.clone(), data_ref.clone())?;
    debug!(series_id = %series_id, version, attempt = %attempt.id, "artifacts written");

    registry::attach_artifacts(conn, &series_id, version, &model_ref, &data_ref)
}

fn has_orphans(store: &dyn ArtifactStore, series_id: &SeriesId, version: u32) -> Result<bool> {
    for kind in [ArtifactKind::Model, ArtifactKind::Data] {
        if store.exists(&store.resolve(&ArtifactKey::new(series_id, version, kind)))? {
            return Ok(true);
        }
    }
    Ok(false)
}
