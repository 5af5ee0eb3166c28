use crate::foundation::core::{ChunkIndex, RenderId};
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::errors::{EnhancedErrorInfo, ErrorSource};
use crate::model::progress::{ProgressUpdate, RenderProgress};
use crate::stages::{StageCtx, StageProgress};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Storage collaborator holding intermediate per-chunk artifacts.
pub trait ArtifactStorage: Send + Sync {
    fn put(&self, key: &str) -> OrchestratorResult<()>;

    /// Keys of intermediate artifacts written for `render_id`.
    fn list_intermediate(&self, render_id: &RenderId) -> OrchestratorResult<Vec<String>>;

    fn delete(&self, key: &str) -> OrchestratorResult<()>;
}

/// Key under which a worker stores the rendered output of `chunk`.
pub fn chunk_artifact_key(render_id: &RenderId, chunk: ChunkIndex) -> String {
    format!("renders/{render_id}/chunks/chunk-{:08}", chunk.0)
}

/// Deletes intermediate artifacts after encoding. Failures are recorded but never fatal.
pub struct CleanupStage {
    ctx: StageCtx,
    delete_attempts: u32,
}

impl CleanupStage {
    pub fn new(ctx: StageCtx, delete_attempts: u32) -> Self {
        Self {
            ctx,
            delete_attempts: delete_attempts.max(1),
        }
    }

    /// Schedule the given artifacts. An empty list finishes the stage immediately.
    pub fn schedule(&self, artifacts: Vec<String>) -> OrchestratorResult<bool> {
        self.ctx
            .apply(ProgressUpdate::CleanupScheduled { artifacts })
    }

    pub fn mark_deleted(&self, key: &str) -> OrchestratorResult<bool> {
        self.ctx.apply(ProgressUpdate::ArtifactDeleted {
            key: key.to_string(),
        })
    }

    /// List, schedule and delete every intermediate artifact of the render.
    #[tracing::instrument(skip(self, storage), fields(render = %self.ctx.render_id))]
    pub fn run(&self, storage: &dyn ArtifactStorage) -> OrchestratorResult<()> {
        let artifacts = match storage.list_intermediate(&self.ctx.render_id) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "listing intermediate artifacts failed; skipping cleanup");
                self.record_failure(None, &e, 1)?;
                Vec::new()
            }
        };
        self.schedule(artifacts)?;

        let pending: Vec<String> = self
            .ctx
            .read()?
            .cleanup()
            .map(|c| c.pending().map(str::to_string).collect())
            .unwrap_or_default();

        for key in pending {
            self.delete_one(storage, &key)?;
        }
        Ok(())
    }

    fn delete_one(&self, storage: &dyn ArtifactStorage, key: &str) -> OrchestratorResult<()> {
        for attempt in 1..=self.delete_attempts {
            match storage.delete(key) {
                Ok(()) => {
                    self.mark_deleted(key)?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(key, attempt, error = %e, "artifact deletion failed");
                    self.record_failure(Some(key), &e, attempt)?;
                }
            }
        }
        self.ctx.apply(ProgressUpdate::ArtifactAbandoned {
            key: key.to_string(),
        })?;
        Ok(())
    }

    /// Cleanup failures are always recorded as retryable; they never fail the render.
    fn record_failure(
        &self,
        key: Option<&str>,
        err: &OrchestratorError,
        attempt: u32,
    ) -> OrchestratorResult<bool> {
        let message = match key {
            Some(key) => format!("could not delete '{key}': {err}"),
            None => format!("could not list intermediate artifacts: {err}"),
        };
        self.ctx.apply(ProgressUpdate::ErrorRecorded {
            error: EnhancedErrorInfo {
                message,
                stack: err.detail(),
                chunk: None,
                attempt,
                will_retry: true,
                source: ErrorSource::Cleanup,
                time_ms: self.ctx.clock.now_ms(),
            },
        })
    }
}

/// Confirmed deletions over scheduled artifacts; `None` until cleanup was scheduled.
pub fn cleanup_progress(progress: &RenderProgress) -> Option<StageProgress> {
    progress.cleanup().map(|c| StageProgress {
        completed: u64::from(c.files_deleted()),
        total: Some(u64::from(c.files_to_delete())),
        done_in: c.done_in,
    })
}

/// In-process [`ArtifactStorage`] with optional keys that always fail to delete.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStorage {
    keys: Mutex<BTreeSet<String>>,
    undeletable: BTreeSet<String>,
}

impl InMemoryArtifactStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deleting any of `keys` fails.
    pub fn with_undeletable(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: Mutex::new(BTreeSet::new()),
            undeletable: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().is_ok_and(|k| k.contains(key))
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStorage for InMemoryArtifactStorage {
    fn put(&self, key: &str) -> OrchestratorResult<()> {
        self.keys
            .lock()
            .map_err(|_| OrchestratorError::store("artifact storage lock poisoned"))?
            .insert(key.to_string());
        Ok(())
    }

    fn list_intermediate(&self, render_id: &RenderId) -> OrchestratorResult<Vec<String>> {
        let prefix = format!("renders/{render_id}/chunks/");
        let keys = self
            .keys
            .lock()
            .map_err(|_| OrchestratorError::store("artifact storage lock poisoned"))?;
        Ok(keys
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &str) -> OrchestratorResult<()> {
        if self.undeletable.contains(key) {
            return Err(OrchestratorError::transient_store(format!(
                "access denied deleting '{key}'"
            )));
        }
        self.keys
            .lock()
            .map_err(|_| OrchestratorError::store("artifact storage lock poisoned"))?
            .remove(key);
        Ok(())
    }
}
