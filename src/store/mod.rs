//! Shared render status records.
//!
//! A store is the only channel between the orchestrator and its workers. It provides atomic
//! application of [`ProgressUpdate`]s; the update semantics themselves live in
//! [`RenderProgress::apply`], so every backend behaves identically.

/// JSON-file backed store for workers sharing a filesystem.
pub mod json_file;
/// Process-local store.
pub mod memory;

use crate::foundation::core::RenderId;
use crate::foundation::error::OrchestratorResult;
use crate::model::progress::{ProgressUpdate, RenderProgress};

pub trait RenderStatusStore: Send + Sync {
    /// Insert a fresh record. Fails if a record with the same id already exists.
    fn create(&self, record: RenderProgress) -> OrchestratorResult<()>;

    /// Snapshot of the current record.
    fn read(&self, render_id: &RenderId) -> OrchestratorResult<RenderProgress>;

    /// Atomically apply `update` at `now_ms`. Returns whether the record changed.
    fn apply(
        &self,
        render_id: &RenderId,
        update: &ProgressUpdate,
        now_ms: u64,
    ) -> OrchestratorResult<bool>;

    /// Remove and return a record, e.g. to archive it after a terminal state.
    fn remove(&self, render_id: &RenderId) -> OrchestratorResult<Option<RenderProgress>>;
}
