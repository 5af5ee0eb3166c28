use crate::foundation::core::RenderId;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::progress::{ProgressUpdate, RenderProgress};
use crate::store::RenderStatusStore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// [`RenderStatusStore`] holding records in process memory behind one mutex.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: Mutex<HashMap<RenderId, RenderProgress>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> OrchestratorResult<MutexGuard<'_, HashMap<RenderId, RenderProgress>>> {
        self.records
            .lock()
            .map_err(|_| OrchestratorError::store("status store lock poisoned"))
    }
}

fn missing(render_id: &RenderId) -> OrchestratorError {
    OrchestratorError::store(format!("no record for render '{render_id}'"))
}

impl RenderStatusStore for InMemoryStatusStore {
    fn create(&self, record: RenderProgress) -> OrchestratorResult<()> {
        let mut records = self.lock()?;
        if records.contains_key(record.render_id()) {
            return Err(OrchestratorError::store(format!(
                "render '{}' already exists",
                record.render_id()
            )));
        }
        records.insert(record.render_id().clone(), record);
        Ok(())
    }

    fn read(&self, render_id: &RenderId) -> OrchestratorResult<RenderProgress> {
        self.lock()?
            .get(render_id)
            .cloned()
            .ok_or_else(|| missing(render_id))
    }

    fn apply(
        &self,
        render_id: &RenderId,
        update: &ProgressUpdate,
        now_ms: u64,
    ) -> OrchestratorResult<bool> {
        let mut records = self.lock()?;
        let record = records.get_mut(render_id).ok_or_else(|| missing(render_id))?;
        record.apply(update, now_ms)
    }

    fn remove(&self, render_id: &RenderId) -> OrchestratorResult<Option<RenderProgress>> {
        Ok(self.lock()?.remove(render_id))
    }
}
