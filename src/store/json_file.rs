use crate::foundation::core::RenderId;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::progress::{ProgressUpdate, RenderProgress};
use crate::store::RenderStatusStore;
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// [`RenderStatusStore`] persisting each record as `<root>/<render-id>.json`.
///
/// Writes go to a temporary sibling file, unique per writer, that is renamed over the record, so
/// readers never see a torn document. Read-modify-write cycles hold an exclusive advisory lock on
/// `<root>/<render-id>.lock`, which serializes writers across store instances and processes that
/// share the directory. Lock files are left in place when a record is removed.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, render_id: &RenderId) -> PathBuf {
        self.root.join(format!("{render_id}.json"))
    }

    fn lock_path(&self, render_id: &RenderId) -> PathBuf {
        self.root.join(format!("{render_id}.lock"))
    }

    fn load(&self, render_id: &RenderId) -> OrchestratorResult<RenderProgress> {
        let path = self.record_path(render_id);
        let bytes = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, record: &RenderProgress) -> OrchestratorResult<()> {
        let path = self.record_path(record.render_id());
        let tmp = self.root.join(format!(
            "{}.json.{}-{}.tmp",
            record.render_id(),
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let bytes = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_error(&path, e));
        }
        Ok(())
    }

    /// Run `f` while holding the record's exclusive lock.
    fn locked<T>(
        &self,
        render_id: &RenderId,
        f: impl FnOnce() -> OrchestratorResult<T>,
    ) -> OrchestratorResult<T> {
        let path = self.lock_path(render_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| io_error(&path, e))?;
        // Released when `file` is closed.
        f()
    }
}

fn io_error(path: &Path, e: std::io::Error) -> OrchestratorError {
    let msg = format!("{}: {e}", path.display());
    if e.kind() == ErrorKind::NotFound {
        OrchestratorError::store(msg)
    } else {
        OrchestratorError::transient_store(msg)
    }
}

impl RenderStatusStore for JsonFileStore {
    fn create(&self, record: RenderProgress) -> OrchestratorResult<()> {
        self.locked(record.render_id(), || {
            if self.record_path(record.render_id()).exists() {
                return Err(OrchestratorError::store(format!(
                    "render '{}' already exists",
                    record.render_id()
                )));
            }
            self.save(&record)
        })
    }

    fn read(&self, render_id: &RenderId) -> OrchestratorResult<RenderProgress> {
        self.load(render_id)
    }

    fn apply(
        &self,
        render_id: &RenderId,
        update: &ProgressUpdate,
        now_ms: u64,
    ) -> OrchestratorResult<bool> {
        self.locked(render_id, || {
            let mut record = self.load(render_id)?;
            let changed = record.apply(update, now_ms)?;
            if changed {
                self.save(&record)?;
            }
            Ok(changed)
        })
    }

    fn remove(&self, render_id: &RenderId) -> OrchestratorResult<Option<RenderProgress>> {
        self.locked(render_id, || {
            let path = self.record_path(render_id);
            let record = match self.load(render_id) {
                Ok(record) => record,
                Err(_) if !path.exists() => return Ok(None),
                Err(e) => return Err(e),
            };
            std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
            Ok(Some(record))
        })
    }
}
