use crate::foundation::clock::Clock;
use crate::foundation::core::RenderId;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::stages::cleanup::{ArtifactStorage, chunk_artifact_key};
use crate::store::RenderStatusStore;
use crate::transport::worker::{ChunkFailure, report_chunk_outcome};
use crate::transport::{ChunkSpec, InvocationTransport, InvokeOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Renders the frames of one chunk attempt.
pub trait ChunkRenderer: Send + Sync {
    fn render_chunk(&self, spec: &ChunkSpec) -> Result<(), ChunkFailure>;
}

impl<F> ChunkRenderer for F
where
    F: Fn(&ChunkSpec) -> Result<(), ChunkFailure> + Send + Sync,
{
    fn render_chunk(&self, spec: &ChunkSpec) -> Result<(), ChunkFailure> {
        self(spec)
    }
}

/// Tasks of one render that are queued or running on the pool.
#[derive(Debug, Default)]
struct InFlight {
    tasks: usize,
    cancelled: bool,
}

type InFlightMap = Arc<Mutex<HashMap<RenderId, InFlight>>>;

/// [`InvocationTransport`] running each invocation as a task on a rayon pool.
///
/// Tasks report back through [`report_chunk_outcome`], exactly as a remote worker would, and
/// optionally leave a per-chunk intermediate artifact in `storage`. Only renders with tasks in
/// flight are tracked; cancelling one skips its queued tasks and rejects new invocations until
/// the last of them finishes.
pub struct LocalTransport {
    pool: rayon::ThreadPool,
    store: Arc<dyn RenderStatusStore>,
    clock: Arc<dyn Clock>,
    renderer: Arc<dyn ChunkRenderer>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    in_flight: InFlightMap,
}

impl LocalTransport {
    pub fn new(
        threads: Option<usize>,
        store: Arc<dyn RenderStatusStore>,
        clock: Arc<dyn Clock>,
        renderer: Arc<dyn ChunkRenderer>,
    ) -> OrchestratorResult<Self> {
        Ok(Self {
            pool: build_thread_pool(threads)?,
            store,
            clock,
            renderer,
            storage: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Write an intermediate artifact per rendered chunk into `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Count a new task for `render_id`, unless the render was cancelled.
    fn track(&self, render_id: &RenderId) -> OrchestratorResult<bool> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| OrchestratorError::invocation("in-flight map lock poisoned"))?;
        let entry = map.entry(render_id.clone()).or_default();
        if entry.cancelled {
            return Ok(false);
        }
        entry.tasks += 1;
        Ok(true)
    }

    #[cfg(test)]
    fn tracked_renders(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn is_cancelled(in_flight: &InFlightMap, render_id: &RenderId) -> bool {
    in_flight
        .lock()
        .is_ok_and(|m| m.get(render_id).is_some_and(|f| f.cancelled))
}

/// Drop one task of `render_id`, forgetting the render once none remain.
fn untrack(in_flight: &InFlightMap, render_id: &RenderId) {
    let Ok(mut map) = in_flight.lock() else {
        return;
    };
    if let Some(f) = map.get_mut(render_id) {
        f.tasks = f.tasks.saturating_sub(1);
        if f.tasks == 0 {
            map.remove(render_id);
        }
    }
}

impl InvocationTransport for LocalTransport {
    fn invoke(&self, spec: ChunkSpec) -> OrchestratorResult<InvokeOutcome> {
        if !self.track(&spec.render_id)? {
            return Ok(InvokeOutcome::Rejected {
                reason: format!("render '{}' was cancelled", spec.render_id),
            });
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        let renderer = self.renderer.clone();
        let storage = self.storage.clone();
        let in_flight = self.in_flight.clone();
        self.pool.spawn(move || {
            if is_cancelled(&in_flight, &spec.render_id) {
                untrack(&in_flight, &spec.render_id);
                return;
            }
            let mut outcome = renderer.render_chunk(&spec);
            if outcome.is_ok()
                && let Some(storage) = &storage
                && let Err(e) = storage.put(&chunk_artifact_key(&spec.render_id, spec.chunk))
            {
                outcome = Err(ChunkFailure::retryable(format!(
                    "could not store chunk output: {e}"
                )));
            }
            if let Err(e) = report_chunk_outcome(store.as_ref(), clock.as_ref(), &spec, outcome) {
                tracing::error!(render = %spec.render_id, chunk = %spec.chunk, error = %e, "failed to report chunk outcome");
            }
            untrack(&in_flight, &spec.render_id);
        });
        Ok(InvokeOutcome::Accepted)
    }

    /// Skips queued tasks of `render_id`. Renders with nothing in flight are not tracked.
    fn cancel(&self, render_id: &RenderId) {
        if let Ok(mut map) = self.in_flight.lock()
            && let Some(f) = map.get_mut(render_id)
        {
            f.cancelled = true;
        }
    }
}

fn build_thread_pool(threads: Option<usize>) -> OrchestratorResult<rayon::ThreadPool> {
    if let Some(n) = threads
        && n == 0
    {
        return Err(OrchestratorError::validation(
            "local transport 'worker_threads' must be >= 1 when set",
        ));
    }

    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("chunk-worker-{i}"));
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder.build().map_err(|e| {
        OrchestratorError::Other(anyhow::anyhow!("failed to build rayon thread pool: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::clock::ManualClock;
    use crate::foundation::core::{ChunkIndex, FrameIndex, FrameRange};
    use crate::model::metadata::{Codec, RenderMetadata, VideoConfig};
    use crate::model::progress::{ProgressUpdate, RenderProgress};
    use crate::stages::cleanup::InMemoryArtifactStorage;
    use crate::store::memory::InMemoryStatusStore;
    use std::time::{Duration, Instant};

    fn spec(id: &RenderId, chunk: u32) -> ChunkSpec {
        ChunkSpec {
            render_id: id.clone(),
            chunk: ChunkIndex(chunk),
            frame_range: FrameRange::new(FrameIndex(0), FrameIndex(1)).unwrap(),
            attempt: 1,
            retries_left: 0,
            codec: Codec::H264,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn zero_threads_is_rejected() {
        let store: Arc<dyn RenderStatusStore> = Arc::new(InMemoryStatusStore::new());
        let renderer = |_: &ChunkSpec| -> Result<(), ChunkFailure> { Ok(()) };
        let res = LocalTransport::new(
            Some(0),
            store,
            Arc::new(ManualClock::new(0)),
            Arc::new(renderer),
        );
        assert!(matches!(res, Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn chunks_report_into_store_and_storage() {
        let store = Arc::new(InMemoryStatusStore::new());
        let storage = Arc::new(InMemoryArtifactStorage::new());
        let id = RenderId::new("local").unwrap();
        let (meta, _) = RenderMetadata::plan(
            VideoConfig {
                duration_in_frames: 3,
                fps: 30,
                width: 8,
                height: 8,
            },
            1,
            Codec::H264,
            None,
            0,
        )
        .unwrap();
        store.create(RenderProgress::new(id.clone(), 0)).unwrap();
        store
            .apply(&id, &ProgressUpdate::MetadataSet { metadata: meta }, 0)
            .unwrap();

        let renderer = |s: &ChunkSpec| {
            if s.chunk.0 == 2 {
                Err(ChunkFailure::fatal("bad frame"))
            } else {
                Ok(())
            }
        };
        let transport = LocalTransport::new(
            Some(2),
            store.clone(),
            Arc::new(ManualClock::new(1)),
            Arc::new(renderer),
        )
        .unwrap()
        .with_storage(storage.clone());

        for c in 0..2 {
            assert_eq!(transport.invoke(spec(&id, c)).unwrap(), InvokeOutcome::Accepted);
        }
        wait_for(|| store.read(&id).unwrap().chunks() == 2);
        transport.invoke(spec(&id, 2)).unwrap();
        wait_for(|| store.read(&id).unwrap().fatal_error_encountered());
        assert_eq!(storage.len(), 2);
        assert!(storage.contains(&chunk_artifact_key(&id, ChunkIndex(0))));
    }

    #[test]
    fn cancel_rejects_new_work_until_in_flight_tasks_finish() {
        let store: Arc<dyn RenderStatusStore> = Arc::new(InMemoryStatusStore::new());
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let renderer = move |_: &ChunkSpec| -> Result<(), ChunkFailure> {
            let _ = gate.lock().unwrap().recv();
            Ok(())
        };
        let transport = LocalTransport::new(
            Some(1),
            store,
            Arc::new(ManualClock::new(0)),
            Arc::new(renderer),
        )
        .unwrap();
        let id = RenderId::new("gone").unwrap();

        assert_eq!(transport.invoke(spec(&id, 0)).unwrap(), InvokeOutcome::Accepted);
        assert_eq!(transport.invoke(spec(&id, 1)).unwrap(), InvokeOutcome::Accepted);
        transport.cancel(&id);
        assert!(matches!(
            transport.invoke(spec(&id, 2)).unwrap(),
            InvokeOutcome::Rejected { .. }
        ));

        release.send(()).unwrap();
        release.send(()).unwrap();
        wait_for(|| transport.tracked_renders() == 0);

        // Nothing is remembered once the render has no tasks left.
        transport.cancel(&id);
        assert_eq!(transport.tracked_renders(), 0);
    }
}
