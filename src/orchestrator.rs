use crate::aggregate::{MultiRenderProgress, make_multi_progress};
use crate::foundation::clock::Clock;
use crate::foundation::core::{ChunkPlan, RenderId};
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::errors::{EnhancedErrorInfo, ErrorSource, format_errors};
use crate::model::metadata::{Codec, RenderMetadata, VideoConfig};
use crate::model::progress::{ProgressUpdate, RenderProgress};
use crate::stages::StageCtx;
use crate::stages::cleanup::{ArtifactStorage, CleanupStage};
use crate::stages::dispatch::ChunkDispatchStage;
use crate::stages::encoding::{EncodingStage, Stitcher};
use crate::state::RenderState;
use crate::store::RenderStatusStore;
use crate::transport::InvocationTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables of a [`RenderOrchestrator`]. Every field has a default, so partial JSON is accepted.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorOpts {
    /// Reissues allowed per chunk after its first attempt.
    pub retry_budget: u32,
    /// Reruns allowed of the preparation step after transient failures.
    pub preparation_retry_budget: u32,
    pub frames_per_chunk: u64,
    pub poll_interval_ms: u64,
    /// Upper bound for [`RenderHandle::wait`].
    pub max_wait_ms: u64,
    /// Thread count of the local transport pool; `None` uses rayon's default.
    pub worker_threads: Option<usize>,
    /// Cap on stored errors; `None` keeps every error.
    pub max_errors_retained: Option<usize>,
    /// Attempts per intermediate artifact deletion before it is abandoned.
    pub cleanup_delete_attempts: u32,
}

impl Default for OrchestratorOpts {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            preparation_retry_budget: 2,
            frames_per_chunk: 20,
            poll_interval_ms: 250,
            max_wait_ms: 15 * 60 * 1000,
            worker_threads: None,
            max_errors_retained: None,
            cleanup_delete_attempts: 2,
        }
    }
}

impl OrchestratorOpts {
    pub fn from_json_str(json: &str) -> OrchestratorResult<Self> {
        let opts: Self = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.frames_per_chunk == 0 {
            return Err(OrchestratorError::validation("framesPerChunk must be >= 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(OrchestratorError::validation("pollIntervalMs must be >= 1"));
        }
        if self.worker_threads == Some(0) {
            return Err(OrchestratorError::validation(
                "workerThreads must be >= 1 when set",
            ));
        }
        if self.cleanup_delete_attempts == 0 {
            return Err(OrchestratorError::validation(
                "cleanupDeleteAttempts must be >= 1",
            ));
        }
        Ok(())
    }
}

/// What to render.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub video_config: VideoConfig,
    pub codec: Codec,
    /// Name of the final artifact the caller will download; `None` when no download is expected.
    pub out_name: Option<String>,
    /// Caller-chosen id; generated when `None`.
    pub render_id: Option<RenderId>,
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RenderStatusStore>,
    pub transport: Arc<dyn InvocationTransport>,
    pub stitcher: Arc<dyn Stitcher>,
    pub storage: Arc<dyn ArtifactStorage>,
    pub clock: Arc<dyn Clock>,
}

/// Accepts render requests and hands out [`RenderHandle`]s that drive them to completion.
pub struct RenderOrchestrator {
    opts: OrchestratorOpts,
    collab: Collaborators,
}

impl RenderOrchestrator {
    pub fn new(opts: OrchestratorOpts, collab: Collaborators) -> OrchestratorResult<Self> {
        opts.validate()?;
        Ok(Self { opts, collab })
    }

    pub fn opts(&self) -> &OrchestratorOpts {
        &self.opts
    }

    /// Create the render record, prepare it and invoke the first attempt of every chunk.
    ///
    /// Transient preparation failures are recorded and the preparation step is rerun up to
    /// `preparation_retry_budget` times. Anything else fails the render and is returned.
    #[tracing::instrument(skip_all, fields(frames = request.video_config.duration_in_frames))]
    pub fn start(&self, request: RenderRequest) -> OrchestratorResult<RenderHandle> {
        let render_id = request.render_id.clone().unwrap_or_else(RenderId::generate);
        let ctx = StageCtx::new(
            render_id.clone(),
            self.collab.store.clone(),
            self.collab.clock.clone(),
        );

        self.create_record(&render_id)?;
        tracing::info!(render = %render_id, "render accepted");

        let plan = self.prepare(&ctx, &request)?;
        let dispatch = ChunkDispatchStage::new(
            ctx.clone(),
            self.collab.transport.clone(),
            plan,
            request.codec,
            self.opts.retry_budget,
        );
        dispatch.dispatch_all()?;

        Ok(RenderHandle {
            opts: self.opts.clone(),
            collab: self.collab.clone(),
            dispatch,
            encoding: EncodingStage::new(ctx.clone()),
            cleanup: CleanupStage::new(ctx.clone(), self.opts.cleanup_delete_attempts),
            last_state: RenderState::Pending,
            ctx,
        })
    }

    fn create_record(&self, render_id: &RenderId) -> OrchestratorResult<()> {
        let mut attempt = 1;
        loop {
            let record = RenderProgress::new(render_id.clone(), self.collab.clock.now_ms())
                .with_error_cap(self.opts.max_errors_retained);
            match self.collab.store.create(record) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt <= self.opts.preparation_retry_budget => {
                    tracing::warn!(render = %render_id, attempt, error = %e, "creating render record failed; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prepare(&self, ctx: &StageCtx, request: &RenderRequest) -> OrchestratorResult<ChunkPlan> {
        let mut attempt = 1;
        loop {
            let res = RenderMetadata::plan(
                request.video_config.clone(),
                self.opts.frames_per_chunk,
                request.codec,
                request.out_name.clone(),
                ctx.clock.now_ms(),
            )
            .and_then(|(metadata, plan)| {
                ctx.apply(ProgressUpdate::MetadataSet { metadata })?;
                Ok(plan)
            });

            let err = match res {
                Ok(plan) => {
                    tracing::info!(render = %ctx.render_id, chunks = plan.total_chunks(), "render prepared");
                    return Ok(plan);
                }
                Err(e) => e,
            };

            let will_retry = err.is_transient() && attempt <= self.opts.preparation_retry_budget;
            ctx.apply(ProgressUpdate::ErrorRecorded {
                error: EnhancedErrorInfo {
                    message: err.to_string(),
                    stack: err.detail(),
                    chunk: None,
                    attempt,
                    will_retry,
                    source: ErrorSource::Preparation,
                    time_ms: ctx.clock.now_ms(),
                },
            })?;
            if !will_retry {
                tracing::error!(render = %ctx.render_id, attempt, error = %err, "render preparation failed");
                return Err(OrchestratorError::render_failed(format!(
                    "preparation failed: {err}"
                )));
            }
            tracing::warn!(render = %ctx.render_id, attempt, error = %err, "render preparation failed; retrying");
            attempt += 1;
        }
    }
}

/// Drives one accepted render by polling its shared record.
pub struct RenderHandle {
    opts: OrchestratorOpts,
    collab: Collaborators,
    ctx: StageCtx,
    dispatch: ChunkDispatchStage,
    encoding: EncodingStage,
    cleanup: CleanupStage,
    last_state: RenderState,
}

impl RenderHandle {
    pub fn render_id(&self) -> &RenderId {
        &self.ctx.render_id
    }

    /// Current snapshot without advancing any stage.
    pub fn snapshot(&self) -> OrchestratorResult<MultiRenderProgress> {
        Ok(make_multi_progress(&self.ctx.read()?))
    }

    /// Reconcile retries, start every stage whose prerequisites are done and return a snapshot.
    pub fn poll(&mut self) -> OrchestratorResult<MultiRenderProgress> {
        let mut progress = self.ctx.read()?;

        if !progress.is_terminal() && self.dispatch.reconcile(&progress)? > 0 {
            progress = self.ctx.read()?;
        }

        let state = RenderState::from_progress(&progress);
        if state == RenderState::Encoding {
            match self.encoding.run(self.collab.stitcher.as_ref()) {
                Ok(_) | Err(OrchestratorError::RenderFailed(_)) => {}
                Err(e) => return Err(e),
            }
            progress = self.ctx.read()?;
        }

        if RenderState::from_progress(&progress) == RenderState::Cleanup {
            self.cleanup.run(self.collab.storage.as_ref())?;
            progress = self.ctx.read()?;
        }

        self.observe(RenderState::from_progress(&progress));
        Ok(make_multi_progress(&progress))
    }

    fn observe(&mut self, state: RenderState) {
        for next in self.last_state.path_to(state) {
            match next {
                RenderState::Failed => {
                    tracing::error!(render = %self.ctx.render_id, state = %next, "render state changed")
                }
                _ => tracing::info!(render = %self.ctx.render_id, state = %next, "render state changed"),
            }
        }
        self.last_state = state;
    }

    /// Poll until the render succeeds (download ready or downloaded), fails, is cancelled or
    /// `max_wait_ms` elapses. Transient polling errors are logged and polled through.
    #[tracing::instrument(skip(self), fields(render = %self.ctx.render_id))]
    pub fn wait(&mut self) -> OrchestratorResult<MultiRenderProgress> {
        let deadline = Instant::now() + Duration::from_millis(self.opts.max_wait_ms);
        loop {
            let snapshot = match self.poll() {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "poll failed; retrying");
                    if Instant::now() >= deadline {
                        return Err(OrchestratorError::timeout(format!(
                            "render '{}' still {} after {} ms",
                            self.ctx.render_id, self.last_state, self.opts.max_wait_ms
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(self.opts.poll_interval_ms));
                    continue;
                }
                Err(e) => return Err(e),
            };
            match snapshot.state {
                RenderState::Failed => {
                    let fatal: Vec<_> = snapshot
                        .errors
                        .iter()
                        .filter(|e| e.is_fatal())
                        .cloned()
                        .collect();
                    let detail = format_errors(&fatal).join("; ");
                    return Err(OrchestratorError::render_failed(detail));
                }
                RenderState::Abandoned => {
                    return Err(OrchestratorError::render_failed("render was cancelled"));
                }
                s if s.is_success() => return Ok(snapshot),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::timeout(format!(
                    "render '{}' still {} after {} ms",
                    self.ctx.render_id, snapshot.state, self.opts.max_wait_ms
                )));
            }
            std::thread::sleep(Duration::from_millis(self.opts.poll_interval_ms));
        }
    }

    /// Abandon the render. In-flight workers are notified best-effort. A render that already
    /// finished, failed or was cancelled is left as it is.
    pub fn cancel(&mut self) -> OrchestratorResult<()> {
        if self.ctx.apply(ProgressUpdate::Cancelled)? {
            tracing::info!(render = %self.ctx.render_id, "render cancelled");
            self.collab.transport.cancel(&self.ctx.render_id);
        }
        self.observe(RenderState::from_progress(&self.ctx.read()?));
        Ok(())
    }

    /// Record that the caller fetched the final artifact.
    pub fn confirm_download(&mut self) -> OrchestratorResult<()> {
        self.ctx.apply(ProgressUpdate::Downloaded)?;
        self.observe(RenderState::from_progress(&self.ctx.read()?));
        Ok(())
    }

    /// Remove the record from the store once the render is terminal and return it.
    pub fn archive(self) -> OrchestratorResult<RenderProgress> {
        let state = RenderState::from_progress(&self.ctx.read()?);
        if !state.is_terminal() {
            return Err(OrchestratorError::precondition(format!(
                "render '{}' cannot be archived while {state}",
                self.ctx.render_id
            )));
        }
        self.collab
            .store
            .remove(&self.ctx.render_id)?
            .ok_or_else(|| {
                OrchestratorError::store(format!("render '{}' vanished", self.ctx.render_id))
            })
    }
}
