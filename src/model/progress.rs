use crate::foundation::core::{ChunkIndex, RenderId};
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::errors::{EnhancedErrorInfo, ErrorCollector};
use crate::model::metadata::RenderMetadata;
use crate::model::retry::{ChunkRetry, RetryTracker};
use crate::stages::StageKind;
use std::collections::BTreeSet;

/// One attempt of one chunk.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ChunkAttempt {
    pub chunk: ChunkIndex,
    pub attempt: u32,
}

/// Final muxed artifact produced by the stitcher.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputArtifact {
    pub key: String,
    pub size_bytes: u64,
}

/// Encoding (stitching) status, present once the stage has begun.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingStatus {
    pub frames_encoded: u64,
    pub started_ms: u64,
    /// Time between chunk completion and the first frame report from the stitcher.
    pub time_to_invoke: Option<u64>,
    pub done_in: Option<u64>,
    pub output: Option<OutputArtifact>,
}

/// Cleanup status, present once intermediate artifacts were scheduled for deletion.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupInfo {
    pub started_ms: u64,
    pub done_in: Option<u64>,
    scheduled: BTreeSet<String>,
    deleted: BTreeSet<String>,
    /// Artifacts whose deletion failed and was given up on.
    abandoned: BTreeSet<String>,
}

impl CleanupInfo {
    pub fn files_to_delete(&self) -> u32 {
        self.scheduled.len() as u32
    }

    pub fn files_deleted(&self) -> u32 {
        self.deleted.len() as u32
    }

    /// Deletions that must still be confirmed for the stage to finish without abandoning anything.
    pub fn min_files_to_delete(&self) -> u32 {
        let given_up = self.abandoned.difference(&self.deleted).count();
        (self.scheduled.len() - given_up) as u32
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.scheduled.contains(key)
    }

    /// Artifacts neither deleted nor abandoned yet.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.scheduled
            .iter()
            .filter(|k| !self.deleted.contains(*k) && !self.abandoned.contains(*k))
            .map(String::as_str)
    }

    fn settled(&self) -> usize {
        self.deleted.union(&self.abandoned).count()
    }
}

/// A single monotonic mutation of a [`RenderProgress`] record.
///
/// Every update is idempotent: applying it twice leaves the record as applying it once.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProgressUpdate {
    MetadataSet { metadata: RenderMetadata },
    /// The transport accepted attempt `attempt` of `chunk`.
    LambdaInvoked { chunk: ChunkIndex, attempt: u32 },
    ChunkRendered { chunk: ChunkIndex },
    ErrorRecorded { error: EnhancedErrorInfo },
    RetryRecorded { retry: ChunkRetry },
    EncodingStarted,
    FramesEncoded { frames: u64 },
    EncodingFinished { output: OutputArtifact },
    CleanupScheduled { artifacts: Vec<String> },
    ArtifactDeleted { key: String },
    ArtifactAbandoned { key: String },
    Downloaded,
    Cancelled,
}

/// The shared record of one render, written by the orchestrator and every worker.
///
/// Counts only grow and every `done_in` moves from `None` to a value once. Once the render is
/// terminal (fatal error, cancelled, cleanup done, downloaded) further updates are ignored, except
/// the download confirmation of a finished render.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgress {
    render_id: RenderId,
    created_ms: u64,
    render_metadata: Option<RenderMetadata>,
    lambdas_invoked: BTreeSet<ChunkIndex>,
    chunks_rendered: BTreeSet<ChunkIndex>,
    #[serde(default)]
    attempts_issued: BTreeSet<ChunkAttempt>,
    /// Chunk attempts that failed retryably. Kept regardless of the error cap.
    #[serde(default)]
    retryable_failures: BTreeSet<ChunkAttempt>,
    first_invoked_ms: Option<u64>,
    time_to_invoke_lambdas: Option<u64>,
    chunks_finished_ms: Option<u64>,
    time_to_finish_chunks: Option<u64>,
    encoding_status: Option<EncodingStatus>,
    cleanup: Option<CleanupInfo>,
    errors: ErrorCollector,
    retries_info: RetryTracker,
    fatal_error_encountered: bool,
    cancelled: bool,
    downloaded: bool,
    max_errors_retained: Option<usize>,
}

impl RenderProgress {
    pub fn new(render_id: RenderId, created_ms: u64) -> Self {
        Self {
            render_id,
            created_ms,
            render_metadata: None,
            lambdas_invoked: BTreeSet::new(),
            chunks_rendered: BTreeSet::new(),
            attempts_issued: BTreeSet::new(),
            retryable_failures: BTreeSet::new(),
            first_invoked_ms: None,
            time_to_invoke_lambdas: None,
            chunks_finished_ms: None,
            time_to_finish_chunks: None,
            encoding_status: None,
            cleanup: None,
            errors: ErrorCollector::new(),
            retries_info: RetryTracker::new(),
            fatal_error_encountered: false,
            cancelled: false,
            downloaded: false,
            max_errors_retained: None,
        }
    }

    /// Cap the number of retained errors; see [`ErrorCollector::record`].
    pub fn with_error_cap(mut self, cap: Option<usize>) -> Self {
        self.max_errors_retained = cap;
        self
    }

    pub fn render_id(&self) -> &RenderId {
        &self.render_id
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn metadata(&self) -> Option<&RenderMetadata> {
        self.render_metadata.as_ref()
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.render_metadata.as_ref().map(|m| m.total_chunks)
    }

    pub fn lambdas_invoked(&self) -> u32 {
        self.lambdas_invoked.len() as u32
    }

    pub fn chunks(&self) -> u32 {
        self.chunks_rendered.len() as u32
    }

    pub fn is_chunk_rendered(&self, chunk: ChunkIndex) -> bool {
        self.chunks_rendered.contains(&chunk)
    }

    pub fn is_attempt_issued(&self, chunk: ChunkIndex, attempt: u32) -> bool {
        self.attempts_issued.contains(&ChunkAttempt { chunk, attempt })
    }

    pub fn retryable_failures(&self) -> impl Iterator<Item = ChunkAttempt> + '_ {
        self.retryable_failures.iter().copied()
    }

    pub fn is_retryable_failure(&self, chunk: ChunkIndex, attempt: u32) -> bool {
        self.retryable_failures
            .contains(&ChunkAttempt { chunk, attempt })
    }

    pub fn time_to_invoke_lambdas(&self) -> Option<u64> {
        self.time_to_invoke_lambdas
    }

    pub fn time_to_finish_chunks(&self) -> Option<u64> {
        self.time_to_finish_chunks
    }

    pub fn encoding_status(&self) -> Option<&EncodingStatus> {
        self.encoding_status.as_ref()
    }

    pub fn cleanup(&self) -> Option<&CleanupInfo> {
        self.cleanup.as_ref()
    }

    pub fn errors(&self) -> &ErrorCollector {
        &self.errors
    }

    pub fn retries(&self) -> &RetryTracker {
        &self.retries_info
    }

    pub fn fatal_error_encountered(&self) -> bool {
        self.fatal_error_encountered
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }

    /// Failed, cancelled, or finished. A finished render (cleanup done) only accepts
    /// [`ProgressUpdate::Downloaded`] afterwards.
    pub fn is_terminal(&self) -> bool {
        self.fatal_error_encountered
            || self.cancelled
            || self.downloaded
            || self.is_stage_done(StageKind::Cleanup)
    }

    fn accepts(&self, update: &ProgressUpdate) -> bool {
        match update {
            ProgressUpdate::Downloaded => {
                !self.fatal_error_encountered && !self.cancelled && !self.downloaded
            }
            _ => !self.is_terminal(),
        }
    }

    /// A stage is done once its completion time is recorded, regardless of its counts.
    pub fn is_stage_done(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Invoke => self.time_to_invoke_lambdas.is_some(),
            StageKind::Chunks => self.time_to_finish_chunks.is_some(),
            StageKind::Encoding => self
                .encoding_status
                .as_ref()
                .is_some_and(|e| e.done_in.is_some()),
            StageKind::Cleanup => self.cleanup.as_ref().is_some_and(|c| c.done_in.is_some()),
            StageKind::Download => self.downloaded,
        }
    }

    fn require_prerequisites(&self, stage: StageKind) -> OrchestratorResult<()> {
        for &pre in stage.prerequisites() {
            if !self.is_stage_done(pre) {
                return Err(OrchestratorError::precondition(format!(
                    "{stage:?} cannot start before {pre:?} is done"
                )));
            }
        }
        Ok(())
    }

    fn require_chunk(&self, chunk: ChunkIndex) -> OrchestratorResult<()> {
        let Some(total) = self.total_chunks() else {
            return Err(OrchestratorError::precondition(
                "chunk updates require render metadata",
            ));
        };
        if chunk.0 >= total {
            return Err(OrchestratorError::validation(format!(
                "chunk {chunk} out of range (render has {total} chunks)"
            )));
        }
        Ok(())
    }

    /// Apply one update at time `now_ms`. Returns whether the record changed.
    pub fn apply(&mut self, update: &ProgressUpdate, now_ms: u64) -> OrchestratorResult<bool> {
        if !self.accepts(update) {
            tracing::debug!(render = %self.render_id, ?update, "ignoring update on terminal render");
            return Ok(false);
        }

        let changed = match update {
            ProgressUpdate::MetadataSet { metadata } => match &self.render_metadata {
                Some(existing) if existing == metadata => false,
                Some(_) => {
                    return Err(OrchestratorError::validation(
                        "render metadata is immutable once set",
                    ));
                }
                None => {
                    self.render_metadata = Some(metadata.clone());
                    true
                }
            },
            ProgressUpdate::LambdaInvoked { chunk, attempt } => {
                self.require_chunk(*chunk)?;
                if *attempt == 0 {
                    return Err(OrchestratorError::validation(
                        "chunk attempt numbers start at 1",
                    ));
                }
                self.first_invoked_ms.get_or_insert(now_ms);
                let invoked = self.lambdas_invoked.insert(*chunk);
                let issued = self.attempts_issued.insert(ChunkAttempt {
                    chunk: *chunk,
                    attempt: *attempt,
                });
                invoked || issued
            }
            ProgressUpdate::ChunkRendered { chunk } => {
                self.require_chunk(*chunk)?;
                // The invocation write may arrive after the worker's own report.
                self.first_invoked_ms.get_or_insert(now_ms);
                let invoked = self.lambdas_invoked.insert(*chunk);
                self.chunks_rendered.insert(*chunk) || invoked
            }
            ProgressUpdate::ErrorRecorded { error } => {
                if let Some(chunk) = error.chunk {
                    self.require_chunk(chunk)?;
                }
                let mut changed = self.errors.record(error.clone(), self.max_errors_retained);
                if let Some(chunk) = error.chunk
                    && error.triggers_chunk_retry()
                {
                    changed |= self.retryable_failures.insert(ChunkAttempt {
                        chunk,
                        attempt: error.attempt,
                    });
                }
                if changed && error.is_fatal() {
                    self.fatal_error_encountered = true;
                }
                changed
            }
            ProgressUpdate::RetryRecorded { retry } => {
                self.require_chunk(retry.chunk)?;
                self.retries_info.record(retry.clone())?
            }
            ProgressUpdate::EncodingStarted => {
                self.require_prerequisites(StageKind::Encoding)?;
                if self.encoding_status.is_some() {
                    false
                } else {
                    self.encoding_status = Some(EncodingStatus {
                        frames_encoded: 0,
                        started_ms: now_ms,
                        time_to_invoke: None,
                        done_in: None,
                        output: None,
                    });
                    true
                }
            }
            ProgressUpdate::FramesEncoded { frames } => {
                let chunks_finished = self.chunks_finished_ms.unwrap_or(now_ms);
                let enc = self.encoding_status.as_mut().ok_or_else(|| {
                    OrchestratorError::precondition("frames reported before encoding started")
                })?;
                let mut changed = false;
                if enc.time_to_invoke.is_none() {
                    enc.time_to_invoke = Some(now_ms.saturating_sub(chunks_finished));
                    changed = true;
                }
                if *frames > enc.frames_encoded {
                    enc.frames_encoded = *frames;
                    changed = true;
                }
                changed
            }
            ProgressUpdate::EncodingFinished { output } => {
                let total_frames = self
                    .render_metadata
                    .as_ref()
                    .map(|m| m.video_config.duration_in_frames)
                    .unwrap_or(0);
                let enc = self.encoding_status.as_mut().ok_or_else(|| {
                    OrchestratorError::precondition("encoding finished before it started")
                })?;
                if enc.done_in.is_some() {
                    false
                } else {
                    enc.done_in = Some(now_ms.saturating_sub(enc.started_ms));
                    enc.frames_encoded = enc.frames_encoded.max(total_frames);
                    enc.output = Some(output.clone());
                    true
                }
            }
            ProgressUpdate::CleanupScheduled { artifacts } => {
                self.require_prerequisites(StageKind::Cleanup)?;
                if self.cleanup.is_some() {
                    false
                } else {
                    self.cleanup = Some(CleanupInfo {
                        started_ms: now_ms,
                        done_in: None,
                        scheduled: artifacts.iter().cloned().collect(),
                        deleted: BTreeSet::new(),
                        abandoned: BTreeSet::new(),
                    });
                    true
                }
            }
            ProgressUpdate::ArtifactDeleted { key } => {
                let cleanup = self.scheduled_cleanup(key)?;
                cleanup.deleted.insert(key.clone())
            }
            ProgressUpdate::ArtifactAbandoned { key } => {
                let cleanup = self.scheduled_cleanup(key)?;
                cleanup.abandoned.insert(key.clone())
            }
            ProgressUpdate::Downloaded => {
                self.require_prerequisites(StageKind::Download)?;
                if !self.is_stage_done(StageKind::Cleanup) {
                    return Err(OrchestratorError::precondition(
                        "download cannot be confirmed before cleanup is done",
                    ));
                }
                if self
                    .render_metadata
                    .as_ref()
                    .is_none_or(|m| m.out_name.is_none())
                {
                    return Err(OrchestratorError::precondition(
                        "download confirmed for a render without an output name",
                    ));
                }
                self.downloaded = true;
                true
            }
            ProgressUpdate::Cancelled => {
                self.cancelled = true;
                true
            }
        };

        if changed {
            self.settle_milestones(now_ms);
        }
        Ok(changed)
    }

    fn scheduled_cleanup(&mut self, key: &str) -> OrchestratorResult<&mut CleanupInfo> {
        let cleanup = self.cleanup.as_mut().ok_or_else(|| {
            OrchestratorError::precondition("artifact update before cleanup was scheduled")
        })?;
        if !cleanup.is_scheduled(key) {
            return Err(OrchestratorError::validation(format!(
                "artifact '{key}' was not scheduled for deletion"
            )));
        }
        Ok(cleanup)
    }

    /// Record stage completion times that the latest update made reachable.
    fn settle_milestones(&mut self, now_ms: u64) {
        let Some(meta) = self.render_metadata.as_ref() else {
            return;
        };

        if self.time_to_invoke_lambdas.is_none()
            && self.lambdas_invoked.len() as u32 >= meta.estimated_render_lambda_invocations
        {
            self.time_to_invoke_lambdas = Some(now_ms.saturating_sub(self.created_ms));
        }

        if self.time_to_finish_chunks.is_none()
            && self.chunks_rendered.len() as u32 >= meta.total_chunks
        {
            let first = self.first_invoked_ms.unwrap_or(now_ms);
            self.time_to_finish_chunks = Some(now_ms.saturating_sub(first));
            self.chunks_finished_ms = Some(now_ms);
        }

        if let Some(cleanup) = self.cleanup.as_mut()
            && cleanup.done_in.is_none()
            && cleanup.settled() >= cleanup.scheduled.len()
        {
            cleanup.done_in = Some(now_ms.saturating_sub(cleanup.started_ms));
        }
    }
}
