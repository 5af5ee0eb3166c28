use crate::foundation::core::RenderId;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::errors::{EnhancedErrorInfo, ErrorSource};
use crate::model::metadata::Codec;
use crate::model::progress::{OutputArtifact, ProgressUpdate, RenderProgress};
use crate::stages::{StageCtx, StageProgress};

/// Input handed to a [`Stitcher`] once every chunk is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchJob {
    pub render_id: RenderId,
    pub total_chunks: u32,
    pub total_frames: u64,
    pub codec: Codec,
    pub out_name: Option<String>,
}

/// Backend that concatenates rendered chunks into the final media.
///
/// `on_frames` must be called with the cumulative number of frames encoded so far.
pub trait Stitcher: Send + Sync {
    fn stitch(
        &self,
        job: &StitchJob,
        on_frames: &mut dyn FnMut(u64) -> OrchestratorResult<()>,
    ) -> OrchestratorResult<OutputArtifact>;
}

/// Tracks the stitching stage of one render.
pub struct EncodingStage {
    ctx: StageCtx,
}

impl EncodingStage {
    pub fn new(ctx: StageCtx) -> Self {
        Self { ctx }
    }

    /// Mark encoding as started. Fails with a precondition error before all chunks are rendered.
    pub fn begin(&self) -> OrchestratorResult<bool> {
        self.ctx.apply(ProgressUpdate::EncodingStarted)
    }

    pub fn report_frames(&self, frames: u64) -> OrchestratorResult<bool> {
        self.ctx.apply(ProgressUpdate::FramesEncoded { frames })
    }

    pub fn finish(&self, output: OutputArtifact) -> OrchestratorResult<bool> {
        self.ctx.apply(ProgressUpdate::EncodingFinished { output })
    }

    /// Run `stitcher` to completion, recording progress. A stitcher failure is fatal to the
    /// render and is returned after being recorded.
    #[tracing::instrument(skip(self, stitcher), fields(render = %self.ctx.render_id))]
    pub fn run(&self, stitcher: &dyn Stitcher) -> OrchestratorResult<OutputArtifact> {
        let progress = self.ctx.read()?;
        let meta = progress.metadata().ok_or_else(|| {
            OrchestratorError::precondition("encoding requires render metadata")
        })?;
        let job = StitchJob {
            render_id: self.ctx.render_id.clone(),
            total_chunks: meta.total_chunks,
            total_frames: meta.video_config.duration_in_frames,
            codec: meta.codec,
            out_name: meta.out_name.clone(),
        };

        self.begin()?;
        tracing::info!(frames = job.total_frames, "encoding started");

        let mut on_frames = |frames: u64| self.report_frames(frames).map(|_| ());
        match stitcher.stitch(&job, &mut on_frames) {
            Ok(output) => {
                self.finish(output.clone())?;
                tracing::info!(key = %output.key, "encoding finished");
                Ok(output)
            }
            Err(e) => {
                tracing::error!(error = %e, "encoding failed");
                self.ctx.apply(ProgressUpdate::ErrorRecorded {
                    error: EnhancedErrorInfo {
                        message: format!("stitching failed: {e}"),
                        stack: e.detail(),
                        chunk: None,
                        attempt: 1,
                        will_retry: false,
                        source: ErrorSource::Encoder,
                        time_ms: self.ctx.clock.now_ms(),
                    },
                })?;
                Err(OrchestratorError::render_failed(format!("encoding failed: {e}")))
            }
        }
    }
}

/// Frames encoded over the composition duration. The total falls back to 1 while unknown so the
/// stage renders as an empty bar rather than dividing by zero.
pub fn encoding_progress(progress: &RenderProgress) -> StageProgress {
    let total = progress
        .metadata()
        .map(|m| m.video_config.duration_in_frames)
        .unwrap_or(1);
    let status = progress.encoding_status();
    StageProgress {
        completed: status.map(|s| s.frames_encoded).unwrap_or(0),
        total: Some(total),
        done_in: status.and_then(|s| s.done_in),
    }
}

/// Cold-start latency of the stitcher: chunk completion to first frame report.
pub fn time_to_invoke(progress: &RenderProgress) -> Option<u64> {
    progress.encoding_status().and_then(|s| s.time_to_invoke)
}

/// In-process [`Stitcher`] that reports frames in fixed steps and names the output after the
/// render.
#[derive(Debug, Clone)]
pub struct InMemoryStitcher {
    frames_per_report: u64,
    fail_with: Option<String>,
}

impl InMemoryStitcher {
    pub fn new(frames_per_report: u64) -> Self {
        Self {
            frames_per_report: frames_per_report.max(1),
            fail_with: None,
        }
    }

    /// Make every stitch fail with `message` after the first report.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            frames_per_report: 1,
            fail_with: Some(message.into()),
        }
    }
}

impl Default for InMemoryStitcher {
    fn default() -> Self {
        Self::new(30)
    }
}

impl Stitcher for InMemoryStitcher {
    fn stitch(
        &self,
        job: &StitchJob,
        on_frames: &mut dyn FnMut(u64) -> OrchestratorResult<()>,
    ) -> OrchestratorResult<OutputArtifact> {
        let mut done = 0u64;
        while done < job.total_frames {
            done = (done + self.frames_per_report).min(job.total_frames);
            on_frames(done)?;
            if let Some(msg) = &self.fail_with {
                return Err(OrchestratorError::Other(anyhow::anyhow!("{msg}")));
            }
        }
        let name = job
            .out_name
            .clone()
            .unwrap_or_else(|| format!("out.{}", job.codec.extension()));
        Ok(OutputArtifact {
            key: format!("renders/{}/{name}", job.render_id),
            size_bytes: done,
        })
    }
}
