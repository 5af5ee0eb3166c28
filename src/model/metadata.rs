use crate::foundation::core::ChunkPlan;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};

/// Output codec requested for the final artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Prores,
    Gif,
}

impl Codec {
    /// File extension of the stitched output.
    pub fn extension(self) -> &'static str {
        match self {
            Self::H264 | Self::H265 => "mp4",
            Self::Vp8 | Self::Vp9 => "webm",
            Self::Prores => "mov",
            Self::Gif => "gif",
        }
    }
}

/// Timeline and canvas parameters of the composition being rendered.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    pub duration_in_frames: u64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.duration_in_frames == 0 {
            return Err(OrchestratorError::validation(
                "durationInFrames must be > 0",
            ));
        }
        if self.fps == 0 {
            return Err(OrchestratorError::validation("fps must be > 0"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(OrchestratorError::validation(
                "width/height must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Immutable per-render parameters, written once when the render request is accepted.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetadata {
    pub total_chunks: u32,
    /// Expected number of worker invocations, not counting retries.
    pub estimated_render_lambda_invocations: u32,
    pub frames_per_chunk: u64,
    pub video_config: VideoConfig,
    pub codec: Codec,
    /// Output name requested by the caller; `None` means no download is expected.
    pub out_name: Option<String>,
    pub start_ms: u64,
}

impl RenderMetadata {
    /// Derive metadata from a validated video config and chunk size.
    pub fn plan(
        video_config: VideoConfig,
        frames_per_chunk: u64,
        codec: Codec,
        out_name: Option<String>,
        start_ms: u64,
    ) -> OrchestratorResult<(Self, ChunkPlan)> {
        video_config.validate()?;
        let plan = ChunkPlan::new(video_config.duration_in_frames, frames_per_chunk)?;
        let meta = Self {
            total_chunks: plan.total_chunks(),
            estimated_render_lambda_invocations: plan.total_chunks(),
            frames_per_chunk,
            video_config,
            codec,
            out_name,
            start_ms,
        };
        Ok((meta, plan))
    }

    /// Rebuild the chunk plan this metadata was derived from.
    pub fn chunk_plan(&self) -> OrchestratorResult<ChunkPlan> {
        ChunkPlan::new(self.video_config.duration_in_frames, self.frames_per_chunk)
    }
}
