//! Distributed render orchestration.
//!
//! A render is split into chunks, each rendered by an independently invoked worker. Workers and
//! the orchestrator share one [`RenderProgress`] record per render through a
//! [`RenderStatusStore`]; every mutation is a monotonic, idempotent [`ProgressUpdate`]. The
//! orchestrator polls that record, reissues failed chunks, runs encoding and cleanup once their
//! prerequisites are done, and derives a [`MultiRenderProgress`] snapshot for presentation.
#![forbid(unsafe_code)]

pub mod aggregate;
mod foundation;
pub mod model;
pub mod orchestrator;
pub mod stages;
pub mod state;
pub mod store;
pub mod transport;

pub use aggregate::{
    CleanupProgress, DownloadProgress, EncodingProgress, InvokeProgress, MultiRenderProgress,
    make_multi_progress,
};
pub use foundation::clock::{Clock, ManualClock, SystemClock};
pub use foundation::core::{ChunkIndex, ChunkPlan, FrameIndex, FrameRange, RenderId};
pub use foundation::error::{OrchestratorError, OrchestratorResult};
pub use model::errors::{ERROR_PREVIEW_CHARS, EnhancedErrorInfo, ErrorSource, format_errors};
pub use model::metadata::{Codec, RenderMetadata, VideoConfig};
pub use model::progress::{
    ChunkAttempt, CleanupInfo, EncodingStatus, OutputArtifact, ProgressUpdate, RenderProgress,
};
pub use model::retry::{ChunkRetry, RetryTracker};
pub use orchestrator::{
    Collaborators, OrchestratorOpts, RenderHandle, RenderOrchestrator, RenderRequest,
};
pub use stages::cleanup::{ArtifactStorage, InMemoryArtifactStorage, chunk_artifact_key};
pub use stages::encoding::{InMemoryStitcher, StitchJob, Stitcher};
pub use stages::{StageKind, StageProgress};
pub use state::RenderState;
pub use store::RenderStatusStore;
pub use store::json_file::JsonFileStore;
pub use store::memory::InMemoryStatusStore;
pub use transport::local::{ChunkRenderer, LocalTransport};
pub use transport::worker::{ChunkFailure, report_chunk_outcome};
pub use transport::{ChunkSpec, InvocationTransport, InvokeOutcome};
