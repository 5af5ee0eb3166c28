//! Worker invocation boundary.
//!
//! The orchestrator only ever starts workers through [`InvocationTransport`]; results come back
//! through the status store, never through the transport.

/// In-process transport running chunk renders on a rayon pool.
pub mod local;
/// Protocol used by workers to report chunk outcomes into the status store.
pub mod worker;

use crate::foundation::core::{ChunkIndex, FrameRange, RenderId};
use crate::foundation::error::OrchestratorResult;
use crate::model::metadata::Codec;

/// Everything a worker needs to render one chunk attempt.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSpec {
    pub render_id: RenderId,
    pub chunk: ChunkIndex,
    pub frame_range: FrameRange,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    /// Reissues still allowed after this attempt.
    pub retries_left: u32,
    pub codec: Codec,
}

/// Synchronous answer of the transport. Acceptance says nothing about the render outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvokeOutcome {
    Accepted,
    Rejected { reason: String },
}

/// Starts remote workers.
pub trait InvocationTransport: Send + Sync {
    fn invoke(&self, spec: ChunkSpec) -> OrchestratorResult<InvokeOutcome>;

    /// Best-effort notification that a render was abandoned. No acknowledgment is expected.
    fn cancel(&self, _render_id: &RenderId) {}
}
