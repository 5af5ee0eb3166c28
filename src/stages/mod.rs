//! Pipeline stages and the precedence graph between them.
//!
//! Stages read and write only through the shared [`RenderStatusStore`]; none of them keeps state
//! that another process would need to observe.

/// Cleanup of intermediate artifacts once the final media exists.
pub mod cleanup;
/// Chunk invocation, retry reissue and chunk-render tracking.
pub mod dispatch;
/// Stitching of rendered chunks into the final media.
pub mod encoding;

use crate::foundation::clock::Clock;
use crate::foundation::core::RenderId;
use crate::foundation::error::OrchestratorResult;
use crate::model::progress::{ProgressUpdate, RenderProgress};
use crate::store::RenderStatusStore;
use std::sync::Arc;

/// One phase of the render pipeline, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Invoke,
    Chunks,
    Encoding,
    Cleanup,
    Download,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Invoke,
        StageKind::Chunks,
        StageKind::Encoding,
        StageKind::Cleanup,
        StageKind::Download,
    ];

    /// Stages whose completion reveals this one (and, for encoding onwards, allows it to start).
    pub fn prerequisites(self) -> &'static [StageKind] {
        match self {
            StageKind::Invoke => &[],
            StageKind::Chunks => &[StageKind::Invoke],
            StageKind::Encoding => &[StageKind::Chunks],
            StageKind::Cleanup => &[StageKind::Encoding],
            StageKind::Download => &[StageKind::Encoding],
        }
    }

    /// 1-based step number for "(n/5)" style display.
    pub fn step(self) -> usize {
        self as usize + 1
    }
}

/// Count-completed / count-total pair of one stage plus its completion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub completed: u64,
    /// `None` while the total is not known yet.
    pub total: Option<u64>,
    /// Milliseconds the stage took; set once when the stage finishes.
    pub done_in: Option<u64>,
}

impl StageProgress {
    pub fn is_done(&self) -> bool {
        self.done_in.is_some()
    }

    /// Completion ratio in `0.0..=1.0`. Finished stages report 1 even when force-completed.
    pub fn ratio(&self) -> f64 {
        if self.is_done() {
            return 1.0;
        }
        match self.total {
            Some(total) if total > 0 => (self.completed as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Handles a stage needs to write into one render's record.
#[derive(Clone)]
pub struct StageCtx {
    pub render_id: RenderId,
    pub store: Arc<dyn RenderStatusStore>,
    pub clock: Arc<dyn Clock>,
}

impl StageCtx {
    pub fn new(
        render_id: RenderId,
        store: Arc<dyn RenderStatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            render_id,
            store,
            clock,
        }
    }

    pub(crate) fn apply(&self, update: ProgressUpdate) -> OrchestratorResult<bool> {
        self.store
            .apply(&self.render_id, &update, self.clock.now_ms())
    }

    pub(crate) fn read(&self) -> OrchestratorResult<RenderProgress> {
        self.store.read(&self.render_id)
    }
}
