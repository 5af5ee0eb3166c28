use crate::foundation::clock::Clock;
use crate::foundation::error::OrchestratorResult;
use crate::model::errors::{EnhancedErrorInfo, ErrorSource};
use crate::model::progress::ProgressUpdate;
use crate::store::RenderStatusStore;
use crate::transport::ChunkSpec;

/// Failure of one chunk attempt as seen by the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFailure {
    pub message: String,
    pub stack: String,
    /// Transient platform or timeout failure worth another attempt.
    pub retryable: bool,
}

impl ChunkFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: String::new(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: String::new(),
            retryable: false,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }
}

/// Write the outcome of one chunk attempt into the shared record.
///
/// This is the only write a worker performs. A failure is marked `will_retry` when it is
/// retryable and the attempt still has budget left; the orchestrator then reissues the chunk.
/// Returns whether the record changed (a duplicate delivery returns `false`).
pub fn report_chunk_outcome(
    store: &dyn RenderStatusStore,
    clock: &dyn Clock,
    spec: &ChunkSpec,
    outcome: Result<(), ChunkFailure>,
) -> OrchestratorResult<bool> {
    let now = clock.now_ms();
    let update = match outcome {
        Ok(()) => {
            tracing::debug!(render = %spec.render_id, chunk = %spec.chunk, attempt = spec.attempt, "chunk rendered");
            ProgressUpdate::ChunkRendered { chunk: spec.chunk }
        }
        Err(failure) => {
            let will_retry = failure.retryable && spec.retries_left > 0;
            tracing::warn!(
                render = %spec.render_id,
                chunk = %spec.chunk,
                attempt = spec.attempt,
                will_retry,
                message = %failure.message,
                "chunk attempt failed"
            );
            ProgressUpdate::ErrorRecorded {
                error: EnhancedErrorInfo {
                    message: failure.message,
                    stack: failure.stack,
                    chunk: Some(spec.chunk),
                    attempt: spec.attempt,
                    will_retry,
                    source: ErrorSource::Renderer,
                    time_ms: now,
                },
            }
        }
    };
    store.apply(&spec.render_id, &update, now)
}
