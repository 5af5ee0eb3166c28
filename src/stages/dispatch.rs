use crate::foundation::core::{ChunkIndex, ChunkPlan};
use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use crate::model::errors::{EnhancedErrorInfo, ErrorSource};
use crate::model::metadata::Codec;
use crate::model::progress::{ChunkAttempt, ProgressUpdate, RenderProgress};
use crate::model::retry::ChunkRetry;
use crate::stages::{StageCtx, StageProgress};
use crate::transport::{ChunkSpec, InvocationTransport, InvokeOutcome};
use std::sync::Arc;

/// Invokes one worker per chunk and reissues chunks whose attempts failed retryably.
///
/// Attempts of one chunk are strictly sequential: attempt `k + 1` is only issued after the retry
/// entry for attempt `k` was appended to the record, and that append succeeds for exactly one
/// writer. An accepted attempt is recorded through [`ProgressUpdate::LambdaInvoked`]; a retried
/// attempt whose successor left no trace in the record is issued again on the next reconcile.
pub struct ChunkDispatchStage {
    ctx: StageCtx,
    transport: Arc<dyn InvocationTransport>,
    plan: ChunkPlan,
    codec: Codec,
    retry_budget: u32,
}

impl ChunkDispatchStage {
    pub fn new(
        ctx: StageCtx,
        transport: Arc<dyn InvocationTransport>,
        plan: ChunkPlan,
        codec: Codec,
        retry_budget: u32,
    ) -> Self {
        Self {
            ctx,
            transport,
            plan,
            codec,
            retry_budget,
        }
    }

    /// Issue the first attempt of every chunk.
    #[tracing::instrument(skip(self), fields(render = %self.ctx.render_id))]
    pub fn dispatch_all(&self) -> OrchestratorResult<()> {
        for (chunk, _) in self.plan.iter() {
            if self.ctx.read()?.is_terminal() {
                tracing::info!("render became terminal during dispatch; stopping");
                break;
            }
            self.invoke(chunk, 1)?;
        }
        Ok(())
    }

    /// Reissue every chunk whose latest failure is retryable and not yet retried, and reissue
    /// retried attempts that were never issued.
    ///
    /// Returns the number of invocations issued.
    pub fn reconcile(&self, progress: &RenderProgress) -> OrchestratorResult<usize> {
        if progress.is_terminal() {
            return Ok(0);
        }

        let failed: Vec<ChunkAttempt> = progress
            .retryable_failures()
            .filter(|f| {
                !progress.retries().contains(f.chunk, f.attempt)
                    && !progress.is_chunk_rendered(f.chunk)
            })
            .collect();

        // Retry entries whose next attempt was neither accepted nor reported as failed.
        let stranded: Vec<ChunkAttempt> = progress
            .retries()
            .entries()
            .iter()
            .map(|r| ChunkAttempt {
                chunk: r.chunk,
                attempt: r.attempt + 1,
            })
            .filter(|next| {
                !progress.is_chunk_rendered(next.chunk)
                    && !progress.is_attempt_issued(next.chunk, next.attempt)
                    && !progress.is_retryable_failure(next.chunk, next.attempt)
                    && progress.retries().attempts_for(next.chunk) < next.attempt
            })
            .collect();

        let mut issued = 0;
        for next in stranded {
            tracing::warn!(chunk = %next.chunk, attempt = next.attempt, "reissuing attempt missing from the record");
            self.invoke(next.chunk, next.attempt)?;
            issued += 1;
        }
        for f in failed {
            let reason = failure_reason(progress, f);
            if self.reissue(f.chunk, f.attempt, reason)? {
                issued += 1;
            }
        }
        Ok(issued)
    }

    fn invoke(&self, chunk: ChunkIndex, attempt: u32) -> OrchestratorResult<()> {
        let frame_range = self.plan.range(chunk).ok_or_else(|| {
            OrchestratorError::validation(format!("chunk {chunk} is not part of the plan"))
        })?;
        let spec = ChunkSpec {
            render_id: self.ctx.render_id.clone(),
            chunk,
            frame_range,
            attempt,
            retries_left: (self.retry_budget + 1).saturating_sub(attempt),
            codec: self.codec,
        };

        match self.transport.invoke(spec) {
            Ok(InvokeOutcome::Accepted) => {
                tracing::debug!(%chunk, attempt, "chunk invoked");
                self.ctx
                    .apply(ProgressUpdate::LambdaInvoked { chunk, attempt })?;
                Ok(())
            }
            Ok(InvokeOutcome::Rejected { reason }) => {
                self.handle_failure(chunk, attempt, reason, true)
            }
            Err(e) => {
                let retryable = e.is_transient();
                self.handle_failure(chunk, attempt, e.to_string(), retryable)
            }
        }
    }

    /// Record a failed invocation of `chunk` and reissue it while budget remains.
    fn handle_failure(
        &self,
        chunk: ChunkIndex,
        attempt: u32,
        reason: String,
        retryable: bool,
    ) -> OrchestratorResult<()> {
        let will_retry = retryable && attempt <= self.retry_budget;
        self.ctx.apply(ProgressUpdate::ErrorRecorded {
            error: EnhancedErrorInfo {
                message: reason.clone(),
                stack: String::new(),
                chunk: Some(chunk),
                attempt,
                will_retry,
                source: ErrorSource::Invocation,
                time_ms: self.ctx.clock.now_ms(),
            },
        })?;

        if will_retry {
            self.reissue(chunk, attempt, reason)?;
        } else {
            tracing::error!(%chunk, attempt, %reason, "chunk invocation failed permanently");
        }
        Ok(())
    }

    /// Append the retry entry for `failed_attempt`, then invoke the next attempt. Returns `false`
    /// when another writer already reissued this attempt.
    fn reissue(
        &self,
        chunk: ChunkIndex,
        failed_attempt: u32,
        reason: String,
    ) -> OrchestratorResult<bool> {
        let appended = self.ctx.apply(ProgressUpdate::RetryRecorded {
            retry: ChunkRetry {
                chunk,
                attempt: failed_attempt,
                reason,
                time_ms: self.ctx.clock.now_ms(),
            },
        })?;
        if !appended {
            return Ok(false);
        }

        tracing::warn!(%chunk, failed_attempt, "retrying chunk");
        self.invoke(chunk, failed_attempt + 1)?;
        Ok(true)
    }
}

fn failure_reason(progress: &RenderProgress, failed: ChunkAttempt) -> String {
    progress
        .errors()
        .entries()
        .iter()
        .find(|e| e.chunk == Some(failed.chunk) && e.attempt == failed.attempt && e.will_retry)
        .map(|e| e.message.clone())
        .unwrap_or_else(|| format!("attempt {} failed", failed.attempt))
}

/// Progress of worker invocations: distinct chunks invoked over the estimated invocation count.
pub fn invoke_progress(progress: &RenderProgress) -> StageProgress {
    StageProgress {
        completed: u64::from(progress.lambdas_invoked()),
        total: progress
            .metadata()
            .map(|m| u64::from(m.estimated_render_lambda_invocations)),
        done_in: progress.time_to_invoke_lambdas(),
    }
}

/// Progress of chunk rendering: chunks reported rendered over the total chunk count.
pub fn chunk_progress(progress: &RenderProgress) -> StageProgress {
    StageProgress {
        completed: u64::from(progress.chunks()),
        total: progress.total_chunks().map(u64::from),
        done_in: progress.time_to_finish_chunks(),
    }
}
