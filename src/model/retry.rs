use crate::foundation::core::ChunkIndex;
use crate::foundation::error::{OrchestratorError, OrchestratorResult};

/// One reissue of a chunk invocation after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRetry {
    pub chunk: ChunkIndex,
    /// Number of the failed attempt that triggered this reissue (1-based).
    pub attempt: u32,
    pub reason: String,
    pub time_ms: u64,
}

/// Append-only retry history of a render.
///
/// Per chunk, recorded attempt numbers are exactly `1..=n`. Re-recording an existing attempt is a
/// no-op so writers may deliver the same retry more than once.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RetryTracker {
    entries: Vec<ChunkRetry>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `retry`. Returns `Ok(false)` when that attempt was already recorded.
    pub fn record(&mut self, retry: ChunkRetry) -> OrchestratorResult<bool> {
        if retry.attempt == 0 {
            return Err(OrchestratorError::validation(
                "retry attempt numbers start at 1",
            ));
        }
        let recorded = self.attempts_for(retry.chunk);
        if retry.attempt <= recorded {
            return Ok(false);
        }
        if retry.attempt != recorded + 1 {
            return Err(OrchestratorError::validation(format!(
                "non-contiguous retry for chunk {}: expected attempt {}, got {}",
                retry.chunk,
                recorded + 1,
                retry.attempt
            )));
        }
        self.entries.push(retry);
        Ok(true)
    }

    /// Number of retries recorded for `chunk`.
    pub fn attempts_for(&self, chunk: ChunkIndex) -> u32 {
        self.entries.iter().filter(|r| r.chunk == chunk).count() as u32
    }

    pub fn contains(&self, chunk: ChunkIndex, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.attempts_for(chunk)
    }

    pub fn for_chunk(&self, chunk: ChunkIndex) -> impl Iterator<Item = &ChunkRetry> {
        self.entries.iter().filter(move |r| r.chunk == chunk)
    }

    pub fn entries(&self) -> &[ChunkRetry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
