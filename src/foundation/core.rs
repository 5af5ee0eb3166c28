use crate::foundation::error::{OrchestratorError, OrchestratorResult};
use std::fmt;

/// Identifier of one render, shared by the orchestrator and every worker writing its record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RenderId(String);

impl RenderId {
    /// Wrap a caller-chosen id. Ids are used as file names by [`crate::JsonFileStore`], so only
    /// ASCII alphanumerics, `-` and `_` are accepted.
    pub fn new(id: impl Into<String>) -> OrchestratorResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(OrchestratorError::validation("render id must be non-empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OrchestratorError::validation(format!(
                "render id '{id}' may only contain ASCII alphanumerics, '-' and '_'"
            )));
        }
        Ok(Self(id))
    }

    /// Generate a process-unique id from the current time and process id.
    pub fn generate() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self(format!("render-{}-{nanos:x}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 0-based index of a chunk within a render.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ChunkIndex(pub u32);

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute 0-based frame index in composition timeline space.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct FrameIndex(pub u64);

/// Half-open frame range `[start, end)` in timeline space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameRange {
    /// Inclusive range start.
    pub start: FrameIndex,
    /// Exclusive range end.
    pub end: FrameIndex,
}

impl FrameRange {
    /// Create a validated range with `start <= end`.
    pub fn new(start: FrameIndex, end: FrameIndex) -> OrchestratorResult<Self> {
        if start.0 > end.0 {
            return Err(OrchestratorError::validation(
                "FrameRange start must be <= end",
            ));
        }
        Ok(Self { start, end })
    }

    /// Number of frames contained in the range.
    pub fn len_frames(self) -> u64 {
        self.end.0.saturating_sub(self.start.0)
    }

    /// Return `true` when the range has no frames.
    pub fn is_empty(self) -> bool {
        self.start.0 == self.end.0
    }

    /// Return `true` when `f` is inside `[start, end)`.
    pub fn contains(self, f: FrameIndex) -> bool {
        self.start.0 <= f.0 && f.0 < self.end.0
    }
}

/// Partition of a render's timeline into contiguous per-worker chunks.
///
/// Every chunk except possibly the last holds exactly `frames_per_chunk` frames; ranges are
/// disjoint and cover `[0, duration_in_frames)` in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    frames_per_chunk: u64,
    chunks: Vec<FrameRange>,
}

impl ChunkPlan {
    pub fn new(duration_in_frames: u64, frames_per_chunk: u64) -> OrchestratorResult<Self> {
        if duration_in_frames == 0 {
            return Err(OrchestratorError::validation(
                "duration_in_frames must be > 0",
            ));
        }
        if frames_per_chunk == 0 {
            return Err(OrchestratorError::validation(
                "frames_per_chunk must be > 0",
            ));
        }

        let count = duration_in_frames.div_ceil(frames_per_chunk);
        if count > u64::from(u32::MAX) {
            return Err(OrchestratorError::validation(format!(
                "render would need {count} chunks; raise frames_per_chunk"
            )));
        }

        let mut chunks = Vec::with_capacity(count as usize);
        let mut start = 0u64;
        while start < duration_in_frames {
            let end = (start + frames_per_chunk).min(duration_in_frames);
            chunks.push(FrameRange::new(FrameIndex(start), FrameIndex(end))?);
            start = end;
        }

        Ok(Self {
            frames_per_chunk,
            chunks,
        })
    }

    pub fn frames_per_chunk(&self) -> u64 {
        self.frames_per_chunk
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn range(&self, chunk: ChunkIndex) -> Option<FrameRange> {
        self.chunks.get(chunk.0 as usize).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkIndex, FrameRange)> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .map(|(i, r)| (ChunkIndex(i as u32), *r))
    }
}
