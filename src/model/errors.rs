use crate::foundation::core::ChunkIndex;
use std::collections::BTreeSet;
use xxhash_rust::xxh3::Xxh3;

const EVENT_SEED: u64 = 0x5e11_a7c0_de91_4b2d;

/// Number of characters of an error's detail shown by [`format_errors`].
pub const ERROR_PREVIEW_CHARS: usize = 90;

/// Pipeline stage that observed a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Preparation,
    Invocation,
    Renderer,
    Encoder,
    Cleanup,
}

/// A failure observed by any stage. Immutable once recorded.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedErrorInfo {
    pub message: String,
    /// Full failure detail. Never truncated in the record.
    pub stack: String,
    /// `None` for errors raised while preparing the render as a whole.
    pub chunk: Option<ChunkIndex>,
    /// Attempt (of the chunk, or of preparation) that failed, 1-based.
    pub attempt: u32,
    pub will_retry: bool,
    pub source: ErrorSource,
    pub time_ms: u64,
}

impl EnhancedErrorInfo {
    /// Whether this error moves the render to FAILED. Cleanup failures never do.
    pub fn is_fatal(&self) -> bool {
        !self.will_retry && self.source != ErrorSource::Cleanup
    }

    /// Whether this is a retryable failure of a chunk attempt, which the orchestrator reissues.
    pub fn triggers_chunk_retry(&self) -> bool {
        self.will_retry && self.chunk.is_some() && self.source != ErrorSource::Cleanup
    }

    fn same_event(&self, other: &Self) -> bool {
        self.source == other.source
            && self.chunk == other.chunk
            && self.attempt == other.attempt
            && self.will_retry == other.will_retry
            && self.message == other.message
    }

    /// Stable fingerprint of the fields compared by `same_event`.
    fn event_fingerprint(&self) -> u64 {
        let mut h = Xxh3::with_seed(EVENT_SEED);
        h.update(&[self.source as u8, u8::from(self.will_retry)]);
        match self.chunk {
            Some(c) => {
                h.update(&[1]);
                h.update(&c.0.to_le_bytes());
            }
            None => h.update(&[0]),
        }
        h.update(&self.attempt.to_le_bytes());
        h.update(self.message.as_bytes());
        h.digest()
    }
}

/// Append-only, ordered error history of a render.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCollector {
    entries: Vec<EnhancedErrorInfo>,
    /// Errors not retained because the configured cap was reached.
    overflowed: u64,
    /// Fingerprints of the overflowed errors, so redeliveries are not counted twice.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    overflowed_events: BTreeSet<u64>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `err` unless the same event was already recorded. With `cap` set, errors past the cap
    /// are only counted, once per distinct event.
    ///
    /// Returns `true` when the collector changed.
    pub fn record(&mut self, err: EnhancedErrorInfo, cap: Option<usize>) -> bool {
        if self.entries.iter().any(|e| e.same_event(&err)) {
            return false;
        }
        if let Some(cap) = cap
            && self.entries.len() >= cap
        {
            if !self.overflowed_events.insert(err.event_fingerprint()) {
                return false;
            }
            self.overflowed = self.overflowed.saturating_add(1);
            return true;
        }
        self.entries.push(err);
        true
    }

    pub fn entries(&self) -> &[EnhancedErrorInfo] {
        &self.entries
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Render each error as one line, classified by scope (chunk vs preparation) and retry.
///
/// The detail is cut to [`ERROR_PREVIEW_CHARS`] characters; the record keeps the full text.
pub fn format_errors(errors: &[EnhancedErrorInfo]) -> Vec<String> {
    errors
        .iter()
        .map(|err| {
            let detail = if err.stack.is_empty() {
                &err.message
            } else {
                &err.stack
            };
            let preview = preview(detail);
            match (err.chunk, err.will_retry) {
                (None, true) => format!("Error while preparing render (will retry): {preview}"),
                (Some(c), true) => format!("Error in chunk {c} (will retry): {preview}"),
                (None, false) => format!("Error during preparation: {preview}"),
                (Some(c), false) => format!("Error in chunk {c}: {preview}"),
            }
        })
        .collect()
}

fn preview(detail: &str) -> String {
    let cut = detail
        .char_indices()
        .nth(ERROR_PREVIEW_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(detail.len());
    format!("{}...", &detail[..cut])
}
