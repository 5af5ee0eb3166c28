//! The shared render record and the entities embedded in it.

/// Structured error records and their one-line formatting.
pub mod errors;
/// Immutable per-render metadata.
pub mod metadata;
/// The shared record and its monotonic updates.
pub mod progress;
/// Per-chunk retry history.
pub mod retry;
