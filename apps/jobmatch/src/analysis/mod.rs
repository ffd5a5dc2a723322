// Compatibility analysis: single-flight registry keyed by job, plus HTTP handlers.
// The gateway owns scoring; this layer only deduplicates, caches and notifies.

pub mod dedup;
pub mod handlers;
pub mod models;

pub use dedup::AnalysisDeduplicator;
