/// Enrichment pipeline: picks spans that need annotations, drives the
/// backend cascade, and commits results span by span.
pub mod job;
pub mod pipeline;
pub mod source;

pub use job::EnrichmentJob;
pub use pipeline::{EnrichmentPipeline, PipelineSettings};
