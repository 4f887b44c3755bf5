//! Pipeline entry points for upload ingestion.
//!
//! - `IngestPipeline::ingest`: hash, dedup, extract and commit one upload
//! - `IngestPipeline::ingest_all`: the same for a batch, with bounded parallelism
//! - `IngestPipeline::check_duplicate`: dedup lookup without extraction

pub mod ingest;

pub use ingest::{DedupCheckRequest, DedupCheckResponse, IngestPipeline, IngestResult, Upload};
