//! Core generation pipeline for councilgen.
//!
//! This crate ties the extraction client, the enrichment cache and page
//! composition into per-entity generation, and runs it over entity lists
//! in resumable, checkpointed batches (`BatchOrchestrator::run`).

pub mod artifacts;
pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod generator;
pub mod writer;

pub use artifacts::ArtifactStore;
pub use batch::{
    BatchConfig, BatchOrchestrator, BatchProgress, FailureEntry, RunReport, SilentProgress,
    dedupe_entities,
};
pub use cache::{
    CacheBackend, CacheStats, Clock, EnrichmentCache, ManualClock, MemoryCacheBackend,
    SqlCacheBackend, SystemClock,
};
#[cfg(feature = "redis")]
pub use cache::RedisCacheBackend;
pub use checkpoint::CheckpointStore;
pub use generator::{EntityGenerator, GenerationOutcome, PageGenerator};
pub use writer::{LlmWriter, PageDraft, PageWriter, TemplateWriter};
