//! Shared types, error model, and configuration for councilgen.
//!
//! This crate is the foundation depended on by all other councilgen crates.
//! It provides:
//! - [`CouncilgenError`] and [`ExtractionError`], the error taxonomy
//! - Domain types ([`Entity`], [`ExtractionRequest`], [`ExtractionResult`],
//!   [`EnrichmentRecord`], [`Checkpoint`], [`GenerationResult`], [`GeneratedPage`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheBackendKind, CacheConfig, DefaultsConfig, ExtractionSettings,
    OpenRouterConfig, RendererKind, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{CouncilgenError, ExtractionError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, Checkpoint, ENRICHMENT_TTL, EnrichmentRecord, EnrichmentSource, Entity,
    ExtractionRequest, ExtractionResult, ExtractionSchema, FieldMap, FieldRule, GeneratedPage,
    GenerationResult, GenerationStatus, Tier, count_words,
};
