//! Tiered extraction of structured fields from portal pages.
//!
//! This crate provides:
//! - [`ExtractionClient`]: static fetch, then rendered fetch, then semantic
//!   extraction, escalating only when the cheaper tier yields nothing
//! - [`PageRenderer`]: the rendered-tier seam ([`HttpRenderer`], and
//!   `ChromiumRenderer` behind the `chromium` feature)
//! - [`structural`]: selector/regex and labelled-value parsing
//! - [`ChatClient`]: OpenAI-compatible chat completions with JSON mode

pub mod client;
pub mod fetch;
pub mod llm;
pub mod render;
pub mod semantic;
pub mod structural;

pub use client::ExtractionClient;
pub use fetch::{FetchedPage, StaticFetcher, validate_target};
pub use llm::{ChatClient, Completion};
pub use render::{HttpRenderer, PageRenderer};
#[cfg(feature = "chromium")]
pub use render::ChromiumRenderer;
pub use semantic::SemanticExtractor;
