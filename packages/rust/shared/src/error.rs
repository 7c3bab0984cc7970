//! Error types for councilgen.
//!
//! Library crates use [`CouncilgenError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`ExtractionError`] is the per-tier failure taxonomy of the extraction
//! client. It never aborts a batch: the page generator turns it into a
//! failed generation result.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all councilgen operations.
#[derive(Debug, thiserror::Error)]
pub enum CouncilgenError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of the extraction tiers.
    #[error("network error: {0}")]
    Network(String),

    /// JSON/TOML/HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or cache backend error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Extraction failed at every applicable tier.
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Checkpoint or artifact could not be persisted. Aborts the run.
    #[error("persistence error at {path:?}: {message}")]
    Persistence { path: PathBuf, message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CouncilgenError>;

impl CouncilgenError {
    /// USD spent by the failed operation, when it reports one.
    pub fn spent_cost(&self) -> f64 {
        match self {
            Self::Extraction(e) => e.cost(),
            _ => 0.0,
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a persistence error for the checkpoint or an artifact.
    pub fn persistence(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: msg.into(),
        }
    }
}

/// Failure of a single extraction tier, or of the whole extraction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    /// Static fetch did not complete within its budget.
    #[error("fetch timed out after {}s: {url}", .timeout.as_secs())]
    FetchTimeout { url: String, timeout: Duration },

    /// Static fetch returned a non-2xx status.
    #[error("fetch returned HTTP {status}: {url}")]
    FetchHttp { url: String, status: u16 },

    /// Connection, TLS, redirect or body-read failure.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Rendered fetch did not complete within its budget.
    #[error("render timed out after {}s: {url}", .timeout.as_secs())]
    RenderTimeout { url: String, timeout: Duration },

    /// Rendering service or browser failed.
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },

    /// Model returned non-JSON or schema-incompatible JSON.
    #[error("could not parse model output: {0}")]
    ExtractionParse(String),

    /// Model provider error (HTTP status, outage, empty response).
    #[error("model provider error: {0}")]
    Provider(String),

    /// Model call did not complete within its budget.
    #[error("model call timed out after {}s", .timeout.as_secs())]
    SemanticTimeout { timeout: Duration },

    /// Semantic tier is unreachable because no API key is set.
    #[error("no API key configured for semantic extraction (set {env_var})")]
    NoApiKeyConfigured { env_var: String },

    /// Every tier ran but none yielded a required field.
    #[error("no extractable fields found for {url}")]
    NoFieldsFound { url: String },

    /// Configured parsing rules do not compile.
    #[error("invalid extraction schema: {0}")]
    InvalidSchema(String),

    /// Target URL is malformed or points at a blocked host.
    #[error("invalid target {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    /// A paid model call went through but its output was unusable.
    #[error("{error}")]
    Billed {
        cost: f64,
        error: Box<ExtractionError>,
    },
}

impl ExtractionError {
    /// Attach the USD already spent. Zero cost leaves the error unchanged.
    pub fn billed(self, cost: f64) -> Self {
        if cost > 0.0 {
            Self::Billed {
                cost,
                error: Box::new(self),
            }
        } else {
            self
        }
    }

    /// USD spent before this error occurred.
    pub fn cost(&self) -> f64 {
        match self {
            Self::Billed { cost, error } => cost + error.cost(),
            _ => 0.0,
        }
    }

    /// The underlying failure, without any cost wrapper.
    pub fn kind(&self) -> &ExtractionError {
        match self {
            Self::Billed { error, .. } => error.kind(),
            other => other,
        }
    }

    /// Whether this error ends extraction without trying a further tier.
    pub fn is_terminal(&self) -> bool {
        if let Self::Billed { error, .. } = self {
            return error.is_terminal();
        }
        !matches!(
            self,
            Self::FetchTimeout { .. }
                | Self::FetchHttp { .. }
                | Self::Transport { .. }
                | Self::RenderTimeout { .. }
                | Self::Render { .. }
        )
    }
}
