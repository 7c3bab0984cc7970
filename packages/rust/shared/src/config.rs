//! Application configuration for councilgen.
//!
//! User config lives at `~/.councilgen/councilgen.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CouncilgenError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "councilgen.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".councilgen";

/// A current desktop Chrome UA; several council portals reject obvious bots.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

// ---------------------------------------------------------------------------
// Config structs (matching councilgen.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenRouter (or any OpenAI-compatible provider) settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Extraction tier budgets and renderer selection.
    #[serde(default)]
    pub extraction: ExtractionSettings,

    /// Enrichment cache backend.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding `checkpoint.json`, `run_report.json` and `pages/`.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Entities per batch; the checkpoint is written after each one.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Admission limit for concurrent generations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Fields extracted for entities that do not list their own.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            required_fields: default_required_fields(),
        }
    }
}

fn default_output_dir() -> String {
    "var/councilgen".into()
}
fn default_batch_size() -> usize {
    5
}
fn default_concurrency() -> usize {
    3
}
fn default_required_fields() -> Vec<String> {
    vec![
        "planning_email".into(),
        "planning_phone".into(),
        "application_search_url".into(),
    ]
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for semantic extraction and page writing.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Sampling temperature; extraction wants deterministic output.
    #[serde(default)]
    pub temperature: f32,

    /// USD per million prompt tokens.
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,

    /// USD per million completion tokens.
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            default_model: default_model(),
            temperature: 0.0,
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_input_cost() -> f64 {
    0.15
}
fn default_output_cost() -> f64 {
    0.60
}

impl OpenRouterConfig {
    /// USD cost of one call with the given token usage.
    pub fn price(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_cost_per_mtok + tokens_out as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

/// Which tier-2 renderer to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Skip the rendered tier.
    None,
    /// Browserless-compatible rendering service at `render_endpoint`.
    Http,
    /// Local headless Chrome (requires the `chromium` feature).
    Chromium,
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    #[serde(default = "default_static_timeout")]
    pub static_timeout_secs: u64,

    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,

    #[serde(default = "default_semantic_timeout")]
    pub semantic_timeout_secs: u64,

    /// Characters of page text sent to the model.
    #[serde(default = "default_char_budget")]
    pub content_char_budget: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_renderer")]
    pub renderer: RendererKind,

    /// Base URL of the rendering service (for `renderer = "http"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_endpoint: Option<String>,

    /// Chrome binary (for `renderer = "chromium"`); auto-detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_executable: Option<String>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            static_timeout_secs: default_static_timeout(),
            render_timeout_secs: default_render_timeout(),
            semantic_timeout_secs: default_semantic_timeout(),
            content_char_budget: default_char_budget(),
            user_agent: default_user_agent(),
            renderer: default_renderer(),
            render_endpoint: None,
            chrome_executable: None,
        }
    }
}

fn default_static_timeout() -> u64 {
    10
}
fn default_render_timeout() -> u64 {
    30
}
fn default_semantic_timeout() -> u64 {
    15
}
fn default_char_budget() -> usize {
    8_000
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}
fn default_renderer() -> RendererKind {
    RendererKind::None
}

impl ExtractionSettings {
    pub fn static_timeout(&self) -> Duration {
        Duration::from_secs(self.static_timeout_secs)
    }
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_secs(self.semantic_timeout_secs)
    }
}

/// Which cache backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Process-local; nothing survives the run.
    Memory,
    /// libSQL file at `sqlite_path`.
    Sqlite,
    /// Redis at `redis_url` (requires the `redis` feature).
    Redis,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    /// Key prefix, `<product>:<subsystem>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Per-operation budget; slower calls count as an unavailable backend.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            namespace: default_namespace(),
            sqlite_path: default_sqlite_path(),
            redis_url: default_redis_url(),
            op_timeout_ms: default_op_timeout(),
        }
    }
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Sqlite
}
fn default_namespace() -> String {
    "councilgen:enrichment".into()
}
fn default_sqlite_path() -> String {
    "var/councilgen/cache.db".into()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_op_timeout() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.councilgen/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CouncilgenError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.councilgen/councilgen.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CouncilgenError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CouncilgenError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.defaults.batch_size == 0 {
        return Err(CouncilgenError::config("defaults.batch_size must be at least 1"));
    }
    if config.defaults.concurrency == 0 {
        return Err(CouncilgenError::config("defaults.concurrency must be at least 1"));
    }
    if config.extraction.renderer == RendererKind::Http && config.extraction.render_endpoint.is_none()
    {
        return Err(CouncilgenError::config(
            "extraction.renderer = \"http\" requires extraction.render_endpoint",
        ));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CouncilgenError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CouncilgenError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CouncilgenError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the configured env var. `None` when unset or empty;
/// the semantic tier then fails with `NoApiKeyConfigured`.
pub fn resolve_api_key(config: &OpenRouterConfig) -> Option<String> {
    match std::env::var(&config.api_key_env) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("councilgen:enrichment"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.batch_size, 5);
        assert_eq!(parsed.defaults.concurrency, 3);
        assert_eq!(parsed.extraction.content_char_budget, 8_000);
        assert_eq!(parsed.extraction.renderer, RendererKind::None);
        assert_eq!(parsed.cache.backend, CacheBackendKind::Sqlite);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
concurrency = 5

[extraction]
renderer = "http"
render_endpoint = "http://localhost:3000"

[cache]
backend = "memory"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.concurrency, 5);
        assert_eq!(config.defaults.batch_size, 5);
        assert_eq!(config.extraction.static_timeout(), Duration::from_secs(10));
        assert_eq!(config.extraction.render_timeout(), Duration::from_secs(30));
        assert_eq!(config.extraction.semantic_timeout(), Duration::from_secs(15));
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn http_renderer_requires_endpoint() {
        let mut config = AppConfig::default();
        config.extraction.renderer = RendererKind::Http;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("render_endpoint"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.defaults.concurrency = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn pricing_per_million_tokens() {
        let config = OpenRouterConfig::default();
        let cost = config.price(1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
        assert_eq!(config.price(0, 0), 0.0);
    }

    #[test]
    fn missing_api_key_resolves_to_none() {
        let mut config = OpenRouterConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.api_key_env = "CG_TEST_NONEXISTENT_KEY_12345".into();
        assert!(resolve_api_key(&config).is_none());
    }
}
