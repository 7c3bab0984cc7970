//! Core domain types for the enrichment and generation pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Current schema version for checkpoint and artifact files.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Lifetime of a cached enrichment record. Portal data changes slowly
/// relative to scrape cost, so this is fixed rather than per-call.
pub const ENRICHMENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Extracted field values keyed by field name. `None` means "looked for,
/// not found".
pub type FieldMap = BTreeMap<String, Option<String>>;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One unit of work in a batch run (e.g., one local authority).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier; also the artifact file name.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Portal page holding the facts to extract. Entities without one skip
    /// extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_url: Option<Url>,
    /// The portal is known to need script execution; skip the static tier.
    #[serde(default)]
    pub render: bool,
    /// CSS selector the rendered fetch waits for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    /// Per-entity field list, overriding the configured default when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
    /// Per-portal structural parsing rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_schema: Option<ExtractionSchema>,
    /// Other structured data supplied by the entity source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    /// Minimal entity with no portal and no attributes.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            portal_url: None,
            render: false,
            wait_for: None,
            required_fields: Vec::new(),
            extraction_schema: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the portal URL.
    pub fn with_portal(mut self, url: Url) -> Self {
        self.portal_url = Some(url);
        self
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Structural parsing rules for one portal layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    /// Rule per field name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
}

/// How to locate one field in a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// CSS selectors tried in order; the first non-empty match wins.
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Read this attribute instead of the element text (e.g. `href`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Regex applied to the selected text (or the whole page text when no
    /// selector is given). The first capture group is the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// A single extraction call. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub target_url: Url,
    pub required_fields: BTreeSet<String>,
    pub extraction_schema: Option<ExtractionSchema>,
    /// Selector the rendered tier waits for; network-idle when absent.
    pub wait_for_selector: Option<String>,
    /// Skip the static tier.
    pub requires_rendering: bool,
}

impl ExtractionRequest {
    pub fn new<I, S>(target_url: Url, required_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_url,
            required_fields: required_fields.into_iter().map(Into::into).collect(),
            extraction_schema: None,
            wait_for_selector: None,
            requires_rendering: false,
        }
    }

    pub fn with_schema(mut self, schema: ExtractionSchema) -> Self {
        self.extraction_schema = Some(schema);
        self
    }

    pub fn wait_for(mut self, selector: impl Into<String>) -> Self {
        self.wait_for_selector = Some(selector.into());
        self
    }

    pub fn rendered(mut self, requires_rendering: bool) -> Self {
        self.requires_rendering = requires_rendering;
        self
    }

    /// A field map with every required field set to `None`.
    pub fn empty_fields(&self) -> FieldMap {
        self.required_fields
            .iter()
            .map(|f| (f.clone(), None))
            .collect()
    }
}

/// Strategy that produced an extraction result, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Static,
    Rendered,
    Semantic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Rendered => "rendered",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Every required field; `None` where nothing was found.
    pub fields: FieldMap,
    pub tier_used: Tier,
    /// Per-field confidence in `0..=1`, when the tier reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<BTreeMap<String, f64>>,
    /// USD spent producing this result.
    #[serde(default)]
    pub cost: f64,
    /// Final URL after redirects, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl ExtractionResult {
    /// Number of fields with a value.
    pub fn found_count(&self) -> usize {
        self.fields.values().filter(|v| v.is_some()).count()
    }

    /// True when no required field has a value.
    pub fn is_empty(&self) -> bool {
        self.found_count() == 0
    }
}

/// One cached extraction result per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub entity_id: String,
    pub fields: FieldMap,
    pub cached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Failed,
}

/// Per-entity outcome. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub entity_id: String,
    pub status: GenerationStatus,
    pub cost: f64,
    pub word_count: usize,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn success(
        entity_id: impl Into<String>,
        cost: f64,
        word_count: usize,
        elapsed: Duration,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: GenerationStatus::Success,
            cost,
            word_count,
            elapsed_seconds: elapsed.as_secs_f64(),
            error: None,
        }
    }

    /// Failed result. `cost` is whatever was spent before the failure.
    pub fn failed(
        entity_id: impl Into<String>,
        error: impl Into<String>,
        cost: f64,
        elapsed: Duration,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: GenerationStatus::Failed,
            cost,
            word_count: 0,
            elapsed_seconds: elapsed.as_secs_f64(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == GenerationStatus::Success
    }
}

/// Where the facts on a generated page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentSource {
    Cache,
    Static,
    Rendered,
    Semantic,
    /// Entity had no portal to extract from.
    None,
}

impl From<Tier> for EnrichmentSource {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Static => Self::Static,
            Tier::Rendered => Self::Rendered,
            Tier::Semantic => Self::Semantic,
        }
    }
}

/// The output artifact: one generated content page per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPage {
    pub schema_version: u32,
    pub entity_id: String,
    pub entity_name: String,
    pub title: String,
    /// Page body as Markdown.
    pub body: String,
    pub fields: FieldMap,
    pub enrichment_source: EnrichmentSource,
    pub word_count: usize,
    pub cost: f64,
    /// SHA-256 of `body`, for downstream change detection.
    pub content_hash: String,
    pub generated_at: DateTime<Utc>,
}

/// Count whitespace-separated words.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable progress of batch runs over one output directory.
///
/// Treated as a value: each batch produces a new checkpoint that replaces
/// the previous one on disk. `completed` and `failed` are always disjoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    /// Last recorded error per failed entity.
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
    /// Cumulative USD across all runs.
    #[serde(default)]
    pub total_cost: f64,
    /// Index of the last persisted batch, counted across runs.
    #[serde(default)]
    pub last_batch_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            errors: BTreeMap::new(),
            total_cost: 0.0,
            last_batch_index: None,
            updated_at: None,
        }
    }
}

impl Checkpoint {
    pub fn is_completed(&self, entity_id: &str) -> bool {
        self.completed.contains(entity_id)
    }

    /// Index the next batch should carry.
    pub fn next_batch_index(&self) -> u64 {
        self.last_batch_index.map_or(0, |i| i + 1)
    }

    /// A new checkpoint with one batch of results folded in.
    pub fn with_batch(&self, batch_index: u64, results: &[GenerationResult]) -> Self {
        let mut next = self.clone();
        for result in results {
            next.total_cost += result.cost;
            if result.is_success() {
                next.mark_completed(&result.entity_id);
            } else if !next.completed.contains(&result.entity_id) {
                next.failed.insert(result.entity_id.clone());
                next.errors.insert(
                    result.entity_id.clone(),
                    result.error.clone().unwrap_or_else(|| "unknown error".into()),
                );
            }
        }
        next.last_batch_index = Some(batch_index);
        next.updated_at = Some(Utc::now());
        next
    }

    /// A new checkpoint with the given ids marked completed (artifacts
    /// found on disk without a checkpoint entry).
    pub fn with_completed<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut next = self.clone();
        for id in ids {
            next.mark_completed(id);
        }
        next
    }

    fn mark_completed(&mut self, id: &str) {
        self.failed.remove(id);
        self.errors.remove(id);
        self.completed.insert(id.to_string());
    }

    /// `completed ∩ failed = ∅`.
    pub fn is_consistent(&self) -> bool {
        self.completed.is_disjoint(&self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_deserializes_with_defaults() {
        let json = r#"{"id":"E07000223","name":"Adur","portal_url":"https://www.adur-worthing.gov.uk/planning/"}"#;
        let entity: Entity = serde_json::from_str(json).expect("deserialize");
        assert_eq!(entity.id, "E07000223");
        assert!(!entity.render);
        assert!(entity.attributes.is_empty());
        assert_eq!(
            entity.portal_url.as_ref().map(Url::as_str),
            Some("https://www.adur-worthing.gov.uk/planning/")
        );
    }

    #[test]
    fn request_empty_fields_cover_all_required() {
        let req = ExtractionRequest::new(
            Url::parse("https://council.example").unwrap(),
            ["planning_email", "planning_phone"],
        );
        let fields = req.empty_fields();
        assert_eq!(fields.len(), 2);
        assert!(fields.values().all(Option::is_none));
    }

    #[test]
    fn extraction_result_emptiness() {
        let mut fields = FieldMap::new();
        fields.insert("a".into(), None);
        let mut result = ExtractionResult {
            fields,
            tier_used: Tier::Static,
            confidence: None,
            cost: 0.0,
            source_url: None,
        };
        assert!(result.is_empty());
        result.fields.insert("b".into(), Some("x".into()));
        assert_eq!(result.found_count(), 1);
        assert!(!result.is_empty());
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Rendered).unwrap(), r#""rendered""#);
        assert!(Tier::Static < Tier::Rendered && Tier::Rendered < Tier::Semantic);
    }

    #[test]
    fn checkpoint_batch_keeps_sets_disjoint() {
        let cp = Checkpoint::default();
        let batch = [
            GenerationResult::success("a", 0.01, 300, Duration::from_secs(2)),
            GenerationResult::failed("b", "no extractable fields", 0.002, Duration::from_secs(1)),
        ];
        let cp = cp.with_batch(cp.next_batch_index(), &batch);
        assert!(cp.is_completed("a"));
        assert!(cp.failed.contains("b"));
        assert_eq!(cp.errors.get("b").map(String::as_str), Some("no extractable fields"));
        assert_eq!(cp.last_batch_index, Some(0));
        assert!((cp.total_cost - 0.012).abs() < 1e-9);

        // A later success moves the entity out of `failed`.
        let retry = [GenerationResult::success("b", 0.0, 120, Duration::from_secs(1))];
        let cp = cp.with_batch(cp.next_batch_index(), &retry);
        assert!(cp.is_completed("b"));
        assert!(!cp.failed.contains("b"));
        assert!(!cp.errors.contains_key("b"));
        assert_eq!(cp.last_batch_index, Some(1));
        assert!(cp.is_consistent());
    }

    #[test]
    fn checkpoint_with_completed_reconciles_failures() {
        let cp = Checkpoint::default().with_batch(
            0,
            &[GenerationResult::failed("x", "boom", 0.0, Duration::ZERO)],
        );
        let cp = cp.with_completed(["x"]);
        assert!(cp.is_completed("x"));
        assert!(cp.failed.is_empty());
    }

    #[test]
    fn checkpoint_ignores_unknown_fields() {
        let json = r#"{
            "completed": ["a", "b"],
            "failed": ["c"],
            "total_cost": 1.25,
            "last_batch_index": 3,
            "written_by": "some future version",
            "shard": {"id": 2}
        }"#;
        let cp: Checkpoint = serde_json::from_str(json).expect("deserialize");
        assert_eq!(cp.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(cp.completed.len(), 2);
        assert_eq!(cp.next_batch_index(), 4);
        assert!(cp.errors.is_empty());
    }

    #[test]
    fn generation_result_serialization() {
        let result = GenerationResult::failed("E1", "fetch timed out", 0.0, Duration::from_millis(1500));
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains(r#""status":"failed""#));
        let parsed: GenerationResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.elapsed_seconds, 1.5);
        assert!(!parsed.is_success());
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(count_words("  Planning in\nAdur\t\tis  busy "), 5);
        assert_eq!(count_words(""), 0);
    }
}
