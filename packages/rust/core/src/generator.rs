//! Per-entity generation: cached or fresh enrichment, then page composition.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use councilgen_extraction::ExtractionClient;
use councilgen_shared::{
    CURRENT_SCHEMA_VERSION, EnrichmentSource, Entity, ExtractionError, ExtractionRequest, FieldMap,
    GeneratedPage, GenerationResult, count_words,
};

use crate::cache::EnrichmentCache;
use crate::writer::PageWriter;

/// What one generation produced. `page` is present only on success.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub result: GenerationResult,
    pub page: Option<GeneratedPage>,
}

/// Produces one outcome per entity. Never fails: errors become a failed
/// [`GenerationResult`].
#[async_trait]
pub trait EntityGenerator: Send + Sync {
    async fn generate(&self, entity: &Entity) -> GenerationOutcome;
}

/// SHA-256 hex digest of a page body.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Enrichment {
    fields: FieldMap,
    source: EnrichmentSource,
    cost: f64,
}

/// Cache, then extraction, then the page writer.
pub struct PageGenerator {
    extractor: ExtractionClient,
    cache: EnrichmentCache,
    writer: Arc<dyn PageWriter>,
    default_fields: Vec<String>,
}

impl PageGenerator {
    pub fn new(
        extractor: ExtractionClient,
        cache: EnrichmentCache,
        writer: Arc<dyn PageWriter>,
        default_fields: Vec<String>,
    ) -> Self {
        Self {
            extractor,
            cache,
            writer,
            default_fields,
        }
    }

    pub fn cache(&self) -> &EnrichmentCache {
        &self.cache
    }

    fn request_for(&self, entity: &Entity, url: &Url) -> ExtractionRequest {
        let fields = if entity.required_fields.is_empty() {
            &self.default_fields
        } else {
            &entity.required_fields
        };

        let mut request = ExtractionRequest::new(url.clone(), fields.iter().cloned())
            .rendered(entity.render);
        if let Some(schema) = &entity.extraction_schema {
            request = request.with_schema(schema.clone());
        }
        if let Some(selector) = &entity.wait_for {
            request = request.wait_for(selector.clone());
        }
        request
    }

    async fn enrich(&self, entity: &Entity) -> Result<Enrichment, ExtractionError> {
        let Some(url) = &entity.portal_url else {
            debug!("no portal url, skipping extraction");
            return Ok(Enrichment {
                fields: FieldMap::new(),
                source: EnrichmentSource::None,
                cost: 0.0,
            });
        };

        if let Some(record) = self.cache.get(&entity.id).await {
            return Ok(Enrichment {
                fields: record.fields,
                source: EnrichmentSource::Cache,
                cost: 0.0,
            });
        }

        let result = self
            .extractor
            .extract(&self.request_for(entity, url))
            .await?;
        info!(
            tier = %result.tier_used,
            found = result.found_count(),
            cost = result.cost,
            "extracted"
        );

        if let Err(e) = self.cache.set(&entity.id, &result.fields).await {
            warn!(error = %e, "cache write failed, continuing");
        }

        Ok(Enrichment {
            source: result.tier_used.into(),
            cost: result.cost,
            fields: result.fields,
        })
    }
}

#[async_trait]
impl EntityGenerator for PageGenerator {
    #[instrument(skip_all, fields(entity = %entity.id))]
    async fn generate(&self, entity: &Entity) -> GenerationOutcome {
        let started = Instant::now();

        let enrichment = match self.enrich(entity).await {
            Ok(e) => e,
            Err(e) => {
                let error = format!("extraction failed: {e}");
                warn!(%error, cost = e.cost(), "generation failed");
                return GenerationOutcome {
                    result: GenerationResult::failed(&entity.id, error, e.cost(), started.elapsed()),
                    page: None,
                };
            }
        };

        let draft = match self.writer.write(entity, &enrichment.fields).await {
            Ok(d) => d,
            Err(e) => {
                let error = format!("page composition failed ({}): {e}", self.writer.name());
                let cost = enrichment.cost + e.spent_cost();
                warn!(%error, cost, "generation failed");
                return GenerationOutcome {
                    result: GenerationResult::failed(&entity.id, error, cost, started.elapsed()),
                    page: None,
                };
            }
        };

        let cost = enrichment.cost + draft.cost;
        let word_count = count_words(&draft.body);
        let page = GeneratedPage {
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_id: entity.id.clone(),
            entity_name: entity.name.clone(),
            title: draft.title,
            content_hash: content_hash(&draft.body),
            body: draft.body,
            fields: enrichment.fields,
            enrichment_source: enrichment.source,
            word_count,
            cost,
            generated_at: Utc::now(),
        };

        debug!(word_count, cost, source = ?page.enrichment_source, "page generated");
        GenerationOutcome {
            result: GenerationResult::success(&entity.id, cost, word_count, started.elapsed()),
            page: Some(page),
        }
    }
}
