//! Page composition: turn an entity and its enrichment fields into Markdown.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use councilgen_extraction::ChatClient;
use councilgen_shared::{Entity, ExtractionError, FieldMap, Result};

/// A composed page, before it is stamped into a `GeneratedPage`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageDraft {
    pub title: String,
    /// Markdown.
    pub body: String,
    /// USD spent composing.
    pub cost: f64,
}

/// Writes the page body for one entity.
#[async_trait]
pub trait PageWriter: Send + Sync {
    async fn write(&self, entity: &Entity, fields: &FieldMap) -> Result<PageDraft>;
    fn name(&self) -> &str;
}

/// `planning_email` → `Planning email`
fn humanize(key: &str) -> String {
    let spaced = key.replace(['_', '-'], " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn default_title(entity: &Entity) -> String {
    format!("{} planning services", entity.name)
}

fn attribute_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// TemplateWriter
// ---------------------------------------------------------------------------

/// Deterministic Markdown page; costs nothing.
pub struct TemplateWriter;

#[async_trait]
impl PageWriter for TemplateWriter {
    async fn write(&self, entity: &Entity, fields: &FieldMap) -> Result<PageDraft> {
        let title = default_title(entity);
        let mut body = String::new();

        // Writing to a String cannot fail.
        let _ = writeln!(body, "# {title}\n");
        let _ = writeln!(
            body,
            "How to contact {} about planning applications, and where to find them online.\n",
            entity.name
        );

        if !fields.is_empty() {
            let _ = writeln!(body, "## Contact details\n");
            for (key, value) in fields {
                let shown = value.as_deref().unwrap_or("not published");
                let _ = writeln!(body, "- **{}:** {shown}", humanize(key));
            }
            body.push('\n');
        }

        if !entity.attributes.is_empty() {
            let _ = writeln!(body, "## About {}\n", entity.name);
            for (key, value) in &entity.attributes {
                let _ = writeln!(body, "- **{}:** {}", humanize(key), attribute_text(value));
            }
            body.push('\n');
        }

        if let Some(url) = &entity.portal_url {
            let _ = writeln!(body, "Source: <{url}>");
        }

        Ok(PageDraft {
            title,
            body: body.trim_end().to_string() + "\n",
            cost: 0.0,
        })
    }

    fn name(&self) -> &str {
        "template"
    }
}

// ---------------------------------------------------------------------------
// LlmWriter
// ---------------------------------------------------------------------------

const WRITER_SYSTEM_PROMPT: &str = "You write short, factual public-information pages in Markdown. \
Use only the facts provided. Start with a single '# ' heading. Never invent contact details.";

/// Model-written page from the same facts the template uses.
pub struct LlmWriter {
    chat: ChatClient,
    timeout: Duration,
}

impl LlmWriter {
    pub fn new(chat: ChatClient, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    fn prompt(entity: &Entity, fields: &FieldMap) -> String {
        let facts = serde_json::json!({
            "name": entity.name,
            "portal_url": entity.portal_url.as_ref().map(|u| u.as_str()),
            "fields": fields,
            "attributes": entity.attributes,
        });
        format!(
            "Write a page of 150 to 300 words helping residents contact {} about planning. \
             Fields that are null are not published; say so rather than guessing.\n\nFacts:\n{facts:#}",
            entity.name
        )
    }
}

#[async_trait]
impl PageWriter for LlmWriter {
    async fn write(&self, entity: &Entity, fields: &FieldMap) -> Result<PageDraft> {
        let completion = self
            .chat
            .complete(WRITER_SYSTEM_PROMPT, &Self::prompt(entity, fields), false, self.timeout)
            .await?;

        let body = completion.text.trim().to_string();
        if body.is_empty() {
            return Err(ExtractionError::Provider("model returned an empty page".into())
                .billed(completion.cost)
                .into());
        }
        debug!(entity = %entity.id, tokens_out = completion.tokens_out, "page written by model");

        let title = body
            .lines()
            .find_map(|line| line.strip_prefix("# "))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| default_title(entity));

        Ok(PageDraft {
            title,
            body: body + "\n",
            cost: completion.cost,
        })
    }

    fn name(&self) -> &str {
        "llm"
    }
}
