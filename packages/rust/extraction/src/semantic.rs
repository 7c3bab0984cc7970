//! Tier 3: ask a language model to read the page and return the fields.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use councilgen_shared::{ExtractionError, ExtractionRequest, ExtractionResult, FieldMap, Tier};

use crate::llm::ChatClient;

const SYSTEM_PROMPT: &str = "You extract contact and service details from local government web pages. \
Reply with a single JSON object and nothing else.";

/// Marker appended when page text is cut to the character budget.
const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";

/// Semantic tier: page text plus an instruction, returned as strict JSON.
#[derive(Clone)]
pub struct SemanticExtractor {
    chat: ChatClient,
    char_budget: usize,
    timeout: Duration,
}

impl SemanticExtractor {
    pub fn new(chat: ChatClient, char_budget: usize, timeout: Duration) -> Self {
        Self {
            chat,
            char_budget,
            timeout,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.chat.has_api_key()
    }

    /// Extract the request's fields from `html`. Any model failure is terminal.
    #[instrument(skip_all, fields(url = %request.target_url, model = %self.chat.model()))]
    pub async fn extract(
        &self,
        request: &ExtractionRequest,
        html: &str,
        source_url: Option<String>,
    ) -> Result<ExtractionResult, ExtractionError> {
        let text = truncate_chars(&page_text(html), self.char_budget);
        let prompt = build_prompt(request, &text);

        let completion = self
            .chat
            .complete(SYSTEM_PROMPT, &prompt, true, self.timeout)
            .await?;
        debug!(
            tokens_in = completion.tokens_in,
            tokens_out = completion.tokens_out,
            cost = completion.cost,
            "semantic extraction complete"
        );

        // The call is paid for from here on, so failures carry its cost.
        let (fields, confidence) = parse_model_fields(&completion.text, request)
            .map_err(|e| e.billed(completion.cost))?;
        let result = ExtractionResult {
            fields,
            tier_used: Tier::Semantic,
            confidence,
            cost: completion.cost,
            source_url,
        };

        if result.is_empty() {
            return Err(ExtractionError::NoFieldsFound {
                url: request.target_url.to_string(),
            }
            .billed(result.cost));
        }
        Ok(result)
    }
}

/// Page content as Markdown, or bare text if conversion fails.
fn page_text(html: &str) -> String {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg", "head"])
        .build();

    match converter.convert(html) {
        Ok(markdown) => markdown,
        Err(e) => {
            warn!(error = %e, "htmd conversion failed, using plain text");
            scraper::Html::parse_document(html)
                .root_element()
                .text()
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

/// Cut to at most `max_chars` characters on a char boundary.
fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &content[..byte_idx]),
    }
}

fn build_prompt(request: &ExtractionRequest, text: &str) -> String {
    let keys = request
        .required_fields
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Page URL: {url}\n\n\
         Extract these fields from the page content below: {keys}.\n\
         Respond with JSON of the form {{\"fields\": {{<field>: <string or null>}}, \
         \"confidence\": {{<field>: <number between 0 and 1>}}}}.\n\
         Use null for any field the page does not state. Do not guess or invent values. \
         Use exactly the listed keys.\n\n\
         ---\n{text}",
        url = request.target_url,
    )
}

type ParsedFields = (FieldMap, Option<BTreeMap<String, f64>>);

/// Accept either `{"fields": {...}, "confidence": {...}}` or a bare object
/// keyed by field name. Unknown keys are dropped; every required field is
/// present in the output.
fn parse_model_fields(
    raw: &str,
    request: &ExtractionRequest,
) -> Result<ParsedFields, ExtractionError> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| ExtractionError::ExtractionParse(format!("model output is not JSON: {e}")))?;

    let Value::Object(mut root) = value else {
        return Err(ExtractionError::ExtractionParse(
            "model output is not a JSON object".into(),
        ));
    };

    let (fields_obj, confidence_obj) = match root.remove("fields") {
        Some(Value::Object(fields)) => (fields, root.remove("confidence")),
        Some(_) => {
            return Err(ExtractionError::ExtractionParse(
                "\"fields\" must be an object".into(),
            ));
        }
        None => (root, None),
    };

    let mut fields = request.empty_fields();
    for (name, slot) in fields.iter_mut() {
        if let Some(v) = fields_obj.get(name) {
            *slot = field_value(name, v)?;
        }
    }

    let confidence = match confidence_obj {
        Some(Value::Object(map)) => Some(parse_confidence(&map, &fields)),
        _ => None,
    };

    Ok((fields, confidence))
}

fn field_value(name: &str, value: &Value) -> Result<Option<String>, ExtractionError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(_) | Value::Object(_) => Err(ExtractionError::ExtractionParse(format!(
            "field {name:?} must be a string or null"
        ))),
    }
}

fn parse_confidence(map: &Map<String, Value>, fields: &FieldMap) -> BTreeMap<String, f64> {
    fields
        .keys()
        .filter_map(|name| {
            map.get(name)
                .and_then(Value::as_f64)
                .map(|c| (name.clone(), c.clamp(0.0, 1.0)))
        })
        .collect()
}

/// Some models wrap JSON in a Markdown code fence despite JSON mode.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
