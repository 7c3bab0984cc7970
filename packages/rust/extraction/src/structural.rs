//! Structural parsing of fetched HTML into required fields.
//!
//! Two strategies, tried per field:
//! 1. The portal's [`ExtractionSchema`] rule (CSS selectors, optional
//!    attribute, optional regex), when one is configured.
//! 2. Labelled values: `<th>/<td>` rows, `<dt>/<dd>` pairs, `itemprop`
//!    microdata and `<meta>` tags whose normalised label equals the field name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use councilgen_shared::{ExtractionError, ExtractionSchema, FieldMap};

static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").unwrap());
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static DT_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("dt").unwrap());
static ITEMPROP_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemprop]").unwrap());
static META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[content]").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// A field rule with its selectors and regex compiled.
#[derive(Debug)]
pub struct CompiledRule {
    selectors: Vec<Selector>,
    attribute: Option<String>,
    pattern: Option<Regex>,
}

/// Compiled rules keyed by field name.
pub type CompiledSchema = BTreeMap<String, CompiledRule>;

/// Compile every rule up front so a bad schema fails before any network call.
pub fn compile_schema(schema: &ExtractionSchema) -> Result<CompiledSchema, ExtractionError> {
    let mut compiled = CompiledSchema::new();
    for (field, rule) in &schema.fields {
        let selectors = rule
            .selectors
            .iter()
            .map(|s| {
                Selector::parse(s).map_err(|e| {
                    ExtractionError::InvalidSchema(format!("{field}: selector {s:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pattern = rule
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ExtractionError::InvalidSchema(format!("{field}: pattern: {e}")))?;

        compiled.insert(
            field.clone(),
            CompiledRule {
                selectors,
                attribute: rule.attribute.clone(),
                pattern,
            },
        );
    }
    Ok(compiled)
}

/// Parse every required field out of `html`. Fields not found map to `None`.
pub fn parse_fields(
    html: &str,
    required: &BTreeSet<String>,
    schema: Option<&CompiledSchema>,
) -> FieldMap {
    let doc = Html::parse_document(html);
    let mut labelled: Option<HashMap<String, String>> = None;

    required
        .iter()
        .map(|field| {
            let from_rule = schema
                .and_then(|s| s.get(field))
                .and_then(|rule| apply_rule(&doc, rule));

            let value = from_rule.or_else(|| {
                labelled
                    .get_or_insert_with(|| labelled_values(&doc))
                    .get(field)
                    .cloned()
            });
            (field.clone(), value)
        })
        .collect()
}

fn apply_rule(doc: &Html, rule: &CompiledRule) -> Option<String> {
    if rule.selectors.is_empty() {
        let text = page_text(doc);
        return rule.pattern.as_ref().and_then(|re| capture(re, &text));
    }

    for selector in &rule.selectors {
        for el in doc.select(selector) {
            let raw = match &rule.attribute {
                Some(attr) => el.value().attr(attr).map(str::to_string),
                None => Some(element_text(&el)),
            };
            let Some(raw) = raw else { continue };

            let value = match &rule.pattern {
                Some(re) => capture(re, &raw),
                None => non_empty(collapse_ws(&raw)),
            };
            if value.is_some() {
                return value;
            }
        }
    }
    None
}

/// First capture group if the regex has one, the whole match otherwise.
fn capture(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    non_empty(collapse_ws(m.as_str()))
}

/// Collect `label -> value` pairs the generic strategy understands.
/// The first occurrence of a label wins.
fn labelled_values(doc: &Html) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut add = |label: &str, value: String| {
        let key = normalize_label(label);
        if key.is_empty() {
            return;
        }
        if let Some(value) = non_empty(collapse_ws(&value)) {
            values.entry(key).or_insert(value);
        }
    };

    for row in doc.select(&ROW_SEL) {
        if let (Some(th), Some(td)) = (row.select(&TH_SEL).next(), row.select(&TD_SEL).next()) {
            add(&element_text(&th), element_text(&td));
        }
    }

    for dt in doc.select(&DT_SEL) {
        let dd = dt
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|sib| sib.value().name() != "dt");
        if let Some(dd) = dd.filter(|d| d.value().name() == "dd") {
            add(&element_text(&dt), element_text(&dd));
        }
    }

    for el in doc.select(&ITEMPROP_SEL) {
        if let Some(prop) = el.value().attr("itemprop") {
            let value = el
                .value()
                .attr("content")
                .map(str::to_string)
                .unwrap_or_else(|| element_text(&el));
            add(prop, value);
        }
    }

    for el in doc.select(&META_SEL) {
        let label = el
            .value()
            .attr("name")
            .or_else(|| el.value().attr("property"));
        if let (Some(label), Some(content)) = (label, el.value().attr("content")) {
            add(label, content.to_string());
        }
    }

    values
}

/// `"Planning e-mail:"` → `"planning_e_mail"`.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

fn page_text(doc: &Html) -> String {
    doc.select(&BODY_SEL)
        .next()
        .map(|body| element_text(&body))
        .unwrap_or_else(|| doc.root_element().text().collect::<Vec<_>>().join(" "))
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
