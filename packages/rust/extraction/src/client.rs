//! Tiered extraction: static fetch, then rendered fetch, then the model.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use councilgen_shared::{
    ExtractionError, ExtractionRequest, ExtractionResult, ExtractionSettings, FieldMap,
    OpenRouterConfig, Result, Tier,
};

use crate::fetch::{FetchedPage, StaticFetcher, validate_target};
use crate::llm::ChatClient;
use crate::render::PageRenderer;
use crate::semantic::SemanticExtractor;
use crate::structural::{CompiledSchema, compile_schema, parse_fields};

/// Returns the cheapest extraction result likely to succeed for a request.
#[derive(Clone)]
pub struct ExtractionClient {
    fetcher: StaticFetcher,
    renderer: Option<Arc<dyn PageRenderer>>,
    semantic: SemanticExtractor,
    render_timeout: Duration,
}

impl ExtractionClient {
    pub fn new(
        fetcher: StaticFetcher,
        renderer: Option<Arc<dyn PageRenderer>>,
        semantic: SemanticExtractor,
        render_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            renderer,
            semantic,
            render_timeout,
        }
    }

    /// Build from configuration. `api_key` is usually
    /// [`councilgen_shared::resolve_api_key`]; the renderer is chosen by the caller.
    pub fn from_settings(
        settings: &ExtractionSettings,
        openrouter: &OpenRouterConfig,
        api_key: Option<String>,
        renderer: Option<Arc<dyn PageRenderer>>,
    ) -> Result<Self> {
        let fetcher = StaticFetcher::new(&settings.user_agent, settings.static_timeout())?;
        let chat = ChatClient::new(openrouter, api_key)?;
        let semantic = SemanticExtractor::new(
            chat,
            settings.content_char_budget,
            settings.semantic_timeout(),
        );
        Ok(Self::new(fetcher, renderer, semantic, settings.render_timeout()))
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Allow localhost/private targets (for mock servers in tests).
    pub fn allow_private_hosts(mut self) -> Self {
        self.fetcher = self.fetcher.allow_private_hosts();
        self
    }

    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    pub fn has_api_key(&self) -> bool {
        self.semantic.has_api_key()
    }

    /// Run the escalation ladder.
    ///
    /// Fetch and render failures escalate to the next tier. Schema, target
    /// and model failures end the call.
    #[instrument(skip_all, fields(url = %request.target_url, fields = request.required_fields.len()))]
    pub async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> std::result::Result<ExtractionResult, ExtractionError> {
        let schema = request
            .extraction_schema
            .as_ref()
            .map(compile_schema)
            .transpose()?;
        validate_target(&request.target_url, self.fetcher.allows_private_hosts())?;

        let mut best_page: Option<FetchedPage> = None;
        let mut last_error: Option<ExtractionError> = None;

        let skip_static = request.requires_rendering && self.renderer.is_some();
        if request.requires_rendering && self.renderer.is_none() {
            debug!("target needs rendering but no renderer is configured; trying static fetch");
        }

        if !skip_static {
            match self.fetcher.fetch(&request.target_url).await {
                Ok(page) => {
                    let fields = parse_fields(&page.html, &request.required_fields, schema.as_ref());
                    if has_any(&fields) {
                        return Ok(structural_result(fields, Tier::Static, page));
                    }
                    debug!("static page parsed but no required field matched");
                    best_page = Some(page);
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    debug!(error = %e, "static fetch failed, escalating");
                    last_error = Some(e);
                }
            }
        }

        match &self.renderer {
            Some(renderer) => match self.rendered(renderer.as_ref(), request, schema.as_ref()).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(page)) => best_page = Some(page),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    debug!(error = %e, renderer = renderer.name(), "rendered fetch failed, escalating");
                    last_error = Some(e);
                }
            },
            None => debug!("no renderer configured, skipping rendered tier"),
        }

        let Some(page) = best_page else {
            return Err(last_error.unwrap_or_else(|| ExtractionError::NoFieldsFound {
                url: request.target_url.to_string(),
            }));
        };

        info!("structural parsing found nothing, escalating to semantic extraction");
        self.semantic
            .extract(request, &page.html, Some(page.url))
            .await
    }

    /// Render and parse. `Ok(Err(page))` means the page rendered but no
    /// field matched.
    async fn rendered(
        &self,
        renderer: &dyn PageRenderer,
        request: &ExtractionRequest,
        schema: Option<&CompiledSchema>,
    ) -> std::result::Result<std::result::Result<ExtractionResult, FetchedPage>, ExtractionError>
    {
        let page = renderer
            .render(
                &request.target_url,
                request.wait_for_selector.as_deref(),
                self.render_timeout,
            )
            .await?;

        let fields = parse_fields(&page.html, &request.required_fields, schema);
        if has_any(&fields) {
            Ok(Ok(structural_result(fields, Tier::Rendered, page)))
        } else {
            debug!("rendered page parsed but no required field matched");
            Ok(Err(page))
        }
    }
}

fn has_any(fields: &FieldMap) -> bool {
    fields.values().any(Option::is_some)
}

fn structural_result(fields: FieldMap, tier: Tier, page: FetchedPage) -> ExtractionResult {
    ExtractionResult {
        fields,
        tier_used: tier,
        confidence: None,
        cost: 0.0,
        source_url: Some(page.url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CONTACT_PAGE: &str = "<table><tr><th>Planning email</th><td>dc@adur.gov.uk</td></tr></table>";
    const SPA_SHELL: &str = "<html><body><div id=\"root\"></div></body></html>";

    /// Renderer returning canned HTML and counting calls.
    struct StubRenderer {
        html: String,
        calls: AtomicUsize,
    }

    impl StubRenderer {
        fn new(html: &str) -> Arc<Self> {
            Arc::new(Self {
                html: html.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PageRenderer for StubRenderer {
        async fn render(
            &self,
            url: &Url,
            _wait_for: Option<&str>,
            _timeout: Duration,
        ) -> std::result::Result<FetchedPage, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                html: self.html.clone(),
            })
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn client(server: &MockServer, api_key: Option<&str>) -> ExtractionClient {
        let settings = ExtractionSettings {
            static_timeout_secs: 5,
            semantic_timeout_secs: 5,
            ..Default::default()
        };
        let openrouter = OpenRouterConfig {
            base_url: format!("{}/llm", server.uri()),
            ..Default::default()
        };
        ExtractionClient::from_settings(&settings, &openrouter, api_key.map(String::from), None)
            .unwrap()
            .allow_private_hosts()
    }

    fn request(server: &MockServer) -> ExtractionRequest {
        ExtractionRequest::new(
            Url::parse(&format!("{}/planning", server.uri())).unwrap(),
            ["planning_email", "planning_phone"],
        )
    }

    async fn serve_page(server: &MockServer, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path("/planning"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;
    }

    async fn serve_model(server: &MockServer, content: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/llm/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": content } }],
                "usage": { "prompt_tokens": 1000, "completion_tokens": 50 }
            })))
            .expect(calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn static_hit_does_not_escalate() {
        let server = MockServer::start().await;
        serve_page(&server, 200, CONTACT_PAGE).await;
        serve_model(&server, "{}", 0).await;
        let renderer = StubRenderer::new(CONTACT_PAGE);

        let result = client(&server, Some("k"))
            .with_renderer(renderer.clone())
            .extract(&request(&server))
            .await
            .unwrap();

        assert_eq!(result.tier_used, Tier::Static);
        assert_eq!(result.cost, 0.0);
        // Partial results are kept; the missing field stays null.
        assert_eq!(result.fields["planning_email"].as_deref(), Some("dc@adur.gov.uk"));
        assert_eq!(result.fields["planning_phone"], None);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_static_fetch_escalates_to_renderer() {
        let server = MockServer::start().await;
        serve_page(&server, 500, "oops").await;
        let renderer = StubRenderer::new(CONTACT_PAGE);

        let result = client(&server, None)
            .with_renderer(renderer.clone())
            .extract(&request(&server))
            .await
            .unwrap();

        assert_eq!(result.tier_used, Tier::Rendered);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requires_rendering_skips_static_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CONTACT_PAGE))
            .expect(0)
            .mount(&server)
            .await;
        let renderer = StubRenderer::new(CONTACT_PAGE);

        let result = client(&server, None)
            .with_renderer(renderer)
            .extract(&request(&server).rendered(true))
            .await
            .unwrap();
        assert_eq!(result.tier_used, Tier::Rendered);
    }

    #[tokio::test]
    async fn unrecognised_layout_escalates_to_semantic() {
        let server = MockServer::start().await;
        serve_page(&server, 200, SPA_SHELL).await;
        serve_model(&server, r#"{"fields":{"planning_phone":"01903 221000"}}"#, 1).await;
        let renderer = StubRenderer::new(SPA_SHELL);

        let result = client(&server, Some("k"))
            .with_renderer(renderer.clone())
            .extract(&request(&server))
            .await
            .unwrap();

        assert_eq!(result.tier_used, Tier::Semantic);
        assert!(result.cost > 0.0);
        assert_eq!(result.fields["planning_phone"].as_deref(), Some("01903 221000"));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn semantic_without_api_key_is_terminal() {
        let server = MockServer::start().await;
        serve_page(&server, 200, SPA_SHELL).await;

        let err = client(&server, None)
            .extract(&request(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NoApiKeyConfigured { .. }));
    }

    #[tokio::test]
    async fn malformed_model_output_is_parse_error() {
        let server = MockServer::start().await;
        serve_page(&server, 200, SPA_SHELL).await;
        serve_model(&server, "I could not find anything, sorry.", 1).await;

        let err = client(&server, Some("k"))
            .extract(&request(&server))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ExtractionError::ExtractionParse(_)));
    }

    #[tokio::test]
    async fn no_page_at_any_tier_returns_last_fetch_error() {
        let server = MockServer::start().await;
        serve_page(&server, 404, "").await;
        serve_model(&server, "{}", 0).await;

        let err = client(&server, Some("k"))
            .extract(&request(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::FetchHttp { status: 404, .. }));
    }

    #[tokio::test]
    async fn invalid_schema_fails_before_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut schema = councilgen_shared::ExtractionSchema::default();
        schema.fields.insert(
            "planning_email".into(),
            councilgen_shared::FieldRule {
                selectors: vec!["td[".into()],
                ..Default::default()
            },
        );
        let err = client(&server, None)
            .extract(&request(&server).with_schema(schema))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidSchema(_)));
    }
}
