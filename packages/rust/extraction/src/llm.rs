//! Minimal OpenAI-compatible chat completions client (OpenRouter by default).

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use councilgen_shared::{CouncilgenError, ExtractionError, OpenRouterConfig, Result};

/// One completed model call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    /// Estimated USD cost from configured per-token pricing.
    pub cost: f64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat client bound to one provider, model and pricing table.
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    pricing: OpenRouterConfig,
}

impl ChatClient {
    /// `api_key` is resolved by the caller; `None` leaves the client unusable
    /// but constructible, so callers that never reach the model still work.
    pub fn new(config: &OpenRouterConfig, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| CouncilgenError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            pricing: config.clone(),
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.pricing.default_model
    }

    /// Send a system + user prompt. `json_mode` asks the provider for a JSON
    /// object response.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        json_mode: bool,
        timeout: Duration,
    ) -> std::result::Result<Completion, ExtractionError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ExtractionError::NoApiKeyConfigured {
                env_var: self.pricing.api_key_env.clone(),
            })?;

        let request = ChatRequest {
            model: &self.pricing.default_model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.pricing.temperature,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %request.model, prompt_chars = user.len(), "chat completion");

        let call = async {
            let response = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| ExtractionError::Provider(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                warn!(%status, "model provider returned an error");
                return Err(ExtractionError::Provider(format!(
                    "HTTP {status}: {}",
                    detail.chars().take(200).collect::<String>()
                )));
            }

            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| ExtractionError::Provider(format!("malformed response envelope: {e}")))
        };

        let body = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ExtractionError::SemanticTimeout { timeout })??;

        let tokens_in = body.usage.prompt_tokens;
        let tokens_out = body.usage.completion_tokens;
        let cost = self.pricing.price(tokens_in, tokens_out);

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::Provider("response had no content".into()).billed(cost))?;

        Ok(Completion {
            text,
            tokens_in,
            tokens_out,
            model: body
                .model
                .unwrap_or_else(|| self.pricing.default_model.clone()),
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OpenRouterConfig {
        OpenRouterConfig {
            base_url: base_url.to_string(),
            input_cost_per_mtok: 1.0,
            output_cost_per_mtok: 2.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sends_json_mode_and_prices_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "temperature": 0.0,
                "response_format": { "type": "json_object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "openai/gpt-4o-mini",
                "choices": [{ "message": { "role": "assistant", "content": "{\"a\":1}" } }],
                "usage": { "prompt_tokens": 1000, "completion_tokens": 500 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server.uri()), Some("sk-test".into())).unwrap();
        let done = client
            .complete("sys", "user", true, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.text, "{\"a\":1}");
        assert_eq!(done.tokens_in, 1000);
        assert!((done.cost - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let client = ChatClient::new(&config("http://127.0.0.1:9"), None).unwrap();
        assert!(!client.has_api_key());
        let err = client
            .complete("sys", "user", true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExtractionError::NoApiKeyConfigured {
                env_var: "OPENROUTER_API_KEY".into()
            }
        );
    }

    #[tokio::test]
    async fn provider_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server.uri()), Some("k".into())).unwrap();
        let err = client
            .complete("s", "u", false, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Provider(ref m) if m.contains("429")));
    }

    #[tokio::test]
    async fn slow_provider_is_semantic_timeout() {
        let server = MockServer::start().await;
        Mock::given(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "choices": [] }))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server.uri()), Some("k".into())).unwrap();
        let err = client
            .complete("s", "u", true, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::SemanticTimeout { .. }));
    }
}
