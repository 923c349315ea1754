/// Anthropic messages API.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{endpoint, send_json};
use super::prompt::{SYSTEM_PROMPT, parse_annotation};
use super::{Backend, EnrichmentRequest, PromptTemplate, flat_rate_cost};
use crate::config::AnthropicConfig;
use crate::error::{BackendFailure, FailureKind};
use crate::models::EnrichmentRecord;

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'static str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Concatenated `text` blocks; other block types are ignored.
fn response_text(backend: &str, resp: MessagesResponse) -> Result<String, BackendFailure> {
    let text: String = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text)
        .collect();
    if text.trim().is_empty() {
        return Err(BackendFailure::new(
            backend,
            FailureKind::InvalidResponse,
            "no text content returned",
        ));
    }
    Ok(text)
}

pub struct AnthropicBackend {
    config: AnthropicConfig,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig, api_key: String, client: reqwest::Client) -> Self {
        Self {
            config,
            api_key,
            client,
        }
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn enrich(
        &self,
        request: &EnrichmentRequest,
        prompt: &PromptTemplate,
    ) -> Result<EnrichmentRecord, BackendFailure> {
        let user = prompt.render(request);
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: &user,
            }],
        };

        let url = endpoint(&self.config.base_url, "/v1/messages");
        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);

        let resp: MessagesResponse = send_json(self.id(), builder).await?;
        let text = response_text(self.id(), resp)?;

        parse_annotation(self.id(), self.model_id(), &request.span_hash, &text)
    }

    fn cost_estimate(&self, request: &EnrichmentRequest) -> f64 {
        flat_rate_cost(request, self.config.budget.usd_per_1k_tokens)
    }
}
