/// Local Ollama server via `/api/chat`.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{endpoint, send_json};
use super::prompt::{SYSTEM_PROMPT, parse_annotation};
use super::{Backend, EnrichmentRequest, PromptTemplate, flat_rate_cost};
use crate::config::OllamaConfig;
use crate::error::{BackendFailure, FailureKind};
use crate::models::EnrichmentRecord;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    format: &'static str,
    options: Options,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Message,
}

fn response_text(backend: &str, resp: ChatResponse) -> Result<String, BackendFailure> {
    if resp.message.content.trim().is_empty() {
        return Err(BackendFailure::new(
            backend,
            FailureKind::InvalidResponse,
            "empty message content",
        ));
    }
    Ok(resp.message.content)
}

pub struct OllamaBackend {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Backend for OllamaBackend {
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
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.render(request),
                },
            ],
            stream: false,
            format: "json",
            options: Options { temperature: 0.1 },
        };

        let url = endpoint(&self.config.base_url, "/api/chat");
        let resp: ChatResponse = send_json(self.id(), self.client.post(&url).json(&body)).await?;
        let content = response_text(self.id(), resp)?;

        parse_annotation(self.id(), self.model_id(), &request.span_hash, &content)
    }

    fn cost_estimate(&self, request: &EnrichmentRequest) -> f64 {
        flat_rate_cost(request, self.config.budget.usd_per_1k_tokens)
    }
}
