/// OpenAI-compatible chat-completions adapter. Also covers local servers
/// (llama.cpp, vLLM, LM Studio) that speak the same API.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{endpoint, send_json};
use super::prompt::{SYSTEM_PROMPT, parse_annotation};
use super::{Backend, EnrichmentRequest, PromptTemplate, flat_rate_cost};
use crate::config::OpenAiConfig;
use crate::error::{BackendFailure, FailureKind};
use crate::models::EnrichmentRecord;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Text of the first choice.
fn response_text(backend: &str, resp: ChatResponse) -> Result<String, BackendFailure> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| BackendFailure::new(backend, FailureKind::InvalidResponse, "no choices returned"))
}

pub struct OpenAiBackend {
    config: OpenAiConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig, api_key: Option<String>, client: reqwest::Client) -> Self {
        Self {
            config,
            api_key,
            client,
        }
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
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
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.1,
        };

        let url = endpoint(&self.config.base_url, "/chat/completions");
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp: ChatResponse = send_json(self.id(), builder).await?;
        let content = response_text(self.id(), resp)?;

        parse_annotation(self.id(), self.model_id(), &request.span_hash, &content)
    }

    fn cost_estimate(&self, request: &EnrichmentRequest) -> f64 {
        flat_rate_cost(request, self.config.budget.usd_per_1k_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<String, BackendFailure> {
        response_text("oai", serde_json::from_str(body).unwrap())
    }

    #[test]
    fn test_first_choice_content() {
        let body = r#"{"id":"x","choices":[
            {"index":0,"message":{"role":"assistant","content":"{\"summary\":\"s\"}"}},
            {"index":1,"message":{"role":"assistant","content":"other"}}
        ]}"#;
        assert_eq!(parse(body).unwrap(), r#"{"summary":"s"}"#);
    }

    #[test]
    fn test_no_choices_is_invalid_response() {
        let err = parse(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
        assert!(err.to_string().contains("no choices returned"));
    }

    #[test]
    fn test_null_content_is_invalid_response() {
        let err = parse(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
    }
}
