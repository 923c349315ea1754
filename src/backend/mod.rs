/// Backend adapters: one uniform interface over the inference backends.
///
/// An adapter turns a span plus a prompt template into an
/// [`EnrichmentRecord`] or a classified [`BackendFailure`]. Retries, limits
/// and budgets are layered on top by `reliability`.
pub mod anthropic;
pub mod http;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod prompt;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::BackendSpec;
use crate::error::BackendFailure;
use crate::models::{EntityKind, EnrichmentRecord, SpanIdentity};

pub use prompt::PromptTemplate;

/// Rough characters-per-token ratio used for budget and rate estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Tokens reserved for the model's answer in estimates.
const RESPONSE_TOKEN_ALLOWANCE: u32 = 256;

/// One span to annotate.
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub span: SpanIdentity,
    pub span_hash: String,
    pub symbol_name: String,
    pub kind: EntityKind,
    /// Source text of the span, already verified against `span.content_hash`.
    pub code: String,
}

impl EnrichmentRequest {
    /// Prompt plus expected answer, in tokens.
    pub fn estimated_tokens(&self) -> u32 {
        let prompt = (self.code.len() + self.symbol_name.len()) / CHARS_PER_TOKEN;
        u32::try_from(prompt)
            .unwrap_or(u32::MAX)
            .saturating_add(RESPONSE_TOKEN_ALLOWANCE)
    }
}

/// Trait for inference backends.
///
/// Implementations must be `Send + Sync` so the cascade can share them
/// behind `Arc` across concurrent span tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifier from the configuration, used in logs and accounting.
    fn id(&self) -> &str;

    /// Model name recorded on produced records.
    fn model_id(&self) -> &str;

    /// Annotate one span. Must not retry internally.
    async fn enrich(
        &self,
        request: &EnrichmentRequest,
        prompt: &PromptTemplate,
    ) -> Result<EnrichmentRecord, BackendFailure>;

    /// Estimated dollar cost of `request`, checked against the budget
    /// before the call is made.
    fn cost_estimate(&self, request: &EnrichmentRequest) -> f64;
}

/// Price a request at a flat per-1k-token rate.
pub(crate) fn flat_rate_cost(request: &EnrichmentRequest, usd_per_1k_tokens: f64) -> f64 {
    f64::from(request.estimated_tokens()) / 1000.0 * usd_per_1k_tokens
}

/// Instantiate the adapter for a configured backend.
///
/// API keys are resolved here, once, so a missing key stops startup instead
/// of failing the first call.
pub fn build(spec: &BackendSpec) -> Result<Arc<dyn Backend>> {
    let client = http::client(spec.timeout())?;
    let backend: Arc<dyn Backend> = match spec {
        BackendSpec::Ollama(cfg) => Arc::new(ollama::OllamaBackend::new(cfg.clone(), client)),
        BackendSpec::OpenaiCompatible(cfg) => {
            let api_key = match &cfg.api_key_env {
                Some(var) => Some(read_key(&cfg.id, var)?),
                None => None,
            };
            Arc::new(openai::OpenAiBackend::new(cfg.clone(), api_key, client))
        }
        BackendSpec::Anthropic(cfg) => {
            let api_key = read_key(&cfg.id, &cfg.api_key_env)?;
            Arc::new(anthropic::AnthropicBackend::new(cfg.clone(), api_key, client))
        }
    };
    Ok(backend)
}

fn read_key(backend_id: &str, var: &str) -> Result<String> {
    let key = std::env::var(var)
        .with_context(|| format!("backend {backend_id}: environment variable {var} is not set"))?;
    anyhow::ensure!(
        !key.trim().is_empty(),
        "backend {backend_id}: environment variable {var} is empty"
    );
    Ok(key)
}
