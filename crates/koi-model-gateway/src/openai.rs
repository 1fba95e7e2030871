//! OpenAI-compatible provider, gated behind the `openai` feature so the
//! rest of the node builds without pulling in `reqwest` when no paid
//! model is configured.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use koi_identity::Cid;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    EmbeddingModel, EntityExtractionModel, EnrichmentModel, ExtractedEntity, ModelError, ModelOutput,
};

/// An OpenAI-compatible HTTP provider for embeddings and chat completions.
pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    embedding_dimension: usize,
    limiter: Arc<governor::DefaultDirectRateLimiter>,
}

impl OpenAiModel {
    /// Build a provider, rate-limited to `requests_per_sec`.
    pub fn new(
        api_key: Secret<String>,
        base_url: impl Into<String>,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
        embedding_dimension: usize,
        requests_per_sec: u32,
    ) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_sec.max(1)).unwrap());
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.into(),
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            embedding_dimension,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    async fn throttle(&self) {
        self.limiter.until_ready().await;
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Rough per-1K-token price used to attribute cost on receipts. Actual
/// billing is the provider's; this is an estimate for budget tracking.
const COST_PER_1K_TOKENS_USD: f64 = 0.0005;

fn estimate_cost(tokens: u32) -> f64 {
    (tokens as f64 / 1000.0) * COST_PER_1K_TOKENS_USD
}

#[async_trait]
impl EmbeddingModel for OpenAiModel {
    #[instrument(skip(self, text))]
    async fn embed(&self, text: &str) -> Result<ModelOutput<Vec<f32>>, ModelError> {
        self.throttle().await;
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&EmbeddingRequest {
                model: &self.embedding_model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| ModelError::ProviderUnavailable(e.to_string()))?
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedResponse("empty embedding response".into()))?
            .embedding;
        debug!(dimension = embedding.len(), "received embedding");

        let cost = estimate_cost(response.usage.map(|u| u.total_tokens).unwrap_or(0));
        Ok(ModelOutput {
            value: embedding,
            cost_usd: cost,
            model: self.embedding_model.clone(),
        })
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }
}

#[async_trait]
impl EnrichmentModel for OpenAiModel {
    #[instrument(skip(self, text))]
    async fn enrich(&self, text: &str) -> Result<ModelOutput<String>, ModelError> {
        self.throttle().await;
        let prompt = format!(
            "Clean up and lightly summarize the following document text, preserving its \
             meaning and factual content:\n\n{text}"
        );
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&ChatRequest {
                model: &self.chat_model,
                messages: [ChatMessage {
                    role: "user",
                    content: &prompt,
                }],
            })
            .send()
            .await
            .map_err(|e| ModelError::ProviderUnavailable(e.to_string()))?
            .json::<ChatResponse>()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedResponse("empty chat response".into()))?
            .message
            .content;
        let cost = estimate_cost(response.usage.map(|u| u.total_tokens).unwrap_or(0));

        Ok(ModelOutput {
            value: content,
            cost_usd: cost,
            model: self.chat_model.clone(),
        })
    }
}

#[async_trait]
impl EntityExtractionModel for OpenAiModel {
    #[instrument(skip(self, text))]
    async fn extract_entities(
        &self,
        text: &str,
        ontology_cid: &Cid,
    ) -> Result<ModelOutput<Vec<ExtractedEntity>>, ModelError> {
        self.throttle().await;
        let prompt = format!(
            "Extract named entities from the following text as a JSON array of objects \
             with fields surface_form, entity_kind, confidence (0-1). Use the entity kinds \
             defined by ontology {ontology_cid}. Respond with JSON only.\n\n{text}"
        );
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&ChatRequest {
                model: &self.chat_model,
                messages: [ChatMessage {
                    role: "user",
                    content: &prompt,
                }],
            })
            .send()
            .await
            .map_err(|e| ModelError::ProviderUnavailable(e.to_string()))?
            .json::<ChatResponse>()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedResponse("empty chat response".into()))?
            .message
            .content;
        let cost = estimate_cost(response.usage.map(|u| u.total_tokens).unwrap_or(0));

        #[derive(Deserialize)]
        struct RawEntity {
            surface_form: String,
            entity_kind: String,
            confidence: f32,
        }
        let parsed: Vec<RawEntity> = serde_json::from_str(&content)
            .map_err(|e| ModelError::MalformedResponse(format!("entity JSON: {e}")))?;

        Ok(ModelOutput {
            value: parsed
                .into_iter()
                .map(|e| ExtractedEntity {
                    surface_form: e.surface_form,
                    entity_kind: e.entity_kind,
                    span: None,
                    confidence: e.confidence,
                })
                .collect(),
            cost_usd: cost,
            model: self.chat_model.clone(),
        })
    }
}
