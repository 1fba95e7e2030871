//! Secure configuration loading for model provider credentials.

use std::env;

use secrecy::Secret;

/// Provider-specific configuration, holding credentials in a
/// [`Secret`] so they never print via `{:?}`.
#[derive(Clone)]
pub enum ProviderConfig {
    /// An OpenAI-compatible chat/embeddings endpoint.
    OpenAi {
        /// Bearer API key.
        api_key: Secret<String>,
        /// Model identifier for chat/enrichment calls.
        chat_model: String,
        /// Model identifier for embedding calls.
        embedding_model: String,
        /// API base URL, for self-hosted OpenAI-compatible servers.
        base_url: String,
    },
    /// No external provider configured; callers fall back to the
    /// deterministic, zero-cost reference models.
    Local,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderConfig::OpenAi { chat_model, embedding_model, base_url, .. } => f
                .debug_struct("OpenAi")
                .field("chat_model", chat_model)
                .field("embedding_model", embedding_model)
                .field("base_url", base_url)
                .field("api_key", &"<redacted>")
                .finish(),
            ProviderConfig::Local => f.write_str("Local"),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Which provider backs embedding/enrichment/extraction calls.
    pub provider: ProviderConfig,
    /// Requests per second this gateway is allowed to issue to the
    /// configured provider.
    pub rate_limit_per_sec: u32,
}

impl GatewayConfig {
    /// Load configuration from the environment. Falls back to
    /// [`ProviderConfig::Local`] when no API key is present, so the node
    /// always starts even without paid-model credentials configured.
    pub fn from_env() -> Self {
        let rate_limit_per_sec = env::var("KOI_MODEL_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let provider = match env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => ProviderConfig::OpenAi {
                api_key: Secret::new(key),
                chat_model: env::var("KOI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                embedding_model: env::var("KOI_EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            },
            _ => ProviderConfig::Local,
        };

        Self {
            provider,
            rate_limit_per_sec,
        }
    }
}
