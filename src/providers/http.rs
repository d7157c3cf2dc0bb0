//! HTTP provider speaking an OpenAI-style `/v1/completions` API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_http_response, Completion, ProviderError, TextGenerator};

/// Per-request HTTP timeout. The extractor applies its own tighter
/// deadline on top; this bounds the transport either way.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Completions API request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct CompletionsRequest {
    /// Model identifier.
    pub model: String,
    /// The prompt text.
    pub prompt: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// Completions API response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct CompletionsResponse {
    /// Generated choices; the first is used.
    pub choices: Vec<CompletionsChoice>,
    /// Token usage, when reported.
    #[serde(default)]
    pub usage: Option<CompletionsUsage>,
}

/// One generated choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct CompletionsChoice {
    /// The generated text.
    pub text: String,
}

/// Usage statistics.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct CompletionsUsage {
    /// Prompt plus completion tokens.
    pub total_tokens: u32,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Text generator backed by an OpenAI-compatible completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpTextGenerator {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTextGenerator {
    /// Create a provider for `endpoint` (full URL of the completions
    /// route) and `model`, optionally authenticating with a bearer key.
    pub fn new(endpoint: String, model: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            model,
            api_key,
            client,
        }
    }

    /// Parse a completions response body into a [`Completion`].
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Parse` when the body is not valid JSON or
    /// carries no choices.
    pub fn parse_response(body: &str) -> Result<Completion, ProviderError> {
        let parsed: CompletionsResponse =
            serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let text = parsed
            .choices
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| ProviderError::Parse("response carried no choices".to_owned()))?;
        Ok(Completion {
            text,
            tokens: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ProviderError> {
        let request = CompletionsRequest {
            model: self.model.clone(),
            prompt: prompt.to_owned(),
            max_tokens,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Request(e)
            }
        })?;

        let body = check_http_response(response).await?;
        Self::parse_response(&body)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
