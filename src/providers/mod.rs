//! Text-generation capability abstraction.
//!
//! Defines the [`TextGenerator`] trait the extractor calls, plus the
//! shared error taxonomy and HTTP helpers. One concrete provider is
//! implemented:
//! - [`http::HttpTextGenerator`] — OpenAI-style completions endpoint

use async_trait::async_trait;
use regex::Regex;

pub mod http;

/// The result of one completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Total tokens billed for the call, when the provider reports them.
    pub tokens: Option<u32>,
}

/// Errors returned by text-generation providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The call exceeded its deadline.
    #[error("provider call timed out")]
    Timeout,
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Upstream responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
}

/// Core text-generation interface.
///
/// Implementations must be `Send + Sync`; the pipeline calls them from
/// concurrently executing entry tasks.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Request a completion for `prompt`, bounded to `max_tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, transport, status, or parse
    /// failure.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ProviderError>;

    /// The model identifier this provider is instantiated for.
    fn model_id(&self) -> &str;
}

/// Check HTTP response status and return the body text or a structured
/// error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure,
/// `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"Bearer [A-Za-z0-9_\-\.]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_redacts_api_keys() {
        let body = "error: invalid key sk-abcdefghijklmnopqrstuvwxyz012345 for request";
        let out = sanitize_http_error_body(body);
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("sk-abcdef"));
    }

    #[test]
    fn sanitize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let out = sanitize_http_error_body(&body);
        assert!(out.ends_with("...[truncated]"));
        assert!(out.chars().count() < 300);
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        let out = sanitize_http_error_body("a\n\n  b\tc");
        assert_eq!(out, "a b c");
    }
}
