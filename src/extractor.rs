//! LLM-based extraction of structured facts from entry text.
//!
//! One bounded call per processing attempt. Parsing is lenient (the
//! model may wrap the JSON in prose) and failure is cheap: callers treat
//! any [`ExtractionError`] as "proceed with empty facts". A
//! deterministic regex fallback catches the obviously actionable fields
//! when the model returns nothing useful.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::executor::timeparse;
use crate::providers::{ProviderError, TextGenerator};
use crate::types::ExtractedFacts;

/// Default deadline for one extraction call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Token cap for extraction output; the facts object is small.
const EXTRACTION_MAX_TOKENS: u32 = 512;

/// System prompt for the extraction call.
const EXTRACTION_PROMPT: &str = "\
Extract structured facts from the note below. Output a single JSON object
with exactly these keys, using null for anything the note does not contain:
- \"phone\": a phone number, as written
- \"email\": an email address, as written
- \"person_name\": the name of a person the note refers to
- \"time_expression\": the words expressing when (e.g. \"tomorrow 3pm\")
- \"location\": the words expressing where
- \"action_intent\": a short phrase naming what the user wants to do

Output ONLY the JSON object, no other text.

Note:
";

/// Errors from one extraction attempt.
///
/// All variants are recovered locally by the pipeline: the entry
/// proceeds with empty facts.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The call exceeded the configured deadline.
    #[error("extraction timed out")]
    Timeout,
    /// The model's output carried no parseable facts object.
    #[error("extraction response was malformed: {0}")]
    MalformedResponse(String),
    /// The text-generation capability is unreachable or refusing.
    #[error("text-generation capability unavailable: {0}")]
    Unavailable(String),
}

/// Facts plus the token cost of producing them.
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    /// The extracted facts.
    pub facts: ExtractedFacts,
    /// Tokens billed for the call, when the provider reports them.
    pub tokens_used: Option<u32>,
}

/// Calls the text-generation capability to pull structured facts out of
/// raw entry text.
pub struct TextExtractor {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl TextExtractor {
    /// Create an extractor over `generator` with the given call deadline.
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Extract facts from `text`.
    ///
    /// No side effects beyond the outbound call; never writes state.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError`] on timeout, provider failure, or a
    /// response with no parseable facts object.
    pub async fn extract(&self, text: &str) -> Result<ExtractionOutput, ExtractionError> {
        let prompt = format!("{EXTRACTION_PROMPT}{text}");

        debug!(model = %self.generator.model_id(), "fact extraction starting");

        let completion = tokio::time::timeout(
            self.timeout,
            self.generator.complete(&prompt, EXTRACTION_MAX_TOKENS),
        )
        .await
        .map_err(|_| ExtractionError::Timeout)?
        .map_err(|e| match e {
            ProviderError::Timeout => ExtractionError::Timeout,
            ProviderError::Parse(msg) => ExtractionError::MalformedResponse(msg),
            other => ExtractionError::Unavailable(other.to_string()),
        })?;

        let facts = parse_facts(&completion.text)?;
        debug!(empty = facts.is_empty(), "fact extraction finished");
        Ok(ExtractionOutput {
            facts,
            tokens_used: completion.tokens,
        })
    }
}

/// Parse the model's facts JSON, scanning for the outermost object so
/// surrounding prose is tolerated.
///
/// # Errors
///
/// Returns `ExtractionError::MalformedResponse` when no JSON object can
/// be found or it does not deserialize.
pub fn parse_facts(text: &str) -> Result<ExtractedFacts, ExtractionError> {
    // Blank-string fields count as absent.
    #[derive(Deserialize)]
    #[serde(default)]
    struct WireFacts {
        phone: Option<String>,
        email: Option<String>,
        person_name: Option<String>,
        time_expression: Option<String>,
        location: Option<String>,
        action_intent: Option<String>,
    }

    impl Default for WireFacts {
        fn default() -> Self {
            Self {
                phone: None,
                email: None,
                person_name: None,
                time_expression: None,
                location: None,
                action_intent: None,
            }
        }
    }

    let trimmed = text.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    let window = match (start, end) {
        (Some(s), Some(e)) if s < e => trimmed.get(s..=e).unwrap_or(trimmed),
        _ => {
            warn!(
                text_preview = trimmed.get(..trimmed.len().min(120)).unwrap_or(trimmed),
                "extraction response carried no JSON object"
            );
            return Err(ExtractionError::MalformedResponse(
                "no JSON object in response".to_owned(),
            ));
        }
    };

    let wire: WireFacts = serde_json::from_str(window).map_err(|e| {
        warn!(error = %e, "failed to parse extraction JSON");
        ExtractionError::MalformedResponse(e.to_string())
    })?;

    let clean = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    Ok(ExtractedFacts {
        phone: clean(wire.phone),
        email: clean(wire.email),
        person_name: clean(wire.person_name),
        time_expression: clean(wire.time_expression),
        location: clean(wire.location),
        action_intent: clean(wire.action_intent),
    })
}

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().\-]{5,}\d").expect("static pattern"));

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("static pattern")
});

/// Deterministic extraction over raw text: phone, email, and time
/// expression via fixed patterns.
///
/// Used to fill fields the model left empty so obviously actionable
/// entries survive a dead or confused provider. Name and intent
/// detection stay with the model; this pass is pattern-only.
pub fn fallback_facts(text: &str) -> ExtractedFacts {
    let phone = PHONE_RE
        .find(text)
        .map(|m| m.as_str().trim().to_owned())
        .filter(|candidate| candidate.chars().filter(char::is_ascii_digit).count() >= 7);

    let email = EMAIL_RE.find(text).map(|m| m.as_str().to_owned());

    let time_expression = if timeparse::mentions_time(text) {
        Some(text.to_owned())
    } else {
        None
    };

    ExtractedFacts {
        phone,
        email,
        person_name: None,
        time_expression,
        location: None,
        action_intent: None,
    }
}
