//! LLM completion clients and the soft-failure wrapper the summarizer uses.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

mod anthropic;
mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// Blocking text completion service.
pub trait LlmClient: Send + Sync {
    /// Sends one prompt and returns the generated text.
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Settings shared by every provider.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// API key; optional for local OpenAI-compatible servers.
    pub api_key: Option<String>,
    /// Chat model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum completion tokens requested.
    pub max_tokens: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// System instruction sent with every prompt.
    pub system_prompt: String,
}

/// Outcome of one LLM attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Non-empty generated text.
    Content(String),
    /// The call failed or produced nothing; carries the reason.
    Failed(String),
}

impl Completion {
    /// Generated text, or `placeholder` when the call failed.
    pub fn or_placeholder(self, placeholder: impl Into<String>) -> String {
        match self {
            Self::Content(text) => text,
            Self::Failed(_) => placeholder.into(),
        }
    }

    /// True for [`Completion::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Makes exactly one call and folds any error or empty reply into
/// [`Completion::Failed`]. `unit` labels the call in logs.
pub fn attempt(llm: &dyn LlmClient, unit: &str, prompt: &str) -> Completion {
    match llm.complete(prompt) {
        Ok(text) if !text.trim().is_empty() => {
            debug!(unit, chars = text.len(), "completion received");
            Completion::Content(text.trim().to_string())
        }
        Ok(_) => {
            warn!(unit, "completion was empty");
            Completion::Failed("empty completion".to_string())
        }
        Err(err) => {
            warn!(unit, error = %format!("{err:#}"), "completion failed");
            Completion::Failed(format!("{err:#}"))
        }
    }
}

/// POSTs `body` as JSON and decodes the reply. A non-2xx status becomes an
/// error carrying the response body.
fn post_json<B, R>(client: &Client, url: &str, service: &str, body: &B) -> Result<R>
where
    B: Serialize,
    R: DeserializeOwned,
{
    let resp = client
        .post(url)
        .json(body)
        .send()
        .with_context(|| format!("failed to call {service}"))?;
    let status = resp.status();
    if !status.is_success() {
        let detail = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        bail!("{service} returned {status}: {detail}");
    }
    resp.json()
        .with_context(|| format!("failed to parse {service} response"))
}
