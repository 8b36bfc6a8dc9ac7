//! Client for OpenAI-compatible `/embeddings` endpoints.
//!
//! Works against api.openai.com as well as local servers (LM Studio, Ollama,
//! text-embeddings-inference) that expose the same route.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embeddings::Embedder;

/// Blocking embeddings client with retry on rate limits and server errors.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Builds a new embeddings client.
    ///
    /// `api_key` may be `None` for local servers that do not check it.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "embedding base URL must be an http(s) URL"
        );
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let auth = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid embedding API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimensions,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }

    /// Posts one sub-batch, retrying throttled and transient failures.
    fn post_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let mut tries = 1usize;
        loop {
            let retry = match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbedReply =
                        resp.json().context("failed to parse embedding response")?;
                    return self.vectors_in_order(parsed, inputs.len());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if !should_retry(status) || tries >= self.max_retries {
                        anyhow::bail!("embedding request failed ({status}): {body}");
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if !is_retryable_error(&err) || tries >= self.max_retries {
                        return Err(anyhow::Error::new(err).context("failed to call embedding endpoint"));
                    }
                    err.to_string()
                }
            };
            warn!(reason = %retry, attempt = tries, inputs = inputs.len(), "embedding request retried");
            thread::sleep(retry_backoff(tries));
            tries += 1;
        }
    }

    fn vectors_in_order(&self, mut parsed: EmbedReply, expected: usize) -> Result<Vec<Vec<f32>>> {
        anyhow::ensure!(
            parsed.data.len() == expected,
            "embedding service returned {} vectors for {} inputs",
            parsed.data.len(),
            expected
        );
        parsed.data.sort_by_key(|entry| entry.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|entry| entry.embedding).collect();
        if let Some(dims) = self.dimensions {
            if let Some(bad) = vectors.iter().find(|vector| vector.len() != dims) {
                anyhow::bail!("embedding has {} dimensions; expected {dims}", bad.len());
            }
        }
        Ok(vectors)
    }
}

impl Embedder for OpenAiEmbedder {
    /// Splits `inputs` into requests of at most `batch_size` texts.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(inputs.len());
        for slice in inputs.chunks(self.batch_size) {
            vectors.extend(self.post_batch(slice)?);
        }
        Ok(vectors)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// 500ms doubling per attempt, capped at 16s.
fn retry_backoff(attempt: usize) -> Duration {
    Duration::from_millis(500 << attempt.min(5))
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedReply {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
    index: usize,
}
